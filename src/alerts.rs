use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::warn;

use crate::config::AlertConfig;
use crate::core::{DetectionResult, DetectionType};

/// Raises operator alerts for high-risk detections, with a cooldown per
/// detection type to prevent spam.
pub struct AlertNotifier {
    enabled: bool,
    min_risk_score: u8,
    cooldown: Duration,
    last_sent: Mutex<HashMap<DetectionType, Instant>>,
}

impl AlertNotifier {
    pub fn new(config: &AlertConfig) -> Self {
        Self {
            enabled: config.enabled,
            min_risk_score: config.min_risk_score,
            cooldown: Duration::from_secs(config.cooldown_seconds),
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns true if an alert was raised, false if skipped.
    pub fn notify(&self, result: &DetectionResult) -> bool {
        if !self.enabled {
            return false;
        }
        if result.risk_score < self.min_risk_score {
            return false;
        }
        if !self.check_cooldown(result.detection_type) {
            return false;
        }

        warn!(
            target: "luckymart_guard::alert",
            detection = %result.detection_type,
            risk_score = result.risk_score,
            level = ?result.risk_level(),
            action = %result.action.as_str(),
            entity = %result.entity_key,
            users = result.affected_user_ids.len(),
            "Fraud alert"
        );
        true
    }

    /// Alert on each result in turn. Returns how many alerts were raised.
    pub fn notify_all<'a>(&self, results: impl IntoIterator<Item = &'a DetectionResult>) -> usize {
        results.into_iter().filter(|r| self.notify(r)).count()
    }

    /// Check and update the cooldown for `kind`. Returns true if enough time has passed.
    fn check_cooldown(&self, kind: DetectionType) -> bool {
        let mut last = self.last_sent.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(prev) = last.get(&kind) {
            if now.duration_since(*prev) < self.cooldown {
                return false;
            }
        }
        last.insert(kind, now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RiskAction;
    use chrono::Utc;
    use std::collections::BTreeSet;

    fn make_result(kind: DetectionType, score: u8) -> DetectionResult {
        DetectionResult {
            detection_type: kind,
            risk_score: score,
            action: RiskAction::Block,
            details: serde_json::Map::new(),
            affected_user_ids: BTreeSet::from(["u1".to_string()]),
            entity_key: "10.0.0.1".to_string(),
            detected_at: Utc::now(),
        }
    }

    fn config(enabled: bool, cooldown_seconds: u64) -> AlertConfig {
        AlertConfig {
            enabled,
            min_risk_score: 85,
            cooldown_seconds,
        }
    }

    #[test]
    fn cooldown_blocks_rapid_alerts_per_type() {
        let notifier = AlertNotifier::new(&config(true, 30));
        assert!(notifier.check_cooldown(DetectionType::BatchRegistration));
        assert!(!notifier.check_cooldown(DetectionType::BatchRegistration));
        // Other types have their own clock
        assert!(notifier.check_cooldown(DetectionType::MutualReferralWashTrading));
    }

    #[test]
    fn cooldown_zero_allows_all() {
        let notifier = AlertNotifier::new(&config(true, 0));
        assert!(notifier.check_cooldown(DetectionType::BatchRegistration));
        assert!(notifier.check_cooldown(DetectionType::BatchRegistration));
    }

    #[test]
    fn disabled_notifier_skips() {
        let notifier = AlertNotifier::new(&config(false, 0));
        assert!(!notifier.notify(&make_result(DetectionType::BatchRegistration, 90)));
    }

    #[test]
    fn below_min_score_skips() {
        let notifier = AlertNotifier::new(&config(true, 0));
        assert!(!notifier.notify(&make_result(DetectionType::ZombieAccount, 70)));
        assert!(notifier.notify(&make_result(DetectionType::AbnormalInviteSpeed, 85)));
    }

    #[test]
    fn notify_all_counts_raised_alerts() {
        let notifier = AlertNotifier::new(&config(true, 60));
        let results = vec![
            make_result(DetectionType::BatchRegistration, 90),
            make_result(DetectionType::BatchRegistration, 90),
            make_result(DetectionType::MutualReferralWashTrading, 95),
            make_result(DetectionType::SuspiciousDevice, 75),
        ];
        assert_eq!(notifier.notify_all(&results), 2);
    }
}
