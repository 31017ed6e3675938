use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde_json::{Map, Value, json};
use tracing::debug;

use super::DetectError;
use crate::config::{DetectionConfig, span_days, span_hours, span_secs};
use crate::core::{BlacklistEntry, BlacklistKind, DetectionResult, DetectionType, Recharge, RiskAction};
use crate::db::{SharedDatabase, SideEffect};

/// A batch detector: one aggregation pass over the store, thresholded.
///
/// Implementations keep no state between runs beyond their thresholds, so
/// each can be invoked on its own or replaced in the monitor.
pub trait Detector {
    /// Key of this detector in the monitor report.
    fn name(&self) -> &'static str;
    fn detection_type(&self) -> DetectionType;
    fn detect(&self, db: &SharedDatabase, now: DateTime<Utc>) -> Result<Vec<DetectionResult>, DetectError>;
}

/// All production detectors, configured from `config`.
pub fn default_detectors(config: &DetectionConfig) -> Vec<Box<dyn Detector + Send + Sync>> {
    let window = span_hours(config.lookback_hours);
    vec![
        Box::new(AbnormalInviteSpeed {
            threshold: config.invite_speed_threshold,
            window,
        }),
        Box::new(SuspiciousDevice {
            min_accounts: config.device_account_threshold,
            window,
        }),
        Box::new(BatchRegistration {
            threshold: config.ip_registration_threshold,
            window,
            block_for: span_hours(config.ip_block_hours),
        }),
        Box::new(MutualReferralWashTrading {
            window,
            amount_tolerance: config.wash_amount_tolerance,
            time_window: span_secs(config.wash_time_window_secs),
        }),
        Box::new(ZombieAccount {
            trust_threshold: config.zombie_trust_threshold,
            inactive_for: span_days(config.zombie_inactive_days),
        }),
    ]
}

fn finding(
    detection_type: DetectionType,
    risk_score: u8,
    action: RiskAction,
    entity_key: &str,
    affected: impl IntoIterator<Item = String>,
    details: Map<String, Value>,
    now: DateTime<Utc>,
) -> DetectionResult {
    DetectionResult {
        detection_type,
        risk_score,
        action,
        details,
        affected_user_ids: affected.into_iter().collect::<BTreeSet<_>>(),
        entity_key: entity_key.to_string(),
        detected_at: now,
    }
}

// --- Individual detectors ---

/// Referrers inviting more than `threshold` users inside `window`.
pub struct AbnormalInviteSpeed {
    pub threshold: i64,
    pub window: Duration,
}

impl Detector for AbnormalInviteSpeed {
    fn name(&self) -> &'static str { "abnormalInviteSpeed" }
    fn detection_type(&self) -> DetectionType { DetectionType::AbnormalInviteSpeed }

    fn detect(&self, db: &SharedDatabase, now: DateTime<Utc>) -> Result<Vec<DetectionResult>, DetectError> {
        let since = now - self.window;
        let mut results = Vec::new();
        for (referrer, invite_count) in db.invite_counts_since(since, self.threshold)? {
            if db.has_recent_detection(self.detection_type(), &referrer, since)? {
                debug!(%referrer, "Referrer already under review, skipping");
                continue;
            }
            let mut details = Map::new();
            details.insert("inviteCount".into(), json!(invite_count));
            details.insert("windowHours".into(), json!(self.window.num_hours()));
            let result = finding(
                self.detection_type(),
                85,
                RiskAction::ManualReview,
                &referrer,
                [referrer.clone()],
                details,
                now,
            );
            db.record_detection(&result, &SideEffect::FlagSuspicious(vec![referrer]))?;
            results.push(result);
        }
        Ok(results)
    }
}

/// Device fingerprints shared by `min_accounts` or more accounts.
pub struct SuspiciousDevice {
    pub min_accounts: i64,
    /// Period in which a device is reported at most once.
    pub window: Duration,
}

impl Detector for SuspiciousDevice {
    fn name(&self) -> &'static str { "suspiciousDevices" }
    fn detection_type(&self) -> DetectionType { DetectionType::SuspiciousDevice }

    fn detect(&self, db: &SharedDatabase, now: DateTime<Utc>) -> Result<Vec<DetectionResult>, DetectError> {
        let mut results = Vec::new();
        for (device_id, account_count) in db.device_account_counts(self.min_accounts)? {
            if db.is_blacklisted(BlacklistKind::Device, &device_id, now)? {
                debug!(%device_id, "Device already blacklisted, skipping");
                continue;
            }
            if db.has_recent_detection(self.detection_type(), &device_id, now - self.window)? {
                continue;
            }
            let users = db.device_users(&device_id)?;
            let mut details = Map::new();
            details.insert("deviceId".into(), json!(device_id));
            details.insert("accountCount".into(), json!(account_count));
            details.insert("users".into(), json!(users));
            let result = finding(
                self.detection_type(),
                75,
                RiskAction::RequireVerification,
                &device_id,
                users.iter().cloned(),
                details,
                now,
            );
            db.record_detection(&result, &SideEffect::RequireVerification(users))?;
            results.push(result);
        }
        Ok(results)
    }
}

/// IPs registering more than `threshold` accounts inside `window`.
pub struct BatchRegistration {
    pub threshold: i64,
    pub window: Duration,
    pub block_for: Duration,
}

impl Detector for BatchRegistration {
    fn name(&self) -> &'static str { "batchRegistration" }
    fn detection_type(&self) -> DetectionType { DetectionType::BatchRegistration }

    fn detect(&self, db: &SharedDatabase, now: DateTime<Utc>) -> Result<Vec<DetectionResult>, DetectError> {
        let since = now - self.window;
        let mut results = Vec::new();
        for (ip, registration_count) in db.ip_registration_counts_since(since, self.threshold)? {
            if db.is_blacklisted(BlacklistKind::Ip, &ip, now)?
                || db.has_recent_detection(self.detection_type(), &ip, since)?
            {
                debug!(%ip, "IP already blocked, skipping");
                continue;
            }
            let users = db.users_registered_from_ip_since(&ip, since)?;
            let mut details = Map::new();
            details.insert("ipAddress".into(), json!(ip));
            details.insert("registrationCount".into(), json!(registration_count));
            details.insert("windowHours".into(), json!(self.window.num_hours()));
            let result = finding(
                self.detection_type(),
                90,
                RiskAction::Block,
                &ip,
                users,
                details,
                now,
            );
            let entry = BlacklistEntry {
                kind: BlacklistKind::Ip,
                key: ip.clone(),
                reason: format!(
                    "{registration_count} registrations in {}h",
                    self.window.num_hours()
                ),
                expires_at: Some(now + self.block_for),
            };
            db.record_detection(&result, &SideEffect::Blacklist(entry))?;
            results.push(result);
        }
        Ok(results)
    }
}

/// Mutually-referring pairs that recharge near-identical amounts at nearly
/// the same moment.
pub struct MutualReferralWashTrading {
    pub window: Duration,
    /// Relative difference to the larger amount.
    pub amount_tolerance: f64,
    pub time_window: Duration,
}

impl Detector for MutualReferralWashTrading {
    fn name(&self) -> &'static str { "mutualReferralWashTrading" }
    fn detection_type(&self) -> DetectionType { DetectionType::MutualReferralWashTrading }

    fn detect(&self, db: &SharedDatabase, now: DateTime<Utc>) -> Result<Vec<DetectionResult>, DetectError> {
        let since = now - self.window;
        let mut results = Vec::new();
        for (user_a, user_b) in db.mutual_referral_pairs()? {
            let pair_key = format!("{user_a}|{user_b}");
            if db.has_recent_detection(self.detection_type(), &pair_key, since)? {
                continue;
            }
            let recharges_a = db.recharges_since(&user_a, since)?;
            let recharges_b = db.recharges_since(&user_b, since)?;
            let matches =
                find_similar_recharges(&recharges_a, &recharges_b, self.amount_tolerance, self.time_window);
            if matches.is_empty() {
                continue;
            }

            let amounts: Vec<[i64; 2]> = matches.iter().map(|(a, b)| [a.amount, b.amount]).collect();
            let mut details = Map::new();
            details.insert("userA".into(), json!(user_a));
            details.insert("userB".into(), json!(user_b));
            details.insert("matchedPairs".into(), json!(matches.len()));
            details.insert("amounts".into(), json!(amounts));
            let result = finding(
                self.detection_type(),
                95,
                RiskAction::ManualReview,
                &pair_key,
                [user_a.clone(), user_b.clone()],
                details,
                now,
            );
            db.record_detection(&result, &SideEffect::FlagSuspicious(vec![user_a, user_b]))?;
            results.push(result);
        }
        Ok(results)
    }
}

/// True if the two amounts differ by at most `tolerance` of the larger one.
pub fn amounts_similar(a: i64, b: i64, tolerance: f64) -> bool {
    let larger = a.abs().max(b.abs());
    if larger == 0 {
        return true;
    }
    (a - b).abs() as f64 / larger as f64 <= tolerance
}

/// Pair each recharge of A with at most one recharge of B that is similar in
/// amount and close in time. Greedy in time order.
pub fn find_similar_recharges<'a>(
    a: &'a [Recharge],
    b: &'a [Recharge],
    tolerance: f64,
    time_window: Duration,
) -> Vec<(&'a Recharge, &'a Recharge)> {
    let mut used = vec![false; b.len()];
    let mut matches = Vec::new();
    for ra in a {
        let hit = b.iter().enumerate().find(|(i, rb)| {
            !used[*i]
                && (ra.created_at - rb.created_at).abs() <= time_window
                && amounts_similar(ra.amount, rb.amount, tolerance)
        });
        if let Some((i, rb)) = hit {
            used[i] = true;
            matches.push((ra, rb));
        }
    }
    matches
}

/// Low-trust accounts with no transactions and no recent login.
pub struct ZombieAccount {
    pub trust_threshold: i64,
    pub inactive_for: Duration,
}

impl Detector for ZombieAccount {
    fn name(&self) -> &'static str { "zombieAccounts" }
    fn detection_type(&self) -> DetectionType { DetectionType::ZombieAccount }

    fn detect(&self, db: &SharedDatabase, now: DateTime<Utc>) -> Result<Vec<DetectionResult>, DetectError> {
        let cutoff = now - self.inactive_for;
        let mut results = Vec::new();
        for candidate in db.zombie_candidates(self.trust_threshold, cutoff)? {
            if db.has_recent_detection(self.detection_type(), &candidate.user_id, cutoff)? {
                continue;
            }
            let mut details = Map::new();
            details.insert("trustScore".into(), json!(candidate.trust_score));
            details.insert(
                "lastLoginAt".into(),
                json!(candidate.last_login_at.map(|t| t.to_rfc3339())),
            );
            details.insert("transactionCount".into(), json!(0));
            let result = finding(
                self.detection_type(),
                70,
                RiskAction::Flag,
                &candidate.user_id,
                [candidate.user_id.clone()],
                details,
                now,
            );
            db.record_detection(&result, &SideEffect::FlagSuspicious(vec![candidate.user_id]))?;
            results.push(result);
        }
        Ok(results)
    }
}
