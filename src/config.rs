use chrono::Duration;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub detection: DetectionConfig,
    pub rewards: RewardConfig,
    pub referral: ReferralConfig,
    pub jobs: JobConfig,
    pub alerts: AlertConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    /// Optional CSV of blacklist entries loaded at startup.
    pub blacklist_csv: Option<String>,
    pub busy_timeout_ms: u64,
}

/// Thresholds and windows for the batch detectors.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DetectionConfig {
    pub lookback_hours: i64,
    /// Flag referrers with strictly more invites than this in the lookback.
    pub invite_speed_threshold: i64,
    /// Flag devices with at least this many distinct accounts.
    pub device_account_threshold: i64,
    /// Block IPs with strictly more registrations than this in the lookback.
    pub ip_registration_threshold: i64,
    pub ip_block_hours: i64,
    /// Relative amount difference (to the larger amount) still considered similar.
    pub wash_amount_tolerance: f64,
    pub wash_time_window_secs: i64,
    pub zombie_trust_threshold: i64,
    pub zombie_inactive_days: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RewardConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    /// Inline attempts when the balance version moved underneath us.
    pub credit_attempts: u32,
    pub retry_backoff_secs: i64,
    pub first_purchase_delay_hours: i64,
    pub cleanup_after_days: i64,
    pub stale_processing_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ReferralConfig {
    pub max_depth: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct JobConfig {
    pub detection_interval_secs: u64,
    pub reward_interval_secs: u64,
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    pub min_risk_score: u8,
    pub cooldown_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "data/luckymart_guard.db".into(),
            blacklist_csv: None,
            busy_timeout_ms: 5_000,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            lookback_hours: 24,
            invite_speed_threshold: 20,
            device_account_threshold: 4,
            ip_registration_threshold: 10,
            ip_block_hours: 24 * 7,
            wash_amount_tolerance: 0.05,
            wash_time_window_secs: 10,
            zombie_trust_threshold: 20,
            zombie_inactive_days: 30,
        }
    }
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 3,
            credit_attempts: 3,
            retry_backoff_secs: 60,
            first_purchase_delay_hours: 24,
            cleanup_after_days: 30,
            stale_processing_secs: 600,
        }
    }
}

impl Default for ReferralConfig {
    fn default() -> Self {
        Self { max_depth: 15 }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            detection_interval_secs: 15 * 60,
            reward_interval_secs: 60,
            cleanup_interval_secs: 6 * 60 * 60,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_risk_score: 85,
            cooldown_seconds: 60,
        }
    }
}

impl Config {
    /// Load config from a TOML file. Falls back to defaults if file doesn't exist.
    pub fn load(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => {
                    tracing::info!("Config loaded from {}", path.display());
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse {}: {e}, using defaults", path.display());
                    Self::default()
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}, using defaults", path.display());
                Self::default()
            }
        }
    }
}

/// Longest window, delay or backoff any setting can express: ten years.
pub const MAX_SPAN_SECS: i64 = 10 * 365 * 24 * 60 * 60;

/// A configured count of seconds as a duration, clamped to
/// `0..=MAX_SPAN_SECS` so date arithmetic on it cannot overflow.
pub fn span_secs(secs: i64) -> Duration {
    Duration::seconds(secs.clamp(0, MAX_SPAN_SECS))
}

pub fn span_hours(hours: i64) -> Duration {
    span_secs(hours.saturating_mul(60 * 60))
}

pub fn span_days(days: i64) -> Duration {
    span_secs(days.saturating_mul(24 * 60 * 60))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_detector_thresholds() {
        let config = Config::default();
        assert_eq!(config.detection.invite_speed_threshold, 20);
        assert_eq!(config.detection.device_account_threshold, 4);
        assert_eq!(config.detection.ip_registration_threshold, 10);
        assert_eq!(config.detection.zombie_trust_threshold, 20);
        assert_eq!(config.rewards.max_retries, 3);
        assert_eq!(config.rewards.first_purchase_delay_hours, 24);
        assert_eq!(config.referral.max_depth, 15);
    }

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: Config = toml::from_str(
            r#"
            [detection]
            invite_speed_threshold = 50

            [rewards]
            max_retries = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.detection.invite_speed_threshold, 50);
        assert_eq!(config.detection.lookback_hours, 24);
        assert_eq!(config.rewards.max_retries, 5);
        assert_eq!(config.rewards.batch_size, 100);
        assert!(config.alerts.enabled);
    }

    #[test]
    fn missing_file_uses_defaults() {
        let config = Config::load("/nonexistent/luckymart-guard.toml");
        assert_eq!(config.database.path, "data/luckymart_guard.db");
    }

    #[test]
    fn spans_clamp_absurd_values() {
        assert_eq!(span_hours(24), Duration::hours(24));
        assert_eq!(span_days(-3), Duration::zero());
        assert_eq!(span_secs(i64::MAX), Duration::seconds(MAX_SPAN_SECS));
        assert_eq!(span_hours(i64::MAX), Duration::seconds(MAX_SPAN_SECS));
        assert_eq!(span_days(i64::MIN), Duration::zero());
    }
}
