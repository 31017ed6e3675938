use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Which abuse pattern a detection pass found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionType {
    AbnormalInviteSpeed,
    SuspiciousDevice,
    BatchRegistration,
    MutualReferralWashTrading,
    ZombieAccount,
}

impl DetectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectionType::AbnormalInviteSpeed => "abnormal_invite_speed",
            DetectionType::SuspiciousDevice => "suspicious_device",
            DetectionType::BatchRegistration => "batch_registration",
            DetectionType::MutualReferralWashTrading => "mutual_referral_wash_trading",
            DetectionType::ZombieAccount => "zombie_account",
        }
    }
}

impl fmt::Display for DetectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the review tooling is asked to do with a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskAction {
    ManualReview,
    RequireVerification,
    Block,
    Flag,
}

impl RiskAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskAction::ManualReview => "manual_review",
            RiskAction::RequireVerification => "require_verification",
            RiskAction::Block => "block",
            RiskAction::Flag => "flag",
        }
    }
}

/// One finding from a detector. Immutable once persisted to the fraud log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    #[serde(rename = "type")]
    pub detection_type: DetectionType,
    pub risk_score: u8, // 0-100
    pub action: RiskAction,
    pub details: Map<String, Value>,
    pub affected_user_ids: BTreeSet<String>,
    /// The grouped entity: referrer id, device id, IP, user pair or user id.
    pub entity_key: String,
    pub detected_at: DateTime<Utc>,
}

impl DetectionResult {
    pub fn risk_level(&self) -> RiskLevel {
        RiskLevel::from_score(self.risk_score)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RiskLevel {
    Critical, // ≥90
    High,     // ≥75
    Medium,   // ≥50
    Low,      // <50
}

impl RiskLevel {
    pub fn from_score(score: u8) -> Self {
        if score >= 90 {
            RiskLevel::Critical
        } else if score >= 75 {
            RiskLevel::High
        } else if score >= 50 {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }
}

/// Blacklists are keyed per kind, so an IP and a device id never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlacklistKind {
    Device,
    Ip,
}

impl BlacklistKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlacklistKind::Device => "device",
            BlacklistKind::Ip => "ip",
        }
    }
}

impl FromStr for BlacklistKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "device" => Ok(BlacklistKind::Device),
            "ip" => Ok(BlacklistKind::Ip),
            other => Err(format!("unknown blacklist kind: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlacklistEntry {
    pub kind: BlacklistKind,
    pub key: String,
    pub reason: String,
    /// `None` means the entry never expires.
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardType {
    ReferralRegister,
    ReferralFirstPlay,
    ReferralFirstPurchase,
}

impl RewardType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardType::ReferralRegister => "referral_register",
            RewardType::ReferralFirstPlay => "referral_first_play",
            RewardType::ReferralFirstPurchase => "referral_first_purchase",
        }
    }
}

impl FromStr for RewardType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "referral_register" => Ok(RewardType::ReferralRegister),
            "referral_first_play" => Ok(RewardType::ReferralFirstPlay),
            "referral_first_purchase" => Ok(RewardType::ReferralFirstPurchase),
            other => Err(format!("unknown reward type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RewardStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RewardStatus::Pending => "pending",
            RewardStatus::Processing => "processing",
            RewardStatus::Completed => "completed",
            RewardStatus::Failed => "failed",
        }
    }
}

impl FromStr for RewardStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RewardStatus::Pending),
            "processing" => Ok(RewardStatus::Processing),
            "completed" => Ok(RewardStatus::Completed),
            "failed" => Ok(RewardStatus::Failed),
            other => Err(format!("unknown reward status: {other}")),
        }
    }
}

/// A reward that is earned now and credited later.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedReward {
    pub id: String,
    pub user_id: String,
    pub reward_type: RewardType,
    pub amount: i64, // diram
    pub source_user_id: Option<String>,
    pub source_order_id: Option<String>,
    pub referral_level: Option<u8>,
    pub scheduled_at: DateTime<Utc>,
    pub status: RewardStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// The account columns the scheduler needs for a versioned credit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: i64,
    pub balance_version: i64,
    pub trust_score: i64,
    pub is_suspicious: bool,
    pub verification_required: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Recharge,
    Purchase,
    Reward,
    Withdrawal,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Recharge => "recharge",
            TransactionType::Purchase => "purchase",
            TransactionType::Reward => "reward",
            TransactionType::Withdrawal => "withdrawal",
        }
    }
}

impl FromStr for TransactionType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "recharge" => Ok(TransactionType::Recharge),
            "purchase" => Ok(TransactionType::Purchase),
            "reward" => Ok(TransactionType::Reward),
            "withdrawal" => Ok(TransactionType::Withdrawal),
            other => Err(format!("unknown transaction type: {other}")),
        }
    }
}

/// A recharge row as the wash-trading detector sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recharge {
    pub id: i64,
    pub user_id: String,
    pub amount: i64,
    pub created_at: DateTime<Utc>,
}

/// Timestamps are stored as unix milliseconds.
pub fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

pub fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn risk_level_bands() {
        assert_eq!(RiskLevel::from_score(95), RiskLevel::Critical);
        assert_eq!(RiskLevel::from_score(85), RiskLevel::High);
        assert_eq!(RiskLevel::from_score(70), RiskLevel::Medium);
        assert_eq!(RiskLevel::from_score(10), RiskLevel::Low);
    }

    #[test]
    fn detection_type_serializes_snake_case() {
        let json = serde_json::to_string(&DetectionType::MutualReferralWashTrading).unwrap();
        assert_eq!(json, "\"mutual_referral_wash_trading\"");
        assert_eq!(DetectionType::ZombieAccount.to_string(), "zombie_account");
    }

    #[test]
    fn reward_status_parses() {
        for status in [
            RewardStatus::Pending,
            RewardStatus::Processing,
            RewardStatus::Completed,
            RewardStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<RewardStatus>().unwrap(), status);
        }
        assert!("credited".parse::<RewardStatus>().is_err());
    }

    #[test]
    fn millis_keep_subsecond_precision() {
        let t = from_millis(1_700_000_000_123);
        assert_eq!(to_millis(t), 1_700_000_000_123);
    }
}
