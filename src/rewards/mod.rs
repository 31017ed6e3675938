use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{RewardConfig, span_days, span_hours, span_secs};
use crate::core::{DelayedReward, RewardStatus, RewardType};
use crate::db::{SharedDatabase, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum RewardError {
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("reward amount must be positive, got {0}")]
    InvalidAmount(i64),
    #[error("user {0} is under fraud review")]
    UserUnderReview(String),
    #[error("balance kept changing for user {user_id} after {attempts} attempts")]
    ConflictExhausted { user_id: String, attempts: u32 },
    #[error(transparent)]
    Credit(StoreError),
    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Input for [`RewardProcessor::create_delayed_reward`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewDelayedReward {
    pub user_id: String,
    pub reward_type: RewardType,
    pub amount: i64,
    pub source_user_id: Option<String>,
    pub source_order_id: Option<String>,
    pub referral_level: Option<u8>,
    /// Overrides the schedule policy when set.
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewDelayedReward {
    pub fn new(user_id: impl Into<String>, reward_type: RewardType, amount: i64) -> Self {
        Self {
            user_id: user_id.into(),
            reward_type,
            amount,
            source_user_id: None,
            source_order_id: None,
            referral_level: None,
            scheduled_at: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RewardAttempt {
    pub reward_id: String,
    pub user_id: String,
    pub amount: i64,
    pub success: bool,
    pub error: Option<String>,
}

/// Summary of one `process_batch` pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchOutcome {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    /// Claimed by another worker first.
    pub skipped: usize,
    pub details: Vec<RewardAttempt>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
    pub average_retry_count: f64,
    pub oldest_pending_at: Option<DateTime<Utc>>,
    pub oldest_pending_age_secs: Option<i64>,
}

/// Creates delayed rewards and credits them once they are due.
#[derive(Clone)]
pub struct RewardProcessor {
    db: SharedDatabase,
    config: RewardConfig,
}

impl RewardProcessor {
    pub fn new(db: SharedDatabase, config: RewardConfig) -> Self {
        Self { db, config }
    }

    /// When a reward of `reward_type` created at `now` becomes due.
    pub fn scheduled_time(&self, reward_type: RewardType, now: DateTime<Utc>) -> DateTime<Utc> {
        match reward_type {
            RewardType::ReferralRegister | RewardType::ReferralFirstPlay => now,
            RewardType::ReferralFirstPurchase => now + span_hours(self.config.first_purchase_delay_hours),
        }
    }

    pub fn create_delayed_reward(
        &self,
        request: NewDelayedReward,
        now: DateTime<Utc>,
    ) -> Result<DelayedReward, RewardError> {
        if request.amount <= 0 {
            return Err(RewardError::InvalidAmount(request.amount));
        }
        if !self.db.user_exists(&request.user_id)? {
            return Err(RewardError::UnknownUser(request.user_id));
        }

        let scheduled_at = request
            .scheduled_at
            .unwrap_or_else(|| self.scheduled_time(request.reward_type, now));
        let reward = DelayedReward {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id,
            reward_type: request.reward_type,
            amount: request.amount,
            source_user_id: request.source_user_id,
            source_order_id: request.source_order_id,
            referral_level: request.referral_level,
            scheduled_at,
            status: RewardStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        self.db.insert_reward(&reward)?;
        info!(
            reward_id = %reward.id,
            user_id = %reward.user_id,
            reward_type = %reward.reward_type.as_str(),
            amount = reward.amount,
            %scheduled_at,
            "Delayed reward created"
        );
        Ok(reward)
    }

    /// Reward for a referrer whose referee completed a first purchase.
    pub fn create_first_purchase_reward(
        &self,
        referrer_id: &str,
        referee_id: &str,
        order_id: &str,
        amount: i64,
        referral_level: u8,
        now: DateTime<Utc>,
    ) -> Result<DelayedReward, RewardError> {
        self.create_delayed_reward(
            NewDelayedReward {
                user_id: referrer_id.to_string(),
                reward_type: RewardType::ReferralFirstPurchase,
                amount,
                source_user_id: Some(referee_id.to_string()),
                source_order_id: Some(order_id.to_string()),
                referral_level: Some(referral_level),
                scheduled_at: None,
            },
            now,
        )
    }

    /// Credit every due reward, up to `batch_size`.
    pub fn process_batch(&self, now: DateTime<Utc>) -> Result<BatchOutcome, RewardError> {
        let due = self.db.due_rewards(now, self.config.batch_size)?;
        let mut outcome = BatchOutcome {
            total: due.len(),
            ..Default::default()
        };

        for reward in due {
            if !self.db.claim_reward(&reward.id, now)? {
                debug!(reward_id = %reward.id, "Reward claimed by another worker");
                outcome.skipped += 1;
                continue;
            }

            match self.credit(&reward, now) {
                Ok(balance) => {
                    info!(reward_id = %reward.id, user_id = %reward.user_id, amount = reward.amount, balance, "Reward credited");
                    outcome.success += 1;
                    outcome.details.push(RewardAttempt {
                        reward_id: reward.id,
                        user_id: reward.user_id,
                        amount: reward.amount,
                        success: true,
                        error: None,
                    });
                }
                Err(RewardError::Credit(StoreError::RewardNotClaimed(_))) => {
                    // Released by stale recovery while we held it; the next owner credits it.
                    warn!(reward_id = %reward.id, "Reward left processing state mid-credit");
                    outcome.skipped += 1;
                }
                Err(e) => {
                    self.record_failure(&reward, &e, now)?;
                    outcome.failed += 1;
                    outcome.details.push(RewardAttempt {
                        reward_id: reward.id,
                        user_id: reward.user_id,
                        amount: reward.amount,
                        success: false,
                        error: Some(e.to_string()),
                    });
                }
            }
        }

        if outcome.total > 0 {
            info!(
                total = outcome.total,
                success = outcome.success,
                failed = outcome.failed,
                skipped = outcome.skipped,
                "Reward batch processed"
            );
        }
        Ok(outcome)
    }

    fn credit(&self, reward: &DelayedReward, now: DateTime<Utc>) -> Result<i64, RewardError> {
        let attempts = self.config.credit_attempts.max(1);
        for attempt in 1..=attempts {
            let account = self
                .db
                .account(&reward.user_id)?
                .ok_or_else(|| RewardError::UnknownUser(reward.user_id.clone()))?;
            if account.is_suspicious {
                return Err(RewardError::UserUnderReview(reward.user_id.clone()));
            }

            match self.db.credit_reward(reward, account.balance_version, now) {
                Ok(balance) => return Ok(balance),
                Err(e) if e.is_retryable() => {
                    debug!(reward_id = %reward.id, attempt, "Balance version moved, retrying");
                }
                Err(e) => return Err(RewardError::Credit(e)),
            }
        }
        Err(RewardError::ConflictExhausted {
            user_id: reward.user_id.clone(),
            attempts,
        })
    }

    fn record_failure(
        &self,
        reward: &DelayedReward,
        error: &RewardError,
        now: DateTime<Utc>,
    ) -> Result<(), RewardError> {
        let retry_count = reward.retry_count + 1;
        let message = error.to_string();
        if retry_count >= self.config.max_retries {
            warn!(reward_id = %reward.id, retry_count, "Reward failed permanently: {message}");
            self.db.fail_reward(&reward.id, retry_count, &message, now)?;
        } else {
            let next_attempt = now + self.backoff(retry_count);
            warn!(reward_id = %reward.id, retry_count, %next_attempt, "Reward credit failed, will retry: {message}");
            self.db
                .reschedule_reward(&reward.id, retry_count, next_attempt, &message, now)?;
        }
        Ok(())
    }

    /// `retry_backoff_secs * 2^(retry_count - 1)`, clamped to `MAX_SPAN_SECS`.
    fn backoff(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(16);
        span_secs(self.config.retry_backoff_secs.saturating_mul(1_i64 << exponent))
    }

    pub fn get_processing_stats(&self, now: DateTime<Utc>) -> Result<ProcessingStats, RewardError> {
        let counts = self.db.reward_counts()?;
        Ok(ProcessingStats {
            pending: counts.pending,
            processing: counts.processing,
            completed: counts.completed,
            failed: counts.failed,
            total: counts.pending + counts.processing + counts.completed + counts.failed,
            average_retry_count: counts.average_retry_count,
            oldest_pending_at: counts.oldest_pending,
            oldest_pending_age_secs: counts.oldest_pending.map(|t| (now - t).num_seconds()),
        })
    }

    /// Delete finished rewards older than `days`. Returns the count removed.
    pub fn cleanup_expired_rewards(&self, days: i64, now: DateTime<Utc>) -> Result<usize, RewardError> {
        let removed = self.db.delete_finished_rewards_before(now - span_days(days))?;
        if removed > 0 {
            info!("Removed {removed} finished rewards older than {days} days");
        }
        Ok(removed)
    }

    pub fn pending_rewards(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedReward>, RewardError> {
        Ok(self.db.due_rewards(now, limit)?)
    }

    /// Requeue rewards whose worker died mid-credit.
    pub fn recover_stale_processing(&self, now: DateTime<Utc>) -> Result<usize, RewardError> {
        let stuck_before = now - span_secs(self.config.stale_processing_secs);
        let recovered = self.db.reset_stale_processing(stuck_before, now)?;
        if recovered > 0 {
            warn!("Requeued {recovered} rewards stuck in processing");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MAX_SPAN_SECS;
    use crate::core::{from_millis, to_millis};
    use crate::db::tests::{add_user, open_test_db, temp_db_path};
    use std::sync::{Arc, Barrier};
    use std::thread;

    // Stored timestamps keep millisecond precision.
    fn now_ms() -> DateTime<Utc> {
        from_millis(to_millis(Utc::now()))
    }

    fn processor(db: &SharedDatabase) -> RewardProcessor {
        RewardProcessor::new(db.clone(), RewardConfig::default())
    }

    fn due_now(user: &str, amount: i64) -> NewDelayedReward {
        NewDelayedReward::new(user, RewardType::ReferralRegister, amount)
    }

    #[test]
    fn schedule_follows_reward_type() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);

        let register = rewards.create_delayed_reward(due_now("u1", 100), now).unwrap();
        assert_eq!(register.scheduled_at, now);
        assert_eq!(register.status, RewardStatus::Pending);

        let purchase = rewards
            .create_first_purchase_reward("u1", "u2", "order-1", 500, 1, now)
            .unwrap();
        assert_eq!(purchase.scheduled_at, now + Duration::hours(24));
        assert_eq!(purchase.source_order_id.as_deref(), Some("order-1"));

        let mut explicit = due_now("u1", 100);
        explicit.scheduled_at = Some(now + Duration::minutes(5));
        let explicit = rewards.create_delayed_reward(explicit, now).unwrap();
        assert_eq!(explicit.scheduled_at, now + Duration::minutes(5));
    }

    #[test]
    fn creation_validates_user_and_amount() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);
        assert!(matches!(
            rewards.create_delayed_reward(due_now("ghost", 100), now),
            Err(RewardError::UnknownUser(u)) if u == "ghost"
        ));
        assert!(matches!(
            rewards.create_delayed_reward(due_now("u1", 0), now),
            Err(RewardError::InvalidAmount(0))
        ));
    }

    #[test]
    fn future_rewards_wait_until_due() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);
        rewards
            .create_first_purchase_reward("u1", "u2", "o1", 300, 1, now)
            .unwrap();

        assert_eq!(rewards.process_batch(now).unwrap().total, 0);
        let later = rewards.process_batch(now + Duration::hours(25)).unwrap();
        assert_eq!(later.success, 1);
        assert_eq!(db.account("u1").unwrap().unwrap().balance, 300);
    }

    #[test]
    fn processing_twice_credits_once() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);
        let reward = rewards.create_delayed_reward(due_now("u1", 250), now).unwrap();

        let first = rewards.process_batch(now).unwrap();
        assert_eq!((first.total, first.success, first.failed), (1, 1, 0));
        let second = rewards.process_batch(now).unwrap();
        assert_eq!(second.total, 0);

        let account = db.account("u1").unwrap().unwrap();
        assert_eq!(account.balance, 250);
        assert_eq!(account.balance_version, 1);
        assert_eq!(db.reward_transaction_count("u1").unwrap(), 1);
        let stored = db.get_reward(&reward.id).unwrap().unwrap();
        assert_eq!(stored.status, RewardStatus::Completed);
        assert!(stored.processed_at.is_some());
    }

    #[test]
    fn concurrent_workers_credit_each_reward_once() {
        let path = temp_db_path();
        let setup = SharedDatabase::open(&path).unwrap();
        let now = now_ms();
        add_user(&setup, "u1", now);
        let rewards = processor(&setup);
        for _ in 0..20 {
            rewards.create_delayed_reward(due_now("u1", 10), now).unwrap();
        }

        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let db = SharedDatabase::open(&path).unwrap();
                    let config = RewardConfig {
                        credit_attempts: 100,
                        ..RewardConfig::default()
                    };
                    let worker = RewardProcessor::new(db, config);
                    barrier.wait();
                    worker.process_batch(now).unwrap()
                })
            })
            .collect();
        let outcomes: Vec<BatchOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let credited: usize = outcomes.iter().map(|o| o.success).sum();
        assert_eq!(credited, 20);
        assert_eq!(outcomes.iter().map(|o| o.failed).sum::<usize>(), 0);
        for outcome in &outcomes {
            assert_eq!(outcome.success + outcome.skipped, outcome.total);
        }
        let account = setup.account("u1").unwrap().unwrap();
        assert_eq!(account.balance, 200);
        assert_eq!(account.balance_version, 20);
        assert_eq!(setup.reward_transaction_count("u1").unwrap(), 20);
    }

    #[test]
    fn stale_version_is_a_conflict_not_an_overwrite() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);
        let reward = rewards.create_delayed_reward(due_now("u1", 100), now).unwrap();
        assert!(db.claim_reward(&reward.id, now).unwrap());

        let err = db.credit_reward(&reward, 7, now).unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, StoreError::VersionConflict { expected: 7, .. }));

        let account = db.account("u1").unwrap().unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(db.get_reward(&reward.id).unwrap().unwrap().status, RewardStatus::Processing);

        assert_eq!(db.credit_reward(&reward, account.balance_version, now).unwrap(), 100);
    }

    #[test]
    fn claim_is_exclusive() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let reward = processor(&db).create_delayed_reward(due_now("u1", 5), now).unwrap();
        assert!(db.claim_reward(&reward.id, now).unwrap());
        assert!(!db.claim_reward(&reward.id, now).unwrap());
    }

    #[test]
    fn failing_credit_backs_off_then_fails() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        db.set_suspicious("u1", true).unwrap();
        let rewards = processor(&db);
        let reward = rewards.create_delayed_reward(due_now("u1", 100), now).unwrap();

        let first = rewards.process_batch(now).unwrap();
        assert_eq!(first.failed, 1);
        let stored = db.get_reward(&reward.id).unwrap().unwrap();
        assert_eq!(stored.status, RewardStatus::Pending);
        assert_eq!(stored.retry_count, 1);
        assert_eq!(stored.scheduled_at, now + Duration::seconds(60));
        assert!(stored.last_error.unwrap().contains("under fraud review"));

        let t2 = now + Duration::seconds(61);
        rewards.process_batch(t2).unwrap();
        let stored = db.get_reward(&reward.id).unwrap().unwrap();
        assert_eq!(stored.retry_count, 2);
        assert_eq!(stored.scheduled_at, t2 + Duration::seconds(120));

        let t3 = t2 + Duration::seconds(121);
        rewards.process_batch(t3).unwrap();
        let stored = db.get_reward(&reward.id).unwrap().unwrap();
        assert_eq!(stored.status, RewardStatus::Failed);
        assert_eq!(stored.retry_count, 3);
        assert_eq!(db.account("u1").unwrap().unwrap().balance, 0);

        assert_eq!(rewards.process_batch(t3 + Duration::days(1)).unwrap().total, 0);
    }

    #[test]
    fn absurd_delays_are_clamped_instead_of_overflowing() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        db.set_suspicious("u1", true).unwrap();
        let rewards = RewardProcessor::new(
            db.clone(),
            RewardConfig {
                retry_backoff_secs: i64::MAX,
                first_purchase_delay_hours: i64::MAX,
                stale_processing_secs: i64::MAX,
                ..RewardConfig::default()
            },
        );
        let longest = Duration::seconds(MAX_SPAN_SECS);
        assert_eq!(rewards.scheduled_time(RewardType::ReferralFirstPurchase, now), now + longest);
        assert_eq!(rewards.backoff(40), longest);

        let reward = rewards.create_delayed_reward(due_now("u1", 100), now).unwrap();
        assert_eq!(rewards.process_batch(now).unwrap().failed, 1);
        let stored = db.get_reward(&reward.id).unwrap().unwrap();
        assert_eq!(stored.status, RewardStatus::Pending);
        assert_eq!(stored.scheduled_at, now + longest);

        assert_eq!(rewards.recover_stale_processing(now).unwrap(), 0);
        assert_eq!(rewards.cleanup_expired_rewards(i64::MAX, now).unwrap(), 0);
    }

    #[test]
    fn reward_for_deleted_user_is_retried() {
        let db = open_test_db();
        let now = now_ms();
        let orphan = DelayedReward {
            id: "r-orphan".into(),
            user_id: "gone".into(),
            reward_type: RewardType::ReferralFirstPlay,
            amount: 40,
            source_user_id: None,
            source_order_id: None,
            referral_level: None,
            scheduled_at: now,
            status: RewardStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
        };
        db.insert_reward(&orphan).unwrap();

        let outcome = processor(&db).process_batch(now).unwrap();
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.details[0].error.as_deref(), Some("unknown user gone"));
        assert_eq!(db.get_reward("r-orphan").unwrap().unwrap().retry_count, 1);
    }

    #[test]
    fn stats_report_counts_and_backlog_age() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);
        let mut old = due_now("u1", 10);
        old.scheduled_at = Some(now - Duration::minutes(10));
        rewards.create_delayed_reward(old, now).unwrap();
        rewards
            .create_first_purchase_reward("u1", "u2", "o1", 10, 1, now)
            .unwrap();

        let stats = rewards.get_processing_stats(now).unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.total, 2);
        assert_eq!(stats.oldest_pending_at, Some(now - Duration::minutes(10)));
        assert_eq!(stats.oldest_pending_age_secs, Some(600));

        rewards.process_batch(now).unwrap();
        let stats = rewards.get_processing_stats(now).unwrap();
        assert_eq!((stats.pending, stats.completed), (1, 1));
        assert_eq!(stats.average_retry_count, 0.0);
    }

    #[test]
    fn cleanup_only_removes_old_finished_rewards() {
        let db = open_test_db();
        let start = now_ms() - Duration::days(40);
        add_user(&db, "u1", start);
        let rewards = processor(&db);
        rewards.create_delayed_reward(due_now("u1", 10), start).unwrap();
        rewards.process_batch(start).unwrap();
        rewards.create_delayed_reward(due_now("u1", 10), start).unwrap();

        let now = start + Duration::days(40);
        assert_eq!(rewards.cleanup_expired_rewards(30, now).unwrap(), 1);
        let stats = rewards.get_processing_stats(now).unwrap();
        assert_eq!((stats.completed, stats.pending), (0, 1));
    }

    #[test]
    fn stale_processing_rows_are_requeued() {
        let db = open_test_db();
        let now = now_ms();
        add_user(&db, "u1", now);
        let rewards = processor(&db);
        let reward = rewards.create_delayed_reward(due_now("u1", 10), now).unwrap();
        assert!(db.claim_reward(&reward.id, now).unwrap());

        assert_eq!(rewards.recover_stale_processing(now + Duration::seconds(30)).unwrap(), 0);
        let later = now + Duration::seconds(601);
        assert_eq!(rewards.recover_stale_processing(later).unwrap(), 1);
        assert_eq!(rewards.pending_rewards(later, 10).unwrap().len(), 1);
        assert_eq!(rewards.process_batch(later).unwrap().success, 1);
    }
}
