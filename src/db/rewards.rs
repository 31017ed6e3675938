use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, TransactionBehavior, params};
use serde::{Deserialize, Serialize};

use super::{SharedDatabase, StoreError};
use crate::core::{DelayedReward, RewardStatus, TransactionType, from_millis, to_millis};

const REWARD_COLUMNS: &str = "id, user_id, reward_type, amount, source_user_id, source_order_id, \
     referral_level, scheduled_at_ms, status, retry_count, last_error, created_at_ms, updated_at_ms, processed_at_ms";

/// Row counts per status plus retry and backlog figures.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RewardCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub average_retry_count: f64,
    pub oldest_pending: Option<DateTime<Utc>>,
}

fn parse_column<T: std::str::FromStr<Err = String>>(
    row: &rusqlite::Row,
    idx: usize,
) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e: String| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

fn row_to_reward(row: &rusqlite::Row) -> rusqlite::Result<DelayedReward> {
    Ok(DelayedReward {
        id: row.get(0)?,
        user_id: row.get(1)?,
        reward_type: parse_column(row, 2)?,
        amount: row.get(3)?,
        source_user_id: row.get(4)?,
        source_order_id: row.get(5)?,
        referral_level: row.get(6)?,
        scheduled_at: from_millis(row.get(7)?),
        status: parse_column(row, 8)?,
        retry_count: row.get(9)?,
        last_error: row.get(10)?,
        created_at: from_millis(row.get(11)?),
        updated_at: from_millis(row.get(12)?),
        processed_at: row.get::<_, Option<i64>>(13)?.map(from_millis),
    })
}

impl SharedDatabase {
    pub fn insert_reward(&self, reward: &DelayedReward) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            &format!("INSERT INTO delayed_rewards ({REWARD_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"),
            params![
                reward.id,
                reward.user_id,
                reward.reward_type.as_str(),
                reward.amount,
                reward.source_user_id,
                reward.source_order_id,
                reward.referral_level,
                to_millis(reward.scheduled_at),
                reward.status.as_str(),
                reward.retry_count,
                reward.last_error,
                to_millis(reward.created_at),
                to_millis(reward.updated_at),
                reward.processed_at.map(to_millis)
            ],
        )?;
        Ok(())
    }

    pub fn get_reward(&self, id: &str) -> Result<Option<DelayedReward>, rusqlite::Error> {
        let db = self.lock();
        db.conn
            .query_row(
                &format!("SELECT {REWARD_COLUMNS} FROM delayed_rewards WHERE id = ?1"),
                params![id],
                row_to_reward,
            )
            .optional()
    }

    /// Pending rewards that are due, oldest schedule first.
    pub fn due_rewards(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<DelayedReward>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(&format!(
            "SELECT {REWARD_COLUMNS} FROM delayed_rewards
             WHERE status = 'pending' AND scheduled_at_ms <= ?1
             ORDER BY scheduled_at_ms, id LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![to_millis(now), limit as i64], row_to_reward)?;
        rows.collect()
    }

    /// Atomic `pending -> processing`. Exactly one caller wins a given reward.
    pub fn claim_reward(&self, id: &str, now: DateTime<Utc>) -> Result<bool, rusqlite::Error> {
        let db = self.lock();
        let changed = db.conn.execute(
            "UPDATE delayed_rewards SET status = 'processing', updated_at_ms = ?2
             WHERE id = ?1 AND status = 'pending'",
            params![id, to_millis(now)],
        )?;
        Ok(changed == 1)
    }

    /// Credit a claimed reward to its user and mark it completed.
    ///
    /// The balance update only applies while `balance_version` still equals
    /// `expected_version`; otherwise nothing is written and a
    /// [`StoreError::VersionConflict`] is returned. Returns the new balance.
    pub fn credit_reward(
        &self,
        reward: &DelayedReward,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let now_ms = to_millis(now);
        let mut db = self.lock();
        let tx = db.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let updated = tx.execute(
            "UPDATE users SET balance = balance + ?2, balance_version = balance_version + 1
             WHERE id = ?1 AND balance_version = ?3",
            params![reward.user_id, reward.amount, expected_version],
        )?;
        if updated == 0 {
            return Err(StoreError::VersionConflict {
                user_id: reward.user_id.clone(),
                expected: expected_version,
            });
        }

        let completed = tx.execute(
            "UPDATE delayed_rewards
             SET status = 'completed', processed_at_ms = ?2, updated_at_ms = ?2, last_error = NULL
             WHERE id = ?1 AND status = 'processing'",
            params![reward.id, now_ms],
        )?;
        if completed == 0 {
            return Err(StoreError::RewardNotClaimed(reward.id.clone()));
        }

        tx.execute(
            "INSERT INTO transactions (user_id, tx_type, amount, reward_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                reward.user_id,
                TransactionType::Reward.as_str(),
                reward.amount,
                reward.id,
                now_ms
            ],
        )?;

        let balance: i64 = tx.query_row(
            "SELECT balance FROM users WHERE id = ?1",
            params![reward.user_id],
            |row| row.get(0),
        )?;
        tx.commit()?;
        Ok(balance)
    }

    /// Return a claimed reward to the queue for a later attempt.
    pub fn reschedule_reward(
        &self,
        id: &str,
        retry_count: u32,
        next_attempt: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "UPDATE delayed_rewards
             SET status = 'pending', retry_count = ?2, scheduled_at_ms = ?3, last_error = ?4, updated_at_ms = ?5
             WHERE id = ?1 AND status = 'processing'",
            params![id, retry_count, to_millis(next_attempt), error, to_millis(now)],
        )?;
        Ok(())
    }

    /// Park a reward for manual handling.
    pub fn fail_reward(
        &self,
        id: &str,
        retry_count: u32,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "UPDATE delayed_rewards
             SET status = 'failed', retry_count = ?2, last_error = ?3, updated_at_ms = ?4, processed_at_ms = ?4
             WHERE id = ?1 AND status = 'processing'",
            params![id, retry_count, error, to_millis(now)],
        )?;
        Ok(())
    }

    /// Put rows stuck in `processing` since before `stuck_before` back to `pending`.
    pub fn reset_stale_processing(
        &self,
        stuck_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<usize, rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "UPDATE delayed_rewards SET status = 'pending', updated_at_ms = ?2
             WHERE status = 'processing' AND updated_at_ms < ?1",
            params![to_millis(stuck_before), to_millis(now)],
        )
    }

    pub fn reward_counts(&self) -> Result<RewardCounts, rusqlite::Error> {
        let db = self.lock();
        let mut counts = RewardCounts::default();
        {
            let mut stmt = db
                .conn
                .prepare("SELECT status, COUNT(*) FROM delayed_rewards GROUP BY status")?;
            let rows = stmt.query_map([], |row| {
                Ok((parse_column::<RewardStatus>(row, 0)?, row.get::<_, i64>(1)? as usize))
            })?;
            for row in rows {
                let (status, count) = row?;
                match status {
                    RewardStatus::Pending => counts.pending = count,
                    RewardStatus::Processing => counts.processing = count,
                    RewardStatus::Completed => counts.completed = count,
                    RewardStatus::Failed => counts.failed = count,
                }
            }
        }
        counts.average_retry_count = db.conn.query_row(
            "SELECT COALESCE(AVG(retry_count), 0.0) FROM delayed_rewards",
            [],
            |row| row.get(0),
        )?;
        counts.oldest_pending = db
            .conn
            .query_row(
                "SELECT MIN(scheduled_at_ms) FROM delayed_rewards WHERE status = 'pending'",
                [],
                |row| row.get::<_, Option<i64>>(0),
            )?
            .map(from_millis);
        Ok(counts)
    }

    /// Delete completed and failed rows last touched before `cutoff`.
    pub fn delete_finished_rewards_before(&self, cutoff: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "DELETE FROM delayed_rewards
             WHERE status IN ('completed', 'failed') AND updated_at_ms < ?1",
            params![to_millis(cutoff)],
        )
    }

    pub fn reward_transaction_count(&self, user_id: &str) -> Result<usize, rusqlite::Error> {
        let db = self.lock();
        db.conn.query_row(
            "SELECT COUNT(*) FROM transactions WHERE user_id = ?1 AND tx_type = ?2",
            params![user_id, TransactionType::Reward.as_str()],
            |row| row.get::<_, i64>(0).map(|c| c as usize),
        )
    }
}
