mod import;
pub mod rewards;
pub mod schema;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::core::{
    Account, BlacklistEntry, BlacklistKind, DetectionResult, DetectionType, Recharge,
    TransactionType, from_millis, to_millis,
};

/// Separates user ids inside a recursive-walk path string.
const PATH_SEPARATOR: char = '\u{1f}';

/// Frontier users bound per `IN (...)` query, well under SQLite's variable limit.
pub const REFEREE_BATCH_SIZE: usize = 500;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("balance version conflict for user {user_id} (expected version {expected})")]
    VersionConflict { user_id: String, expected: i64 },
    #[error("reward {0} is not in processing state")]
    RewardNotClaimed(String),
}

impl StoreError {
    /// Conflicts are resolved by re-reading the account and trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// A user row as written by the registration flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    pub id: String,
    pub telegram_id: Option<i64>,
    pub username: Option<String>,
    pub trust_score: i64,
    pub registration_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewUser {
    pub fn new(id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            telegram_id: None,
            username: None,
            trust_score: 50,
            registration_ip: None,
            created_at,
        }
    }
}

/// A persisted fraud log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudLogRecord {
    pub id: String,
    pub detection_type: String,
    pub entity_key: String,
    pub risk_score: i64,
    pub action: String,
    pub details_json: String,
    pub affected_user_ids_json: String,
    pub created_at: DateTime<Utc>,
}

/// A low-trust account with no recorded activity.
#[derive(Debug, Clone, PartialEq)]
pub struct ZombieCandidate {
    pub user_id: String,
    pub trust_score: i64,
    pub last_login_at: Option<DateTime<Utc>>,
}

/// State change applied in the same transaction that logs a detection.
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    FlagSuspicious(Vec<String>),
    RequireVerification(Vec<String>),
    Blacklist(BlacklistEntry),
}

pub struct Database {
    conn: Connection,
}

/// Thread-safe wrapper around Database.
#[derive(Clone)]
pub struct SharedDatabase {
    inner: Arc<Mutex<Database>>,
}

impl Database {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        schema::migrate(&conn)?;
        Ok(Self { conn })
    }
}

impl SharedDatabase {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        Self::open_with_timeout(path, Duration::from_secs(5))
    }

    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, rusqlite::Error> {
        let db = Database::open(path, busy_timeout)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(db)),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Accounts, referrals, devices, transactions ---

    pub fn insert_user(&self, user: &NewUser) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "INSERT INTO users (id, telegram_id, username, trust_score, registration_ip, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user.id,
                user.telegram_id,
                user.username,
                user.trust_score,
                user.registration_ip,
                to_millis(user.created_at)
            ],
        )?;
        Ok(())
    }

    pub fn user_exists(&self, user_id: &str) -> Result<bool, rusqlite::Error> {
        let db = self.lock();
        db.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM users WHERE id = ?1)",
            params![user_id],
            |row| row.get(0),
        )
    }

    pub fn account(&self, user_id: &str) -> Result<Option<Account>, rusqlite::Error> {
        let db = self.lock();
        db.conn
            .query_row(
                "SELECT id, balance, balance_version, trust_score, is_suspicious, verification_required
                 FROM users WHERE id = ?1",
                params![user_id],
                |row| {
                    Ok(Account {
                        user_id: row.get(0)?,
                        balance: row.get(1)?,
                        balance_version: row.get(2)?,
                        trust_score: row.get(3)?,
                        is_suspicious: row.get::<_, i64>(4)? != 0,
                        verification_required: row.get::<_, i64>(5)? != 0,
                    })
                },
            )
            .optional()
    }

    pub fn record_login(&self, user_id: &str, at: DateTime<Utc>) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "UPDATE users SET last_login_at_ms = ?2 WHERE id = ?1",
            params![user_id, to_millis(at)],
        )?;
        Ok(())
    }

    /// Clear the review flag once an admin has cleared the account.
    pub fn set_suspicious(&self, user_id: &str, suspicious: bool) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "UPDATE users SET is_suspicious = ?2 WHERE id = ?1",
            params![user_id, suspicious as i64],
        )?;
        Ok(())
    }

    pub fn insert_referral(
        &self,
        referrer: &str,
        referee: &str,
        at: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "INSERT INTO referral_relationships (referrer_user_id, referee_user_id, created_at_ms)
             VALUES (?1, ?2, ?3)",
            params![referrer, referee, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn referrer_of(&self, referee: &str) -> Result<Option<String>, rusqlite::Error> {
        let db = self.lock();
        db.conn
            .query_row(
                "SELECT referrer_user_id FROM referral_relationships WHERE referee_user_id = ?1",
                params![referee],
                |row| row.get(0),
            )
            .optional()
    }

    pub fn insert_device_fingerprint(
        &self,
        device_id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "INSERT OR IGNORE INTO device_fingerprints (device_id, user_id, created_at_ms)
             VALUES (?1, ?2, ?3)",
            params![device_id, user_id, to_millis(at)],
        )?;
        Ok(())
    }

    pub fn insert_transaction(
        &self,
        user_id: &str,
        tx_type: TransactionType,
        amount: i64,
        at: DateTime<Utc>,
    ) -> Result<i64, rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "INSERT INTO transactions (user_id, tx_type, amount, created_at_ms) VALUES (?1, ?2, ?3, ?4)",
            params![user_id, tx_type.as_str(), amount, to_millis(at)],
        )?;
        Ok(db.conn.last_insert_rowid())
    }

    // --- Detector aggregations ---

    /// Referrers with more than `threshold` invites since `since`.
    pub fn invite_counts_since(
        &self,
        since: DateTime<Utc>,
        threshold: i64,
    ) -> Result<Vec<(String, i64)>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT referrer_user_id, COUNT(*) FROM referral_relationships
             WHERE created_at_ms >= ?1
             GROUP BY referrer_user_id HAVING COUNT(*) > ?2
             ORDER BY referrer_user_id",
        )?;
        let rows = stmt.query_map(params![to_millis(since), threshold], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect()
    }

    /// Devices shared by at least `min_accounts` distinct users.
    pub fn device_account_counts(&self, min_accounts: i64) -> Result<Vec<(String, i64)>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT device_id, COUNT(DISTINCT user_id) FROM device_fingerprints
             GROUP BY device_id HAVING COUNT(DISTINCT user_id) >= ?1
             ORDER BY device_id",
        )?;
        let rows = stmt.query_map(params![min_accounts], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    pub fn device_users(&self, device_id: &str) -> Result<Vec<String>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT DISTINCT user_id FROM device_fingerprints WHERE device_id = ?1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![device_id], |row| row.get(0))?;
        rows.collect()
    }

    /// Registration IPs with more than `threshold` accounts created since `since`.
    pub fn ip_registration_counts_since(
        &self,
        since: DateTime<Utc>,
        threshold: i64,
    ) -> Result<Vec<(String, i64)>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT registration_ip, COUNT(*) FROM users
             WHERE registration_ip IS NOT NULL AND created_at_ms >= ?1
             GROUP BY registration_ip HAVING COUNT(*) > ?2
             ORDER BY registration_ip",
        )?;
        let rows = stmt.query_map(params![to_millis(since), threshold], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        rows.collect()
    }

    pub fn users_registered_from_ip_since(
        &self,
        ip: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<String>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT id FROM users WHERE registration_ip = ?1 AND created_at_ms >= ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![ip, to_millis(since)], |row| row.get(0))?;
        rows.collect()
    }

    /// Pairs (a, b) with a < b where a referred b and b referred a.
    pub fn mutual_referral_pairs(&self) -> Result<Vec<(String, String)>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT a.referrer_user_id, a.referee_user_id
             FROM referral_relationships a
             JOIN referral_relationships b
               ON a.referrer_user_id = b.referee_user_id AND a.referee_user_id = b.referrer_user_id
             WHERE a.referrer_user_id < a.referee_user_id
             ORDER BY a.referrer_user_id, a.referee_user_id",
        )?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        rows.collect()
    }

    pub fn recharges_since(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Vec<Recharge>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT id, user_id, amount, created_at_ms FROM transactions
             WHERE user_id = ?1 AND tx_type = ?2 AND created_at_ms >= ?3
             ORDER BY created_at_ms, id",
        )?;
        let rows = stmt.query_map(
            params![user_id, TransactionType::Recharge.as_str(), to_millis(since)],
            |row| {
                Ok(Recharge {
                    id: row.get(0)?,
                    user_id: row.get(1)?,
                    amount: row.get(2)?,
                    created_at: from_millis(row.get(3)?),
                })
            },
        )?;
        rows.collect()
    }

    /// Unflagged users below the trust threshold with no transactions, no login
    /// since `inactive_before`, and registered before it.
    pub fn zombie_candidates(
        &self,
        trust_threshold: i64,
        inactive_before: DateTime<Utc>,
    ) -> Result<Vec<ZombieCandidate>, rusqlite::Error> {
        let db = self.lock();
        let cutoff = to_millis(inactive_before);
        let mut stmt = db.conn.prepare(
            "SELECT u.id, u.trust_score, u.last_login_at_ms FROM users u
             WHERE u.trust_score < ?1
               AND u.is_suspicious = 0
               AND u.created_at_ms < ?2
               AND (u.last_login_at_ms IS NULL OR u.last_login_at_ms < ?2)
               AND NOT EXISTS (SELECT 1 FROM transactions t WHERE t.user_id = u.id)
             ORDER BY u.id",
        )?;
        let rows = stmt.query_map(params![trust_threshold, cutoff], |row| {
            Ok(ZombieCandidate {
                user_id: row.get(0)?,
                trust_score: row.get(1)?,
                last_login_at: row.get::<_, Option<i64>>(2)?.map(from_millis),
            })
        })?;
        rows.collect()
    }

    // --- Fraud log ---

    pub fn has_recent_detection(
        &self,
        detection_type: DetectionType,
        entity_key: &str,
        since: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let db = self.lock();
        db.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM fraud_detection_logs
              WHERE detection_type = ?1 AND entity_key = ?2 AND created_at_ms >= ?3)",
            params![detection_type.as_str(), entity_key, to_millis(since)],
            |row| row.get(0),
        )
    }

    /// Append the detection to the fraud log and apply its side effect atomically.
    pub fn record_detection(
        &self,
        result: &DetectionResult,
        effect: &SideEffect,
    ) -> Result<(), rusqlite::Error> {
        let details = serde_json::to_string(&result.details)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let affected = serde_json::to_string(&result.affected_user_ids)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        let now_ms = to_millis(result.detected_at);

        let db = self.lock();
        let tx = db.conn.unchecked_transaction()?;
        tx.execute(
            "INSERT INTO fraud_detection_logs
               (id, detection_type, entity_key, risk_score, action, details, affected_user_ids, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                uuid::Uuid::new_v4().to_string(),
                result.detection_type.as_str(),
                result.entity_key,
                result.risk_score,
                result.action.as_str(),
                details,
                affected,
                now_ms
            ],
        )?;
        match effect {
            SideEffect::FlagSuspicious(users) => {
                let mut stmt = tx.prepare_cached("UPDATE users SET is_suspicious = 1 WHERE id = ?1")?;
                for user in users {
                    stmt.execute(params![user])?;
                }
            }
            SideEffect::RequireVerification(users) => {
                let mut stmt =
                    tx.prepare_cached("UPDATE users SET verification_required = 1 WHERE id = ?1")?;
                for user in users {
                    stmt.execute(params![user])?;
                }
            }
            SideEffect::Blacklist(entry) => {
                Self::upsert_blacklist(&tx, entry, now_ms)?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn fraud_log_count(&self) -> Result<usize, rusqlite::Error> {
        let db = self.lock();
        db.conn.query_row("SELECT COUNT(*) FROM fraud_detection_logs", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }

    /// Most recent fraud log rows, for the review tooling.
    pub fn recent_fraud_logs(&self, limit: usize) -> Result<Vec<FraudLogRecord>, rusqlite::Error> {
        let db = self.lock();
        let mut stmt = db.conn.prepare(
            "SELECT id, detection_type, entity_key, risk_score, action, details, affected_user_ids, created_at_ms
             FROM fraud_detection_logs ORDER BY created_at_ms DESC, rowid DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok(FraudLogRecord {
                id: row.get(0)?,
                detection_type: row.get(1)?,
                entity_key: row.get(2)?,
                risk_score: row.get(3)?,
                action: row.get(4)?,
                details_json: row.get(5)?,
                affected_user_ids_json: row.get(6)?,
                created_at: from_millis(row.get(7)?),
            })
        })?;
        rows.collect()
    }

    // --- Blacklist ---

    fn upsert_blacklist(conn: &Connection, entry: &BlacklistEntry, now_ms: i64) -> Result<(), rusqlite::Error> {
        conn.execute(
            "INSERT OR REPLACE INTO blacklist (kind, key, reason, expires_at_ms, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.kind.as_str(),
                entry.key,
                entry.reason,
                entry.expires_at.map(to_millis),
                now_ms
            ],
        )?;
        Ok(())
    }

    pub fn insert_blacklist(&self, entry: &BlacklistEntry, now: DateTime<Utc>) -> Result<(), rusqlite::Error> {
        let db = self.lock();
        Self::upsert_blacklist(&db.conn, entry, to_millis(now))
    }

    /// An entry counts while it has no expiry or expires after `now`.
    pub fn is_blacklisted(
        &self,
        kind: BlacklistKind,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, rusqlite::Error> {
        let db = self.lock();
        db.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM blacklist
              WHERE kind = ?1 AND key = ?2 AND (expires_at_ms IS NULL OR expires_at_ms >= ?3))",
            params![kind.as_str(), key, to_millis(now)],
            |row| row.get(0),
        )
    }

    pub fn blacklist_count(&self) -> Result<usize, rusqlite::Error> {
        let db = self.lock();
        db.conn.query_row("SELECT COUNT(*) FROM blacklist", [], |row| {
            row.get::<_, i64>(0).map(|c| c as usize)
        })
    }

    /// Delete entries whose expiry has passed. Returns the number removed.
    pub fn cleanup_expired_blacklist(&self, now: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let db = self.lock();
        db.conn.execute(
            "DELETE FROM blacklist WHERE expires_at_ms IS NOT NULL AND expires_at_ms < ?1",
            params![to_millis(now)],
        )
    }

    // --- Referral graph ---

    /// Outgoing referral edges of every user in `frontier`, ordered by
    /// referrer then referee. Issues one query per `REFEREE_BATCH_SIZE` users.
    pub fn referees_of(&self, frontier: &[String]) -> Result<Vec<(String, String)>, rusqlite::Error> {
        let db = self.lock();
        let mut edges = Vec::new();
        for batch in frontier.chunks(REFEREE_BATCH_SIZE) {
            let placeholders = vec!["?"; batch.len()].join(", ");
            let sql = format!(
                "SELECT referrer_user_id, referee_user_id FROM referral_relationships
                 WHERE referrer_user_id IN ({placeholders})"
            );
            let mut stmt = db.conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(batch.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?;
            for row in rows {
                edges.push(row?);
            }
        }
        edges.sort();
        Ok(edges)
    }

    /// Shortest referral path `from … to` of at most `max_depth` edges.
    pub fn referral_path(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
    ) -> Result<Option<Vec<String>>, rusqlite::Error> {
        let db = self.lock();
        let path: Option<String> = db
            .conn
            .query_row(
                "WITH RECURSIVE walk(user_id, depth, path) AS (
                     SELECT ?1, 0, ?1
                     UNION ALL
                     SELECT r.referee_user_id, w.depth + 1, w.path || char(31) || r.referee_user_id
                     FROM referral_relationships r
                     JOIN walk w ON r.referrer_user_id = w.user_id
                     WHERE w.depth < ?3
                       AND w.user_id <> ?2
                       AND instr(char(31) || w.path || char(31), char(31) || r.referee_user_id || char(31)) = 0
                 )
                 SELECT path FROM walk WHERE user_id = ?2 ORDER BY depth, path LIMIT 1",
                params![from, to, max_depth as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(|p| split_path(&p)))
    }

    /// Shortest referral loop that leaves `start` and comes back to it within
    /// `max_depth` edges, in a single recursive query. With `through` set the
    /// closing edge must come from that user. The path starts and ends with
    /// `start`, so a self-loop edge reads `[start, start]`.
    pub fn referral_loop(
        &self,
        start: &str,
        through: Option<&str>,
        max_depth: usize,
    ) -> Result<Option<Vec<String>>, rusqlite::Error> {
        let db = self.lock();
        let path: Option<String> = db
            .conn
            .query_row(
                "WITH RECURSIVE walk(user_id, depth, path) AS (
                     SELECT ?1, 0, ?1
                     UNION ALL
                     SELECT r.referee_user_id, w.depth + 1, w.path || char(31) || r.referee_user_id
                     FROM referral_relationships r
                     JOIN walk w ON r.referrer_user_id = w.user_id
                     WHERE w.depth + 1 < ?3
                       AND (?2 IS NULL OR w.user_id <> ?2)
                       AND instr(char(31) || w.path || char(31), char(31) || r.referee_user_id || char(31)) = 0
                 )
                 SELECT w.path FROM walk w
                 JOIN referral_relationships back
                   ON back.referrer_user_id = w.user_id AND back.referee_user_id = ?1
                 WHERE w.depth < ?3 AND (?2 IS NULL OR w.user_id = ?2)
                 ORDER BY w.depth, w.path LIMIT 1",
                params![start, through, max_depth as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(path.map(|p| {
            let mut path = split_path(&p);
            path.push(start.to_string());
            path
        }))
    }
}

fn split_path(raw: &str) -> Vec<String> {
    raw.split(PATH_SEPARATOR).map(str::to_string).collect()
}
