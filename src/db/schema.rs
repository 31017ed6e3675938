use rusqlite::Connection;

pub fn migrate(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id                    TEXT PRIMARY KEY,
            telegram_id           INTEGER,
            username              TEXT,
            trust_score           INTEGER NOT NULL DEFAULT 50,
            is_suspicious         INTEGER NOT NULL DEFAULT 0,
            verification_required INTEGER NOT NULL DEFAULT 0,
            balance               INTEGER NOT NULL DEFAULT 0,
            balance_version       INTEGER NOT NULL DEFAULT 0,
            registration_ip       TEXT,
            created_at_ms         INTEGER NOT NULL,
            last_login_at_ms      INTEGER
        );

        CREATE TABLE IF NOT EXISTS referral_relationships (
            referrer_user_id TEXT NOT NULL,
            referee_user_id  TEXT NOT NULL UNIQUE,
            created_at_ms    INTEGER NOT NULL,
            PRIMARY KEY (referrer_user_id, referee_user_id)
        );

        CREATE TABLE IF NOT EXISTS device_fingerprints (
            device_id     TEXT NOT NULL,
            user_id       TEXT NOT NULL,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (device_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS transactions (
            id            INTEGER PRIMARY KEY AUTOINCREMENT,
            user_id       TEXT NOT NULL,
            tx_type       TEXT NOT NULL,
            amount        INTEGER NOT NULL,
            reward_id     TEXT UNIQUE,
            created_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS blacklist (
            kind          TEXT NOT NULL,
            key           TEXT NOT NULL,
            reason        TEXT NOT NULL,
            expires_at_ms INTEGER,
            created_at_ms INTEGER NOT NULL,
            PRIMARY KEY (kind, key)
        );

        CREATE TABLE IF NOT EXISTS fraud_detection_logs (
            id                TEXT PRIMARY KEY,
            detection_type    TEXT NOT NULL,
            entity_key        TEXT NOT NULL,
            risk_score        INTEGER NOT NULL,
            action            TEXT NOT NULL,
            details           TEXT NOT NULL, -- JSON
            affected_user_ids TEXT NOT NULL, -- JSON array
            created_at_ms     INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS delayed_rewards (
            id              TEXT PRIMARY KEY,
            user_id         TEXT NOT NULL,
            reward_type     TEXT NOT NULL,
            amount          INTEGER NOT NULL,
            source_user_id  TEXT,
            source_order_id TEXT,
            referral_level  INTEGER,
            scheduled_at_ms INTEGER NOT NULL,
            status          TEXT NOT NULL,
            retry_count     INTEGER NOT NULL DEFAULT 0,
            last_error      TEXT,
            created_at_ms   INTEGER NOT NULL,
            updated_at_ms   INTEGER NOT NULL,
            processed_at_ms INTEGER
        );

        CREATE INDEX IF NOT EXISTS idx_referrals_created ON referral_relationships(created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_users_registration_ip ON users(registration_ip, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_transactions_user ON transactions(user_id, tx_type, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_fraud_logs_entity ON fraud_detection_logs(detection_type, entity_key, created_at_ms);
        CREATE INDEX IF NOT EXISTS idx_blacklist_expires ON blacklist(expires_at_ms);
        CREATE INDEX IF NOT EXISTS idx_rewards_due ON delayed_rewards(status, scheduled_at_ms);
        ",
    )?;
    Ok(())
}
