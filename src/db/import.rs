//! CSV seeding for the tables the detectors read. Every file has a header
//! row. Rows that do not parse are logged and skipped; store errors abort.

use chrono::{DateTime, Utc};
use std::error::Error;
use std::path::Path;
use tracing::warn;

use super::{NewUser, SharedDatabase};
use crate::core::{BlacklistEntry, BlacklistKind, TransactionType};

/// Data rows of a CSV file, split on commas into at most `fields` parts.
fn rows(path: &Path, fields: usize) -> Result<Vec<Vec<String>>, Box<dyn Error>> {
    let content = std::fs::read_to_string(path)?;
    Ok(content
        .lines()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.splitn(fields, ',').map(|s| s.trim().to_string()).collect())
        .collect())
}

/// Empty cells are `None`.
fn optional(parts: &[String], index: usize) -> Option<&str> {
    parts.get(index).map(String::as_str).filter(|s| !s.is_empty())
}

fn timestamp(raw: Option<&str>) -> Result<Option<DateTime<Utc>>, chrono::ParseError> {
    raw.map(|raw| DateTime::parse_from_rfc3339(raw).map(|t| t.with_timezone(&Utc)))
        .transpose()
}

impl SharedDatabase {
    /// Bulk-load blacklist entries: `kind,key,reason[,expires_at]`.
    pub fn load_blacklist_from_csv(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, Box<dyn Error>> {
        let mut count = 0;
        for parts in rows(path, 4)? {
            if parts.len() < 3 {
                continue;
            }
            let kind: BlacklistKind = match parts[0].parse() {
                Ok(kind) => kind,
                Err(e) => {
                    warn!("Skipping blacklist row: {e}");
                    continue;
                }
            };
            let expires_at = match timestamp(optional(&parts, 3)) {
                Ok(expires_at) => expires_at,
                Err(e) => {
                    warn!("Skipping blacklist row for {}: {e}", parts[1]);
                    continue;
                }
            };
            let entry = BlacklistEntry {
                kind,
                key: parts[1].clone(),
                reason: parts[2].clone(),
                expires_at,
            };
            self.insert_blacklist(&entry, now)?;
            count += 1;
        }
        Ok(count)
    }

    /// `id,telegram_id,username,trust_score,registration_ip,created_at,last_login_at`.
    /// Only `id` is required; `created_at` defaults to `now`. Known ids are skipped.
    pub fn load_users_from_csv(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, Box<dyn Error>> {
        let mut count = 0;
        for parts in rows(path, 7)? {
            let Some(id) = optional(&parts, 0) else { continue };
            if self.user_exists(id)? {
                continue;
            }
            let parsed = (|| -> Result<_, Box<dyn Error>> {
                let telegram_id = optional(&parts, 1).map(str::parse::<i64>).transpose()?;
                let trust_score = optional(&parts, 3).map(str::parse::<i64>).transpose()?;
                let created_at = timestamp(optional(&parts, 5))?;
                let last_login_at = timestamp(optional(&parts, 6))?;
                Ok((telegram_id, trust_score, created_at, last_login_at))
            })();
            let (telegram_id, trust_score, created_at, last_login_at) = match parsed {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("Skipping user row {id}: {e}");
                    continue;
                }
            };

            let mut user = NewUser::new(id, created_at.unwrap_or(now));
            user.telegram_id = telegram_id;
            user.username = optional(&parts, 2).map(str::to_string);
            user.registration_ip = optional(&parts, 4).map(str::to_string);
            if let Some(score) = trust_score {
                user.trust_score = score;
            }
            self.insert_user(&user)?;
            if let Some(at) = last_login_at {
                self.record_login(id, at)?;
            }
            count += 1;
        }
        Ok(count)
    }

    /// `referrer,referee[,created_at]`. A referee that already has a referrer
    /// keeps it.
    pub fn load_referrals_from_csv(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, Box<dyn Error>> {
        let mut count = 0;
        for parts in rows(path, 3)? {
            let (Some(referrer), Some(referee)) = (optional(&parts, 0), optional(&parts, 1)) else {
                continue;
            };
            if self.referrer_of(referee)?.is_some() {
                warn!("Skipping referral {referrer} -> {referee}: referee already referred");
                continue;
            }
            let at = match timestamp(optional(&parts, 2)) {
                Ok(at) => at.unwrap_or(now),
                Err(e) => {
                    warn!("Skipping referral {referrer} -> {referee}: {e}");
                    continue;
                }
            };
            self.insert_referral(referrer, referee, at)?;
            count += 1;
        }
        Ok(count)
    }

    /// `device_id,user_id[,created_at]`.
    pub fn load_devices_from_csv(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, Box<dyn Error>> {
        let mut count = 0;
        for parts in rows(path, 3)? {
            let (Some(device_id), Some(user_id)) = (optional(&parts, 0), optional(&parts, 1)) else {
                continue;
            };
            let at = match timestamp(optional(&parts, 2)) {
                Ok(at) => at.unwrap_or(now),
                Err(e) => {
                    warn!("Skipping device row {device_id}: {e}");
                    continue;
                }
            };
            self.insert_device_fingerprint(device_id, user_id, at)?;
            count += 1;
        }
        Ok(count)
    }

    /// `user_id,type,amount[,created_at]`, amounts in diram.
    pub fn load_transactions_from_csv(&self, path: &Path, now: DateTime<Utc>) -> Result<usize, Box<dyn Error>> {
        let mut count = 0;
        for parts in rows(path, 4)? {
            let Some(user_id) = optional(&parts, 0) else { continue };
            let parsed = (|| -> Result<_, Box<dyn Error>> {
                let tx_type: TransactionType = parts.get(1).map(String::as_str).unwrap_or_default().parse()?;
                let amount: i64 = parts.get(2).map(String::as_str).unwrap_or_default().parse()?;
                let at = timestamp(optional(&parts, 3))?;
                Ok((tx_type, amount, at))
            })();
            let (tx_type, amount, at) = match parsed {
                Ok(fields) => fields,
                Err(e) => {
                    warn!("Skipping transaction row for {user_id}: {e}");
                    continue;
                }
            };
            self.insert_transaction(user_id, tx_type, amount, at.unwrap_or(now))?;
            count += 1;
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{open_test_db, temp_db_path};
    use chrono::Duration;

    fn write_csv(content: &str) -> std::path::PathBuf {
        let path = temp_db_path().with_extension("csv");
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn blacklist_csv_import() {
        let db = open_test_db();
        let now = Utc::now();
        let path = write_csv(
            "kind,key,reason,expires_at\n\
             ip,203.0.113.7,datacenter range,\n\
             device,dev-9,chargeback ring,2099-01-01T00:00:00Z\n\
             galaxy,x,unknown kind,\n\
             ip,198.51.100.2,bad expiry,tomorrow\n",
        );
        let loaded = db.load_blacklist_from_csv(&path, now).unwrap();
        assert_eq!(loaded, 2);
        assert!(db.is_blacklisted(BlacklistKind::Ip, "203.0.113.7", now).unwrap());
        assert!(db.is_blacklisted(BlacklistKind::Device, "dev-9", now).unwrap());
        assert!(!db.is_blacklisted(BlacklistKind::Ip, "198.51.100.2", now).unwrap());
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn users_csv_seeds_accounts_and_logins() {
        let db = open_test_db();
        let now = Utc::now();
        let path = write_csv(
            "id,telegram_id,username,trust_score,registration_ip,created_at,last_login_at\n\
             u1,1001,alice,15,203.0.113.7,2024-01-01T00:00:00Z,2024-01-02T00:00:00Z\n\
             u2,,,,,,\n\
             u3,not-a-number,carol,,,,\n\
             u1,1001,alice,15,,,\n",
        );
        assert_eq!(db.load_users_from_csv(&path, now).unwrap(), 2);
        assert_eq!(db.account("u1").unwrap().unwrap().trust_score, 15);
        assert_eq!(db.account("u2").unwrap().unwrap().trust_score, 50);
        assert!(!db.user_exists("u3").unwrap());

        // u1 logged in long ago and has low trust, u2 is brand new.
        let zombies = db.zombie_candidates(20, now - Duration::days(30)).unwrap();
        assert_eq!(zombies.len(), 1);
        assert_eq!(zombies[0].user_id, "u1");
        assert!(zombies[0].last_login_at.is_some());

        // Loading again adds nothing.
        assert_eq!(db.load_users_from_csv(&path, now).unwrap(), 0);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn graph_devices_and_transactions_csv() {
        let db = open_test_db();
        let now = Utc::now();
        let referrals = write_csv("referrer,referee,created_at\na,b,\nb,c,2024-05-01T10:00:00Z\nx,b,\n");
        let devices = write_csv("device_id,user_id,created_at\ndev-1,a,\ndev-1,b,\ndev-1,b,\n");
        let transactions = write_csv(
            "user_id,type,amount,created_at\n\
             a,recharge,10000,\n\
             b,purchase,2500,2024-05-01T10:00:00Z\n\
             b,teleport,1,\n\
             c,recharge,lots,\n",
        );

        assert_eq!(db.load_referrals_from_csv(&referrals, now).unwrap(), 2);
        assert_eq!(db.referrer_of("b").unwrap().as_deref(), Some("a"));
        assert_eq!(db.referrer_of("c").unwrap().as_deref(), Some("b"));

        assert_eq!(db.load_devices_from_csv(&devices, now).unwrap(), 3);
        assert_eq!(db.device_users("dev-1").unwrap().len(), 2);

        assert_eq!(db.load_transactions_from_csv(&transactions, now).unwrap(), 2);
        let recharges = db.recharges_since("a", now - Duration::minutes(1)).unwrap();
        assert_eq!(recharges.len(), 1);
        assert_eq!(recharges[0].amount, 10_000);

        for path in [referrals, devices, transactions] {
            let _ = std::fs::remove_file(&path);
        }
    }
}
