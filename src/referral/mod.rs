pub mod cycle;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::db::SharedDatabase;

#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("self-referral is not allowed")]
    SelfReferral,
    #[error("unknown user {0}")]
    UnknownUser(String),
    #[error("user {0} already has a referrer")]
    AlreadyReferred(String),
    #[error("binding would close a referral loop: {}", .0.join(" -> "))]
    WouldCycle(Vec<String>),
    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Record `referrer -> referee` unless it would break the referral tree.
pub fn bind_referral(
    db: &SharedDatabase,
    referrer: &str,
    referee: &str,
    max_depth: usize,
    now: DateTime<Utc>,
) -> Result<(), BindError> {
    if referrer == referee {
        return Err(BindError::SelfReferral);
    }
    for user in [referrer, referee] {
        if !db.user_exists(user)? {
            return Err(BindError::UnknownUser(user.to_string()));
        }
    }
    if db.referrer_of(referee)?.is_some() {
        return Err(BindError::AlreadyReferred(referee.to_string()));
    }

    if let Some(path) = loop_closed_by(db, referrer, referee, max_depth)? {
        warn!(%referrer, %referee, "Rejected referral binding that would close a loop");
        return Err(BindError::WouldCycle(path));
    }

    db.insert_referral(referrer, referee, now)?;
    info!(%referrer, %referee, "Referral bound");
    Ok(())
}

/// The loop `referee … referrer → referee` that a new edge would close, if the
/// referrer already sits below the referee.
fn loop_closed_by(
    db: &SharedDatabase,
    referrer: &str,
    referee: &str,
    max_depth: usize,
) -> Result<Option<Vec<String>>, rusqlite::Error> {
    let below = db.referral_path(referee, referrer, max_depth.saturating_sub(1))?;
    Ok(below.map(|mut path| {
        path.push(referee.to_string());
        path
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tests::{add_user, open_test_db};

    #[test]
    fn binds_new_referee() {
        let db = open_test_db();
        let now = Utc::now();
        add_user(&db, "a", now);
        add_user(&db, "b", now);
        bind_referral(&db, "a", "b", 15, now).unwrap();
        assert_eq!(db.referrer_of("b").unwrap().as_deref(), Some("a"));
    }

    #[test]
    fn rejects_loop() {
        let db = open_test_db();
        let now = Utc::now();
        for user in ["a", "b", "c"] {
            add_user(&db, user, now);
        }
        bind_referral(&db, "a", "b", 15, now).unwrap();
        bind_referral(&db, "b", "c", 15, now).unwrap();

        match bind_referral(&db, "c", "a", 15, now) {
            Err(BindError::WouldCycle(path)) => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("expected WouldCycle, got {other:?}"),
        }
        assert_eq!(db.referrer_of("a").unwrap(), None);
    }

    #[test]
    fn loop_longer_than_depth_is_not_rejected() {
        let db = open_test_db();
        let now = Utc::now();
        for user in ["a", "b", "c"] {
            add_user(&db, user, now);
        }
        bind_referral(&db, "a", "b", 15, now).unwrap();
        bind_referral(&db, "b", "c", 15, now).unwrap();

        // c -> a would close a 3-edge loop, beyond a bound of 2.
        bind_referral(&db, "c", "a", 2, now).unwrap();
        assert_eq!(db.referrer_of("a").unwrap().as_deref(), Some("c"));
    }

    #[test]
    fn rejects_self_unknown_and_rebinding() {
        let db = open_test_db();
        let now = Utc::now();
        add_user(&db, "a", now);
        add_user(&db, "b", now);
        add_user(&db, "c", now);
        assert!(matches!(bind_referral(&db, "a", "a", 15, now), Err(BindError::SelfReferral)));
        assert!(matches!(
            bind_referral(&db, "a", "ghost", 15, now),
            Err(BindError::UnknownUser(u)) if u == "ghost"
        ));
        bind_referral(&db, "a", "b", 15, now).unwrap();
        assert!(matches!(
            bind_referral(&db, "c", "b", 15, now),
            Err(BindError::AlreadyReferred(_))
        ));
    }
}
