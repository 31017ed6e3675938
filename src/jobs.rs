use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::alerts::AlertNotifier;
use crate::config::Config;
use crate::db::SharedDatabase;
use crate::monitor::{BehaviorMonitor, DetectionReport};
use crate::rewards::{BatchOutcome, RewardError, RewardProcessor};

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Rewards(#[from] RewardError),
    #[error("database error: {0}")]
    Store(#[from] rusqlite::Error),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupSummary {
    pub blacklist_removed: usize,
    pub rewards_removed: usize,
}

/// The three periodic passes, runnable once from the CLI or on a schedule.
#[derive(Clone)]
pub struct Jobs {
    monitor: Arc<BehaviorMonitor>,
    rewards: RewardProcessor,
    alerts: Arc<AlertNotifier>,
    config: Config,
}

impl Jobs {
    pub fn new(db: SharedDatabase, config: &Config) -> Self {
        Self {
            monitor: Arc::new(BehaviorMonitor::new(db.clone(), &config.detection)),
            rewards: RewardProcessor::new(db, config.rewards.clone()),
            alerts: Arc::new(AlertNotifier::new(&config.alerts)),
            config: config.clone(),
        }
    }

    pub fn monitor(&self) -> &BehaviorMonitor {
        &self.monitor
    }

    pub fn rewards(&self) -> &RewardProcessor {
        &self.rewards
    }

    /// Run every detector and alert on the high-risk findings.
    pub fn detection_pass(&self, now: DateTime<Utc>) -> DetectionReport {
        let report = self.monitor.run_all_detections(now);
        let raised = self.alerts.notify_all(report.iter());
        if raised > 0 {
            info!("Raised {raised} fraud alerts");
        }
        report
    }

    /// Requeue abandoned claims, then credit whatever is due.
    pub fn reward_pass(&self, now: DateTime<Utc>) -> Result<BatchOutcome, JobError> {
        self.rewards.recover_stale_processing(now)?;
        Ok(self.rewards.process_batch(now)?)
    }

    /// Drop expired blacklist entries and finished rewards older than `reward_days`.
    pub fn cleanup_pass(&self, reward_days: i64, now: DateTime<Utc>) -> Result<CleanupSummary, JobError> {
        Ok(CleanupSummary {
            blacklist_removed: self.monitor.cleanup_expired_blacklist(now)?,
            rewards_removed: self.rewards.cleanup_expired_rewards(reward_days, now)?,
        })
    }

    /// Drive the passes on their intervals until Ctrl-C. A pass in flight
    /// finishes before the loop exits.
    pub async fn run(self) {
        let jobs = &self.config.jobs;
        let mut detection = interval(jobs.detection_interval_secs);
        let mut rewards = interval(jobs.reward_interval_secs);
        let mut cleanup = interval(jobs.cleanup_interval_secs);

        info!(
            detection_secs = jobs.detection_interval_secs,
            reward_secs = jobs.reward_interval_secs,
            cleanup_secs = jobs.cleanup_interval_secs,
            "Job runner started"
        );

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = detection.tick() => {
                    let runner = self.clone();
                    match tokio::task::spawn_blocking(move || runner.detection_pass(Utc::now())).await {
                        Ok(report) => debug!(total = report.total(), "Detection pass done"),
                        Err(e) => error!("Detection pass aborted: {e}"),
                    }
                }
                _ = rewards.tick() => {
                    let runner = self.clone();
                    match tokio::task::spawn_blocking(move || runner.reward_pass(Utc::now())).await {
                        Ok(Ok(outcome)) => debug!(total = outcome.total, "Reward pass done"),
                        Ok(Err(e)) => error!("Reward pass failed: {e}"),
                        Err(e) => error!("Reward pass aborted: {e}"),
                    }
                }
                _ = cleanup.tick() => {
                    let runner = self.clone();
                    let days = self.config.rewards.cleanup_after_days;
                    match tokio::task::spawn_blocking(move || runner.cleanup_pass(days, Utc::now())).await {
                        Ok(Ok(summary)) => debug!(?summary, "Cleanup pass done"),
                        Ok(Err(e)) => error!("Cleanup pass failed: {e}"),
                        Err(e) => error!("Cleanup pass aborted: {e}"),
                    }
                }
                result = &mut shutdown => {
                    if let Err(e) = result {
                        error!("Failed to listen for Ctrl-C: {e}");
                    }
                    info!("Shutdown requested, stopping job runner");
                    break;
                }
            }
        }
    }
}

fn interval(secs: u64) -> tokio::time::Interval {
    let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{BlacklistEntry, BlacklistKind, DetectionType, RewardType};
    use crate::db::NewUser;
    use crate::db::tests::{add_user, open_test_db};
    use crate::rewards::NewDelayedReward;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn detection_pass_records_batch_registration() {
        let db = open_test_db();
        let now = Utc::now();
        for i in 0..11 {
            let mut user = NewUser::new(format!("bot{i}"), now - ChronoDuration::hours(1));
            user.registration_ip = Some("203.0.113.7".into());
            db.insert_user(&user).unwrap();
        }
        let jobs = Jobs::new(db.clone(), &Config::default());

        let report = jobs.detection_pass(now);
        let found = &report.results["batchRegistration"];
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].detection_type, DetectionType::BatchRegistration);
        assert!(db.is_blacklisted(BlacklistKind::Ip, "203.0.113.7", now).unwrap());
    }

    #[test]
    fn reward_pass_recovers_and_credits() {
        let db = open_test_db();
        let now = Utc::now();
        add_user(&db, "u1", now);
        let jobs = Jobs::new(db.clone(), &Config::default());
        let stuck = jobs
            .rewards()
            .create_delayed_reward(NewDelayedReward::new("u1", RewardType::ReferralRegister, 75), now)
            .unwrap();
        jobs.rewards()
            .create_delayed_reward(NewDelayedReward::new("u1", RewardType::ReferralFirstPlay, 25), now)
            .unwrap();
        assert!(db.claim_reward(&stuck.id, now).unwrap());

        let later = now + ChronoDuration::minutes(15);
        let outcome = jobs.reward_pass(later).unwrap();
        assert_eq!(outcome.success, 2);
        assert_eq!(db.account("u1").unwrap().unwrap().balance, 100);
    }

    #[test]
    fn cleanup_pass_sweeps_blacklist_and_rewards() {
        let db = open_test_db();
        let now = Utc::now();
        db.insert_blacklist(
            &BlacklistEntry {
                kind: BlacklistKind::Ip,
                key: "198.51.100.1".into(),
                reason: "batch registration".into(),
                expires_at: Some(now - ChronoDuration::hours(1)),
            },
            now - ChronoDuration::days(8),
        )
        .unwrap();
        let jobs = Jobs::new(db, &Config::default());

        let summary = jobs.cleanup_pass(30, now).unwrap();
        assert_eq!(
            summary,
            CleanupSummary {
                blacklist_removed: 1,
                rewards_removed: 0
            }
        );
    }
}
