pub mod detectors;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::config::DetectionConfig;
use crate::core::DetectionResult;
use crate::db::SharedDatabase;
use detectors::Detector;

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("aggregation query failed: {0}")]
    Store(#[from] rusqlite::Error),
    #[error("{0}")]
    Other(String),
}

/// Outcome of one pass over every detector.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReport {
    /// Detector name to its findings. Failed detectors map to an empty list.
    pub results: BTreeMap<String, Vec<DetectionResult>>,
    /// Detector name to error message.
    pub failures: BTreeMap<String, String>,
}

impl DetectionReport {
    pub fn total(&self) -> usize {
        self.results.values().map(Vec::len).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DetectionResult> {
        self.results.values().flatten()
    }
}

/// Runs the registered detectors against the store.
pub struct BehaviorMonitor {
    db: SharedDatabase,
    detectors: Vec<Box<dyn Detector + Send + Sync>>,
}

impl BehaviorMonitor {
    pub fn new(db: SharedDatabase, config: &DetectionConfig) -> Self {
        Self::with_detectors(db, detectors::default_detectors(config))
    }

    pub fn with_detectors(db: SharedDatabase, detectors: Vec<Box<dyn Detector + Send + Sync>>) -> Self {
        Self { db, detectors }
    }

    pub fn detector_names(&self) -> Vec<&'static str> {
        self.detectors.iter().map(|d| d.name()).collect()
    }

    /// Run a single detector by name. `None` if no such detector is registered.
    pub fn run_detector(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Option<Result<Vec<DetectionResult>, DetectError>> {
        self.detectors
            .iter()
            .find(|d| d.name() == name)
            .map(|d| d.detect(&self.db, now))
    }

    /// Invoke every detector independently. A failing detector is logged and
    /// reported; the others still run.
    pub fn run_all_detections(&self, now: DateTime<Utc>) -> DetectionReport {
        let mut report = DetectionReport::default();
        for detector in &self.detectors {
            let name = detector.name().to_string();
            match detector.detect(&self.db, now) {
                Ok(results) => {
                    if !results.is_empty() {
                        info!(detector = %name, count = results.len(), "Detections recorded");
                    }
                    report.results.insert(name, results);
                }
                Err(e) => {
                    error!(detector = %name, "Detector failed: {e}");
                    report.failures.insert(name.clone(), e.to_string());
                    report.results.insert(name, Vec::new());
                }
            }
        }
        info!(
            total = report.total(),
            failed = report.failures.len(),
            "Detection pass finished"
        );
        report
    }

    /// Remove blacklist entries that have expired. Returns the count removed.
    pub fn cleanup_expired_blacklist(&self, now: DateTime<Utc>) -> Result<usize, rusqlite::Error> {
        let removed = self.db.cleanup_expired_blacklist(now)?;
        if removed > 0 {
            info!("Removed {removed} expired blacklist entries");
        }
        Ok(removed)
    }
}
