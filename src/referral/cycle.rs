use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::db::{REFEREE_BATCH_SIZE, SharedDatabase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleAlgorithm {
    /// One recursive common-table-expression query.
    Recursive,
    /// Breadth-first walk, one query per level.
    Iterative,
}

#[derive(Debug, thiserror::Error)]
pub enum CycleError {
    #[error("user id must not be empty")]
    EmptyUserId,
    #[error("referral graph query failed: {0}")]
    Store(#[from] rusqlite::Error),
}

/// Result of a walk from `start` looking for a way back to it.
///
/// When found, `path` starts and ends with `start`: `[A, B, A]` for the loop
/// A→B→A, `[A, A]` for a self-loop edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleCheck {
    pub found: bool,
    pub path: Vec<String>,
    pub query_count: usize,
    pub elapsed: Duration,
    pub algorithm: CycleAlgorithm,
    pub max_depth: usize,
}

impl CycleCheck {
    fn finish(
        path: Option<Vec<String>>,
        query_count: usize,
        started: Instant,
        algorithm: CycleAlgorithm,
        max_depth: usize,
    ) -> Self {
        Self {
            found: path.is_some(),
            path: path.unwrap_or_default(),
            query_count,
            elapsed: started.elapsed(),
            algorithm,
            max_depth,
        }
    }

    /// Number of referral edges in the loop, 0 when none was found.
    pub fn loop_length(&self) -> usize {
        self.path.len().saturating_sub(1)
    }
}

/// Both variants over the same input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleBenchmark {
    pub iterations: usize,
    pub recursive: CycleCheck,
    pub iterative: CycleCheck,
    pub recursive_avg: Duration,
    pub iterative_avg: Duration,
    /// Same `found` and same path length.
    pub agree: bool,
}

/// Check the ids and drop a `target` equal to `start`, which asks the same
/// question as no target at all.
fn loop_target<'a>(start: &str, target: Option<&'a str>) -> Result<Option<&'a str>, CycleError> {
    if start.is_empty() || target.is_some_and(str::is_empty) {
        return Err(CycleError::EmptyUserId);
    }
    Ok(target.filter(|t| *t != start))
}

/// Is there a referral loop through `start` of at most `max_depth` edges?
///
/// With a `target`, the loop must reach `target` and return to `start` from
/// it. Exceeding `max_depth` is a plain "not found".
pub fn detect_cycle(
    db: &SharedDatabase,
    start: &str,
    target: Option<&str>,
    max_depth: usize,
    algorithm: CycleAlgorithm,
) -> Result<CycleCheck, CycleError> {
    match algorithm {
        CycleAlgorithm::Recursive => detect_cycle_recursive(db, start, target, max_depth),
        CycleAlgorithm::Iterative => detect_cycle_iterative(db, start, target, max_depth),
    }
}

pub fn detect_cycle_recursive(
    db: &SharedDatabase,
    start: &str,
    target: Option<&str>,
    max_depth: usize,
) -> Result<CycleCheck, CycleError> {
    let through = loop_target(start, target)?;
    let started = Instant::now();
    let path = db.referral_loop(start, through, max_depth)?;
    Ok(CycleCheck::finish(path, 1, started, CycleAlgorithm::Recursive, max_depth))
}

pub fn detect_cycle_iterative(
    db: &SharedDatabase,
    start: &str,
    target: Option<&str>,
    max_depth: usize,
) -> Result<CycleCheck, CycleError> {
    let through = loop_target(start, target)?;
    let started = Instant::now();

    let mut visited: HashSet<String> = HashSet::from([start.to_string()]);
    let mut parent: HashMap<String, String> = HashMap::new();
    let mut frontier = vec![start.to_string()];
    let mut query_count = 0;

    // Level `depth` holds users `depth` edges below start; an edge back from
    // them closes a loop of `depth + 1` edges.
    for depth in 0..max_depth {
        if frontier.is_empty() {
            break;
        }
        let edges = db.referees_of(&frontier)?;
        query_count += frontier.len().div_ceil(REFEREE_BATCH_SIZE);

        let mut next = Vec::new();
        for (referrer, referee) in edges {
            if referee == start {
                if through.is_none_or(|t| t == referrer) {
                    let mut path = unwind(&parent, start, &referrer);
                    path.push(start.to_string());
                    debug!(%start, length = depth + 1, "Referral loop found");
                    return Ok(CycleCheck::finish(
                        Some(path),
                        query_count,
                        started,
                        CycleAlgorithm::Iterative,
                        max_depth,
                    ));
                }
                continue;
            }
            // Past the target nothing can close the loop from it.
            if through == Some(referrer.as_str()) || !visited.insert(referee.clone()) {
                continue;
            }
            parent.insert(referee.clone(), referrer);
            next.push(referee);
        }
        frontier = next;
    }

    Ok(CycleCheck::finish(None, query_count, started, CycleAlgorithm::Iterative, max_depth))
}

fn unwind(parent: &HashMap<String, String>, start: &str, last: &str) -> Vec<String> {
    let mut path = vec![last.to_string()];
    let mut node = last;
    while node != start {
        match parent.get(node) {
            Some(prev) => {
                path.push(prev.clone());
                node = prev.as_str();
            }
            None => break,
        }
    }
    path.reverse();
    path
}

/// Run both variants `iterations` times and compare them.
pub fn benchmark_cycle_detection(
    db: &SharedDatabase,
    start: &str,
    target: Option<&str>,
    max_depth: usize,
    iterations: usize,
) -> Result<CycleBenchmark, CycleError> {
    let iterations = iterations.max(1);
    let mut recursive_total = Duration::ZERO;
    let mut iterative_total = Duration::ZERO;
    let mut recursive = detect_cycle_recursive(db, start, target, max_depth)?;
    let mut iterative = detect_cycle_iterative(db, start, target, max_depth)?;
    recursive_total += recursive.elapsed;
    iterative_total += iterative.elapsed;

    for _ in 1..iterations {
        recursive = detect_cycle_recursive(db, start, target, max_depth)?;
        iterative = detect_cycle_iterative(db, start, target, max_depth)?;
        recursive_total += recursive.elapsed;
        iterative_total += iterative.elapsed;
    }

    let agree = recursive.found == iterative.found && recursive.path.len() == iterative.path.len();
    Ok(CycleBenchmark {
        iterations,
        recursive_avg: recursive_total / iterations as u32,
        iterative_avg: iterative_total / iterations as u32,
        recursive,
        iterative,
        agree,
    })
}
