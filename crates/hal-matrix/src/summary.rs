//! Result aggregation for a matrix run.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{MatrixError, MatrixResult};
use crate::runner::JobResult;

/// Shared completion counter and result list for one run.
///
/// Workers call [`ProgressTracker::record`] as their jobs finish; every
/// read-modify-write happens under one lock so completion numbers are
/// strictly increasing.
#[derive(Debug)]
pub struct ProgressTracker {
    total: usize,
    order: HashMap<String, usize>,
    state: Mutex<TrackerState>,
}

#[derive(Debug, Default)]
struct TrackerState {
    completed: usize,
    results: Vec<JobResult>,
}

impl ProgressTracker {
    /// Track `profile_names`, given in generation order.
    pub fn new<I, S>(profile_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let order: HashMap<String, usize> = profile_names
            .into_iter()
            .enumerate()
            .map(|(i, name)| (name.into(), i))
            .collect();
        Self {
            total: order.len(),
            order,
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn completed(&self) -> usize {
        self.lock().completed
    }

    /// Record a finished job and call `notify(completed, total, result)`
    /// while still holding the lock. Returns the new completed count.
    pub fn record<F>(&self, result: JobResult, notify: F) -> usize
    where
        F: FnOnce(usize, usize, &JobResult),
    {
        let mut state = self.lock();
        state.completed += 1;
        let completed = state.completed;
        notify(completed, self.total, &result);
        state.results.push(result);
        completed
    }

    /// Whether a result has already been recorded for `profile_name`.
    pub fn has_result(&self, profile_name: &str) -> bool {
        self.lock()
            .results
            .iter()
            .any(|r| r.profile_name == profile_name)
    }

    /// Snapshot the recorded results as a summary, in generation order.
    pub fn summarize(&self, mode: &str, started_at: DateTime<Utc>) -> MatrixRunSummary {
        let mut results = self.lock().results.clone();
        results.sort_by_key(|r| self.order.get(&r.profile_name).copied().unwrap_or(usize::MAX));
        MatrixRunSummary::from_results(mode, results, started_at, Utc::now())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Aggregate outcome of a matrix run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixRunSummary {
    pub mode: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Non-success results, in generation order.
    pub failures: Vec<JobResult>,
    /// Every result, in generation order.
    pub results: Vec<JobResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl MatrixRunSummary {
    pub fn from_results(
        mode: &str,
        results: Vec<JobResult>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        let failures: Vec<JobResult> = results.iter().filter(|r| !r.passed()).cloned().collect();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            mode: mode.to_string(),
            total: results.len(),
            succeeded: results.len() - failures.len(),
            failed: failures.len(),
            failures,
            results,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }

    /// `0` when every profile succeeded, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.all_passed() {
            0
        } else {
            1
        }
    }

    /// Human-readable summary block listing every failure and its log.
    pub fn render(&self) -> String {
        let rule = "=".repeat(60);
        let mut out = format!(
            "{rule}\n\
             Build matrix summary ({mode})\n\
             {rule}\n\
             Total:     {total}\n\
             Succeeded: {succeeded}\n\
             Failed:    {failed}\n\
             Duration:  {secs:.1}s\n",
            mode = self.mode,
            total = self.total,
            succeeded = self.succeeded,
            failed = self.failed,
            secs = self.duration_ms as f64 / 1000.0,
        );

        if !self.failures.is_empty() {
            out.push_str("\nFailures:\n");
            for failure in &self.failures {
                out.push_str(&format!(
                    "  [{}] {}\n      log: {}\n",
                    failure.status.tag(),
                    failure.profile_name,
                    failure.log_file.display()
                ));
            }
        }
        out
    }

    /// Write the summary as pretty-printed JSON.
    pub async fn write_report(&self, path: &Path) -> MatrixResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, json)
            .await
            .map_err(|e| MatrixError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::JobStatus;
    use std::path::PathBuf;

    fn result(name: &str, status: JobStatus) -> JobResult {
        JobResult {
            profile_name: name.to_string(),
            status,
            log_file: PathBuf::from(format!("build-matrix/{name}/log")),
            exit_code: match status {
                JobStatus::Success => Some(0),
                JobStatus::Failure => Some(2),
                _ => None,
            },
            duration_ms: 10,
            detail: None,
        }
    }

    #[test]
    fn test_counts_and_exit_code() {
        let now = Utc::now();
        let summary = MatrixRunSummary::from_results(
            "build",
            vec![
                result("a", JobStatus::Success),
                result("b", JobStatus::Failure),
                result("c", JobStatus::Timeout),
                result("d", JobStatus::Success),
            ],
            now,
            now,
        );
        assert_eq!(summary.total, 4);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.succeeded + summary.failed, summary.total);
        assert_eq!(summary.exit_code(), 1);
        let names: Vec<&str> = summary.failures.iter().map(|f| f.profile_name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
    }

    #[test]
    fn test_all_passed_exits_zero() {
        let now = Utc::now();
        let summary =
            MatrixRunSummary::from_results("package", vec![result("a", JobStatus::Success)], now, now);
        assert!(summary.all_passed());
        assert_eq!(summary.exit_code(), 0);
        assert!(!summary.render().contains("Failures:"));
    }

    #[test]
    fn test_render_lists_failure_logs() {
        let now = Utc::now();
        let summary = MatrixRunSummary::from_results(
            "build",
            vec![
                result("cortex-m4-gcc-12.3-Debug", JobStatus::InternalError),
                result("cortex-m4-gcc-12.3-Release", JobStatus::Success),
            ],
            now,
            now,
        );
        let text = summary.render();
        assert!(text.contains("Total:     2"));
        assert!(text.contains("Failed:    1"));
        assert!(text.contains("[error] cortex-m4-gcc-12.3-Debug"));
        assert!(text.contains("log: build-matrix/cortex-m4-gcc-12.3-Debug/log"));
    }

    #[test]
    fn test_tracker_orders_results_by_generation() {
        let tracker = ProgressTracker::new(["first", "second", "third"]);
        let mut seen = Vec::new();
        for name in ["third", "first", "second"] {
            tracker.record(result(name, JobStatus::Success), |done, total, r| {
                seen.push(format!("[{done}/{total}] {}", r.profile_name));
            });
        }
        assert_eq!(seen, vec!["[1/3] third", "[2/3] first", "[3/3] second"]);
        assert_eq!(tracker.completed(), 3);
        assert!(tracker.has_result("second"));

        let summary = tracker.summarize("build", Utc::now());
        let names: Vec<&str> = summary.results.iter().map(|r| r.profile_name.as_str()).collect();
        assert_eq!(names, vec!["first", "second", "third"]);
    }

    #[test]
    fn test_tracker_is_shared_across_threads() {
        let names: Vec<String> = (0..64).map(|i| format!("p{i}")).collect();
        let tracker = std::sync::Arc::new(ProgressTracker::new(names.clone()));

        let handles: Vec<_> = names
            .into_iter()
            .map(|name| {
                let tracker = std::sync::Arc::clone(&tracker);
                std::thread::spawn(move || {
                    tracker.record(result(&name, JobStatus::Success), |_, _, _| {});
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(tracker.completed(), 64);
        assert_eq!(tracker.summarize("build", Utc::now()).total, 64);
    }

    #[tokio::test]
    async fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.json");
        let now = Utc::now();
        let summary =
            MatrixRunSummary::from_results("build", vec![result("a", JobStatus::Failure)], now, now);

        summary.write_report(&path).await.unwrap();
        let back: MatrixRunSummary =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back.failed, 1);
        assert_eq!(back.failures[0].status, JobStatus::Failure);
    }
}
