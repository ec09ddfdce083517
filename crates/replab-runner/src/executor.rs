//! Bounded worker pool for per-trial sessions.
//!
//! Each worker pulls indices from a shared queue and waits on its session
//! with a hard deadline that is independent of whatever timeout or retry
//! policy the session itself applies. A session past the deadline is
//! abandoned, not killed; the files it already wrote stay valid. The worker
//! that abandoned it retires, so abandoned sessions never push the number of
//! live sessions above the worker count.

use crate::process::{build_command, interpret_stage_output, run_with_timeout};
use serde::Serialize;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const TIMEOUT_DIAGNOSTIC: &str = "timeout";
pub const CANCELLED_DIAGNOSTIC: &str = "cancelled";
pub const NOT_DISPATCHED_DIAGNOSTIC: &str = "not dispatched";

const CANCEL_POLL: Duration = Duration::from_millis(50);

/// One external session call for one trial index.
pub trait SessionRunner: Send + Sync {
    fn run_session(&self, run_dir: &Path, index: u32) -> Result<(), String>;
}

/// Invokes `<execute_session...> --run-dir <dir> --index <i>` and applies the
/// stage token contract to its output.
pub struct CommandSessionRunner {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandSessionRunner {
    pub fn new(command: Vec<String>, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl SessionRunner for CommandSessionRunner {
    fn run_session(&self, run_dir: &Path, index: u32) -> Result<(), String> {
        let mut cmd = build_command(&self.command, run_dir).map_err(|e| e.to_string())?;
        cmd.arg("--index").arg(index.to_string());
        cmd.env("REPLAB_INDEX", index.to_string());
        let output = run_with_timeout(cmd, self.timeout).map_err(|e| e.to_string())?;
        interpret_stage_output(&output, self.timeout)
    }
}

/// Cooperative interrupt shared with the workers. Callers that drive the
/// executor from their own code set it; the `replab` binary never does, and a
/// killed process leaves only files that were already written whole.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskResult {
    pub index: u32,
    pub success: bool,
    pub diagnostic: Option<String>,
    pub elapsed: Duration,
}

impl TaskResult {
    fn failed(index: u32, diagnostic: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            index,
            success: false,
            diagnostic: Some(diagnostic.into()),
            elapsed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Sum of per-session durations.
    pub cumulative: Duration,
    pub wall_clock: Duration,
}

impl BatchSummary {
    fn from_results(results: &[TaskResult], wall_clock: Duration) -> Self {
        let succeeded = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            succeeded,
            failed: results.len() - succeeded,
            cumulative: results.iter().map(|r| r.elapsed).sum(),
            wall_clock,
        }
    }
}

pub fn failed_indices(results: &[TaskResult]) -> Vec<u32> {
    results
        .iter()
        .filter(|r| !r.success)
        .map(|r| r.index)
        .collect()
}

/// Remaining time if the outstanding sessions take the running average and
/// spread evenly across the workers.
pub fn estimate_remaining(cumulative: Duration, done: usize, total: usize, workers: usize) -> Duration {
    if done == 0 || done >= total || workers == 0 {
        return Duration::ZERO;
    }
    let average = cumulative.as_secs_f64() / done as f64;
    let remaining = (total - done) as f64;
    Duration::from_secs_f64(average * remaining / workers as f64)
}

#[derive(Debug, Default)]
struct Progress {
    done: usize,
    cumulative: Duration,
}

pub struct ConcurrentTaskExecutor {
    runner: Arc<dyn SessionRunner>,
    hard_timeout: Duration,
    cancel: CancelFlag,
}

impl ConcurrentTaskExecutor {
    pub fn new(runner: Arc<dyn SessionRunner>, hard_timeout: Duration) -> Self {
        Self {
            runner,
            hard_timeout,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Run one session per index on `workers` threads. Blocks until every
    /// index has a result; the returned list holds exactly one result per
    /// requested index, sorted by index.
    pub fn run_sessions(
        &self,
        run_dir: &Path,
        indices: &[u32],
        workers: usize,
    ) -> (Vec<TaskResult>, BatchSummary) {
        let started = Instant::now();
        let requested: BTreeSet<u32> = indices.iter().copied().collect();
        let total = requested.len();
        if total == 0 {
            return (Vec::new(), BatchSummary::default());
        }
        let worker_count = workers.max(1).min(total);
        let queue = Arc::new(Mutex::new(requested.iter().copied().collect::<VecDeque<u32>>()));
        let progress = Arc::new(Mutex::new(Progress::default()));
        let (tx, rx) = mpsc::channel::<TaskResult>();

        tracing::info!(
            dir = %run_dir.display(),
            sessions = total,
            workers = worker_count,
            "dispatching sessions"
        );

        let mut handles = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count {
            let ctx = WorkerContext {
                queue: Arc::clone(&queue),
                progress: Arc::clone(&progress),
                results: tx.clone(),
                runner: Arc::clone(&self.runner),
                cancel: self.cancel.clone(),
                run_dir: run_dir.to_path_buf(),
                hard_timeout: self.hard_timeout,
                total,
                workers: worker_count,
            };
            match thread::Builder::new()
                .name(format!("session-worker-{}", worker_id))
                .spawn(move || ctx.run())
            {
                Ok(handle) => handles.push(handle),
                Err(e) => tracing::error!(worker_id, error = %e, "failed to spawn session worker"),
            }
        }
        drop(tx);

        let mut results: Vec<TaskResult> = rx.iter().collect();
        for handle in handles {
            let _ = handle.join();
        }

        // Anything never dispatched: cancel, retired workers, or no worker
        // could start.
        let seen: BTreeSet<u32> = results.iter().map(|r| r.index).collect();
        let reason = if self.cancel.is_cancelled() {
            CANCELLED_DIAGNOSTIC
        } else {
            NOT_DISPATCHED_DIAGNOSTIC
        };
        for index in requested.difference(&seen) {
            results.push(TaskResult::failed(*index, reason, Duration::ZERO));
        }
        results.sort_by_key(|r| r.index);

        let summary = BatchSummary::from_results(&results, started.elapsed());
        tracing::info!(
            dir = %run_dir.display(),
            succeeded = summary.succeeded,
            failed = summary.failed,
            wall_clock_ms = summary.wall_clock.as_millis() as u64,
            "session batch finished"
        );
        (results, summary)
    }
}

/// Result of one dispatch; `abandoned` is set when the session thread may
/// still be running.
struct Settled {
    result: TaskResult,
    abandoned: bool,
}

impl Settled {
    fn finished(result: TaskResult) -> Self {
        Self {
            result,
            abandoned: false,
        }
    }

    fn abandoned(result: TaskResult) -> Self {
        Self {
            result,
            abandoned: true,
        }
    }
}

struct WorkerContext {
    queue: Arc<Mutex<VecDeque<u32>>>,
    progress: Arc<Mutex<Progress>>,
    results: mpsc::Sender<TaskResult>,
    runner: Arc<dyn SessionRunner>,
    cancel: CancelFlag,
    run_dir: PathBuf,
    hard_timeout: Duration,
    total: usize,
    workers: usize,
}

impl WorkerContext {
    fn run(self) {
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = self
                .queue
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .pop_front();
            let Some(index) = next else {
                break;
            };
            let settled = self.run_one(index);
            let abandoned = settled.abandoned;
            self.record(&settled.result);
            if self.results.send(settled.result).is_err() {
                break;
            }
            if abandoned {
                // The abandoned session still occupies this slot.
                tracing::warn!(index, "retiring worker while its abandoned session runs");
                break;
            }
        }
    }

    fn run_one(&self, index: u32) -> Settled {
        let start = Instant::now();
        let (done_tx, done_rx) = mpsc::channel();
        let runner = Arc::clone(&self.runner);
        let run_dir = self.run_dir.clone();
        let spawned = thread::Builder::new()
            .name(format!("session-{}", index))
            .spawn(move || {
                let outcome = runner.run_session(&run_dir, index);
                let _ = done_tx.send(outcome);
            });
        if let Err(e) = spawned {
            return Settled::finished(TaskResult::failed(
                index,
                format!("spawn failed: {}", e),
                start.elapsed(),
            ));
        }

        let deadline = start + self.hard_timeout;
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(index, "session exceeded hard timeout; abandoning");
                return Settled::abandoned(TaskResult::failed(
                    index,
                    TIMEOUT_DIAGNOSTIC,
                    start.elapsed(),
                ));
            }
            if self.cancel.is_cancelled() {
                return Settled::abandoned(TaskResult::failed(
                    index,
                    CANCELLED_DIAGNOSTIC,
                    start.elapsed(),
                ));
            }
            match done_rx.recv_timeout((deadline - now).min(CANCEL_POLL)) {
                Ok(Ok(())) => {
                    return Settled::finished(TaskResult {
                        index,
                        success: true,
                        diagnostic: None,
                        elapsed: start.elapsed(),
                    })
                }
                Ok(Err(diagnostic)) => {
                    return Settled::finished(TaskResult::failed(index, diagnostic, start.elapsed()));
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Settled::finished(TaskResult::failed(
                        index,
                        "session panicked",
                        start.elapsed(),
                    ));
                }
            }
        }
    }

    fn record(&self, result: &TaskResult) {
        let (done, eta) = {
            let mut p = self
                .progress
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            p.done += 1;
            p.cumulative += result.elapsed;
            (
                p.done,
                estimate_remaining(p.cumulative, p.done, self.total, self.workers),
            )
        };
        if result.success {
            tracing::info!(
                index = result.index,
                done,
                total = self.total,
                elapsed_ms = result.elapsed.as_millis() as u64,
                eta_s = eta.as_secs(),
                "session finished"
            );
        } else {
            tracing::warn!(
                index = result.index,
                done,
                total = self.total,
                diagnostic = result.diagnostic.as_deref().unwrap_or(""),
                eta_s = eta.as_secs(),
                "session failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRunner {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl SessionRunner for CountingRunner {
        fn run_session(&self, _run_dir: &Path, index: u32) -> Result<(), String> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            if index % 7 == 0 {
                Err(format!("index {} rejected", index))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn never_exceeds_worker_bound_and_returns_every_result() {
        let runner = Arc::new(CountingRunner {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(10),
        });
        let executor = ConcurrentTaskExecutor::new(runner.clone(), Duration::from_secs(10));
        let indices: Vec<u32> = (1..=50).collect();
        let (results, summary) = executor.run_sessions(Path::new("/unused"), &indices, 5);
        assert_eq!(results.len(), 50);
        assert_eq!(
            results.iter().map(|r| r.index).collect::<Vec<_>>(),
            indices
        );
        assert!(runner.peak.load(Ordering::SeqCst) <= 5);
        assert!(runner.peak.load(Ordering::SeqCst) >= 2);
        assert_eq!(summary.failed, 7);
        assert_eq!(failed_indices(&results), vec![7, 14, 21, 28, 35, 42, 49]);
    }

    struct StallingRunner;

    impl SessionRunner for StallingRunner {
        fn run_session(&self, _run_dir: &Path, index: u32) -> Result<(), String> {
            if index == 2 {
                thread::sleep(Duration::from_secs(2));
            }
            Ok(())
        }
    }

    #[test]
    fn hard_timeout_synthesizes_failure_without_blocking_others() {
        let executor =
            ConcurrentTaskExecutor::new(Arc::new(StallingRunner), Duration::from_millis(200));
        let started = Instant::now();
        let (results, summary) = executor.run_sessions(Path::new("/unused"), &[1, 2, 3, 4], 2);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 4);
        assert_eq!(summary.succeeded, 3);
        let timed_out = &results[1];
        assert_eq!(timed_out.index, 2);
        assert!(!timed_out.success);
        assert_eq!(timed_out.diagnostic.as_deref(), Some(TIMEOUT_DIAGNOSTIC));
    }

    #[test]
    fn abandoned_sessions_keep_the_worker_bound() {
        let runner = Arc::new(CountingRunner {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(800),
        });
        let executor = ConcurrentTaskExecutor::new(runner.clone(), Duration::from_millis(100));
        let indices: Vec<u32> = (1..=50).collect();
        let (results, summary) = executor.run_sessions(Path::new("/unused"), &indices, 5);
        assert_eq!(results.len(), 50);
        assert_eq!(summary.succeeded, 0);
        let timed_out = results
            .iter()
            .filter(|r| r.diagnostic.as_deref() == Some(TIMEOUT_DIAGNOSTIC))
            .count();
        assert_eq!(timed_out, 5);
        assert!(results
            .iter()
            .filter(|r| r.diagnostic.as_deref() != Some(TIMEOUT_DIAGNOSTIC))
            .all(|r| r.diagnostic.as_deref() == Some(NOT_DISPATCHED_DIAGNOSTIC)));
        // Let the abandoned sessions drain before reading the peak.
        thread::sleep(Duration::from_millis(1000));
        assert_eq!(runner.in_flight.load(Ordering::SeqCst), 0);
        assert!(runner.peak.load(Ordering::SeqCst) <= 5);
    }

    #[test]
    fn cancelled_batch_reports_every_index() {
        let executor = ConcurrentTaskExecutor::new(Arc::new(StallingRunner), Duration::from_secs(5));
        let flag = executor.cancel_flag();
        flag.cancel();
        let (results, summary) = executor.run_sessions(Path::new("/unused"), &[1, 2, 3], 3);
        assert_eq!(results.len(), 3);
        assert_eq!(summary.succeeded, 0);
        assert!(results
            .iter()
            .all(|r| r.diagnostic.as_deref() == Some(CANCELLED_DIAGNOSTIC)));
    }

    #[test]
    fn duplicate_indices_run_once() {
        let runner = Arc::new(CountingRunner {
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            delay: Duration::from_millis(1),
        });
        let executor = ConcurrentTaskExecutor::new(runner, Duration::from_secs(5));
        let (results, _) = executor.run_sessions(Path::new("/unused"), &[3, 3, 1], 4);
        assert_eq!(results.iter().map(|r| r.index).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn eta_scales_with_remaining_work() {
        let eta = estimate_remaining(Duration::from_secs(10), 5, 15, 2);
        assert_eq!(eta, Duration::from_secs(10));
        assert_eq!(estimate_remaining(Duration::ZERO, 0, 10, 2), Duration::ZERO);
    }
}
