//! Ordered stage execution for one replication directory.

use crate::executor::{failed_indices, ConcurrentTaskExecutor};
use crate::process::{build_command, interpret_stage_output, run_with_timeout};
use anyhow::{anyhow, bail, Result};
use replab_audit::checks::{
    check_analysis, check_metrics_file, check_queries, check_report, check_responses,
    check_summary,
};
use replab_core::{ExperimentSpec, FileManifest, StageCommands};
use serde::Serialize;
use std::path::Path;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    BuildInputs,
    ExecuteSessions,
    ProcessOutputs,
    ComputeAnalysis,
    RenderReport,
    CompileSummary,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::BuildInputs,
        Stage::ExecuteSessions,
        Stage::ProcessOutputs,
        Stage::ComputeAnalysis,
        Stage::RenderReport,
        Stage::CompileSummary,
    ];

    pub fn label(self) -> &'static str {
        match self {
            Stage::BuildInputs => "build_inputs",
            Stage::ExecuteSessions => "execute_sessions",
            Stage::ProcessOutputs => "process_outputs",
            Stage::ComputeAnalysis => "compute_analysis",
            Stage::RenderReport => "render_report",
            Stage::CompileSummary => "compile_summary",
        }
    }
}

/// Runs one non-session stage against a replication directory.
pub trait StageInvoker: Send + Sync {
    fn invoke(&self, stage: Stage, run_dir: &Path) -> Result<(), String>;
}

pub struct CommandStageInvoker {
    stages: StageCommands,
    timeout: Duration,
}

impl CommandStageInvoker {
    pub fn new(stages: StageCommands, timeout: Duration) -> Self {
        Self { stages, timeout }
    }

    fn command_for(&self, stage: Stage) -> &[String] {
        match stage {
            Stage::BuildInputs => &self.stages.build_inputs,
            Stage::ExecuteSessions => &self.stages.execute_session,
            Stage::ProcessOutputs => &self.stages.process_outputs,
            Stage::ComputeAnalysis => &self.stages.compute_analysis,
            Stage::RenderReport => &self.stages.render_report,
            Stage::CompileSummary => &self.stages.compile_summary,
        }
    }
}

impl StageInvoker for CommandStageInvoker {
    fn invoke(&self, stage: Stage, run_dir: &Path) -> Result<(), String> {
        if stage == Stage::ExecuteSessions {
            return Err("sessions are dispatched per index, not as a stage".to_string());
        }
        let cmd = build_command(self.command_for(stage), run_dir).map_err(|e| e.to_string())?;
        let output = run_with_timeout(cmd, self.timeout).map_err(|e| e.to_string())?;
        interpret_stage_output(&output, self.timeout)
    }
}

/// How session failures are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPolicy {
    /// Any failed session aborts the pipeline with an error.
    Strict,
    /// Failed sessions end the pipeline early and are reported back.
    Tolerant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSelection {
    /// Every index still missing a response.
    Missing,
    /// The listed indices, restricted to those still missing a response.
    Only(Vec<u32>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    pub start: Stage,
    /// Run every stage from `start` even when its outputs already check out.
    pub force: bool,
    pub sessions: SessionSelection,
    pub policy: SessionPolicy,
}

impl PipelinePlan {
    pub fn full() -> Self {
        Self {
            start: Stage::BuildInputs,
            force: false,
            sessions: SessionSelection::Missing,
            policy: SessionPolicy::Strict,
        }
    }

    pub fn session_repair(indices: Vec<u32>) -> Self {
        Self {
            start: Stage::ExecuteSessions,
            force: false,
            sessions: SessionSelection::Only(indices),
            policy: SessionPolicy::Tolerant,
        }
    }

    /// Rebuild the inputs, then fetch every missing session and redo the
    /// downstream stages. Failed sessions are left for a later repair.
    pub fn rebuild_inputs() -> Self {
        Self {
            start: Stage::BuildInputs,
            force: false,
            sessions: SessionSelection::Missing,
            policy: SessionPolicy::Tolerant,
        }
    }

    pub fn reprocess() -> Self {
        Self {
            start: Stage::ProcessOutputs,
            force: true,
            sessions: SessionSelection::Missing,
            policy: SessionPolicy::Tolerant,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineOutcome {
    pub ran: Vec<Stage>,
    pub skipped: Vec<Stage>,
    /// Session indices that failed under the tolerant policy. When non-empty
    /// the downstream stages were not attempted.
    pub sessions_failed: Vec<u32>,
}

impl PipelineOutcome {
    pub fn is_complete(&self) -> bool {
        self.sessions_failed.is_empty()
    }
}

pub struct StagePipeline {
    spec: ExperimentSpec,
    invoker: Box<dyn StageInvoker>,
    executor: ConcurrentTaskExecutor,
    workers: usize,
}

impl StagePipeline {
    pub fn new(
        spec: ExperimentSpec,
        invoker: Box<dyn StageInvoker>,
        executor: ConcurrentTaskExecutor,
        workers: usize,
    ) -> Self {
        Self {
            spec,
            invoker,
            executor,
            workers,
        }
    }

    pub fn spec(&self) -> &ExperimentSpec {
        &self.spec
    }

    pub fn executor(&self) -> &ConcurrentTaskExecutor {
        &self.executor
    }

    fn manifest(&self) -> FileManifest {
        FileManifest::new(self.spec.trials, self.spec.group_size)
    }

    /// Run the stages selected by `plan` for replication `index` in `dir`.
    pub fn run(&self, dir: &Path, index: u32, plan: &PipelinePlan) -> Result<PipelineOutcome> {
        let manifest = self.manifest();
        let mut outcome = PipelineOutcome::default();
        let mut upstream_ran = false;

        for stage in Stage::ALL.into_iter().filter(|s| *s >= plan.start) {
            if stage == Stage::ExecuteSessions {
                let missing = check_responses(dir, &manifest).missing;
                let todo: Vec<u32> = match &plan.sessions {
                    SessionSelection::Missing => missing,
                    SessionSelection::Only(indices) => indices
                        .iter()
                        .copied()
                        .filter(|i| missing.contains(i))
                        .collect(),
                };
                if todo.is_empty() {
                    outcome.skipped.push(stage);
                    continue;
                }
                let (results, summary) = self.executor.run_sessions(dir, &todo, self.workers);
                let failed = failed_indices(&results);
                if !failed.is_empty() {
                    match plan.policy {
                        SessionPolicy::Strict => bail!(
                            "{} of {} sessions failed for {}: indices {:?}",
                            summary.failed,
                            summary.total,
                            dir.display(),
                            failed
                        ),
                        SessionPolicy::Tolerant => {
                            tracing::warn!(
                                dir = %dir.display(),
                                failed = ?failed,
                                "sessions failed; leaving them for a later session repair"
                            );
                            outcome.ran.push(stage);
                            outcome.sessions_failed = failed;
                            return Ok(outcome);
                        }
                    }
                }
                let still_missing: Vec<u32> = check_responses(dir, &manifest)
                    .missing
                    .into_iter()
                    .filter(|i| todo.contains(i))
                    .collect();
                if !still_missing.is_empty() {
                    bail!(
                        "sessions reported success but responses {:?} are missing in {}",
                        still_missing,
                        dir.display()
                    );
                }
                outcome.ran.push(stage);
                upstream_ran = true;
                continue;
            }

            let expected = self.expected_records(dir, &manifest);
            let current = self.check_stage(stage, dir, index, &manifest, expected);
            if current.is_ok() && !plan.force && !upstream_ran {
                tracing::debug!(stage = stage.label(), dir = %dir.display(), "stage outputs valid; skipping");
                outcome.skipped.push(stage);
                continue;
            }

            tracing::info!(stage = stage.label(), dir = %dir.display(), "running stage");
            let started = Instant::now();
            self.invoker
                .invoke(stage, dir)
                .map_err(|e| anyhow!("stage {} failed for {}: {}", stage.label(), dir.display(), e))?;
            if let Err(problem) = self.check_stage(stage, dir, index, &manifest, expected) {
                bail!(
                    "stage {} reported success but its outputs are invalid in {}: {}",
                    stage.label(),
                    dir.display(),
                    problem
                );
            }
            tracing::info!(
                stage = stage.label(),
                dir = %dir.display(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "stage finished"
            );
            outcome.ran.push(stage);
            upstream_ran = true;
        }
        Ok(outcome)
    }

    /// Trials that have a usable response.
    fn expected_records(&self, dir: &Path, manifest: &FileManifest) -> u32 {
        let missing = check_responses(dir, manifest).missing.len() as u32;
        manifest.trials.saturating_sub(missing)
    }

    fn check_stage(
        &self,
        stage: Stage,
        dir: &Path,
        index: u32,
        manifest: &FileManifest,
        expected: u32,
    ) -> Result<(), String> {
        match stage {
            Stage::BuildInputs => {
                let queries = check_queries(dir, manifest);
                if queries.is_complete() {
                    Ok(())
                } else {
                    Err(format!(
                        "queries missing {:?}, unexpected {:?}",
                        queries.missing, queries.unexpected
                    ))
                }
            }
            Stage::ExecuteSessions => {
                let responses = check_responses(dir, manifest);
                if responses.missing.is_empty() {
                    Ok(())
                } else {
                    Err(format!("responses missing {:?}", responses.missing))
                }
            }
            Stage::ProcessOutputs => check_analysis(dir, manifest, expected),
            Stage::ComputeAnalysis => check_metrics_file(dir, manifest, expected),
            Stage::RenderReport => check_report(dir, expected),
            Stage::CompileSummary => check_summary(dir, manifest, index, expected),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::SessionRunner;
    use replab_core::fixtures;
    use std::sync::{Arc, Mutex};

    struct RecordingInvoker {
        spec: ExperimentSpec,
        index: u32,
        calls: Arc<Mutex<Vec<Stage>>>,
        skip_output: Option<Stage>,
    }

    impl StageInvoker for RecordingInvoker {
        fn invoke(&self, stage: Stage, run_dir: &Path) -> Result<(), String> {
            self.calls.lock().expect("lock").push(stage);
            if self.skip_output == Some(stage) {
                return Ok(());
            }
            let m = fixtures::manifest_for(&self.spec);
            let n = self.spec.trials;
            let res = match stage {
                Stage::BuildInputs => fixtures::write_queries(run_dir, &m),
                Stage::ExecuteSessions => Ok(()),
                Stage::ProcessOutputs => fixtures::write_analysis(run_dir, &m, n),
                Stage::ComputeAnalysis => {
                    fixtures::write_metrics(run_dir, &m, &fixtures::metrics_value(n))
                }
                Stage::RenderReport => {
                    fixtures::write_report(run_dir, "20250601-130000", &fixtures::metrics_value(n))
                        .map(|_| ())
                }
                Stage::CompileSummary => {
                    fixtures::write_summary(run_dir, &m, &self.spec, self.index, n)
                }
            };
            res.map_err(|e| e.to_string())
        }
    }

    struct WritingRunner {
        spec: ExperimentSpec,
        fail: Vec<u32>,
    }

    impl SessionRunner for WritingRunner {
        fn run_session(&self, run_dir: &Path, index: u32) -> Result<(), String> {
            if self.fail.contains(&index) {
                return Err("rate limited".to_string());
            }
            let m = fixtures::manifest_for(&self.spec);
            replab_core::ensure_dir(&m.path(run_dir, replab_core::Artifact::ResponsesDir))
                .map_err(|e| e.to_string())?;
            fixtures::write_response(run_dir, &m, index).map_err(|e| e.to_string())
        }
    }

    fn pipeline(
        spec: &ExperimentSpec,
        fail: Vec<u32>,
        skip_output: Option<Stage>,
    ) -> (StagePipeline, Arc<Mutex<Vec<Stage>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let invoker = RecordingInvoker {
            spec: spec.clone(),
            index: 1,
            calls: Arc::clone(&calls),
            skip_output,
        };
        let runner = Arc::new(WritingRunner {
            spec: spec.clone(),
            fail,
        });
        let executor = ConcurrentTaskExecutor::new(runner, Duration::from_secs(10));
        (
            StagePipeline::new(spec.clone(), Box::new(invoker), executor, 3),
            calls,
        )
    }

    #[test]
    fn full_plan_builds_a_valid_replication() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(4, 1);
        let dir = fixtures::replication_dir(root.path(), &spec, 1);
        replab_core::ensure_dir(&dir).expect("mkdir");
        fixtures::write_snapshot(&dir, &spec, 1).expect("snapshot");
        let (p, calls) = pipeline(&spec, vec![], None);
        let outcome = p.run(&dir, 1, &PipelinePlan::full()).expect("pipeline");
        assert_eq!(outcome.ran, Stage::ALL.to_vec());
        assert!(outcome.skipped.is_empty());
        assert_eq!(calls.lock().expect("lock").len(), 5);
        let audit = replab_audit::audit_replication(&dir, &spec, &Default::default());
        assert!(audit.is_valid(), "{:?}", audit.findings);
    }

    #[test]
    fn valid_outputs_are_skipped() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(3, 1);
        let dir = fixtures::build_valid_replication(root.path(), &spec, 1).expect("fixture");
        let (p, calls) = pipeline(&spec, vec![], None);
        let outcome = p.run(&dir, 1, &PipelinePlan::full()).expect("pipeline");
        assert!(outcome.ran.is_empty());
        assert_eq!(outcome.skipped.len(), 6);
        assert!(calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn session_repair_reruns_only_downstream_of_the_sessions() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(5, 1);
        let dir = fixtures::build_valid_replication(root.path(), &spec, 1).expect("fixture");
        let m = fixtures::manifest_for(&spec);
        std::fs::remove_file(m.path(&dir, replab_core::Artifact::Response(4))).expect("rm");
        let (p, calls) = pipeline(&spec, vec![], None);
        let outcome = p
            .run(&dir, 1, &PipelinePlan::session_repair(vec![4]))
            .expect("pipeline");
        assert_eq!(outcome.ran.first(), Some(&Stage::ExecuteSessions));
        assert_eq!(outcome.ran.len(), 5);
        assert!(!calls.lock().expect("lock").contains(&Stage::BuildInputs));
    }

    #[test]
    fn tolerant_sessions_stop_before_downstream_stages() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(4, 1);
        let dir = fixtures::build_valid_replication(root.path(), &spec, 1).expect("fixture");
        let m = fixtures::manifest_for(&spec);
        std::fs::remove_file(m.path(&dir, replab_core::Artifact::Response(2))).expect("rm");
        let (p, calls) = pipeline(&spec, vec![2], None);
        let outcome = p
            .run(&dir, 1, &PipelinePlan::session_repair(vec![2]))
            .expect("pipeline");
        assert_eq!(outcome.sessions_failed, vec![2]);
        assert!(calls.lock().expect("lock").is_empty());
    }

    #[test]
    fn strict_sessions_turn_failures_into_errors() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(3, 1);
        let dir = fixtures::replication_dir(root.path(), &spec, 1);
        replab_core::ensure_dir(&dir).expect("mkdir");
        let (p, _) = pipeline(&spec, vec![3], None);
        let err = p.run(&dir, 1, &PipelinePlan::full()).expect_err("strict");
        assert!(err.to_string().contains("sessions failed"), "{}", err);
    }

    #[test]
    fn stage_claiming_success_without_outputs_is_a_hard_stop() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(3, 1);
        let dir = fixtures::replication_dir(root.path(), &spec, 1);
        replab_core::ensure_dir(&dir).expect("mkdir");
        let (p, calls) = pipeline(&spec, vec![], Some(Stage::ComputeAnalysis));
        let err = p.run(&dir, 1, &PipelinePlan::full()).expect_err("hard stop");
        assert!(err.to_string().contains("compute_analysis"), "{}", err);
        assert!(!calls.lock().expect("lock").contains(&Stage::RenderReport));
    }
}
