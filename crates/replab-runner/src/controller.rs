//! Audit-driven reconciliation loop for one experiment directory.
//!
//! Each iteration audits the experiment, applies the single action class the
//! verdict selects, and audits again. Every action is idempotent: applying it
//! to a unit that no longer needs it changes nothing, so re-running the loop
//! after an interruption converges to the same state.

use crate::aggregate;
use crate::event_log::EventLog;
use crate::executor::{CancelFlag, CommandSessionRunner, ConcurrentTaskExecutor, SessionRunner};
use crate::pipeline::{CommandStageInvoker, PipelinePlan, StageInvoker, StagePipeline};
use anyhow::{anyhow, bail, Result};
use chrono::Local;
use replab_audit::checks::{check_queries, check_responses, check_snapshot};
use replab_audit::{
    audit_experiment, audit_replication, discover_replication_dirs, AuditPolicy, Diagnosis,
    ExperimentAudit, RepairJob, Verdict,
};
use replab_core::manifest::{is_report_name, parse_query_name, parse_response_name, ResponseFile};
use replab_core::{
    ensure_dir, remove_dir_if_exists, remove_file_if_exists, Artifact, ConfigSnapshot,
    ControllerConfig, FileManifest, ReplicationName,
};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileStatus {
    Converged,
    /// The verdict did not change across an iteration.
    Stalled,
    /// Every action of the last batch failed.
    Failed,
    IterationLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActionRecord {
    pub action: String,
    pub replication: Option<u32>,
    pub dir: Option<PathBuf>,
    pub success: bool,
    pub detail: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReconcileOutcome {
    pub status: ReconcileStatus,
    pub final_verdict: Verdict,
    pub iterations: usize,
    pub actions: Vec<ActionRecord>,
}

impl ReconcileOutcome {
    pub fn is_converged(&self) -> bool {
        self.status == ReconcileStatus::Converged
    }
}

pub struct ReconciliationController {
    exp_dir: PathBuf,
    config: ControllerConfig,
    policy: AuditPolicy,
    pipeline: StagePipeline,
    log: EventLog,
}

impl ReconciliationController {
    pub fn new(
        exp_dir: &Path,
        config: ControllerConfig,
        invoker: Box<dyn StageInvoker>,
        runner: Arc<dyn SessionRunner>,
    ) -> Self {
        let executor =
            ConcurrentTaskExecutor::new(runner, config.runtime.session_hard_timeout());
        let pipeline = StagePipeline::new(
            config.experiment.clone(),
            invoker,
            executor,
            config.runtime.workers,
        );
        Self {
            exp_dir: exp_dir.to_path_buf(),
            policy: AuditPolicy::from(&config.runtime),
            log: EventLog::for_experiment(exp_dir),
            config,
            pipeline,
        }
    }

    /// Controller backed by the external stage programs named in the config.
    pub fn from_config(exp_dir: &Path, config: ControllerConfig) -> Self {
        let invoker = CommandStageInvoker::new(config.stages.clone(), config.runtime.stage_timeout());
        let runner = CommandSessionRunner::new(
            config.stages.execute_session.clone(),
            config.runtime.session_timeout(),
        );
        Self::new(exp_dir, config, Box::new(invoker), Arc::new(runner))
    }

    /// Flag that stops the loop before its next audit and abandons
    /// outstanding sessions. Only library callers can set it.
    pub fn cancel_flag(&self) -> CancelFlag {
        self.pipeline.executor().cancel_flag()
    }

    pub fn experiment_dir(&self) -> &Path {
        &self.exp_dir
    }

    fn manifest(&self) -> FileManifest {
        FileManifest::new(self.config.experiment.trials, self.config.experiment.group_size)
    }

    pub fn audit(&self) -> ExperimentAudit {
        audit_experiment(&self.exp_dir, &self.config.experiment, &self.policy)
    }

    /// Audit and act until the experiment is complete, the verdict stops
    /// changing, a batch fails outright, or the iteration budget runs out.
    /// Errors are returned only for failed creations and event log I/O.
    pub fn reconcile(&self) -> Result<ReconcileOutcome> {
        let mut actions = Vec::new();
        let mut previous: Option<Verdict> = None;
        let max_iterations = self.config.runtime.max_iterations;
        let cancel = self.cancel_flag();

        for iteration in 1..=max_iterations {
            if cancel.is_cancelled() {
                bail!("reconcile cancelled");
            }
            let audit = self.audit();
            tracing::info!(
                dir = %self.exp_dir.display(),
                iteration,
                verdict = %audit.verdict,
                "audited experiment"
            );
            let verdict = audit.verdict.clone();
            if verdict.is_complete() {
                return Ok(ReconcileOutcome {
                    status: ReconcileStatus::Converged,
                    final_verdict: verdict,
                    iterations: iteration,
                    actions,
                });
            }
            if previous.as_ref() == Some(&verdict) {
                tracing::warn!(verdict = %verdict, "verdict unchanged after acting; stopping");
                return Ok(ReconcileOutcome {
                    status: ReconcileStatus::Stalled,
                    final_verdict: verdict,
                    iterations: iteration,
                    actions,
                });
            }

            let batch = self.dispatch(&audit)?;
            let attempted = batch.len();
            let succeeded = batch.iter().filter(|r| r.success).count();
            actions.extend(batch);
            if attempted > 0 && succeeded == 0 {
                tracing::error!(verdict = %verdict, attempted, "every action in the batch failed");
                return Ok(ReconcileOutcome {
                    status: ReconcileStatus::Failed,
                    final_verdict: verdict,
                    iterations: iteration,
                    actions,
                });
            }
            previous = Some(verdict);
        }

        let verdict = self.audit().verdict;
        let status = if verdict.is_complete() {
            ReconcileStatus::Converged
        } else {
            ReconcileStatus::IterationLimit
        };
        Ok(ReconcileOutcome {
            status,
            final_verdict: verdict,
            iterations: max_iterations,
            actions,
        })
    }

    fn dispatch(&self, audit: &ExperimentAudit) -> Result<Vec<ActionRecord>> {
        let mut records = Vec::new();
        match &audit.verdict {
            Verdict::Complete => {}
            Verdict::NewNeeded { missing } => {
                for index in missing {
                    if let Some(record) = self.create_replication(*index)? {
                        let failed = !record.success;
                        let detail = record.detail.clone();
                        records.push(record);
                        if failed {
                            bail!("creating replication {} failed: {}", index, detail);
                        }
                    }
                }
            }
            Verdict::RepairNeeded { jobs } => {
                for job in jobs {
                    if let Some(record) = self.apply_repair(job, audit)? {
                        records.push(record);
                    }
                }
            }
            Verdict::ReprocessNeeded { units } => {
                for unit in units {
                    records.extend(self.reprocess(unit)?);
                }
            }
            Verdict::MigrationNeeded { units } => {
                for unit in units {
                    records.extend(self.migrate(unit)?);
                }
            }
            Verdict::AggregationNeeded { .. } => {
                records.push(self.aggregate_audited(audit)?);
            }
        }
        Ok(records)
    }

    pub fn apply_repair(&self, job: &RepairJob, audit: &ExperimentAudit) -> Result<Option<ActionRecord>> {
        let index = audit
            .replications
            .iter()
            .find(|r| r.dir.as_path() == job.dir())
            .and_then(|r| r.index);
        match job {
            RepairJob::SessionRepair {
                dir,
                failed_indices,
            } => {
                let index = index.ok_or_else(|| anyhow!("no index for {}", dir.display()))?;
                self.repair_sessions(dir, index, failed_indices)
            }
            RepairJob::ConfigRepair { dir } => {
                let index = index.ok_or_else(|| anyhow!("no index for {}", dir.display()))?;
                self.repair_config(dir, index)
            }
            RepairJob::FullReplicationRepair { dir, index } => self.rebuild(dir, *index),
        }
    }

    /// Run `f` as a logged action. The event log gets a `started` row before
    /// and an `ok` or `failed` row after; `Err` is reserved for log I/O.
    fn run_action<F>(
        &self,
        action: &str,
        replication: Option<u32>,
        dir: Option<&Path>,
        detail: &str,
        f: F,
    ) -> Result<ActionRecord>
    where
        F: FnOnce() -> Result<String>,
    {
        tracing::info!(
            action,
            replication = ?replication,
            dir = %dir.map(|d| d.display().to_string()).unwrap_or_default(),
            detail,
            "starting action"
        );
        self.log.append(action, replication, "started", detail)?;
        let started = Instant::now();
        let result = f();
        let elapsed_ms = started.elapsed().as_millis() as u64;
        let (success, detail) = match result {
            Ok(summary) => {
                tracing::info!(action, replication = ?replication, elapsed_ms, "action finished");
                (true, summary)
            }
            Err(e) => {
                let detail = format!("{:#}", e);
                tracing::warn!(
                    action,
                    replication = ?replication,
                    elapsed_ms,
                    error = %detail,
                    "action failed"
                );
                self.log.append(action, replication, "failed", &detail)?;
                (false, detail)
            }
        };
        if success {
            self.log.append(action, replication, "ok", &detail)?;
        }
        Ok(ActionRecord {
            action: action.to_string(),
            replication,
            dir: dir.map(Path::to_path_buf),
            success,
            detail,
            elapsed_ms,
        })
    }

    /// Directory whose parsed name owns `index`, if any.
    fn owner_of(&self, index: u32) -> Option<PathBuf> {
        discover_replication_dirs(&self.exp_dir).into_iter().find(|dir| {
            dir.file_name()
                .and_then(|n| ReplicationName::parse(&n.to_string_lossy()).ok())
                .map(|name| name.index == index)
                .unwrap_or(false)
        })
    }

    fn build_replication(&self, index: u32) -> Result<String> {
        let spec = &self.config.experiment;
        let name = ReplicationName::for_spec(spec, index, Local::now().naive_local());
        let dir = self.exp_dir.join(name.to_string());
        ensure_dir(&dir)?;
        ConfigSnapshot::for_spec(spec, index)
            .write(&self.manifest().path(&dir, Artifact::ConfigSnapshot))?;
        let outcome = self.pipeline.run(&dir, index, &PipelinePlan::full())?;
        Ok(format!("dir={} stages={}", name, outcome.ran.len()))
    }

    /// Create replication `index` with a fresh timestamped directory and run
    /// the full pipeline. No-op when a directory already owns the index.
    pub fn create_replication(&self, index: u32) -> Result<Option<ActionRecord>> {
        if let Some(existing) = self.owner_of(index) {
            tracing::debug!(index, dir = %existing.display(), "replication already exists");
            return Ok(None);
        }
        let record = self.run_action("new_replication", Some(index), None, "", || {
            self.build_replication(index)
        })?;
        Ok(Some(record))
    }

    pub fn repair_sessions(
        &self,
        dir: &Path,
        index: u32,
        failed_indices: &[u32],
    ) -> Result<Option<ActionRecord>> {
        let missing = check_responses(dir, &self.manifest()).missing;
        let todo: Vec<u32> = failed_indices
            .iter()
            .copied()
            .filter(|i| missing.contains(i))
            .collect();
        if todo.is_empty() {
            tracing::debug!(dir = %dir.display(), "no sessions left to repair");
            return Ok(None);
        }
        let detail = format!("indices={:?}", todo);
        let record = self.run_action("session_repair", Some(index), Some(dir), &detail, || {
            let outcome = self
                .pipeline
                .run(dir, index, &PipelinePlan::session_repair(todo.clone()))?;
            if !outcome.is_complete() {
                bail!("sessions {:?} failed", outcome.sessions_failed);
            }
            Ok(format!("repaired={:?} stages={}", todo, outcome.ran.len()))
        })?;
        Ok(Some(record))
    }

    pub fn repair_config(&self, dir: &Path, index: u32) -> Result<Option<ActionRecord>> {
        let raw = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let name = ReplicationName::parse(&raw)?;
        if check_snapshot(dir, &self.manifest(), &name).is_empty() {
            tracing::debug!(dir = %dir.display(), "config snapshot already valid");
            return Ok(None);
        }
        let record = self.run_action("config_repair", Some(index), Some(dir), "", || {
            ConfigSnapshot::for_spec(&self.config.experiment, index)
                .write(&self.manifest().path(dir, Artifact::ConfigSnapshot))?;
            Ok("snapshot rewritten".to_string())
        })?;
        Ok(Some(record))
    }

    /// Delete the directory and, when the index is known and now unowned,
    /// recreate it from scratch.
    pub fn rebuild(&self, dir: &Path, index: Option<u32>) -> Result<Option<ActionRecord>> {
        if !dir.exists() {
            let recreate = index.filter(|i| self.owner_of(*i).is_none());
            let Some(i) = recreate else {
                return Ok(None);
            };
            return self.create_replication(i);
        }
        let record = self.run_action("full_replication_repair", index, Some(dir), "", || {
            remove_dir_if_exists(dir)?;
            match index {
                Some(i) if self.owner_of(i).is_none() => self.build_replication(i),
                Some(i) => Ok(format!("removed; index {} owned elsewhere", i)),
                None => Ok("removed".to_string()),
            }
        })?;
        Ok(Some(record))
    }

    fn drop_derived(&self, dir: &Path) -> Result<()> {
        let manifest = self.manifest();
        remove_dir_if_exists(&manifest.path(dir, Artifact::AnalysisDir))?;
        remove_file_if_exists(&manifest.path(dir, Artifact::ResultSummary))?;
        let reports = WalkDir::new(dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| is_report_name(&e.file_name().to_string_lossy()));
        for report in reports {
            remove_file_if_exists(report.path())?;
        }
        Ok(())
    }

    fn still_needs_work(&self, unit: &Diagnosis) -> bool {
        unit.dir.is_dir() && !audit_replication(&unit.dir, &self.config.experiment, &self.policy).is_valid()
    }

    pub fn reprocess(&self, unit: &Diagnosis) -> Result<Option<ActionRecord>> {
        if !self.still_needs_work(unit) {
            return Ok(None);
        }
        let index = unit
            .index
            .ok_or_else(|| anyhow!("no index for {}", unit.dir.display()))?;
        let dir = unit.dir.as_path();
        let detail = unit.reasons.join("; ");
        let record = self.run_action("reprocess", Some(index), Some(dir), &detail, || {
            self.drop_derived(dir)?;
            let outcome = self.pipeline.run(dir, index, &PipelinePlan::reprocess())?;
            Ok(format!("stages={}", outcome.ran.len()))
        })?;
        Ok(Some(record))
    }

    /// Remove query and response files the manifest does not name, and both
    /// halves of any response whose partner is missing or corrupt.
    fn prune_strays(&self, dir: &Path) -> Result<usize> {
        let manifest = self.manifest();
        let trials = 1..=manifest.trials;
        let mut removed = 0usize;

        let queries_dir = manifest.path(dir, Artifact::QueriesDir);
        if queries_dir.is_dir() {
            for entry in fs::read_dir(&queries_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                if !parse_query_name(&name).map(|i| trials.contains(&i)).unwrap_or(false)
                    && remove_file_if_exists(&entry.path())?
                {
                    removed += 1;
                }
            }
        }

        let responses_dir = manifest.path(dir, Artifact::ResponsesDir);
        if responses_dir.is_dir() {
            for entry in fs::read_dir(&responses_dir)? {
                let entry = entry?;
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let in_range = match parse_response_name(&name) {
                    Some(ResponseFile::Response(i)) | Some(ResponseFile::Sidecar(i)) => {
                        trials.contains(&i)
                    }
                    None => false,
                };
                if !in_range && remove_file_if_exists(&entry.path())? {
                    removed += 1;
                }
            }
        }
        for i in check_responses(dir, &manifest).missing {
            for half in [Artifact::Response(i), Artifact::ResponseSidecar(i)] {
                if remove_file_if_exists(&manifest.path(dir, half))? {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    pub fn migrate(&self, unit: &Diagnosis) -> Result<Option<ActionRecord>> {
        if !self.still_needs_work(unit) {
            return Ok(None);
        }
        let index = unit
            .index
            .ok_or_else(|| anyhow!("no index for {}", unit.dir.display()))?;
        let dir = unit.dir.as_path();
        let detail = unit.reasons.join("; ");
        let record = self.run_action("migration", Some(index), Some(dir), &detail, || {
            let manifest = self.manifest();
            ConfigSnapshot::for_spec(&self.config.experiment, index)
                .write(&manifest.path(dir, Artifact::ConfigSnapshot))?;
            self.drop_derived(dir)?;
            let pruned = self.prune_strays(dir)?;
            let missing = check_responses(dir, &manifest).missing;
            let plan = if !check_queries(dir, &manifest).is_complete() {
                PipelinePlan::rebuild_inputs()
            } else if missing.is_empty() {
                PipelinePlan::reprocess()
            } else {
                PipelinePlan::session_repair(missing)
            };
            let outcome = self.pipeline.run(dir, index, &plan)?;
            if !outcome.is_complete() {
                bail!(
                    "migrated structure but sessions {:?} failed",
                    outcome.sessions_failed
                );
            }
            Ok(format!("pruned={} stages={}", pruned, outcome.ran.len()))
        })?;
        Ok(Some(record))
    }

    fn aggregate_audited(&self, audit: &ExperimentAudit) -> Result<ActionRecord> {
        let valid = audit.valid_dirs();
        let detail = format!("replications={}", valid.len());
        tracing::info!(dir = %self.exp_dir.display(), replications = valid.len(), "starting aggregation");
        self.log.append("aggregate", None, "started", &detail)?;
        let started = Instant::now();
        let result = aggregate::aggregate(&self.exp_dir, &valid);
        let elapsed_ms = started.elapsed().as_millis() as u64;
        // A successful aggregation ends with the finalize row, so nothing is
        // appended after it.
        let (success, detail) = match result {
            Ok(rows) => (true, format!("rows={}", rows)),
            Err(e) => {
                let detail = format!("{:#}", e);
                tracing::warn!(error = %detail, "aggregation failed");
                self.log.append("aggregate", None, "failed", &detail)?;
                (false, detail)
            }
        };
        Ok(ActionRecord {
            action: "aggregate".to_string(),
            replication: None,
            dir: Some(self.exp_dir.clone()),
            success,
            detail,
            elapsed_ms,
        })
    }

    /// Rebuild the experiment table from whatever replications are currently
    /// valid, regardless of the verdict.
    pub fn aggregate(&self) -> Result<ActionRecord> {
        self.aggregate_audited(&self.audit())
    }
}
