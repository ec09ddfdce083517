#![allow(dead_code)]

use replab_audit::checks::check_responses;
use replab_core::{fixtures, Artifact, ControllerConfig, ExperimentSpec, ReplicationName, RuntimeSettings, StageCommands};
use replab_runner::{CancelFlag, ReconciliationController, SessionRunner, Stage, StageInvoker};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// In-process stand-in for the external stage programs.
pub struct FakeStages {
    spec: ExperimentSpec,
    pub failing: Arc<Mutex<BTreeSet<Stage>>>,
    pub calls: Arc<Mutex<Vec<Stage>>>,
}

impl StageInvoker for FakeStages {
    fn invoke(&self, stage: Stage, run_dir: &Path) -> Result<(), String> {
        self.calls.lock().expect("lock").push(stage);
        if self.failing.lock().expect("lock").contains(&stage) {
            return Err(format!("{} crashed", stage.label()));
        }
        let m = fixtures::manifest_for(&self.spec);
        let name = run_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let index = ReplicationName::parse(&name).map_err(|e| e.to_string())?.index;
        let valid = self.spec.trials - check_responses(run_dir, &m).missing.len() as u32;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let res = match stage {
            Stage::BuildInputs => fixtures::write_queries(run_dir, &m),
            Stage::ExecuteSessions => Ok(()),
            Stage::ProcessOutputs => fixtures::write_analysis(run_dir, &m, valid),
            Stage::ComputeAnalysis => {
                fixtures::write_metrics(run_dir, &m, &fixtures::metrics_value(valid))
            }
            Stage::RenderReport => {
                fixtures::write_report(run_dir, &stamp, &fixtures::metrics_value(valid)).map(|_| ())
            }
            Stage::CompileSummary => fixtures::write_summary(run_dir, &m, &self.spec, index, valid),
        };
        res.map_err(|e| e.to_string())
    }
}

/// Raise `flag` once `remaining` more sessions have written their response.
pub struct CancelAfter {
    remaining: usize,
    flag: CancelFlag,
}

/// In-process session program writing a response and its sidecar. Like the
/// real one it needs the trial's query file.
pub struct FakeSessions {
    spec: ExperimentSpec,
    pub failing: Arc<Mutex<BTreeSet<u32>>>,
    pub calls: Arc<Mutex<Vec<u32>>>,
    pub cancel_after: Arc<Mutex<Option<CancelAfter>>>,
}

impl SessionRunner for FakeSessions {
    fn run_session(&self, run_dir: &Path, index: u32) -> Result<(), String> {
        self.calls.lock().expect("lock").push(index);
        if self.failing.lock().expect("lock").contains(&index) {
            return Err("upstream returned 429".to_string());
        }
        let m = fixtures::manifest_for(&self.spec);
        if !m.path(run_dir, Artifact::Query(index)).is_file() {
            return Err(format!("query {} not found", index));
        }
        replab_core::ensure_dir(&m.path(run_dir, Artifact::ResponsesDir))
            .map_err(|e| e.to_string())?;
        fixtures::write_response(run_dir, &m, index).map_err(|e| e.to_string())?;
        if let Some(pending) = self.cancel_after.lock().expect("lock").as_mut() {
            pending.remaining = pending.remaining.saturating_sub(1);
            if pending.remaining == 0 {
                pending.flag.cancel();
            }
        }
        Ok(())
    }
}

pub struct Harness {
    pub root: tempfile::TempDir,
    pub spec: ExperimentSpec,
    pub controller: ReconciliationController,
    pub failing_stages: Arc<Mutex<BTreeSet<Stage>>>,
    pub stage_calls: Arc<Mutex<Vec<Stage>>>,
    pub failing_sessions: Arc<Mutex<BTreeSet<u32>>>,
    pub session_calls: Arc<Mutex<Vec<u32>>>,
    pub cancel_after: Arc<Mutex<Option<CancelAfter>>>,
}

impl Harness {
    pub fn new(trials: u32, replications: u32) -> Self {
        Self::with_workers(trials, replications, 3)
    }

    pub fn with_workers(trials: u32, replications: u32, workers: usize) -> Self {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(trials, replications);
        let config = ControllerConfig {
            experiment: spec.clone(),
            runtime: RuntimeSettings {
                workers,
                session_hard_timeout_seconds: 10,
                max_iterations: 10,
                ..RuntimeSettings::default()
            },
            stages: StageCommands::default(),
        };
        let failing_stages = Arc::new(Mutex::new(BTreeSet::new()));
        let stage_calls = Arc::new(Mutex::new(Vec::new()));
        let failing_sessions = Arc::new(Mutex::new(BTreeSet::new()));
        let session_calls = Arc::new(Mutex::new(Vec::new()));
        let cancel_after = Arc::new(Mutex::new(None));
        let stages = FakeStages {
            spec: spec.clone(),
            failing: Arc::clone(&failing_stages),
            calls: Arc::clone(&stage_calls),
        };
        let sessions = FakeSessions {
            spec: spec.clone(),
            failing: Arc::clone(&failing_sessions),
            calls: Arc::clone(&session_calls),
            cancel_after: Arc::clone(&cancel_after),
        };
        let controller =
            ReconciliationController::new(root.path(), config, Box::new(stages), Arc::new(sessions));
        Self {
            root,
            spec,
            controller,
            failing_stages,
            stage_calls,
            failing_sessions,
            session_calls,
            cancel_after,
        }
    }

    pub fn dir(&self) -> &Path {
        self.root.path()
    }

    pub fn build_valid(&self, index: u32) -> PathBuf {
        fixtures::build_valid_replication(self.dir(), &self.spec, index).expect("fixture")
    }

    /// A replication directory holding only its config snapshot, as left by
    /// a creation interrupted before build-inputs.
    pub fn build_snapshot_only(&self, index: u32) -> PathBuf {
        let dir = fixtures::replication_dir(self.dir(), &self.spec, index);
        replab_core::ensure_dir(&dir).expect("mkdir");
        fixtures::write_snapshot(&dir, &self.spec, index).expect("snapshot");
        dir
    }

    pub fn remove(&self, dir: &Path, artifact: Artifact) {
        let m = fixtures::manifest_for(&self.spec);
        std::fs::remove_file(m.path(dir, artifact)).expect("remove artifact");
    }

    pub fn fail_stage(&self, stage: Stage) {
        self.failing_stages.lock().expect("lock").insert(stage);
    }

    pub fn fail_session(&self, index: u32) {
        self.failing_sessions.lock().expect("lock").insert(index);
    }

    pub fn cancel_after_sessions(&self, count: usize) {
        *self.cancel_after.lock().expect("lock") = Some(CancelAfter {
            remaining: count,
            flag: self.controller.cancel_flag(),
        });
    }

    pub fn session_calls(&self) -> Vec<u32> {
        let mut calls = self.session_calls.lock().expect("lock").clone();
        calls.sort_unstable();
        calls
    }
}

/// Every regular file under `dir` with its contents.
pub fn tree_contents(dir: &Path) -> BTreeMap<PathBuf, Vec<u8>> {
    walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let bytes = std::fs::read(e.path()).expect("read file");
            (e.into_path(), bytes)
        })
        .collect()
}
