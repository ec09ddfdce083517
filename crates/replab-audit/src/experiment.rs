use crate::replication::{audit_replication, AuditPolicy, ReplicationAudit};
use crate::verdict::{ActionRank, Classification, FailureClass, Finding, RepairJob, Verdict};
use replab_core::manifest::{
    experiment_columns, EVENT_LOG_COLUMNS, EVENT_LOG_FILE, EXPERIMENT_RESULTS_FILE,
    FINALIZE_EVENT,
};
use replab_core::naming::RUN_DIR_PREFIX;
use replab_core::ExperimentSpec;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExperimentAudit {
    pub dir: PathBuf,
    pub expected: u32,
    pub replications: Vec<ReplicationAudit>,
    pub missing: Vec<u32>,
    /// Replication directories whose index lies outside `1..=expected`.
    pub ignored: Vec<PathBuf>,
    pub verdict: Verdict,
}

impl ExperimentAudit {
    pub fn valid_count(&self) -> usize {
        self.replications.iter().filter(|r| r.is_valid()).count()
    }

    /// Valid replications keyed by index.
    pub fn valid_dirs(&self) -> BTreeMap<u32, PathBuf> {
        self.replications
            .iter()
            .filter(|r| r.is_valid())
            .filter_map(|r| r.index.map(|i| (i, r.dir.clone())))
            .collect()
    }
}

/// Replication directories directly under `dir`, sorted by name.
pub fn discover_replication_dirs(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .filter(|e| e.file_name().to_string_lossy().starts_with(RUN_DIR_PREFIX))
        .map(|e| e.into_path())
        .collect()
}

pub fn results_table_path(dir: &Path) -> PathBuf {
    dir.join(EXPERIMENT_RESULTS_FILE)
}

pub fn event_log_path(dir: &Path) -> PathBuf {
    dir.join(EVENT_LOG_FILE)
}

/// The experiment results table must carry the exact column set and at
/// least `expected_rows` data rows.
pub fn check_results_table(path: &Path, expected_rows: usize) -> Result<(), String> {
    let meta = std::fs::metadata(path).map_err(|_| "results table missing".to_string())?;
    if meta.len() == 0 {
        return Err("results table is empty".to_string());
    }
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)
        .map_err(|e| format!("results table unreadable: {}", e))?;
    let headers = rdr
        .headers()
        .map_err(|e| format!("results table header unreadable: {}", e))?
        .clone();
    let expected: BTreeSet<&str> = experiment_columns().into_iter().collect();
    let present: BTreeSet<&str> = headers.iter().collect();
    if headers.len() != expected.len() || present != expected {
        return Err("results table columns do not match".to_string());
    }
    let mut rows = 0usize;
    for record in rdr.records() {
        record.map_err(|e| format!("results table row unreadable: {}", e))?;
        rows += 1;
    }
    if rows < expected_rows {
        return Err(format!(
            "results table has {} rows, expected at least {}",
            rows, expected_rows
        ));
    }
    Ok(())
}

/// The event log must end with exactly one finalize row recording
/// `valid_count` replications.
pub fn check_event_log(path: &Path, valid_count: usize) -> Result<(), String> {
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .map_err(|_| "event log missing".to_string())?;
    let headers = rdr
        .headers()
        .map_err(|e| format!("event log header unreadable: {}", e))?
        .clone();
    if !headers.iter().eq(EVENT_LOG_COLUMNS.iter().copied()) {
        return Err("event log header does not match".to_string());
    }
    let mut finalize_rows = 0usize;
    let mut last: Option<csv::StringRecord> = None;
    for record in rdr.records() {
        let record = record.map_err(|e| format!("event log row unreadable: {}", e))?;
        if record.get(1) == Some(FINALIZE_EVENT) {
            finalize_rows += 1;
        }
        last = Some(record);
    }
    let last = last.ok_or_else(|| "event log has no rows".to_string())?;
    if last.get(1) != Some(FINALIZE_EVENT) {
        return Err("event log is not finalized".to_string());
    }
    if finalize_rows != 1 {
        return Err(format!(
            "event log has {} finalize rows, expected 1",
            finalize_rows
        ));
    }
    let expected_detail = format!("replications={}", valid_count);
    if last.get(4) != Some(expected_detail.as_str()) {
        return Err(format!(
            "finalize row records '{}', expected '{}'",
            last.get(4).unwrap_or(""),
            expected_detail
        ));
    }
    Ok(())
}

/// Audit an experiment directory against `spec.replications` expected
/// replications. Read-only and total.
pub fn audit_experiment(dir: &Path, spec: &ExperimentSpec, policy: &AuditPolicy) -> ExperimentAudit {
    let expected = spec.replications;
    let mut replications = Vec::new();
    let mut ignored = Vec::new();
    let mut claimed: BTreeSet<u32> = BTreeSet::new();
    let mut unparsed = Vec::new();

    for path in discover_replication_dirs(dir) {
        let mut audit = audit_replication(&path, spec, policy);
        if !audit.name_parsed {
            unparsed.push(audit);
            continue;
        }
        match audit.index {
            Some(i) if (1..=expected).contains(&i) => {
                if !claimed.insert(i) {
                    audit.findings.push(Finding::new(
                        FailureClass::Name,
                        format!("index {} already owned by another directory", i),
                    ));
                    audit.classification = Classification::Repair {
                        job: RepairJob::FullReplicationRepair {
                            dir: path.clone(),
                            index: None,
                        },
                    };
                }
                replications.push(audit);
            }
            _ => {
                tracing::debug!(dir = %path.display(), "replication index out of range");
                ignored.push(path);
            }
        }
    }
    // Unparsable names only keep a recovered index nobody else owns.
    for mut audit in unparsed {
        let keep = match audit.index {
            Some(i) if (1..=expected).contains(&i) => claimed.insert(i),
            _ => false,
        };
        if !keep {
            audit.index = None;
            audit.classification = Classification::Repair {
                job: RepairJob::FullReplicationRepair {
                    dir: audit.dir.clone(),
                    index: None,
                },
            };
        }
        replications.push(audit);
    }

    let missing: Vec<u32> = (1..=expected).filter(|i| !claimed.contains(i)).collect();
    let verdict = select_verdict(dir, &replications, &missing);
    for r in replications.iter().filter(|r| !r.is_valid()) {
        tracing::debug!(
            dir = %r.dir.display(),
            classification = r.classification.label(),
            findings = r.findings.len(),
            "replication needs action"
        );
    }
    ExperimentAudit {
        dir: dir.to_path_buf(),
        expected,
        replications,
        missing,
        ignored,
        verdict,
    }
}

fn select_verdict(dir: &Path, replications: &[ReplicationAudit], missing: &[u32]) -> Verdict {
    let mut ranks: Vec<ActionRank> = replications
        .iter()
        .filter_map(|r| r.classification.rank())
        .collect();
    if !missing.is_empty() {
        ranks.push(ActionRank::New);
    }
    let Some(best) = ranks.into_iter().min() else {
        return aggregate_verdict(dir, replications.len());
    };
    let of_rank = replications
        .iter()
        .filter(|r| r.classification.rank() == Some(best))
        .map(|r| &r.classification);
    match best {
        ActionRank::SessionRepair | ActionRank::ConfigRepair | ActionRank::FullReplicationRepair => {
            let jobs = of_rank
                .filter_map(|c| match c {
                    Classification::Repair { job } => Some(job.clone()),
                    _ => None,
                })
                .collect();
            Verdict::RepairNeeded { jobs }
        }
        ActionRank::Reprocess => Verdict::ReprocessNeeded {
            units: of_rank
                .filter_map(|c| match c {
                    Classification::Reprocess { diagnosis } => Some(diagnosis.clone()),
                    _ => None,
                })
                .collect(),
        },
        ActionRank::Migration => Verdict::MigrationNeeded {
            units: of_rank
                .filter_map(|c| match c {
                    Classification::Migrate { diagnosis } => Some(diagnosis.clone()),
                    _ => None,
                })
                .collect(),
        },
        ActionRank::New => Verdict::NewNeeded {
            missing: missing.to_vec(),
        },
        ActionRank::Aggregation => aggregate_verdict(dir, replications.len()),
    }
}

fn aggregate_verdict(dir: &Path, valid_count: usize) -> Verdict {
    if let Err(reason) = check_results_table(&results_table_path(dir), valid_count) {
        return Verdict::AggregationNeeded { reason };
    }
    if let Err(reason) = check_event_log(&event_log_path(dir), valid_count) {
        return Verdict::AggregationNeeded { reason };
    }
    Verdict::Complete
}
