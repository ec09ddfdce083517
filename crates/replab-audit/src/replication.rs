use crate::checks::{
    check_analysis, check_metrics_file, check_queries, check_report, check_responses,
    check_snapshot, check_summary,
};
use crate::verdict::{Classification, Diagnosis, FailureClass, Finding, RepairJob};
use replab_core::naming::recover_index;
use replab_core::{ExperimentSpec, FileManifest, ReplicationName, RuntimeSettings};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuditPolicy {
    /// Distinct independent failure classes in one replication at which it is
    /// classified for migration instead of point repair.
    pub migration_threshold: usize,
}

impl Default for AuditPolicy {
    fn default() -> Self {
        Self {
            migration_threshold: 2,
        }
    }
}

impl From<&RuntimeSettings> for AuditPolicy {
    fn from(rt: &RuntimeSettings) -> Self {
        Self {
            migration_threshold: rt.migration_threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplicationAudit {
    pub dir: PathBuf,
    pub index: Option<u32>,
    /// Whether the directory name parsed; unparsed names never own an index
    /// outright.
    pub name_parsed: bool,
    pub findings: Vec<Finding>,
    pub classification: Classification,
}

impl ReplicationAudit {
    pub fn is_valid(&self) -> bool {
        self.classification.is_valid()
    }
}

fn dir_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn full_repair(dir: &Path, index: Option<u32>) -> Classification {
    Classification::Repair {
        job: RepairJob::FullReplicationRepair {
            dir: dir.to_path_buf(),
            index,
        },
    }
}

/// Classify one replication directory. Read-only and total.
pub fn audit_replication(
    dir: &Path,
    spec: &ExperimentSpec,
    policy: &AuditPolicy,
) -> ReplicationAudit {
    let raw_name = dir_name(dir);
    let name = match ReplicationName::parse(&raw_name) {
        Ok(name) => name,
        Err(e) => {
            let index = recover_index(&raw_name);
            return ReplicationAudit {
                dir: dir.to_path_buf(),
                index,
                name_parsed: false,
                findings: vec![Finding::new(
                    FailureClass::Name,
                    format!("unparsable directory name: {}", e),
                )],
                classification: full_repair(dir, index),
            };
        }
    };
    let index = name.index;
    let audit = |findings: Vec<Finding>, classification: Classification| ReplicationAudit {
        dir: dir.to_path_buf(),
        index: Some(index),
        name_parsed: true,
        findings,
        classification,
    };

    let mismatches = name.mismatches(spec);
    if !mismatches.is_empty() {
        let findings = mismatches
            .into_iter()
            .map(|m| Finding::new(FailureClass::Name, format!("directory name: {}", m)))
            .collect();
        return audit(findings, full_repair(dir, Some(index)));
    }
    if !dir.is_dir() {
        return audit(
            vec![Finding::new(FailureClass::Name, "not a directory")],
            full_repair(dir, Some(index)),
        );
    }

    let manifest = FileManifest::new(spec.trials, spec.group_size);
    let mut findings = Vec::new();
    let mut candidates: Vec<RepairJob> = Vec::new();

    let config_problems = check_snapshot(dir, &manifest, &name);
    if !config_problems.is_empty() {
        findings.extend(
            config_problems
                .into_iter()
                .map(|p| Finding::new(FailureClass::Config, p)),
        );
        candidates.push(RepairJob::ConfigRepair {
            dir: dir.to_path_buf(),
        });
    }

    let queries = check_queries(dir, &manifest);
    if !queries.is_complete() {
        if !queries.missing.is_empty() {
            findings.push(Finding::new(
                FailureClass::Queries,
                format!("missing queries {:?}", queries.missing),
            ));
        }
        if !queries.unexpected.is_empty() {
            findings.push(Finding::new(
                FailureClass::Queries,
                format!("unexpected query files {:?}", queries.unexpected),
            ));
        }
        // Queries are built as one set, so even a partial gap means a rebuild.
        candidates.push(RepairJob::FullReplicationRepair {
            dir: dir.to_path_buf(),
            index: Some(index),
        });
    }

    let responses = check_responses(dir, &manifest);
    if !responses.is_complete() {
        if !responses.missing.is_empty() {
            findings.push(Finding::new(
                FailureClass::Responses,
                format!("missing responses {:?}", responses.missing),
            ));
        }
        if !responses.unexpected.is_empty() {
            findings.push(Finding::new(
                FailureClass::Responses,
                format!("unexpected response files {:?}", responses.unexpected),
            ));
        }
        let everything_missing = responses.missing.len() == manifest.trials as usize;
        if responses.unexpected.is_empty() && !everything_missing {
            candidates.push(RepairJob::SessionRepair {
                dir: dir.to_path_buf(),
                failed_indices: responses.missing.clone(),
            });
        } else {
            candidates.push(RepairJob::FullReplicationRepair {
                dir: dir.to_path_buf(),
                index: Some(index),
            });
        }
    }

    // Nothing worth migrating: an interrupted creation or a failed input build.
    let trials = manifest.trials as usize;
    if trials > 0 && (queries.missing.len() == trials || responses.missing.len() == trials) {
        return audit(findings, full_repair(dir, Some(index)));
    }

    let failing: BTreeSet<FailureClass> = findings.iter().map(|f| f.class).collect();
    if failing.len() >= policy.migration_threshold {
        let diagnosis = Diagnosis {
            dir: dir.to_path_buf(),
            index: Some(index),
            reasons: findings.iter().map(|f| f.to_string()).collect(),
        };
        return audit(findings, Classification::Migrate { diagnosis });
    }
    if let Some(job) = candidates.into_iter().min_by_key(|job| job.rank()) {
        return audit(findings, Classification::Repair { job });
    }

    // Raw inputs are complete; derived artifacts must agree with them.
    let expected = manifest.trials;
    if let Err(e) = check_analysis(dir, &manifest, expected) {
        findings.push(Finding::new(FailureClass::Analysis, e));
    }
    if let Err(e) = check_metrics_file(dir, &manifest, expected) {
        findings.push(Finding::new(FailureClass::Analysis, e));
    }
    if let Err(e) = check_report(dir, expected) {
        findings.push(Finding::new(FailureClass::Report, e));
    }
    if let Err(e) = check_summary(dir, &manifest, index, expected) {
        findings.push(Finding::new(FailureClass::Report, e));
    }
    if findings.is_empty() {
        return audit(findings, Classification::Valid);
    }
    let diagnosis = Diagnosis {
        dir: dir.to_path_buf(),
        index: Some(index),
        reasons: findings.iter().map(|f| f.to_string()).collect(),
    };
    audit(findings, Classification::Reprocess { diagnosis })
}
