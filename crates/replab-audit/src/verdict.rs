use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Independent ways in which a replication can be broken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Name,
    Config,
    Queries,
    Responses,
    Analysis,
    Report,
}

impl FailureClass {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Name => "name",
            FailureClass::Config => "config",
            FailureClass::Queries => "queries",
            FailureClass::Responses => "responses",
            FailureClass::Analysis => "analysis",
            FailureClass::Report => "report",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Finding {
    pub class: FailureClass,
    pub detail: String,
}

impl Finding {
    pub fn new(class: FailureClass, detail: impl Into<String>) -> Self {
        Self {
            class,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.class.as_str(), self.detail)
    }
}

/// Action classes ordered from the cheapest, most local fix to the most
/// global one. The experiment verdict always selects the lowest rank present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActionRank {
    SessionRepair,
    ConfigRepair,
    Reprocess,
    FullReplicationRepair,
    Migration,
    New,
    Aggregation,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RepairJob {
    SessionRepair {
        dir: PathBuf,
        failed_indices: Vec<u32>,
    },
    ConfigRepair {
        dir: PathBuf,
    },
    /// `index` is `None` when the directory's index cannot be recovered or is
    /// already owned by another directory; such a directory is only removed.
    FullReplicationRepair {
        dir: PathBuf,
        index: Option<u32>,
    },
}

impl RepairJob {
    pub fn dir(&self) -> &Path {
        match self {
            RepairJob::SessionRepair { dir, .. }
            | RepairJob::ConfigRepair { dir }
            | RepairJob::FullReplicationRepair { dir, .. } => dir,
        }
    }

    pub fn rank(&self) -> ActionRank {
        match self {
            RepairJob::SessionRepair { .. } => ActionRank::SessionRepair,
            RepairJob::ConfigRepair { .. } => ActionRank::ConfigRepair,
            RepairJob::FullReplicationRepair { .. } => ActionRank::FullReplicationRepair,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            RepairJob::SessionRepair { .. } => "session_repair",
            RepairJob::ConfigRepair { .. } => "config_repair",
            RepairJob::FullReplicationRepair { .. } => "full_replication_repair",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnosis {
    pub dir: PathBuf,
    pub index: Option<u32>,
    pub reasons: Vec<String>,
}

/// Per-replication outcome of the audit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Classification {
    Valid,
    Repair { job: RepairJob },
    Reprocess { diagnosis: Diagnosis },
    Migrate { diagnosis: Diagnosis },
}

impl Classification {
    pub fn rank(&self) -> Option<ActionRank> {
        match self {
            Classification::Valid => None,
            Classification::Repair { job } => Some(job.rank()),
            Classification::Reprocess { .. } => Some(ActionRank::Reprocess),
            Classification::Migrate { .. } => Some(ActionRank::Migration),
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Classification::Valid)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Classification::Valid => "valid",
            Classification::Repair { job } => job.label(),
            Classification::Reprocess { .. } => "reprocess",
            Classification::Migrate { .. } => "migrate",
        }
    }
}

/// Classified state of an experiment directory; selects the next action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum Verdict {
    Complete,
    NewNeeded { missing: Vec<u32> },
    RepairNeeded { jobs: Vec<RepairJob> },
    ReprocessNeeded { units: Vec<Diagnosis> },
    MigrationNeeded { units: Vec<Diagnosis> },
    AggregationNeeded { reason: String },
}

impl Verdict {
    pub fn tag(&self) -> &'static str {
        match self {
            Verdict::Complete => "complete",
            Verdict::NewNeeded { .. } => "new_needed",
            Verdict::RepairNeeded { .. } => "repair_needed",
            Verdict::ReprocessNeeded { .. } => "reprocess_needed",
            Verdict::MigrationNeeded { .. } => "migration_needed",
            Verdict::AggregationNeeded { .. } => "aggregation_needed",
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, Verdict::Complete)
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Complete => write!(f, "complete"),
            Verdict::NewNeeded { missing } => write!(f, "new_needed: indices {:?}", missing),
            Verdict::RepairNeeded { jobs } => {
                write!(f, "repair_needed:")?;
                for job in jobs {
                    match job {
                        RepairJob::SessionRepair {
                            dir,
                            failed_indices,
                        } => write!(
                            f,
                            " session_repair({}, {:?})",
                            display_name(dir),
                            failed_indices
                        )?,
                        RepairJob::ConfigRepair { dir } => {
                            write!(f, " config_repair({})", display_name(dir))?
                        }
                        RepairJob::FullReplicationRepair { dir, index } => write!(
                            f,
                            " full_replication_repair({}, index={})",
                            display_name(dir),
                            index.map(|i| i.to_string()).unwrap_or_else(|| "none".into())
                        )?,
                    }
                }
                Ok(())
            }
            Verdict::ReprocessNeeded { units } => {
                write!(f, "reprocess_needed:")?;
                for unit in units {
                    write!(f, " {} ({})", display_name(&unit.dir), unit.reasons.join("; "))?;
                }
                Ok(())
            }
            Verdict::MigrationNeeded { units } => {
                write!(f, "migration_needed:")?;
                for unit in units {
                    write!(f, " {} ({})", display_name(&unit.dir), unit.reasons.join("; "))?;
                }
                Ok(())
            }
            Verdict::AggregationNeeded { reason } => write!(f, "aggregation_needed: {}", reason),
        }
    }
}

fn display_name(dir: &Path) -> String {
    dir.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| dir.display().to_string())
}
