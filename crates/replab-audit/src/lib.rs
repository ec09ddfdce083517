//! Read-only classification of replication and experiment directories.
//!
//! The audit derives the next action purely from what is on disk. It never
//! mutates and never fails: unreadable artifacts are reported as missing or
//! corrupt.

pub mod checks;
pub mod experiment;
pub mod replication;
pub mod verdict;

pub use experiment::{
    audit_experiment, check_event_log, check_results_table, discover_replication_dirs,
    event_log_path, results_table_path, ExperimentAudit,
};
pub use replication::{audit_replication, AuditPolicy, ReplicationAudit};
pub use verdict::{
    ActionRank, Classification, Diagnosis, FailureClass, Finding, RepairJob, Verdict,
};
