//! Experiment-level results table.

use crate::event_log::EventLog;
use anyhow::{anyhow, bail, Context, Result};
use replab_audit::results_table_path;
use replab_core::manifest::{experiment_columns, RESULT_SUMMARY_FILE, SUMMARY_COLUMNS};
use replab_core::atomic_write_bytes;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

fn summary_record(dir: &Path) -> Result<csv::StringRecord> {
    let path = dir.join(RESULT_SUMMARY_FILE);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(&path)
        .with_context(|| format!("read {}", path.display()))?;
    let headers = rdr.headers()?.clone();
    if !headers.iter().eq(SUMMARY_COLUMNS.iter().copied()) {
        bail!("unexpected summary header in {}", path.display());
    }
    rdr.records()
        .next()
        .ok_or_else(|| anyhow!("no summary row in {}", path.display()))?
        .with_context(|| format!("parse {}", path.display()))
}

/// Rewrite the results table with one row per replication in index order.
/// Returns the number of rows written.
pub fn write_results_table(exp_dir: &Path, replications: &BTreeMap<u32, PathBuf>) -> Result<usize> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(experiment_columns())?;
    for dir in replications.values() {
        let record = summary_record(dir)?;
        let run_dir = dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut row = vec![run_dir];
        row.extend(record.iter().map(str::to_string));
        wtr.write_record(&row)?;
    }
    let bytes = wtr
        .into_inner()
        .map_err(|e| anyhow!("flush results table buffer: {}", e))?;
    atomic_write_bytes(&results_table_path(exp_dir), &bytes)?;
    Ok(replications.len())
}

/// Rebuild the results table and close the event log.
pub fn aggregate(exp_dir: &Path, replications: &BTreeMap<u32, PathBuf>) -> Result<usize> {
    let rows = write_results_table(exp_dir, replications)?;
    EventLog::for_experiment(exp_dir).finalize(rows)?;
    tracing::info!(dir = %exp_dir.display(), replications = rows, "experiment aggregated");
    Ok(rows)
}
