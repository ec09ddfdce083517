//! Append-only experiment event log (`batch_run_log.csv`).

use anyhow::{Context, Result};
use chrono::Local;
use replab_audit::event_log_path;
use replab_core::manifest::{EVENT_LOG_COLUMNS, FINALIZE_EVENT};
use replab_core::{atomic_write_bytes, ensure_dir};
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventRow {
    pub timestamp: String,
    pub event: String,
    pub replication: String,
    pub status: String,
    pub detail: String,
}

impl EventRow {
    fn new(event: &str, replication: Option<u32>, status: &str, detail: &str) -> Self {
        Self {
            timestamp: Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            event: event.to_string(),
            replication: replication.map(|i| i.to_string()).unwrap_or_default(),
            status: status.to_string(),
            detail: detail.to_string(),
        }
    }

    fn fields(&self) -> [&str; 5] {
        [
            self.timestamp.as_str(),
            self.event.as_str(),
            self.replication.as_str(),
            self.status.as_str(),
            self.detail.as_str(),
        ]
    }
}

#[derive(Debug, Clone)]
pub struct EventLog {
    path: PathBuf,
}

impl EventLog {
    pub fn for_experiment(dir: &Path) -> Self {
        Self {
            path: event_log_path(dir),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &self,
        event: &str,
        replication: Option<u32>,
        status: &str,
        detail: &str,
    ) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            ensure_dir(parent)?;
        }
        let needs_header = fs::metadata(&self.path)
            .map(|m| m.len() == 0)
            .unwrap_or(true);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("open event log {}", self.path.display()))?;
        let mut wtr = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if needs_header {
            wtr.write_record(EVENT_LOG_COLUMNS)?;
        }
        wtr.write_record(EventRow::new(event, replication, status, detail).fields())?;
        wtr.flush()?;
        Ok(())
    }

    /// Rows in file order. Rows that are not five fields wide are dropped.
    pub fn rows(&self) -> Result<Vec<EventRow>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&self.path)
            .with_context(|| format!("read event log {}", self.path.display()))?;
        let mut rows = Vec::new();
        for record in rdr.records() {
            let Ok(record) = record else {
                continue;
            };
            if record.len() != EVENT_LOG_COLUMNS.len() {
                tracing::debug!(path = %self.path.display(), "skipping malformed event log row");
                continue;
            }
            rows.push(EventRow {
                timestamp: record[0].to_string(),
                event: record[1].to_string(),
                replication: record[2].to_string(),
                status: record[3].to_string(),
                detail: record[4].to_string(),
            });
        }
        Ok(rows)
    }

    /// Rewrite the log without earlier finalize rows and close it with a single
    /// finalize row recording `valid_count` replications.
    pub fn finalize(&self, valid_count: usize) -> Result<()> {
        let mut rows: Vec<EventRow> = self
            .rows()?
            .into_iter()
            .filter(|r| r.event != FINALIZE_EVENT)
            .collect();
        rows.push(EventRow::new(
            FINALIZE_EVENT,
            None,
            "ok",
            &format!("replications={}", valid_count),
        ));
        let mut wtr = csv::Writer::from_writer(Vec::new());
        wtr.write_record(EVENT_LOG_COLUMNS)?;
        for row in &rows {
            wtr.write_record(row.fields())?;
        }
        let bytes = wtr
            .into_inner()
            .map_err(|e| anyhow::anyhow!("flush event log buffer: {}", e))?;
        atomic_write_bytes(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replab_audit::check_event_log;

    #[test]
    fn append_writes_header_once() {
        let root = tempfile::tempdir().expect("tmp dir");
        let log = EventLog::for_experiment(&root.path().join("exp"));
        log.append("new_replication", Some(1), "started", "").expect("append");
        log.append("new_replication", Some(1), "ok", "stages=6").expect("append");
        let text = fs::read_to_string(log.path()).expect("read");
        assert_eq!(text.matches("timestamp,event").count(), 1);
        let rows = log.rows().expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].detail, "stages=6");
        assert_eq!(rows[0].replication, "1");
    }

    #[test]
    fn finalize_keeps_history_and_a_single_terminal_row() {
        let root = tempfile::tempdir().expect("tmp dir");
        let log = EventLog::for_experiment(root.path());
        log.append("new_replication", Some(1), "ok", "").expect("append");
        log.finalize(1).expect("finalize");
        log.append("session_repair", Some(1), "started", "indices=[2]").expect("append");
        assert!(check_event_log(log.path(), 1).is_err());
        log.finalize(1).expect("finalize again");
        assert!(check_event_log(log.path(), 1).is_ok());
        let rows = log.rows().expect("rows");
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].event, "session_repair");
    }
}
