//! Builders for well-formed replication artifacts.
//!
//! Used by the test suites of the downstream crates and by the in-process
//! fake stage programs those suites drive the pipeline with.

use crate::config::{ExperimentSpec, MappingStrategy};
use crate::fsutil::{atomic_write_bytes, atomic_write_json_pretty, ensure_dir};
use crate::manifest::{
    report_file_name, Artifact, FileManifest, METRICS_END, METRICS_START, SUMMARY_COLUMNS,
};
use crate::naming::{format_temperature, ReplicationName};
use crate::snapshot::ConfigSnapshot;
use anyhow::Result;
use chrono::{NaiveDate, NaiveDateTime};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

pub fn sample_spec(trials: u32, replications: u32) -> ExperimentSpec {
    ExperimentSpec {
        model: "google/gemini-2.0-flash".to_string(),
        temperature: 0.2,
        trials,
        group_size: 4,
        mapping_strategy: MappingStrategy::Correct,
        replications,
    }
}

/// Deterministic timestamp, one second apart per index.
pub fn fixture_timestamp(index: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2025, 6, 1)
        .and_then(|d| d.and_hms_opt(12, 0, index % 60))
        .unwrap_or_default()
}

pub fn manifest_for(spec: &ExperimentSpec) -> FileManifest {
    FileManifest::new(spec.trials, spec.group_size)
}

pub fn replication_dir(exp_dir: &Path, spec: &ExperimentSpec, index: u32) -> PathBuf {
    exp_dir.join(ReplicationName::for_spec(spec, index, fixture_timestamp(index)).to_string())
}

pub fn write_snapshot(dir: &Path, spec: &ExperimentSpec, index: u32) -> Result<()> {
    ConfigSnapshot::for_spec(spec, index).write(&dir.join(crate::manifest::CONFIG_SNAPSHOT_FILE))
}

pub fn write_query(dir: &Path, manifest: &FileManifest, index: u32) -> Result<()> {
    let body = format!(
        "Match the {} descriptions to the {} people below (trial {}).\n",
        manifest.group_size, manifest.group_size, index
    );
    atomic_write_bytes(&manifest.path(dir, Artifact::Query(index)), body.as_bytes())
}

pub fn write_queries(dir: &Path, manifest: &FileManifest) -> Result<()> {
    ensure_dir(&manifest.path(dir, Artifact::QueriesDir))?;
    for i in manifest.trial_indices() {
        write_query(dir, manifest, i)?;
    }
    Ok(())
}

pub fn write_response(dir: &Path, manifest: &FileManifest, index: u32) -> Result<()> {
    let k = manifest.group_size as usize;
    let mut body = String::new();
    for row in 0..k {
        let cells: Vec<String> = (0..k)
            .map(|col| if row == col { "0.90".into() } else { "0.10".into() })
            .collect();
        body.push_str(&cells.join("\t"));
        body.push('\n');
    }
    atomic_write_bytes(&manifest.path(dir, Artifact::Response(index)), body.as_bytes())?;
    atomic_write_json_pretty(
        &manifest.path(dir, Artifact::ResponseSidecar(index)),
        &json!({ "index": index, "finish_reason": "stop", "usage": { "total_tokens": 512 } }),
    )
}

pub fn write_responses(dir: &Path, manifest: &FileManifest) -> Result<()> {
    ensure_dir(&manifest.path(dir, Artifact::ResponsesDir))?;
    for i in manifest.trial_indices() {
        write_response(dir, manifest, i)?;
    }
    Ok(())
}

/// Write `count` score blocks and mapping rows.
pub fn write_analysis(dir: &Path, manifest: &FileManifest, count: u32) -> Result<()> {
    let k = manifest.group_size as usize;
    let mut scores = String::new();
    for block in 0..count {
        if block > 0 {
            scores.push('\n');
        }
        for row in 0..k {
            let cells: Vec<String> = (0..k)
                .map(|col| if row == col { "0.9".into() } else { "0.1".into() })
                .collect();
            scores.push_str(&cells.join("\t"));
            scores.push('\n');
        }
    }
    let header: Vec<String> = (1..=k).map(|c| format!("Map_idx{}", c)).collect();
    let mut mappings = header.join("\t");
    mappings.push('\n');
    for _ in 0..count {
        let row: Vec<String> = (1..=k).map(|c| c.to_string()).collect();
        mappings.push_str(&row.join("\t"));
        mappings.push('\n');
    }
    atomic_write_bytes(&manifest.path(dir, Artifact::Scores), scores.as_bytes())?;
    atomic_write_bytes(&manifest.path(dir, Artifact::Mappings), mappings.as_bytes())
}

pub fn metrics_value(valid_responses: u32) -> Value {
    json!({
        "n_valid_responses": valid_responses,
        "mean_mrr": 0.82,
        "mean_top1_accuracy": 0.71,
        "mean_top3_accuracy": 0.94,
        "mrr_p_value": 0.001,
        "top1_p_value": 0.002,
        "top3_p_value": 0.004,
        "mean_rank_of_correct_id": 1.4,
        "bias_slope": -0.01
    })
}

pub fn write_metrics(dir: &Path, manifest: &FileManifest, metrics: &Value) -> Result<()> {
    atomic_write_json_pretty(&manifest.path(dir, Artifact::Metrics), metrics)
}

pub fn write_report(dir: &Path, stamp: &str, metrics: &Value) -> Result<PathBuf> {
    let path = dir.join(report_file_name(stamp));
    let body = format!(
        "REPLICATION REPORT\n==================\n\nSummary text.\n\n{}\n{}\n{}\n",
        METRICS_START,
        serde_json::to_string_pretty(metrics)?,
        METRICS_END
    );
    atomic_write_bytes(&path, body.as_bytes())?;
    Ok(path)
}

pub fn summary_row(spec: &ExperimentSpec, index: u32, valid_responses: u32) -> Vec<String> {
    vec![
        index.to_string(),
        spec.model.clone(),
        format_temperature(spec.temperature),
        spec.trials.to_string(),
        spec.group_size.to_string(),
        spec.mapping_strategy.to_string(),
        valid_responses.to_string(),
        "0.82".to_string(),
        "0.71".to_string(),
        "0.94".to_string(),
        "0.001".to_string(),
    ]
}

pub fn write_summary(
    dir: &Path,
    manifest: &FileManifest,
    spec: &ExperimentSpec,
    index: u32,
    valid_responses: u32,
) -> Result<()> {
    let mut wtr = csv::Writer::from_writer(Vec::new());
    wtr.write_record(SUMMARY_COLUMNS)?;
    wtr.write_record(summary_row(spec, index, valid_responses))?;
    let bytes = wtr.into_inner().map_err(|e| anyhow::anyhow!(e.to_string()))?;
    atomic_write_bytes(&manifest.path(dir, Artifact::ResultSummary), &bytes)
}

/// Build a replication directory that passes every audit check.
pub fn build_valid_replication(
    exp_dir: &Path,
    spec: &ExperimentSpec,
    index: u32,
) -> Result<PathBuf> {
    let dir = replication_dir(exp_dir, spec, index);
    let manifest = manifest_for(spec);
    ensure_dir(&dir)?;
    write_snapshot(&dir, spec, index)?;
    write_queries(&dir, &manifest)?;
    write_responses(&dir, &manifest)?;
    write_analysis(&dir, &manifest, spec.trials)?;
    let metrics = metrics_value(spec.trials);
    write_metrics(&dir, &manifest, &metrics)?;
    write_report(&dir, "20250601-120500", &metrics)?;
    write_summary(&dir, &manifest, spec, index, spec.trials)?;
    Ok(dir)
}
