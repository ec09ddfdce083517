//! Artifact checks shared by the audit and the stage pipeline.
//!
//! Every check is total: unreadable or malformed files are reported as
//! problems, never as errors.

use replab_core::manifest::{
    is_report_name, parse_query_name, parse_response_name, ResponseFile, METRICS_END,
    METRICS_START, REQUIRED_METRIC_KEYS, SUMMARY_COLUMNS,
};
use replab_core::{Artifact, ConfigSnapshot, FileManifest, ReplicationName};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Result of checking an indexed file family (queries or responses).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexedCheck {
    pub missing: Vec<u32>,
    pub unexpected: Vec<String>,
}

impl IndexedCheck {
    pub fn is_complete(&self) -> bool {
        self.missing.is_empty() && self.unexpected.is_empty()
    }
}

fn non_empty_file(path: &Path) -> bool {
    fs::metadata(path)
        .map(|m| m.is_file() && m.len() > 0)
        .unwrap_or(false)
}

fn is_scratch(name: &str) -> bool {
    name.starts_with('.')
}

fn list_file_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .filter(|n| !is_scratch(n))
        .collect();
    names.sort();
    names
}

/// Problems with the configuration snapshot; empty when it is valid and
/// agrees with the directory name.
pub fn check_snapshot(dir: &Path, manifest: &FileManifest, name: &ReplicationName) -> Vec<String> {
    let path = manifest.path(dir, Artifact::ConfigSnapshot);
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(_) => return vec!["config snapshot missing or unreadable".to_string()],
    };
    match serde_json::from_str::<ConfigSnapshot>(&raw) {
        Ok(snapshot) => snapshot.mismatches(name),
        Err(e) => vec![format!("config snapshot corrupt: {}", e)],
    }
}

pub fn check_queries(dir: &Path, manifest: &FileManifest) -> IndexedCheck {
    let mut out = IndexedCheck::default();
    for name in list_file_names(&manifest.path(dir, Artifact::QueriesDir)) {
        match parse_query_name(&name) {
            Some(i) if (1..=manifest.trials).contains(&i) => {}
            _ => out.unexpected.push(name),
        }
    }
    for i in manifest.trial_indices() {
        if !non_empty_file(&manifest.path(dir, Artifact::Query(i))) {
            out.missing.push(i);
        }
    }
    out
}

fn sidecar_is_valid(path: &Path) -> bool {
    fs::read(path)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
        .is_some()
}

/// An index is missing when its response is absent or empty, or its sidecar
/// is absent or not a JSON document.
pub fn check_responses(dir: &Path, manifest: &FileManifest) -> IndexedCheck {
    let mut out = IndexedCheck::default();
    for name in list_file_names(&manifest.path(dir, Artifact::ResponsesDir)) {
        let index = match parse_response_name(&name) {
            Some(ResponseFile::Response(i)) | Some(ResponseFile::Sidecar(i)) => Some(i),
            None => None,
        };
        match index {
            Some(i) if (1..=manifest.trials).contains(&i) => {}
            _ => out.unexpected.push(name),
        }
    }
    for i in manifest.trial_indices() {
        let response_ok = non_empty_file(&manifest.path(dir, Artifact::Response(i)));
        let sidecar_ok = sidecar_is_valid(&manifest.path(dir, Artifact::ResponseSidecar(i)));
        if !(response_ok && sidecar_ok) {
            out.missing.push(i);
        }
    }
    out
}

fn numeric_row(line: &str, width: usize) -> bool {
    let cells: Vec<&str> = line.split_whitespace().collect();
    cells.len() == width && cells.iter().all(|c| c.parse::<f64>().is_ok())
}

/// Count `k`-by-`k` score blocks separated by blank lines.
pub fn count_score_blocks(text: &str, k: usize) -> Result<usize, String> {
    let mut blocks = 0usize;
    let mut rows_in_block = 0usize;
    for (lineno, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            if rows_in_block > 0 {
                if rows_in_block != k {
                    return Err(format!(
                        "score block ending at line {} has {} rows, expected {}",
                        lineno, rows_in_block, k
                    ));
                }
                blocks += 1;
                rows_in_block = 0;
            }
            continue;
        }
        if !numeric_row(line, k) {
            return Err(format!(
                "score line {} is not {} numeric columns",
                lineno + 1,
                k
            ));
        }
        rows_in_block += 1;
    }
    if rows_in_block > 0 {
        if rows_in_block != k {
            return Err(format!(
                "last score block has {} rows, expected {}",
                rows_in_block, k
            ));
        }
        blocks += 1;
    }
    Ok(blocks)
}

/// Count mapping rows after the header line.
pub fn count_mapping_rows(text: &str, k: usize) -> Result<usize, String> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let header = lines.next().ok_or_else(|| "mappings file is empty".to_string())?;
    if header.split_whitespace().count() != k {
        return Err(format!("mappings header does not have {} columns", k));
    }
    let mut rows = 0usize;
    for line in lines {
        let cells: Vec<&str> = line.split_whitespace().collect();
        if cells.len() != k || !cells.iter().all(|c| c.parse::<u32>().is_ok()) {
            return Err(format!("mapping row {} is not {} integers", rows + 1, k));
        }
        rows += 1;
    }
    Ok(rows)
}

/// Record counts of both analysis inputs must equal `expected` and each other.
pub fn check_analysis(dir: &Path, manifest: &FileManifest, expected: u32) -> Result<(), String> {
    let k = manifest.group_size as usize;
    let scores = fs::read_to_string(manifest.path(dir, Artifact::Scores))
        .map_err(|_| "scores file missing or unreadable".to_string())?;
    let mappings = fs::read_to_string(manifest.path(dir, Artifact::Mappings))
        .map_err(|_| "mappings file missing or unreadable".to_string())?;
    let blocks = count_score_blocks(&scores, k)?;
    let rows = count_mapping_rows(&mappings, k)?;
    if blocks != rows {
        return Err(format!(
            "analysis inputs disagree: {} score blocks vs {} mapping rows",
            blocks, rows
        ));
    }
    if blocks != expected as usize {
        return Err(format!(
            "analysis inputs hold {} trials, expected {}",
            blocks, expected
        ));
    }
    Ok(())
}

/// The metrics object must carry exactly [`REQUIRED_METRIC_KEYS`] and report
/// `expected` valid responses.
pub fn check_metrics_value(value: &Value, expected: u32) -> Result<(), String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "metrics block is not an object".to_string())?;
    let required: BTreeSet<&str> = REQUIRED_METRIC_KEYS.iter().copied().collect();
    let present: BTreeSet<&str> = obj.keys().map(|k| k.as_str()).collect();
    let missing: Vec<&str> = required.difference(&present).copied().collect();
    let extra: Vec<&str> = present.difference(&required).copied().collect();
    if !missing.is_empty() || !extra.is_empty() {
        return Err(format!(
            "metrics keys mismatch (missing: [{}], unexpected: [{}])",
            missing.join(", "),
            extra.join(", ")
        ));
    }
    match obj.get("n_valid_responses").and_then(|v| v.as_u64()) {
        Some(n) if n == u64::from(expected) => Ok(()),
        Some(n) => Err(format!(
            "metrics report {} valid responses, expected {}",
            n, expected
        )),
        None => Err("n_valid_responses is not an integer".to_string()),
    }
}

pub fn check_metrics_file(dir: &Path, manifest: &FileManifest, expected: u32) -> Result<(), String> {
    let raw = fs::read(manifest.path(dir, Artifact::Metrics))
        .map_err(|_| "metrics file missing or unreadable".to_string())?;
    let value: Value =
        serde_json::from_slice(&raw).map_err(|e| format!("metrics file corrupt: {}", e))?;
    check_metrics_value(&value, expected)
}

/// Most recent report: report names embed a sortable timestamp.
pub fn latest_report(dir: &Path) -> Option<PathBuf> {
    list_file_names(dir)
        .into_iter()
        .filter(|n| is_report_name(n))
        .max()
        .map(|n| dir.join(n))
}

/// Parse the JSON object between the metrics sentinels.
pub fn extract_metrics_block(text: &str) -> Result<Value, String> {
    let start = text
        .find(METRICS_START)
        .ok_or_else(|| "metrics start marker not found".to_string())?;
    let body_start = start + METRICS_START.len();
    let end = text[body_start..]
        .find(METRICS_END)
        .ok_or_else(|| "metrics end marker not found".to_string())?;
    let body = &text[body_start..body_start + end];
    serde_json::from_str(body.trim()).map_err(|e| format!("metrics block does not parse: {}", e))
}

pub fn check_report(dir: &Path, expected: u32) -> Result<(), String> {
    let path = latest_report(dir).ok_or_else(|| "no report file".to_string())?;
    let text = fs::read_to_string(&path).map_err(|_| "report unreadable".to_string())?;
    let value = extract_metrics_block(&text)?;
    check_metrics_value(&value, expected)
}

/// Header must equal [`SUMMARY_COLUMNS`] with exactly one row describing
/// this replication.
pub fn check_summary(
    dir: &Path,
    manifest: &FileManifest,
    index: u32,
    expected: u32,
) -> Result<(), String> {
    let path = manifest.path(dir, Artifact::ResultSummary);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(&path)
        .map_err(|_| "result summary missing or unreadable".to_string())?;
    let headers = rdr
        .headers()
        .map_err(|e| format!("result summary header unreadable: {}", e))?
        .clone();
    if !headers.iter().eq(SUMMARY_COLUMNS.iter().copied()) {
        return Err("result summary header does not match the summary columns".to_string());
    }
    let records: Vec<csv::StringRecord> = rdr
        .records()
        .collect::<Result<_, _>>()
        .map_err(|e| format!("result summary row unreadable: {}", e))?;
    if records.len() != 1 {
        return Err(format!(
            "result summary has {} data rows, expected 1",
            records.len()
        ));
    }
    let row = &records[0];
    if row.get(0).and_then(|v| v.parse::<u32>().ok()) != Some(index) {
        return Err(format!("result summary replication is not {}", index));
    }
    if row.get(6).and_then(|v| v.parse::<u32>().ok()) != Some(expected) {
        return Err(format!(
            "result summary valid_responses is not {}",
            expected
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use replab_core::fixtures;

    #[test]
    fn score_blocks_require_square_matrices() {
        let ok = "1 2\n3 4\n\n5 6\n7 8\n";
        assert_eq!(count_score_blocks(ok, 2), Ok(2));
        assert!(count_score_blocks("1 2\n3 4\n5 6\n", 2).is_err());
        assert!(count_score_blocks("1 x\n3 4\n", 2).is_err());
        assert_eq!(count_score_blocks("", 2), Ok(0));
    }

    #[test]
    fn mapping_rows_skip_header() {
        assert_eq!(count_mapping_rows("a\tb\n1\t2\n2\t1\n", 2), Ok(2));
        assert!(count_mapping_rows("", 2).is_err());
        assert!(count_mapping_rows("a\tb\n1\n", 2).is_err());
    }

    #[test]
    fn metrics_key_set_must_match_exactly() {
        let good = fixtures::metrics_value(10);
        assert!(check_metrics_value(&good, 10).is_ok());
        assert!(check_metrics_value(&good, 9).is_err());

        let mut missing = good.clone();
        missing
            .as_object_mut()
            .expect("object")
            .remove("bias_slope");
        let err = check_metrics_value(&missing, 10).expect_err("missing key");
        assert!(err.contains("bias_slope"), "{}", err);

        let mut extra = good;
        extra
            .as_object_mut()
            .expect("object")
            .insert("chi_square".into(), Value::from(1.0));
        let err = check_metrics_value(&extra, 10).expect_err("extra key");
        assert!(err.contains("chi_square"), "{}", err);
    }

    #[test]
    fn metrics_block_is_found_between_sentinels() {
        let text = format!(
            "intro\n{}\n{{\"a\": 1}}\n{}\ntrailer\n",
            METRICS_START, METRICS_END
        );
        let value = extract_metrics_block(&text).expect("block");
        assert_eq!(value["a"], 1);
        assert!(extract_metrics_block("no markers").is_err());
        assert!(extract_metrics_block(&format!("{}\n{{}}", METRICS_START)).is_err());
    }

    #[test]
    fn latest_report_wins() {
        let root = tempfile::tempdir().expect("tmp dir");
        let old = fixtures::write_report(root.path(), "20250101-000000", &fixtures::metrics_value(3))
            .expect("old report");
        let new = fixtures::write_report(root.path(), "20250102-000000", &Value::Null)
            .expect("new report");
        assert_eq!(latest_report(root.path()), Some(new));
        assert!(check_report(root.path(), 3).is_err());
        fs::remove_file(latest_report(root.path()).expect("latest")).expect("remove");
        assert_eq!(latest_report(root.path()), Some(old));
        assert!(check_report(root.path(), 3).is_ok());
    }

    #[test]
    fn response_check_flags_bad_sidecars_and_extras() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(4, 1);
        let manifest = fixtures::manifest_for(&spec);
        fixtures::write_responses(root.path(), &manifest).expect("responses");
        assert!(check_responses(root.path(), &manifest).is_complete());

        fs::write(manifest.path(root.path(), Artifact::ResponseSidecar(2)), "{trunc")
            .expect("corrupt sidecar");
        fs::write(manifest.path(root.path(), Artifact::Response(4)), "").expect("empty response");
        fs::write(
            manifest.path(root.path(), Artifact::ResponsesDir).join("llm_response_009.txt"),
            "x",
        )
        .expect("extra");
        let check = check_responses(root.path(), &manifest);
        assert_eq!(check.missing, vec![2, 4]);
        assert_eq!(check.unexpected, vec!["llm_response_009.txt".to_string()]);
    }

    #[test]
    fn summary_row_must_describe_the_replication() {
        let root = tempfile::tempdir().expect("tmp dir");
        let spec = fixtures::sample_spec(5, 1);
        let manifest = fixtures::manifest_for(&spec);
        fixtures::write_summary(root.path(), &manifest, &spec, 2, 5).expect("summary");
        assert!(check_summary(root.path(), &manifest, 2, 5).is_ok());
        assert!(check_summary(root.path(), &manifest, 3, 5).is_err());
        assert!(check_summary(root.path(), &manifest, 2, 4).is_err());
    }
}
