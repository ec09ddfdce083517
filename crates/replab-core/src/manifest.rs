//! Declarative description of the files a replication and an experiment own.
//!
//! Every path the audit, the pipeline and the controller touch is derived
//! from [`FileManifest::path`]; file-name templates live only here.

use std::path::{Path, PathBuf};

pub const CONFIG_SNAPSHOT_FILE: &str = "config_snapshot.json";
pub const QUERIES_DIR: &str = "session_queries";
pub const RESPONSES_DIR: &str = "session_responses";
pub const ANALYSIS_DIR: &str = "analysis_inputs";
pub const SCORES_FILE: &str = "all_scores.txt";
pub const MAPPINGS_FILE: &str = "all_mappings.txt";
pub const METRICS_FILE: &str = "replication_metrics.json";
pub const REPORT_PREFIX: &str = "replication_report_";
pub const REPORT_SUFFIX: &str = ".txt";
pub const RESULT_SUMMARY_FILE: &str = "REPLICATION_results.csv";

pub const QUERY_PREFIX: &str = "llm_query_";
pub const QUERY_SUFFIX: &str = ".txt";
pub const RESPONSE_PREFIX: &str = "llm_response_";
pub const RESPONSE_SUFFIX: &str = ".txt";
pub const SIDECAR_SUFFIX: &str = "_full.json";

pub const EXPERIMENT_RESULTS_FILE: &str = "EXPERIMENT_results.csv";
pub const EVENT_LOG_FILE: &str = "batch_run_log.csv";
pub const LOCK_FILE: &str = ".replab.lock";

pub const METRICS_START: &str = "<<<METRICS_JSON_START>>>";
pub const METRICS_END: &str = "<<<METRICS_JSON_END>>>";

/// Closed key set of the metrics block embedded in every report.
pub const REQUIRED_METRIC_KEYS: [&str; 9] = [
    "n_valid_responses",
    "mean_mrr",
    "mean_top1_accuracy",
    "mean_top3_accuracy",
    "mrr_p_value",
    "top1_p_value",
    "top3_p_value",
    "mean_rank_of_correct_id",
    "bias_slope",
];

/// Columns of the single-row `REPLICATION_results.csv`.
pub const SUMMARY_COLUMNS: [&str; 11] = [
    "replication",
    "model",
    "temperature",
    "trials",
    "group_size",
    "mapping_strategy",
    "valid_responses",
    "mean_mrr",
    "mean_top1_accuracy",
    "mean_top3_accuracy",
    "mrr_p_value",
];

pub const RUN_DIRECTORY_COLUMN: &str = "run_directory";

pub const EVENT_LOG_COLUMNS: [&str; 5] = ["timestamp", "event", "replication", "status", "detail"];
pub const FINALIZE_EVENT: &str = "FINALIZED";

/// Columns of the experiment-level table: the run directory followed by the
/// replication summary columns.
pub fn experiment_columns() -> Vec<&'static str> {
    let mut cols = Vec::with_capacity(SUMMARY_COLUMNS.len() + 1);
    cols.push(RUN_DIRECTORY_COLUMN);
    cols.extend_from_slice(&SUMMARY_COLUMNS);
    cols
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    ConfigSnapshot,
    QueriesDir,
    Query(u32),
    ResponsesDir,
    Response(u32),
    ResponseSidecar(u32),
    AnalysisDir,
    Scores,
    Mappings,
    Metrics,
    ResultSummary,
}

/// Expected artifact set of one replication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileManifest {
    pub trials: u32,
    pub group_size: u32,
}

impl FileManifest {
    pub fn new(trials: u32, group_size: u32) -> Self {
        Self { trials, group_size }
    }

    pub fn path(&self, dir: &Path, artifact: Artifact) -> PathBuf {
        match artifact {
            Artifact::ConfigSnapshot => dir.join(CONFIG_SNAPSHOT_FILE),
            Artifact::QueriesDir => dir.join(QUERIES_DIR),
            Artifact::Query(i) => dir
                .join(QUERIES_DIR)
                .join(format!("{}{:03}{}", QUERY_PREFIX, i, QUERY_SUFFIX)),
            Artifact::ResponsesDir => dir.join(RESPONSES_DIR),
            Artifact::Response(i) => dir
                .join(RESPONSES_DIR)
                .join(format!("{}{:03}{}", RESPONSE_PREFIX, i, RESPONSE_SUFFIX)),
            Artifact::ResponseSidecar(i) => dir
                .join(RESPONSES_DIR)
                .join(format!("{}{:03}{}", RESPONSE_PREFIX, i, SIDECAR_SUFFIX)),
            Artifact::AnalysisDir => dir.join(ANALYSIS_DIR),
            Artifact::Scores => dir.join(ANALYSIS_DIR).join(SCORES_FILE),
            Artifact::Mappings => dir.join(ANALYSIS_DIR).join(MAPPINGS_FILE),
            Artifact::Metrics => dir.join(ANALYSIS_DIR).join(METRICS_FILE),
            Artifact::ResultSummary => dir.join(RESULT_SUMMARY_FILE),
        }
    }

    pub fn trial_indices(&self) -> impl Iterator<Item = u32> {
        1..=self.trials
    }

    /// Every file a valid replication must contain, reports excluded (their
    /// names carry a timestamp).
    pub fn required_files(&self) -> Vec<Artifact> {
        let mut out = vec![Artifact::ConfigSnapshot];
        for i in self.trial_indices() {
            out.push(Artifact::Query(i));
            out.push(Artifact::Response(i));
            out.push(Artifact::ResponseSidecar(i));
        }
        out.extend([
            Artifact::Scores,
            Artifact::Mappings,
            Artifact::Metrics,
            Artifact::ResultSummary,
        ]);
        out
    }
}

/// Kind of a file found inside `session_responses/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFile {
    Response(u32),
    Sidecar(u32),
}

pub fn parse_query_name(name: &str) -> Option<u32> {
    parse_indexed(name, QUERY_PREFIX, QUERY_SUFFIX)
}

pub fn parse_response_name(name: &str) -> Option<ResponseFile> {
    if let Some(i) = parse_indexed(name, RESPONSE_PREFIX, SIDECAR_SUFFIX) {
        return Some(ResponseFile::Sidecar(i));
    }
    parse_indexed(name, RESPONSE_PREFIX, RESPONSE_SUFFIX).map(ResponseFile::Response)
}

pub fn is_report_name(name: &str) -> bool {
    name.starts_with(REPORT_PREFIX) && name.ends_with(REPORT_SUFFIX)
}

pub fn report_file_name(stamp: &str) -> String {
    format!("{}{}{}", REPORT_PREFIX, stamp, REPORT_SUFFIX)
}

fn parse_indexed(name: &str, prefix: &str, suffix: &str) -> Option<u32> {
    let digits = name.strip_prefix(prefix)?.strip_suffix(suffix)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_templates() {
        let m = FileManifest::new(10, 4);
        let dir = Path::new("/exp/run_x");
        assert_eq!(
            m.path(dir, Artifact::Query(3)),
            Path::new("/exp/run_x/session_queries/llm_query_003.txt")
        );
        assert_eq!(
            m.path(dir, Artifact::ResponseSidecar(12)),
            Path::new("/exp/run_x/session_responses/llm_response_012_full.json")
        );
        assert_eq!(
            m.path(dir, Artifact::Metrics),
            Path::new("/exp/run_x/analysis_inputs/replication_metrics.json")
        );
    }

    #[test]
    fn file_names_parse_back_to_indices() {
        assert_eq!(parse_query_name("llm_query_007.txt"), Some(7));
        assert_eq!(parse_query_name("llm_query_.txt"), None);
        assert_eq!(parse_query_name("llm_query_007.json"), None);
        assert_eq!(
            parse_response_name("llm_response_010.txt"),
            Some(ResponseFile::Response(10))
        );
        assert_eq!(
            parse_response_name("llm_response_010_full.json"),
            Some(ResponseFile::Sidecar(10))
        );
        assert_eq!(parse_response_name("notes.txt"), None);
    }

    #[test]
    fn required_files_scale_with_trials() {
        let m = FileManifest::new(5, 3);
        assert_eq!(m.required_files().len(), 1 + 5 * 3 + 4);
    }

    #[test]
    fn experiment_columns_prefix_run_directory() {
        let cols = experiment_columns();
        assert_eq!(cols[0], RUN_DIRECTORY_COLUMN);
        assert_eq!(&cols[1..], &SUMMARY_COLUMNS[..]);
    }
}
