//! Controller configuration.
//!
//! The whole configuration is one explicit value loaded from YAML and passed
//! to the controller at construction time; nothing here is process-global.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid config fields: {}", .0.join(", "))]
    Invalid(Vec<String>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MappingStrategy {
    Correct,
    Random,
}

impl MappingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            MappingStrategy::Correct => "correct",
            MappingStrategy::Random => "random",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "correct" => Some(MappingStrategy::Correct),
            "random" => Some(MappingStrategy::Random),
            _ => None,
        }
    }
}

impl fmt::Display for MappingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parameters every replication of an experiment shares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentSpec {
    pub model: String,
    pub temperature: f64,
    pub trials: u32,
    pub group_size: u32,
    pub mapping_strategy: MappingStrategy,
    pub replications: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    pub workers: usize,
    pub session_timeout_seconds: u64,
    pub session_hard_timeout_seconds: u64,
    pub stage_timeout_seconds: u64,
    pub migration_threshold: usize,
    pub max_iterations: usize,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            workers: 5,
            session_timeout_seconds: 600,
            session_hard_timeout_seconds: 660,
            stage_timeout_seconds: 1800,
            migration_threshold: 2,
            max_iterations: 50,
        }
    }
}

impl RuntimeSettings {
    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_seconds)
    }

    pub fn session_hard_timeout(&self) -> Duration {
        Duration::from_secs(self.session_hard_timeout_seconds)
    }

    pub fn stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_seconds)
    }
}

/// Command lines for the external stage programs. The session command is
/// invoked once per trial index; the others once per replication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageCommands {
    pub build_inputs: Vec<String>,
    pub execute_session: Vec<String>,
    pub process_outputs: Vec<String>,
    pub compute_analysis: Vec<String>,
    pub render_report: Vec<String>,
    pub compile_summary: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    pub experiment: ExperimentSpec,
    #[serde(default)]
    pub runtime: RuntimeSettings,
    #[serde(default)]
    pub stages: StageCommands,
}

impl ControllerConfig {
    /// Collect every invalid field instead of stopping at the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        let exp = &self.experiment;
        if exp.model.trim().is_empty() {
            problems.push("/experiment/model must not be empty".to_string());
        }
        if !(0.0..=2.0).contains(&exp.temperature) {
            problems.push("/experiment/temperature must be within 0.0..=2.0".to_string());
        }
        if exp.trials == 0 || exp.trials > 999 {
            problems.push("/experiment/trials must be within 1..=999".to_string());
        }
        if exp.group_size < 2 || exp.group_size > 99 {
            problems.push("/experiment/group_size must be within 2..=99".to_string());
        }
        if exp.replications == 0 || exp.replications > 999 {
            problems.push("/experiment/replications must be within 1..=999".to_string());
        }
        let rt = &self.runtime;
        if rt.workers == 0 {
            problems.push("/runtime/workers must be at least 1".to_string());
        }
        if rt.session_timeout_seconds == 0 {
            problems.push("/runtime/session_timeout_seconds must be positive".to_string());
        }
        if rt.session_hard_timeout_seconds < rt.session_timeout_seconds {
            problems.push(
                "/runtime/session_hard_timeout_seconds must not be below session_timeout_seconds"
                    .to_string(),
            );
        }
        if rt.stage_timeout_seconds == 0 {
            problems.push("/runtime/stage_timeout_seconds must be positive".to_string());
        }
        if rt.migration_threshold < 2 {
            problems.push("/runtime/migration_threshold must be at least 2".to_string());
        }
        if rt.max_iterations == 0 {
            problems.push("/runtime/max_iterations must be at least 1".to_string());
        }
        let stages = &self.stages;
        for (name, cmd) in [
            ("build_inputs", &stages.build_inputs),
            ("execute_session", &stages.execute_session),
            ("process_outputs", &stages.process_outputs),
            ("compute_analysis", &stages.compute_analysis),
            ("render_report", &stages.render_report),
            ("compile_summary", &stages.compile_summary),
        ] {
            if cmd.is_empty() || cmd[0].trim().is_empty() {
                problems.push(format!("/stages/{} command is required", name));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

pub fn load_config(path: &Path) -> Result<ControllerConfig, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let config: ControllerConfig =
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
    config.validate()?;
    Ok(config)
}

pub const SAMPLE_CONFIG: &str = r#"# replab controller configuration
experiment:
  model: "google/gemini-2.0-flash"
  temperature: 0.2
  trials: 100
  group_size: 10
  mapping_strategy: correct   # correct | random
  replications: 30

runtime:
  workers: 5
  session_timeout_seconds: 600
  session_hard_timeout_seconds: 660
  stage_timeout_seconds: 1800
  # distinct independent failure classes in one replication before it is
  # rebuilt holistically instead of point-repaired
  migration_threshold: 2
  max_iterations: 50

# Each stage program receives `--run-dir <dir>` and must print
# REPLAB_STAGE_OK on success or `REPLAB_STAGE_FAILED <reason>` on failure.
# The session program additionally receives `--index <n>`.
stages:
  build_inputs: ["python3", "src/build_llm_queries.py"]
  execute_session: ["python3", "src/llm_prompter.py"]
  process_outputs: ["python3", "src/process_llm_responses.py"]
  compute_analysis: ["python3", "src/analyze_llm_performance.py"]
  render_report: ["python3", "src/generate_replication_report.py"]
  compile_summary: ["python3", "src/compile_replication_results.py"]
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_config_parses_and_validates() {
        let config: ControllerConfig = serde_yaml::from_str(SAMPLE_CONFIG).expect("parse sample");
        config.validate().expect("sample must validate");
        assert_eq!(config.experiment.mapping_strategy, MappingStrategy::Correct);
        assert_eq!(config.runtime.workers, 5);
        assert_eq!(config.runtime.migration_threshold, 2);
    }

    #[test]
    fn runtime_section_defaults_when_absent() {
        let raw = r#"
experiment:
  model: m
  temperature: 0.0
  trials: 3
  group_size: 4
  mapping_strategy: random
  replications: 1
stages:
  build_inputs: [a]
  execute_session: [b]
  process_outputs: [c]
  compute_analysis: [d]
  render_report: [e]
  compile_summary: [f]
"#;
        let config: ControllerConfig = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(config.runtime, RuntimeSettings::default());
        config.validate().expect("valid");
    }

    #[test]
    fn validate_reports_all_problems() {
        let raw = r#"
experiment:
  model: ""
  temperature: 3.5
  trials: 0
  group_size: 1
  mapping_strategy: correct
  replications: 2
runtime:
  workers: 0
  migration_threshold: 1
"#;
        let config: ControllerConfig = serde_yaml::from_str(raw).expect("parse");
        let msg = config.validate().expect_err("should fail").to_string();
        for needle in [
            "/experiment/model",
            "/experiment/temperature",
            "/experiment/trials",
            "/experiment/group_size",
            "/runtime/workers",
            "/runtime/migration_threshold",
            "/stages/build_inputs",
            "/stages/compile_summary",
        ] {
            assert!(msg.contains(needle), "missing {}: {}", needle, msg);
        }
        assert!(!msg.contains("/experiment/replications"), "{}", msg);
    }

    #[test]
    fn load_config_surfaces_parse_errors() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("replab.yaml");
        fs::write(&path, "experiment: [not, a, map]").expect("write");
        match load_config(&path) {
            Err(ConfigError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }
    }
}
