//! Replication directory names.
//!
//! A replication directory encodes its own parameters:
//! `run_<YYYYMMDD>_<HHMMSS>_rep-<NNN>_<model>_tmp-<T.TT>_sbj-<KK>_trl-<TTT>_<mapping>`.

use crate::config::{ExperimentSpec, MappingStrategy};
use chrono::NaiveDateTime;
use std::fmt;
use thiserror::Error;

pub const RUN_DIR_PREFIX: &str = "run_";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("directory name does not start with 'run_'")]
    MissingPrefix,
    #[error("directory name has {0} segments, expected at least 9")]
    TooFewSegments(usize),
    #[error("invalid timestamp '{0}'")]
    Timestamp(String),
    #[error("invalid segment '{segment}', expected {expected}")]
    Segment {
        segment: String,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationName {
    pub timestamp: NaiveDateTime,
    pub index: u32,
    pub model: String,
    pub temperature: f64,
    pub group_size: u32,
    pub trials: u32,
    pub mapping_strategy: MappingStrategy,
}

/// Replace every character the name grammar reserves so the model id
/// survives as a single segment.
pub fn sanitize_model(model: &str) -> String {
    model
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

pub fn format_temperature(t: f64) -> String {
    format!("{:.2}", t)
}

impl ReplicationName {
    pub fn for_spec(spec: &ExperimentSpec, index: u32, timestamp: NaiveDateTime) -> Self {
        Self {
            timestamp,
            index,
            model: sanitize_model(&spec.model),
            temperature: spec.temperature,
            group_size: spec.group_size,
            trials: spec.trials,
            mapping_strategy: spec.mapping_strategy,
        }
    }

    pub fn parse(name: &str) -> Result<Self, NameError> {
        let rest = name
            .strip_prefix(RUN_DIR_PREFIX)
            .ok_or(NameError::MissingPrefix)?;
        let parts: Vec<&str> = rest.split('_').collect();
        if parts.len() < 8 {
            return Err(NameError::TooFewSegments(parts.len() + 1));
        }
        let stamp = format!("{}_{}", parts[0], parts[1]);
        let timestamp = NaiveDateTime::parse_from_str(&stamp, TIMESTAMP_FORMAT)
            .map_err(|_| NameError::Timestamp(stamp.clone()))?;
        let index = tagged_u32(parts[2], "rep-")?;
        let n = parts.len();
        let model = parts[3..n - 4].join("_");
        if model.is_empty() || sanitize_model(&model) != model {
            return Err(NameError::Segment {
                segment: model,
                expected: "a sanitized model id",
            });
        }
        let temperature = parts[n - 4]
            .strip_prefix("tmp-")
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(|| NameError::Segment {
                segment: parts[n - 4].to_string(),
                expected: "tmp-<float>",
            })?;
        let group_size = tagged_u32(parts[n - 3], "sbj-")?;
        let trials = tagged_u32(parts[n - 2], "trl-")?;
        let mapping_strategy =
            MappingStrategy::parse(parts[n - 1]).ok_or_else(|| NameError::Segment {
                segment: parts[n - 1].to_string(),
                expected: "correct|random",
            })?;
        Ok(Self {
            timestamp,
            index,
            model,
            temperature,
            group_size,
            trials,
            mapping_strategy,
        })
    }

    /// Differences between the name and the experiment's parameters.
    pub fn mismatches(&self, spec: &ExperimentSpec) -> Vec<String> {
        let mut out = Vec::new();
        if self.model != sanitize_model(&spec.model) {
            out.push(format!(
                "model '{}' != expected '{}'",
                self.model,
                sanitize_model(&spec.model)
            ));
        }
        if format_temperature(self.temperature) != format_temperature(spec.temperature) {
            out.push(format!(
                "temperature {} != expected {}",
                format_temperature(self.temperature),
                format_temperature(spec.temperature)
            ));
        }
        if self.group_size != spec.group_size {
            out.push(format!(
                "group size {} != expected {}",
                self.group_size, spec.group_size
            ));
        }
        if self.trials != spec.trials {
            out.push(format!("trials {} != expected {}", self.trials, spec.trials));
        }
        if self.mapping_strategy != spec.mapping_strategy {
            out.push(format!(
                "mapping strategy {} != expected {}",
                self.mapping_strategy, spec.mapping_strategy
            ));
        }
        out
    }
}

impl fmt::Display for ReplicationName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}_rep-{:03}_{}_tmp-{}_sbj-{:02}_trl-{:03}_{}",
            RUN_DIR_PREFIX,
            self.timestamp.format(TIMESTAMP_FORMAT),
            self.index,
            self.model,
            format_temperature(self.temperature),
            self.group_size,
            self.trials,
            self.mapping_strategy
        )
    }
}

/// Best-effort index recovery from a name that does not fully parse.
pub fn recover_index(name: &str) -> Option<u32> {
    name.split('_')
        .find_map(|part| part.strip_prefix("rep-"))
        .and_then(|digits| digits.parse::<u32>().ok())
}

fn tagged_u32(segment: &str, tag: &'static str) -> Result<u32, NameError> {
    segment
        .strip_prefix(tag)
        .filter(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
        .and_then(|digits| digits.parse::<u32>().ok())
        .ok_or_else(|| NameError::Segment {
            segment: segment.to_string(),
            expected: tag,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ts() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2025, 3, 14)
            .and_then(|d| d.and_hms_opt(9, 26, 53))
            .expect("valid timestamp")
    }

    fn spec() -> ExperimentSpec {
        ExperimentSpec {
            model: "google/gemini_2.0-flash".to_string(),
            temperature: 0.2,
            trials: 10,
            group_size: 4,
            mapping_strategy: MappingStrategy::Correct,
            replications: 2,
        }
    }

    #[test]
    fn display_matches_layout() {
        let name = ReplicationName::for_spec(&spec(), 7, ts());
        assert_eq!(
            name.to_string(),
            "run_20250314_092653_rep-007_google-gemini-2.0-flash_tmp-0.20_sbj-04_trl-010_correct"
        );
    }

    #[test]
    fn parse_recovers_every_field() {
        let name = ReplicationName::for_spec(&spec(), 12, ts());
        let parsed = ReplicationName::parse(&name.to_string()).expect("parse");
        assert_eq!(parsed, name);
        assert!(parsed.mismatches(&spec()).is_empty());
    }

    #[test]
    fn parse_rejects_malformed_names() {
        assert_eq!(
            ReplicationName::parse("rep_001"),
            Err(NameError::MissingPrefix)
        );
        assert!(matches!(
            ReplicationName::parse("run_20250314_092653_rep-001"),
            Err(NameError::TooFewSegments(_))
        ));
        assert!(matches!(
            ReplicationName::parse("run_20251314_092653_rep-001_m_tmp-0.20_sbj-04_trl-010_correct"),
            Err(NameError::Timestamp(_))
        ));
        assert!(matches!(
            ReplicationName::parse("run_20250314_092653_rep-x1_m_tmp-0.20_sbj-04_trl-010_correct"),
            Err(NameError::Segment { .. })
        ));
        assert!(matches!(
            ReplicationName::parse("run_20250314_092653_rep-001_m_tmp-0.20_sbj-04_trl-010_sorted"),
            Err(NameError::Segment { .. })
        ));
    }

    #[test]
    fn mismatches_name_every_differing_field() {
        let mut other = spec();
        other.trials = 20;
        other.mapping_strategy = MappingStrategy::Random;
        let name = ReplicationName::for_spec(&spec(), 1, ts());
        let diffs = name.mismatches(&other);
        assert_eq!(diffs.len(), 2, "{:?}", diffs);
    }

    #[test]
    fn recover_index_reads_rep_token() {
        assert_eq!(recover_index("run_garbage_rep-004_x"), Some(4));
        assert_eq!(recover_index("run_garbage"), None);
    }
}
