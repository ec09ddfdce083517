use crate::config::{ExperimentSpec, MappingStrategy};
use crate::fsutil::atomic_write_bytes;
use crate::naming::{format_temperature, sanitize_model, ReplicationName};
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Frozen per-replication configuration written next to the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigSnapshot {
    pub replication: u32,
    pub model: String,
    pub temperature: f64,
    pub trials: u32,
    pub group_size: u32,
    pub mapping_strategy: MappingStrategy,
}

impl ConfigSnapshot {
    pub fn for_spec(spec: &ExperimentSpec, index: u32) -> Self {
        Self {
            replication: index,
            model: spec.model.clone(),
            temperature: spec.temperature,
            trials: spec.trials,
            group_size: spec.group_size,
            mapping_strategy: spec.mapping_strategy,
        }
    }

    /// Fields on which the snapshot disagrees with its directory name.
    pub fn mismatches(&self, name: &ReplicationName) -> Vec<String> {
        let mut out = Vec::new();
        if self.replication != name.index {
            out.push(format!(
                "snapshot replication {} != directory index {}",
                self.replication, name.index
            ));
        }
        if sanitize_model(&self.model) != name.model {
            out.push(format!(
                "snapshot model '{}' != directory model '{}'",
                self.model, name.model
            ));
        }
        if format_temperature(self.temperature) != format_temperature(name.temperature) {
            out.push(format!(
                "snapshot temperature {} != directory temperature {}",
                format_temperature(self.temperature),
                format_temperature(name.temperature)
            ));
        }
        if self.trials != name.trials {
            out.push(format!(
                "snapshot trials {} != directory trials {}",
                self.trials, name.trials
            ));
        }
        if self.group_size != name.group_size {
            out.push(format!(
                "snapshot group size {} != directory group size {}",
                self.group_size, name.group_size
            ));
        }
        if self.mapping_strategy != name.mapping_strategy {
            out.push(format!(
                "snapshot mapping {} != directory mapping {}",
                self.mapping_strategy, name.mapping_strategy
            ));
        }
        out
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        atomic_write_bytes(path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn snapshot_for_spec_agrees_with_name() {
        let spec = ExperimentSpec {
            model: "openai/gpt-4o".to_string(),
            temperature: 0.7,
            trials: 20,
            group_size: 6,
            mapping_strategy: MappingStrategy::Random,
            replications: 3,
        };
        let ts = NaiveDate::from_ymd_opt(2025, 1, 2)
            .and_then(|d| d.and_hms_opt(3, 4, 5))
            .expect("timestamp");
        let name = ReplicationName::for_spec(&spec, 2, ts);
        let snap = ConfigSnapshot::for_spec(&spec, 2);
        assert!(snap.mismatches(&name).is_empty());

        let mut wrong = snap.clone();
        wrong.replication = 3;
        wrong.group_size = 5;
        assert_eq!(wrong.mismatches(&name).len(), 2);
    }

    #[test]
    fn snapshot_requires_every_field() {
        let partial = r#"{"replication": 1, "model": "m", "temperature": 0.1, "trials": 3}"#;
        assert!(serde_json::from_str::<ConfigSnapshot>(partial).is_err());
    }
}
