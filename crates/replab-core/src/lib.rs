pub mod config;
#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;
pub mod fsutil;
pub mod manifest;
pub mod naming;
pub mod snapshot;

pub use config::{
    load_config, ConfigError, ControllerConfig, ExperimentSpec, MappingStrategy, RuntimeSettings,
    StageCommands,
};
pub use fsutil::{
    atomic_write_bytes, atomic_write_json_pretty, ensure_dir, remove_dir_if_exists,
    remove_file_if_exists,
};
pub use manifest::{Artifact, FileManifest};
pub use naming::{NameError, ReplicationName};
pub use snapshot::ConfigSnapshot;
