use anyhow::{anyhow, Result};
use chrono::Utc;
use replab_core::ensure_dir;
use replab_core::manifest::LOCK_FILE;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Exclusive hold on an experiment directory, released on drop.
#[derive(Debug)]
pub struct OperationLock {
    path: PathBuf,
}

impl OperationLock {
    pub fn acquire(exp_dir: &Path) -> Result<Self> {
        ensure_dir(exp_dir)?;
        let lock_path = exp_dir.join(LOCK_FILE);
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
        {
            Ok(mut file) => {
                let payload = format!(
                    "{{\"pid\":{},\"acquired_at\":\"{}\"}}\n",
                    std::process::id(),
                    Utc::now().to_rfc3339()
                );
                let _ = file.write_all(payload.as_bytes());
                let _ = file.sync_all();
                Ok(Self { path: lock_path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(anyhow!(
                "operation_in_progress: {} is held by another controller",
                lock_path.display()
            )),
            Err(e) => Err(e.into()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for OperationLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
