pub mod locks;
pub mod pipeline;
pub mod reset;
pub mod status;
pub mod steps;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;

use crate::lockfile::LeaseDir;
use crate::paths;
use crate::state::{FileLedger, FileProgress};

/// File-backed stores under the state directory
pub struct StateStores {
    pub dir: PathBuf,
    pub ledger: Arc<FileLedger>,
    pub progress: Arc<FileProgress>,
    pub locks: Arc<LeaseDir>,
}

impl StateStores {
    pub fn open() -> Result<Self> {
        Ok(Self::at(paths::state_dir()?))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self {
            ledger: Arc::new(FileLedger::new(paths::ledger_dir(&dir))),
            progress: Arc::new(FileProgress::new(paths::progress_file(&dir))),
            locks: Arc::new(LeaseDir::new(paths::locks_dir(&dir))),
            dir,
        }
    }
}
