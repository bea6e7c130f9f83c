//! File-backed completion ledger and progress store
//!
//! One TOML ledger file per cluster under `<state>/ledger/`, and a single
//! `progress.toml` with the latest status of every cluster. Files are
//! rewritten through a temporary file and a rename, so a crash leaves
//! either the old or the new content.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use crate::paths::{file_stem, from_file_stem};
use stepflow::{
    CompletionLedger, CompletionRecord, Error, LedgerBook, ProgressStatus, ProgressStore, Result,
};

fn store_err(action: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Store(format!("Failed to {action} {}: {e}", path.display()))
}

/// Read a TOML file, or the default when it does not exist
fn read_toml<T: DeserializeOwned + Default>(path: &Path) -> Result<T> {
    if !path.exists() {
        return Ok(T::default());
    }
    let content = fs::read_to_string(path).map_err(|e| store_err("read", path, e))?;
    toml::from_str(&content).map_err(|e| store_err("parse", path, e))
}

/// Write a TOML file atomically
fn write_toml<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|e| store_err("create", dir, e))?;
    }
    let content = toml::to_string_pretty(value).map_err(|e| store_err("serialize", path, e))?;
    let tmp = path.with_extension("toml.tmp");
    fs::write(&tmp, content).map_err(|e| store_err("write", &tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| store_err("replace", path, e))?;
    Ok(())
}

// ============================================================================
// Completion Ledger
// ============================================================================

#[derive(Debug)]
pub struct FileLedger {
    dir: PathBuf,
    // serializes read-modify-write within this process
    guard: Mutex<()>,
}

impl FileLedger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    fn book_path(&self, entity_id: &str) -> PathBuf {
        self.dir.join(format!("{}.toml", file_stem(entity_id)))
    }

    fn with_book<T>(&self, entity_id: &str, f: impl FnOnce(&mut LedgerBook) -> (T, bool)) -> Result<T> {
        let _lock = self
            .guard
            .lock()
            .map_err(|_| Error::Store("ledger mutex poisoned".into()))?;
        let path = self.book_path(entity_id);
        let mut book: LedgerBook = read_toml(&path)?;
        let (value, changed) = f(&mut book);
        if changed {
            write_toml(&path, &book)?;
        }
        Ok(value)
    }

    /// Clusters with a ledger file
    pub fn clusters(&self) -> Result<Vec<String>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries = fs::read_dir(&self.dir).map_err(|e| store_err("list", &self.dir, e))?;
        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
            .filter_map(|p| p.file_stem().and_then(|s| from_file_stem(&s.to_string_lossy())))
            .collect();
        ids.sort();
        Ok(ids)
    }
}

impl CompletionLedger for FileLedger {
    fn is_done(&self, entity_id: &str, step: &str, sub_step: &str) -> Result<bool> {
        self.with_book(entity_id, |book| book.check(step, sub_step))
    }

    fn mark_done(&self, entity_id: &str, step: &str, sub_step: &str) -> Result<()> {
        self.with_book(entity_id, |book| {
            book.mark_done(step, sub_step);
            ((), true)
        })
    }

    fn settle(&self, entity_id: &str, step: &str, sub_step: &str, reopen: &str) -> Result<()> {
        self.with_book(entity_id, |book| {
            book.reopen(step, reopen);
            book.mark_done(step, sub_step);
            ((), true)
        })
    }

    fn reset(&self, entity_id: &str) -> Result<()> {
        let _lock = self
            .guard
            .lock()
            .map_err(|_| Error::Store("ledger mutex poisoned".into()))?;
        let path = self.book_path(entity_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| store_err("remove", &path, e))?;
            log::info!("Cleared completion records of {}", entity_id);
        }
        Ok(())
    }

    fn records(&self, entity_id: &str) -> Result<Vec<CompletionRecord>> {
        self.with_book(entity_id, |book| (book.records(), false))
    }
}

// ============================================================================
// Progress Store
// ============================================================================

#[derive(Debug, Default, Serialize, Deserialize)]
struct ProgressFile {
    #[serde(default)]
    clusters: BTreeMap<String, ProgressStatus>,
}

#[derive(Debug)]
pub struct FileProgress {
    path: PathBuf,
    guard: Mutex<()>,
}

impl FileProgress {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            guard: Mutex::new(()),
        }
    }

    /// Every known cluster with its latest status
    pub fn all(&self) -> Result<Vec<(String, ProgressStatus)>> {
        let file: ProgressFile = read_toml(&self.path)?;
        Ok(file.clusters.into_iter().collect())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
        self.guard
            .lock()
            .map_err(|_| Error::Store("progress mutex poisoned".into()))
    }
}

impl ProgressStore for FileProgress {
    fn set_status(&self, entity_id: &str, phase: &str, percent: u8, detail: &str) -> Result<()> {
        let _lock = self.lock()?;
        let mut file: ProgressFile = read_toml(&self.path)?;
        let updated_at: DateTime<Utc> = Utc::now();
        file.clusters.insert(
            entity_id.to_string(),
            ProgressStatus {
                phase: phase.to_string(),
                percent: percent.min(100),
                detail: detail.to_string(),
                updated_at,
            },
        );
        write_toml(&self.path, &file)
    }

    fn get_status(&self, entity_id: &str) -> Result<Option<ProgressStatus>> {
        let _lock = self.lock()?;
        let mut file: ProgressFile = read_toml(&self.path)?;
        Ok(file.clusters.remove(entity_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepflow::CompletionState;
    use tempfile::TempDir;

    #[test]
    fn test_ledger_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        assert!(!ledger.is_done("clu1", "create-vm", "CREATE_VM").unwrap());
        ledger.mark_done("clu1", "create-vm", "CREATE_VM").unwrap();

        let reopened = FileLedger::new(dir.path());
        assert!(reopened.is_done("clu1", "create-vm", "CREATE_VM").unwrap());
        assert!(!reopened.is_done("clu2", "create-vm", "CREATE_VM").unwrap());
    }

    #[test]
    fn test_check_creates_pending_record() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        ledger.is_done("clu1", "create-user", "USERS").unwrap();

        let records = ledger.records("clu1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].state, CompletionState::Pending);
        assert!(records[0].completed_at.is_none());
    }

    #[test]
    fn test_reset_drops_only_that_cluster() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        ledger.mark_done("clu1", "create-vm", "CREATE_VM").unwrap();
        ledger.mark_done("clu2", "create-vm", "CREATE_VM").unwrap();
        assert_eq!(ledger.clusters().unwrap(), vec!["clu1", "clu2"]);

        ledger.reset("clu1").unwrap();
        assert!(ledger.records("clu1").unwrap().is_empty());
        assert_eq!(ledger.records("clu2").unwrap().len(), 1);
        // resetting twice is fine
        ledger.reset("clu1").unwrap();
    }

    #[test]
    fn test_cluster_id_escaped() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        ledger.mark_done("../evil", "create-vm", "CREATE_VM").unwrap();
        assert!(dir.path().join("%2E%2E%2Fevil.toml").exists());
        assert_eq!(ledger.clusters().unwrap(), vec!["../evil"]);
    }

    #[test]
    fn test_similar_ids_get_separate_books() {
        let dir = TempDir::new().unwrap();
        let ledger = FileLedger::new(dir.path());
        ledger.mark_done("clu 1", "create-vm", "CREATE_VM").unwrap();
        assert!(!ledger.is_done("clu_1", "create-vm", "CREATE_VM").unwrap());
        assert_eq!(ledger.clusters().unwrap(), vec!["clu 1", "clu_1"]);
    }

    #[test]
    fn test_corrupt_ledger_is_store_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("clu1.toml"), "records = 12").unwrap();
        let ledger = FileLedger::new(dir.path());
        let err = ledger.is_done("clu1", "create-vm", "CREATE_VM").unwrap_err();
        assert!(matches!(err, Error::Store(_)));
    }

    #[test]
    fn test_progress_round_trip() {
        let dir = TempDir::new().unwrap();
        let progress = FileProgress::new(dir.path().join("progress.toml"));
        assert!(progress.get_status("clu1").unwrap().is_none());

        progress.set_status("clu1", "create-vm", 40, "guests running").unwrap();
        progress.set_status("clu2", "done", 120, "done").unwrap();

        let status = progress.get_status("clu1").unwrap().unwrap();
        assert_eq!(status.phase, "create-vm");
        assert_eq!(progress.get_status("clu2").unwrap().unwrap().percent, 100);
        assert_eq!(progress.all().unwrap().len(), 2);
    }
}
