//! Completion ledger: which (cluster, step, sub-step) units already succeeded
//!
//! A record is created lazily as `Pending` the first time a sub-step is
//! checked and set to `Done` only after its side effects completed. Records
//! are removed only by [`CompletionLedger::reset`] at the start of a fresh
//! operation.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

/// Completion state of one sub-step
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionState {
    Pending,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub step: String,
    pub sub_step: String,
    pub state: CompletionState,
    pub first_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Durable record of finished work, keyed by entity (cluster) id.
///
/// Implementations are shared between pipeline runs of different clusters;
/// calls for different entity ids never contend on the same records.
pub trait CompletionLedger: Send + Sync {
    /// Whether the sub-step is recorded as done. Creates a pending record if absent.
    fn is_done(&self, entity_id: &str, step: &str, sub_step: &str) -> Result<bool>;

    /// Record the sub-step as done. Call only after its side effects succeeded.
    fn mark_done(&self, entity_id: &str, step: &str, sub_step: &str) -> Result<()>;

    /// Record `sub_step` as done and set `reopen`, its opposite-direction
    /// record, back to pending. Both changes land in one write.
    fn settle(&self, entity_id: &str, step: &str, sub_step: &str, reopen: &str) -> Result<()>;

    /// Drop every record of the entity
    fn reset(&self, entity_id: &str) -> Result<()>;

    /// All records of the entity, ordered by step then sub-step
    fn records(&self, entity_id: &str) -> Result<Vec<CompletionRecord>>;
}

/// The records of one entity.
///
/// Shared by the in-memory ledger and file-backed ledgers that persist one
/// book per cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerBook {
    #[serde(default)]
    records: BTreeMap<String, CompletionRecord>,
}

impl LedgerBook {
    fn key(step: &str, sub_step: &str) -> String {
        format!("{step}/{sub_step}")
    }

    /// Check a sub-step, creating a pending record on first sight.
    ///
    /// Returns whether the book changed alongside the done flag.
    pub fn check(&mut self, step: &str, sub_step: &str) -> (bool, bool) {
        let key = Self::key(step, sub_step);
        if let Some(record) = self.records.get(&key) {
            return (record.state == CompletionState::Done, false);
        }
        self.records.insert(
            key,
            CompletionRecord {
                step: step.to_string(),
                sub_step: sub_step.to_string(),
                state: CompletionState::Pending,
                first_seen: Utc::now(),
                completed_at: None,
            },
        );
        (false, true)
    }

    pub fn is_done(&self, step: &str, sub_step: &str) -> bool {
        self.records
            .get(&Self::key(step, sub_step))
            .is_some_and(|r| r.state == CompletionState::Done)
    }

    pub fn mark_done(&mut self, step: &str, sub_step: &str) {
        let now = Utc::now();
        let record = self
            .records
            .entry(Self::key(step, sub_step))
            .or_insert_with(|| CompletionRecord {
                step: step.to_string(),
                sub_step: sub_step.to_string(),
                state: CompletionState::Pending,
                first_seen: now,
                completed_at: None,
            });
        record.state = CompletionState::Done;
        record.completed_at = Some(now);
    }

    /// Set a done record back to pending. Returns whether anything changed.
    pub fn reopen(&mut self, step: &str, sub_step: &str) -> bool {
        match self.records.get_mut(&Self::key(step, sub_step)) {
            Some(record) if record.state == CompletionState::Done => {
                record.state = CompletionState::Pending;
                record.completed_at = None;
                true
            }
            _ => false,
        }
    }

    pub fn records(&self) -> Vec<CompletionRecord> {
        self.records.values().cloned().collect()
    }

    pub fn done_count(&self) -> usize {
        self.records
            .values()
            .filter(|r| r.state == CompletionState::Done)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// In-memory ledger for tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryLedger {
    books: Mutex<HashMap<String, LedgerBook>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_book<T>(&self, entity_id: &str, f: impl FnOnce(&mut LedgerBook) -> T) -> Result<T> {
        let mut books = self
            .books
            .lock()
            .map_err(|_| Error::Store("ledger mutex poisoned".into()))?;
        Ok(f(books.entry(entity_id.to_string()).or_default()))
    }
}

impl CompletionLedger for MemoryLedger {
    fn is_done(&self, entity_id: &str, step: &str, sub_step: &str) -> Result<bool> {
        self.with_book(entity_id, |book| book.check(step, sub_step).0)
    }

    fn mark_done(&self, entity_id: &str, step: &str, sub_step: &str) -> Result<()> {
        self.with_book(entity_id, |book| book.mark_done(step, sub_step))
    }

    fn settle(&self, entity_id: &str, step: &str, sub_step: &str, reopen: &str) -> Result<()> {
        self.with_book(entity_id, |book| {
            book.reopen(step, reopen);
            book.mark_done(step, sub_step);
        })
    }

    fn reset(&self, entity_id: &str) -> Result<()> {
        let mut books = self
            .books
            .lock()
            .map_err(|_| Error::Store("ledger mutex poisoned".into()))?;
        books.remove(entity_id);
        log::debug!("Completion ledger reset for {}", entity_id);
        Ok(())
    }

    fn records(&self, entity_id: &str) -> Result<Vec<CompletionRecord>> {
        self.with_book(entity_id, |book| book.records())
    }
}
