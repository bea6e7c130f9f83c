//! Lease files: a [`LockService`] shared by every clusterforge process on
//! this machine
//!
//! Each key is a file under `<state>/locks/`. Every read-check-write runs
//! under an exclusive `flock` on `<state>/locks/.lock`, so two processes
//! never both take over the same expired lease. Lease content is written
//! to a temporary file and renamed into place; a lease file is never seen
//! half written.
//!
//! A lease file that does not parse (left by an older version, or edited
//! by hand) counts as held until it is older than the lease TTL, after
//! which it is treated like any other expired lease.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use stepflow::{Error, LockLease, LockService, Result};

use crate::paths::{file_stem, from_file_stem};

/// Age after which an unreadable lease file may be reclaimed by `locks`
/// commands, which have no TTL of their own
const UNREADABLE_GRACE: Duration = Duration::from_secs(600);

/// Holder reported for lease files that do not parse
pub const UNREADABLE_HOLDER: &str = "<unreadable>";

#[derive(Debug)]
pub struct LeaseDir {
    dir: PathBuf,
    guard: Mutex<()>,
}

fn lease_err(action: &str, path: &Path, e: impl std::fmt::Display) -> Error {
    Error::Store(format!("Failed to {action} lease {}: {e}", path.display()))
}

/// Both the in-process mutex and the cross-process directory lock.
/// The `flock` is released when the file closes.
struct Locked<'a> {
    _thread: MutexGuard<'a, ()>,
    _file: File,
}

impl LeaseDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            guard: Mutex::new(()),
        }
    }

    fn path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.lease", file_stem(key)))
    }

    fn lock(&self) -> Result<Locked<'_>> {
        let thread = self
            .guard
            .lock()
            .map_err(|_| Error::Store("lease mutex poisoned".into()))?;
        fs::create_dir_all(&self.dir).map_err(|e| lease_err("create", &self.dir, e))?;
        let path = self.dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| lease_err("open", &path, e))?;
        file.lock_exclusive()
            .map_err(|e| lease_err("lock", &path, e))?;
        Ok(Locked {
            _thread: thread,
            _file: file,
        })
    }

    /// Current lease at `path`; unreadable files expire `grace` after
    /// their last modification
    fn read(path: &Path, key: &str, grace: Duration) -> Result<Option<LockLease>> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(lease_err("read", path, e)),
        };
        match toml::from_str(&content) {
            Ok(lease) => Ok(Some(lease)),
            Err(e) => {
                let modified: DateTime<Utc> = fs::metadata(path)
                    .and_then(|m| m.modified())
                    .map_err(|e| lease_err("stat", path, e))?
                    .into();
                log::warn!("Unreadable lease {}: {}", path.display(), e);
                Ok(Some(LockLease::new(key, UNREADABLE_HOLDER, modified, grace)))
            }
        }
    }

    fn write(path: &Path, lease: &LockLease) -> Result<()> {
        let content = toml::to_string(lease).map_err(|e| lease_err("serialize", path, e))?;
        let tmp = path.with_extension("lease.tmp");
        fs::write(&tmp, content).map_err(|e| lease_err("write", &tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| lease_err("replace", path, e))
    }

    /// Every lease file, unreadable ones included. Caller holds the lock.
    fn scan(&self) -> Result<Vec<LockLease>> {
        let entries = fs::read_dir(&self.dir).map_err(|e| lease_err("list", &self.dir, e))?;
        let mut leases = Vec::new();
        for path in entries.filter_map(|e| e.ok()).map(|e| e.path()) {
            if !path.extension().is_some_and(|ext| ext == "lease") {
                continue;
            }
            let key = path
                .file_stem()
                .and_then(|s| from_file_stem(&s.to_string_lossy()));
            let Some(key) = key else {
                log::debug!("Ignoring foreign file {}", path.display());
                continue;
            };
            if let Some(lease) = Self::read(&path, &key, UNREADABLE_GRACE)? {
                leases.push(lease);
            }
        }
        leases.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(leases)
    }
}

impl LockService for LeaseDir {
    fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let _locked = self.lock()?;
        let path = self.path(key);
        let now = Utc::now();
        let lease = LockLease::new(key, holder, now, ttl);

        match Self::read(&path, key, ttl)? {
            None => {}
            Some(current) if current.holder == holder => {}
            Some(current) if current.is_expired(now) => {
                log::warn!(
                    "Reclaiming expired lease {} from {} (expired {})",
                    key,
                    current.holder,
                    current.expires_at
                );
            }
            Some(_) => return Ok(false),
        }
        Self::write(&path, &lease)?;
        Ok(true)
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let _locked = self.lock()?;
        let path = self.path(key);
        match Self::read(&path, key, UNREADABLE_GRACE)? {
            Some(current) if current.holder == holder => {
                fs::remove_file(&path).map_err(|e| lease_err("remove", &path, e))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let _locked = self.lock()?;
        let path = self.path(key);
        match Self::read(&path, key, ttl)? {
            Some(current) if current.holder == holder => {
                Self::write(&path, &LockLease::new(key, holder, Utc::now(), ttl))?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lease(&self, key: &str) -> Result<Option<LockLease>> {
        if !self.dir.exists() {
            return Ok(None);
        }
        let _locked = self.lock()?;
        Self::read(&self.path(key), key, UNREADABLE_GRACE)
    }

    fn leases(&self) -> Result<Vec<LockLease>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let _locked = self.lock()?;
        self.scan()
    }

    fn reclaim_expired(&self) -> Result<Vec<LockLease>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let _locked = self.lock()?;
        let now = Utc::now();
        let mut reclaimed = Vec::new();
        for lease in self.scan()?.into_iter().filter(|l| l.is_expired(now)) {
            let path = self.path(&lease.key);
            fs::remove_file(&path).map_err(|e| lease_err("remove", &path, e))?;
            log::info!("Reclaimed lease {} from {}", lease.key, lease.holder);
            reclaimed.push(lease);
        }
        Ok(reclaimed)
    }
}
