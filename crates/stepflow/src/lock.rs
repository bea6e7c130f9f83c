//! Lease-based critical sections over shared remote resources
//!
//! At most one live lease exists per resource key. A lease not renewed
//! within its TTL is abandoned and may be reclaimed by the next acquirer.
//!
//! Call sites take a [`LeaseGuard`] right before the guarded section. The
//! guard releases every key it acquired when dropped, on success, error or
//! unwind alike.

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockLease {
    pub key: String,
    pub holder: String,
    pub expires_at: DateTime<Utc>,
}

impl LockLease {
    pub fn new(key: &str, holder: &str, now: DateTime<Utc>, ttl: Duration) -> Self {
        Self {
            key: key.to_string(),
            holder: holder.to_string(),
            expires_at: expiry(now, ttl),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// `now + ttl`, saturating at the far future
pub(crate) fn expiry(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    now.checked_add_signed(to_chrono(ttl))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Distributed lock contract
pub trait LockService: Send + Sync {
    /// Take the lease, or refresh it if `holder` already owns it.
    ///
    /// Returns false when another holder owns a live lease.
    fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Drop the lease if `holder` owns it
    fn release(&self, key: &str, holder: &str) -> Result<bool>;

    /// Extend a lease `holder` still owns
    fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool>;

    /// Current lease on `key`, live or expired
    fn lease(&self, key: &str) -> Result<Option<LockLease>>;

    /// All leases, sorted by key
    fn leases(&self) -> Result<Vec<LockLease>>;

    /// Remove every expired lease, returning what was removed
    fn reclaim_expired(&self) -> Result<Vec<LockLease>>;

    /// The time this service judges expiry against
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Source of the current time for lease expiry
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut now) = self.now.lock() {
            *now = expiry(*now, by);
        }
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.now.lock().map_or_else(|_| Utc::now(), |n| *n)
    }
}

/// In-process lease table
pub struct LeaseTable {
    clock: Arc<dyn Clock>,
    leases: Mutex<HashMap<String, LockLease>>,
}

impl Default for LeaseTable {
    fn default() -> Self {
        Self::new()
    }
}

impl LeaseTable {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            leases: Mutex::new(HashMap::new()),
        }
    }

    fn table(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, LockLease>>> {
        self.leases
            .lock()
            .map_err(|_| Error::Store("lease table mutex poisoned".into()))
    }
}

impl LockService for LeaseTable {
    fn acquire(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut leases = self.table()?;
        if let Some(existing) = leases.get(key) {
            if existing.holder != holder && !existing.is_expired(now) {
                return Ok(false);
            }
            if existing.holder != holder {
                log::warn!(
                    "Reclaiming expired lease on {} held by {}",
                    key,
                    existing.holder
                );
            }
        }
        leases.insert(key.to_string(), LockLease::new(key, holder, now, ttl));
        Ok(true)
    }

    fn release(&self, key: &str, holder: &str) -> Result<bool> {
        let mut leases = self.table()?;
        match leases.get(key) {
            Some(lease) if lease.holder == holder => {
                leases.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn renew(&self, key: &str, holder: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut leases = self.table()?;
        match leases.get_mut(key) {
            Some(lease) if lease.holder == holder => {
                lease.expires_at = expiry(now, ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn lease(&self, key: &str) -> Result<Option<LockLease>> {
        Ok(self.table()?.get(key).cloned())
    }

    fn leases(&self) -> Result<Vec<LockLease>> {
        let mut all: Vec<LockLease> = self.table()?.values().cloned().collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(all)
    }

    fn reclaim_expired(&self) -> Result<Vec<LockLease>> {
        let now = self.clock.now();
        let mut leases = self.table()?;
        let expired: Vec<LockLease> = leases
            .values()
            .filter(|l| l.is_expired(now))
            .cloned()
            .collect();
        for lease in &expired {
            leases.remove(&lease.key);
        }
        Ok(expired)
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }
}

/// Timing for [`LeaseGuard::acquire`]
#[derive(Debug, Clone, Copy)]
pub struct LeasePolicy {
    pub ttl: Duration,
    pub wait: Duration,
    pub heartbeat: Option<Duration>,
}

struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Scoped ownership of one or more leases
pub struct LeaseGuard {
    service: Arc<dyn LockService>,
    holder: String,
    /// Keys this guard took, in acquisition order. Keys that were already
    /// held by the same holder are not listed and stay held on drop.
    acquired: Vec<String>,
    heartbeat: Option<Heartbeat>,
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("holder", &self.holder)
            .field("acquired", &self.acquired)
            .field("heartbeat", &self.heartbeat.is_some())
            .finish()
    }
}

const BACKOFF_START: Duration = Duration::from_millis(50);
const BACKOFF_MAX: Duration = Duration::from_secs(2);

impl LeaseGuard {
    /// Acquire every key, in sorted order, waiting up to `policy.wait` per key.
    ///
    /// Keys already held by `holder` are treated as nested acquisitions. On
    /// failure everything acquired so far is released and the error names
    /// the busy key and its holder.
    pub fn acquire(
        service: Arc<dyn LockService>,
        keys: &[String],
        holder: &str,
        policy: LeasePolicy,
    ) -> Result<Self> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guard = Self {
            service,
            holder: holder.to_string(),
            acquired: Vec::with_capacity(sorted.len()),
            heartbeat: None,
        };

        for key in sorted {
            if guard.holds_live(key)? {
                log::debug!("Lease on {} already held by {}", key, holder);
                continue;
            }
            guard.acquire_one(key, policy)?;
            guard.acquired.push(key.clone());
        }

        if let Some(interval) = policy.heartbeat {
            guard.start_heartbeat(interval, policy.ttl);
        }
        log::debug!("Critical section entered by {}: {:?}", holder, guard.acquired);
        Ok(guard)
    }

    fn holds_live(&self, key: &str) -> Result<bool> {
        Ok(self
            .service
            .lease(key)?
            .is_some_and(|l| l.holder == self.holder && !l.is_expired(self.service.now())))
    }

    fn acquire_one(&self, key: &str, policy: LeasePolicy) -> Result<()> {
        let started = Instant::now();
        let mut delay = BACKOFF_START;
        loop {
            if self.service.acquire(key, &self.holder, policy.ttl)? {
                return Ok(());
            }
            if started.elapsed() >= policy.wait {
                let holder = self
                    .service
                    .lease(key)?
                    .map_or_else(|| "unknown".to_string(), |l| l.holder);
                return Err(Error::LockUnavailable {
                    key: key.to_string(),
                    holder,
                });
            }
            log::debug!("Waiting {}ms for lease on {}", delay.as_millis(), key);
            thread::sleep(delay.min(policy.wait.saturating_sub(started.elapsed())));
            delay = (delay * 2).min(BACKOFF_MAX);
        }
    }

    fn start_heartbeat(&mut self, interval: Duration, ttl: Duration) {
        if self.acquired.is_empty() {
            return;
        }
        let (stop, rx) = mpsc::channel::<()>();
        let service = Arc::clone(&self.service);
        let holder = self.holder.clone();
        let keys = self.acquired.clone();

        let handle = thread::spawn(move || {
            loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        for key in &keys {
                            match service.renew(key, &holder, ttl) {
                                Ok(true) => log::trace!("Renewed lease on {}", key),
                                Ok(false) => log::warn!("Lease on {} lost by {}", key, holder),
                                Err(e) => log::warn!("Failed to renew lease on {}: {}", key, e),
                            }
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
        });
        self.heartbeat = Some(Heartbeat { stop, handle });
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    /// Keys this guard will release on drop
    pub fn keys(&self) -> &[String] {
        &self.acquired
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            let _ = heartbeat.stop.send(());
            if heartbeat.handle.join().is_err() {
                log::warn!("Lease heartbeat thread for {} panicked", self.holder);
            }
        }
        for key in self.acquired.iter().rev() {
            match self.service.release(key, &self.holder) {
                Ok(true) => log::debug!("Released lease on {}", key),
                Ok(false) => log::warn!("Lease on {} was no longer held by {}", key, self.holder),
                Err(e) => log::warn!("Failed to release lease on {}: {}", key, e),
            }
        }
    }
}

/// Holder id for a pipeline run: request (or cluster) id plus process id
pub fn holder_id(request_id: &str, cluster_id: &str) -> String {
    let prefix = if request_id.is_empty() {
        cluster_id
    } else {
        request_id
    };
    format!("{}_{}", prefix, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use std::sync::Barrier;

    fn quick(wait_ms: u64) -> LeasePolicy {
        LeasePolicy {
            ttl: Duration::from_secs(60),
            wait: Duration::from_millis(wait_ms),
            heartbeat: None,
        }
    }

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    #[test]
    fn test_acquire_release() {
        let table = LeaseTable::new();
        let ttl = Duration::from_secs(60);
        assert!(table.acquire("switch1", "a", ttl).unwrap());
        assert!(!table.acquire("switch1", "b", ttl).unwrap());
        assert!(!table.release("switch1", "b").unwrap());
        assert!(table.release("switch1", "a").unwrap());
        assert!(table.acquire("switch1", "b", ttl).unwrap());
    }

    #[test]
    fn test_concurrent_acquire_single_winner() {
        let table = Arc::new(LeaseTable::new());
        let barrier = Arc::new(Barrier::new(8));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let table = Arc::clone(&table);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    table
                        .acquire("kvm01", &format!("holder{i}"), Duration::from_secs(60))
                        .unwrap()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn test_expired_lease_reclaimed() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let table = LeaseTable::with_clock(clock.clone());
        assert!(table.acquire("cell01", "a", Duration::from_secs(10)).unwrap());
        assert!(!table.acquire("cell01", "b", Duration::from_secs(10)).unwrap());

        clock.advance(Duration::from_secs(11));
        assert!(table.acquire("cell01", "b", Duration::from_secs(10)).unwrap());
        assert_eq!(table.lease("cell01").unwrap().unwrap().holder, "b");
        assert!(!table.renew("cell01", "a", Duration::from_secs(10)).unwrap());
    }

    #[test]
    fn test_nested_check_uses_service_clock() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let service: Arc<dyn LockService> = Arc::new(LeaseTable::with_clock(clock.clone()));
        assert!(service.acquire("a", "h1", Duration::from_secs(10)).unwrap());

        // live by wall clock, expired by the table's clock: taken afresh
        clock.advance(Duration::from_secs(11));
        let guard = LeaseGuard::acquire(Arc::clone(&service), &keys(&["a"]), "h1", quick(0)).unwrap();
        assert_eq!(guard.keys(), ["a"]);
        let lease = service.lease("a").unwrap().unwrap();
        assert!(!lease.is_expired(service.now()));

        drop(guard);
        assert!(service.lease("a").unwrap().is_none());
    }

    #[test]
    fn test_reclaim_expired() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let table = LeaseTable::with_clock(clock.clone());
        table.acquire("a", "h", Duration::from_secs(5)).unwrap();
        table.acquire("b", "h", Duration::from_secs(50)).unwrap();
        clock.advance(Duration::from_secs(10));

        let reclaimed = table.reclaim_expired().unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].key, "a");
        assert_eq!(table.leases().unwrap().len(), 1);
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let service: Arc<dyn LockService> = Arc::new(LeaseTable::new());
        {
            let guard =
                LeaseGuard::acquire(Arc::clone(&service), &keys(&["b", "a", "b"]), "h1", quick(10))
                    .unwrap();
            assert_eq!(guard.keys(), ["a", "b"]);
            assert_eq!(service.leases().unwrap().len(), 2);
        }
        assert!(service.leases().unwrap().is_empty());
    }

    #[test]
    fn test_guard_busy_key_releases_partial() {
        let service: Arc<dyn LockService> = Arc::new(LeaseTable::new());
        service.acquire("b", "other", Duration::from_secs(60)).unwrap();

        let err = LeaseGuard::acquire(Arc::clone(&service), &keys(&["a", "b"]), "h1", quick(20))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockUnavailable);
        assert!(err.to_string().contains("locked by other"));
        // "a" was taken first and must be released again
        assert!(service.lease("a").unwrap().is_none());
    }

    #[test]
    fn test_nested_guard_is_reentrant() {
        let service: Arc<dyn LockService> = Arc::new(LeaseTable::new());
        let outer = LeaseGuard::acquire(Arc::clone(&service), &keys(&["kvm01"]), "h1", quick(10))
            .unwrap();
        {
            let inner = LeaseGuard::acquire(
                Arc::clone(&service),
                &keys(&["kvm01", "kvm02"]),
                "h1",
                quick(10),
            )
            .unwrap();
            assert_eq!(inner.keys(), ["kvm02"]);
        }
        // inner drop must not release the outer key
        assert_eq!(service.lease("kvm01").unwrap().unwrap().holder, "h1");
        drop(outer);
        assert!(service.leases().unwrap().is_empty());
    }

    #[test]
    fn test_heartbeat_renews() {
        let service: Arc<dyn LockService> = Arc::new(LeaseTable::new());
        let policy = LeasePolicy {
            ttl: Duration::from_secs(1),
            wait: Duration::from_millis(10),
            heartbeat: Some(Duration::from_millis(20)),
        };
        let guard = LeaseGuard::acquire(Arc::clone(&service), &keys(&["sw"]), "h1", policy).unwrap();
        let first = service.lease("sw").unwrap().unwrap().expires_at;
        thread::sleep(Duration::from_millis(120));
        let later = service.lease("sw").unwrap().unwrap().expires_at;
        assert!(later > first);
        drop(guard);
        assert!(service.lease("sw").unwrap().is_none());
    }

    #[test]
    fn test_holder_id() {
        let pid = std::process::id();
        assert_eq!(holder_id("", "clu1"), format!("clu1_{pid}"));
        assert_eq!(holder_id("req9", "clu1"), format!("req9_{pid}"));
    }
}
