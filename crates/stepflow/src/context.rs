//! Collaborator contracts and the process-scoped services bundle
//!
//! The engine depends only on these traits. Concrete transports and stores
//! live with the caller; in-memory implementations here back tests and
//! dry runs.

use crate::error::{Error, Result};
use crate::ledger::{CompletionLedger, MemoryLedger};
use crate::lock::{LeaseTable, LockService};
use crate::retry::RetryConfig;
use crate::telemetry::{NullSink, SpanSink};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Synchronous remote command execution.
///
/// Must honour the per-call timeout and report an unreachable host as
/// [`Error::HostUnreachable`], distinct from a command that ran and failed.
pub trait HostSession: Send + Sync {
    fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput>;
}

/// Command runner bound to a session and the configured timeout
#[derive(Clone, Copy)]
pub struct Remote<'a> {
    session: &'a dyn HostSession,
    timeout: Duration,
}

impl<'a> Remote<'a> {
    pub fn new(session: &'a dyn HostSession, timeout: Duration) -> Self {
        Self { session, timeout }
    }

    /// Run a command and return its raw output
    pub fn run(&self, host: &str, command: &str) -> Result<CommandOutput> {
        log::trace!("{}: {}", host, command);
        self.session.run(host, command, self.timeout)
    }

    /// Run a command, failing on a non-zero exit, and return stdout
    pub fn run_checked(&self, host: &str, command: &str) -> Result<String> {
        let output = self.run(host, command)?;
        if !output.success() {
            return Err(Error::CommandFailed {
                host: host.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

/// Latest status of one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressStatus {
    pub phase: String,
    pub percent: u8,
    pub detail: String,
    pub updated_at: DateTime<Utc>,
}

/// Durable per-entity status store
pub trait ProgressStore: Send + Sync {
    fn set_status(&self, entity_id: &str, phase: &str, percent: u8, detail: &str) -> Result<()>;

    fn get_status(&self, entity_id: &str) -> Result<Option<ProgressStatus>>;
}

/// In-memory progress store
#[derive(Debug, Default)]
pub struct MemoryProgress {
    statuses: Mutex<HashMap<String, ProgressStatus>>,
}

impl MemoryProgress {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProgressStore for MemoryProgress {
    fn set_status(&self, entity_id: &str, phase: &str, percent: u8, detail: &str) -> Result<()> {
        let mut statuses = self
            .statuses
            .lock()
            .map_err(|_| Error::Store("progress mutex poisoned".into()))?;
        statuses.insert(
            entity_id.to_string(),
            ProgressStatus {
                phase: phase.to_string(),
                percent: percent.min(100),
                detail: detail.to_string(),
                updated_at: Utc::now(),
            },
        );
        Ok(())
    }

    fn get_status(&self, entity_id: &str) -> Result<Option<ProgressStatus>> {
        let statuses = self
            .statuses
            .lock()
            .map_err(|_| Error::Store("progress mutex poisoned".into()))?;
        Ok(statuses.get(entity_id).cloned())
    }
}

/// Read-only key/value configuration, consumed when a driver is built
pub trait ConfigSource {
    fn get(&self, key: &str) -> Option<String>;
}

/// Configuration backed by a fixed map
#[derive(Debug, Clone, Default)]
pub struct StaticConfig {
    values: BTreeMap<String, String>,
}

impl StaticConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigSource for StaticConfig {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Setting keys read by [`DriverSettings::load`]
pub mod keys {
    pub const LOCK_TTL_SECS: &str = "lock.ttl_secs";
    pub const LOCK_HEARTBEAT_SECS: &str = "lock.heartbeat_secs";
    pub const LOCK_WAIT_SECS: &str = "lock.wait_secs";
    pub const COMMAND_TIMEOUT_SECS: &str = "command.timeout_secs";
    pub const RETRY_MAX_ATTEMPTS: &str = "retry.max_attempts";
    pub const RETRY_BASE_DELAY_MS: &str = "retry.base_delay_ms";
    pub const FANOUT_JOBS: &str = "fanout.jobs";
    pub const UNDO_WITHOUT_FORWARD_RECORD: &str = "undo.run_without_forward_record";

    pub const ALL: [&str; 8] = [
        LOCK_TTL_SECS,
        LOCK_HEARTBEAT_SECS,
        LOCK_WAIT_SECS,
        COMMAND_TIMEOUT_SECS,
        RETRY_MAX_ATTEMPTS,
        RETRY_BASE_DELAY_MS,
        FANOUT_JOBS,
        UNDO_WITHOUT_FORWARD_RECORD,
    ];
}

/// Engine tunables, read once from a [`ConfigSource`]
#[derive(Debug, Clone, PartialEq)]
pub struct DriverSettings {
    /// Lease lifetime without renewal
    pub lock_ttl: Duration,
    /// Renewal interval for long critical sections
    pub heartbeat_interval: Duration,
    /// How long to wait for a busy lease before giving up
    pub lock_wait: Duration,
    /// Per-command timeout handed to the host session
    pub command_timeout: Duration,
    /// In-step retry policy for transient failures
    pub retry: RetryConfig,
    /// Maximum hosts contacted in parallel by one step
    pub fanout_jobs: usize,
    /// Run undo sub-steps even when no forward record exists
    pub undo_without_forward_record: bool,
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(600),
            heartbeat_interval: Duration::from_secs(60),
            lock_wait: Duration::from_secs(120),
            command_timeout: Duration::from_secs(1800),
            retry: RetryConfig::new(3, Duration::from_millis(2000)),
            fanout_jobs: 8,
            undo_without_forward_record: false,
        }
    }
}

fn read<T>(source: &dyn ConfigSource, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match source.get(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| Error::invalid_setting(key, format!("'{raw}': {e}"))),
    }
}

impl DriverSettings {
    /// Read settings, falling back to defaults for missing keys.
    ///
    /// A present but unparseable value is a configuration error.
    pub fn load(source: &dyn ConfigSource) -> Result<Self> {
        let defaults = Self::default();

        let ttl = read(source, keys::LOCK_TTL_SECS, defaults.lock_ttl.as_secs())?;
        let heartbeat = read(
            source,
            keys::LOCK_HEARTBEAT_SECS,
            defaults.heartbeat_interval.as_secs(),
        )?;
        let wait = read(source, keys::LOCK_WAIT_SECS, defaults.lock_wait.as_secs())?;
        let timeout = read(
            source,
            keys::COMMAND_TIMEOUT_SECS,
            defaults.command_timeout.as_secs(),
        )?;
        let attempts = read(source, keys::RETRY_MAX_ATTEMPTS, defaults.retry.max_attempts)?;
        let base_delay_ms = read(source, keys::RETRY_BASE_DELAY_MS, 2000u64)?;
        let jobs = read(source, keys::FANOUT_JOBS, defaults.fanout_jobs)?;
        let undo_without_forward_record = read(
            source,
            keys::UNDO_WITHOUT_FORWARD_RECORD,
            defaults.undo_without_forward_record,
        )?;

        if ttl == 0 {
            return Err(Error::invalid_setting(keys::LOCK_TTL_SECS, "must be positive"));
        }
        if heartbeat == 0 || heartbeat >= ttl {
            return Err(Error::invalid_setting(
                keys::LOCK_HEARTBEAT_SECS,
                format!("must be between 1 and {} (lock ttl)", ttl - 1),
            ));
        }
        if attempts == 0 {
            return Err(Error::invalid_setting(
                keys::RETRY_MAX_ATTEMPTS,
                "must be at least 1",
            ));
        }
        if jobs == 0 {
            return Err(Error::invalid_setting(keys::FANOUT_JOBS, "must be at least 1"));
        }

        Ok(Self {
            lock_ttl: Duration::from_secs(ttl),
            heartbeat_interval: Duration::from_secs(heartbeat),
            lock_wait: Duration::from_secs(wait),
            command_timeout: Duration::from_secs(timeout),
            retry: RetryConfig::new(attempts, Duration::from_millis(base_delay_ms)),
            fanout_jobs: jobs,
            undo_without_forward_record,
        })
    }
}

/// Process-scoped collaborators handed to the driver at start-up.
///
/// Cloning shares the same underlying stores.
#[derive(Clone)]
pub struct Services {
    pub session: Arc<dyn HostSession>,
    pub progress: Arc<dyn ProgressStore>,
    pub ledger: Arc<dyn CompletionLedger>,
    pub locks: Arc<dyn LockService>,
    pub spans: Arc<dyn SpanSink>,
}

impl Services {
    /// Services with in-memory stores around the given session
    pub fn in_memory(session: Arc<dyn HostSession>) -> Self {
        Self {
            session,
            progress: Arc::new(MemoryProgress::new()),
            ledger: Arc::new(MemoryLedger::new()),
            locks: Arc::new(LeaseTable::new()),
            spans: Arc::new(NullSink),
        }
    }

    pub fn with_spans(mut self, spans: Arc<dyn SpanSink>) -> Self {
        self.spans = spans;
        self
    }

    pub fn with_locks(mut self, locks: Arc<dyn LockService>) -> Self {
        self.locks = locks;
        self
    }
}

/// Injected failure for [`RecordingSession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    Unreachable,
    Timeout,
    Exit { code: i32, stderr: String },
}

#[derive(Debug)]
struct FaultRule {
    host: Option<String>,
    pattern: String,
    fault: Fault,
    remaining: Option<u32>,
}

/// Session that records every command and reports success.
///
/// Faults can be scripted per host and command fragment. Used for dry runs
/// and by tests of steps and the driver.
#[derive(Debug, Default)]
pub struct RecordingSession {
    calls: Mutex<Vec<(String, String)>>,
    rules: Mutex<Vec<FaultRule>>,
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail commands containing `pattern` (on `host`, or any host).
    ///
    /// `times` bounds how many calls fail; `None` fails forever.
    pub fn fail(&self, host: Option<&str>, pattern: &str, fault: Fault, times: Option<u32>) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(FaultRule {
                host: host.map(str::to_string),
                pattern: pattern.to_string(),
                fault,
                remaining: times,
            });
        }
    }

    /// Remove all scripted faults
    pub fn heal(&self) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.clear();
        }
    }

    /// Every (host, command) seen so far, in call order
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    /// Number of calls whose command contains `pattern`
    pub fn count(&self, pattern: &str) -> usize {
        self.calls()
            .iter()
            .filter(|(_, cmd)| cmd.contains(pattern))
            .count()
    }

    fn take_fault(&self, host: &str, command: &str) -> Option<Fault> {
        let mut rules = self.rules.lock().ok()?;
        let rule = rules.iter_mut().find(|r| {
            r.host.as_deref().is_none_or(|h| h == host)
                && command.contains(&r.pattern)
                && r.remaining != Some(0)
        })?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        Some(rule.fault.clone())
    }
}

impl HostSession for RecordingSession {
    fn run(&self, host: &str, command: &str, timeout: Duration) -> Result<CommandOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push((host.to_string(), command.to_string()));
        }
        match self.take_fault(host, command) {
            None => Ok(CommandOutput::ok("")),
            Some(Fault::Unreachable) => Err(Error::HostUnreachable {
                host: host.to_string(),
                message: "connection refused".into(),
            }),
            Some(Fault::Timeout) => Err(Error::Timeout {
                host: host.to_string(),
                command: command.to_string(),
                timeout,
            }),
            Some(Fault::Exit { code, stderr }) => Ok(CommandOutput {
                exit_code: code,
                stdout: String::new(),
                stderr,
            }),
        }
    }
}
