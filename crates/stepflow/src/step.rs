//! Step trait and the context steps run against
//!
//! A step is a forward action plus its compensating undo action. Its work
//! is split into named sub-steps; each one is checked against the
//! completion ledger before running and recorded right after it succeeds,
//! so a re-run after a crash skips exactly the finished units.

use crate::cluster::ClusterContext;
use crate::context::{DriverSettings, Remote, Services};
use crate::error::Result;
use crate::fanout::fan_out;
use crate::lock::{LeaseGuard, LeasePolicy, holder_id};
use crate::retry::{LogCallback, with_retry};
use crate::types::{RunOptions, StepOutcome, SubStepReport, SubStepStatus};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Pipeline stage identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepKind {
    ValidateConfig,
    PrevmChecks,
    PrevmSetup,
    CreateVm,
    CreateUser,
    PostvmInstall,
    CreateStorage,
    InstallClusterSoftware,
    PostClusterInstall,
    DbInstall,
    PostInstallConfig,
    StorageComplete,
    GoldenBackup,
}

impl StepKind {
    pub const ALL: [StepKind; 13] = [
        StepKind::ValidateConfig,
        StepKind::PrevmChecks,
        StepKind::PrevmSetup,
        StepKind::CreateVm,
        StepKind::CreateUser,
        StepKind::PostvmInstall,
        StepKind::CreateStorage,
        StepKind::InstallClusterSoftware,
        StepKind::PostClusterInstall,
        StepKind::DbInstall,
        StepKind::PostInstallConfig,
        StepKind::StorageComplete,
        StepKind::GoldenBackup,
    ];

    /// Stable wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKind::ValidateConfig => "validate-config",
            StepKind::PrevmChecks => "prevm-checks",
            StepKind::PrevmSetup => "prevm-setup",
            StepKind::CreateVm => "create-vm",
            StepKind::CreateUser => "create-user",
            StepKind::PostvmInstall => "postvm-install",
            StepKind::CreateStorage => "create-storage",
            StepKind::InstallClusterSoftware => "install-cluster-software",
            StepKind::PostClusterInstall => "post-cluster-install",
            StepKind::DbInstall => "db-install",
            StepKind::PostInstallConfig => "post-install-config",
            StepKind::StorageComplete => "storage-complete",
            StepKind::GoldenBackup => "golden-backup",
        }
    }

    /// Look up a wire name
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim();
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure semantics of an undo sub-step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UndoPolicy {
    /// Non-essential cleanup: log the error, record it, keep going
    BestEffort,
    /// Quota, billing or allocation changes, or anything later undo
    /// steps depend on: abort the chain
    FailFast,
}

/// A forward action and its compensating undo action
///
/// Implementations hold no run state of their own; everything they touch
/// comes through the [`StepContext`]. Side effects are limited to hosts
/// listed in the cluster context.
pub trait Step: Send + Sync + fmt::Debug {
    /// Which stage this implements
    fn kind(&self) -> StepKind;

    /// Human-readable description
    fn description(&self) -> String {
        self.kind().to_string()
    }

    /// Provision. `step_list` is the full list of the current invocation.
    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome>;

    /// Compensate what `do_execute` did
    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome>;
}

pub type BoxedStep = Box<dyn Step>;

/// Overall percentage after finishing `step` within `step_list`
pub fn position_percent(step_list: &[StepKind], step: StepKind) -> u8 {
    if step_list.is_empty() {
        return 0;
    }
    let done = step_list
        .iter()
        .position(|s| *s == step)
        .map_or(0, |i| i + 1);
    u8::try_from(done * 100 / step_list.len()).unwrap_or(100)
}

fn undo_key(forward: &str) -> String {
    format!("undo:{forward}")
}

/// Everything a step may use during one invocation
pub struct StepContext<'a> {
    cluster: &'a mut ClusterContext,
    services: &'a Services,
    settings: &'a DriverSettings,
    step: StepKind,
    force_undo: bool,
    reports: Vec<SubStepReport>,
}

impl<'a> StepContext<'a> {
    pub fn new(
        cluster: &'a mut ClusterContext,
        services: &'a Services,
        settings: &'a DriverSettings,
        step: StepKind,
    ) -> Self {
        let force_undo = settings.undo_without_forward_record;
        Self {
            cluster,
            services,
            settings,
            step,
            force_undo,
            reports: Vec::new(),
        }
    }

    /// Run undo sub-steps even when no forward record exists
    pub fn with_force_undo(mut self, force: bool) -> Self {
        self.force_undo |= force;
        self
    }

    pub fn cluster(&self) -> &ClusterContext {
        self.cluster
    }

    pub fn cluster_mut(&mut self) -> &mut ClusterContext {
        self.cluster
    }

    pub fn settings(&self) -> &DriverSettings {
        self.settings
    }

    pub fn step(&self) -> StepKind {
        self.step
    }

    /// Command runner using the configured timeout
    pub fn remote(&self) -> Remote<'_> {
        Remote::new(self.services.session.as_ref(), self.settings.command_timeout)
    }

    /// Run `op` on every host, collecting all results before deciding.
    ///
    /// Any host failure yields [`crate::Error::HostFailures`] for this step.
    pub fn fan_out<T, F>(&self, hosts: &[String], op: F) -> Result<Vec<(String, T)>>
    where
        T: Send,
        F: Fn(Remote<'_>, &str) -> Result<T> + Sync,
    {
        let remote = self.remote();
        fan_out(hosts, self.settings.fanout_jobs, |host| op(remote, host))
            .into_result(self.step.as_str())
    }

    /// Retry transient failures of `f` a bounded number of times
    pub fn retry<T, F>(&self, name: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Result<T>,
    {
        with_retry(name, &self.settings.retry, Some(&LogCallback), f)
    }

    fn lease_policy(&self, heartbeat: bool) -> LeasePolicy {
        LeasePolicy {
            ttl: self.settings.lock_ttl,
            wait: self.settings.lock_wait,
            heartbeat: heartbeat.then_some(self.settings.heartbeat_interval),
        }
    }

    fn holder(&self) -> String {
        holder_id(&self.cluster.operation.request_id, &self.cluster.cluster_id)
    }

    /// Enter a short critical section over `keys`
    pub fn critical_section(&self, keys: &[String]) -> Result<LeaseGuard> {
        LeaseGuard::acquire(
            Arc::clone(&self.services.locks),
            keys,
            &self.holder(),
            self.lease_policy(false),
        )
    }

    /// Enter a critical section whose leases are renewed until the guard drops
    pub fn critical_section_with_heartbeat(&self, keys: &[String]) -> Result<LeaseGuard> {
        LeaseGuard::acquire(
            Arc::clone(&self.services.locks),
            keys,
            &self.holder(),
            self.lease_policy(true),
        )
    }

    fn ledger_done(&self, sub_step: &str) -> Result<bool> {
        self.services
            .ledger
            .is_done(&self.cluster.cluster_id, self.step.as_str(), sub_step)
    }

    /// Mark `sub_step` done and reopen `opposite` so the other direction runs again
    fn ledger_settle(&self, sub_step: &str, opposite: &str) -> Result<()> {
        self.services.ledger.settle(
            &self.cluster.cluster_id,
            self.step.as_str(),
            sub_step,
            opposite,
        )
    }

    fn push(&mut self, name: &str, status: SubStepStatus) {
        self.reports.push(SubStepReport {
            name: name.to_string(),
            status,
        });
    }

    /// Run a forward sub-step unless the ledger already has it done.
    ///
    /// The record is written only after `f` returns successfully, and a
    /// finished undo of the same sub-step is reopened.
    pub fn sub_step<F>(&mut self, name: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        if self.ledger_done(name)? {
            log::debug!("{}: {} already done, skipping", self.step, name);
            self.push(name, SubStepStatus::Skipped);
            return Ok(());
        }
        f(self)?;
        self.ledger_settle(name, &undo_key(name))?;
        self.push(name, SubStepStatus::Ran);
        Ok(())
    }

    /// Run the undo of forward sub-step `forward`.
    ///
    /// Skipped when its own undo record is done. A no-op when the forward
    /// sub-step never completed, unless undo is forced. Failures follow
    /// `policy`. Success reopens the forward record, so a later forward
    /// run repeats the work.
    pub fn undo_sub_step<F>(&mut self, forward: &str, policy: UndoPolicy, f: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        let key = undo_key(forward);
        if self.ledger_done(&key)? {
            log::debug!("{}: undo of {} already done, skipping", self.step, forward);
            self.push(&key, SubStepStatus::Skipped);
            return Ok(());
        }
        if !self.force_undo && !self.services.ledger.is_done(
            &self.cluster.cluster_id,
            self.step.as_str(),
            forward,
        )? {
            log::debug!("{}: {} never completed, nothing to undo", self.step, forward);
            self.push(&key, SubStepStatus::NoOp);
            return Ok(());
        }

        match f(self) {
            Ok(()) => {
                self.ledger_settle(&key, forward)?;
                self.push(&key, SubStepStatus::Ran);
                Ok(())
            }
            Err(e) if policy == UndoPolicy::BestEffort => {
                log::warn!("{}: ignoring failed cleanup {}: {}", self.step, forward, e);
                self.push(
                    &key,
                    SubStepStatus::FailedBestEffort {
                        error: e.to_string(),
                    },
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Publish this step's position in the current invocation
    pub fn report_progress(&self, step_list: &[StepKind], detail: &str) {
        let percent = position_percent(step_list, self.step);
        if let Err(e) = self.services.progress.set_status(
            &self.cluster.cluster_id,
            self.step.as_str(),
            percent,
            detail,
        ) {
            log::warn!("Failed to update progress for {}: {}", self.cluster.cluster_id, e);
        }
    }

    /// Sub-step reports gathered so far
    pub fn take_reports(&mut self) -> Vec<SubStepReport> {
        std::mem::take(&mut self.reports)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Fault, RecordingSession};
    use crate::error::{Error, ErrorKind};

    struct Fixture {
        cluster: ClusterContext,
        services: Services,
        settings: DriverSettings,
        session: Arc<RecordingSession>,
    }

    fn fixture() -> Fixture {
        let session = Arc::new(RecordingSession::new());
        Fixture {
            cluster: ClusterContext::new("clu1")
                .with_pair("kvm01", "vm01")
                .with_pair("kvm02", "vm02"),
            services: Services::in_memory(session.clone()),
            settings: DriverSettings::default(),
            session,
        }
    }

    #[test]
    fn test_step_kind_names() {
        for kind in StepKind::ALL {
            assert_eq!(StepKind::from_name(kind.as_str()), Some(kind));
        }
        assert_eq!(StepKind::from_name(" create-vm "), Some(StepKind::CreateVm));
        assert_eq!(StepKind::from_name("create_vm"), None);
    }

    #[test]
    fn test_position_percent() {
        let list = [StepKind::CreateVm, StepKind::CreateUser, StepKind::DbInstall, StepKind::GoldenBackup];
        assert_eq!(position_percent(&list, StepKind::CreateVm), 25);
        assert_eq!(position_percent(&list, StepKind::GoldenBackup), 100);
        assert_eq!(position_percent(&list, StepKind::PrevmChecks), 0);
        assert_eq!(position_percent(&[], StepKind::CreateVm), 0);
    }

    #[test]
    fn test_sub_step_records_after_success() {
        let mut fx = fixture();
        let mut ctx = StepContext::new(&mut fx.cluster, &fx.services, &fx.settings, StepKind::CreateUser);

        let err = ctx
            .sub_step("USERS", |_| Err(Error::step_failed("create-user", "boom")))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::FatalStep);
        assert!(!fx.services.ledger.is_done("clu1", "create-user", "USERS").unwrap());

        let mut runs = 0;
        ctx.sub_step("USERS", |_| {
            runs += 1;
            Ok(())
        })
        .unwrap();
        ctx.sub_step("USERS", |_| {
            runs += 1;
            Ok(())
        })
        .unwrap();
        assert_eq!(runs, 1);

        let reports = ctx.take_reports();
        assert_eq!(reports[0].status, SubStepStatus::Ran);
        assert_eq!(reports[1].status, SubStepStatus::Skipped);
    }

    #[test]
    fn test_undo_without_forward_record_is_noop() {
        let mut fx = fixture();
        let mut ctx = StepContext::new(&mut fx.cluster, &fx.services, &fx.settings, StepKind::CreateVm);
        let mut ran = false;
        ctx.undo_sub_step("CREATE_VM", UndoPolicy::FailFast, |_| {
            ran = true;
            Ok(())
        })
        .unwrap();
        assert!(!ran);
        assert_eq!(ctx.take_reports()[0].status, SubStepStatus::NoOp);
    }

    #[test]
    fn test_forced_undo_runs_without_record() {
        let mut fx = fixture();
        let mut ctx = StepContext::new(&mut fx.cluster, &fx.services, &fx.settings, StepKind::CreateVm)
            .with_force_undo(true);
        let mut ran = false;
        ctx.undo_sub_step("CREATE_VM", UndoPolicy::FailFast, |_| {
            ran = true;
            Ok(())
        })
        .unwrap();
        assert!(ran);
    }

    #[test]
    fn test_undo_policies() {
        let mut fx = fixture();
        fx.services.ledger.mark_done("clu1", "create-user", "SSH_DIR").unwrap();
        fx.services.ledger.mark_done("clu1", "create-user", "USERS").unwrap();
        let mut ctx = StepContext::new(&mut fx.cluster, &fx.services, &fx.settings, StepKind::CreateUser);

        ctx.undo_sub_step("SSH_DIR", UndoPolicy::BestEffort, |_| {
            Err(Error::step_failed("create-user", "no such dir"))
        })
        .unwrap();
        let err = ctx
            .undo_sub_step("USERS", UndoPolicy::FailFast, |_| {
                Err(Error::step_failed("create-user", "userdel failed"))
            })
            .unwrap_err();
        assert!(err.to_string().contains("userdel failed"));

        let reports = ctx.take_reports();
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].status, SubStepStatus::FailedBestEffort { .. }));
        // best-effort failure is not recorded, a later undo retries it
        assert!(!fx.services.ledger.is_done("clu1", "create-user", "undo:SSH_DIR").unwrap());
    }

    #[test]
    fn test_fan_out_uses_session() {
        let mut fx = fixture();
        fx.session.fail(Some("vm02"), "mkdir", Fault::Unreachable, None);
        let ctx = StepContext::new(&mut fx.cluster, &fx.services, &fx.settings, StepKind::CreateUser);
        let hosts = ctx.cluster().workload_hosts();

        let err = ctx
            .fan_out(&hosts, |remote, host| remote.run_checked(host, "mkdir -p /u01"))
            .unwrap_err();
        match err {
            Error::HostFailures { step, failures } => {
                assert_eq!(step, "create-user");
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].host, "vm02");
            }
            other => panic!("unexpected error {other}"),
        }
        assert_eq!(fx.session.count("mkdir"), 2);
    }

    #[test]
    fn test_critical_section_holder() {
        let mut fx = fixture();
        fx.cluster.operation.request_id = "req42".into();
        let ctx = StepContext::new(&mut fx.cluster, &fx.services, &fx.settings, StepKind::CreateVm);
        let guard = ctx.critical_section(&["host:kvm01".to_string()]).unwrap();
        assert!(guard.holder().starts_with("req42_"));
        let lease = fx.services.locks.lease("host:kvm01").unwrap().unwrap();
        assert_eq!(lease.holder, guard.holder());
    }
}
