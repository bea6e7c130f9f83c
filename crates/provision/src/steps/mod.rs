//! Step implementations, one module per provisioning area

pub mod backup;
pub mod cluster;
pub mod database;
pub mod prevm;
pub mod storage;
pub mod user;
pub mod validate;
pub mod vm;

use std::collections::BTreeMap;
use stepflow::{Error, Result, StepContext};

/// Run `command` on every host, failing with the per-host failure list
pub(crate) fn run_on_all(ctx: &StepContext<'_>, hosts: &[String], command: &str) -> Result<()> {
    ctx.fan_out(hosts, |remote, host| remote.run_checked(host, command))
        .map(|_| ())
}

/// Run a guest-specific command on the control host carrying each guest.
///
/// Failures are reported per guest.
pub(crate) fn run_per_guest<F>(ctx: &StepContext<'_>, build: F) -> Result<()>
where
    F: Fn(&str) -> String + Sync,
{
    let placement: BTreeMap<&str, &str> = ctx
        .cluster()
        .host_pairs
        .iter()
        .map(|p| (p.workload.as_str(), p.control.as_str()))
        .collect();
    let guests = ctx.cluster().workload_hosts();
    ctx.fan_out(&guests, |remote, guest| {
        let control = placement.get(guest).copied().unwrap_or(guest);
        remote.run_checked(control, &build(guest))
    })
    .map(|_| ())
}

/// Lease keys for a set of hosts
pub(crate) fn lock_keys(prefix: &str, hosts: &[String]) -> Vec<String> {
    hosts.iter().map(|h| format!("{prefix}:{h}")).collect()
}

/// Fail with a configuration error when a host list is empty
pub(crate) fn require_hosts(hosts: &[String], what: &str) -> Result<()> {
    if hosts.is_empty() {
        return Err(Error::InvalidCluster(format!("no {what} hosts defined")));
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;
    use stepflow::{
        ClusterContext, DriverSettings, RecordingSession, Result, RetryConfig, RunOptions,
        Services, Step, StepContext, StepKind, StepOutcome,
    };

    pub fn cluster() -> ClusterContext {
        ClusterContext::new("clu1")
            .with_pair("kvm01", "vm01")
            .with_pair("kvm02", "vm02")
            .with_storage_node("cell01")
            .with_storage_node("cell02")
    }

    /// One cluster with in-memory services around a recording session
    pub struct Bench {
        pub cluster: ClusterContext,
        pub services: Services,
        pub settings: DriverSettings,
        pub session: Arc<RecordingSession>,
        pub options: RunOptions,
    }

    impl Bench {
        pub fn new(cluster: ClusterContext) -> Self {
            let session = Arc::new(RecordingSession::new());
            Self {
                cluster,
                services: Services::in_memory(session.clone()),
                settings: DriverSettings {
                    lock_wait: Duration::ZERO,
                    retry: RetryConfig {
                        base_delay: Duration::from_millis(1),
                        ..RetryConfig::default()
                    },
                    ..DriverSettings::default()
                },
                session,
                options: RunOptions::new("req1"),
            }
        }

        fn invoke(&mut self, step: &dyn Step, list: &[StepKind], undo: bool) -> Result<StepOutcome> {
            let mut ctx = StepContext::new(&mut self.cluster, &self.services, &self.settings, step.kind());
            let mut outcome = if undo {
                step.undo_execute(&mut ctx, &self.options, list)?
            } else {
                step.do_execute(&mut ctx, &self.options, list)?
            };
            let mut reports = ctx.take_reports();
            reports.append(&mut outcome.sub_steps);
            outcome.sub_steps = reports;
            Ok(outcome)
        }

        pub fn forward(&mut self, step: &dyn Step) -> Result<StepOutcome> {
            let list = [step.kind()];
            self.invoke(step, &list, false)
        }

        pub fn forward_in(&mut self, step: &dyn Step, list: &[StepKind]) -> Result<StepOutcome> {
            self.invoke(step, list, false)
        }

        pub fn undo(&mut self, step: &dyn Step) -> Result<StepOutcome> {
            let list = [step.kind()];
            self.invoke(step, &list, true)
        }
    }
}
