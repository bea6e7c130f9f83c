//! Pipeline driver: walks a step list forward or in undo direction
//!
//! `Idle -> Resolving -> Executing(i) -> {Executing(i+1), Failed, Done}`
//!
//! The driver is single-threaded and never retries or reorders. Undo lists
//! are walked exactly as given; callers reverse them before submitting.

use crate::cluster::{ClusterContext, Direction, Operation, Profile};
use crate::context::{ConfigSource, DriverSettings, Services};
use crate::error::{Error, Result};
use crate::registry::{StepConstructor, StepRegistry};
use crate::step::{StepContext, StepKind};
use crate::telemetry::Telemetry;
use crate::types::{DriverState, PipelineResult, RunOptions};
use std::sync::Arc;

/// Runs pipelines against one registry and one set of services
pub struct Driver<'r> {
    registry: &'r StepRegistry,
    services: Services,
    settings: DriverSettings,
    telemetry: Telemetry,
    state: DriverState,
}

impl<'r> Driver<'r> {
    /// Build a driver, reading settings from `config` once
    pub fn new(
        registry: &'r StepRegistry,
        services: Services,
        config: &dyn ConfigSource,
    ) -> Result<Self> {
        let settings = DriverSettings::load(config)?;
        Ok(Self::with_settings(registry, services, settings))
    }

    pub fn with_settings(
        registry: &'r StepRegistry,
        services: Services,
        settings: DriverSettings,
    ) -> Self {
        let telemetry = Telemetry::new(Arc::clone(&services.spans));
        Self {
            registry,
            services,
            settings,
            telemetry,
            state: DriverState::Idle,
        }
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn settings(&self) -> &DriverSettings {
        &self.settings
    }

    pub fn services(&self) -> &Services {
        &self.services
    }

    /// Spans of the most recent run
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    fn transition(&mut self, next: DriverState) {
        log::debug!("Driver {} -> {}", self.state, next);
        self.state = next;
    }

    fn set_progress(&self, cluster_id: &str, phase: &str, percent: usize, detail: &str) {
        let percent = u8::try_from(percent.min(100)).unwrap_or(100);
        if let Err(e) = self
            .services
            .progress
            .set_status(cluster_id, phase, percent, detail)
        {
            log::warn!("Failed to update progress for {}: {}", cluster_id, e);
        }
    }

    fn reject(&mut self, mut result: PipelineResult, failed: Option<String>, e: &Error) -> PipelineResult {
        log::error!("Rejected {} request for {}: {}", result.direction, result.cluster_id, e);
        self.transition(DriverState::Failed);
        result.fail(failed, e);
        result
    }

    /// Run `step_names` against `cluster` in `direction`.
    ///
    /// `profile` defaults to the one detected from the cluster options after
    /// the caller's overrides were merged. Execution stops at the first
    /// failing step; the result names it together with every step that
    /// completed before it.
    pub fn run_pipeline<S: AsRef<str>>(
        &mut self,
        cluster: &mut ClusterContext,
        profile: Option<Profile>,
        step_names: &[S],
        direction: Direction,
        options: &RunOptions,
    ) -> PipelineResult {
        self.state = DriverState::Idle;
        cluster.operation = Operation {
            direction,
            request_id: options.request_id.clone(),
        };
        cluster.reconcile(&options.overrides);
        self.telemetry.flush();

        self.transition(DriverState::Resolving);
        let cluster_id = cluster.cluster_id.clone();
        let profile = profile.unwrap_or_else(|| Profile::detect(cluster));
        let result = PipelineResult::new(&cluster_id, profile, direction);

        if let Err(e) = cluster.validate() {
            return self.reject(result, None, &e);
        }
        let resolved = match self.registry.resolve_all(step_names, profile) {
            Ok(resolved) => resolved,
            Err(e) => {
                let failed = match &e {
                    Error::UnknownStep { name, .. } => Some(name.clone()),
                    _ => None,
                };
                return self.reject(result, failed, &e);
            }
        };
        let step_list: Vec<StepKind> = resolved.iter().map(|(kind, _)| *kind).collect();

        if options.fresh {
            if let Err(e) = self.services.ledger.reset(&cluster_id) {
                return self.reject(result, None, &e);
            }
            log::info!("Starting fresh {} operation on {}", direction, cluster_id);
        }

        log::info!(
            "Running {} step(s) {} on {} (profile {})",
            step_list.len(),
            direction,
            cluster_id,
            profile
        );
        self.execute(cluster, &step_list, resolved, options, result)
    }

    fn execute(
        &mut self,
        cluster: &mut ClusterContext,
        step_list: &[StepKind],
        resolved: Vec<(StepKind, StepConstructor)>,
        options: &RunOptions,
        mut result: PipelineResult,
    ) -> PipelineResult {
        let cluster_id = cluster.cluster_id.clone();
        let direction = result.direction;
        let total = step_list.len();

        for (i, (kind, make)) in resolved.into_iter().enumerate() {
            self.transition(DriverState::Executing(i));
            let step = make();
            log::info!("[{}/{}] {} ({})", i + 1, total, step.description(), direction);
            self.set_progress(&cluster_id, kind.as_str(), i * 100 / total, "running");

            let services = &self.services;
            let settings = &self.settings;
            let outcome = self.telemetry.instrument(&cluster_id, kind, direction, step_list, || {
                let mut ctx = StepContext::new(&mut *cluster, services, settings, kind)
                    .with_force_undo(options.force_undo || settings.undo_without_forward_record);
                let mut outcome = match direction {
                    Direction::Forward => step.do_execute(&mut ctx, options, step_list)?,
                    Direction::Undo => step.undo_execute(&mut ctx, options, step_list)?,
                };
                let mut sub_steps = ctx.take_reports();
                sub_steps.append(&mut outcome.sub_steps);
                outcome.sub_steps = sub_steps;
                Ok(outcome)
            });

            match outcome {
                Ok(outcome) => {
                    if outcome.return_code == 0 {
                        log::info!("{} finished: {}", kind, outcome.message);
                    } else {
                        log::warn!(
                            "{} finished with return code {}: {}",
                            kind,
                            outcome.return_code,
                            outcome.message
                        );
                    }
                    for failure in outcome.best_effort_failures() {
                        log::warn!("{}: cleanup {} left behind", kind, failure.name);
                    }
                    result.record(kind, outcome);
                    self.set_progress(&cluster_id, kind.as_str(), (i + 1) * 100 / total, "completed");
                }
                Err(e) => {
                    log::error!("{} failed on {}: {}", kind, cluster_id, e);
                    self.set_progress(&cluster_id, "failed", i * 100 / total, &e.to_string());
                    self.transition(DriverState::Failed);
                    result.fail(Some(kind.as_str().to_string()), &e);
                    self.telemetry.report();
                    return result;
                }
            }
        }

        self.transition(DriverState::Done);
        result.state = DriverState::Done;
        self.set_progress(&cluster_id, "done", 100, &format!("{direction} complete"));
        self.telemetry.report();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{Fault, RecordingSession, StaticConfig, keys};
    use crate::error::ErrorKind;
    use crate::ledger::CompletionState;
    use crate::lock::LockService;
    use crate::step::{BoxedStep, Step, UndoPolicy};
    use crate::telemetry::MemorySink;
    use crate::types::{StepOutcome, SubStepStatus};
    use std::collections::BTreeSet;
    use std::time::Duration;

    /// Two sub-steps on the control hosts, inside a critical section
    #[derive(Debug)]
    struct VmStep;

    impl Step for VmStep {
        fn kind(&self) -> StepKind {
            StepKind::CreateVm
        }

        fn do_execute(
            &self,
            ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            let hosts = ctx.cluster().control_hosts();
            let keys: Vec<String> = hosts.iter().map(|h| format!("host:{h}")).collect();
            let _guard = ctx.critical_section(&keys)?;
            ctx.sub_step("CREATE_VM", |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "vm create"))
                    .map(|_| ())
            })?;
            ctx.sub_step("START_VM", |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "vm start"))
                    .map(|_| ())
            })?;
            ctx.report_progress(step_list, "vms running");
            Ok(StepOutcome::ok("vms running"))
        }

        fn undo_execute(
            &self,
            ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            let hosts = ctx.cluster().control_hosts();
            ctx.undo_sub_step("START_VM", UndoPolicy::FailFast, |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "vm stop"))
                    .map(|_| ())
            })?;
            ctx.undo_sub_step("CREATE_VM", UndoPolicy::FailFast, |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "vm delete"))
                    .map(|_| ())
            })?;
            Ok(StepOutcome::ok("vms removed"))
        }
    }

    #[derive(Debug)]
    struct UserStep;

    impl Step for UserStep {
        fn kind(&self) -> StepKind {
            StepKind::CreateUser
        }

        fn do_execute(
            &self,
            ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            let hosts = ctx.cluster().workload_hosts();
            ctx.sub_step("USERS", |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "useradd grid"))
                    .map(|_| ())
            })?;
            ctx.sub_step("SSH_DIR", |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "mkdir .ssh"))
                    .map(|_| ())
            })?;
            Ok(StepOutcome::ok("users created"))
        }

        fn undo_execute(
            &self,
            ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            let hosts = ctx.cluster().workload_hosts();
            ctx.undo_sub_step("SSH_DIR", UndoPolicy::BestEffort, |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "rm -rf .ssh"))
                    .map(|_| ())
            })?;
            ctx.undo_sub_step("USERS", UndoPolicy::FailFast, |ctx| {
                ctx.fan_out(&hosts, |r, h| r.run_checked(h, "userdel grid"))
                    .map(|_| ())
            })?;
            Ok(StepOutcome::ok("users removed"))
        }
    }

    #[derive(Debug)]
    struct GridStep;

    impl Step for GridStep {
        fn kind(&self) -> StepKind {
            StepKind::InstallClusterSoftware
        }

        fn do_execute(
            &self,
            ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            let first = ctx.cluster().workload_hosts().remove(0);
            ctx.sub_step("INSTALL", |ctx| ctx.remote().run_checked(&first, "install grid").map(|_| ()))?;
            Ok(StepOutcome::ok("grid installed"))
        }

        fn undo_execute(
            &self,
            ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            let first = ctx.cluster().workload_hosts().remove(0);
            ctx.undo_sub_step("INSTALL", UndoPolicy::FailFast, |ctx| {
                ctx.remote().run_checked(&first, "deinstall grid").map(|_| ())
            })?;
            Ok(StepOutcome::ok("grid removed"))
        }
    }

    /// Signals "nothing to do" through a non-zero code
    #[derive(Debug)]
    struct NothingToDo;

    impl Step for NothingToDo {
        fn kind(&self) -> StepKind {
            StepKind::PostClusterInstall
        }

        fn do_execute(
            &self,
            _ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            Ok(StepOutcome::with_code(3, "already configured"))
        }

        fn undo_execute(
            &self,
            _ctx: &mut StepContext<'_>,
            _options: &RunOptions,
            _step_list: &[StepKind],
        ) -> Result<StepOutcome> {
            Ok(StepOutcome::ok(""))
        }
    }

    fn registry() -> StepRegistry {
        fn vm() -> BoxedStep {
            Box::new(VmStep)
        }
        fn user() -> BoxedStep {
            Box::new(UserStep)
        }
        fn grid() -> BoxedStep {
            Box::new(GridStep)
        }
        fn nothing() -> BoxedStep {
            Box::new(NothingToDo)
        }
        StepRegistry::builder()
            .profile(Profile::Standard, |p| {
                p.step(StepKind::CreateVm, "Create VMs", 4, vm)
                    .step(StepKind::CreateUser, "Create users", 5, user)
                    .step(StepKind::InstallClusterSoftware, "Install grid", 7, grid)
                    .step(StepKind::PostClusterInstall, "Post grid", 8, nothing)
            })
            .build()
            .unwrap()
    }

    struct Harness {
        registry: StepRegistry,
        session: Arc<RecordingSession>,
        spans: Arc<MemorySink>,
        services: Services,
    }

    impl Harness {
        fn new() -> Self {
            let session = Arc::new(RecordingSession::new());
            let spans = Arc::new(MemorySink::new());
            let services = Services::in_memory(session.clone()).with_spans(spans.clone());
            Self {
                registry: registry(),
                session,
                spans,
                services,
            }
        }

        fn driver(&self) -> Driver<'_> {
            let settings = DriverSettings {
                lock_wait: Duration::ZERO,
                ..DriverSettings::default()
            };
            Driver::with_settings(&self.registry, self.services.clone(), settings)
        }

        fn done_records(&self) -> BTreeSet<(String, String)> {
            self.services
                .ledger
                .records("clu1")
                .unwrap()
                .into_iter()
                .filter(|r| r.state == CompletionState::Done)
                .map(|r| (r.step, r.sub_step))
                .collect()
        }
    }

    fn cluster() -> ClusterContext {
        ClusterContext::new("clu1")
            .with_pair("kvm01", "vm01")
            .with_pair("kvm02", "vm02")
    }

    const FORWARD: [&str; 3] = ["create-vm", "create-user", "install-cluster-software"];
    const UNDO: [&str; 3] = ["install-cluster-software", "create-user", "create-vm"];

    fn run(h: &Harness, names: &[&str], direction: Direction) -> PipelineResult {
        h.driver().run_pipeline(
            &mut cluster(),
            Some(Profile::Standard),
            names,
            direction,
            &RunOptions::new("req1"),
        )
    }

    #[test]
    fn test_forward_success() {
        let h = Harness::new();
        let mut driver = h.driver();
        let result = driver.run_pipeline(
            &mut cluster(),
            None,
            &FORWARD,
            Direction::Forward,
            &RunOptions::new("req1"),
        );

        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(driver.state(), DriverState::Done);
        assert_eq!(
            result.completed_steps,
            [StepKind::CreateVm, StepKind::CreateUser, StepKind::InstallClusterSoftware]
        );
        assert_eq!(result.outcomes[0].outcome.ran_count(), 2);
        assert_eq!(h.session.count("vm create"), 2);
        assert_eq!(h.session.count("install grid"), 1);

        let status = h.services.progress.get_status("clu1").unwrap().unwrap();
        assert_eq!(status.phase, "done");
        assert_eq!(status.percent, 100);
        // critical section released after the step
        assert!(h.services.locks.leases().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_step_fails_before_executing() {
        let h = Harness::new();
        let result = run(&h, &["create-vm", "create-coffee"], Direction::Forward);

        assert_eq!(result.state, DriverState::Failed);
        assert_eq!(result.error_kind(), Some(ErrorKind::Configuration));
        assert_eq!(result.failed_step.as_deref(), Some("create-coffee"));
        assert!(result.completed_steps.is_empty());
        assert!(h.session.calls().is_empty());
        assert!(h.spans.spans().is_empty());
    }

    #[test]
    fn test_step_outside_profile_table_rejected() {
        let h = Harness::new();
        let result = run(&h, &["golden-backup"], Direction::Forward);
        assert_eq!(result.error.as_ref().map(|e| e.code), Some(0x0781));
        assert!(result.completed_steps.is_empty());
    }

    #[test]
    fn test_no_progress_past_failure() {
        let h = Harness::new();
        h.session.fail(
            Some("kvm02"),
            "vm start",
            Fault::Exit {
                code: 1,
                stderr: "not enough memory".into(),
            },
            None,
        );
        let result = run(&h, &FORWARD, Direction::Forward);

        assert_eq!(result.failed_step.as_deref(), Some("create-vm"));
        assert_eq!(result.error_kind(), Some(ErrorKind::FatalStep));
        let spans = h.spans.spans();
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].step, StepKind::CreateVm);
        assert!(!spans[0].succeeded());
        assert_eq!(h.session.count("useradd"), 0);
    }

    #[test]
    fn test_example_scenario_resumes_at_failed_step() {
        let h = Harness::new();
        h.session.fail(Some("vm01"), "useradd", Fault::Unreachable, None);

        let first = run(&h, &FORWARD, Direction::Forward);
        assert_eq!(first.failed_step.as_deref(), Some("create-user"));
        assert_eq!(first.completed_steps, [StepKind::CreateVm]);
        assert_eq!(first.error_kind(), Some(ErrorKind::TransientRemote));
        assert!(first.is_retryable());

        h.session.heal();
        let second = run(&h, &FORWARD, Direction::Forward);
        assert!(second.is_success());
        // create-vm was not re-run: every sub-step came from the ledger
        assert_eq!(h.session.count("vm create"), 2);
        assert_eq!(h.session.count("vm start"), 2);
        let vm_outcome = &second.outcomes[0].outcome;
        assert!(vm_outcome
            .sub_steps
            .iter()
            .all(|s| s.status == SubStepStatus::Skipped));
    }

    #[test]
    fn test_idempotent_resume_at_every_prefix() {
        let reference = Harness::new();
        assert!(run(&reference, &FORWARD, Direction::Forward).is_success());
        let expected = reference.done_records();

        let sub_step_commands = ["vm create", "vm start", "useradd", "mkdir .ssh", "install grid"];
        for (k, pattern) in sub_step_commands.iter().enumerate() {
            let h = Harness::new();
            h.session.fail(None, pattern, Fault::Unreachable, Some(1));

            assert!(!run(&h, &FORWARD, Direction::Forward).is_success());
            assert!(run(&h, &FORWARD, Direction::Forward).is_success());

            assert_eq!(h.done_records(), expected, "interrupted at {pattern}");
            // every earlier sub-step ran once per host, never again
            for earlier in &sub_step_commands[..k] {
                assert_eq!(
                    h.session.count(earlier),
                    2,
                    "{earlier} re-ran after interruption at {pattern}"
                );
            }
        }
    }

    #[test]
    fn test_non_zero_return_code_advances() {
        let h = Harness::new();
        let result = run(&h, &["post-cluster-install", "create-vm"], Direction::Forward);
        assert!(result.is_success());
        assert_eq!(result.outcomes[0].outcome.return_code, 3);
        assert_eq!(result.completed_steps.len(), 2);
    }

    #[test]
    fn test_undo_best_effort_continues() {
        let h = Harness::new();
        assert!(run(&h, &FORWARD, Direction::Forward).is_success());
        h.session.fail(Some("vm02"), "rm -rf .ssh", Fault::Timeout, None);

        let result = run(&h, &UNDO, Direction::Undo);
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(h.session.count("userdel"), 2);
        assert_eq!(h.session.count("vm delete"), 2);
        let user_outcome = &result.outcomes[1].outcome;
        assert_eq!(user_outcome.best_effort_failures().count(), 1);
    }

    #[test]
    fn test_undo_fail_fast_halts_chain() {
        let h = Harness::new();
        assert!(run(&h, &FORWARD, Direction::Forward).is_success());
        h.session.fail(
            Some("vm01"),
            "userdel",
            Fault::Exit {
                code: 8,
                stderr: "user busy".into(),
            },
            None,
        );

        let result = run(&h, &UNDO, Direction::Undo);
        assert_eq!(result.failed_step.as_deref(), Some("create-user"));
        assert_eq!(result.completed_steps, [StepKind::InstallClusterSoftware]);
        assert_eq!(h.session.count("vm stop"), 0);
        assert_eq!(h.session.count("vm delete"), 0);
    }

    #[test]
    fn test_undo_walks_caller_order() {
        let h = Harness::new();
        assert!(run(&h, &FORWARD, Direction::Forward).is_success());
        // not strictly reversed on purpose
        let result = run(&h, &["create-user", "install-cluster-software", "create-vm"], Direction::Undo);
        assert_eq!(
            result.completed_steps,
            [StepKind::CreateUser, StepKind::InstallClusterSoftware, StepKind::CreateVm]
        );
        let spans: Vec<StepKind> = h
            .spans
            .spans()
            .iter()
            .filter(|s| s.direction == Direction::Undo)
            .map(|s| s.step)
            .collect();
        assert_eq!(spans, result.completed_steps);
    }

    #[test]
    fn test_undo_without_forward_is_noop() {
        let h = Harness::new();
        let result = run(&h, &UNDO, Direction::Undo);
        assert!(result.is_success());
        assert!(h.session.calls().is_empty());
        assert!(result
            .outcomes
            .iter()
            .flat_map(|o| &o.outcome.sub_steps)
            .all(|s| s.status == SubStepStatus::NoOp));
    }

    #[test]
    fn test_forward_after_undo_provisions_again() {
        let h = Harness::new();
        assert!(run(&h, &FORWARD, Direction::Forward).is_success());
        assert!(run(&h, &UNDO, Direction::Undo).is_success());

        let result = run(&h, &FORWARD, Direction::Forward);
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(h.session.count("vm create"), 4);
        assert_eq!(h.session.count("useradd grid"), 4);

        assert!(run(&h, &UNDO, Direction::Undo).is_success());
        assert_eq!(h.session.count("vm delete"), 4);
        assert_eq!(h.session.count("userdel grid"), 4);

        // a repeated undo has nothing left to compensate
        assert!(run(&h, &UNDO, Direction::Undo).is_success());
        assert_eq!(h.session.count("vm delete"), 4);
    }

    #[test]
    fn test_interrupted_undo_resumes_without_repeating() {
        let h = Harness::new();
        assert!(run(&h, &FORWARD, Direction::Forward).is_success());
        h.session.fail(Some("vm01"), "userdel", Fault::Unreachable, Some(1));

        let result = run(&h, &UNDO, Direction::Undo);
        assert_eq!(result.failed_step.as_deref(), Some("create-user"));
        let result = run(&h, &UNDO, Direction::Undo);
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(h.session.count("deinstall grid"), 1);
        assert_eq!(h.session.count("rm -rf .ssh"), 2);
        assert_eq!(h.session.count("vm delete"), 2);
    }

    #[test]
    fn test_undo_without_forward_runs_when_configured() {
        let h = Harness::new();
        let settings = DriverSettings {
            lock_wait: Duration::ZERO,
            undo_without_forward_record: true,
            ..DriverSettings::default()
        };
        let mut driver = Driver::with_settings(&h.registry, h.services.clone(), settings);
        let result = driver.run_pipeline(
            &mut cluster(),
            Some(Profile::Standard),
            &UNDO,
            Direction::Undo,
            &RunOptions::new("req1"),
        );
        assert!(result.is_success());
        assert!(!h.session.calls().is_empty());
    }

    #[test]
    fn test_fresh_resets_ledger() {
        let h = Harness::new();
        assert!(run(&h, &FORWARD, Direction::Forward).is_success());
        let result = h.driver().run_pipeline(
            &mut cluster(),
            None,
            &FORWARD,
            Direction::Forward,
            &RunOptions::new("req2").fresh(),
        );
        assert!(result.is_success());
        assert_eq!(h.session.count("vm create"), 4);
    }

    #[test]
    fn test_busy_lock_is_retryable() {
        let h = Harness::new();
        h.services
            .locks
            .acquire("host:kvm02", "other-cluster_1", Duration::from_secs(600))
            .unwrap();
        let result = run(&h, &FORWARD, Direction::Forward);
        assert_eq!(result.error_kind(), Some(ErrorKind::LockUnavailable));
        assert!(result.is_retryable());
        assert_eq!(h.session.count("vm create"), 0);
        // the other key taken before the busy one was given back
        assert!(h.services.locks.lease("host:kvm01").unwrap().is_none());
    }

    #[test]
    fn test_overrides_reconciled_before_resolution() {
        let h = Harness::new();
        let mut ctx = cluster();
        let options = RunOptions::new("req1").with_override("pre_provisioned_base", "true");
        let result = h
            .driver()
            .run_pipeline(&mut ctx, None, &FORWARD, Direction::Forward, &options);

        assert_eq!(ctx.option("pre_provisioned_base"), Some("true"));
        assert_eq!(result.profile, Profile::PreProvisionedBase);
        // this registry has no such profile
        assert_eq!(result.error_kind(), Some(ErrorKind::Configuration));
        assert_eq!(ctx.operation.request_id, "req1");
    }

    #[test]
    fn test_spans_flushed_between_runs() {
        let h = Harness::new();
        let mut driver = h.driver();
        let options = RunOptions::new("req1");
        driver.run_pipeline(&mut cluster(), None, &FORWARD, Direction::Forward, &options);
        assert_eq!(driver.telemetry().spans().len(), 3);
        driver.run_pipeline(&mut cluster(), None, &["create-vm"], Direction::Forward, &options);
        assert_eq!(driver.telemetry().spans().len(), 1);
    }

    #[test]
    fn test_invalid_settings_rejected() {
        let registry = registry();
        let services = Services::in_memory(Arc::new(RecordingSession::new()));
        let config = StaticConfig::new().with(keys::LOCK_TTL_SECS, "soon");
        assert!(Driver::new(&registry, services, &config).is_err());
    }

    #[test]
    fn test_invalid_cluster_rejected() {
        let h = Harness::new();
        let result = h.driver().run_pipeline(
            &mut ClusterContext::new("empty"),
            None,
            &FORWARD,
            Direction::Forward,
            &RunOptions::default(),
        );
        assert_eq!(result.error_kind(), Some(ErrorKind::Configuration));
        assert!(result.failed_step.is_none());
    }
}
