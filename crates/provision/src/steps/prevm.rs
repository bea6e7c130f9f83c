//! Control-host preparation before any guest exists

use super::{require_hosts, run_on_all};
use crate::commands::{stage, undo_stage};
use stepflow::{Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

/// Hardware and control-host prechecks
#[derive(Debug, Default)]
pub struct PrevmChecks;

impl Step for PrevmChecks {
    fn kind(&self) -> StepKind {
        StepKind::PrevmChecks
    }

    fn description(&self) -> String {
        "Hardware and control host prechecks".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let hosts = ctx.cluster().control_hosts();
        require_hosts(&hosts, "control")?;

        for name in ["HW_PRECHECKS", "DOM0_PRECHECKS"] {
            let command = stage(&name.to_lowercase().replace('_', "-"));
            ctx.sub_step(name, |ctx| {
                ctx.retry(name, || run_on_all(ctx, &hosts, &command))
            })?;
        }

        ctx.report_progress(step_list, "prechecks passed");
        Ok(StepOutcome::ok("prechecks passed"))
    }

    fn undo_execute(
        &self,
        _ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        Ok(StepOutcome::ok("nothing to undo"))
    }
}

/// Network discovery, control-host setup and image staging.
///
/// On a pre-provisioned base the network and images already exist, so only
/// the control-host setup runs.
#[derive(Debug)]
pub struct PrevmSetup {
    pre_provisioned: bool,
}

impl PrevmSetup {
    pub fn standard() -> Self {
        Self {
            pre_provisioned: false,
        }
    }

    pub fn pre_provisioned() -> Self {
        Self {
            pre_provisioned: true,
        }
    }

    fn sub_steps(&self) -> &'static [&'static str] {
        if self.pre_provisioned {
            &["DOM0_SETUP"]
        } else {
            &["NETWORK_DISCOVERY", "DOM0_SETUP", "COPY_IMAGES"]
        }
    }
}

impl Step for PrevmSetup {
    fn kind(&self) -> StepKind {
        StepKind::PrevmSetup
    }

    fn description(&self) -> String {
        if self.pre_provisioned {
            "Control host setup on a pre-provisioned base".into()
        } else {
            "Network discovery, control host setup and image copy".into()
        }
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let hosts = ctx.cluster().control_hosts();
        require_hosts(&hosts, "control")?;

        for name in self.sub_steps() {
            let command = stage(&name.to_lowercase().replace('_', "-"));
            ctx.sub_step(name, |ctx| run_on_all(ctx, &hosts, &command))?;
        }

        ctx.report_progress(step_list, "control hosts ready");
        Ok(StepOutcome::ok("control hosts ready"))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        if self.pre_provisioned {
            return Ok(StepOutcome::ok("base left in place"));
        }
        let hosts = ctx.cluster().control_hosts();
        ctx.undo_sub_step("COPY_IMAGES", UndoPolicy::BestEffort, |ctx| {
            run_on_all(ctx, &hosts, &undo_stage("copy-images"))
        })?;
        ctx.undo_sub_step("DOM0_SETUP", UndoPolicy::BestEffort, |ctx| {
            run_on_all(ctx, &hosts, &undo_stage("dom0-setup"))
        })?;
        Ok(StepOutcome::ok("control hosts cleaned"))
    }
}
