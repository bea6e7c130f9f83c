//! create-vm: guests on their control hosts

use super::{lock_keys, require_hosts, run_on_all, run_per_guest};
use crate::commands::{stage, stage_for, undo_stage_for};
use stepflow::{Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

#[derive(Debug, Default)]
pub struct CreateVm;

impl Step for CreateVm {
    fn kind(&self) -> StepKind {
        StepKind::CreateVm
    }

    fn description(&self) -> String {
        "Create and start guest VMs".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let controls = ctx.cluster().control_hosts();
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        // control hosts may carry guests of other clusters
        {
            let _guard = ctx.critical_section(&lock_keys("host", &controls))?;
            ctx.sub_step("CREATE_VM", |ctx| {
                run_per_guest(ctx, |guest| stage_for("create-vm", guest))
            })?;
            ctx.sub_step("CONFIGURE_BONDING", |ctx| {
                run_per_guest(ctx, |guest| stage_for("configure-bonding", guest))
            })?;
        }

        ctx.sub_step("START_VM", |ctx| {
            run_per_guest(ctx, |guest| stage_for("start-vm", guest))
        })?;
        ctx.sub_step("ADD_MISSING_DNS_NTP", |ctx| {
            let command = stage("add-dns-ntp");
            ctx.retry("dns/ntp", || run_on_all(ctx, &guests, &command))
        })?;

        ctx.report_progress(step_list, "guests running");
        Ok(StepOutcome::ok(format!("{} guest(s) running", guests.len())))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let controls = ctx.cluster().control_hosts();
        {
            let _guard = ctx.critical_section(&lock_keys("host", &controls))?;
            ctx.undo_sub_step("CREATE_VM", UndoPolicy::FailFast, |ctx| {
                run_per_guest(ctx, |guest| undo_stage_for("create-vm", guest))
            })?;
        }
        ctx.undo_sub_step("CONFIGURE_BONDING", UndoPolicy::BestEffort, |ctx| {
            run_per_guest(ctx, |guest| undo_stage_for("configure-bonding", guest))
        })?;
        Ok(StepOutcome::ok("guests deleted"))
    }
}
