//! Guest accounts and post-VM configuration

use super::{require_hosts, run_on_all};
use crate::commands::{stage, undo_stage};
use stepflow::{Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

/// Software owner accounts with passwordless access between guests
#[derive(Debug, Default)]
pub struct CreateUser;

impl Step for CreateUser {
    fn kind(&self) -> StepKind {
        StepKind::CreateUser
    }

    fn description(&self) -> String {
        "Create software owner accounts".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        ctx.sub_step("USERS", |ctx| run_on_all(ctx, &guests, &stage("users")))?;
        ctx.sub_step("SSH_DIR", |ctx| run_on_all(ctx, &guests, &stage("ssh-dir")))?;
        // key exchange needs every guest's ssh directory in place
        ctx.sub_step("PASSWORDLESS", |ctx| {
            run_on_all(ctx, &guests, &stage("passwordless"))
        })?;

        ctx.report_progress(step_list, "accounts ready");
        Ok(StepOutcome::ok("accounts ready"))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        ctx.undo_sub_step("PASSWORDLESS", UndoPolicy::BestEffort, |ctx| {
            run_on_all(ctx, &guests, &undo_stage("passwordless"))
        })?;
        ctx.undo_sub_step("SSH_DIR", UndoPolicy::BestEffort, |ctx| {
            run_on_all(ctx, &guests, &undo_stage("ssh-dir"))
        })?;
        ctx.undo_sub_step("USERS", UndoPolicy::FailFast, |ctx| {
            run_on_all(ctx, &guests, &undo_stage("users"))
        })?;
        Ok(StepOutcome::ok("accounts removed"))
    }
}

/// Patching and access configuration once guests are up
#[derive(Debug, Default)]
pub struct PostvmInstall;

impl Step for PostvmInstall {
    fn kind(&self) -> StepKind {
        StepKind::PostvmInstall
    }

    fn description(&self) -> String {
        "Patch guests and configure access".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        ctx.sub_step("POST_VM_PATCHING", |ctx| {
            run_on_all(ctx, &guests, &stage("post-vm-patching"))
        })?;
        ctx.sub_step("SET_ACCESS_CONF", |ctx| {
            run_on_all(ctx, &guests, &stage("set-access-conf"))
        })?;

        ctx.report_progress(step_list, "guests configured");
        Ok(StepOutcome::ok("guests configured"))
    }

    fn undo_execute(
        &self,
        _ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        // removed together with the guests
        Ok(StepOutcome::ok("nothing to undo"))
    }
}
