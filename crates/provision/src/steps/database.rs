//! Database home, starter database and hardening

use super::{require_hosts, run_on_all};
use crate::commands::{stage, undo_stage};
use stepflow::{Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

/// Requested database release, passed through to the installer
pub const OPT_DB_VERSION: &str = "db_version";

fn starter_db_command(version: Option<&str>) -> String {
    match version {
        Some(v) => stage(&format!("starter-db --version {v}")),
        None => stage("starter-db"),
    }
}

#[derive(Debug, Default)]
pub struct DbInstall;

impl Step for DbInstall {
    fn kind(&self) -> StepKind {
        StepKind::DbInstall
    }

    fn description(&self) -> String {
        "Install database home and starter database".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;
        let command = starter_db_command(ctx.cluster().option(OPT_DB_VERSION));

        ctx.sub_step("INSTALL_DB_HOME", |ctx| {
            run_on_all(ctx, &guests, &stage("db-home"))
        })?;
        // created once from the first node, the cluster spreads it
        ctx.sub_step("CREATE_STARTER_DB", |ctx| {
            ctx.remote().run_checked(&guests[0], &command).map(|_| ())
        })?;

        ctx.report_progress(step_list, "database created");
        Ok(StepOutcome::ok("database created"))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        ctx.undo_sub_step("CREATE_STARTER_DB", UndoPolicy::FailFast, |ctx| {
            require_hosts(&guests, "workload")?;
            ctx.remote()
                .run_checked(&guests[0], &undo_stage("starter-db"))
                .map(|_| ())
        })?;
        ctx.undo_sub_step("INSTALL_DB_HOME", UndoPolicy::BestEffort, |ctx| {
            run_on_all(ctx, &guests, &undo_stage("db-home"))
        })?;
        Ok(StepOutcome::ok("database removed"))
    }
}

#[derive(Debug, Default)]
pub struct PostInstallConfig;

impl Step for PostInstallConfig {
    fn kind(&self) -> StepKind {
        StepKind::PostInstallConfig
    }

    fn description(&self) -> String {
        "Lock default accounts and update diagnostics".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        ctx.sub_step("LOCK_DBUSERS", |ctx| {
            run_on_all(ctx, &guests, &stage("lock-dbusers"))
        })?;
        ctx.sub_step("SECURE_SSH_PASSWORD", |ctx| {
            run_on_all(ctx, &guests, &stage("secure-ssh-password"))
        })?;
        // pulls from the update mirror
        ctx.sub_step("AHF_UPDATE", |ctx| {
            let command = stage("ahf-update");
            ctx.retry("ahf update", || run_on_all(ctx, &guests, &command))
        })?;

        ctx.report_progress(step_list, "hardening applied");
        Ok(StepOutcome::ok("hardening applied"))
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
