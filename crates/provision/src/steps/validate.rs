//! validate-config: reject unusable requests before touching anything

use super::require_hosts;
use crate::commands;
use stepflow::{Error, Result, RunOptions, Step, StepContext, StepKind, StepOutcome};

/// Option keys whose values must parse as numbers
const NUMERIC_OPTIONS: [&str; 3] = ["db_version", "vm_memory_gb", "vm_cores"];

#[derive(Debug, Default)]
pub struct ValidateConfig;

impl ValidateConfig {
    fn check_options(ctx: &StepContext<'_>, step_list: &[StepKind]) -> Result<()> {
        let cluster = ctx.cluster();
        for key in NUMERIC_OPTIONS {
            if let Some(value) = cluster.option(key) {
                if value.parse::<f64>().is_err() {
                    return Err(Error::invalid_setting(
                        key,
                        format!("expected a number, got '{value}'"),
                    ));
                }
            }
        }

        let needs_storage = step_list
            .iter()
            .any(|s| matches!(s, StepKind::CreateStorage | StepKind::StorageComplete));
        if needs_storage {
            require_hosts(&cluster.storage_nodes, "storage")?;
        }
        require_hosts(&cluster.control_hosts(), "control")
    }
}

impl Step for ValidateConfig {
    fn kind(&self) -> StepKind {
        StepKind::ValidateConfig
    }

    fn description(&self) -> String {
        "Validate request and reachability".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        // re-checked on resume, options may have been reconciled
        Self::check_options(ctx, step_list)?;

        ctx.sub_step("CHECK_REACHABILITY", |ctx| {
            let mut hosts = ctx.cluster().control_hosts();
            hosts.extend(ctx.cluster().storage_nodes.iter().cloned());
            ctx.retry("reachability", || {
                ctx.fan_out(&hosts, |remote, host| remote.run_checked(host, commands::PROBE))
                    .map(|_| ())
            })
        })?;

        ctx.report_progress(step_list, "request validated");
        Ok(StepOutcome::ok("configuration valid"))
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
