//! Clusterware install and its follow-up configuration

use super::{require_hosts, run_on_all};
use crate::commands::{stage, stage_for, undo_stage};
use stepflow::{Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

/// Skip post-install configuration; the step then reports code 1
pub const OPT_SKIP_POST_INSTALL: &str = "skip_post_gi";

#[derive(Debug, Default)]
pub struct InstallClusterSoftware;

impl Step for InstallClusterSoftware {
    fn kind(&self) -> StepKind {
        StepKind::InstallClusterSoftware
    }

    fn description(&self) -> String {
        "Install clusterware".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        ctx.sub_step("INSTALL_GRID", |ctx| {
            run_on_all(ctx, &guests, &stage("install-grid"))
        })?;

        // root scripts must finish on one node before the next starts
        ctx.sub_step("RUN_ROOT_SCRIPTS", |ctx| {
            let remote = ctx.remote();
            for guest in &guests {
                log::debug!("Running root scripts on {}", guest);
                remote.run_checked(guest, &stage_for("root-scripts", guest))?;
            }
            Ok(())
        })?;

        ctx.report_progress(step_list, "clusterware installed");
        Ok(StepOutcome::ok("clusterware installed"))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        ctx.undo_sub_step("INSTALL_GRID", UndoPolicy::FailFast, |ctx| {
            run_on_all(ctx, &guests, &undo_stage("install-grid"))
        })?;
        Ok(StepOutcome::ok("clusterware removed"))
    }
}

#[derive(Debug, Default)]
pub struct PostClusterInstall;

impl Step for PostClusterInstall {
    fn kind(&self) -> StepKind {
        StepKind::PostClusterInstall
    }

    fn description(&self) -> String {
        "Configure clusterware resources".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        if ctx.cluster().flag(OPT_SKIP_POST_INSTALL) {
            return Ok(StepOutcome::with_code(1, "post install skipped by request"));
        }
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        ctx.sub_step("POST_GI_CONFIG", |ctx| {
            run_on_all(ctx, &guests, &stage("post-gi-config"))
        })?;

        ctx.report_progress(step_list, "clusterware configured");
        Ok(StepOutcome::ok("clusterware configured"))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{Bench, cluster};
    use stepflow::Fault;

    #[test]
    fn test_root_scripts_in_order() {
        let mut bench = Bench::new(cluster());
        bench.forward(&InstallClusterSoftware).unwrap();
        let hosts: Vec<String> = bench
            .session
            .calls()
            .into_iter()
            .filter(|(_, cmd)| cmd.contains("root-scripts"))
            .map(|(host, _)| host)
            .collect();
        assert_eq!(hosts, vec!["vm01", "vm02"]);
    }

    #[test]
    fn test_root_script_failure_stops_later_nodes() {
        let mut bench = Bench::new(cluster());
        bench.session.fail(
            Some("vm01"),
            "root-scripts",
            Fault::Exit {
                code: 1,
                stderr: "ohasd failed".into(),
            },
            Some(1),
        );
        assert!(bench.forward(&InstallClusterSoftware).is_err());
        assert_eq!(bench.session.count("root-scripts"), 1);

        // resume skips the finished install
        bench.forward(&InstallClusterSoftware).unwrap();
        assert_eq!(bench.session.count("stage install-grid"), 2);
        assert_eq!(bench.session.count("root-scripts"), 3);
    }

    #[test]
    fn test_skip_post_install_reports_code() {
        let mut bench = Bench::new(cluster().with_option(OPT_SKIP_POST_INSTALL, "true"));
        let outcome = bench.forward(&PostClusterInstall).unwrap();
        assert_eq!(outcome.return_code, 1);
        assert!(bench.session.calls().is_empty());
    }

    #[test]
    fn test_undo_removes_clusterware() {
        let mut bench = Bench::new(cluster());
        bench.forward(&InstallClusterSoftware).unwrap();
        bench.undo(&InstallClusterSoftware).unwrap();
        assert_eq!(bench.session.count("install-grid --undo"), 2);
    }
}
