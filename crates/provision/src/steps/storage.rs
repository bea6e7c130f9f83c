//! Storage: cell-backed grid disks, or volumes from a disaggregated vault

use super::{lock_keys, require_hosts, run_on_all};
use crate::commands::{stage, storage, undo_stage};
use stepflow::cluster::OPT_RACK_SIZE;
use stepflow::{Error, Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

/// Leave CREATE_CELL alone; cells were created out of band
pub const OPT_SKIP_CELL_CREATE: &str = "skip_cell_create";

/// Cells are shared with another cluster and must survive undo
pub const OPT_SHARED_CELLS: &str = "shared_cells";

/// Vault capacity for a rack size
pub fn vault_size_gb(rack_size: Option<&str>) -> Result<u32> {
    match rack_size.map(str::trim) {
        None | Some("full") => Ok(8192),
        Some("half") => Ok(4096),
        Some("quarter") => Ok(2048),
        Some("eighth") => Ok(1024),
        Some(other) => Err(Error::invalid_setting(
            OPT_RACK_SIZE,
            format!("unknown rack size '{other}'"),
        )),
    }
}

/// Cloud user, cell and grid disks on the storage nodes
#[derive(Debug, Default)]
pub struct CreateStorage;

impl Step for CreateStorage {
    fn kind(&self) -> StepKind {
        StepKind::CreateStorage
    }

    fn description(&self) -> String {
        "Configure cells and create grid disks".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let cells = ctx.cluster().storage_nodes.clone();
        require_hosts(&cells, "storage")?;
        let id = ctx.cluster().cluster_id.clone();

        {
            let _guard = ctx.critical_section(&lock_keys("cell", &cells))?;
            ctx.sub_step("CLOUD_USER", |ctx| {
                // a previous attempt may have left the user behind
                if let Err(e) = run_on_all(ctx, &cells, &storage(&format!("user delete {id}"))) {
                    log::debug!("No stale cloud user for {}: {}", id, e);
                }
                run_on_all(ctx, &cells, &storage(&format!("user create {id}")))
            })?;
            ctx.sub_step("SETUP_CELL", |ctx| {
                run_on_all(ctx, &cells, &storage("cell setup"))
            })?;
        }

        if ctx.cluster().flag(OPT_SKIP_CELL_CREATE) {
            log::info!("Cells for {} created out of band, not creating", id);
        } else {
            ctx.sub_step("CREATE_CELL", |ctx| {
                run_on_all(ctx, &cells, &storage("cell create"))
            })?;
        }

        ctx.sub_step("CREATE_GRIDDISK", |ctx| {
            run_on_all(ctx, &cells, &storage(&format!("griddisk create --prefix {id}")))
        })?;

        ctx.report_progress(step_list, "grid disks created");
        Ok(StepOutcome::ok(format!("grid disks on {} cell(s)", cells.len())))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let cells = ctx.cluster().storage_nodes.clone();
        let id = ctx.cluster().cluster_id.clone();

        ctx.undo_sub_step("CREATE_GRIDDISK", UndoPolicy::FailFast, |ctx| {
            run_on_all(ctx, &cells, &storage(&format!("griddisk drop --prefix {id}")))
        })?;

        {
            let _guard = ctx.critical_section(&lock_keys("cell", &cells))?;
            ctx.undo_sub_step("CLOUD_USER", UndoPolicy::BestEffort, |ctx| {
                run_on_all(ctx, &cells, &storage(&format!("user delete {id}")))
            })?;
        }

        if ctx.cluster().flag(OPT_SHARED_CELLS) {
            log::info!("Cells of {} are shared, keeping them", id);
        } else {
            ctx.undo_sub_step("CREATE_CELL", UndoPolicy::FailFast, |ctx| {
                run_on_all(ctx, &cells, &storage("cell drop"))
            })?;
        }

        ctx.undo_sub_step("SETUP_CELL", UndoPolicy::BestEffort, |ctx| {
            run_on_all(ctx, &cells, &storage("cell teardown"))
        })?;
        Ok(StepOutcome::ok("grid disks removed"))
    }
}

/// Finish storage once the cluster software is installed.
///
/// With disaggregated storage a vault sized for the rack is registered
/// before volumes are attached. On a pre-provisioned base the vault exists
/// and only the attach runs.
#[derive(Debug)]
pub struct StorageComplete {
    pre_provisioned: bool,
}

impl StorageComplete {
    pub fn disaggregated() -> Self {
        Self {
            pre_provisioned: false,
        }
    }

    pub fn pre_provisioned() -> Self {
        Self {
            pre_provisioned: true,
        }
    }
}

impl Step for StorageComplete {
    fn kind(&self) -> StepKind {
        StepKind::StorageComplete
    }

    fn description(&self) -> String {
        if self.pre_provisioned {
            "Attach volumes".into()
        } else {
            "Register vault and attach volumes".into()
        }
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        require_hosts(&guests, "workload")?;

        if !self.pre_provisioned {
            let size = vault_size_gb(ctx.cluster().option(OPT_RACK_SIZE))?;
            let cells = ctx.cluster().storage_nodes.clone();
            require_hosts(&cells, "storage")?;
            let id = ctx.cluster().cluster_id.clone();
            ctx.sub_step("REGISTER_VAULT", |ctx| {
                let command = storage(&format!("vault create {id} --size-gb {size}"));
                ctx.remote().run_checked(&cells[0], &command).map(|_| ())
            })?;
        }

        ctx.sub_step("ATTACH_VOLUMES", |ctx| {
            run_on_all(ctx, &guests, &stage("attach-volumes"))
        })?;

        ctx.report_progress(step_list, "volumes attached");
        Ok(StepOutcome::ok("volumes attached"))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let guests = ctx.cluster().workload_hosts();
        ctx.undo_sub_step("ATTACH_VOLUMES", UndoPolicy::FailFast, |ctx| {
            run_on_all(ctx, &guests, &undo_stage("attach-volumes"))
        })?;

        if !self.pre_provisioned {
            let cells = ctx.cluster().storage_nodes.clone();
            let id = ctx.cluster().cluster_id.clone();
            ctx.undo_sub_step("REGISTER_VAULT", UndoPolicy::FailFast, |ctx| {
                require_hosts(&cells, "storage")?;
                let command = storage(&format!("vault delete {id}"));
                ctx.remote().run_checked(&cells[0], &command).map(|_| ())
            })?;
        }
        Ok(StepOutcome::ok("volumes detached"))
    }
}
