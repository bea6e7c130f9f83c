//! golden-backup: snapshot the finished guest images

use super::{lock_keys, require_hosts, run_per_guest};
use crate::commands::{stage_for, undo_stage_for};
use stepflow::{Result, RunOptions, Step, StepContext, StepKind, StepOutcome, UndoPolicy};

#[derive(Debug, Default)]
pub struct GoldenBackup;

impl Step for GoldenBackup {
    fn kind(&self) -> StepKind {
        StepKind::GoldenBackup
    }

    fn description(&self) -> String {
        "Back up guest images".into()
    }

    fn do_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        let controls = ctx.cluster().control_hosts();
        require_hosts(&controls, "control")?;

        // image copies run for minutes, keep the backup area leased meanwhile
        let guard = ctx.critical_section_with_heartbeat(&lock_keys("backup", &controls))?;
        ctx.sub_step("BACKUP_IMAGE", |ctx| {
            run_per_guest(ctx, |guest| stage_for("backup-image", guest))
        })?;
        drop(guard);

        ctx.report_progress(step_list, "backup taken");
        Ok(StepOutcome::ok("backup taken"))
    }

    fn undo_execute(
        &self,
        ctx: &mut StepContext<'_>,
        _options: &RunOptions,
        _step_list: &[StepKind],
    ) -> Result<StepOutcome> {
        ctx.undo_sub_step("BACKUP_IMAGE", UndoPolicy::BestEffort, |ctx| {
            run_per_guest(ctx, |guest| undo_stage_for("backup-image", guest))
        })?;
        Ok(StepOutcome::ok("backup removed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::steps::testing::{Bench, cluster};
    use std::time::Duration;
    use stepflow::ErrorKind;

    #[test]
    fn test_backup_per_guest_and_lease_released() {
        let mut bench = Bench::new(cluster());
        bench.settings.heartbeat_interval = Duration::from_millis(10);
        bench.forward(&GoldenBackup).unwrap();
        let calls = bench.session.calls();
        assert!(calls.contains(&("kvm01".to_string(), stage_for("backup-image", "vm01"))));
        assert!(calls.contains(&("kvm02".to_string(), stage_for("backup-image", "vm02"))));
        assert!(bench.services.locks.leases().unwrap().is_empty());
    }

    #[test]
    fn test_backup_area_busy() {
        let mut bench = Bench::new(cluster());
        bench
            .services
            .locks
            .acquire("backup:kvm01", "req3_1", Duration::from_secs(60))
            .unwrap();
        let err = bench.forward(&GoldenBackup).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockUnavailable);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_undo_after_failed_forward_is_noop() {
        let mut bench = Bench::new(cluster());
        let outcome = bench.undo(&GoldenBackup).unwrap();
        assert_eq!(outcome.ran_count(), 0);
        assert!(bench.session.calls().is_empty());
    }
}
