//! Profile step tables
//!
//! One table per infrastructure profile, in provisioning order. The tool
//! index is the stage number the installer reports in its own logs.

use crate::steps::backup::GoldenBackup;
use crate::steps::cluster::{InstallClusterSoftware, PostClusterInstall};
use crate::steps::database::{DbInstall, PostInstallConfig};
use crate::steps::prevm::{PrevmChecks, PrevmSetup};
use crate::steps::storage::{CreateStorage, StorageComplete};
use crate::steps::user::{CreateUser, PostvmInstall};
use crate::steps::validate::ValidateConfig;
use crate::steps::vm::CreateVm;
use stepflow::{BoxedStep, Profile, Result, Step, StepKind, StepRegistry};

fn boxed<S: Step + Default + 'static>() -> BoxedStep {
    Box::new(S::default())
}

fn prevm_setup() -> BoxedStep {
    Box::new(PrevmSetup::standard())
}

fn prevm_setup_on_base() -> BoxedStep {
    Box::new(PrevmSetup::pre_provisioned())
}

fn storage_complete() -> BoxedStep {
    Box::new(StorageComplete::disaggregated())
}

fn storage_complete_on_base() -> BoxedStep {
    Box::new(StorageComplete::pre_provisioned())
}

/// Build the registry for every supported profile
pub fn registry() -> Result<StepRegistry> {
    StepRegistry::builder()
        .profile(Profile::Standard, |p| {
            p.step(StepKind::ValidateConfig, "Validate request", 1, boxed::<ValidateConfig>)
                .step(StepKind::PrevmChecks, "Pre-VM checks", 2, boxed::<PrevmChecks>)
                .step(StepKind::PrevmSetup, "Pre-VM setup", 3, prevm_setup)
                .step(StepKind::CreateVm, "Create guests", 5, boxed::<CreateVm>)
                .step(StepKind::CreateUser, "Create users", 6, boxed::<CreateUser>)
                .step(StepKind::PostvmInstall, "Post-VM install", 7, boxed::<PostvmInstall>)
                .step(StepKind::CreateStorage, "Create grid disks", 8, boxed::<CreateStorage>)
                .step(
                    StepKind::InstallClusterSoftware,
                    "Install clusterware",
                    9,
                    boxed::<InstallClusterSoftware>,
                )
                .step(
                    StepKind::PostClusterInstall,
                    "Post clusterware install",
                    10,
                    boxed::<PostClusterInstall>,
                )
                .step(StepKind::DbInstall, "Install database", 11, boxed::<DbInstall>)
                .step(
                    StepKind::PostInstallConfig,
                    "Post-install configuration",
                    12,
                    boxed::<PostInstallConfig>,
                )
                .step(StepKind::GoldenBackup, "Golden backup", 13, boxed::<GoldenBackup>)
        })
        .profile(Profile::DisaggregatedStorage, |p| {
            p.step(StepKind::ValidateConfig, "Validate request", 1, boxed::<ValidateConfig>)
                .step(StepKind::PrevmChecks, "Pre-VM checks", 2, boxed::<PrevmChecks>)
                .step(StepKind::PrevmSetup, "Pre-VM setup", 3, prevm_setup)
                .step(StepKind::CreateVm, "Create guests", 4, boxed::<CreateVm>)
                .step(StepKind::CreateUser, "Create users", 5, boxed::<CreateUser>)
                .step(StepKind::PostvmInstall, "Post-VM install", 6, boxed::<PostvmInstall>)
                .step(
                    StepKind::InstallClusterSoftware,
                    "Install clusterware",
                    7,
                    boxed::<InstallClusterSoftware>,
                )
                .step(
                    StepKind::PostClusterInstall,
                    "Post clusterware install",
                    8,
                    boxed::<PostClusterInstall>,
                )
                .step(StepKind::StorageComplete, "Attach vault storage", 9, storage_complete)
                .step(StepKind::DbInstall, "Install database", 10, boxed::<DbInstall>)
                .step(
                    StepKind::PostInstallConfig,
                    "Post-install configuration",
                    11,
                    boxed::<PostInstallConfig>,
                )
                .step(StepKind::GoldenBackup, "Golden backup", 12, boxed::<GoldenBackup>)
        })
        .profile(Profile::DisaggregatedStorageEighthRack, |p| {
            p.step(StepKind::ValidateConfig, "Validate request", 1, boxed::<ValidateConfig>)
                .step(StepKind::PrevmChecks, "Pre-VM checks", 2, boxed::<PrevmChecks>)
                .step(StepKind::PrevmSetup, "Pre-VM setup", 3, prevm_setup)
                .step(StepKind::CreateVm, "Create guests", 4, boxed::<CreateVm>)
                .step(StepKind::CreateUser, "Create users", 5, boxed::<CreateUser>)
                .step(StepKind::PostvmInstall, "Post-VM install", 6, boxed::<PostvmInstall>)
                .step(
                    StepKind::InstallClusterSoftware,
                    "Install clusterware",
                    8,
                    boxed::<InstallClusterSoftware>,
                )
                .step(
                    StepKind::PostClusterInstall,
                    "Post clusterware install",
                    9,
                    boxed::<PostClusterInstall>,
                )
                .step(StepKind::StorageComplete, "Attach vault storage", 10, storage_complete)
                .step(StepKind::DbInstall, "Install database", 11, boxed::<DbInstall>)
                .step(
                    StepKind::PostInstallConfig,
                    "Post-install configuration",
                    12,
                    boxed::<PostInstallConfig>,
                )
                .step(StepKind::GoldenBackup, "Golden backup", 13, boxed::<GoldenBackup>)
        })
        .profile(Profile::PreProvisionedBase, |p| {
            p.step(StepKind::ValidateConfig, "Validate request", 1, boxed::<ValidateConfig>)
                .step(StepKind::PrevmChecks, "Pre-VM checks", 2, boxed::<PrevmChecks>)
                .step(StepKind::PrevmSetup, "Control host setup", 3, prevm_setup_on_base)
                .step(StepKind::CreateVm, "Create guests", 4, boxed::<CreateVm>)
                .step(StepKind::CreateUser, "Create users", 5, boxed::<CreateUser>)
                .step(StepKind::PostvmInstall, "Post-VM install", 6, boxed::<PostvmInstall>)
                .step(StepKind::StorageComplete, "Attach volumes", 7, storage_complete_on_base)
                .step(StepKind::DbInstall, "Install database", 8, boxed::<DbInstall>)
                .step(
                    StepKind::PostInstallConfig,
                    "Post-install configuration",
                    9,
                    boxed::<PostInstallConfig>,
                )
        })
        .build()
}
