//! Remote command lines used by the steps
//!
//! Heavy lifting is delegated to the cluster installer, which exposes each
//! provisioning stage as `cfinstall stage <name>` and its reversal as
//! `cfinstall stage <name> --undo`.

/// Installer binary on control and workload hosts
pub const INSTALLER: &str = "/opt/clusterforge/bin/cfinstall";

/// Storage-fabric control utility on storage nodes
pub const STORAGE_CLI: &str = "/opt/clusterforge/bin/cfstorage";

/// Forward installer stage
pub fn stage(name: &str) -> String {
    format!("{INSTALLER} stage {name}")
}

/// Forward installer stage limited to one guest
pub fn stage_for(name: &str, guest: &str) -> String {
    format!("{INSTALLER} stage {name} --guest {guest}")
}

/// Reverse an installer stage
pub fn undo_stage(name: &str) -> String {
    format!("{INSTALLER} stage {name} --undo")
}

/// Reverse an installer stage for one guest
pub fn undo_stage_for(name: &str, guest: &str) -> String {
    format!("{INSTALLER} stage {name} --undo --guest {guest}")
}

/// Storage fabric command
pub fn storage(args: &str) -> String {
    format!("{STORAGE_CLI} {args}")
}

/// Liveness probe that exercises the session without side effects
pub const PROBE: &str = "true";
