//! Cluster description the pipeline operates on
//!
//! A [`ClusterContext`] is owned by exactly one pipeline run. Steps only
//! ever touch the hosts listed here.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Option key marking a pre-provisioned base system
pub const OPT_PRE_PROVISIONED_BASE: &str = "pre_provisioned_base";
/// Option key marking storage served by a separate storage fabric
pub const OPT_DISAGGREGATED_STORAGE: &str = "disaggregated_storage";
/// Option key for the rack size ("full", "half", "quarter", "eighth")
pub const OPT_RACK_SIZE: &str = "rack_size";

/// A control node and the workload node (VM) it hosts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostPair {
    /// Hypervisor / control-plane host
    pub control: String,
    /// Guest VM running the database workload
    pub workload: String,
}

impl HostPair {
    pub fn new(control: impl Into<String>, workload: impl Into<String>) -> Self {
        Self {
            control: control.into(),
            workload: workload.into(),
        }
    }
}

/// Direction of a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Provision: call each step's forward action
    #[default]
    Forward,
    /// De-provision / roll back: call each step's undo action
    Undo,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Forward => f.write_str("forward"),
            Direction::Undo => f.write_str("undo"),
        }
    }
}

/// Descriptor of the operation currently applied to the cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub direction: Direction,
    /// Id of the originating request, used as the lock holder prefix
    pub request_id: String,
}

/// Infrastructure variant that selects the step table and implementations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Local grid disks on storage cells
    Standard,
    /// Storage served by a shared storage fabric
    DisaggregatedStorage,
    /// Disaggregated storage on an eighth rack
    DisaggregatedStorageEighthRack,
    /// Base system already provisioned, no cluster software install
    PreProvisionedBase,
}

impl Profile {
    /// All profiles, in table order
    pub const ALL: [Profile; 4] = [
        Profile::Standard,
        Profile::DisaggregatedStorage,
        Profile::DisaggregatedStorageEighthRack,
        Profile::PreProvisionedBase,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::Standard => "standard",
            Profile::DisaggregatedStorage => "disaggregated-storage",
            Profile::DisaggregatedStorageEighthRack => "disaggregated-storage-eighth-rack",
            Profile::PreProvisionedBase => "pre-provisioned-base",
        }
    }

    /// Select the profile from the cluster's option bag.
    ///
    /// Pure and deterministic: the same context always yields the same profile.
    pub fn detect(ctx: &ClusterContext) -> Self {
        if ctx.flag(OPT_PRE_PROVISIONED_BASE) {
            Profile::PreProvisionedBase
        } else if ctx.flag(OPT_DISAGGREGATED_STORAGE) {
            if ctx.option(OPT_RACK_SIZE) == Some("eighth") {
                Profile::DisaggregatedStorageEighthRack
            } else {
                Profile::DisaggregatedStorage
            }
        } else {
            Profile::Standard
        }
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Profile::ALL
            .into_iter()
            .find(|p| p.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| Error::UnknownProfile(s.to_string()))
    }
}

/// The aggregate a pipeline run operates on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClusterContext {
    /// Stable cluster identifier; keys the ledger, progress and locks
    pub cluster_id: String,
    /// Ordered control/workload host pairs
    #[serde(default)]
    pub host_pairs: Vec<HostPair>,
    /// Storage nodes, possibly shared with other clusters
    #[serde(default)]
    pub storage_nodes: Vec<String>,
    /// Free-form caller options (software version, encryption, topology, ...)
    #[serde(default)]
    pub options: BTreeMap<String, String>,
    /// The operation being applied; filled in by the driver
    #[serde(default, skip_deserializing)]
    pub operation: Operation,
}

impl ClusterContext {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    /// Add a control/workload pair
    pub fn with_pair(mut self, control: impl Into<String>, workload: impl Into<String>) -> Self {
        self.host_pairs.push(HostPair::new(control, workload));
        self
    }

    /// Add a storage node
    pub fn with_storage_node(mut self, host: impl Into<String>) -> Self {
        self.storage_nodes.push(host.into());
        self
    }

    /// Set a caller option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Look up a caller option
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }

    /// Interpret a caller option as a boolean flag (missing means false)
    pub fn flag(&self, key: &str) -> bool {
        matches!(
            self.option(key).map(str::to_lowercase).as_deref(),
            Some("true" | "yes" | "1" | "on")
        )
    }

    /// Control nodes in pair order, deduplicated
    pub fn control_hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = Vec::with_capacity(self.host_pairs.len());
        for pair in &self.host_pairs {
            if !hosts.contains(&pair.control) {
                hosts.push(pair.control.clone());
            }
        }
        hosts
    }

    /// Workload nodes in pair order
    pub fn workload_hosts(&self) -> Vec<String> {
        self.host_pairs.iter().map(|p| p.workload.clone()).collect()
    }

    /// Merge caller overrides into the option bag.
    ///
    /// Runs once per pipeline run, before any step is resolved.
    pub fn reconcile(&mut self, overrides: &BTreeMap<String, String>) {
        for (key, value) in overrides {
            if self.options.get(key) != Some(value) {
                log::debug!("Option {} set to '{}' for {}", key, value, self.cluster_id);
                self.options.insert(key.clone(), value.clone());
            }
        }
    }

    /// Check the description is usable at all
    pub fn validate(&self) -> Result<()> {
        if self.cluster_id.trim().is_empty() {
            return Err(Error::InvalidCluster("cluster_id is empty".into()));
        }
        if self.host_pairs.is_empty() {
            return Err(Error::InvalidCluster(format!(
                "cluster {} has no host pairs",
                self.cluster_id
            )));
        }
        let workloads = self.workload_hosts();
        for (i, host) in workloads.iter().enumerate() {
            if workloads[..i].contains(host) {
                return Err(Error::InvalidCluster(format!(
                    "workload host {host} listed twice"
                )));
            }
        }
        Ok(())
    }
}
