use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use stepflow::{ClusterContext, ConfigSource};

use crate::paths;

// ============================================================================
// Driver Settings File
// ============================================================================

/// `settings.toml`, flattened to dotted keys.
///
/// ```toml
/// [lock]
/// ttl_secs = 900
///
/// [retry]
/// max_attempts = 5
/// ```
///
/// yields `lock.ttl_secs = "900"` and `retry.max_attempts = "5"`.
#[derive(Debug, Default, Clone)]
pub struct Settings {
    values: BTreeMap<String, String>,
}

impl Settings {
    /// Load settings from the config directory, or defaults if absent
    pub fn load() -> Result<Self> {
        let path = paths::settings_file(&paths::config_dir()?);
        if !path.exists() {
            log::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Invalid settings in {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let table: toml::Table = toml::from_str(content)?;
        let mut values = BTreeMap::new();
        flatten("", &table, &mut values)?;
        for key in values.keys() {
            if !stepflow::context::keys::ALL.contains(&key.as_str()) {
                log::warn!("Ignoring unknown setting '{}'", key);
            }
        }
        Ok(Self { values })
    }

    /// Settings in effect, for display
    pub fn entries(&self) -> impl Iterator<Item = (&String, &String)> {
        self.values.iter()
    }
}

fn flatten(prefix: &str, table: &toml::Table, out: &mut BTreeMap<String, String>) -> Result<()> {
    for (key, value) in table {
        let key = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}.{key}")
        };
        match value {
            toml::Value::Table(nested) => flatten(&key, nested, out)?,
            toml::Value::String(s) => {
                out.insert(key, s.clone());
            }
            toml::Value::Integer(i) => {
                out.insert(key, i.to_string());
            }
            toml::Value::Float(f) => {
                out.insert(key, f.to_string());
            }
            toml::Value::Boolean(b) => {
                out.insert(key, b.to_string());
            }
            toml::Value::Datetime(d) => {
                out.insert(key, d.to_string());
            }
            toml::Value::Array(_) => bail!("setting '{key}' must be a single value"),
        }
    }
    Ok(())
}

impl ConfigSource for Settings {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

// ============================================================================
// Cluster Descriptions
// ============================================================================

/// Load a cluster description
///
/// ```toml
/// cluster_id = "clu1"
/// storage_nodes = ["cell01", "cell02"]
///
/// [[host_pairs]]
/// control = "kvm01"
/// workload = "vm01"
///
/// [options]
/// db_version = "19"
/// ```
pub fn load_cluster(path: &str) -> Result<ClusterContext> {
    let path = paths::expand_path(path);
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Could not read cluster file {}", path.display()))?;
    let cluster: ClusterContext = toml::from_str(&content)
        .with_context(|| format!("Invalid cluster file {}", path.display()))?;
    log::debug!(
        "Loaded cluster {} ({} host pair(s)) from {}",
        cluster.cluster_id,
        cluster.host_pairs.len(),
        path.display()
    );
    Ok(cluster)
}

/// Parse `--set key=value` pairs
pub fn parse_overrides(pairs: &[String]) -> Result<BTreeMap<String, String>> {
    let mut overrides = BTreeMap::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("Invalid override '{pair}', expected key=value");
        };
        let key = key.trim();
        if key.is_empty() {
            bail!("Invalid override '{pair}', key is empty");
        }
        overrides.insert(key.to_string(), value.trim().to_string());
    }
    Ok(overrides)
}
