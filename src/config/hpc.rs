//! HPC profile configuration (TOML)
//!
//! The profile selects the scheduler adapter and carries the default
//! submission parameters. A submission group may override the `[hpc]` table
//! wholesale through its `submitter_params.hpc_config`.

use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Which scheduler adapter to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HpcType {
    Slurm,
    /// Runs submission scripts immediately on the local host.
    Fake,
    /// Alias for `fake`, kept for config compatibility.
    Local,
}

fn default_job_prefix() -> String {
    "jade_".to_string()
}

fn default_walltime() -> String {
    "04:00:00".to_string()
}

fn default_nodes() -> u64 {
    1
}

/// The `[hpc]` table: parameters rendered into the submission script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpcSettings {
    /// Account / allocation to charge
    #[serde(default)]
    pub account: Option<String>,

    /// Walltime as "HH:MM:SS"
    #[serde(default = "default_walltime")]
    pub walltime: String,

    #[serde(default)]
    pub partition: Option<String>,

    #[serde(default)]
    pub qos: Option<String>,

    /// Memory request, passed through verbatim (e.g. "16g")
    #[serde(default)]
    pub mem: Option<String>,

    /// Scratch space request, passed through verbatim
    #[serde(default)]
    pub tmp: Option<String>,

    #[serde(default = "default_nodes")]
    pub nodes: u64,

    #[serde(default)]
    pub ntasks: Option<u64>,

    #[serde(default)]
    pub ntasks_per_node: Option<u64>,

    /// Generic resource request (e.g. "gpu:2")
    #[serde(default)]
    pub gres: Option<String>,
}

impl Default for HpcSettings {
    fn default() -> Self {
        Self {
            account: None,
            walltime: default_walltime(),
            partition: None,
            qos: None,
            mem: None,
            tmp: None,
            nodes: default_nodes(),
            ntasks: None,
            ntasks_per_node: None,
            gres: None,
        }
    }
}

impl HpcSettings {
    /// Walltime in whole minutes.
    pub fn walltime_minutes(&self) -> Result<u64> {
        walltime_minutes(&self.walltime)
    }
}

/// The HPC profile document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HpcConfig {
    pub hpc_type: HpcType,

    /// Prefix for scheduler job names, used to find a run's jobs in the queue
    #[serde(default = "default_job_prefix")]
    pub job_prefix: String,

    #[serde(default)]
    pub hpc: HpcSettings,
}

impl Default for HpcConfig {
    fn default() -> Self {
        Self {
            hpc_type: HpcType::Fake,
            job_prefix: default_job_prefix(),
            hpc: HpcSettings::default(),
        }
    }
}

impl HpcConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read HPC config file: {}", path.display()))?;
        let config: HpcConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse HPC config file: {}", path.display()))?;
        Ok(config)
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).with_context(|| "Failed to serialize HPC config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write HPC config file: {}", path.display()))?;
        Ok(())
    }
}

/// Parse "HH:MM:SS" into whole minutes, rounding seconds up.
pub fn walltime_minutes(walltime: &str) -> Result<u64> {
    let parts: Vec<&str> = walltime.split(':').collect();
    if parts.len() != 3 {
        bail!("invalid walltime '{walltime}', expected HH:MM:SS");
    }
    let hours: u64 = parts[0]
        .parse()
        .with_context(|| format!("invalid walltime hours in '{walltime}'"))?;
    let minutes: u64 = parts[1]
        .parse()
        .with_context(|| format!("invalid walltime minutes in '{walltime}'"))?;
    let seconds: u64 = parts[2]
        .parse()
        .with_context(|| format!("invalid walltime seconds in '{walltime}'"))?;
    if minutes > 59 || seconds > 59 {
        bail!("invalid walltime '{walltime}', minutes and seconds must be < 60");
    }
    Ok(hours * 60 + minutes + u64::from(seconds > 0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_walltime_minutes() {
        assert_eq!(walltime_minutes("04:00:00").unwrap(), 240);
        assert_eq!(walltime_minutes("00:30:00").unwrap(), 30);
        assert_eq!(walltime_minutes("01:00:30").unwrap(), 61);
        assert!(walltime_minutes("240").is_err());
        assert!(walltime_minutes("00:75:00").is_err());
    }

    #[test]
    fn test_parse_profile() {
        let text = r#"
hpc_type = "slurm"
job_prefix = "myrun_"

[hpc]
account = "proj123"
walltime = "08:00:00"
partition = "short"
nodes = 2
"#;
        let config: HpcConfig = toml::from_str(text).unwrap();
        assert_eq!(config.hpc_type, HpcType::Slurm);
        assert_eq!(config.job_prefix, "myrun_");
        assert_eq!(config.hpc.account.as_deref(), Some("proj123"));
        assert_eq!(config.hpc.walltime_minutes().unwrap(), 480);
        assert_eq!(config.hpc.nodes, 2);
    }

    #[test]
    fn test_defaults_round_trip() {
        let config = HpcConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let reloaded: HpcConfig = toml::from_str(&text).unwrap();
        assert_eq!(reloaded.hpc_type, HpcType::Fake);
        assert_eq!(reloaded.job_prefix, "jade_");
    }
}
