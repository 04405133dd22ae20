//! Configuration file parsing for vpcctl
//!
//! Parses the optional `vpcctl.toml` using serde. A missing file means
//! built-in defaults.

use crate::error::{Error, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vpcctl.toml";

/// Load configuration from a file, falling back to defaults if it is absent
pub fn load(path: &Path) -> Result<VpcctlConfig> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "config file absent, using defaults");
        return Ok(VpcctlConfig::default());
    }

    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let config: VpcctlConfig = toml::from_str(&content)?;
    config.validate()?;

    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VpcctlConfig {
    /// Descriptor storage settings
    #[serde(default)]
    pub state: StateConfig,

    /// Address derivation and uplink defaults
    #[serde(default)]
    pub network: NetworkConfig,

    /// External command settings
    #[serde(default)]
    pub commands: CommandsConfig,
}

impl VpcctlConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.commands.timeout == 0 {
            return Err(Error::ConfigValidation(
                "commands.timeout must be at least 1 second".into(),
            ));
        }

        if self.network.default_uplink.trim().is_empty() {
            return Err(Error::ConfigValidation(
                "network.default_uplink must not be empty".into(),
            ));
        }

        for (key, path) in [
            ("commands.ip", &self.commands.ip),
            ("commands.iptables", &self.commands.iptables),
            ("commands.sysctl", &self.commands.sysctl),
        ] {
            if path.as_os_str().is_empty() {
                return Err(Error::ConfigValidation(format!("{} must not be empty", key)));
            }
        }

        if self.state.journal_limit == 0 {
            return Err(Error::ConfigValidation(
                "state.journal_limit must be at least 1".into(),
            ));
        }

        Ok(())
    }

    /// Override the state directory (from the command line)
    pub fn with_state_dir(mut self, dir: Option<PathBuf>) -> Self {
        if let Some(dir) = dir {
            self.state.dir = dir;
        }
        self
    }
}

/// Descriptor storage settings
#[derive(Debug, Clone, Deserialize)]
pub struct StateConfig {
    /// Per-user state directory holding one descriptor per VPC
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,

    /// Number of journal entries to keep
    #[serde(default = "default_journal_limit")]
    pub journal_limit: usize,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            dir: default_state_dir(),
            journal_limit: default_journal_limit(),
        }
    }
}

fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".vpcctl"))
        .unwrap_or_else(|| PathBuf::from("/var/lib/vpcctl"))
}

fn default_journal_limit() -> usize {
    500
}

/// Address derivation and uplink defaults
#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
    /// Uplink interface used by `enable-nat` when none is given
    #[serde(default = "default_uplink")]
    pub default_uplink: String,

    /// 0-based usable-host offset of a subnet's address within its CIDR
    #[serde(default)]
    pub subnet_host_offset: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            default_uplink: default_uplink(),
            subnet_host_offset: 0,
        }
    }
}

fn default_uplink() -> String {
    "eth0".to_string()
}

/// External command settings
#[derive(Debug, Clone, Deserialize)]
pub struct CommandsConfig {
    #[serde(default = "default_ip")]
    pub ip: PathBuf,

    #[serde(default = "default_iptables")]
    pub iptables: PathBuf,

    #[serde(default = "default_sysctl")]
    pub sysctl: PathBuf,

    /// Timeout in seconds for each external call
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

impl CommandsConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for CommandsConfig {
    fn default() -> Self {
        Self {
            ip: default_ip(),
            iptables: default_iptables(),
            sysctl: default_sysctl(),
            timeout: default_timeout(),
        }
    }
}

fn default_ip() -> PathBuf {
    PathBuf::from("/sbin/ip")
}

fn default_iptables() -> PathBuf {
    PathBuf::from("/sbin/iptables")
}

fn default_sysctl() -> PathBuf {
    PathBuf::from("/sbin/sysctl")
}

fn default_timeout() -> u64 {
    10
}
