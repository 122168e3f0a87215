//! Configuration file support for gaudi-connect
//!
//! Loads and validates configuration from TOML files. Every field has a
//! default, so a partial file (or no file at all) is valid.
//! Default location: /etc/habanalabs/gaudi-connect.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use gaudi_connect_common::shell::{HL_SMI_CMD, PERF_TEST_CMD};

use crate::error::{ConnectError, Result};
use crate::routing::RoutingPreset;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/habanalabs/gaudi-connect.toml";

/// Size of the per-port GID table in sysfs
const GID_TABLE_SIZE: u32 = 256;

/// Routing source configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Explicit routing table file, wins over `preset`
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Shipped topology table
    #[serde(default)]
    pub preset: Option<RoutingPreset>,
}

/// Device inventory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InventoryConfig {
    /// Device query tool
    #[serde(default = "default_smi_cmd")]
    pub smi_cmd: String,

    /// RDMA sysfs class directory
    #[serde(default = "default_ib_root")]
    pub ib_root: PathBuf,

    /// PCI vendor id of fabric devices
    #[serde(default = "default_vendor_id")]
    pub vendor_id: String,

    /// GID table slot read as the port fabric address
    #[serde(default)]
    pub gid_index: u32,
}

/// Port verification configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationConfig {
    /// Evaluate link state of both endpoints
    #[serde(default = "default_check_ports")]
    pub check_ports: bool,
}

/// Probe configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeConfig {
    /// Probe executable
    #[serde(default = "default_executable")]
    pub executable: PathBuf,

    /// Report commands without running them
    #[serde(default)]
    pub simulate: bool,

    /// Probe connections concurrently
    #[serde(default)]
    pub parallel: bool,

    /// Concurrent probes in parallel mode
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Per-connection timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// TCP port used by the probe roles to rendezvous
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,

    /// Test type, e.g. "pp" (ping-pong) or "bw"
    #[serde(default = "default_test_type")]
    pub test_type: String,

    /// Message size in bytes
    #[serde(default = "default_message_size")]
    pub message_size: u64,

    /// Iterations per test
    #[serde(default = "default_iterations")]
    pub iterations: u64,

    /// Address the client role connects to
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Appended to both roles' arguments
    #[serde(default)]
    pub extra_args: Vec<String>,

    /// Regex matched against server output to detect readiness
    #[serde(default)]
    pub ready_pattern: Option<String>,

    /// Delay before starting the client when no readiness pattern is set
    #[serde(default = "default_startup_delay")]
    pub startup_delay_ms: u64,

    /// Directory receiving per-run role logs and a summary
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

/// Complete gaudi-connect configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GaudiConnectConfig {
    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub inventory: InventoryConfig,

    #[serde(default)]
    pub verification: VerificationConfig,

    #[serde(default)]
    pub probe: ProbeConfig,
}

// Default functions
fn default_smi_cmd() -> String {
    HL_SMI_CMD.to_string()
}

fn default_ib_root() -> PathBuf {
    PathBuf::from("/sys/class/infiniband")
}

fn default_vendor_id() -> String {
    "1da3".to_string()
}

fn default_check_ports() -> bool {
    true
}

fn default_executable() -> PathBuf {
    PathBuf::from(PERF_TEST_CMD)
}

fn default_max_workers() -> usize {
    4
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_tcp_port() -> u16 {
    18515
}

fn default_test_type() -> String {
    "pp".to_string()
}

fn default_message_size() -> u64 {
    4096
}

fn default_iterations() -> u64 {
    1000
}

fn default_server_address() -> String {
    "127.0.0.1".to_string()
}

fn default_startup_delay() -> u64 {
    5000
}

// Default implementations
impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            smi_cmd: default_smi_cmd(),
            ib_root: default_ib_root(),
            vendor_id: default_vendor_id(),
            gid_index: 0,
        }
    }
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            check_ports: default_check_ports(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            simulate: false,
            parallel: false,
            max_workers: default_max_workers(),
            timeout_secs: default_timeout_secs(),
            tcp_port: default_tcp_port(),
            test_type: default_test_type(),
            message_size: default_message_size(),
            iterations: default_iterations(),
            server_address: default_server_address(),
            extra_args: Vec::new(),
            ready_pattern: None,
            startup_delay_ms: default_startup_delay(),
            log_dir: None,
        }
    }
}

impl ProbeConfig {
    /// Per-connection timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Server startup delay as Duration
    pub fn startup_delay(&self) -> Duration {
        Duration::from_millis(self.startup_delay_ms)
    }
}

impl GaudiConnectConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                ConnectError::Configuration(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(ConnectError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> Result<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            ConnectError::Configuration(format!("Failed to serialize config: {}", e))
        })?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Routing table path from `file` or `preset`
    pub fn routing_path(&self) -> Option<PathBuf> {
        self.routing
            .file
            .clone()
            .or_else(|| self.routing.preset.map(|p| p.path()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.probe.max_workers == 0 {
            return Err(ConnectError::Configuration(
                "max_workers must be > 0".to_string(),
            ));
        }

        if self.probe.timeout_secs == 0 {
            return Err(ConnectError::Configuration(
                "timeout_secs must be > 0".to_string(),
            ));
        }

        if self.probe.executable.as_os_str().is_empty() {
            return Err(ConnectError::Configuration(
                "probe executable must not be empty".to_string(),
            ));
        }

        if self.inventory.gid_index >= GID_TABLE_SIZE {
            return Err(ConnectError::Configuration(format!(
                "gid_index must be < {}",
                GID_TABLE_SIZE
            )));
        }

        if let Some(pattern) = &self.probe.ready_pattern {
            regex::Regex::new(pattern).map_err(|e| {
                ConnectError::Configuration(format!("invalid ready_pattern: {}", e))
            })?;
        }

        Ok(())
    }
}
