//! Device inventory
//!
//! Providers enumerate compute devices (accelerator modules) and fabric-port
//! devices (RDMA devices with their ports). [`Inventory`] takes one snapshot
//! from a provider, folds each fabric device into the compute device with the
//! same PCI identity, and indexes the result by module id.
//!
//! The snapshot is immutable after construction and is shared read-only by
//! every resolution and probe task.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use gaudi_connect_common::shell;

use crate::config::InventoryConfig;
use crate::error::{ConnectError, Result};
use crate::types::{DeviceCapability, DeviceRecord, PortRecord};

/// Source of device records for the current host.
///
/// Each call reflects host state at call time; callers that need a stable
/// view take an [`Inventory`] snapshot.
#[async_trait]
pub trait InventoryProvider: Send + Sync {
    /// Accelerator modules with their module id, index and PCI identity
    async fn list_compute_devices(&self) -> Result<Vec<DeviceRecord>>;

    /// RDMA fabric devices with their ports
    async fn list_fabric_devices(&self) -> Result<Vec<DeviceRecord>>;
}

/// Immutable device snapshot indexed by module id
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    devices: Vec<Arc<DeviceRecord>>,
    unmatched_fabric: Vec<Arc<DeviceRecord>>,
    by_module: HashMap<u32, usize>,
}

impl Inventory {
    /// Takes a snapshot from a provider.
    ///
    /// Provider failures are fatal: without an inventory no result is meaningful.
    pub async fn collect(provider: &dyn InventoryProvider) -> Result<Self> {
        let compute = provider.list_compute_devices().await?;
        let fabric = provider.list_fabric_devices().await?;
        let inventory = Self::from_records(compute, fabric);

        info!(
            compute_devices = inventory.devices.len(),
            unmatched_fabric_devices = inventory.unmatched_fabric.len(),
            "Collected device inventory"
        );
        Ok(inventory)
    }

    /// Builds a snapshot from raw provider records.
    pub fn from_records(compute: Vec<DeviceRecord>, fabric: Vec<DeviceRecord>) -> Self {
        let mut fabric_by_identity: HashMap<String, DeviceRecord> = fabric
            .into_iter()
            .map(|d| (d.identity.to_lowercase(), d))
            .collect();

        let mut devices = Vec::with_capacity(compute.len());
        let mut by_module = HashMap::new();

        for mut device in compute {
            if let Some(fabric) = fabric_by_identity.remove(&device.identity.to_lowercase()) {
                device.fabric_name = fabric.fabric_name;
                device.vendor_id = device.vendor_id.or(fabric.vendor_id);
                device.ports = fabric.ports;
            }

            match device.module_id {
                Some(module_id) if by_module.contains_key(&module_id) => {
                    warn!(module_id, identity = %device.identity, "Duplicate module id, keeping first device");
                }
                Some(module_id) => {
                    by_module.insert(module_id, devices.len());
                }
                None => {
                    warn!(identity = %device.identity, "Compute device without module id is not routable");
                }
            }
            devices.push(Arc::new(device));
        }

        let mut unmatched_fabric: Vec<Arc<DeviceRecord>> =
            fabric_by_identity.into_values().map(Arc::new).collect();
        unmatched_fabric.sort_by(|a, b| a.identity.cmp(&b.identity));

        Self {
            devices,
            unmatched_fabric,
            by_module,
        }
    }

    pub fn device_by_module(&self, module_id: u32) -> Option<&Arc<DeviceRecord>> {
        self.by_module.get(&module_id).map(|&idx| &self.devices[idx])
    }

    /// Compute devices in provider order
    pub fn devices(&self) -> &[Arc<DeviceRecord>] {
        &self.devices
    }

    /// Fabric devices with no compute device at the same PCI identity
    pub fn unmatched_fabric_devices(&self) -> &[Arc<DeviceRecord>] {
        &self.unmatched_fabric
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Human-readable device table
    pub fn render_summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "Devices ({}):", self.devices.len());
        for device in &self.devices {
            let active: Vec<String> = device.active_ports().map(|p| p.to_string()).collect();
            let _ = writeln!(
                out,
                "  module={:<3} index={:<3} bus_id={} fabric={} ports={} active=[{}]",
                device
                    .module_id
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| "-".to_string()),
                device.device_index,
                device.identity,
                device.fabric_name.as_deref().unwrap_or("-"),
                device.ports.len(),
                active.join(",")
            );
        }
        if !self.unmatched_fabric.is_empty() {
            let _ = writeln!(out, "Unmatched fabric devices ({}):", self.unmatched_fabric.len());
            for device in &self.unmatched_fabric {
                let _ = writeln!(out, "  {}", device);
            }
        }
        out
    }
}

/// PCI address, e.g. `0000:4d:00.0`
static PCI_ADDR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[0-9a-fA-F]{4}:[0-9a-fA-F]{2}:[0-9a-fA-F]{2}\.[0-7]$").expect("Invalid regex pattern")
});

/// Parent directories searched for a `vendor` file
const VENDOR_SEARCH_DEPTH: usize = 10;

/// Live host inventory from the device query tool and sysfs
#[derive(Debug, Clone)]
pub struct SysfsInventory {
    smi_cmd: String,
    ib_root: PathBuf,
    vendor_id: String,
    gid_index: u32,
}

impl SysfsInventory {
    pub fn new(config: &InventoryConfig) -> Self {
        Self {
            smi_cmd: config.smi_cmd.clone(),
            ib_root: config.ib_root.clone(),
            vendor_id: config.vendor_id.trim_start_matches("0x").to_lowercase(),
            gid_index: config.gid_index,
        }
    }

    fn scan_device(&self, entry: &Path, device_index: u32) -> Option<DeviceRecord> {
        let name = entry.file_name()?.to_string_lossy().to_string();
        let real = fs::canonicalize(entry).ok()?;

        let (identity, pci_path) = pci_identity(&real)?;
        let vendor = read_vendor_id(&pci_path);
        if vendor.as_deref() != Some(self.vendor_id.as_str()) {
            debug!(device = %name, vendor = ?vendor, "Skipping foreign RDMA device");
            return None;
        }

        let ports = self.scan_ports(entry);
        let mut record = DeviceRecord::fabric(device_index, identity, name, ports);
        record.vendor_id = vendor;
        Some(record)
    }

    fn scan_ports(&self, device_path: &Path) -> Vec<PortRecord> {
        let Ok(entries) = fs::read_dir(device_path.join("ports")) else {
            return Vec::new();
        };

        let mut ports: Vec<PortRecord> = entries
            .flatten()
            .filter_map(|entry| {
                let port_num: u32 = entry.file_name().to_string_lossy().parse().ok()?;
                let path = entry.path();
                let state = read_trimmed(&path.join("state")).unwrap_or_default();
                let gid = read_trimmed(&path.join("gids").join(self.gid_index.to_string()));
                let mut port = PortRecord::new(port_num, state, gid);
                port.link_layer = read_trimmed(&path.join("link_layer"));
                Some(port)
            })
            .collect();
        ports.sort_by_key(|p| p.port_num);
        ports
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Finds the last PCI address component of a canonical sysfs path.
fn pci_identity(real: &Path) -> Option<(String, PathBuf)> {
    let mut found = None;
    let mut prefix = PathBuf::new();
    for component in real.components() {
        prefix.push(component);
        let text = component.as_os_str().to_string_lossy();
        if PCI_ADDR_RE.is_match(&text) {
            found = Some((text.to_lowercase(), prefix.clone()));
        }
    }
    found
}

fn read_vendor_id(pci_path: &Path) -> Option<String> {
    pci_path
        .ancestors()
        .take(VENDOR_SEARCH_DEPTH)
        .find_map(|dir| read_trimmed(&dir.join("vendor")))
        .map(|v| v.trim_start_matches("0x").to_lowercase())
}

/// Parses `hl-smi -Q index,module_id,bus_id -f csv` output.
pub fn parse_smi_csv(output: &str) -> Result<Vec<DeviceRecord>> {
    let mut lines = output.lines().map(str::trim).filter(|l| !l.is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };

    let columns: Vec<String> = header.split(',').map(|c| c.trim().to_lowercase()).collect();
    let column = |name: &str| {
        columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ConnectError::Inventory(format!("device query output lacks '{}' column", name)))
    };
    let (index_col, module_col, bus_col) = (column("index")?, column("module_id")?, column("bus_id")?);

    let mut devices = Vec::new();
    for line in lines {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        let parsed = (
            fields.get(index_col).and_then(|v| v.parse::<u32>().ok()),
            fields.get(module_col).and_then(|v| v.parse::<u32>().ok()),
            fields.get(bus_col).filter(|v| !v.is_empty()),
        );
        match parsed {
            (Some(index), Some(module_id), Some(bus_id)) => {
                devices.push(DeviceRecord::compute(module_id, index, bus_id.to_lowercase()));
            }
            _ => warn!(row = %line, "Skipping unparsable device query row"),
        }
    }
    Ok(devices)
}

#[async_trait]
impl InventoryProvider for SysfsInventory {
    async fn list_compute_devices(&self) -> Result<Vec<DeviceRecord>> {
        let output = shell::run_or_fail(&self.smi_cmd, &["-Q", "index,module_id,bus_id", "-f", "csv"])
            .await
            .map_err(|e| ConnectError::Inventory(format!("device query failed: {}", e)))?;
        parse_smi_csv(&output)
    }

    async fn list_fabric_devices(&self) -> Result<Vec<DeviceRecord>> {
        let entries = match fs::read_dir(&self.ib_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %self.ib_root.display(), "RDMA sysfs root does not exist");
                return Ok(Vec::new());
            }
            Err(e) => return Err(ConnectError::Io(e)),
        };

        let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
        paths.sort();

        let mut devices = Vec::new();
        for path in paths {
            if let Some(device) = self.scan_device(&path, devices.len() as u32) {
                debug!(device = %device, ports = device.ports.len(), "Found fabric device");
                devices.push(device);
            }
        }
        Ok(devices)
    }
}

/// Inventory loaded from a JSON snapshot
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticInventory {
    #[serde(default)]
    pub compute: Vec<DeviceRecord>,
    #[serde(default)]
    pub fabric: Vec<DeviceRecord>,
}

impl StaticInventory {
    pub fn new(compute: Vec<DeviceRecord>, fabric: Vec<DeviceRecord>) -> Self {
        Self { compute, fabric }
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            ConnectError::Inventory(format!("cannot read {}: {}", path.display(), e))
        })?;
        let inventory: Self = serde_json::from_str(&content)?;

        if let Some(bad) = inventory
            .compute
            .iter()
            .find(|d| d.capability != DeviceCapability::Compute)
        {
            return Err(ConnectError::Inventory(format!(
                "{} listed as compute device but tagged {}",
                bad.identity,
                bad.capability.as_str()
            )));
        }
        Ok(inventory)
    }
}

#[async_trait]
impl InventoryProvider for StaticInventory {
    async fn list_compute_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.compute.clone())
    }

    async fn list_fabric_devices(&self) -> Result<Vec<DeviceRecord>> {
        Ok(self.fabric.clone())
    }
}
