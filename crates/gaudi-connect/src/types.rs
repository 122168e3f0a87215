//! Device records shared by the inventory, resolution and probe stages.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// GID value reported by sysfs for an unassigned address slot
pub const ZERO_GID: &str = "0000:0000:0000:0000:0000:0000:0000:0000";

/// Kind of device a record describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCapability {
    /// Accelerator module enumerated by the device query tool
    Compute,
    /// RDMA fabric device enumerated from sysfs
    FabricPort,
}

impl DeviceCapability {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceCapability::Compute => "compute",
            DeviceCapability::FabricPort => "fabric_port",
        }
    }
}

/// Snapshot of one fabric port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortRecord {
    /// Port number as enumerated under `ports/`
    pub port_num: u32,
    /// Raw state text, e.g. "4: ACTIVE"
    #[serde(default)]
    pub state: String,
    /// Whether the link is up
    pub link_active: bool,
    /// Link layer, e.g. "Ethernet"
    #[serde(default)]
    pub link_layer: Option<String>,
    /// Fabric address (GID) used by the probe, if assigned
    #[serde(default)]
    pub fabric_address: Option<String>,
}

impl PortRecord {
    /// Creates a port record from raw sysfs values.
    ///
    /// An all-zero GID is treated as no address.
    pub fn new(port_num: u32, state: impl Into<String>, fabric_address: Option<String>) -> Self {
        let state = state.into();
        Self {
            port_num,
            link_active: is_active_state(&state),
            state,
            link_layer: None,
            fabric_address: fabric_address.filter(|gid| !gid.is_empty() && gid != ZERO_GID),
        }
    }

    pub fn with_link_layer(mut self, link_layer: impl Into<String>) -> Self {
        self.link_layer = Some(link_layer.into());
        self
    }
}

/// Returns true for the InfiniBand port states that carry traffic.
///
/// Valid states are 1: DOWN, 2: INIT, 3: ARMED, 4: ACTIVE, 5: ACTIVE_DEFER.
pub fn is_active_state(state: &str) -> bool {
    let state = state.trim();
    state.starts_with("4:") || state.starts_with("5:") || state.to_uppercase().contains("ACTIVE")
}

/// A compute device or fabric-port device known to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub capability: DeviceCapability,
    /// Module id from the device query tool; always set for compute devices
    #[serde(default)]
    pub module_id: Option<u32>,
    /// Device index from the device query tool or sysfs enumeration order
    pub device_index: u32,
    /// PCI bus id, e.g. "0000:4d:00.0"
    pub identity: String,
    /// RDMA device name, e.g. "hbl_3"
    #[serde(default)]
    pub fabric_name: Option<String>,
    /// PCI vendor id without the 0x prefix
    #[serde(default)]
    pub vendor_id: Option<String>,
    #[serde(default)]
    pub ports: BTreeMap<u32, PortRecord>,
}

impl DeviceRecord {
    /// Creates a compute device record with no fabric information.
    pub fn compute(module_id: u32, device_index: u32, identity: impl Into<String>) -> Self {
        Self {
            capability: DeviceCapability::Compute,
            module_id: Some(module_id),
            device_index,
            identity: identity.into(),
            fabric_name: None,
            vendor_id: None,
            ports: BTreeMap::new(),
        }
    }

    /// Creates a fabric-port device record with the given ports.
    pub fn fabric(
        device_index: u32,
        identity: impl Into<String>,
        fabric_name: impl Into<String>,
        ports: impl IntoIterator<Item = PortRecord>,
    ) -> Self {
        Self {
            capability: DeviceCapability::FabricPort,
            module_id: None,
            device_index,
            identity: identity.into(),
            fabric_name: Some(fabric_name.into()),
            vendor_id: None,
            ports: ports.into_iter().map(|p| (p.port_num, p)).collect(),
        }
    }

    pub fn with_vendor(mut self, vendor_id: impl Into<String>) -> Self {
        self.vendor_id = Some(vendor_id.into());
        self
    }

    pub fn port(&self, port_num: u32) -> Option<&PortRecord> {
        self.ports.get(&port_num)
    }

    /// Link state of a port; false when the port is not enumerated.
    pub fn link_active(&self, port_num: u32) -> bool {
        self.port(port_num).is_some_and(|p| p.link_active)
    }

    pub fn fabric_address(&self, port_num: u32) -> Option<&str> {
        self.port(port_num).and_then(|p| p.fabric_address.as_deref())
    }

    pub fn active_ports(&self) -> impl Iterator<Item = u32> + '_ {
        self.ports.values().filter(|p| p.link_active).map(|p| p.port_num)
    }

    /// Name passed to the probe as the device argument.
    pub fn probe_device_name(&self) -> &str {
        self.fabric_name.as_deref().unwrap_or(&self.identity)
    }
}

impl fmt::Display for DeviceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.module_id {
            Some(module_id) => write!(f, "module {} ({})", module_id, self.identity)?,
            None => write!(f, "{}", self.identity)?,
        }
        if let Some(name) = &self.fabric_name {
            write!(f, " [{}]", name)?;
        }
        Ok(())
    }
}
