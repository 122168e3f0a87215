//! Gaudi scale-up connectivity engine
//!
//! Resolves a routing table of module/port links against the accelerator
//! and RDMA devices present on the host, verifies link state on both ends
//! of every link, and optionally drives the perf-test tool across each one.
//!
//! Pipeline: [`routing`] + [`inventory`] -> [`graph`] -> [`verify`] ->
//! [`orchestrator`] (via [`probe`]) -> [`report`]. [`engine`] wires the
//! stages together from a [`GaudiConnectConfig`].

pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod inventory;
pub mod orchestrator;
pub mod probe;
pub mod report;
pub mod routing;
pub mod types;
pub mod verify;

pub use config::{GaudiConnectConfig, InventoryConfig, ProbeConfig, RoutingConfig, VerificationConfig};
pub use engine::ConnectivityEngine;
pub use error::{ConnectError, ProbeError, Result};
pub use graph::{between, build, Connection, ConnectionFilter, Endpoint, EndpointSelector, ResolutionFailure};
pub use inventory::{Inventory, InventoryProvider, StaticInventory, SysfsInventory};
pub use orchestrator::{Concurrency, ProbeMode, ProbeOrchestrator, ProbeOutcome, ProbeStatus};
pub use probe::{ProbeExecutor, ProbeResult, ProbeRole, ProcessProbe, RoleCommands};
pub use report::{summarize, Report, Summary};
pub use routing::{RoutingEdge, RoutingPreset, RoutingTable, RowError};
pub use types::{DeviceCapability, DeviceRecord, PortRecord};
pub use verify::PortStateVerifier;
