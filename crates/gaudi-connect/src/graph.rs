//! Connection graph builder
//!
//! Resolves each routing edge against an [`Inventory`] snapshot. Every edge
//! yields exactly one [`Connection`]; edges that cannot be matched are kept
//! with `resolved = false` and a reason so reports cover the whole routing
//! table.

use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

use crate::inventory::Inventory;
use crate::routing::RoutingEdge;
use crate::types::DeviceRecord;

/// Why an edge could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResolutionFailure {
    ModuleNotFound,
    PortNotFound,
}

impl ResolutionFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionFailure::ModuleNotFound => "MODULE_NOT_FOUND",
            ResolutionFailure::PortNotFound => "PORT_NOT_FOUND",
        }
    }
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One side of a connection
#[derive(Debug, Clone, PartialEq)]
pub struct Endpoint {
    pub module_id: u32,
    pub port: u32,
    /// Matched device, `None` when the module is absent from the inventory
    pub device: Option<Arc<DeviceRecord>>,
}

impl Endpoint {
    fn resolve(module_id: u32, port: u32, inventory: &Inventory) -> Self {
        Self {
            module_id,
            port,
            device: inventory.device_by_module(module_id).cloned(),
        }
    }

    fn failure(&self) -> Option<ResolutionFailure> {
        match &self.device {
            None => Some(ResolutionFailure::ModuleNotFound),
            Some(device) if device.port(self.port).is_none() => Some(ResolutionFailure::PortNotFound),
            Some(_) => None,
        }
    }

    /// Link state of the cited port
    pub fn link_active(&self) -> bool {
        self.device.as_ref().is_some_and(|d| d.link_active(self.port))
    }

    /// Fabric address of the cited port
    pub fn fabric_address(&self) -> Option<&str> {
        self.device.as_ref().and_then(|d| d.fabric_address(self.port))
    }

    pub fn identity(&self) -> Option<&str> {
        self.device.as_ref().map(|d| d.identity.as_str())
    }

    pub fn fabric_name(&self) -> Option<&str> {
        self.device.as_ref().and_then(|d| d.fabric_name.as_deref())
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.fabric_name() {
            Some(name) => write!(f, "{}:port{} (module {})", name, self.port, self.module_id),
            None => write!(f, "module {}:port{}", self.module_id, self.port),
        }
    }
}

impl Serialize for Endpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("Endpoint", 7)?;
        s.serialize_field("module_id", &self.module_id)?;
        s.serialize_field("port", &self.port)?;
        s.serialize_field("identity", &self.identity())?;
        s.serialize_field("device_index", &self.device.as_ref().map(|d| d.device_index))?;
        s.serialize_field("fabric_name", &self.fabric_name())?;
        s.serialize_field("link_active", &self.link_active())?;
        s.serialize_field("fabric_address", &self.fabric_address())?;
        s.end()
    }
}

/// A routing edge resolved against the inventory
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Connection {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub resolved: bool,
    /// Set iff `resolved` is false
    pub reason: Option<ResolutionFailure>,
    /// `None` means port state was not evaluated
    pub verified: Option<bool>,
}

impl Connection {
    pub fn edge(&self) -> RoutingEdge {
        RoutingEdge::new(
            self.source.module_id,
            self.source.port,
            self.destination.module_id,
            self.destination.port,
        )
    }

    fn touches_module(&self, module_id: u32, selector: EndpointSelector) -> bool {
        (selector.source && self.source.module_id == module_id)
            || (selector.destination && self.destination.module_id == module_id)
    }

    fn touches_port(&self, port: u32, selector: EndpointSelector) -> bool {
        (selector.source && self.source.port == port)
            || (selector.destination && self.destination.port == port)
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// Resolves every edge, in order. Pure: the inventory is only read.
pub fn build(edges: &[RoutingEdge], inventory: &Inventory) -> Vec<Connection> {
    let connections: Vec<Connection> = edges
        .iter()
        .map(|edge| {
            let source = Endpoint::resolve(edge.src_module, edge.src_port, inventory);
            let destination = Endpoint::resolve(edge.dst_module, edge.dst_port, inventory);

            let failures = [source.failure(), destination.failure()];
            let reason = if failures.contains(&Some(ResolutionFailure::ModuleNotFound)) {
                Some(ResolutionFailure::ModuleNotFound)
            } else {
                failures.into_iter().flatten().next()
            };

            if let Some(reason) = reason {
                debug!(edge = %edge, %reason, "Unresolved connection");
            }

            Connection {
                source,
                destination,
                resolved: reason.is_none(),
                reason,
                verified: None,
            }
        })
        .collect();

    info!(
        total = connections.len(),
        resolved = connections.iter().filter(|c| c.resolved).count(),
        "Built connection graph"
    );
    connections
}

/// Which endpoints a filter looks at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointSelector {
    pub source: bool,
    pub destination: bool,
}

impl EndpointSelector {
    pub const BOTH: Self = Self {
        source: true,
        destination: true,
    };
    pub const SOURCE: Self = Self {
        source: true,
        destination: false,
    };
    pub const DESTINATION: Self = Self {
        source: false,
        destination: true,
    };
}

impl Default for EndpointSelector {
    fn default() -> Self {
        Self::BOTH
    }
}

/// Post-build selection over a connection set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionFilter {
    pub module_id: Option<u32>,
    pub port: Option<u32>,
    pub selector: EndpointSelector,
}

impl ConnectionFilter {
    pub fn is_empty(&self) -> bool {
        self.module_id.is_none() && self.port.is_none()
    }

    pub fn matches(&self, connection: &Connection) -> bool {
        self.module_id
            .map_or(true, |m| connection.touches_module(m, self.selector))
            && self
                .port
                .map_or(true, |p| connection.touches_port(p, self.selector))
    }

    /// Returns the matching connections as a view; the set is untouched.
    pub fn apply<'a>(&self, connections: &'a [Connection]) -> Vec<&'a Connection> {
        connections.iter().filter(|c| self.matches(c)).collect()
    }
}

/// Connections between two modules, in either direction
pub fn between(connections: &[Connection], a: u32, b: u32) -> Vec<&Connection> {
    connections
        .iter()
        .filter(|c| {
            (c.source.module_id == a && c.destination.module_id == b)
                || (c.source.module_id == b && c.destination.module_id == a)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortRecord;
    use pretty_assertions::assert_eq;

    fn inventory() -> Inventory {
        let compute = (0..3)
            .map(|m| DeviceRecord::compute(m, m, format!("0000:{:02x}:00.0", 0x4d + m)))
            .collect();
        let fabric = (0..3)
            .map(|m| {
                DeviceRecord::fabric(
                    m,
                    format!("0000:{:02x}:00.0", 0x4d + m),
                    format!("hbl_{}", m),
                    [
                        PortRecord::new(6, "4: ACTIVE", Some(format!("fe80::{}:6", m))),
                        PortRecord::new(7, "1: DOWN", None),
                    ],
                )
            })
            .collect();
        Inventory::from_records(compute, fabric)
    }

    #[test]
    fn test_resolved_connection() {
        let conns = build(&[RoutingEdge::new(0, 6, 1, 6)], &inventory());
        assert_eq!(conns.len(), 1);
        let conn = &conns[0];
        assert!(conn.resolved);
        assert_eq!(conn.reason, None);
        assert_eq!(conn.verified, None);
        assert_eq!(conn.source.fabric_name(), Some("hbl_0"));
        assert_eq!(conn.destination.fabric_address(), Some("fe80::1:6"));
        assert!(conn.source.link_active());
        assert_eq!(conn.edge(), RoutingEdge::new(0, 6, 1, 6));
    }

    #[test]
    fn test_module_not_found_takes_precedence() {
        // source port missing and destination module missing
        let conns = build(&[RoutingEdge::new(0, 9, 8, 6)], &inventory());
        assert!(!conns[0].resolved);
        assert_eq!(conns[0].reason, Some(ResolutionFailure::ModuleNotFound));
        assert!(conns[0].destination.device.is_none());
        assert!(conns[0].source.device.is_some());
    }

    #[test]
    fn test_port_not_found() {
        let conns = build(&[RoutingEdge::new(0, 6, 2, 1)], &inventory());
        assert_eq!(conns[0].reason, Some(ResolutionFailure::PortNotFound));
    }

    #[test]
    fn test_inactive_port_still_resolves() {
        let conns = build(&[RoutingEdge::new(0, 7, 1, 7)], &inventory());
        assert!(conns[0].resolved);
        assert!(!conns[0].source.link_active());
    }

    #[test]
    fn test_one_to_one_and_idempotent() {
        let edges = vec![
            RoutingEdge::new(0, 6, 1, 6),
            RoutingEdge::new(0, 6, 1, 6),
            RoutingEdge::new(5, 6, 1, 6),
            RoutingEdge::new(1, 3, 2, 6),
        ];
        let inv = inventory();
        let first = build(&edges, &inv);
        let second = build(&edges, &inv);
        assert_eq!(first.len(), edges.len());
        assert_eq!(first, second);
        let order: Vec<RoutingEdge> = first.iter().map(Connection::edge).collect();
        assert_eq!(order, edges);
    }

    #[test]
    fn test_filters_return_views() {
        let edges = vec![
            RoutingEdge::new(0, 6, 1, 6),
            RoutingEdge::new(1, 7, 2, 7),
            RoutingEdge::new(2, 6, 0, 7),
        ];
        let conns = build(&edges, &inventory());

        let by_module = ConnectionFilter {
            module_id: Some(0),
            ..Default::default()
        };
        assert_eq!(by_module.apply(&conns).len(), 2);

        let as_source = ConnectionFilter {
            module_id: Some(0),
            selector: EndpointSelector::SOURCE,
            ..Default::default()
        };
        assert_eq!(as_source.apply(&conns).len(), 1);

        let by_port = ConnectionFilter {
            port: Some(7),
            selector: EndpointSelector::DESTINATION,
            ..Default::default()
        };
        let view = by_port.apply(&conns);
        assert_eq!(view.len(), 2);
        assert_eq!(view[0].edge(), edges[1]);

        assert!(ConnectionFilter::default().is_empty());
        assert_eq!(ConnectionFilter::default().apply(&conns).len(), 3);
        assert_eq!(conns.len(), 3);
    }

    #[test]
    fn test_between_either_direction() {
        let edges = vec![
            RoutingEdge::new(0, 6, 1, 6),
            RoutingEdge::new(1, 7, 0, 7),
            RoutingEdge::new(1, 6, 2, 6),
        ];
        let conns = build(&edges, &inventory());
        assert_eq!(between(&conns, 0, 1).len(), 2);
        assert_eq!(between(&conns, 2, 0).len(), 0);
    }

    #[test]
    fn test_endpoint_serialization() {
        let conns = build(&[RoutingEdge::new(0, 6, 9, 6)], &inventory());
        let json = serde_json::to_value(&conns[0]).unwrap();
        assert_eq!(json["resolved"], false);
        assert_eq!(json["reason"], "MODULE_NOT_FOUND");
        assert_eq!(json["source"]["fabric_name"], "hbl_0");
        assert_eq!(json["source"]["link_active"], true);
        assert!(json["destination"]["identity"].is_null());
        assert!(json["verified"].is_null());
    }
}
