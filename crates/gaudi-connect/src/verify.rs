//! Port state verification
//!
//! Evaluates the link state already captured in the inventory snapshot.
//! Nothing here touches hardware.

use tracing::{info, warn};

use crate::graph::{Connection, Endpoint};

/// Sets `verified` on every connection from the endpoints' link state.
#[derive(Debug, Clone, Copy)]
pub struct PortStateVerifier {
    enabled: bool,
}

impl PortStateVerifier {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Returns new records with `verified` populated.
    ///
    /// When disabled, connections are returned unchanged with `verified`
    /// left unset ("not evaluated").
    pub fn verify(&self, connections: &[Connection]) -> Vec<Connection> {
        if !self.enabled {
            info!("Port state check disabled");
            return connections.to_vec();
        }

        let verified: Vec<Connection> = connections
            .iter()
            .map(|conn| {
                let ok = conn.resolved && conn.source.link_active() && conn.destination.link_active();
                if conn.resolved && !ok {
                    let down: Vec<String> = inactive_endpoints(conn).map(|e| e.to_string()).collect();
                    warn!(connection = %conn, inactive = ?down, "Inactive link");
                }
                Connection {
                    verified: Some(ok),
                    ..conn.clone()
                }
            })
            .collect();

        info!(
            total = verified.len(),
            active = verified.iter().filter(|c| c.verified == Some(true)).count(),
            "Verified port states"
        );
        verified
    }
}

impl Default for PortStateVerifier {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Endpoints of a connection whose cited port is not active
pub fn inactive_endpoints(conn: &Connection) -> impl Iterator<Item = &Endpoint> {
    [&conn.source, &conn.destination]
        .into_iter()
        .filter(|e| !e.link_active())
}
