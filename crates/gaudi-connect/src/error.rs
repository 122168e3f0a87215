//! Error types for gaudi-connect
//!
//! Only fatal conditions live here. Malformed routing rows, unresolved
//! connections and failed probes are recorded as data on the results.

use gaudi_connect_common::ShellError;
use thiserror::Error;

use crate::probe::ProbeRole;

/// Fatal errors that abort a connectivity run
#[derive(Error, Debug)]
pub enum ConnectError {
    /// Device inventory could not be obtained
    #[error("Inventory error: {0}")]
    Inventory(String),

    /// Routing source could not be read
    #[error("Routing error: {0}")]
    Routing(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// External command error
    #[error(transparent)]
    Shell(#[from] ShellError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for gaudi-connect operations
pub type Result<T> = std::result::Result<T, ConnectError>;

/// Errors raised while driving one probe invocation.
///
/// These never escape the orchestrator; they are mapped onto the
/// outcome of the connection being probed.
#[derive(Error, Debug)]
pub enum ProbeError {
    /// A probe role could not be started
    #[error("failed to start {role} role: {source}")]
    Spawn {
        role: ProbeRole,
        #[source]
        source: std::io::Error,
    },

    /// A probe role exited before it was expected to
    #[error("{role} role exited prematurely ({status})")]
    RoleExited { role: ProbeRole, status: String },

    /// Waiting on a probe role failed
    #[error("failed to wait for {role} role: {source}")]
    Wait {
        role: ProbeRole,
        #[source]
        source: std::io::Error,
    },
}
