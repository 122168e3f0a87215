//! Shared infrastructure for the gaudi-connect tools.
//!
//! - [`shell`]: argv command execution, command-line rendering,
//!   executable lookup
//! - [`error`]: error types for command execution
//!
//! # Example
//!
//! ```ignore
//! use gaudi_connect_common::{shell, ShellResult};
//!
//! async fn device_csv() -> ShellResult<String> {
//!     shell::run_or_fail(shell::HL_SMI_CMD, &["-Q", "index,module_id,bus_id", "-f", "csv"]).await
//! }
//! ```

pub mod error;
pub mod shell;

pub use error::{ShellError, ShellResult};
pub use shell::{ExecResult, render_command};
