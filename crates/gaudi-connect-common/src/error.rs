//! Error types for command execution.
//!
//! All errors implement `std::error::Error` via `thiserror`.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for command execution helpers.
pub type ShellResult<T> = Result<T, ShellError>;

/// Errors that can occur while running external commands.
#[derive(Debug, Error)]
pub enum ShellError {
    /// Failed to spawn the command.
    #[error("Failed to execute command '{command}': {source}")]
    Spawn {
        /// The rendered command line.
        command: String,
        /// The underlying IO error.
        #[source]
        source: io::Error,
    },

    /// Command returned a non-zero exit code.
    #[error("Command failed: '{command}' (exit code {exit_code}): {output}")]
    CommandFailed {
        /// The rendered command line.
        command: String,
        /// The exit code, -1 when terminated by a signal.
        exit_code: i32,
        /// Combined stdout/stderr output.
        output: String,
    },

    /// Executable missing or lacking execute permission.
    #[error("Executable '{}' not found or not executable", path.display())]
    NotExecutable {
        /// The path that was checked.
        path: PathBuf,
    },
}

impl ShellError {
    /// Returns the rendered command line this error refers to, if any.
    pub fn command(&self) -> Option<&str> {
        match self {
            ShellError::Spawn { command, .. } | ShellError::CommandFailed { command, .. } => {
                Some(command)
            }
            ShellError::NotExecutable { .. } => None,
        }
    }
}
