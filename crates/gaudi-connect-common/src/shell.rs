//! External command execution utilities.
//!
//! Commands run from an argv vector ([`run`], [`run_or_fail`]), never
//! through a shell. [`render_command`] produces the copy-pasteable command
//! line that is logged and reported for dry runs.
//!
//! # Example
//!
//! ```ignore
//! use gaudi_connect_common::shell;
//!
//! let args = ["-Q", "index,module_id,bus_id", "-f", "csv"];
//! let csv = shell::run_or_fail("hl-smi", &args).await?;
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;

use crate::error::{ShellError, ShellResult};

/// Default location of the `hl-smi` device query tool.
pub const HL_SMI_CMD: &str = "hl-smi";

/// Default location of the `perf_test` fabric probe.
pub const PERF_TEST_CMD: &str = "/opt/habanalabs/perf-test/perf_test";

/// Characters that need escaping inside shell double quotes.
/// Matches: $, `, ", \, and newline
static SHELL_ESCAPE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"([$`"\\\n])"#).expect("Invalid regex pattern"));

/// Arguments made only of these characters are rendered unquoted.
static SHELL_SAFE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_@%+=:,./-]+$").expect("Invalid regex pattern"));

/// Quotes a string for safe use in shell commands.
///
/// Wraps the string in double quotes and escapes `$`, `` ` ``, `"`, `\`
/// and newline.
///
/// # Example
///
/// ```
/// use gaudi_connect_common::shell::shellquote;
///
/// assert_eq!(shellquote("simple"), "\"simple\"");
/// assert_eq!(shellquote("with$var"), "\"with\\$var\"");
/// ```
pub fn shellquote(s: &str) -> String {
    let escaped = SHELL_ESCAPE_RE.replace_all(s, r"\$1");
    format!("\"{}\"", escaped)
}

/// Quotes an argument only when the shell would otherwise interpret it.
pub fn quote_arg(s: &str) -> String {
    if SHELL_SAFE_RE.is_match(s) {
        s.to_string()
    } else {
        shellquote(s)
    }
}

/// Renders a program and its arguments as a single command line.
///
/// ```
/// use gaudi_connect_common::shell::render_command;
///
/// let line = render_command("/opt/perf_test", &["-d", "hbl_0", "-i", "7"]);
/// assert_eq!(line, "/opt/perf_test -d hbl_0 -i 7");
/// ```
pub fn render_command<S: AsRef<str>>(program: &str, args: &[S]) -> String {
    std::iter::once(quote_arg(program))
        .chain(args.iter().map(|a| quote_arg(a.as_ref())))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Returns true if `path` names an existing regular file with an execute bit set.
pub fn is_executable(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }

    #[cfg(unix)]
    let executable = {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    };

    #[cfg(not(unix))]
    let executable = true;

    executable
}

/// Resolves an executable name.
///
/// Names containing a path separator are checked as-is; bare names are
/// searched in `PATH`.
pub fn find_executable(name: &Path) -> ShellResult<PathBuf> {
    if name.components().count() > 1 || name.is_absolute() {
        if is_executable(name) {
            return Ok(name.to_path_buf());
        }
        return Err(ShellError::NotExecutable {
            path: name.to_path_buf(),
        });
    }

    let search = std::env::var_os("PATH").unwrap_or_default();
    std::env::split_paths(&search)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable(candidate))
        .ok_or_else(|| ShellError::NotExecutable {
            path: name.to_path_buf(),
        })
}

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// The exit code of the command (0 = success, -1 = killed by signal).
    pub exit_code: i32,
    /// The captured stdout output.
    pub stdout: String,
    /// The captured stderr output.
    pub stderr: String,
}

impl ExecResult {
    /// Returns true if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Returns the combined output (stdout + stderr) for error messages.
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

async fn collect(mut command: Command, rendered: &str) -> ShellResult<ExecResult> {
    tracing::debug!(command = %rendered, "Executing command");

    let output = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ShellError::Spawn {
            command: rendered.to_string(),
            source: e,
        })?;

    let result = ExecResult {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if result.success() {
        tracing::trace!(command = %rendered, "Command succeeded");
    } else {
        tracing::warn!(
            command = %rendered,
            exit_code = result.exit_code,
            stderr = %result.stderr,
            "Command failed"
        );
    }

    Ok(result)
}

/// Runs a program with explicit arguments, without a shell.
pub async fn run<S: AsRef<str>>(program: &str, args: &[S]) -> ShellResult<ExecResult> {
    let rendered = render_command(program, args);
    let mut command = Command::new(program);
    command.args(args.iter().map(|a| OsStr::new(a.as_ref())));
    collect(command, &rendered).await
}

/// Runs a program and returns its stdout, failing on non-zero exit.
pub async fn run_or_fail<S: AsRef<str>>(program: &str, args: &[S]) -> ShellResult<String> {
    let result = run(program, args).await?;
    if result.success() {
        Ok(result.stdout)
    } else {
        Err(ShellError::CommandFailed {
            command: render_command(program, args),
            exit_code: result.exit_code,
            output: result.combined_output(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shellquote_special_chars() {
        assert_eq!(shellquote("$HOME"), "\"\\$HOME\"");
        assert_eq!(shellquote("`whoami`"), "\"\\`whoami\\`\"");
        assert_eq!(shellquote("say \"hi\""), "\"say \\\"hi\\\"\"");
        assert_eq!(shellquote(""), "\"\"");
    }

    #[test]
    fn test_quote_arg_only_when_needed() {
        assert_eq!(quote_arg("hbl_3"), "hbl_3");
        assert_eq!(quote_arg("127.0.0.1"), "127.0.0.1");
        assert_eq!(quote_arg("fe80::1"), "fe80::1");
        assert_eq!(quote_arg("two words"), "\"two words\"");
        assert_eq!(quote_arg(""), "\"\"");
    }

    #[test]
    fn test_render_command() {
        let line = render_command("/opt/perf test/perf_test", &["-g", "0", "127.0.0.1"]);
        assert_eq!(line, "\"/opt/perf test/perf_test\" -g 0 127.0.0.1");
    }

    #[test]
    fn test_is_executable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool");
        assert!(!is_executable(&path));

        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert!(!is_executable(&path));
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        assert!(is_executable(&path));
        assert!(!is_executable(dir.path()));
    }

    #[test]
    fn test_find_executable_missing() {
        let err = find_executable(Path::new("/nonexistent/perf_test")).unwrap_err();
        assert!(matches!(err, ShellError::NotExecutable { .. }));
        assert!(find_executable(Path::new("definitely-not-a-real-tool-xyz")).is_err());
    }

    #[test]
    fn test_exec_result_combined() {
        let result = ExecResult {
            exit_code: 0,
            stdout: "stdout".to_string(),
            stderr: "stderr".to_string(),
        };
        assert!(result.success());
        assert_eq!(result.combined_output(), "stdout\nstderr");
    }

    #[tokio::test]
    async fn test_run_argv() {
        let result = run("/bin/sh", &["-c", "echo $0", "argv-zero"]).await.unwrap();
        assert!(result.success());
        assert_eq!(result.stdout, "argv-zero");
    }

    #[tokio::test]
    async fn test_run_or_fail_failure() {
        match run_or_fail("/bin/sh", &["-c", "exit 3"]).await {
            Err(ShellError::CommandFailed { exit_code, .. }) => assert_eq!(exit_code, 3),
            other => panic!("Expected CommandFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_run_spawn_error() {
        let err = run::<&str>("/nonexistent/hl-smi", &[]).await.unwrap_err();
        assert!(matches!(err, ShellError::Spawn { .. }));
    }
}
