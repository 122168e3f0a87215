//! Fabric probe execution
//!
//! A probe runs the external perf-test tool as two cooperating processes:
//! a server role bound to the source endpoint and a client role bound to
//! the destination endpoint. The client is only started once the server is
//! ready, and both roles are torn down on every exit path.
//!
//! Before anything is spawned, [`ProcessProbe`] checks whether a real run is
//! possible at all. When it is not (no fabric address, tool missing,
//! simulation requested) the command lines are reported as a dry run.
//!
//! On unix each role runs in its own process group, and teardown signals the
//! whole group so helpers forked by the tool go down with it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use gaudi_connect_common::shell;

use crate::config::ProbeConfig;
use crate::error::{ConnectError, ProbeError, Result};
use crate::graph::{Connection, Endpoint};
use crate::orchestrator::ProbeStatus;

/// Role of one probe process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeRole {
    Server,
    Client,
}

impl ProbeRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeRole::Server => "server",
            ProbeRole::Client => "client",
        }
    }
}

impl fmt::Display for ProbeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Program and arguments for one role
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeCommand {
    pub role: ProbeRole,
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl ProbeCommand {
    /// Copy-pasteable command line
    pub fn render(&self) -> String {
        shell::render_command(&self.program.to_string_lossy(), self.args.as_slice())
    }
}

/// Rendered command lines of both roles
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleCommands {
    pub server: String,
    pub client: String,
}

impl RoleCommands {
    pub fn new(server: &ProbeCommand, client: &ProbeCommand) -> Self {
        Self {
            server: server.render(),
            client: client.render(),
        }
    }
}

/// Output captured from both roles of one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoleOutput {
    pub server: Vec<String>,
    pub client: Vec<String>,
}

/// Result of probing one connection
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub status: ProbeStatus,
    pub detail: Option<String>,
    pub metrics: Option<BTreeMap<String, f64>>,
    pub commands: Option<RoleCommands>,
    /// Set once processes were started, whatever the status
    pub output: Option<RoleOutput>,
}

impl ProbeResult {
    pub fn new(status: ProbeStatus, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: Some(detail.into()),
            metrics: None,
            commands: None,
            output: None,
        }
    }

    pub fn success(metrics: BTreeMap<String, f64>) -> Self {
        Self {
            status: ProbeStatus::Success,
            detail: None,
            metrics: Some(metrics).filter(|m| !m.is_empty()),
            commands: None,
            output: None,
        }
    }

    pub fn with_commands(mut self, commands: RoleCommands) -> Self {
        self.commands = Some(commands);
        self
    }
}

impl From<ProbeError> for ProbeResult {
    fn from(err: ProbeError) -> Self {
        let status = match err {
            ProbeError::RoleExited { .. } => ProbeStatus::Failure,
            ProbeError::Spawn { .. } | ProbeError::Wait { .. } => ProbeStatus::Error,
        };
        ProbeResult::new(status, err.to_string())
    }
}

/// Runs a probe for one connection.
///
/// Implementations must bound their own run time by `timeout` and clean up
/// every process they start before returning.
#[async_trait]
pub trait ProbeExecutor: Send + Sync {
    async fn probe(&self, connection: &Connection, timeout: Duration) -> ProbeResult;
}

/// Output lines that mark a failed run
static FAILURE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b(error|failed|cannot|unable)\b").expect("Invalid regex pattern"));

/// Bandwidth value and unit, e.g. "12.5 GB/s"
static BANDWIDTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(GB/s|Gb/s|Gbps|MB/s|Mb/s|Mbps)").expect("Invalid regex pattern")
});

/// Latency value, only looked for on lines mentioning latency
static LATENCY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)(\d+(?:\.\d+)?)\s*(usec|us)\b").expect("Invalid regex pattern"));

/// Extracts `bandwidth_gbps`, `bandwidth_mbps` and `latency_usec` from probe output.
pub fn parse_metrics<'a>(lines: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::new();
    for line in lines {
        for caps in BANDWIDTH_RE.captures_iter(line) {
            let Ok(value) = caps[1].parse::<f64>() else {
                continue;
            };
            let key = if caps[2].to_lowercase().starts_with('g') {
                "bandwidth_gbps"
            } else {
                "bandwidth_mbps"
            };
            metrics.insert(key.to_string(), value);
        }
        if line.to_lowercase().contains("latency") {
            if let Some(value) = LATENCY_RE
                .captures(line)
                .and_then(|caps| caps[1].parse::<f64>().ok())
            {
                metrics.insert("latency_usec".to_string(), value);
            }
        }
    }
    metrics
}

/// Classifies a finished run from the client exit code and both roles' output.
pub fn analyze_output(client_exit_code: Option<i32>, output: &[String]) -> ProbeResult {
    match client_exit_code {
        Some(0) => {}
        Some(code) => return ProbeResult::new(ProbeStatus::Failure, format!("client exited with code {}", code)),
        None => return ProbeResult::new(ProbeStatus::Failure, "client terminated by signal"),
    }

    if let Some(line) = output.iter().find(|l| FAILURE_RE.is_match(l)) {
        return ProbeResult::new(ProbeStatus::Failure, format!("probe reported: {}", line.trim()));
    }

    ProbeResult::success(parse_metrics(output.iter().map(String::as_str)))
}

/// One spawned probe role with its output
struct RoleProcess {
    role: ProbeRole,
    child: Child,
    /// Process group led by the role, cleared once the group was killed
    pgid: Option<u32>,
    lines: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
    output: Vec<String>,
}

enum ReadyEvent {
    Line(Option<String>),
    Exited(std::io::Result<ExitStatus>),
}

fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send(line).is_err() {
                break;
            }
        }
    })
}

impl RoleProcess {
    fn spawn(program: &Path, command: &ProbeCommand) -> std::result::Result<Self, ProbeError> {
        let role = command.role;

        let mut cmd = Command::new(program);
        cmd.args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| ProbeError::Spawn { role, source })?;
        let pgid = child.id();
        debug!(%role, pid = ?pgid, command = %command.render(), "Started probe role");

        let (tx, lines) = mpsc::unbounded_channel();
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, tx));
        }

        Ok(Self {
            role,
            child,
            pgid,
            lines,
            readers,
            output: Vec::new(),
        })
    }

    fn exited(&self, status: std::io::Result<ExitStatus>) -> ProbeError {
        match status {
            Ok(status) => ProbeError::RoleExited {
                role: self.role,
                status: status.to_string(),
            },
            Err(source) => ProbeError::Wait {
                role: self.role,
                source,
            },
        }
    }

    /// Waits until the role is ready to accept a peer.
    ///
    /// Returns `Ok(false)` if `deadline` passed first.
    async fn wait_ready(
        &mut self,
        pattern: Option<&Regex>,
        delay: Duration,
        deadline: Instant,
    ) -> std::result::Result<bool, ProbeError> {
        let Some(pattern) = pattern else {
            let sleep_until = (Instant::now() + delay).min(deadline);
            let event = tokio::select! {
                _ = tokio::time::sleep_until(sleep_until) => None,
                status = self.child.wait() => Some(status),
            };
            return match event {
                Some(status) => Err(self.exited(status)),
                None => Ok(sleep_until < deadline),
            };
        };

        loop {
            let event = match timeout_at(deadline, async {
                tokio::select! {
                    line = self.lines.recv() => ReadyEvent::Line(line),
                    status = self.child.wait() => ReadyEvent::Exited(status),
                }
            })
            .await
            {
                Ok(event) => event,
                Err(_) => return Ok(false),
            };

            match event {
                ReadyEvent::Line(Some(line)) => {
                    let ready = pattern.is_match(&line);
                    self.output.push(line);
                    if ready {
                        return Ok(true);
                    }
                }
                ReadyEvent::Line(None) => {
                    // output closed, only the exit is left to observe
                    return match timeout_at(deadline, self.child.wait()).await {
                        Ok(status) => Err(self.exited(status)),
                        Err(_) => Ok(false),
                    };
                }
                ReadyEvent::Exited(status) => return Err(self.exited(status)),
            }
        }
    }

    /// Waits for the role to exit and collects the rest of its output.
    async fn wait_exit(&mut self) -> std::result::Result<ExitStatus, ProbeError> {
        let status = self.child.wait().await.map_err(|source| ProbeError::Wait {
            role: self.role,
            source,
        })?;
        while let Some(line) = self.lines.recv().await {
            self.output.push(line);
        }
        Ok(status)
    }

    fn drain_output(&mut self) {
        while let Ok(line) = self.lines.try_recv() {
            self.output.push(line);
        }
    }

    /// Sends SIGKILL to every process in the role's group.
    #[cfg(unix)]
    fn kill_group(&mut self) {
        use nix::errno::Errno;
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        let Some(pgid) = self.pgid.take().and_then(|id| i32::try_from(id).ok()) else {
            return;
        };
        match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(e) => warn!(role = %self.role, pgid, error = %e, "Failed to kill probe process group"),
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&mut self) {
        self.pgid = None;
    }

    /// Kills the role and everything it started, then reaps it.
    async fn terminate(&mut self) {
        self.kill_group();
        if !matches!(self.child.try_wait(), Ok(Some(_))) {
            match self.child.kill().await {
                Ok(()) => debug!(role = %self.role, "Terminated probe role"),
                Err(e) => warn!(role = %self.role, error = %e, "Failed to terminate probe role"),
            }
        }
        self.drain_output();
    }
}

impl Drop for RoleProcess {
    fn drop(&mut self) {
        self.kill_group();
        for reader in &self.readers {
            reader.abort();
        }
    }
}

/// `summary.json` written next to the role logs of one run
#[derive(Serialize)]
struct RunSummary<'a> {
    connection: String,
    source: &'a Endpoint,
    destination: &'a Endpoint,
    status: ProbeStatus,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    duration_ms: u64,
    detail: Option<&'a str>,
    metrics: Option<&'a BTreeMap<String, f64>>,
    commands: Option<&'a RoleCommands>,
}

/// Probe backed by the external perf-test executable
#[derive(Debug, Clone)]
pub struct ProcessProbe {
    config: ProbeConfig,
    gid_index: u32,
    ready_pattern: Option<Regex>,
    log_seq: Arc<AtomicUsize>,
}

impl ProcessProbe {
    pub fn new(config: &ProbeConfig, gid_index: u32) -> Result<Self> {
        let ready_pattern = config
            .ready_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| ConnectError::Configuration(format!("invalid ready_pattern: {}", e)))?;

        Ok(Self {
            config: config.clone(),
            gid_index,
            ready_pattern,
            log_seq: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn role_args(&self, endpoint: &Endpoint) -> Vec<String> {
        let device = endpoint
            .device
            .as_ref()
            .map(|d| d.probe_device_name().to_string())
            .unwrap_or_else(|| format!("module{}", endpoint.module_id));

        let mut args = vec![
            "-p".to_string(),
            self.config.tcp_port.to_string(),
            "-t".to_string(),
            self.config.test_type.clone(),
            "-s".to_string(),
            self.config.message_size.to_string(),
            "-n".to_string(),
            self.config.iterations.to_string(),
            "-d".to_string(),
            device,
            "-i".to_string(),
            endpoint.port.to_string(),
            "-g".to_string(),
            self.gid_index.to_string(),
        ];
        args.extend(self.config.extra_args.iter().cloned());
        args
    }

    /// Server and client commands for a connection
    pub fn commands(&self, connection: &Connection) -> (ProbeCommand, ProbeCommand) {
        let server = ProbeCommand {
            role: ProbeRole::Server,
            program: self.config.executable.clone(),
            args: self.role_args(&connection.source),
        };
        let mut client_args = self.role_args(&connection.destination);
        client_args.push(self.config.server_address.clone());
        let client = ProbeCommand {
            role: ProbeRole::Client,
            program: self.config.executable.clone(),
            args: client_args,
        };
        (server, client)
    }

    /// Reason a real run is impossible, if any
    pub fn dry_run_reason(&self, connection: &Connection) -> Option<String> {
        let missing: Vec<String> = [&connection.source, &connection.destination]
            .into_iter()
            .filter(|e| e.fabric_address().is_none())
            .map(|e| e.to_string())
            .collect();
        if !missing.is_empty() {
            return Some(format!("no fabric address for {}", missing.join(", ")));
        }

        if let Err(e) = shell::find_executable(&self.config.executable) {
            return Some(e.to_string());
        }

        if self.config.simulate {
            return Some("simulation requested".to_string());
        }
        None
    }

    /// Runs both roles and always tears them down, attaching their output.
    async fn drive(
        &self,
        program: &Path,
        server_cmd: &ProbeCommand,
        client_cmd: &ProbeCommand,
        timeout: Duration,
    ) -> ProbeResult {
        let deadline = Instant::now() + timeout;
        let mut server = match RoleProcess::spawn(program, server_cmd) {
            Ok(server) => server,
            Err(e) => return ProbeResult::from(e),
        };
        let mut client = None;

        let result = self
            .run_client(&mut server, &mut client, program, client_cmd, deadline, timeout)
            .await;

        if let Some(client) = client.as_mut() {
            client.terminate().await;
        }
        server.terminate().await;

        let mut result = result.unwrap_or_else(|e| {
            warn!(error = %e, "Probe failed");
            ProbeResult::from(e)
        });
        result.output = Some(RoleOutput {
            server: std::mem::take(&mut server.output),
            client: client
                .map(|mut c| std::mem::take(&mut c.output))
                .unwrap_or_default(),
        });
        result
    }

    async fn run_client(
        &self,
        server: &mut RoleProcess,
        client: &mut Option<RoleProcess>,
        program: &Path,
        client_cmd: &ProbeCommand,
        deadline: Instant,
        timeout: Duration,
    ) -> std::result::Result<ProbeResult, ProbeError> {
        let ready = server
            .wait_ready(self.ready_pattern.as_ref(), self.config.startup_delay(), deadline)
            .await?;
        if !ready {
            return Ok(timed_out(timeout, "server never became ready"));
        }

        let client = client.insert(RoleProcess::spawn(program, client_cmd)?);
        let status = match timeout_at(deadline, client.wait_exit()).await {
            Ok(status) => status?,
            Err(_) => return Ok(timed_out(timeout, "client did not finish")),
        };

        server.drain_output();
        debug!(server = ?server.output, client = ?client.output, "Probe output");

        let output: Vec<String> = client.output.iter().chain(&server.output).cloned().collect();
        Ok(analyze_output(status.code(), &output))
    }

    /// Writes `server.log`, `client.log` and `summary.json` for one run.
    async fn save_logs(
        &self,
        log_dir: &Path,
        connection: &Connection,
        result: &ProbeResult,
        started_at: DateTime<Utc>,
    ) -> std::io::Result<PathBuf> {
        let finished_at = Utc::now();
        let edge = connection.edge();
        let seq = self.log_seq.fetch_add(1, Ordering::Relaxed);
        let run_dir = log_dir.join(format!(
            "{}_{:04}_{}.{}-{}.{}",
            started_at.format("%Y%m%d_%H%M%S"),
            seq,
            edge.src_module,
            edge.src_port,
            edge.dst_module,
            edge.dst_port
        ));
        tokio::fs::create_dir_all(&run_dir).await?;

        let output = result.output.clone().unwrap_or_default();
        for (name, lines) in [("server.log", &output.server), ("client.log", &output.client)] {
            let mut content = lines.join("\n");
            if !content.is_empty() {
                content.push('\n');
            }
            tokio::fs::write(run_dir.join(name), content).await?;
        }

        let summary = RunSummary {
            connection: connection.to_string(),
            source: &connection.source,
            destination: &connection.destination,
            status: result.status,
            started_at,
            finished_at,
            duration_ms: u64::try_from((finished_at - started_at).num_milliseconds()).unwrap_or(0),
            detail: result.detail.as_deref(),
            metrics: result.metrics.as_ref(),
            commands: result.commands.as_ref(),
        };
        tokio::fs::write(run_dir.join("summary.json"), serde_json::to_string_pretty(&summary)?).await?;
        Ok(run_dir)
    }
}

fn timed_out(timeout: Duration, what: &str) -> ProbeResult {
    ProbeResult::new(
        ProbeStatus::Timeout,
        format!("timed out after {}s: {}", timeout.as_secs_f64(), what),
    )
}

#[async_trait]
impl ProbeExecutor for ProcessProbe {
    async fn probe(&self, connection: &Connection, timeout: Duration) -> ProbeResult {
        let (server_cmd, client_cmd) = self.commands(connection);
        let commands = RoleCommands::new(&server_cmd, &client_cmd);

        if let Some(reason) = self.dry_run_reason(connection) {
            info!(connection = %connection, %reason, "Dry run");
            let detail = format!(
                "dry run: {}\nserver: {}\nclient: {}",
                reason, commands.server, commands.client
            );
            return ProbeResult::new(ProbeStatus::Skipped, detail).with_commands(commands);
        }

        let program = match shell::find_executable(&self.config.executable) {
            Ok(program) => program,
            Err(e) => return ProbeResult::new(ProbeStatus::Skipped, e.to_string()).with_commands(commands),
        };

        let started_at = Utc::now();
        let result = self
            .drive(&program, &server_cmd, &client_cmd, timeout)
            .await
            .with_commands(commands);

        if let Some(log_dir) = &self.config.log_dir {
            match self.save_logs(log_dir, connection, &result, started_at).await {
                Ok(path) => debug!(path = %path.display(), "Saved probe logs"),
                Err(e) => warn!(connection = %connection, error = %e, "Failed to save probe logs"),
            }
        }
        result
    }
}
