//! Connection probe orchestration
//!
//! Turns a connection set into one [`ProbeOutcome`] per connection, in input
//! order. In parallel mode a fixed pool of workers pulls connections off a
//! shared cursor; outcomes are written back into their original slot so
//! execution order never leaks into the report.

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::graph::Connection;
use crate::probe::{ProbeExecutor, ProbeResult, RoleCommands};
use crate::verify::inactive_endpoints;

/// Time a probe gets past its own timeout to tear down its processes
const TEARDOWN_GRACE: Duration = Duration::from_secs(5);

/// Terminal state of one probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeStatus {
    Success,
    Failure,
    Skipped,
    Error,
    Timeout,
}

impl ProbeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeStatus::Success => "SUCCESS",
            ProbeStatus::Failure => "FAILURE",
            ProbeStatus::Skipped => "SKIPPED",
            ProbeStatus::Error => "ERROR",
            ProbeStatus::Timeout => "TIMEOUT",
        }
    }
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// What a run checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProbeMode {
    /// Report the port verification result only
    VerifyOnly,
    /// Run the external probe on every connection
    Performance,
}

/// How probes are scheduled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    Sequential,
    Parallel { max_workers: usize, timeout: Duration },
}

/// Result of probing one connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub connection: Arc<Connection>,
    pub status: ProbeStatus,
    pub detail: Option<String>,
    pub metrics: Option<BTreeMap<String, f64>>,
    /// Wall time spent in the executor, `None` when nothing was run
    pub duration_ms: Option<u64>,
    pub commands: Option<RoleCommands>,
}

impl ProbeOutcome {
    fn new(connection: Arc<Connection>, status: ProbeStatus, detail: Option<String>) -> Self {
        Self {
            connection,
            status,
            detail,
            metrics: None,
            duration_ms: None,
            commands: None,
        }
    }

    fn from_result(connection: Arc<Connection>, result: ProbeResult, elapsed: Duration) -> Self {
        Self {
            connection,
            status: result.status,
            detail: result.detail,
            metrics: result.metrics,
            duration_ms: Some(elapsed.as_millis() as u64),
            commands: result.commands,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Why a connection failed port verification
fn verification_failure(connection: &Connection) -> String {
    if let Some(reason) = connection.reason {
        return format!("unresolved: {}", reason);
    }
    let down: Vec<String> = inactive_endpoints(connection).map(|e| e.to_string()).collect();
    format!("inactive link: {}", down.join(", "))
}

fn verify_only(connection: Arc<Connection>) -> ProbeOutcome {
    let (status, detail) = match connection.verified {
        Some(true) => (ProbeStatus::Success, None),
        Some(false) => (ProbeStatus::Failure, Some(verification_failure(&connection))),
        None => (ProbeStatus::Skipped, Some("port verification disabled".to_string())),
    };
    ProbeOutcome::new(connection, status, detail)
}

/// Probes one connection. Never fails: panics and overruns become outcomes.
///
/// Every connection reaches the executor, which decides between a real run
/// and a dry run.
#[instrument(skip_all, fields(connection = %connection))]
async fn probe_connection(
    executor: &dyn ProbeExecutor,
    connection: Arc<Connection>,
    timeout: Duration,
    grace: Duration,
) -> ProbeOutcome {
    if connection.verified == Some(false) {
        debug!(detail = %verification_failure(&connection), "Probing connection that failed verification");
    }

    let start = Instant::now();
    let probe = AssertUnwindSafe(executor.probe(&connection, timeout)).catch_unwind();
    let outcome = match tokio::time::timeout(timeout + grace, probe).await {
        Ok(Ok(result)) => ProbeOutcome::from_result(connection.clone(), result, start.elapsed()),
        Ok(Err(payload)) => {
            let message = panic_message(payload.as_ref());
            warn!(panic = %message, "Probe panicked");
            ProbeOutcome {
                duration_ms: Some(start.elapsed().as_millis() as u64),
                ..ProbeOutcome::new(
                    connection.clone(),
                    ProbeStatus::Error,
                    Some(format!("probe panicked: {}", message)),
                )
            }
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs_f64(), "Probe overran its timeout");
            ProbeOutcome {
                duration_ms: Some(start.elapsed().as_millis() as u64),
                ..ProbeOutcome::new(
                    connection.clone(),
                    ProbeStatus::Timeout,
                    Some(format!("timed out after {}s", timeout.as_secs_f64())),
                )
            }
        }
    };

    info!(status = %outcome.status, duration_ms = ?outcome.duration_ms, "Probe finished");
    outcome
}

/// Runs probes over a connection set
pub struct ProbeOrchestrator {
    executor: Arc<dyn ProbeExecutor>,
    timeout: Duration,
    grace: Duration,
}

impl ProbeOrchestrator {
    /// `timeout` applies per connection in sequential mode.
    pub fn new(executor: Arc<dyn ProbeExecutor>, timeout: Duration) -> Self {
        Self {
            executor,
            timeout,
            grace: TEARDOWN_GRACE,
        }
    }

    /// Overrides how long a probe may run past its timeout before it is abandoned.
    pub fn with_teardown_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    /// Returns one outcome per connection, in input order.
    pub async fn run(
        &self,
        connections: &[Connection],
        mode: ProbeMode,
        concurrency: Concurrency,
    ) -> Vec<ProbeOutcome> {
        let connections: Vec<Arc<Connection>> = connections.iter().cloned().map(Arc::new).collect();
        info!(
            connections = connections.len(),
            ?mode,
            ?concurrency,
            "Starting connection probes"
        );

        match (mode, concurrency) {
            (ProbeMode::VerifyOnly, _) => connections.into_iter().map(verify_only).collect(),
            (ProbeMode::Performance, Concurrency::Sequential) => {
                let mut outcomes = Vec::with_capacity(connections.len());
                for connection in connections {
                    outcomes.push(probe_connection(self.executor.as_ref(), connection, self.timeout, self.grace).await);
                }
                outcomes
            }
            (ProbeMode::Performance, Concurrency::Parallel { max_workers, timeout }) => {
                self.run_pool(connections, max_workers, timeout).await
            }
        }
    }

    async fn run_pool(
        &self,
        connections: Vec<Arc<Connection>>,
        max_workers: usize,
        timeout: Duration,
    ) -> Vec<ProbeOutcome> {
        let total = connections.len();
        let workers = max_workers.clamp(1, total.max(1));
        let connections = Arc::new(connections);
        let cursor = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ProbeOutcome)>();

        let handles: Vec<_> = (0..workers)
            .map(|worker| {
                let connections = connections.clone();
                let cursor = cursor.clone();
                let executor = self.executor.clone();
                let tx = tx.clone();
                let grace = self.grace;
                tokio::spawn(async move {
                    loop {
                        let idx = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(connection) = connections.get(idx) else {
                            break;
                        };
                        debug!(worker, idx, "Worker picked connection");
                        let outcome = probe_connection(executor.as_ref(), connection.clone(), timeout, grace).await;
                        if tx.send((idx, outcome)).is_err() {
                            break;
                        }
                    }
                })
            })
            .collect();
        drop(tx);

        let mut slots: Vec<Option<ProbeOutcome>> = (0..total).map(|_| None).collect();
        while let Some((idx, outcome)) = rx.recv().await {
            slots[idx] = Some(outcome);
        }
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Probe worker terminated abnormally");
            }
        }

        slots
            .into_iter()
            .zip(connections.iter())
            .map(|(slot, connection)| {
                slot.unwrap_or_else(|| {
                    ProbeOutcome::new(
                        connection.clone(),
                        ProbeStatus::Error,
                        Some("probe worker terminated before reporting".to_string()),
                    )
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::build;
    use crate::inventory::Inventory;
    use crate::routing::RoutingEdge;
    use crate::types::{DeviceRecord, PortRecord};
    use crate::verify::PortStateVerifier;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    /// Executor scripted per source module: 0 succeeds, 1 panics,
    /// 2 sleeps past the timeout, others fail. Delays shuffle completion order.
    struct ScriptedProbe {
        calls: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl ProbeExecutor for ScriptedProbe {
        async fn probe(&self, connection: &Connection, _timeout: Duration) -> ProbeResult {
            let module = connection.source.module_id;
            self.calls.lock().unwrap().push(module);
            tokio::time::sleep(Duration::from_millis(u64::from(10 * (5 - module.min(5))))).await;
            match module {
                0 => ProbeResult::success(BTreeMap::from([("bandwidth_gbps".to_string(), 1.0)])),
                1 => panic!("probe exploded"),
                2 => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    unreachable!()
                }
                _ => ProbeResult::new(ProbeStatus::Failure, "scripted failure"),
            }
        }
    }

    fn inventory() -> Inventory {
        let compute = (0..5)
            .map(|m| DeviceRecord::compute(m, m, format!("0000:5{}:00.0", m)))
            .collect();
        let fabric = (0..5)
            .map(|m| {
                DeviceRecord::fabric(
                    m,
                    format!("0000:5{}:00.0", m),
                    format!("hbl_{}", m),
                    [
                        PortRecord::new(1, "4: ACTIVE", Some(format!("fe80::{}", m))),
                        PortRecord::new(2, "1: DOWN", None),
                    ],
                )
            })
            .collect();
        Inventory::from_records(compute, fabric)
    }

    fn connections(edges: &[RoutingEdge]) -> Vec<Connection> {
        PortStateVerifier::new(true).verify(&build(edges, &inventory()))
    }

    fn orchestrator() -> (ProbeOrchestrator, Arc<ScriptedProbe>) {
        let probe = Arc::new(ScriptedProbe {
            calls: Mutex::new(Vec::new()),
        });
        (
            ProbeOrchestrator::new(probe.clone(), Duration::from_millis(200))
                .with_teardown_grace(Duration::from_millis(50)),
            probe,
        )
    }

    #[tokio::test]
    async fn test_verify_only_mode() {
        let edges = [
            RoutingEdge::new(0, 1, 1, 1),
            RoutingEdge::new(0, 2, 1, 1),
            RoutingEdge::new(0, 1, 9, 1),
        ];
        let (orch, probe) = orchestrator();

        let outcomes = orch
            .run(&connections(&edges), ProbeMode::VerifyOnly, Concurrency::Sequential)
            .await;
        let statuses: Vec<ProbeStatus> = outcomes.iter().map(|o| o.status).collect();
        assert_eq!(
            statuses,
            vec![ProbeStatus::Success, ProbeStatus::Failure, ProbeStatus::Failure]
        );
        assert!(outcomes[1].detail.as_deref().unwrap().starts_with("inactive link"));
        assert!(outcomes[2].detail.as_deref().unwrap().contains("MODULE_NOT_FOUND"));
        assert!(outcomes.iter().all(|o| o.duration_ms.is_none()));
        assert!(probe.calls.lock().unwrap().is_empty());

        let unverified = build(&edges, &inventory());
        let outcomes = orch
            .run(&unverified, ProbeMode::VerifyOnly, Concurrency::Sequential)
            .await;
        assert!(outcomes.iter().all(|o| o.status == ProbeStatus::Skipped));
    }

    #[tokio::test]
    async fn test_performance_hands_every_connection_to_executor() {
        let edges = [RoutingEdge::new(3, 2, 4, 1), RoutingEdge::new(3, 1, 7, 1)];
        let (orch, probe) = orchestrator();
        let outcomes = orch
            .run(&connections(&edges), ProbeMode::Performance, Concurrency::Sequential)
            .await;
        assert_eq!(probe.calls.lock().unwrap().len(), 2);
        assert!(outcomes
            .iter()
            .all(|o| o.detail.as_deref() == Some("scripted failure")));
        assert!(outcomes.iter().all(|o| o.duration_ms.is_some()));
    }

    #[tokio::test]
    async fn test_down_and_unresolved_links_fall_back_to_dry_run() {
        use crate::config::ProbeConfig;
        use crate::probe::ProcessProbe;

        let config = ProbeConfig {
            executable: "/nonexistent/perf_test".into(),
            ..ProbeConfig::default()
        };
        let probe = Arc::new(ProcessProbe::new(&config, 0).unwrap());
        let edges = [RoutingEdge::new(0, 2, 1, 2), RoutingEdge::new(0, 1, 9, 1)];
        let conns = connections(&edges);
        assert_eq!(conns[0].verified, Some(false));
        assert!(!conns[1].resolved);

        let outcomes = ProbeOrchestrator::new(probe, Duration::from_secs(5))
            .run(&conns, ProbeMode::Performance, Concurrency::Sequential)
            .await;
        for outcome in &outcomes {
            assert_eq!(outcome.status, ProbeStatus::Skipped);
            let commands = outcome.commands.as_ref().unwrap();
            let detail = outcome.detail.as_deref().unwrap();
            assert!(detail.starts_with("dry run:"));
            assert!(detail.contains(&format!("server: {}", commands.server)));
            assert!(detail.contains(&format!("client: {}", commands.client)));
        }
    }

    fn mixed_edges() -> Vec<RoutingEdge> {
        vec![
            RoutingEdge::new(4, 1, 0, 1),
            RoutingEdge::new(0, 1, 1, 1),
            RoutingEdge::new(1, 1, 0, 1),
            RoutingEdge::new(2, 1, 0, 1),
            RoutingEdge::new(3, 1, 0, 1),
            RoutingEdge::new(0, 1, 4, 1),
        ]
    }

    fn expected_statuses() -> Vec<ProbeStatus> {
        vec![
            ProbeStatus::Failure,
            ProbeStatus::Success,
            ProbeStatus::Error,
            ProbeStatus::Timeout,
            ProbeStatus::Failure,
            ProbeStatus::Success,
        ]
    }

    #[tokio::test]
    async fn test_sequential_order_and_isolation() {
        let edges = mixed_edges();
        let (orch, _) = orchestrator();
        let outcomes = orch
            .run(&connections(&edges), ProbeMode::Performance, Concurrency::Sequential)
            .await;
        let order: Vec<RoutingEdge> = outcomes.iter().map(|o| o.connection.edge()).collect();
        assert_eq!(order, edges);
        assert_eq!(
            outcomes.iter().map(|o| o.status).collect::<Vec<_>>(),
            expected_statuses()
        );
        assert!(outcomes[2].detail.as_deref().unwrap().contains("probe exploded"));
    }

    #[tokio::test]
    async fn test_parallel_preserves_order_for_any_worker_count() {
        let edges = mixed_edges();
        let conns = connections(&edges);
        for workers in [1, 2, 3, 16] {
            let (orch, probe) = orchestrator();
            let outcomes = orch
                .run(
                    &conns,
                    ProbeMode::Performance,
                    Concurrency::Parallel {
                        max_workers: workers,
                        timeout: Duration::from_millis(200),
                    },
                )
                .await;
            let order: Vec<RoutingEdge> = outcomes.iter().map(|o| o.connection.edge()).collect();
            assert_eq!(order, edges, "workers = {}", workers);
            assert_eq!(
                outcomes.iter().map(|o| o.status).collect::<Vec<_>>(),
                expected_statuses(),
                "workers = {}",
                workers
            );
            assert_eq!(probe.calls.lock().unwrap().len(), edges.len());
        }
    }

    #[tokio::test]
    async fn test_parallel_empty_input() {
        let (orch, _) = orchestrator();
        let outcomes = orch
            .run(
                &[],
                ProbeMode::Performance,
                Concurrency::Parallel {
                    max_workers: 4,
                    timeout: Duration::from_secs(1),
                },
            )
            .await;
        assert!(outcomes.is_empty());
    }

    #[test]
    fn test_status_serialization() {
        assert_eq!(serde_json::to_string(&ProbeStatus::Timeout).unwrap(), "\"TIMEOUT\"");
        assert_eq!(serde_json::to_string(&ProbeMode::VerifyOnly).unwrap(), "\"VERIFY_ONLY\"");
        assert_eq!(ProbeStatus::Skipped.to_string(), "SKIPPED");
    }
}
