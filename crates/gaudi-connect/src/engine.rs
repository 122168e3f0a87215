//! End-to-end connectivity run
//!
//! routing table + inventory -> connections -> verification -> probes -> report

use std::sync::Arc;
use tracing::info;

use crate::config::GaudiConnectConfig;
use crate::error::Result;
use crate::graph::{self, ConnectionFilter};
use crate::inventory::{Inventory, InventoryProvider};
use crate::orchestrator::{Concurrency, ProbeMode, ProbeOrchestrator};
use crate::probe::{ProbeExecutor, ProcessProbe};
use crate::report::Report;
use crate::routing::RoutingTable;
use crate::verify::PortStateVerifier;

/// Wires the pipeline stages together from one configuration
pub struct ConnectivityEngine {
    config: GaudiConnectConfig,
    provider: Arc<dyn InventoryProvider>,
    executor: Arc<dyn ProbeExecutor>,
}

impl ConnectivityEngine {
    /// Validates `config` and sets up the perf-test probe.
    pub fn new(config: GaudiConnectConfig, provider: Arc<dyn InventoryProvider>) -> Result<Self> {
        config.validate()?;
        let executor = Arc::new(ProcessProbe::new(&config.probe, config.inventory.gid_index)?);
        Ok(Self {
            config,
            provider,
            executor,
        })
    }

    /// Replaces the probe executor.
    pub fn with_executor(mut self, executor: Arc<dyn ProbeExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn config(&self) -> &GaudiConnectConfig {
        &self.config
    }

    pub fn concurrency(&self) -> Concurrency {
        if self.config.probe.parallel {
            Concurrency::Parallel {
                max_workers: self.config.probe.max_workers,
                timeout: self.config.probe.timeout(),
            }
        } else {
            Concurrency::Sequential
        }
    }

    /// Takes a fresh inventory snapshot.
    pub async fn collect_inventory(&self) -> Result<Inventory> {
        Inventory::collect(self.provider.as_ref()).await
    }

    /// Runs the pipeline against a fresh inventory snapshot.
    pub async fn run(&self, table: RoutingTable, mode: ProbeMode, filter: &ConnectionFilter) -> Result<Report> {
        let inventory = self.collect_inventory().await?;
        Ok(self.run_with_inventory(table, &inventory, mode, filter).await)
    }

    /// Runs the pipeline against an existing snapshot.
    pub async fn run_with_inventory(
        &self,
        table: RoutingTable,
        inventory: &Inventory,
        mode: ProbeMode,
        filter: &ConnectionFilter,
    ) -> Report {
        let connections = graph::build(&table.edges, inventory);
        let selected: Vec<_> = filter.apply(&connections).into_iter().cloned().collect();
        if !filter.is_empty() {
            info!(selected = selected.len(), total = connections.len(), "Applied connection filter");
        }

        let verified = PortStateVerifier::new(self.config.verification.check_ports).verify(&selected);

        let orchestrator = ProbeOrchestrator::new(self.executor.clone(), self.config.probe.timeout());
        let outcomes = orchestrator.run(&verified, mode, self.concurrency()).await;

        let report = Report::new(mode, outcomes, table.errors);
        info!(
            total = report.summary.total,
            succeeded = report.summary.succeeded,
            failed = report.summary.failed,
            skipped = report.summary.skipped,
            errored = report.summary.errored,
            "Connectivity run complete"
        );
        report
    }
}
