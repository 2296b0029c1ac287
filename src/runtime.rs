//! Service wiring
//!
//! [`EvidenceRuntime`] owns one instance of every service and hands out
//! shared handles. The HTTP layer, the CLI and the background jobs all work
//! through it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::alerts::{AlertSink, TracingAlertSink};
use crate::anchor_service::AnchorService;
use crate::clock_engine::ClockEngine;
use crate::config::{EvidenceConfig, StoreBackend};
use crate::errors::EvidenceResult;
use crate::graph_store::GraphStore;
use crate::ledger::Ledger;
use crate::memory_store::MemoryGraphStore;
use crate::orchestrator::Orchestrator;
use crate::query_catalog::QueryCatalog;
use crate::query_engine::QueryEngine;
use crate::scheduler::{spawn_anchor_job, spawn_clock_monitor, spawn_integrity_audit, BackgroundTask};
use crate::sled_store::SledGraphStore;
use crate::time_source::{TimeSource, UtcTimeSource};
use crate::witness_registry::WitnessRegistry;

const GRAPH_DIR: &str = "graph";

pub struct EvidenceRuntime {
    pub config: EvidenceConfig,
    pub store: Arc<dyn GraphStore>,
    pub time: Arc<dyn TimeSource>,
    pub alerts: Arc<dyn AlertSink>,
    pub ledger: Arc<Ledger>,
    pub clocks: Arc<ClockEngine>,
    pub orchestrator: Arc<Orchestrator>,
    pub witnesses: Arc<WitnessRegistry>,
    pub anchors: Arc<AnchorService>,
    pub queries: Arc<QueryEngine>,
}

impl EvidenceRuntime {
    /// Open the configured store and build every service over it, with the
    /// system clock and tracing alerts.
    pub fn from_config(config: EvidenceConfig) -> EvidenceResult<Self> {
        let store: Arc<dyn GraphStore> = match config.store {
            StoreBackend::Sled => {
                Arc::new(SledGraphStore::open(Path::new(&config.data_dir).join(GRAPH_DIR))?)
            }
            StoreBackend::Memory => Arc::new(MemoryGraphStore::new()),
        };
        Self::with_parts(
            config,
            store,
            Arc::new(UtcTimeSource),
            Arc::new(TracingAlertSink),
        )
    }

    pub fn with_parts(
        config: EvidenceConfig,
        store: Arc<dyn GraphStore>,
        time: Arc<dyn TimeSource>,
        alerts: Arc<dyn AlertSink>,
    ) -> EvidenceResult<Self> {
        config.validate()?;

        let ledger = Arc::new(Ledger::new(store.clone(), time.clone(), alerts.clone()));
        let clocks = Arc::new(ClockEngine::new(
            store.clone(),
            ledger.clone(),
            time.clone(),
            alerts.clone(),
            config.clock.clone(),
        ));
        let orchestrator = Arc::new(Orchestrator::new(
            ledger.clone(),
            clocks.clone(),
            alerts.clone(),
            time.clone(),
        ));

        let witnesses = Arc::new(WitnessRegistry::from_config(
            &config.witnesses,
            Path::new(&config.data_dir),
        )?);
        let anchors = Arc::new(AnchorService::new(
            store.clone(),
            witnesses.clone(),
            alerts.clone(),
            time.clone(),
            config.anchor.clone(),
        ));

        let mut catalog = QueryCatalog::builtin()?;
        if let Some(path) = &config.queries.catalog_path {
            catalog.overlay(QueryCatalog::load(Path::new(path))?);
        }
        let queries = Arc::new(QueryEngine::new(store.clone(), catalog));

        info!(
            store = ?config.store,
            witnesses = config.witnesses.len(),
            clock_types = config.clock.types.len(),
            "evidence runtime ready"
        );

        Ok(Self {
            config,
            store,
            time,
            alerts,
            ledger,
            clocks,
            orchestrator,
            witnesses,
            anchors,
            queries,
        })
    }

    /// Start the clock monitor, the integrity audit and the anchor job.
    /// Must run inside a tokio runtime.
    pub fn spawn_background(&self) -> Vec<BackgroundTask> {
        vec![
            spawn_integrity_audit(
                self.ledger.clone(),
                Duration::from_secs(self.config.ledger.audit_interval_secs),
            ),
            spawn_clock_monitor(
                self.clocks.clone(),
                Duration::from_secs(self.config.clock.tick_interval_secs),
            ),
            spawn_anchor_job(
                self.anchors.clone(),
                Duration::from_secs(self.config.anchor.interval_secs),
            ),
        ]
    }
}
