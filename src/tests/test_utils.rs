// Shared fixtures for in-crate tests.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::alerts::{Alert, ChannelAlertSink};
use crate::config::{EvidenceConfig, StoreBackend};
use crate::memory_store::MemoryGraphStore;
use crate::model::{EventDraft, Severity};
use crate::runtime::EvidenceRuntime;
use crate::time_source::FixedTimeSource;

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()
}

pub struct Harness {
    pub store: Arc<MemoryGraphStore>,
    pub time: Arc<FixedTimeSource>,
    pub runtime: EvidenceRuntime,
    alerts: UnboundedReceiver<Alert>,
}

impl Harness {
    pub fn new() -> Self {
        let config = EvidenceConfig {
            store: StoreBackend::Memory,
            ..EvidenceConfig::default()
        };
        Self::with_config(config)
    }

    pub fn with_config(config: EvidenceConfig) -> Self {
        let store = Arc::new(MemoryGraphStore::new());
        let time = Arc::new(FixedTimeSource::new(t0()));
        let (sink, alerts) = ChannelAlertSink::new();
        let runtime =
            EvidenceRuntime::with_parts(config, store.clone(), time.clone(), Arc::new(sink))
                .unwrap();
        Self {
            store,
            time,
            runtime,
            alerts,
        }
    }

    /// Alerts raised since the last drain.
    pub fn drain_alerts(&mut self) -> Vec<Alert> {
        let mut seen = Vec::new();
        while let Ok(alert) = self.alerts.try_recv() {
            seen.push(alert);
        }
        seen
    }
}

pub fn breach_draft(source: &str) -> EventDraft {
    EventDraft::new(
        "BREACH.DETECTED",
        source,
        "INC-2026-0042",
        json!({"records_affected": 1200, "vector": "credential stuffing"}),
    )
    .with_severity(Severity::High)
    .with_tags(["GDPR"])
    .with_articles(["Art. 33"])
}
