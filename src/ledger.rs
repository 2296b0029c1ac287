//! Hash Chain Ledger
//!
//! Each `source_system` is an independent stream. Appends to one stream are
//! serialized behind that stream's mutex; different streams never contend
//! beyond the short lookup in the lock table. The store enforces the same
//! invariant again on commit, so a second process sharing the store loses
//! with `SequenceConflict` instead of forking the chain.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertKind, AlertLevel, AlertSink};
use crate::canonicalize::{payload_hash, GENESIS_HASH};
use crate::errors::{EvidenceError, EvidenceResult, SafeLock};
use crate::graph_store::{GraphStore, StreamHead, WriteBatch};
use crate::model::{Event, EventDraft};
use crate::time_source::TimeSource;

const MAX_APPEND_ATTEMPTS: usize = 3;

/// Outcome of a chain walk. Always returned as data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainValidation {
    pub valid: bool,
    pub checked_events: usize,
    pub broken_at_sequence: Option<u64>,
    pub source_system: Option<String>,
    pub error: Option<String>,
}

impl ChainValidation {
    fn ok(checked_events: usize) -> Self {
        Self {
            valid: true,
            checked_events,
            broken_at_sequence: None,
            source_system: None,
            error: None,
        }
    }

    fn broken(checked_events: usize, event: &Event, error: impl Into<String>) -> Self {
        Self {
            valid: false,
            checked_events,
            broken_at_sequence: Some(event.sequence_number),
            source_system: Some(event.source_system.clone()),
            error: Some(error.into()),
        }
    }
}

/// Missing inclusive range of sequence numbers in one stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceGap {
    pub source_system: String,
    pub from: u64,
    pub to: u64,
}

impl From<SequenceGap> for EvidenceError {
    fn from(gap: SequenceGap) -> Self {
        EvidenceError::SequenceGap {
            source_system: gap.source_system,
            from: gap.from,
            to: gap.to,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamAudit {
    pub source_system: String,
    pub validation: ChainValidation,
    pub gaps: Vec<SequenceGap>,
}

impl StreamAudit {
    pub fn is_healthy(&self) -> bool {
        self.validation.valid && self.gaps.is_empty()
    }
}

type StreamLock = Arc<Mutex<Option<StreamHead>>>;

pub struct Ledger {
    store: Arc<dyn GraphStore>,
    time: Arc<dyn TimeSource>,
    alerts: Arc<dyn AlertSink>,
    streams: Mutex<HashMap<String, StreamLock>>,
}

impl Ledger {
    pub fn new(
        store: Arc<dyn GraphStore>,
        time: Arc<dyn TimeSource>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            time,
            alerts,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn GraphStore> {
        &self.store
    }

    fn stream_lock(&self, source_system: &str) -> EvidenceResult<StreamLock> {
        let mut streams = self.streams.safe_lock()?;
        Ok(streams
            .entry(source_system.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone())
    }

    /// Seal and persist one event.
    pub fn append(&self, draft: EventDraft) -> EvidenceResult<Event> {
        self.append_with(draft, |_| Ok(WriteBatch::new()))
    }

    /// Seal one event and commit it together with the graph writes `extra`
    /// derives from it. `extra` runs while the stream lock is held and may
    /// be called again if the store reports a lost race.
    pub fn append_with<F>(&self, draft: EventDraft, extra: F) -> EvidenceResult<Event>
    where
        F: Fn(&Event) -> EvidenceResult<WriteBatch>,
    {
        validate_draft(&draft)?;
        let hash = payload_hash(&draft.payload)?;

        let lock = self.stream_lock(&draft.source_system)?;
        let mut cached = lock.safe_lock()?;

        for attempt in 1..=MAX_APPEND_ATTEMPTS {
            let head = match cached.as_ref() {
                Some(head) => head.clone(),
                None => self
                    .store
                    .latest_sequence(&draft.source_system)?
                    .unwrap_or_else(StreamHead::genesis),
            };

            let recorded_at = self.time.now();
            let event = Event {
                event_id: uuid::Uuid::new_v4().to_string(),
                occurred_at: draft.occurred_at.unwrap_or(recorded_at),
                recorded_at,
                sequence_number: head.sequence + 1,
                event_type: draft.event_type.clone(),
                severity: draft.severity,
                source_system: draft.source_system.clone(),
                regulatory_tags: draft.regulatory_tags.clone(),
                articles: draft.articles.clone(),
                payload: draft.payload.clone(),
                payload_hash: hash.clone(),
                previous_hash: head.last_hash.clone(),
                correlation_id: draft.correlation_id.clone(),
                causation_id: draft.causation_id.clone(),
            };

            let mut batch = extra(&event)?;
            batch.event = Some(event.clone());

            match self.store.commit(batch) {
                Ok(()) => {
                    *cached = Some(StreamHead {
                        sequence: event.sequence_number,
                        last_hash: event.payload_hash.clone(),
                    });
                    debug!(
                        source_system = %event.source_system,
                        sequence = event.sequence_number,
                        event_type = %event.event_type,
                        "event sealed"
                    );
                    return Ok(event);
                }
                Err(EvidenceError::SequenceConflict { .. }) => {
                    warn!(
                        source_system = %draft.source_system,
                        attempt,
                        "stream head moved underneath us, reloading"
                    );
                    *cached = None;
                }
                Err(e) => return Err(e),
            }
        }

        let actual = self
            .store
            .latest_sequence(&draft.source_system)?
            .map(|h| h.sequence)
            .unwrap_or(0);
        Err(EvidenceError::SequenceConflict {
            source_system: draft.source_system,
            expected: actual + 1,
            actual,
        })
    }

    /// Walk one stream, or every stream, recomputing hashes and linkage.
    /// Read-only; never repairs.
    pub fn validate_chain(
        &self,
        source_system: Option<&str>,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> EvidenceResult<ChainValidation> {
        let sources = match source_system {
            Some(source) => vec![source.to_string()],
            None => self.store.source_systems()?,
        };

        let mut checked = 0;
        for source in sources {
            let result = self.validate_stream(&source, from_seq, to_seq)?;
            checked += result.checked_events;
            if !result.valid {
                return Ok(ChainValidation {
                    checked_events: checked,
                    ..result
                });
            }
        }
        Ok(ChainValidation::ok(checked))
    }

    fn validate_stream(
        &self,
        source_system: &str,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> EvidenceResult<ChainValidation> {
        let events = self.store.events(Some(source_system), from_seq, to_seq)?;

        let mut prior: Option<Event> = match events.first() {
            Some(first) if first.sequence_number > 1 => self
                .store
                .events(
                    Some(source_system),
                    Some(first.sequence_number - 1),
                    Some(first.sequence_number - 1),
                )?
                .pop(),
            _ => None,
        };

        for (index, event) in events.iter().enumerate() {
            let checked = index + 1;

            let recomputed = payload_hash(&event.payload)?;
            if recomputed != event.payload_hash {
                return Ok(ChainValidation::broken(
                    checked,
                    event,
                    "payload hash does not match stored payload",
                ));
            }

            let expected_previous = if event.sequence_number == 1 {
                GENESIS_HASH
            } else {
                match &prior {
                    Some(p) if p.sequence_number + 1 == event.sequence_number => {
                        p.payload_hash.as_str()
                    }
                    _ => {
                        return Ok(ChainValidation::broken(
                            checked,
                            event,
                            format!(
                                "predecessor at sequence {} is missing",
                                event.sequence_number - 1
                            ),
                        ))
                    }
                }
            };
            if event.previous_hash != expected_previous {
                return Ok(ChainValidation::broken(
                    checked,
                    event,
                    "previous_hash does not link to predecessor",
                ));
            }

            prior = Some(event.clone());
        }
        Ok(ChainValidation::ok(events.len()))
    }

    /// Missing sequence ranges per stream, including a tail missing below
    /// the recorded head.
    pub fn detect_gaps(&self, source_system: Option<&str>) -> EvidenceResult<Vec<SequenceGap>> {
        let sources = match source_system {
            Some(source) => vec![source.to_string()],
            None => self.store.source_systems()?,
        };

        let mut gaps = Vec::new();
        for source in sources {
            let mut expected = 1u64;
            for event in self.store.events(Some(&source), None, None)? {
                if event.sequence_number > expected {
                    gaps.push(SequenceGap {
                        source_system: source.clone(),
                        from: expected,
                        to: event.sequence_number - 1,
                    });
                }
                expected = event.sequence_number + 1;
            }
            if let Some(head) = self.store.latest_sequence(&source)? {
                if head.sequence >= expected {
                    gaps.push(SequenceGap {
                        source_system: source.clone(),
                        from: expected,
                        to: head.sequence,
                    });
                }
            }
        }
        Ok(gaps)
    }

    /// Fail hard on the first gap or broken link instead of reporting.
    pub fn ensure_contiguous(&self, source_system: &str) -> EvidenceResult<()> {
        if let Some(gap) = self.detect_gaps(Some(source_system))?.into_iter().next() {
            return Err(gap.into());
        }
        let validation = self.validate_chain(Some(source_system), None, None)?;
        match (validation.broken_at_sequence, validation.error) {
            (Some(sequence), error) => Err(EvidenceError::integrity(
                source_system,
                sequence,
                error.unwrap_or_else(|| "chain broken".to_string()),
            )),
            _ => Ok(()),
        }
    }

    /// Validate and gap-check a stream; a failing stream is flagged degraded
    /// and raises a critical alert. Appends continue regardless.
    pub fn audit_stream(&self, source_system: &str) -> EvidenceResult<StreamAudit> {
        let audit = StreamAudit {
            source_system: source_system.to_string(),
            validation: self.validate_chain(Some(source_system), None, None)?,
            gaps: self.detect_gaps(Some(source_system))?,
        };

        if audit.is_healthy() {
            info!(source_system, checked = audit.validation.checked_events, "stream intact");
            return Ok(audit);
        }

        let reason = match (&audit.validation.error, audit.gaps.first()) {
            (Some(err), _) => format!(
                "chain broken at sequence {}: {err}",
                audit.validation.broken_at_sequence.unwrap_or_default()
            ),
            (None, Some(gap)) => format!("sequence gap {}..={}", gap.from, gap.to),
            (None, None) => "integrity check failed".to_string(),
        };
        error!(source_system, %reason, "stream integrity degraded");
        self.store.mark_degraded(source_system, &reason)?;
        self.alerts.emit(Alert::new(
            AlertLevel::Critical,
            AlertKind::IntegrityDegraded,
            source_system,
            reason,
            self.time.now(),
        ));
        Ok(audit)
    }

    pub fn audit_all(&self) -> EvidenceResult<Vec<StreamAudit>> {
        self.store
            .source_systems()?
            .iter()
            .map(|source| self.audit_stream(source))
            .collect()
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.time.now()
    }
}

pub(crate) fn is_upper_ident(s: &str) -> bool {
    !s.is_empty()
        && s
            .bytes()
            .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'_')
}

/// Input checks run before any hash is computed.
pub fn validate_draft(draft: &EventDraft) -> EvidenceResult<()> {
    if draft.event_type.split('.').any(|segment| !is_upper_ident(segment)) {
        return Err(EvidenceError::validation(
            "event_type",
            format!(
                "'{}' must be dot-separated upper-case segments",
                draft.event_type
            ),
        ));
    }
    let source_ok = !draft.source_system.is_empty()
        && draft.source_system.bytes().all(|b| {
            b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'_' | b'.' | b'-')
        });
    if !source_ok {
        return Err(EvidenceError::validation(
            "source_system",
            format!("'{}' is not a valid stream name", draft.source_system),
        ));
    }
    if draft.payload.is_null() {
        return Err(EvidenceError::validation("payload", "payload is required"));
    }
    if draft.correlation_id.trim().is_empty() {
        return Err(EvidenceError::validation(
            "correlation_id",
            "correlation_id must not be empty",
        ));
    }
    if let Some(tag) = draft.regulatory_tags.iter().find(|t| !is_upper_ident(t)) {
        return Err(EvidenceError::validation(
            "regulatory_tags",
            format!("'{tag}' is not an upper-case tag"),
        ));
    }
    Ok(())
}
