//! Clock Engine
//!
//! A regulatory clock is a small state machine:
//!
//! ```text
//! RUNNING ──► MET | BREACHED | STOPPED      (terminal)
//! RUNNING ◄─► PAUSED                        (pause / resume)
//! ```
//!
//! Monitoring is split in two. [`plan_tick`] is a pure function from a clock
//! snapshot and an instant to a list of transitions; [`ClockEngine::tick`]
//! applies each one with a compare-and-swap on the clock version, so two
//! overlapping ticks can never both fire the same warning or breach.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertKind, AlertLevel, AlertSink};
use crate::config::{ClockSettings, ClockTypeConfig};
use crate::errors::{EvidenceError, EvidenceResult};
use crate::graph_store::{GraphStore, WriteBatch};
use crate::ledger::{is_upper_ident, Ledger};
use crate::model::{
    Clock, ClockStatus, Decision, Edge, EdgeType, EventDraft, Node, NodeKind, NodeRef, Severity,
};
use crate::time_source::TimeSource;

/// Ledger stream that carries the engine's own warning and breach events.
pub const CLOCK_ENGINE_SOURCE: &str = "clock_engine";

const MAX_SWAP_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockTransition {
    Warn,
    Breach,
}

/// One planned side effect, computed before anything is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockDecision {
    pub clock_id: String,
    pub expected_version: u64,
    pub transition: ClockTransition,
    pub hours_remaining: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickFailure {
    pub clock_id: String,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TickReport {
    pub evaluated: usize,
    pub warned: Vec<String>,
    pub breached: Vec<String>,
    /// Clocks another tick moved first.
    pub skipped: Vec<String>,
    pub failed: Vec<TickFailure>,
}

/// Decide which running clocks warn or breach at `now`.
pub fn plan_tick(
    clocks: &[Clock],
    now: DateTime<Utc>,
    types: &BTreeMap<String, ClockTypeConfig>,
) -> Vec<ClockDecision> {
    clocks
        .iter()
        .filter(|c| c.status == ClockStatus::Running)
        .filter_map(|clock| {
            let hours_remaining = clock.hours_remaining(now);
            let transition = if hours_remaining <= 0.0 {
                ClockTransition::Breach
            } else {
                let threshold = types.get(&clock.clock_type)?.warning_threshold_hours;
                if clock.warning_sent || hours_remaining > threshold {
                    return None;
                }
                ClockTransition::Warn
            };
            Some(ClockDecision {
                clock_id: clock.clock_id.clone(),
                expected_version: clock.version,
                transition,
                hours_remaining,
            })
        })
        .collect()
}

/// Parameters for a new clock. Unset fields fall back to the clock type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewClock {
    pub clock_type: String,
    #[serde(default)]
    pub regulation: Option<String>,
    #[serde(default)]
    pub article: Option<String>,
    #[serde(default)]
    pub related_event_id: Option<String>,
    #[serde(default)]
    pub deadline_hours: Option<f64>,
}

pub struct ClockEngine {
    store: Arc<dyn GraphStore>,
    ledger: Arc<Ledger>,
    time: Arc<dyn TimeSource>,
    alerts: Arc<dyn AlertSink>,
    settings: ClockSettings,
}

impl ClockEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        ledger: Arc<Ledger>,
        time: Arc<dyn TimeSource>,
        alerts: Arc<dyn AlertSink>,
        settings: ClockSettings,
    ) -> Self {
        Self {
            store,
            ledger,
            time,
            alerts,
            settings,
        }
    }

    pub fn settings(&self) -> &ClockSettings {
        &self.settings
    }

    /// Build a RUNNING clock without persisting it.
    pub fn build_clock(&self, request: &NewClock, start: DateTime<Utc>) -> EvidenceResult<Clock> {
        let clock_type = self.settings.clock_type(&request.clock_type)?;
        let hours = request
            .deadline_hours
            .unwrap_or(clock_type.default_deadline_hours);
        let deadline = add_hours(start, hours, "deadline_hours")?;
        let regulation = request
            .regulation
            .clone()
            .unwrap_or_else(|| clock_type.regulation.clone());
        if !is_upper_ident(&regulation) {
            return Err(EvidenceError::validation(
                "regulation",
                format!("'{regulation}' is not an upper-case regulation tag"),
            ));
        }

        Ok(Clock {
            clock_id: uuid::Uuid::new_v4().to_string(),
            clock_type: request.clock_type.clone(),
            regulation,
            article: request
                .article
                .clone()
                .unwrap_or_else(|| clock_type.article.clone()),
            related_event_id: request.related_event_id.clone(),
            start_time: start,
            deadline,
            status: ClockStatus::Running,
            warning_sent: false,
            warning_sent_at: None,
            breached_at: None,
            completed_at: None,
            paused_at: None,
            paused_duration_ms: 0,
            evidence_artifact_id: None,
            version: 0,
        })
    }

    /// Create and persist a clock, linked from its triggering event if any.
    pub fn create_clock(&self, request: NewClock) -> EvidenceResult<Clock> {
        let now = self.time.now();
        let clock = self.build_clock(&request, now)?;

        let mut batch = WriteBatch::new();
        if let Some(event_id) = &clock.related_event_id {
            batch.push_edge(Edge::new(
                EdgeType::Triggers,
                NodeRef::event(event_id),
                NodeRef::clock(&clock.clock_id),
                now,
            )?);
        }
        batch.push_node(Node::Clock(clock.clone()));
        self.store.commit(batch)?;

        info!(
            clock_id = %clock.clock_id,
            clock_type = %clock.clock_type,
            deadline = %clock.deadline,
            "clock started"
        );
        Ok(clock)
    }

    pub fn get_clock(&self, clock_id: &str) -> EvidenceResult<Clock> {
        match self.store.get_node(&NodeRef::clock(clock_id))? {
            Some(Node::Clock(clock)) => Ok(clock),
            _ => Err(EvidenceError::not_found("clock", clock_id)),
        }
    }

    pub fn clocks(&self, status: Option<ClockStatus>) -> EvidenceResult<Vec<Clock>> {
        Ok(self
            .store
            .query_nodes(NodeKind::Clock)?
            .into_iter()
            .filter_map(|n| match n {
                Node::Clock(c) => Some(c),
                _ => None,
            })
            .filter(|c| status.is_none_or(|s| c.status == s))
            .collect())
    }

    pub fn tick_now(&self) -> EvidenceResult<TickReport> {
        self.tick(self.time.now())
    }

    /// Evaluate every running clock at `now`. Failures stay per clock.
    pub fn tick(&self, now: DateTime<Utc>) -> EvidenceResult<TickReport> {
        let running = self.clocks(Some(ClockStatus::Running))?;
        Ok(self.tick_snapshot(&running, now))
    }

    /// Plan and apply against clocks read earlier. Any clock that changed
    /// since the read loses its swap and is reported as skipped.
    pub fn tick_snapshot(&self, running: &[Clock], now: DateTime<Utc>) -> TickReport {
        let plan = plan_tick(running, now, &self.settings.types);
        let by_id: BTreeMap<&str, &Clock> =
            running.iter().map(|c| (c.clock_id.as_str(), c)).collect();

        let mut report = TickReport {
            evaluated: running.len(),
            ..TickReport::default()
        };

        for decision in plan {
            let Some(snapshot) = by_id.get(decision.clock_id.as_str()) else {
                continue;
            };
            match self.apply(snapshot, &decision, now) {
                Ok(true) => match decision.transition {
                    ClockTransition::Warn => report.warned.push(decision.clock_id),
                    ClockTransition::Breach => report.breached.push(decision.clock_id),
                },
                Ok(false) => {
                    debug!(clock_id = %decision.clock_id, "clock moved by another tick");
                    report.skipped.push(decision.clock_id);
                }
                Err(e) => {
                    error!(clock_id = %decision.clock_id, error = %e, "clock tick failed");
                    report.failed.push(TickFailure {
                        clock_id: decision.clock_id,
                        error: e.to_string(),
                    });
                }
            }
        }
        report
    }

    fn apply(
        &self,
        snapshot: &Clock,
        decision: &ClockDecision,
        now: DateTime<Utc>,
    ) -> EvidenceResult<bool> {
        let mut updated = snapshot.clone();
        updated.version += 1;
        match decision.transition {
            ClockTransition::Warn => {
                updated.warning_sent = true;
                updated.warning_sent_at = Some(now);
            }
            ClockTransition::Breach => {
                updated.status = ClockStatus::Breached;
                updated.breached_at = Some(now);
            }
        }

        if !self
            .store
            .swap_clock(&updated, decision.expected_version, WriteBatch::new())?
        {
            return Ok(false);
        }

        let (event_type, severity, level, kind, message) = match decision.transition {
            ClockTransition::Warn => (
                "CLOCK.WARNING",
                Severity::High,
                AlertLevel::Warning,
                AlertKind::ClockWarning,
                format!(
                    "{} {} deadline in {:.1}h",
                    updated.regulation, updated.article, decision.hours_remaining
                ),
            ),
            ClockTransition::Breach => (
                "CLOCK.BREACHED",
                Severity::Critical,
                AlertLevel::Critical,
                AlertKind::ClockBreached,
                format!(
                    "{} {} deadline passed at {}",
                    updated.regulation, updated.article, updated.deadline
                ),
            ),
        };

        // The transition is already durable; a failed ledger write is logged
        // and does not undo it.
        if let Err(e) = self.record_emission(&updated, event_type, severity, decision, now) {
            error!(clock_id = %updated.clock_id, error = %e, "failed to record clock event");
        }

        match decision.transition {
            ClockTransition::Warn => {
                warn!(clock_id = %updated.clock_id, hours_remaining = decision.hours_remaining, "clock warning")
            }
            ClockTransition::Breach => {
                error!(clock_id = %updated.clock_id, deadline = %updated.deadline, "clock breached")
            }
        }
        self.alerts
            .emit(Alert::new(level, kind, &updated.clock_id, message, now));
        Ok(true)
    }

    fn record_emission(
        &self,
        clock: &Clock,
        event_type: &str,
        severity: Severity,
        decision: &ClockDecision,
        now: DateTime<Utc>,
    ) -> EvidenceResult<()> {
        let correlation = clock
            .related_event_id
            .clone()
            .unwrap_or_else(|| clock.clock_id.clone());
        let mut draft = EventDraft::new(
            event_type,
            CLOCK_ENGINE_SOURCE,
            correlation,
            json!({
                "clock_id": clock.clock_id,
                "clock_type": clock.clock_type,
                "regulation": clock.regulation,
                "article": clock.article,
                "deadline": clock.deadline,
                "hours_remaining": decision.hours_remaining,
            }),
        )
        .with_severity(severity)
        .with_tags([clock.regulation.clone()])
        .with_articles([clock.article.clone()])
        .occurred_at(now);
        if let Some(cause) = &clock.related_event_id {
            draft = draft.with_causation(cause);
        }

        let clock_ref = NodeRef::clock(&clock.clock_id);
        self.ledger.append_with(draft, |event| {
            let mut batch = WriteBatch::new();
            batch.push_edge(Edge::new(
                EdgeType::Emitted,
                clock_ref.clone(),
                NodeRef::event(&event.event_id),
                now,
            )?);
            Ok(batch)
        })?;
        Ok(())
    }

    /// Close a clock as MET or STOPPED. STOPPED needs a justified decision;
    /// MET may carry the artifact that fulfils the obligation.
    pub fn update_status(
        &self,
        clock_id: &str,
        status: ClockStatus,
        evidence_artifact_id: Option<&str>,
        decision_id: Option<&str>,
    ) -> EvidenceResult<Clock> {
        let decision = match (status, decision_id) {
            (ClockStatus::Stopped, Some(id)) => Some(self.documented_decision(id)?),
            (ClockStatus::Stopped, None) => {
                return Err(EvidenceError::validation(
                    "decision_id",
                    "stopping a clock requires a documented decision",
                ))
            }
            _ => None,
        };
        if let Some(artifact_id) = evidence_artifact_id {
            if self
                .store
                .get_node(&NodeRef::artifact(artifact_id))?
                .is_none()
            {
                return Err(EvidenceError::not_found("artifact", artifact_id));
            }
        }

        let now = self.time.now();
        let clock = self.transition(clock_id, |current| {
            if current.status.is_terminal()
                || !matches!(status, ClockStatus::Met | ClockStatus::Stopped)
            {
                return Err(EvidenceError::invalid_transition(
                    clock_id,
                    current.status.as_str(),
                    status.as_str(),
                ));
            }
            let mut updated = current.clone();
            updated.status = status;
            updated.completed_at = Some(now);
            if let Some(paused_at) = current.paused_at {
                updated.paused_duration_ms += (now - paused_at).num_milliseconds();
                updated.paused_at = None;
            }

            let mut batch = WriteBatch::new();
            let clock_ref = NodeRef::clock(clock_id);
            if let Some(artifact_id) = evidence_artifact_id {
                updated.evidence_artifact_id = Some(artifact_id.to_string());
                batch.push_edge(Edge::new(
                    EdgeType::FulfilledBy,
                    clock_ref.clone(),
                    NodeRef::artifact(artifact_id),
                    now,
                )?);
            }
            if let Some(decision) = &decision {
                batch.push_edge(Edge::new(
                    EdgeType::StoppedBy,
                    clock_ref,
                    NodeRef::decision(&decision.decision_id),
                    now,
                )?);
            }
            Ok((updated, batch))
        })?;

        info!(clock_id, status = %clock.status, "clock closed");
        Ok(clock)
    }

    /// Suspend a running clock under a documented decision.
    pub fn pause_clock(&self, clock_id: &str, decision_id: &str) -> EvidenceResult<Clock> {
        let decision = self.documented_decision(decision_id)?;
        let now = self.time.now();
        let clock = self.transition(clock_id, |current| {
            if current.status != ClockStatus::Running {
                return Err(EvidenceError::invalid_transition(
                    clock_id,
                    current.status.as_str(),
                    ClockStatus::Paused.as_str(),
                ));
            }
            let mut updated = current.clone();
            updated.status = ClockStatus::Paused;
            updated.paused_at = Some(now);
            let mut batch = WriteBatch::new();
            batch.push_edge(Edge::new(
                EdgeType::AdjustedBy,
                NodeRef::clock(clock_id),
                NodeRef::decision(&decision.decision_id),
                now,
            )?);
            Ok((updated, batch))
        })?;
        info!(clock_id, decision_id, "clock paused");
        Ok(clock)
    }

    /// Resume a paused clock. The deadline moves out by the time spent paused.
    pub fn resume_clock(&self, clock_id: &str) -> EvidenceResult<Clock> {
        let now = self.time.now();
        let clock = self.transition(clock_id, |current| {
            let (ClockStatus::Paused, Some(paused_at)) = (current.status, current.paused_at)
            else {
                return Err(EvidenceError::invalid_transition(
                    clock_id,
                    current.status.as_str(),
                    ClockStatus::Running.as_str(),
                ));
            };
            let paused_for = now - paused_at;
            let mut updated = current.clone();
            updated.status = ClockStatus::Running;
            updated.paused_at = None;
            updated.deadline = current
                .deadline
                .checked_add_signed(paused_for)
                .ok_or_else(|| EvidenceError::validation("deadline", "deadline out of range"))?;
            updated.paused_duration_ms += paused_for.num_milliseconds();
            Ok((updated, WriteBatch::new()))
        })?;
        info!(clock_id, deadline = %clock.deadline, "clock resumed");
        Ok(clock)
    }

    /// Move a deadline out under a documented decision.
    pub fn extend_deadline(
        &self,
        clock_id: &str,
        additional_hours: f64,
        decision_id: &str,
    ) -> EvidenceResult<Clock> {
        add_hours(self.time.now(), additional_hours, "additional_hours")?;
        let decision = self.documented_decision(decision_id)?;
        let now = self.time.now();
        let clock = self.transition(clock_id, |current| {
            if current.status.is_terminal() {
                return Err(EvidenceError::invalid_transition(
                    clock_id,
                    current.status.as_str(),
                    "EXTENDED",
                ));
            }
            let mut updated = current.clone();
            updated.deadline = add_hours(current.deadline, additional_hours, "additional_hours")?;
            let mut batch = WriteBatch::new();
            batch.push_edge(Edge::new(
                EdgeType::AdjustedBy,
                NodeRef::clock(clock_id),
                NodeRef::decision(&decision.decision_id),
                now,
            )?);
            Ok((updated, batch))
        })?;
        info!(clock_id, deadline = %clock.deadline, "deadline extended");
        Ok(clock)
    }

    /// Load, change and swap a clock, reloading if another writer got there first.
    fn transition<F>(&self, clock_id: &str, change: F) -> EvidenceResult<Clock>
    where
        F: Fn(&Clock) -> EvidenceResult<(Clock, WriteBatch)>,
    {
        for _ in 0..MAX_SWAP_ATTEMPTS {
            let current = self.get_clock(clock_id)?;
            let (mut updated, batch) = change(&current)?;
            updated.version = current.version + 1;
            if self.store.swap_clock(&updated, current.version, batch)? {
                return Ok(updated);
            }
        }
        Err(EvidenceError::internal(format!(
            "clock {clock_id} kept changing underneath the update"
        )))
    }

    fn documented_decision(&self, decision_id: &str) -> EvidenceResult<Decision> {
        let decision = match self.store.get_node(&NodeRef::decision(decision_id))? {
            Some(Node::Decision(d)) => d,
            _ => return Err(EvidenceError::not_found("decision", decision_id)),
        };
        if decision.justification.trim().is_empty() {
            return Err(EvidenceError::validation(
                "justification",
                format!("decision {decision_id} carries no justification"),
            ));
        }
        Ok(decision)
    }
}

/// Longest deadline or extension accepted, ten years.
pub const MAX_DEADLINE_HOURS: f64 = 87_600.0;

/// `at + hours`, rejecting non-positive, oversized or unrepresentable spans.
fn add_hours(at: DateTime<Utc>, hours: f64, field: &str) -> EvidenceResult<DateTime<Utc>> {
    if !(hours.is_finite() && hours > 0.0 && hours <= MAX_DEADLINE_HOURS) {
        return Err(EvidenceError::validation(
            field,
            format!("must be a positive number of hours no greater than {MAX_DEADLINE_HOURS}"),
        ));
    }
    Duration::try_milliseconds((hours * 3_600_000.0).round() as i64)
        .and_then(|span| at.checked_add_signed(span))
        .ok_or_else(|| EvidenceError::validation(field, "deadline out of range"))
}
