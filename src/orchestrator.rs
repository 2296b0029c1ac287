//! Event Ingestion Orchestrator
//!
//! The write surface collaborators call. Every operation here lands as one
//! store write set: an ingested event commits together with the clocks it
//! triggers and the edges that tie them to the event, so the graph never
//! holds a sealed event without its consequences.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, warn};

use crate::alerts::{Alert, AlertKind, AlertLevel, AlertSink};
use crate::canonicalize::{canonical_json, is_hash_hex, sha256_hex};
use crate::clock_engine::{ClockEngine, NewClock};
use crate::errors::{EvidenceError, EvidenceResult};
use crate::graph_store::{EdgeFilter, GraphStore, WriteBatch};
use crate::ledger::{is_upper_ident, Ledger};
use crate::model::{
    Actor, ActorType, AiAssistance, Approval, Artifact, ArtifactSignature, Clock, ClockStatus,
    Control, Decision, Edge, EdgeType, Event, EventDraft, Node, NodeKind, NodeRef, Severity,
};
use crate::time_source::TimeSource;

const DEFAULT_DECISION_ARTIFACT: &str = "DECISION_RECORD";

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEventRequest {
    #[serde(flatten)]
    pub draft: EventDraft,
    #[serde(default = "default_true")]
    pub auto_trigger_clocks: bool,
    /// Actors linked with INVOLVES.
    #[serde(default)]
    pub actor_ids: Vec<String>,
    /// Controls linked with GOVERNED_BY.
    #[serde(default)]
    pub control_ids: Vec<String>,
}

impl From<EventDraft> for CreateEventRequest {
    fn from(draft: EventDraft) -> Self {
        Self {
            draft,
            auto_trigger_clocks: true,
            actor_ids: Vec::new(),
            control_ids: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventReceipt {
    pub event_id: String,
    pub source_system: String,
    pub sequence_number: u64,
    pub payload_hash: String,
    pub previous_hash: String,
    pub recorded_at: DateTime<Utc>,
    pub triggered_clocks: Vec<String>,
}

/// Artifact spawned alongside a decision. Unset fields are derived from
/// the decision itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DecisionArtifact {
    #[serde(default)]
    pub artifact_type: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub content_hash: Option<String>,
    #[serde(default)]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDecisionRequest {
    pub decision_type: String,
    pub regulation: String,
    pub outcome: String,
    pub justification: String,
    pub actor_id: String,
    pub related_event_id: String,
    #[serde(default)]
    pub ai_assistance: Option<AiAssistance>,
    #[serde(default)]
    pub approval_chain: Vec<Approval>,
    #[serde(default)]
    pub effectiveness_rating: Option<f64>,
    #[serde(default)]
    pub control_ids: Vec<String>,
    #[serde(default)]
    pub artifact: Option<DecisionArtifact>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionReceipt {
    pub decision_id: String,
    pub content_hash: String,
    pub decided_at: DateTime<Utc>,
    pub artifact_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterActorRequest {
    #[serde(default)]
    pub actor_id: Option<String>,
    pub actor_type: ActorType,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterControlRequest {
    #[serde(default)]
    pub control_id: Option<String>,
    pub name: String,
    pub control_type: String,
    #[serde(default)]
    pub regulation: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordArtifactRequest {
    pub artifact_type: String,
    pub title: String,
    pub content_hash: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub signature: Option<ArtifactSignature>,
    #[serde(default)]
    pub created_by: Option<String>,
    /// Events or decisions this artifact evidences.
    #[serde(default)]
    pub evidences: Vec<NodeRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockStatusRequest {
    pub status: ClockStatus,
    #[serde(default)]
    pub evidence_artifact_id: Option<String>,
    #[serde(default)]
    pub decision_id: Option<String>,
}

pub struct Orchestrator {
    ledger: Arc<Ledger>,
    clocks: Arc<ClockEngine>,
    alerts: Arc<dyn AlertSink>,
    time: Arc<dyn TimeSource>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<Ledger>,
        clocks: Arc<ClockEngine>,
        alerts: Arc<dyn AlertSink>,
        time: Arc<dyn TimeSource>,
    ) -> Self {
        Self {
            ledger,
            clocks,
            alerts,
            time,
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn clocks(&self) -> &Arc<ClockEngine> {
        &self.clocks
    }

    fn store(&self) -> &dyn GraphStore {
        self.ledger.store().as_ref()
    }

    fn require_node(&self, node: &NodeRef) -> EvidenceResult<Node> {
        self.store()
            .get_node(node)?
            .ok_or_else(|| EvidenceError::not_found(node.kind.as_str(), &node.id))
    }

    /// Seal an event and start every clock its trigger rules name.
    pub fn create_event(&self, request: CreateEventRequest) -> EvidenceResult<EventReceipt> {
        let CreateEventRequest {
            draft,
            auto_trigger_clocks,
            actor_ids,
            control_ids,
        } = request;

        for actor_id in &actor_ids {
            self.require_node(&NodeRef::actor(actor_id))?;
        }
        for control_id in &control_ids {
            self.require_node(&NodeRef::new(NodeKind::Control, control_id))?;
        }

        let triggers = if auto_trigger_clocks {
            self.clocks.settings().triggers.clone()
        } else {
            Vec::new()
        };

        let event = self.ledger.append_with(draft, |event| {
            let event_ref = NodeRef::event(&event.event_id);
            let mut batch = WriteBatch::new();
            let mut started = HashSet::new();

            for rule in triggers.iter().filter(|r| r.matches(event)) {
                if !started.insert(rule.clock_type.as_str()) {
                    continue;
                }
                let clock = self.clocks.build_clock(
                    &NewClock {
                        clock_type: rule.clock_type.clone(),
                        regulation: rule.regulation.clone(),
                        article: rule.article.clone(),
                        related_event_id: Some(event.event_id.clone()),
                        deadline_hours: rule.deadline_hours,
                    },
                    event.occurred_at,
                )?;
                batch.push_edge(Edge::new(
                    EdgeType::Triggers,
                    event_ref.clone(),
                    NodeRef::clock(&clock.clock_id),
                    event.recorded_at,
                )?);
                batch.push_node(Node::Clock(clock));
            }
            for actor_id in &actor_ids {
                batch.push_edge(Edge::new(
                    EdgeType::Involves,
                    event_ref.clone(),
                    NodeRef::actor(actor_id),
                    event.recorded_at,
                )?);
            }
            for control_id in &control_ids {
                batch.push_edge(Edge::new(
                    EdgeType::GovernedBy,
                    event_ref.clone(),
                    NodeRef::new(NodeKind::Control, control_id),
                    event.recorded_at,
                )?);
            }
            Ok(batch)
        })?;

        let triggered_clocks: Vec<String> = self
            .store()
            .query_edges(
                &EdgeFilter::of_type(EdgeType::Triggers).from_node(NodeRef::event(&event.event_id)),
            )?
            .into_iter()
            .map(|edge| edge.target.id)
            .collect();

        if event.severity == Severity::Critical {
            self.raise_critical(&event);
        }

        info!(
            source_system = %event.source_system,
            sequence = event.sequence_number,
            event_type = %event.event_type,
            clocks = triggered_clocks.len(),
            "event ingested"
        );

        Ok(EventReceipt {
            event_id: event.event_id,
            source_system: event.source_system,
            sequence_number: event.sequence_number,
            payload_hash: event.payload_hash,
            previous_hash: event.previous_hash,
            recorded_at: event.recorded_at,
            triggered_clocks,
        })
    }

    fn raise_critical(&self, event: &Event) {
        warn!(event_id = %event.event_id, event_type = %event.event_type, "critical event ingested");
        self.alerts.emit(Alert::new(
            AlertLevel::Critical,
            AlertKind::CriticalEvent,
            &event.event_id,
            format!(
                "{} from {} at sequence {}",
                event.event_type, event.source_system, event.sequence_number
            ),
            event.recorded_at,
        ));
    }

    /// Record a decision about an event, made by a known actor.
    pub fn create_decision(&self, request: CreateDecisionRequest) -> EvidenceResult<DecisionReceipt> {
        if request.justification.trim().is_empty() {
            return Err(EvidenceError::validation(
                "justification",
                "a decision must carry a justification",
            ));
        }
        if request.outcome.trim().is_empty() {
            return Err(EvidenceError::validation("outcome", "outcome is required"));
        }
        check_upper_ident("decision_type", &request.decision_type)?;
        check_upper_ident("regulation", &request.regulation)?;

        if self.store().get_event(&request.related_event_id)?.is_none() {
            return Err(EvidenceError::not_found("event", &request.related_event_id));
        }
        self.require_node(&NodeRef::actor(&request.actor_id))?;
        for control_id in &request.control_ids {
            self.require_node(&NodeRef::new(NodeKind::Control, control_id))?;
        }

        let decided_at = self.time.now();
        let content_hash = sha256_hex(
            canonical_json(&json!({
                "decision_type": request.decision_type,
                "regulation": request.regulation,
                "outcome": request.outcome,
                "justification": request.justification,
                "actor_id": request.actor_id,
                "related_event_id": request.related_event_id,
                "decided_at": decided_at,
                "ai_assistance": request.ai_assistance,
                "approval_chain": request.approval_chain,
            }))?
            .as_bytes(),
        );

        let decision = Decision {
            decision_id: uuid::Uuid::new_v4().to_string(),
            decision_type: request.decision_type,
            regulation: request.regulation,
            outcome: request.outcome,
            justification: request.justification,
            actor_id: request.actor_id,
            related_event_id: request.related_event_id,
            decided_at,
            content_hash: content_hash.clone(),
            ai_assistance: request.ai_assistance,
            approval_chain: request.approval_chain,
            effectiveness_rating: request.effectiveness_rating,
        };
        let decision_ref = NodeRef::decision(&decision.decision_id);

        let mut batch = WriteBatch::new();
        batch.push_edge(Edge::new(
            EdgeType::MadeBy,
            decision_ref.clone(),
            NodeRef::actor(&decision.actor_id),
            decided_at,
        )?);
        batch.push_edge(Edge::new(
            EdgeType::CausedBy,
            decision_ref.clone(),
            NodeRef::event(&decision.related_event_id),
            decided_at,
        )?);
        for control_id in &request.control_ids {
            batch.push_edge(Edge::new(
                EdgeType::GovernedBy,
                decision_ref.clone(),
                NodeRef::new(NodeKind::Control, control_id),
                decided_at,
            )?);
        }

        let artifact_input = match request.artifact {
            Some(input) => Some(input),
            None if decision.requires_artifact() => Some(DecisionArtifact::default()),
            None => None,
        };
        let artifact_id = match artifact_input {
            Some(input) => {
                let artifact = decision_artifact(&decision, input)?;
                let artifact_ref = NodeRef::artifact(&artifact.artifact_id);
                batch.push_edge(Edge::new(
                    EdgeType::Produced,
                    decision_ref.clone(),
                    artifact_ref.clone(),
                    decided_at,
                )?);
                batch.push_edge(Edge::new(
                    EdgeType::Evidences,
                    artifact_ref,
                    decision_ref,
                    decided_at,
                )?);
                let id = artifact.artifact_id.clone();
                batch.push_node(Node::Artifact(artifact));
                Some(id)
            }
            None => None,
        };

        let receipt = DecisionReceipt {
            decision_id: decision.decision_id.clone(),
            content_hash,
            decided_at,
            artifact_id,
        };
        info!(
            decision_id = %decision.decision_id,
            decision_type = %decision.decision_type,
            event_id = %decision.related_event_id,
            "decision recorded"
        );
        batch.push_node(Node::Decision(decision));
        self.store().commit(batch)?;
        Ok(receipt)
    }

    pub fn register_actor(&self, request: RegisterActorRequest) -> EvidenceResult<Actor> {
        if request.name.trim().is_empty() {
            return Err(EvidenceError::validation("name", "actor name is required"));
        }
        let actor = Actor {
            actor_id: request
                .actor_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            actor_type: request.actor_type,
            name: request.name,
            role: request.role,
            created_at: self.time.now(),
        };
        self.store().create_node(Node::Actor(actor.clone()))?;
        info!(actor_id = %actor.actor_id, "actor registered");
        Ok(actor)
    }

    pub fn register_control(&self, request: RegisterControlRequest) -> EvidenceResult<Control> {
        if request.name.trim().is_empty() {
            return Err(EvidenceError::validation("name", "control name is required"));
        }
        check_upper_ident("control_type", &request.control_type)?;
        if let Some(regulation) = &request.regulation {
            check_upper_ident("regulation", regulation)?;
        }
        let control = Control {
            control_id: request
                .control_id
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            name: request.name,
            control_type: request.control_type,
            regulation: request.regulation,
            description: request.description,
            created_at: self.time.now(),
        };
        self.store().create_node(Node::Control(control.clone()))?;
        info!(control_id = %control.control_id, "control registered");
        Ok(control)
    }

    /// Store a document or proof and link it to what it evidences.
    pub fn record_artifact(&self, request: RecordArtifactRequest) -> EvidenceResult<Artifact> {
        if !is_hash_hex(&request.content_hash) {
            return Err(EvidenceError::validation(
                "content_hash",
                "content_hash must be a lowercase 64 character SHA-256 hex digest",
            ));
        }
        if request.title.trim().is_empty() {
            return Err(EvidenceError::validation("title", "artifact title is required"));
        }
        check_upper_ident("artifact_type", &request.artifact_type)?;

        let now = self.time.now();
        let artifact = Artifact {
            artifact_id: uuid::Uuid::new_v4().to_string(),
            artifact_type: request.artifact_type,
            title: request.title,
            content_hash: request.content_hash,
            uri: request.uri,
            signature: request.signature,
            created_by: request.created_by,
            created_at: now,
        };

        let mut batch = WriteBatch::new();
        for target in request.evidences {
            batch.push_edge(Edge::new(
                EdgeType::Evidences,
                NodeRef::artifact(&artifact.artifact_id),
                target,
                now,
            )?);
        }
        batch.push_node(Node::Artifact(artifact.clone()));
        self.store().commit(batch)?;
        info!(artifact_id = %artifact.artifact_id, "artifact recorded");
        Ok(artifact)
    }

    pub fn create_clock(&self, request: NewClock) -> EvidenceResult<Clock> {
        if let Some(event_id) = &request.related_event_id {
            if self.store().get_event(event_id)?.is_none() {
                return Err(EvidenceError::not_found("event", event_id));
            }
        }
        self.clocks.create_clock(request)
    }

    /// Close a clock; an evidence artifact is linked with FULFILLED_BY.
    pub fn update_clock_status(
        &self,
        clock_id: &str,
        request: ClockStatusRequest,
    ) -> EvidenceResult<Clock> {
        self.clocks.update_status(
            clock_id,
            request.status,
            request.evidence_artifact_id.as_deref(),
            request.decision_id.as_deref(),
        )
    }
}

fn decision_artifact(decision: &Decision, input: DecisionArtifact) -> EvidenceResult<Artifact> {
    let content_hash = input
        .content_hash
        .unwrap_or_else(|| decision.content_hash.clone());
    if !is_hash_hex(&content_hash) {
        return Err(EvidenceError::validation(
            "artifact.content_hash",
            "content_hash must be a lowercase 64 character SHA-256 hex digest",
        ));
    }
    Ok(Artifact {
        artifact_id: uuid::Uuid::new_v4().to_string(),
        artifact_type: input
            .artifact_type
            .unwrap_or_else(|| DEFAULT_DECISION_ARTIFACT.to_string()),
        title: input.title.unwrap_or_else(|| {
            format!(
                "{} decision on {}",
                decision.decision_type, decision.related_event_id
            )
        }),
        content_hash,
        uri: input.uri,
        signature: None,
        created_by: Some(decision.actor_id.clone()),
        created_at: decision.decided_at,
    })
}

fn check_upper_ident(field: &str, value: &str) -> EvidenceResult<()> {
    if is_upper_ident(value) {
        Ok(())
    } else {
        Err(EvidenceError::validation(
            field,
            format!("'{value}' must be an upper-case identifier"),
        ))
    }
}
