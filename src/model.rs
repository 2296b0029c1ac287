//! Evidence Graph data model
//!
//! Nodes are a closed tagged union over the six evidence kinds. Two nodes
//! are related only when a typed [`Edge`] connects them; sharing a
//! regulation tag never counts as a relationship.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::errors::{EvidenceError, EvidenceResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        };
        f.write_str(s)
    }
}

/// A sealed ledger entry. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub occurred_at: DateTime<Utc>,
    pub recorded_at: DateTime<Utc>,
    pub sequence_number: u64,
    pub event_type: String,
    pub severity: Severity,
    pub source_system: String,
    pub regulatory_tags: Vec<String>,
    #[serde(default)]
    pub articles: Vec<String>,
    pub payload: Value,
    pub payload_hash: String,
    pub previous_hash: String,
    pub correlation_id: String,
    pub causation_id: Option<String>,
}

impl Event {
    pub fn has_tag(&self, tag: &str) -> bool {
        self.regulatory_tags.iter().any(|t| t == tag)
    }
}

/// Caller-supplied part of an event, before the ledger seals it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventDraft {
    pub event_type: String,
    pub source_system: String,
    pub severity: Severity,
    pub payload: Value,
    #[serde(default)]
    pub regulatory_tags: Vec<String>,
    #[serde(default)]
    pub articles: Vec<String>,
    pub correlation_id: String,
    #[serde(default)]
    pub causation_id: Option<String>,
    /// Defaults to the recording time when absent.
    #[serde(default)]
    pub occurred_at: Option<DateTime<Utc>>,
}

impl EventDraft {
    pub fn new(
        event_type: impl Into<String>,
        source_system: impl Into<String>,
        correlation_id: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            source_system: source_system.into(),
            severity: Severity::Info,
            payload,
            regulatory_tags: Vec::new(),
            articles: Vec::new(),
            correlation_id: correlation_id.into(),
            causation_id: None,
            occurred_at: None,
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.regulatory_tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_articles<I, S>(mut self, articles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.articles = articles.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_causation(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    pub fn occurred_at(mut self, at: DateTime<Utc>) -> Self {
        self.occurred_at = Some(at);
        self
    }
}

/// Descriptive AI-assistance metadata. Carried as-is, never enforced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiAssistance {
    pub model_id: String,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub human_reviewed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Approval {
    pub actor_id: String,
    pub approved_at: DateTime<Utc>,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub decision_id: String,
    pub decision_type: String,
    pub regulation: String,
    pub outcome: String,
    pub justification: String,
    pub actor_id: String,
    pub related_event_id: String,
    pub decided_at: DateTime<Utc>,
    pub content_hash: String,
    #[serde(default)]
    pub ai_assistance: Option<AiAssistance>,
    #[serde(default)]
    pub approval_chain: Vec<Approval>,
    #[serde(default)]
    pub effectiveness_rating: Option<f64>,
}

impl Decision {
    /// Escalations, overrides and closures are evidenced by their own artifact.
    pub fn requires_artifact(&self) -> bool {
        matches!(
            self.decision_type.as_str(),
            "ESCALATION" | "OVERRIDE" | "CLOSURE"
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClockStatus {
    Running,
    Met,
    Breached,
    Stopped,
    Paused,
}

impl ClockStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ClockStatus::Met | ClockStatus::Breached | ClockStatus::Stopped
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClockStatus::Running => "RUNNING",
            ClockStatus::Met => "MET",
            ClockStatus::Breached => "BREACHED",
            ClockStatus::Stopped => "STOPPED",
            ClockStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for ClockStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClockStatus {
    type Err = EvidenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUNNING" => Ok(ClockStatus::Running),
            "MET" => Ok(ClockStatus::Met),
            "BREACHED" => Ok(ClockStatus::Breached),
            "STOPPED" => Ok(ClockStatus::Stopped),
            "PAUSED" => Ok(ClockStatus::Paused),
            other => Err(EvidenceError::validation(
                "status",
                format!("unknown clock status '{other}'"),
            )),
        }
    }
}

/// A regulatory deadline tracked as a state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Clock {
    pub clock_id: String,
    pub clock_type: String,
    pub regulation: String,
    pub article: String,
    pub related_event_id: Option<String>,
    pub start_time: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: ClockStatus,
    pub warning_sent: bool,
    pub warning_sent_at: Option<DateTime<Utc>>,
    pub breached_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub paused_duration_ms: i64,
    pub evidence_artifact_id: Option<String>,
    /// Bumped on every persisted transition; the store compares it on swap.
    pub version: u64,
}

impl Clock {
    pub fn hours_remaining(&self, now: DateTime<Utc>) -> f64 {
        (self.deadline - now).num_milliseconds() as f64 / 3_600_000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    Human,
    System,
    AiAgent,
    Organization,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Actor {
    pub actor_id: String,
    pub actor_type: ActorType,
    pub name: String,
    #[serde(default)]
    pub role: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Control {
    pub control_id: String,
    pub name: String,
    pub control_type: String,
    #[serde(default)]
    pub regulation: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSignature {
    pub algorithm: String,
    pub signer: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub artifact_id: String,
    pub artifact_type: String,
    pub title: String,
    pub content_hash: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub signature: Option<ArtifactSignature>,
    #[serde(default)]
    pub created_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeKind {
    Event,
    Decision,
    Clock,
    Actor,
    Control,
    Artifact,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Event => "EVENT",
            NodeKind::Decision => "DECISION",
            NodeKind::Clock => "CLOCK",
            NodeKind::Actor => "ACTOR",
            NodeKind::Control => "CONTROL",
            NodeKind::Artifact => "ARTIFACT",
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a node by kind and id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeRef {
    pub kind: NodeKind,
    pub id: String,
}

impl NodeRef {
    pub fn new(kind: NodeKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
        }
    }

    pub fn event(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Event, id)
    }

    pub fn decision(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Decision, id)
    }

    pub fn clock(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Clock, id)
    }

    pub fn actor(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Actor, id)
    }

    pub fn artifact(id: impl Into<String>) -> Self {
        Self::new(NodeKind::Artifact, id)
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Node {
    Event(Event),
    Decision(Decision),
    Clock(Clock),
    Actor(Actor),
    Control(Control),
    Artifact(Artifact),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Event(_) => NodeKind::Event,
            Node::Decision(_) => NodeKind::Decision,
            Node::Clock(_) => NodeKind::Clock,
            Node::Actor(_) => NodeKind::Actor,
            Node::Control(_) => NodeKind::Control,
            Node::Artifact(_) => NodeKind::Artifact,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Node::Event(e) => &e.event_id,
            Node::Decision(d) => &d.decision_id,
            Node::Clock(c) => &c.clock_id,
            Node::Actor(a) => &a.actor_id,
            Node::Control(c) => &c.control_id,
            Node::Artifact(a) => &a.artifact_id,
        }
    }

    pub fn node_ref(&self) -> NodeRef {
        NodeRef::new(self.kind(), self.id())
    }

    /// The instant a node is placed at on the compliance timeline.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Node::Event(e) => e.occurred_at,
            Node::Decision(d) => d.decided_at,
            Node::Clock(c) => c.start_time,
            Node::Actor(a) => a.created_at,
            Node::Control(c) => c.created_at,
            Node::Artifact(a) => a.created_at,
        }
    }

    /// JSON form of the inner record, used for field lookups in queries.
    pub fn fields(&self) -> EvidenceResult<Value> {
        let value = match self {
            Node::Event(e) => serde_json::to_value(e),
            Node::Decision(d) => serde_json::to_value(d),
            Node::Clock(c) => serde_json::to_value(c),
            Node::Actor(a) => serde_json::to_value(a),
            Node::Control(c) => serde_json::to_value(c),
            Node::Artifact(a) => serde_json::to_value(a),
        };
        value.map_err(|e| EvidenceError::serialization("node fields", e))
    }

    pub fn as_clock(&self) -> Option<&Clock> {
        match self {
            Node::Clock(c) => Some(c),
            _ => None,
        }
    }

    pub fn as_event(&self) -> Option<&Event> {
        match self {
            Node::Event(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_decision(&self) -> Option<&Decision> {
        match self {
            Node::Decision(d) => Some(d),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EdgeType {
    Triggers,
    CausedBy,
    MadeBy,
    Produced,
    FulfilledBy,
    StoppedBy,
    AdjustedBy,
    Emitted,
    GovernedBy,
    Evidences,
    Involves,
}

impl EdgeType {
    pub fn as_str(self) -> &'static str {
        match self {
            EdgeType::Triggers => "TRIGGERS",
            EdgeType::CausedBy => "CAUSED_BY",
            EdgeType::MadeBy => "MADE_BY",
            EdgeType::Produced => "PRODUCED",
            EdgeType::FulfilledBy => "FULFILLED_BY",
            EdgeType::StoppedBy => "STOPPED_BY",
            EdgeType::AdjustedBy => "ADJUSTED_BY",
            EdgeType::Emitted => "EMITTED",
            EdgeType::GovernedBy => "GOVERNED_BY",
            EdgeType::Evidences => "EVIDENCES",
            EdgeType::Involves => "INVOLVES",
        }
    }

    /// Whether this edge type may connect `from` to `to`.
    pub fn allows(self, from: NodeKind, to: NodeKind) -> bool {
        use NodeKind::*;
        match self {
            EdgeType::Triggers => from == Event && to == Clock,
            EdgeType::CausedBy => from == Decision && to == Event,
            EdgeType::MadeBy => from == Decision && to == Actor,
            EdgeType::Produced => from == Decision && to == Artifact,
            EdgeType::FulfilledBy => from == Clock && to == Artifact,
            EdgeType::StoppedBy | EdgeType::AdjustedBy => from == Clock && to == Decision,
            EdgeType::Emitted => from == Clock && to == Event,
            EdgeType::GovernedBy => matches!(from, Event | Decision) && to == Control,
            EdgeType::Evidences => from == Artifact && matches!(to, Event | Decision),
            EdgeType::Involves => from == Event && to == Actor,
        }
    }
}

impl fmt::Display for EdgeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub edge_id: String,
    pub edge_type: EdgeType,
    pub source: NodeRef,
    pub target: NodeRef,
    pub created_at: DateTime<Utc>,
}

impl Edge {
    pub fn new(
        edge_type: EdgeType,
        source: NodeRef,
        target: NodeRef,
        created_at: DateTime<Utc>,
    ) -> EvidenceResult<Self> {
        if !edge_type.allows(source.kind, target.kind) {
            return Err(EvidenceError::validation(
                "edge_type",
                format!(
                    "{edge_type} cannot connect {} to {}",
                    source.kind, target.kind
                ),
            ));
        }
        Ok(Self {
            edge_id: uuid::Uuid::new_v4().to_string(),
            edge_type,
            source,
            target,
            created_at,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationStatus {
    Pending,
    Verified,
}

/// Position of one event inside an anchor's Merkle tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafRef {
    pub event_id: String,
    pub source_system: String,
    pub sequence_number: u64,
    pub payload_hash: String,
}

/// Periodic integrity commitment over a batch of sealed events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MerkleAnchor {
    pub anchor_id: String,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub event_count: usize,
    pub merkle_root: String,
    pub leaves: Vec<LeafRef>,
    pub verification_status: VerificationStatus,
    pub witness_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub verified_at: Option<DateTime<Utc>>,
}

/// Proof from a witness provider that a hash existed at `tsa_time`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsaTimestamp {
    pub timestamp_id: String,
    pub anchor_id: Option<String>,
    pub hashed_value: String,
    pub tsa_response: String,
    pub tsa_time: DateTime<Utc>,
    pub tsa_provider: String,
    pub tsa_algorithm: String,
}
