//! Graph Store contract
//!
//! The store is the only shared mutable state in the system. Everything the
//! ledger, clock engine, anchor service and query engine need from
//! persistence goes through [`GraphStore`]; two backends implement it
//! (`MemoryGraphStore` and `SledGraphStore`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::canonicalize::GENESIS_HASH;
use crate::errors::{EvidenceError, EvidenceResult};
use crate::model::{
    Clock, Edge, EdgeType, Event, MerkleAnchor, Node, NodeKind, NodeRef, TsaTimestamp,
    VerificationStatus,
};

/// Last sealed position of one source_system stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamHead {
    pub sequence: u64,
    pub last_hash: String,
}

impl StreamHead {
    pub fn genesis() -> Self {
        Self {
            sequence: 0,
            last_hash: GENESIS_HASH.to_string(),
        }
    }
}

/// A set of writes that lands in the store all together or not at all.
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    pub event: Option<Event>,
    pub nodes: Vec<Node>,
    pub edges: Vec<Edge>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event(event: Event) -> Self {
        Self {
            event: Some(event),
            ..Self::default()
        }
    }

    pub fn push_node(&mut self, node: Node) {
        self.nodes.push(node);
    }

    pub fn push_edge(&mut self, edge: Edge) {
        self.edges.push(edge);
    }

    pub fn is_empty(&self) -> bool {
        self.event.is_none() && self.nodes.is_empty() && self.edges.is_empty()
    }

    /// Node references introduced by this batch.
    pub fn introduced_refs(&self) -> HashSet<NodeRef> {
        let mut refs: HashSet<NodeRef> = self.nodes.iter().map(Node::node_ref).collect();
        if let Some(event) = &self.event {
            refs.insert(NodeRef::event(&event.event_id));
        }
        refs
    }

    /// Shape checks every backend applies before touching storage.
    pub fn validate_shape(&self) -> EvidenceResult<()> {
        if self.nodes.iter().any(|n| n.kind() == NodeKind::Event) {
            return Err(EvidenceError::validation(
                "nodes",
                "events enter the graph only through the ledger",
            ));
        }
        let mut seen = HashSet::new();
        for node in &self.nodes {
            if !seen.insert(node.node_ref()) {
                return Err(EvidenceError::validation(
                    "nodes",
                    format!("duplicate node {} in one batch", node.node_ref()),
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EdgeFilter {
    pub edge_type: Option<EdgeType>,
    pub source: Option<NodeRef>,
    pub target: Option<NodeRef>,
}

impl EdgeFilter {
    pub fn of_type(edge_type: EdgeType) -> Self {
        Self {
            edge_type: Some(edge_type),
            ..Self::default()
        }
    }

    pub fn from_node(mut self, source: NodeRef) -> Self {
        self.source = Some(source);
        self
    }

    pub fn to_node(mut self, target: NodeRef) -> Self {
        self.target = Some(target);
        self
    }

    pub fn matches(&self, edge: &Edge) -> bool {
        self.edge_type.is_none_or(|t| edge.edge_type == t)
            && self.source.as_ref().is_none_or(|s| &edge.source == s)
            && self.target.as_ref().is_none_or(|t| &edge.target == t)
    }
}

pub trait GraphStore: Send + Sync {
    /// Head of a stream, `None` when nothing has been appended yet.
    fn latest_sequence(&self, source_system: &str) -> EvidenceResult<Option<StreamHead>>;

    /// Atomically apply a write set. An included event must extend its
    /// stream head by exactly one, otherwise `SequenceConflict`.
    fn commit(&self, batch: WriteBatch) -> EvidenceResult<()>;

    fn append_event(&self, event: Event) -> EvidenceResult<()> {
        self.commit(WriteBatch::with_event(event))
    }

    fn create_node(&self, node: Node) -> EvidenceResult<()> {
        let mut batch = WriteBatch::new();
        batch.push_node(node);
        self.commit(batch)
    }

    fn create_edge(&self, edge: Edge) -> EvidenceResult<()> {
        let mut batch = WriteBatch::new();
        batch.push_edge(edge);
        self.commit(batch)
    }

    fn get_event(&self, event_id: &str) -> EvidenceResult<Option<Event>>;

    /// Events ordered by (source_system, sequence_number).
    fn events(
        &self,
        source_system: Option<&str>,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> EvidenceResult<Vec<Event>>;

    fn source_systems(&self) -> EvidenceResult<Vec<String>>;

    fn get_node(&self, node: &NodeRef) -> EvidenceResult<Option<Node>>;

    /// All nodes of one kind, ordered by id (events by stream position).
    fn query_nodes(&self, kind: NodeKind) -> EvidenceResult<Vec<Node>>;

    /// Matching edges ordered by (type, source, target, id).
    fn query_edges(&self, filter: &EdgeFilter) -> EvidenceResult<Vec<Edge>>;

    /// Replace a clock if its stored version still equals `expected_version`,
    /// applying `batch` in the same write. Returns `false` on a lost race.
    fn swap_clock(
        &self,
        updated: &Clock,
        expected_version: u64,
        batch: WriteBatch,
    ) -> EvidenceResult<bool>;

    /// Claim up to `limit` unanchored events recorded at or before `cutoff`
    /// for `run_id`, oldest [`claim_order`] first. Claims are exclusive
    /// across concurrent callers.
    fn claim_unanchored(
        &self,
        run_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> EvidenceResult<Vec<Event>>;

    /// Drop claims held by a run that failed before persisting its anchor.
    fn release_claims(&self, run_id: &str) -> EvidenceResult<usize>;

    /// Insert or update an anchor. A verified anchor is never rewritten.
    fn save_anchor(&self, anchor: &MerkleAnchor) -> EvidenceResult<()>;

    fn get_anchor(&self, anchor_id: &str) -> EvidenceResult<Option<MerkleAnchor>>;

    /// Anchors ordered by creation time.
    fn anchors(&self) -> EvidenceResult<Vec<MerkleAnchor>>;

    fn save_timestamp(&self, timestamp: &TsaTimestamp) -> EvidenceResult<()>;

    fn timestamps_for(&self, anchor_id: &str) -> EvidenceResult<Vec<TsaTimestamp>>;

    fn mark_degraded(&self, source_system: &str, reason: &str) -> EvidenceResult<()>;

    fn degraded_streams(&self) -> EvidenceResult<BTreeMap<String, String>>;
}

/// Sequence and linkage check shared by every backend.
pub(crate) fn check_extends_head(head: Option<&StreamHead>, event: &Event) -> EvidenceResult<()> {
    let head = head.cloned().unwrap_or_else(StreamHead::genesis);
    if event.sequence_number != head.sequence + 1 || event.previous_hash != head.last_hash {
        return Err(EvidenceError::SequenceConflict {
            source_system: event.source_system.clone(),
            expected: event.sequence_number,
            actual: head.sequence,
        });
    }
    Ok(())
}

/// Anchors become immutable once witnessed.
pub(crate) fn check_anchor_update(
    existing: Option<&MerkleAnchor>,
    updated: &MerkleAnchor,
) -> EvidenceResult<()> {
    match existing {
        Some(current) if current.verification_status == VerificationStatus::Verified => {
            if current != updated {
                return Err(EvidenceError::validation(
                    "anchor",
                    format!("anchor {} is already witnessed", current.anchor_id),
                ));
            }
            Ok(())
        }
        Some(current) if current.merkle_root != updated.merkle_root || current.leaves != updated.leaves => {
            Err(EvidenceError::validation(
                "anchor",
                format!("anchor {} commitment cannot change", current.anchor_id),
            ))
        }
        _ => Ok(()),
    }
}

pub(crate) fn sort_edges(edges: &mut [Edge]) {
    edges.sort_by(|a, b| {
        (a.edge_type, &a.source, &a.target, &a.edge_id).cmp(&(
            b.edge_type,
            &b.source,
            &b.target,
            &b.edge_id,
        ))
    });
}

/// Order in which unanchored events are claimed: oldest recorded first.
pub fn claim_order(event: &Event) -> (DateTime<Utc>, &str, u64) {
    (event.recorded_at, event.source_system.as_str(), event.sequence_number)
}
