//! In-process Graph Store backed by ordered maps behind one RwLock.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use crate::errors::{EvidenceError, EvidenceResult, SafeReadLock, SafeWriteLock};
use crate::graph_store::{
    check_anchor_update, check_extends_head, claim_order, sort_edges, EdgeFilter, GraphStore,
    StreamHead, WriteBatch,
};
use crate::model::{Clock, Edge, Event, MerkleAnchor, Node, NodeKind, NodeRef, TsaTimestamp};

#[derive(Default)]
struct MemoryState {
    events: BTreeMap<(String, u64), Event>,
    event_index: HashMap<String, (String, u64)>,
    heads: HashMap<String, StreamHead>,
    nodes: BTreeMap<NodeRef, Node>,
    edges: Vec<Edge>,
    claims: HashMap<String, String>,
    anchors: BTreeMap<String, MerkleAnchor>,
    timestamps: Vec<TsaTimestamp>,
    degraded: BTreeMap<String, String>,
}

impl MemoryState {
    fn contains(&self, node: &NodeRef) -> bool {
        match node.kind {
            NodeKind::Event => self.event_index.contains_key(&node.id),
            _ => self.nodes.contains_key(node),
        }
    }

    fn check_batch(&self, batch: &WriteBatch) -> EvidenceResult<()> {
        batch.validate_shape()?;
        if let Some(event) = &batch.event {
            check_extends_head(self.heads.get(&event.source_system), event)?;
            if self.event_index.contains_key(&event.event_id) {
                return Err(EvidenceError::validation(
                    "event_id",
                    format!("event {} already exists", event.event_id),
                ));
            }
        }
        for node in &batch.nodes {
            if self.nodes.contains_key(&node.node_ref()) {
                return Err(EvidenceError::validation(
                    "node",
                    format!("{} already exists", node.node_ref()),
                ));
            }
        }
        let introduced = batch.introduced_refs();
        for edge in &batch.edges {
            for end in [&edge.source, &edge.target] {
                if !introduced.contains(end) && !self.contains(end) {
                    return Err(EvidenceError::not_found("node", end.to_string()));
                }
            }
        }
        Ok(())
    }

    fn apply(&mut self, batch: WriteBatch) {
        if let Some(event) = batch.event {
            let key = (event.source_system.clone(), event.sequence_number);
            self.heads.insert(
                event.source_system.clone(),
                StreamHead {
                    sequence: event.sequence_number,
                    last_hash: event.payload_hash.clone(),
                },
            );
            self.event_index.insert(event.event_id.clone(), key.clone());
            self.events.insert(key, event);
        }
        for node in batch.nodes {
            self.nodes.insert(node.node_ref(), node);
        }
        self.edges.extend(batch.edges);
    }
}

#[derive(Default)]
pub struct MemoryGraphStore {
    state: RwLock<MemoryState>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overwrite a stored payload without rehashing, as an attacker would.
    #[cfg(test)]
    pub(crate) fn tamper_payload(&self, source_system: &str, sequence: u64, payload: serde_json::Value) {
        let mut state = self.state.write().unwrap();
        if let Some(event) = state.events.get_mut(&(source_system.to_string(), sequence)) {
            event.payload = payload;
        }
    }

    /// Delete a stored event, leaving the stream head untouched.
    #[cfg(test)]
    pub(crate) fn remove_event(&self, source_system: &str, sequence: u64) {
        let mut state = self.state.write().unwrap();
        if let Some(event) = state.events.remove(&(source_system.to_string(), sequence)) {
            state.event_index.remove(&event.event_id);
        }
    }
}

impl GraphStore for MemoryGraphStore {
    fn latest_sequence(&self, source_system: &str) -> EvidenceResult<Option<StreamHead>> {
        Ok(self.state.safe_read()?.heads.get(source_system).cloned())
    }

    fn commit(&self, batch: WriteBatch) -> EvidenceResult<()> {
        let mut state = self.state.safe_write()?;
        state.check_batch(&batch)?;
        state.apply(batch);
        Ok(())
    }

    fn get_event(&self, event_id: &str) -> EvidenceResult<Option<Event>> {
        let state = self.state.safe_read()?;
        Ok(state
            .event_index
            .get(event_id)
            .and_then(|key| state.events.get(key))
            .cloned())
    }

    fn events(
        &self,
        source_system: Option<&str>,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> EvidenceResult<Vec<Event>> {
        let state = self.state.safe_read()?;
        let from = from_seq.unwrap_or(0);
        let to = to_seq.unwrap_or(u64::MAX);
        Ok(state
            .events
            .iter()
            .filter(|((source, seq), _)| {
                source_system.is_none_or(|s| s == source) && *seq >= from && *seq <= to
            })
            .map(|(_, event)| event.clone())
            .collect())
    }

    fn source_systems(&self) -> EvidenceResult<Vec<String>> {
        let state = self.state.safe_read()?;
        let mut sources: Vec<String> = state.heads.keys().cloned().collect();
        sources.sort();
        Ok(sources)
    }

    fn get_node(&self, node: &NodeRef) -> EvidenceResult<Option<Node>> {
        if node.kind == NodeKind::Event {
            return Ok(self.get_event(&node.id)?.map(Node::Event));
        }
        Ok(self.state.safe_read()?.nodes.get(node).cloned())
    }

    fn query_nodes(&self, kind: NodeKind) -> EvidenceResult<Vec<Node>> {
        let state = self.state.safe_read()?;
        if kind == NodeKind::Event {
            return Ok(state.events.values().cloned().map(Node::Event).collect());
        }
        Ok(state
            .nodes
            .iter()
            .filter(|(r, _)| r.kind == kind)
            .map(|(_, n)| n.clone())
            .collect())
    }

    fn query_edges(&self, filter: &EdgeFilter) -> EvidenceResult<Vec<Edge>> {
        let state = self.state.safe_read()?;
        let mut edges: Vec<Edge> = state
            .edges
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        sort_edges(&mut edges);
        Ok(edges)
    }

    fn swap_clock(
        &self,
        updated: &Clock,
        expected_version: u64,
        batch: WriteBatch,
    ) -> EvidenceResult<bool> {
        if batch.event.is_some() {
            return Err(EvidenceError::validation(
                "batch",
                "clock swaps cannot carry ledger events",
            ));
        }
        let mut state = self.state.safe_write()?;
        let key = NodeRef::clock(&updated.clock_id);
        let current_version = match state.nodes.get(&key) {
            Some(Node::Clock(current)) => current.version,
            _ => return Err(EvidenceError::not_found("clock", &updated.clock_id)),
        };
        if current_version != expected_version {
            return Ok(false);
        }
        state.check_batch(&batch)?;
        state.nodes.insert(key, Node::Clock(updated.clone()));
        state.apply(batch);
        Ok(true)
    }

    fn claim_unanchored(
        &self,
        run_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> EvidenceResult<Vec<Event>> {
        let mut state = self.state.safe_write()?;
        let mut claimable: Vec<Event> = state
            .events
            .values()
            .filter(|e| e.recorded_at <= cutoff && !state.claims.contains_key(&e.event_id))
            .cloned()
            .collect();
        claimable.sort_by(|a, b| claim_order(a).cmp(&claim_order(b)));
        claimable.truncate(limit);
        for event in &claimable {
            state
                .claims
                .insert(event.event_id.clone(), run_id.to_string());
        }
        Ok(claimable)
    }

    fn release_claims(&self, run_id: &str) -> EvidenceResult<usize> {
        let mut state = self.state.safe_write()?;
        let before = state.claims.len();
        state.claims.retain(|_, owner| owner != run_id);
        Ok(before - state.claims.len())
    }

    fn save_anchor(&self, anchor: &MerkleAnchor) -> EvidenceResult<()> {
        let mut state = self.state.safe_write()?;
        check_anchor_update(state.anchors.get(&anchor.anchor_id), anchor)?;
        state
            .anchors
            .insert(anchor.anchor_id.clone(), anchor.clone());
        Ok(())
    }

    fn get_anchor(&self, anchor_id: &str) -> EvidenceResult<Option<MerkleAnchor>> {
        Ok(self.state.safe_read()?.anchors.get(anchor_id).cloned())
    }

    fn anchors(&self) -> EvidenceResult<Vec<MerkleAnchor>> {
        let mut anchors: Vec<MerkleAnchor> =
            self.state.safe_read()?.anchors.values().cloned().collect();
        anchors.sort_by(|a, b| (a.created_at, &a.anchor_id).cmp(&(b.created_at, &b.anchor_id)));
        Ok(anchors)
    }

    fn save_timestamp(&self, timestamp: &TsaTimestamp) -> EvidenceResult<()> {
        self.state.safe_write()?.timestamps.push(timestamp.clone());
        Ok(())
    }

    fn timestamps_for(&self, anchor_id: &str) -> EvidenceResult<Vec<TsaTimestamp>> {
        Ok(self
            .state
            .safe_read()?
            .timestamps
            .iter()
            .filter(|t| t.anchor_id.as_deref() == Some(anchor_id))
            .cloned()
            .collect())
    }

    fn mark_degraded(&self, source_system: &str, reason: &str) -> EvidenceResult<()> {
        self.state
            .safe_write()?
            .degraded
            .insert(source_system.to_string(), reason.to_string());
        Ok(())
    }

    fn degraded_streams(&self) -> EvidenceResult<BTreeMap<String, String>> {
        Ok(self.state.safe_read()?.degraded.clone())
    }
}
