//! Sled-backed Graph Store.
//!
//! Everything lives in one tree so a write set (event, head, nodes, edges)
//! commits in a single sled transaction. Key layout:
//!
//! | prefix                | value              |
//! |-----------------------|--------------------|
//! | `e/{source}\0{seq}`   | sealed event       |
//! | `ei/{event_id}`       | event key          |
//! | `h/{source}`          | stream head        |
//! | `n/{KIND}/{id}`       | node               |
//! | `g/{edge_id}`         | edge               |
//! | `c/{event_id}`        | claiming run id    |
//! | `a/{anchor_id}`       | merkle anchor      |
//! | `t/{anchor}/{ts_id}`  | tsa timestamp      |
//! | `d/{source}`          | degraded reason    |

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::errors::{EvidenceError, EvidenceResult};
use crate::graph_store::{
    check_anchor_update, check_extends_head, claim_order, sort_edges, EdgeFilter, GraphStore,
    StreamHead, WriteBatch,
};
use crate::model::{Clock, Edge, Event, MerkleAnchor, Node, NodeKind, NodeRef, TsaTimestamp};

const TREE_NAME: &str = "evidence_graph";

pub struct SledGraphStore {
    db: sled::Db,
    tree: sled::Tree,
}

fn event_key(source_system: &str, sequence: u64) -> String {
    format!("e/{source_system}\0{sequence:020}")
}

fn node_key(node: &NodeRef) -> String {
    format!("n/{}/{}", node.kind, node.id)
}

fn encode<T: Serialize>(value: &T) -> EvidenceResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| EvidenceError::serialization("sled encode", e))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> EvidenceResult<T> {
    serde_json::from_slice(bytes).map_err(|e| EvidenceError::serialization("sled decode", e))
}

fn abort<T>(result: EvidenceResult<T>) -> ConflictableTransactionResult<T, EvidenceError> {
    result.map_err(ConflictableTransactionError::Abort)
}

fn unwrap_tx<T>(result: Result<T, TransactionError<EvidenceError>>) -> EvidenceResult<T> {
    match result {
        Ok(value) => Ok(value),
        Err(TransactionError::Abort(e)) => Err(e),
        Err(TransactionError::Storage(e)) => Err(e.into()),
    }
}

/// Validate a batch against the transactional view and stage its writes.
fn stage_batch(
    tx: &TransactionalTree,
    batch: &WriteBatch,
) -> ConflictableTransactionResult<(), EvidenceError> {
    abort(batch.validate_shape())?;

    if let Some(event) = &batch.event {
        let head_key = format!("h/{}", event.source_system);
        let head: Option<StreamHead> = match tx.get(head_key.as_bytes())? {
            Some(bytes) => Some(abort(decode(&bytes))?),
            None => None,
        };
        abort(check_extends_head(head.as_ref(), event))?;

        let index_key = format!("ei/{}", event.event_id);
        if tx.get(index_key.as_bytes())?.is_some() {
            return Err(ConflictableTransactionError::Abort(EvidenceError::validation(
                "event_id",
                format!("event {} already exists", event.event_id),
            )));
        }

        let key = event_key(&event.source_system, event.sequence_number);
        let new_head = StreamHead {
            sequence: event.sequence_number,
            last_hash: event.payload_hash.clone(),
        };
        tx.insert(key.as_bytes(), abort(encode(event))?)?;
        tx.insert(index_key.as_bytes(), key.as_bytes())?;
        tx.insert(head_key.as_bytes(), abort(encode(&new_head))?)?;
    }

    for node in &batch.nodes {
        let key = node_key(&node.node_ref());
        if tx.get(key.as_bytes())?.is_some() {
            return Err(ConflictableTransactionError::Abort(EvidenceError::validation(
                "node",
                format!("{} already exists", node.node_ref()),
            )));
        }
        tx.insert(key.as_bytes(), abort(encode(node))?)?;
    }

    let introduced = batch.introduced_refs();
    for edge in &batch.edges {
        for end in [&edge.source, &edge.target] {
            if introduced.contains(end) {
                continue;
            }
            let key = match end.kind {
                NodeKind::Event => format!("ei/{}", end.id),
                _ => node_key(end),
            };
            if tx.get(key.as_bytes())?.is_none() {
                return Err(ConflictableTransactionError::Abort(EvidenceError::not_found(
                    "node",
                    end.to_string(),
                )));
            }
        }
        let key = format!("g/{}", edge.edge_id);
        tx.insert(key.as_bytes(), abort(encode(edge))?)?;
    }
    Ok(())
}

impl SledGraphStore {
    pub fn open(path: impl AsRef<Path>) -> EvidenceResult<Self> {
        let db = sled::open(path.as_ref())?;
        Self::from_db(db)
    }

    /// Store in a throwaway directory, removed on drop.
    pub fn temporary() -> EvidenceResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::from_db(db)
    }

    fn from_db(db: sled::Db) -> EvidenceResult<Self> {
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree })
    }

    pub fn flush(&self) -> EvidenceResult<()> {
        self.db.flush()?;
        Ok(())
    }

    fn get_decoded<T: DeserializeOwned>(&self, key: &str) -> EvidenceResult<Option<T>> {
        match self.tree.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn scan_decoded<T: DeserializeOwned>(&self, prefix: &str) -> EvidenceResult<Vec<T>> {
        let mut out = Vec::new();
        for item in self.tree.scan_prefix(prefix.as_bytes()) {
            let (_, bytes) = item?;
            out.push(decode(&bytes)?);
        }
        Ok(out)
    }
}

impl GraphStore for SledGraphStore {
    fn latest_sequence(&self, source_system: &str) -> EvidenceResult<Option<StreamHead>> {
        self.get_decoded(&format!("h/{source_system}"))
    }

    fn commit(&self, batch: WriteBatch) -> EvidenceResult<()> {
        unwrap_tx(self.tree.transaction(|tx| stage_batch(tx, &batch)))?;
        self.tree.flush()?;
        Ok(())
    }

    fn get_event(&self, event_id: &str) -> EvidenceResult<Option<Event>> {
        let Some(key) = self.tree.get(format!("ei/{event_id}").as_bytes())? else {
            return Ok(None);
        };
        match self.tree.get(&key)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn events(
        &self,
        source_system: Option<&str>,
        from_seq: Option<u64>,
        to_seq: Option<u64>,
    ) -> EvidenceResult<Vec<Event>> {
        let prefix = match source_system {
            Some(source) => format!("e/{source}\0"),
            None => "e/".to_string(),
        };
        let from = from_seq.unwrap_or(0);
        let to = to_seq.unwrap_or(u64::MAX);
        Ok(self
            .scan_decoded::<Event>(&prefix)?
            .into_iter()
            .filter(|e| e.sequence_number >= from && e.sequence_number <= to)
            .collect())
    }

    fn source_systems(&self) -> EvidenceResult<Vec<String>> {
        let mut sources = Vec::new();
        for item in self.tree.scan_prefix(b"h/") {
            let (key, _) = item?;
            let key = String::from_utf8_lossy(&key[2..]).into_owned();
            sources.push(key);
        }
        Ok(sources)
    }

    fn get_node(&self, node: &NodeRef) -> EvidenceResult<Option<Node>> {
        if node.kind == NodeKind::Event {
            return Ok(self.get_event(&node.id)?.map(Node::Event));
        }
        self.get_decoded(&node_key(node))
    }

    fn query_nodes(&self, kind: NodeKind) -> EvidenceResult<Vec<Node>> {
        if kind == NodeKind::Event {
            return Ok(self
                .events(None, None, None)?
                .into_iter()
                .map(Node::Event)
                .collect());
        }
        self.scan_decoded(&format!("n/{kind}/"))
    }

    fn query_edges(&self, filter: &EdgeFilter) -> EvidenceResult<Vec<Edge>> {
        let mut edges: Vec<Edge> = self
            .scan_decoded::<Edge>("g/")?
            .into_iter()
            .filter(|e| filter.matches(e))
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
        let key = node_key(&NodeRef::clock(&updated.clock_id));
        let replacement = encode(&Node::Clock(updated.clone()))?;
        let swapped = unwrap_tx(self.tree.transaction(|tx| {
            let current: Node = match tx.get(key.as_bytes())? {
                Some(bytes) => abort(decode(&bytes))?,
                None => {
                    return Err(ConflictableTransactionError::Abort(EvidenceError::not_found(
                        "clock",
                        &updated.clock_id,
                    )))
                }
            };
            let version = current.as_clock().map(|c| c.version);
            if version != Some(expected_version) {
                return Ok(false);
            }
            stage_batch(tx, &batch)?;
            tx.insert(key.as_bytes(), replacement.as_slice())?;
            Ok(true)
        }))?;
        if swapped {
            self.tree.flush()?;
        }
        Ok(swapped)
    }

    fn claim_unanchored(
        &self,
        run_id: &str,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> EvidenceResult<Vec<Event>> {
        let mut candidates = self.events(None, None, None)?;
        candidates.sort_by(|a, b| claim_order(a).cmp(&claim_order(b)));
        let mut claimed = Vec::new();
        for event in candidates {
            if claimed.len() >= limit {
                break;
            }
            if event.recorded_at > cutoff {
                continue;
            }
            let claim_key = format!("c/{}", event.event_id);
            let won = self
                .tree
                .compare_and_swap(claim_key.as_bytes(), None as Option<&[u8]>, Some(run_id.as_bytes()))?
                .is_ok();
            if won {
                claimed.push(event);
            }
        }
        debug!(run_id, claimed = claimed.len(), "claimed unanchored events");
        Ok(claimed)
    }

    fn release_claims(&self, run_id: &str) -> EvidenceResult<usize> {
        let mut released = 0;
        for item in self.tree.scan_prefix(b"c/") {
            let (key, owner) = item?;
            if owner.as_ref() == run_id.as_bytes() {
                self.tree.remove(key)?;
                released += 1;
            }
        }
        Ok(released)
    }

    fn save_anchor(&self, anchor: &MerkleAnchor) -> EvidenceResult<()> {
        let key = format!("a/{}", anchor.anchor_id);
        let bytes = encode(anchor)?;
        unwrap_tx(self.tree.transaction(|tx| {
            if let Some(existing) = tx.get(key.as_bytes())? {
                let existing: MerkleAnchor = abort(decode(&existing))?;
                abort(check_anchor_update(Some(&existing), anchor))?;
            }
            tx.insert(key.as_bytes(), bytes.as_slice())?;
            Ok(())
        }))?;
        self.tree.flush()?;
        Ok(())
    }

    fn get_anchor(&self, anchor_id: &str) -> EvidenceResult<Option<MerkleAnchor>> {
        self.get_decoded(&format!("a/{anchor_id}"))
    }

    fn anchors(&self) -> EvidenceResult<Vec<MerkleAnchor>> {
        let mut anchors: Vec<MerkleAnchor> = self.scan_decoded("a/")?;
        anchors.sort_by(|a, b| (a.created_at, &a.anchor_id).cmp(&(b.created_at, &b.anchor_id)));
        Ok(anchors)
    }

    fn save_timestamp(&self, timestamp: &TsaTimestamp) -> EvidenceResult<()> {
        let anchor = timestamp.anchor_id.as_deref().unwrap_or("-");
        let key = format!("t/{anchor}/{}", timestamp.timestamp_id);
        self.tree.insert(key.as_bytes(), encode(timestamp)?)?;
        Ok(())
    }

    fn timestamps_for(&self, anchor_id: &str) -> EvidenceResult<Vec<TsaTimestamp>> {
        self.scan_decoded(&format!("t/{anchor_id}/"))
    }

    fn mark_degraded(&self, source_system: &str, reason: &str) -> EvidenceResult<()> {
        self.tree
            .insert(format!("d/{source_system}").as_bytes(), reason.as_bytes())?;
        Ok(())
    }

    fn degraded_streams(&self) -> EvidenceResult<BTreeMap<String, String>> {
        let mut out = BTreeMap::new();
        for item in self.tree.scan_prefix(b"d/") {
            let (key, value) = item?;
            out.insert(
                String::from_utf8_lossy(&key[2..]).into_owned(),
                String::from_utf8_lossy(&value).into_owned(),
            );
        }
        Ok(out)
    }
}
