//! Merkle Anchor Service
//!
//! A run claims every unanchored event recorded up to its cutoff, commits to
//! their payload hashes with one Merkle root, persists the anchor as PENDING
//! and only then asks the witness providers to timestamp the root. Claims
//! are exclusive in the store, so overlapping runs anchor disjoint sets.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::alerts::{Alert, AlertKind, AlertLevel, AlertSink};
use crate::canonicalize::payload_hash;
use crate::config::AnchorSettings;
use crate::errors::{EvidenceError, EvidenceResult};
use crate::graph_store::GraphStore;
use crate::merkle::{self, InclusionProof};
use crate::model::{Event, LeafRef, MerkleAnchor, TsaTimestamp, VerificationStatus};
use crate::time_source::TimeSource;
use crate::tsa::TimestampAuthority;
use crate::witness_registry::WitnessRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampCheck {
    pub timestamp_id: String,
    pub provider: String,
    pub valid: Option<bool>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnchorVerification {
    pub anchor_id: String,
    pub valid: bool,
    pub root_matches: bool,
    pub recomputed_root: Option<String>,
    pub missing_events: Vec<String>,
    pub timestamps: Vec<TimestampCheck>,
}

pub struct AnchorService {
    store: Arc<dyn GraphStore>,
    witnesses: Arc<WitnessRegistry>,
    alerts: Arc<dyn AlertSink>,
    time: Arc<dyn TimeSource>,
    settings: AnchorSettings,
}

impl AnchorService {
    pub fn new(
        store: Arc<dyn GraphStore>,
        witnesses: Arc<WitnessRegistry>,
        alerts: Arc<dyn AlertSink>,
        time: Arc<dyn TimeSource>,
        settings: AnchorSettings,
    ) -> Self {
        Self {
            store,
            witnesses,
            alerts,
            time,
            settings,
        }
    }

    /// Claim, commit and persist one PENDING anchor. `None` when there is
    /// nothing new to anchor.
    pub fn seal_period(&self, cutoff: DateTime<Utc>) -> EvidenceResult<Option<MerkleAnchor>> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let claimed =
            self.store
                .claim_unanchored(&run_id, cutoff, self.settings.max_events_per_anchor)?;
        if claimed.is_empty() {
            debug!("no unanchored events");
            return Ok(None);
        }

        // A full claim may have left later events behind; the period then
        // ends at the last event it holds so the next one starts there.
        let period_end = if claimed.len() >= self.settings.max_events_per_anchor {
            claimed.iter().map(|e| e.recorded_at).max().unwrap_or(cutoff)
        } else {
            cutoff
        };
        let sealed = self
            .build_anchor(&run_id, claimed, period_end)
            .and_then(|anchor| self.store.save_anchor(&anchor).map(|()| anchor));
        match sealed {
            Ok(anchor) => {
                info!(
                    anchor_id = %anchor.anchor_id,
                    events = anchor.event_count,
                    root = %anchor.merkle_root,
                    "anchor sealed"
                );
                Ok(Some(anchor))
            }
            Err(e) => {
                error!(run_id = %run_id, error = %e, "anchor run failed, releasing claims");
                self.store.release_claims(&run_id)?;
                Err(e)
            }
        }
    }

    fn build_anchor(
        &self,
        anchor_id: &str,
        mut events: Vec<Event>,
        period_end: DateTime<Utc>,
    ) -> EvidenceResult<MerkleAnchor> {
        events.sort_by(|a, b| {
            (&a.source_system, a.sequence_number).cmp(&(&b.source_system, b.sequence_number))
        });
        let leaves = merkle::leaves_from_payload_hashes(events.iter().map(|e| e.payload_hash.as_str()))?;
        let root = hex::encode(merkle::merkle_root(&leaves));

        let previous_end = self
            .store
            .anchors()?
            .into_iter()
            .map(|a| a.period_end)
            .max();
        let earliest = events
            .iter()
            .map(|e| e.recorded_at)
            .min()
            .unwrap_or(period_end);
        let period_start = previous_end.map_or(earliest, |end| end.min(earliest));

        Ok(MerkleAnchor {
            anchor_id: anchor_id.to_string(),
            period_start,
            period_end,
            event_count: events.len(),
            merkle_root: root,
            leaves: events
                .iter()
                .map(|e| LeafRef {
                    event_id: e.event_id.clone(),
                    source_system: e.source_system.clone(),
                    sequence_number: e.sequence_number,
                    payload_hash: e.payload_hash.clone(),
                })
                .collect(),
            verification_status: VerificationStatus::Pending,
            witness_attempts: 0,
            created_at: self.time.now(),
            verified_at: None,
        })
    }

    /// Submit an anchor's root to every provider. At least one success
    /// verifies it; none leaves it PENDING and raises a degraded alert.
    pub async fn witness(&self, anchor: MerkleAnchor) -> EvidenceResult<MerkleAnchor> {
        if anchor.verification_status == VerificationStatus::Verified {
            return Ok(anchor);
        }
        let providers = self.witnesses.providers()?;
        if providers.is_empty() {
            debug!(anchor_id = %anchor.anchor_id, "no witness providers configured");
            return Ok(anchor);
        }

        let mut anchor = anchor;
        let mut witnessed = 0usize;
        for provider in providers {
            let (result, attempts) = self.timestamp_with_retry(provider.clone(), &anchor.merkle_root).await;
            anchor.witness_attempts += attempts;
            match result {
                Ok(mut timestamp) => {
                    timestamp.anchor_id = Some(anchor.anchor_id.clone());
                    self.store.save_timestamp(&timestamp)?;
                    witnessed += 1;
                    info!(anchor_id = %anchor.anchor_id, provider = provider.id(), "anchor witnessed");
                }
                Err(e) => {
                    warn!(anchor_id = %anchor.anchor_id, provider = provider.id(), error = %e, "witness failed");
                }
            }
        }

        if witnessed > 0 {
            anchor.verification_status = VerificationStatus::Verified;
            anchor.verified_at = Some(self.time.now());
        }
        self.store.save_anchor(&anchor)?;

        if witnessed == 0 {
            self.alerts.emit(Alert::new(
                AlertLevel::Warning,
                AlertKind::WitnessDegraded,
                &anchor.anchor_id,
                format!(
                    "anchor {} still PENDING after {} witness attempts",
                    anchor.anchor_id, anchor.witness_attempts
                ),
                self.time.now(),
            ));
        }
        Ok(anchor)
    }

    async fn timestamp_with_retry(
        &self,
        provider: Arc<dyn TimestampAuthority>,
        root: &str,
    ) -> (EvidenceResult<TsaTimestamp>, u32) {
        let retry = &self.settings.retry;
        let mut last_error = EvidenceError::witness_unavailable(provider.id(), "not attempted");

        for attempt in 1..=retry.max_attempts {
            let call_provider = provider.clone();
            let hash = root.to_string();
            let call = tokio::task::spawn_blocking(move || call_provider.timestamp(&hash));

            let result = match tokio::time::timeout(retry.call_timeout(), call).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(EvidenceError::internal(format!("witness task failed: {join}"))),
                Err(_) => Err(EvidenceError::witness_unavailable(
                    provider.id(),
                    format!("no response within {}ms", retry.call_timeout_ms),
                )),
            };

            match result {
                Ok(timestamp) => return (Ok(timestamp), attempt),
                Err(e @ EvidenceError::Validation { .. }) => return (Err(e), attempt),
                Err(e) => {
                    debug!(provider = provider.id(), attempt, error = %e, "witness attempt failed");
                    last_error = e;
                    if attempt < retry.max_attempts {
                        tokio::time::sleep(retry.backoff_for(attempt)).await;
                    }
                }
            }
        }
        (Err(last_error), retry.max_attempts)
    }

    /// Seal whatever is new, witness it, then retry older PENDING anchors.
    pub async fn run_once(&self, cutoff: DateTime<Utc>) -> EvidenceResult<Option<MerkleAnchor>> {
        let sealed = match self.seal_period(cutoff)? {
            Some(anchor) => Some(self.witness(anchor).await?),
            None => None,
        };

        if !self.witnesses.is_empty() {
            let sealed_id = sealed.as_ref().map(|a| a.anchor_id.clone());
            for pending in self.pending_anchors()? {
                if Some(&pending.anchor_id) == sealed_id.as_ref() {
                    continue;
                }
                let anchor_id = pending.anchor_id.clone();
                if let Err(e) = self.witness(pending).await {
                    error!(anchor_id = %anchor_id, error = %e, "re-witnessing failed");
                }
            }
        }
        Ok(sealed)
    }

    pub async fn run_now(&self) -> EvidenceResult<Option<MerkleAnchor>> {
        self.run_once(self.time.now()).await
    }

    pub fn pending_anchors(&self) -> EvidenceResult<Vec<MerkleAnchor>> {
        Ok(self
            .store
            .anchors()?
            .into_iter()
            .filter(|a| a.verification_status == VerificationStatus::Pending)
            .collect())
    }

    pub fn get_anchor(&self, anchor_id: &str) -> EvidenceResult<MerkleAnchor> {
        self.store
            .get_anchor(anchor_id)?
            .ok_or_else(|| EvidenceError::not_found("anchor", anchor_id))
    }

    pub fn anchor_for_event(&self, event_id: &str) -> EvidenceResult<Option<MerkleAnchor>> {
        Ok(self
            .store
            .anchors()?
            .into_iter()
            .find(|a| a.leaves.iter().any(|l| l.event_id == event_id)))
    }

    pub fn inclusion_proof(&self, anchor_id: &str, event_id: &str) -> EvidenceResult<InclusionProof> {
        let anchor = self.get_anchor(anchor_id)?;
        let index = anchor
            .leaves
            .iter()
            .position(|l| l.event_id == event_id)
            .ok_or_else(|| EvidenceError::not_found("anchored event", event_id))?;
        let leaves =
            merkle::leaves_from_payload_hashes(anchor.leaves.iter().map(|l| l.payload_hash.as_str()))?;
        let path = merkle::inclusion_proof(&leaves, index)?;

        Ok(InclusionProof {
            anchor_id: anchor.anchor_id,
            event_id: event_id.to_string(),
            leaf_index: index,
            tree_size: leaves.len(),
            leaf_hash: hex::encode(leaves[index]),
            audit_path: path.iter().map(hex::encode).collect(),
            merkle_root: anchor.merkle_root,
        })
    }

    /// Recompute the root from the events as stored now and re-check each
    /// timestamp with its issuer.
    pub async fn verify_anchor(&self, anchor_id: &str) -> EvidenceResult<AnchorVerification> {
        let anchor = self.get_anchor(anchor_id)?;

        let mut missing_events = Vec::new();
        let mut hashes = Vec::with_capacity(anchor.leaves.len());
        for leaf in &anchor.leaves {
            match self.store.get_event(&leaf.event_id)? {
                Some(event) => hashes.push(payload_hash(&event.payload)?),
                None => missing_events.push(leaf.event_id.clone()),
            }
        }

        let recomputed_root = if missing_events.is_empty() {
            let leaves = merkle::leaves_from_payload_hashes(hashes.iter().map(String::as_str))?;
            Some(hex::encode(merkle::merkle_root(&leaves)))
        } else {
            None
        };
        let root_matches = recomputed_root.as_deref() == Some(anchor.merkle_root.as_str());

        let mut timestamps = Vec::new();
        for timestamp in self.store.timestamps_for(anchor_id)? {
            let witnesses = self.witnesses.clone();
            let checked = timestamp.clone();
            let outcome = tokio::task::spawn_blocking(move || witnesses.verify(&checked))
                .await
                .map_err(|e| EvidenceError::internal(format!("verification task failed: {e}")))?;
            let bound = timestamp.hashed_value == anchor.merkle_root;
            timestamps.push(match outcome {
                Ok(valid) => TimestampCheck {
                    timestamp_id: timestamp.timestamp_id,
                    provider: timestamp.tsa_provider,
                    valid: Some(valid && bound),
                    error: None,
                },
                Err(e) => TimestampCheck {
                    timestamp_id: timestamp.timestamp_id,
                    provider: timestamp.tsa_provider,
                    valid: None,
                    error: Some(e.to_string()),
                },
            });
        }

        let valid = root_matches && timestamps.iter().all(|t| t.valid != Some(false));
        if !valid {
            warn!(anchor_id, root_matches, "anchor verification failed");
        }
        Ok(AnchorVerification {
            anchor_id: anchor_id.to_string(),
            valid,
            root_matches,
            recomputed_root,
            missing_events,
            timestamps,
        })
    }
}
