//! RFC 6962 Merkle tree hashing.
//!
//! Leaves are domain separated from interior nodes (`0x00` / `0x01`) and an
//! `n`-leaf tree splits at the largest power of two strictly below `n`, so a
//! root built here can be checked by any Certificate Transparency style
//! verifier.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{EvidenceError, EvidenceResult};

pub type Hash32 = [u8; 32];

fn sha256(bytes: &[u8]) -> Hash32 {
    Sha256::digest(bytes).into()
}

pub fn leaf_hash(data: &[u8]) -> Hash32 {
    let mut buf = Vec::with_capacity(1 + data.len());
    buf.push(0x00);
    buf.extend_from_slice(data);
    sha256(&buf)
}

pub fn node_hash(left: &Hash32, right: &Hash32) -> Hash32 {
    let mut buf = [0u8; 65];
    buf[0] = 0x01;
    buf[1..33].copy_from_slice(left);
    buf[33..].copy_from_slice(right);
    sha256(&buf)
}

fn split_point(n: usize) -> usize {
    1usize << (usize::BITS - 1 - (n - 1).leading_zeros())
}

/// Root over already-hashed leaves. The empty tree hashes the empty string.
pub fn merkle_root(leaves: &[Hash32]) -> Hash32 {
    match leaves.len() {
        0 => sha256(b""),
        1 => leaves[0],
        n => {
            let k = split_point(n);
            node_hash(&merkle_root(&leaves[..k]), &merkle_root(&leaves[k..]))
        }
    }
}

/// Audit path for `index`, ordered leaf to root.
pub fn inclusion_proof(leaves: &[Hash32], index: usize) -> EvidenceResult<Vec<Hash32>> {
    if index >= leaves.len() {
        return Err(EvidenceError::not_found("leaf", index.to_string()));
    }
    Ok(audit_path(leaves, index))
}

fn audit_path(leaves: &[Hash32], index: usize) -> Vec<Hash32> {
    if leaves.len() <= 1 {
        return Vec::new();
    }
    let k = split_point(leaves.len());
    if index < k {
        let mut path = audit_path(&leaves[..k], index);
        path.push(merkle_root(&leaves[k..]));
        path
    } else {
        let mut path = audit_path(&leaves[k..], index - k);
        path.push(merkle_root(&leaves[..k]));
        path
    }
}

/// RFC 9162 section 2.1.3.2 inclusion verification.
pub fn verify_inclusion(
    leaf: &Hash32,
    index: usize,
    tree_size: usize,
    path: &[Hash32],
    root: &Hash32,
) -> bool {
    if index >= tree_size {
        return false;
    }
    let mut fnode = index;
    let mut snode = tree_size - 1;
    let mut hash = *leaf;

    for sibling in path {
        if snode == 0 {
            return false;
        }
        if fnode & 1 == 1 || fnode == snode {
            hash = node_hash(sibling, &hash);
            if fnode & 1 == 0 {
                while fnode & 1 == 0 && fnode != 0 {
                    fnode >>= 1;
                    snode >>= 1;
                }
            }
        } else {
            hash = node_hash(&hash, sibling);
        }
        fnode >>= 1;
        snode >>= 1;
    }
    snode == 0 && &hash == root
}

/// Decode a lowercase hex SHA-256 digest.
pub fn decode_digest(hex_digest: &str) -> EvidenceResult<Hash32> {
    let bytes = hex::decode(hex_digest)
        .map_err(|e| EvidenceError::validation("digest", format!("invalid hex: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| EvidenceError::validation("digest", "digest must be 32 bytes"))
}

/// Leaf hashes for a list of event payload hashes.
pub fn leaves_from_payload_hashes<'a, I>(hashes: I) -> EvidenceResult<Vec<Hash32>>
where
    I: IntoIterator<Item = &'a str>,
{
    hashes
        .into_iter()
        .map(|h| decode_digest(h).map(|d| leaf_hash(&d)))
        .collect()
}

/// Portable proof that one event is committed to by an anchor's root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionProof {
    pub anchor_id: String,
    pub event_id: String,
    pub leaf_index: usize,
    pub tree_size: usize,
    pub leaf_hash: String,
    pub audit_path: Vec<String>,
    pub merkle_root: String,
}

impl InclusionProof {
    pub fn verify(&self) -> bool {
        let decode = |h: &str| decode_digest(h).ok();
        let leaf = decode(self.leaf_hash.as_str());
        let root = decode(self.merkle_root.as_str());
        let (Some(leaf), Some(root)) = (leaf, root) else {
            return false;
        };
        let Some(path) = self
            .audit_path
            .iter()
            .map(|h| decode(h.as_str()))
            .collect::<Option<Vec<_>>>()
        else {
            return false;
        };
        verify_inclusion(&leaf, self.leaf_index, self.tree_size, &path, &root)
    }
}
