//! Timestamp Authority Client
//!
//! A witness provider attests that a hash existed at a point in time. The
//! contract is synchronous and may block on the network; the anchor service
//! runs it on tokio's blocking pool with a deadline so ingestion never waits
//! on it.

use base64::{engine::general_purpose::STANDARD as B64, Engine as _};
use chrono::{DateTime, SecondsFormat, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use crate::canonicalize::is_hash_hex;
use crate::errors::{EvidenceError, EvidenceResult};
use crate::model::TsaTimestamp;

pub const LOCAL_NOTARY_ALGORITHM: &str = "ED25519-SHA256";

pub trait TimestampAuthority: Send + Sync {
    fn id(&self) -> &str;

    /// Obtain a proof that `hash` existed now.
    fn timestamp(&self, hash: &str) -> EvidenceResult<TsaTimestamp>;

    /// Check a proof previously issued by this provider.
    fn verify(&self, timestamp: &TsaTimestamp) -> EvidenceResult<bool>;
}

fn require_digest(hash: &str) -> EvidenceResult<()> {
    if !is_hash_hex(hash) {
        return Err(EvidenceError::validation(
            "hash",
            "expected a lowercase 64 character SHA-256 digest",
        ));
    }
    Ok(())
}

/// On-disk notary key.
#[derive(Serialize, Deserialize)]
struct NotaryKeyFile {
    private_key_b64: String,
    public_key_b64: String,
    created_at: String,
}

/// Ed25519 notary held by this deployment. Signs `hash|tsa_time`.
pub struct LocalNotary {
    id: String,
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl LocalNotary {
    pub fn new(id: impl Into<String>, signing_key: SigningKey) -> Self {
        let verifying_key = signing_key.verifying_key();
        Self {
            id: id.into(),
            signing_key,
            verifying_key,
        }
    }

    pub fn generate(id: impl Into<String>) -> EvidenceResult<Self> {
        let mut seed = [0u8; 32];
        getrandom::fill(&mut seed)
            .map_err(|e| EvidenceError::internal(format!("entropy unavailable: {e}")))?;
        Ok(Self::new(id, SigningKey::from_bytes(&seed)))
    }

    /// Load the key at `path`, creating and saving a fresh one if absent.
    pub fn load_or_create(id: impl Into<String>, path: impl AsRef<Path>) -> EvidenceResult<Self> {
        let path = path.as_ref();
        let id = id.into();
        if path.exists() {
            let raw = fs::read_to_string(path)
                .map_err(|e| EvidenceError::io(format!("reading {}", path.display()), e))?;
            let file: NotaryKeyFile = serde_json::from_str(&raw)?;
            let bytes = B64
                .decode(&file.private_key_b64)
                .map_err(|e| EvidenceError::config(format!("notary key is not base64: {e}")))?;
            let seed: [u8; 32] = bytes
                .try_into()
                .map_err(|_| EvidenceError::config("notary key must be 32 bytes"))?;
            debug!(witness = %id, path = %path.display(), "loaded notary key");
            return Ok(Self::new(id, SigningKey::from_bytes(&seed)));
        }

        let notary = Self::generate(id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| EvidenceError::io(format!("creating {}", parent.display()), e))?;
        }
        let file = NotaryKeyFile {
            private_key_b64: B64.encode(notary.signing_key.to_bytes()),
            public_key_b64: notary.public_key_b64(),
            created_at: Utc::now().to_rfc3339(),
        };
        fs::write(path, serde_json::to_string_pretty(&file)?)
            .map_err(|e| EvidenceError::io(format!("writing {}", path.display()), e))?;
        info!(witness = %notary.id, path = %path.display(), "created notary key");
        Ok(notary)
    }

    pub fn public_key_b64(&self) -> String {
        B64.encode(self.verifying_key.to_bytes())
    }

    fn message(hash: &str, at: &DateTime<Utc>) -> String {
        format!("{hash}|{}", at.to_rfc3339_opts(SecondsFormat::Micros, true))
    }
}

impl TimestampAuthority for LocalNotary {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self, hash: &str) -> EvidenceResult<TsaTimestamp> {
        require_digest(hash)?;
        let tsa_time = Utc::now();
        let signature = self.signing_key.sign(Self::message(hash, &tsa_time).as_bytes());
        Ok(TsaTimestamp {
            timestamp_id: uuid::Uuid::new_v4().to_string(),
            anchor_id: None,
            hashed_value: hash.to_string(),
            tsa_response: B64.encode(signature.to_bytes()),
            tsa_time,
            tsa_provider: self.id.clone(),
            tsa_algorithm: LOCAL_NOTARY_ALGORITHM.to_string(),
        })
    }

    fn verify(&self, timestamp: &TsaTimestamp) -> EvidenceResult<bool> {
        if timestamp.tsa_provider != self.id || timestamp.tsa_algorithm != LOCAL_NOTARY_ALGORITHM {
            return Ok(false);
        }
        let Ok(bytes) = B64.decode(&timestamp.tsa_response) else {
            return Ok(false);
        };
        let Ok(signature) = Signature::from_slice(&bytes) else {
            return Ok(false);
        };
        let message = Self::message(&timestamp.hashed_value, &timestamp.tsa_time);
        Ok(self
            .verifying_key
            .verify(message.as_bytes(), &signature)
            .is_ok())
    }
}

#[derive(Serialize)]
struct HttpTimestampRequest<'a> {
    hash: &'a str,
    algorithm: &'a str,
}

#[derive(Deserialize)]
struct HttpTimestampResponse {
    token: String,
    time: DateTime<Utc>,
    #[serde(default)]
    algorithm: Option<String>,
}

#[derive(Serialize)]
struct HttpVerifyRequest<'a> {
    hash: &'a str,
    token: &'a str,
    time: DateTime<Utc>,
}

#[derive(Deserialize)]
struct HttpVerifyResponse {
    valid: bool,
}

/// Remote authority speaking a small JSON contract:
/// `POST url {hash, algorithm} -> {token, time, algorithm?}` and optionally
/// `POST verify_url {hash, token, time} -> {valid}`.
pub struct HttpTimestampAuthority {
    id: String,
    url: String,
    verify_url: Option<String>,
    timeout: Duration,
}

impl HttpTimestampAuthority {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        verify_url: Option<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            verify_url,
            timeout,
        }
    }

    fn client(&self) -> EvidenceResult<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| self.unavailable(e))
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> EvidenceError {
        EvidenceError::witness_unavailable(&self.id, err.to_string())
    }
}

impl TimestampAuthority for HttpTimestampAuthority {
    fn id(&self) -> &str {
        &self.id
    }

    fn timestamp(&self, hash: &str) -> EvidenceResult<TsaTimestamp> {
        require_digest(hash)?;
        let response: HttpTimestampResponse = self
            .client()?
            .post(&self.url)
            .json(&HttpTimestampRequest {
                hash,
                algorithm: "SHA-256",
            })
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| self.unavailable(e))?;

        Ok(TsaTimestamp {
            timestamp_id: uuid::Uuid::new_v4().to_string(),
            anchor_id: None,
            hashed_value: hash.to_string(),
            tsa_response: response.token,
            tsa_time: response.time,
            tsa_provider: self.id.clone(),
            tsa_algorithm: response.algorithm.unwrap_or_else(|| "SHA-256".to_string()),
        })
    }

    fn verify(&self, timestamp: &TsaTimestamp) -> EvidenceResult<bool> {
        let Some(verify_url) = &self.verify_url else {
            return Err(self.unavailable("provider exposes no verification endpoint"));
        };
        let response: HttpVerifyResponse = self
            .client()?
            .post(verify_url)
            .json(&HttpVerifyRequest {
                hash: &timestamp.hashed_value,
                token: &timestamp.tsa_response,
                time: timestamp.tsa_time,
            })
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.json())
            .map_err(|e| self.unavailable(e))?;
        Ok(response.valid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalize::sha256_hex;
    use axum::{routing::post, Json, Router};
    use serde_json::{json, Value};

    #[test]
    fn test_notary_round_trip_and_tamper() {
        let notary = LocalNotary::generate("notary").unwrap();
        let hash = sha256_hex(b"anchor root");
        let ts = notary.timestamp(&hash).unwrap();
        assert_eq!(ts.tsa_algorithm, LOCAL_NOTARY_ALGORITHM);
        assert!(notary.verify(&ts).unwrap());

        let mut moved = ts.clone();
        moved.tsa_time += chrono::Duration::seconds(1);
        assert!(!notary.verify(&moved).unwrap());

        let mut other = ts;
        other.hashed_value = sha256_hex(b"other root");
        assert!(!notary.verify(&other).unwrap());
    }

    #[test]
    fn test_notary_rejects_non_digest() {
        let notary = LocalNotary::generate("notary").unwrap();
        assert!(matches!(
            notary.timestamp("not-a-hash"),
            Err(EvidenceError::Validation { .. })
        ));
    }

    #[test]
    fn test_notary_key_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys/notary.json");
        let first = LocalNotary::load_or_create("notary", &path).unwrap();
        let second = LocalNotary::load_or_create("notary", &path).unwrap();
        assert_eq!(first.public_key_b64(), second.public_key_b64());

        let ts = first.timestamp(&sha256_hex(b"x")).unwrap();
        assert!(second.verify(&ts).unwrap());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_http_authority_contract() {
        let app = Router::new()
            .route(
                "/timestamp",
                post(|Json(body): Json<Value>| async move {
                    Json(json!({
                        "token": format!("tok-{}", body["hash"].as_str().unwrap_or_default()),
                        "time": "2026-01-02T03:04:05Z",
                    }))
                }),
            )
            .route(
                "/verify",
                post(|Json(body): Json<Value>| async move {
                    let expected = format!("tok-{}", body["hash"].as_str().unwrap_or_default());
                    let valid = body["token"].as_str() == Some(expected.as_str());
                    Json(json!({ "valid": valid }))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let hash = sha256_hex(b"root");
        let ts = tokio::task::spawn_blocking(move || {
            let tsa = HttpTimestampAuthority::new(
                "remote",
                format!("http://{addr}/timestamp"),
                Some(format!("http://{addr}/verify")),
                Duration::from_secs(5),
            );
            let ts = tsa.timestamp(&hash).unwrap();
            assert!(tsa.verify(&ts).unwrap());
            ts
        })
        .await
        .unwrap();
        assert_eq!(ts.tsa_provider, "remote");
        assert_eq!(ts.tsa_algorithm, "SHA-256");
    }

    #[tokio::test]
    async fn test_unreachable_authority_is_unavailable() {
        let result = tokio::task::spawn_blocking(|| {
            HttpTimestampAuthority::new(
                "down",
                "http://127.0.0.1:9/timestamp",
                None,
                Duration::from_millis(500),
            )
            .timestamp(&sha256_hex(b"root"))
        })
        .await
        .unwrap();
        assert!(matches!(
            result,
            Err(EvidenceError::WitnessUnavailable { .. })
        ));
    }
}
