//! Witness Registry
//!
//! Holds the timestamp providers an anchor is submitted to. Providers are
//! built from configuration at startup and can be added in code; an empty
//! registry is valid and leaves anchors PENDING.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::info;

use crate::config::WitnessConfig;
use crate::errors::{EvidenceError, EvidenceResult, SafeReadLock, SafeWriteLock};
use crate::model::TsaTimestamp;
use crate::tsa::{HttpTimestampAuthority, LocalNotary, TimestampAuthority};

const DEFAULT_HTTP_TIMEOUT_MS: u64 = 5_000;

#[derive(Default)]
pub struct WitnessRegistry {
    providers: RwLock<BTreeMap<String, Arc<dyn TimestampAuthority>>>,
}

impl WitnessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build every configured provider. Relative notary key paths resolve
    /// against `data_dir`.
    pub fn from_config(witnesses: &[WitnessConfig], data_dir: &Path) -> EvidenceResult<Self> {
        let registry = Self::new();
        for witness in witnesses {
            let provider: Arc<dyn TimestampAuthority> = match witness {
                WitnessConfig::LocalNotary { id, key_path } => {
                    let path = Path::new(key_path);
                    let path = if path.is_absolute() {
                        path.to_path_buf()
                    } else {
                        data_dir.join(path)
                    };
                    Arc::new(LocalNotary::load_or_create(id.clone(), path)?)
                }
                WitnessConfig::Http {
                    id,
                    url,
                    verify_url,
                    timeout_ms,
                } => Arc::new(HttpTimestampAuthority::new(
                    id.clone(),
                    url.clone(),
                    verify_url.clone(),
                    Duration::from_millis(timeout_ms.unwrap_or(DEFAULT_HTTP_TIMEOUT_MS)),
                )),
            };
            registry.register(provider)?;
        }
        info!(count = witnesses.len(), "witness providers registered");
        Ok(registry)
    }

    pub fn register(&self, provider: Arc<dyn TimestampAuthority>) -> EvidenceResult<()> {
        let mut providers = self.providers.safe_write()?;
        let id = provider.id().to_string();
        if providers.contains_key(&id) {
            return Err(EvidenceError::validation(
                "witness",
                format!("witness {id} already registered"),
            ));
        }
        providers.insert(id, provider);
        Ok(())
    }

    pub fn get(&self, id: &str) -> EvidenceResult<Option<Arc<dyn TimestampAuthority>>> {
        Ok(self.providers.safe_read()?.get(id).cloned())
    }

    /// Providers ordered by id.
    pub fn providers(&self) -> EvidenceResult<Vec<Arc<dyn TimestampAuthority>>> {
        Ok(self.providers.safe_read()?.values().cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.providers
            .read()
            .map(|p| p.is_empty())
            .unwrap_or(true)
    }

    /// Re-check a stored timestamp with the provider that issued it.
    pub fn verify(&self, timestamp: &TsaTimestamp) -> EvidenceResult<bool> {
        match self.get(&timestamp.tsa_provider)? {
            Some(provider) => provider.verify(timestamp),
            None => Err(EvidenceError::witness_unavailable(
                &timestamp.tsa_provider,
                "provider is not registered",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonicalize::sha256_hex;

    #[test]
    fn test_builds_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = WitnessRegistry::from_config(
            &[
                WitnessConfig::LocalNotary {
                    id: "notary".into(),
                    key_path: "keys/notary.json".into(),
                },
                WitnessConfig::Http {
                    id: "remote".into(),
                    url: "http://127.0.0.1:9/ts".into(),
                    verify_url: None,
                    timeout_ms: Some(100),
                },
            ],
            dir.path(),
        )
        .unwrap();

        assert!(dir.path().join("keys/notary.json").exists());
        let ids: Vec<String> = registry
            .providers()
            .unwrap()
            .iter()
            .map(|p| p.id().to_string())
            .collect();
        assert_eq!(ids, vec!["notary", "remote"]);
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let registry = WitnessRegistry::new();
        registry
            .register(Arc::new(LocalNotary::generate("n").unwrap()))
            .unwrap();
        assert!(registry
            .register(Arc::new(LocalNotary::generate("n").unwrap()))
            .is_err());
    }

    #[test]
    fn test_verify_dispatches_by_provider() {
        let registry = WitnessRegistry::new();
        assert!(registry.is_empty());
        let notary = Arc::new(LocalNotary::generate("n").unwrap());
        registry.register(notary.clone()).unwrap();

        let ts = notary.timestamp(&sha256_hex(b"root")).unwrap();
        assert!(registry.verify(&ts).unwrap());

        let mut unknown = ts;
        unknown.tsa_provider = "ghost".into();
        assert!(registry.verify(&unknown).is_err());
    }
}
