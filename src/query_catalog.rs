//! Named compliance queries.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::errors::{EvidenceError, EvidenceResult};
use crate::query::ComplianceQuery;

const BUILTIN_CATALOG: &str = include_str!("../queries/builtin.toml");

#[derive(Debug, Default, Serialize, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    queries: Vec<ComplianceQuery>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryCatalog {
    queries: BTreeMap<String, ComplianceQuery>,
}

impl QueryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The queries shipped with the crate.
    pub fn builtin() -> EvidenceResult<Self> {
        Self::from_toml_str(BUILTIN_CATALOG)
    }

    pub fn from_toml_str(toml: &str) -> EvidenceResult<Self> {
        let file: CatalogFile = toml::from_str(toml)
            .map_err(|e| EvidenceError::config(format!("invalid query catalog: {e}")))?;
        let mut catalog = Self::new();
        for query in file.queries {
            catalog.register(query)?;
        }
        Ok(catalog)
    }

    pub fn load(path: &Path) -> EvidenceResult<Self> {
        let raw = fs::read_to_string(path).map_err(|e| EvidenceError::io("read query catalog", e))?;
        let catalog = Self::from_toml_str(&raw)?;
        info!(path = %path.display(), queries = catalog.len(), "query catalog loaded");
        Ok(catalog)
    }

    /// Add a new query. Ids are unique within one catalog.
    pub fn register(&mut self, query: ComplianceQuery) -> EvidenceResult<()> {
        query.validate()?;
        if self.queries.contains_key(&query.query_id) {
            return Err(EvidenceError::validation(
                "query_id",
                format!("query {} already registered", query.query_id),
            ));
        }
        self.queries.insert(query.query_id.clone(), query);
        Ok(())
    }

    /// Merge `other` over this catalog; its definitions win on id clashes.
    pub fn overlay(&mut self, other: QueryCatalog) {
        self.queries.extend(other.queries);
    }

    pub fn get(&self, query_id: &str) -> Option<&ComplianceQuery> {
        self.queries.get(query_id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.queries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }
}
