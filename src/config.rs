//! Layered configuration
//!
//! Defaults are serialized into figment first, then `evidence.toml` (or the
//! file named by `EVIDENCE_CONFIG`) is merged over them, then `EVIDENCE_*`
//! environment variables with `__` separating nested keys, e.g.
//! `EVIDENCE_SERVER__PORT=9090`.
//!
//! Clock types and trigger rules are data. Adding a regulation means adding
//! table entries, not code.

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use crate::clock_engine::MAX_DEADLINE_HOURS;
use crate::errors::{EvidenceError, EvidenceResult};
use crate::model::Event;

pub const DEFAULT_CONFIG_FILE: &str = "evidence.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sled,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Timing rules for one class of regulatory clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClockTypeConfig {
    pub regulation: String,
    pub article: String,
    pub default_deadline_hours: f64,
    pub warning_threshold_hours: f64,
}

/// Maps an ingested event to the clock it starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRule {
    /// Exact type, or `PREFIX.*` for a whole branch of the hierarchy.
    pub event_type: String,
    /// Regulation tag the event must carry. Any event matches when absent.
    #[serde(default)]
    pub regulation: Option<String>,
    pub clock_type: String,
    #[serde(default)]
    pub article: Option<String>,
    #[serde(default)]
    pub deadline_hours: Option<f64>,
}

impl TriggerRule {
    pub fn matches(&self, event: &Event) -> bool {
        let type_matches = match self.event_type.strip_suffix(".*") {
            Some(prefix) => event
                .event_type
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('.')),
            None => event.event_type == self.event_type,
        };
        type_matches
            && self
                .regulation
                .as_deref()
                .is_none_or(|tag| event.has_tag(tag))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockSettings {
    pub tick_interval_secs: u64,
    pub types: BTreeMap<String, ClockTypeConfig>,
    pub triggers: Vec<TriggerRule>,
}

impl ClockSettings {
    pub fn clock_type(&self, clock_type: &str) -> EvidenceResult<&ClockTypeConfig> {
        self.types.get(clock_type).ok_or_else(|| {
            EvidenceError::validation("clock_type", format!("unknown clock type '{clock_type}'"))
        })
    }
}

impl Default for ClockSettings {
    fn default() -> Self {
        let mut types = BTreeMap::new();
        let mut add = |name: &str, regulation: &str, article: &str, deadline: f64, warn: f64| {
            types.insert(
                name.to_string(),
                ClockTypeConfig {
                    regulation: regulation.to_string(),
                    article: article.to_string(),
                    default_deadline_hours: deadline,
                    warning_threshold_hours: warn,
                },
            );
        };
        add("GDPR_72H", "GDPR", "Art. 33", 72.0, 12.0);
        add("NIS2_24H", "NIS2", "Art. 23", 24.0, 4.0);
        add("DORA_4H", "DORA", "Art. 19", 4.0, 1.0);
        add("DSAR_30D", "GDPR", "Art. 12", 720.0, 72.0);

        let rule = |event_type: &str, regulation: &str, clock_type: &str| TriggerRule {
            event_type: event_type.to_string(),
            regulation: Some(regulation.to_string()),
            clock_type: clock_type.to_string(),
            article: None,
            deadline_hours: None,
        };
        Self {
            tick_interval_secs: 60,
            types,
            triggers: vec![
                rule("BREACH.DETECTED", "GDPR", "GDPR_72H"),
                rule("INCIDENT.MAJOR", "DORA", "DORA_4H"),
                rule("INCIDENT.SIGNIFICANT", "NIS2", "NIS2_24H"),
                rule("DSAR.RECEIVED", "GDPR", "DSAR_30D"),
            ],
        }
    }
}

/// Backoff and timeout bounds for witness calls.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub call_timeout_ms: u64,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(factor)
                .min(self.max_backoff_ms),
        )
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            call_timeout_ms: 5_000,
        }
    }
}

/// Periodic chain validation and gap detection over every stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSettings {
    pub audit_interval_secs: u64,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            audit_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnchorSettings {
    pub interval_secs: u64,
    pub max_events_per_anchor: usize,
    pub retry: RetryPolicy,
}

impl Default for AnchorSettings {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            max_events_per_anchor: 10_000,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WitnessConfig {
    LocalNotary {
        id: String,
        key_path: String,
    },
    Http {
        id: String,
        url: String,
        #[serde(default)]
        verify_url: Option<String>,
        #[serde(default)]
        timeout_ms: Option<u64>,
    },
}

impl WitnessConfig {
    pub fn id(&self) -> &str {
        match self {
            WitnessConfig::LocalNotary { id, .. } | WitnessConfig::Http { id, .. } => id,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueriesConfig {
    #[serde(default)]
    pub catalog_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceConfig {
    pub data_dir: String,
    pub store: StoreBackend,
    pub log: LogConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub ledger: LedgerSettings,
    pub clock: ClockSettings,
    pub anchor: AnchorSettings,
    #[serde(default)]
    pub witnesses: Vec<WitnessConfig>,
    #[serde(default)]
    pub queries: QueriesConfig,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            data_dir: "data".to_string(),
            store: StoreBackend::Sled,
            log: LogConfig {
                level: "info".to_string(),
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            ledger: LedgerSettings::default(),
            clock: ClockSettings::default(),
            anchor: AnchorSettings::default(),
            witnesses: Vec::new(),
            queries: QueriesConfig::default(),
        }
    }
}

impl EvidenceConfig {
    /// Load defaults, then the TOML file, then environment overrides.
    pub fn load(path: Option<&str>) -> EvidenceResult<Self> {
        let path = path
            .map(str::to_string)
            .or_else(|| std::env::var("EVIDENCE_CONFIG").ok())
            .unwrap_or_else(|| DEFAULT_CONFIG_FILE.to_string());

        let config: EvidenceConfig = Figment::from(Serialized::defaults(EvidenceConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("EVIDENCE_").ignore(&["CONFIG"]).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with an inline TOML document.
    pub fn from_toml_str(toml: &str) -> EvidenceResult<Self> {
        let config: EvidenceConfig = Figment::from(Serialized::defaults(EvidenceConfig::default()))
            .merge(Toml::string(toml))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EvidenceResult<()> {
        if self.clock.tick_interval_secs == 0 {
            return Err(EvidenceError::config("clock.tick_interval_secs must be positive"));
        }
        if self.ledger.audit_interval_secs == 0 {
            return Err(EvidenceError::config("ledger.audit_interval_secs must be positive"));
        }
        if self.anchor.interval_secs == 0 {
            return Err(EvidenceError::config("anchor.interval_secs must be positive"));
        }
        if self.anchor.max_events_per_anchor == 0 {
            return Err(EvidenceError::config(
                "anchor.max_events_per_anchor must be positive",
            ));
        }
        if self.anchor.retry.max_attempts == 0 {
            return Err(EvidenceError::config("anchor.retry.max_attempts must be at least 1"));
        }

        for (name, clock_type) in &self.clock.types {
            if !(clock_type.default_deadline_hours > 0.0
                && clock_type.default_deadline_hours <= MAX_DEADLINE_HOURS)
            {
                return Err(EvidenceError::config(format!(
                    "clock type {name}: default_deadline_hours must be in (0, {MAX_DEADLINE_HOURS}]"
                )));
            }
            if clock_type.warning_threshold_hours <= 0.0
                || clock_type.warning_threshold_hours >= clock_type.default_deadline_hours
            {
                return Err(EvidenceError::config(format!(
                    "clock type {name}: warning threshold must be positive and below the deadline"
                )));
            }
        }

        for rule in &self.clock.triggers {
            if !self.clock.types.contains_key(&rule.clock_type) {
                return Err(EvidenceError::config(format!(
                    "trigger for {} references unknown clock type {}",
                    rule.event_type, rule.clock_type
                )));
            }
            if rule
                .deadline_hours
                .is_some_and(|h| !(h > 0.0 && h <= MAX_DEADLINE_HOURS))
            {
                return Err(EvidenceError::config(format!(
                    "trigger for {}: deadline_hours must be in (0, {MAX_DEADLINE_HOURS}]",
                    rule.event_type
                )));
            }
        }

        let mut seen = HashSet::new();
        for witness in &self.witnesses {
            if !seen.insert(witness.id()) {
                return Err(EvidenceError::config(format!(
                    "duplicate witness id {}",
                    witness.id()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use chrono::Utc;
    use serde_json::json;

    fn event(event_type: &str, tags: &[&str]) -> Event {
        Event {
            event_id: "e".into(),
            occurred_at: Utc::now(),
            recorded_at: Utc::now(),
            sequence_number: 1,
            event_type: event_type.into(),
            severity: Severity::High,
            source_system: "soc".into(),
            regulatory_tags: tags.iter().map(|t| t.to_string()).collect(),
            articles: vec![],
            payload: json!({}),
            payload_hash: String::new(),
            previous_hash: String::new(),
            correlation_id: "c".into(),
            causation_id: None,
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = EvidenceConfig::default();
        config.validate().unwrap();
        let gdpr = config.clock.clock_type("GDPR_72H").unwrap();
        assert_eq!(gdpr.warning_threshold_hours, 12.0);
        assert_eq!(config.clock.clock_type("DORA_4H").unwrap().warning_threshold_hours, 1.0);
    }

    #[test]
    fn test_trigger_matching() {
        let exact = &ClockSettings::default().triggers[0];
        assert!(exact.matches(&event("BREACH.DETECTED", &["GDPR"])));
        assert!(!exact.matches(&event("BREACH.DETECTED", &["NIS2"])));
        assert!(!exact.matches(&event("BREACH.DETECTED.PARTIAL", &["GDPR"])));

        let wildcard = TriggerRule {
            event_type: "BREACH.*".into(),
            regulation: None,
            clock_type: "GDPR_72H".into(),
            article: None,
            deadline_hours: None,
        };
        assert!(wildcard.matches(&event("BREACH.CONFIRMED", &[])));
        assert!(!wildcard.matches(&event("BREACHES.X", &[])));
        assert!(!wildcard.matches(&event("BREACH", &[])));
    }

    #[test]
    fn test_toml_overrides_merge_with_defaults() {
        let config = EvidenceConfig::from_toml_str(
            r#"
            store = "memory"

            [clock.types.GDPR_72H]
            regulation = "GDPR"
            article = "Art. 33"
            default_deadline_hours = 72.0
            warning_threshold_hours = 24.0

            [[witnesses]]
            kind = "http"
            id = "tsa-eu"
            url = "https://tsa.example/timestamp"
            "#,
        )
        .unwrap();
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.clock.types["GDPR_72H"].warning_threshold_hours, 24.0);
        assert!(config.clock.types.contains_key("DORA_4H"));
        assert_eq!(config.witnesses[0].id(), "tsa-eu");
    }

    #[test]
    fn test_threshold_must_be_below_deadline() {
        let err = EvidenceConfig::from_toml_str(
            r#"
            [clock.types.DORA_4H]
            regulation = "DORA"
            article = "Art. 19"
            default_deadline_hours = 4.0
            warning_threshold_hours = 4.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EvidenceError::Config { .. }));
    }

    #[test]
    fn test_deadline_beyond_cap_rejected() {
        let err = EvidenceConfig::from_toml_str(
            r#"
            [clock.types.DORA_4H]
            regulation = "DORA"
            article = "Art. 19"
            default_deadline_hours = 1e12
            warning_threshold_hours = 1.0
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, EvidenceError::Config { .. }));
    }

    #[test]
    fn test_unknown_trigger_clock_type_rejected() {
        let err = EvidenceConfig::from_toml_str(
            r#"
            [[clock.triggers]]
            event_type = "AUDIT.FAILED"
            clock_type = "SOX_5D"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("SOX_5D"));
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let retry = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: 100,
            max_backoff_ms: 350,
            call_timeout_ms: 1000,
        };
        assert_eq!(retry.backoff_for(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_for(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_for(3), Duration::from_millis(350));
    }
}
