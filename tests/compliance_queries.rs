//! Compliance queries evaluated end to end through the runtime.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;

use evidence_graph::alerts::TracingAlertSink;
use evidence_graph::config::{EvidenceConfig, StoreBackend};
use evidence_graph::errors::{EvidenceError, EvidenceResult};
use evidence_graph::memory_store::MemoryGraphStore;
use evidence_graph::model::{ActorType, EventDraft, Node, Severity};
use evidence_graph::orchestrator::{CreateDecisionRequest, RegisterActorRequest};
use evidence_graph::query::{CriterionType, TimeRange, Verdict};
use evidence_graph::query_catalog::QueryCatalog;
use evidence_graph::query_engine::{CriterionContext, CriterionOutcome, CustomCriterion};
use evidence_graph::time_source::FixedTimeSource;
use evidence_graph::EvidenceRuntime;

const DORA_QUERY: &str = "DORA_ART19_MAJOR_INCIDENT_DECISION";

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 15, 14, 30, 0).unwrap()
}

fn runtime() -> (EvidenceRuntime, Arc<FixedTimeSource>) {
    let config = EvidenceConfig {
        store: StoreBackend::Memory,
        ..EvidenceConfig::default()
    };
    let time = Arc::new(FixedTimeSource::new(t0()));
    let rt = EvidenceRuntime::with_parts(
        config,
        Arc::new(MemoryGraphStore::new()),
        time.clone(),
        Arc::new(TracingAlertSink),
    )
    .expect("runtime");
    (rt, time)
}

fn hour_around_t0() -> TimeRange {
    TimeRange::new(t0() - Duration::hours(1), t0() + Duration::hours(1)).unwrap()
}

/// Ingest a major incident and register the on-call lead.
fn major_incident(rt: &EvidenceRuntime) -> String {
    rt.orchestrator
        .register_actor(RegisterActorRequest {
            actor_id: Some("ciso".into()),
            actor_type: ActorType::Human,
            name: "Chief Information Security Officer".into(),
            role: Some("CISO".into()),
        })
        .unwrap();
    rt.orchestrator
        .create_event(
            EventDraft::new(
                "INCIDENT.MAJOR",
                "payments",
                "OUTAGE-311",
                json!({"service": "card-auth", "clients_affected": 48000}),
            )
            .with_severity(Severity::High)
            .with_tags(["DORA"])
            .into(),
        )
        .unwrap()
        .event_id
}

fn classify(rt: &EvidenceRuntime, event_id: &str) -> String {
    rt.orchestrator
        .create_decision(CreateDecisionRequest {
            decision_type: "CLASSIFICATION".into(),
            regulation: "DORA".into(),
            outcome: "major ICT-related incident".into(),
            justification: "card authorisation unavailable for over 2h".into(),
            actor_id: "ciso".into(),
            related_event_id: event_id.into(),
            ai_assistance: None,
            approval_chain: Vec::new(),
            effectiveness_rating: None,
            control_ids: Vec::new(),
            artifact: None,
        })
        .unwrap()
        .decision_id
}

#[test]
fn decision_within_window_is_proven() {
    let (rt, time) = runtime();
    let event_id = major_incident(&rt);
    time.advance(Duration::hours(2));
    let decision_id = classify(&rt, &event_id);

    let result = rt
        .queries
        .run_compliance_query(DORA_QUERY, hour_around_t0())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Proven);
    assert_eq!(result.confidence_score, 1.0);
    assert!(result.gaps.is_empty());

    let timing = result
        .criteria
        .iter()
        .find(|c| c.criterion_type == CriterionType::Timing)
        .unwrap();
    assert!(timing.met);
    assert_eq!(timing.evidence.len(), 2);
    assert!(result
        .evidence
        .iter()
        .any(|e| e.alias == "decision" && e.node.id == decision_id));
}

#[test]
fn late_decision_is_partial() {
    let (rt, time) = runtime();
    let event_id = major_incident(&rt);
    time.advance(Duration::hours(6));
    classify(&rt, &event_id);

    let result = rt
        .queries
        .run_compliance_query(DORA_QUERY, hour_around_t0())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Partial);
    assert_eq!(result.confidence_score, 0.666667);
    assert_eq!(result.gaps.len(), 1);
    assert_eq!(result.gaps[0].criterion_id, "decided_within_4h");
    assert!(!result.gaps[0].recommendation.is_empty());
}

#[test]
fn incident_outside_range_is_not_proven() {
    let (rt, time) = runtime();
    let event_id = major_incident(&rt);
    time.advance(Duration::hours(1));
    classify(&rt, &event_id);

    let later = TimeRange::new(t0() + Duration::days(1), t0() + Duration::days(2)).unwrap();
    let result = rt.queries.run_compliance_query(DORA_QUERY, later).unwrap();
    assert_eq!(result.verdict, Verdict::NotProven);
    assert!(result.evidence.is_empty());
    assert_eq!(result.gaps.len(), 3);
}

#[test]
fn repeated_evaluation_is_identical() {
    let (rt, time) = runtime();
    let event_id = major_incident(&rt);
    time.advance(Duration::minutes(90));
    classify(&rt, &event_id);

    let first = rt
        .queries
        .run_compliance_query(DORA_QUERY, hour_around_t0())
        .unwrap();
    time.advance(Duration::days(3));
    let second = rt
        .queries
        .run_compliance_query(DORA_QUERY, hour_around_t0())
        .unwrap();

    assert_eq!(first.evidence_digest, second.evidence_digest);
    assert_eq!(first.evidence_digest.len(), 64);
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn unordered_range_is_rejected() {
    assert!(matches!(
        TimeRange::new(t0(), t0() - Duration::seconds(1)),
        Err(EvidenceError::Validation { .. })
    ));
}

struct HumanAccountable;

impl CustomCriterion for HumanAccountable {
    fn name(&self) -> &str {
        "HUMAN_ACCOUNTABLE"
    }

    fn evaluate(&self, ctx: &CriterionContext<'_>) -> EvidenceResult<CriterionOutcome> {
        let actors: Vec<_> = ctx
            .bound("actor")
            .into_iter()
            .filter_map(|node| match node {
                Node::Actor(actor) => Some(actor),
                _ => None,
            })
            .collect();
        Ok(CriterionOutcome {
            met: actors.iter().any(|a| a.actor_type == ActorType::Human),
            evidence: actors
                .iter()
                .map(|a| evidence_graph::NodeRef::actor(&a.actor_id))
                .collect(),
            detail: None,
        })
    }
}

const EXTRA_QUERIES: &str = r#"
[[queries]]
query_id = "DORA_HUMAN_OVERSIGHT"
regulation = "DORA"
article = "Art. 5"
description = "Major incidents are classified by a human"

[[queries.nodes]]
alias = "incident"
kind = "EVENT"
within_time_range = true
conditions = [{ field = "regulatory_tags", op = "CONTAINS", value = "DORA" }]

[[queries.nodes]]
alias = "decision"
kind = "DECISION"

[[queries.nodes]]
alias = "actor"
kind = "ACTOR"

[[queries.edges]]
edge_type = "CAUSED_BY"
from = "decision"
to = "incident"

[[queries.edges]]
edge_type = "MADE_BY"
from = "decision"
to = "actor"

[[queries.criteria]]
id = "one_decision"
description = "At least one decision"
mandatory = true
check = { type = "COUNT", alias = "decision", min = 1 }

[[queries.criteria]]
id = "human"
description = "A human made the call"
mandatory = true
check = { type = "CUSTOM", name = "HUMAN_ACCOUNTABLE" }
"#;

#[test]
fn registered_query_and_custom_criterion() {
    let (rt, time) = runtime();
    let catalog = QueryCatalog::from_toml_str(EXTRA_QUERIES).unwrap();
    let query = catalog.get("DORA_HUMAN_OVERSIGHT").cloned().unwrap();

    // Unknown custom names fail evaluation rather than scoring zero.
    rt.queries.register_query(query).unwrap();
    let event_id = major_incident(&rt);
    time.advance(Duration::minutes(30));
    classify(&rt, &event_id);
    assert!(matches!(
        rt.queries
            .run_compliance_query("DORA_HUMAN_OVERSIGHT", hour_around_t0()),
        Err(EvidenceError::Validation { .. })
    ));

    rt.queries.register_custom(Arc::new(HumanAccountable)).unwrap();
    let result = rt
        .queries
        .run_compliance_query("DORA_HUMAN_OVERSIGHT", hour_around_t0())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Proven);
    assert!(rt
        .queries
        .query_ids()
        .unwrap()
        .contains(&"DORA_HUMAN_OVERSIGHT".to_string()));
}
