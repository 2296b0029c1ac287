use chrono::Duration;
use serde_json::json;

use crate::alerts::{AlertKind, AlertLevel};
use crate::errors::EvidenceError;
use crate::graph_store::{EdgeFilter, GraphStore};
use crate::model::{ActorType, ClockStatus, EdgeType, EventDraft, NodeRef, Severity};
use crate::orchestrator::{
    ClockStatusRequest, CreateDecisionRequest, CreateEventRequest, RecordArtifactRequest,
    RegisterActorRequest,
};
use crate::query::{TimeRange, Verdict};
use crate::tests::test_utils::{breach_draft, t0, Harness};

const GDPR_QUERY: &str = "GDPR_ART33_BREACH_NOTIFICATION";
const NOTIFICATION_HASH: &str = "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

fn day_around_t0() -> TimeRange {
    TimeRange::new(t0() - Duration::hours(12), t0() + Duration::hours(12)).unwrap()
}

fn register_dpo(h: &Harness) {
    h.runtime
        .orchestrator
        .register_actor(RegisterActorRequest {
            actor_id: Some("dpo-1".into()),
            actor_type: ActorType::Human,
            name: "Data Protection Officer".into(),
            role: None,
        })
        .unwrap();
}

fn decision_request(event_id: &str, decision_type: &str) -> CreateDecisionRequest {
    CreateDecisionRequest {
        decision_type: decision_type.into(),
        regulation: "GDPR".into(),
        outcome: "notify supervisory authority".into(),
        justification: "over 1000 customer records exposed".into(),
        actor_id: "dpo-1".into(),
        related_event_id: event_id.into(),
        ai_assistance: None,
        approval_chain: Vec::new(),
        effectiveness_rating: None,
        control_ids: Vec::new(),
        artifact: None,
    }
}

/// Close the breach clock as MET with a notification artifact.
fn notify(h: &Harness, clock_id: &str) -> String {
    let artifact = h
        .runtime
        .orchestrator
        .record_artifact(RecordArtifactRequest {
            artifact_type: "AUTHORITY_NOTIFICATION".into(),
            title: "Art. 33 notification to the supervisory authority".into(),
            content_hash: NOTIFICATION_HASH.into(),
            uri: None,
            signature: None,
            created_by: Some("dpo-1".into()),
            evidences: Vec::new(),
        })
        .unwrap();
    h.runtime
        .orchestrator
        .update_clock_status(
            clock_id,
            ClockStatusRequest {
                status: ClockStatus::Met,
                evidence_artifact_id: Some(artifact.artifact_id.clone()),
                decision_id: None,
            },
        )
        .unwrap();
    artifact.artifact_id
}

#[test]
fn test_breach_starts_clock_at_occurrence() {
    let h = Harness::new();
    let occurred = t0() - Duration::hours(5);
    let receipt = h
        .runtime
        .orchestrator
        .create_event(breach_draft("siem").occurred_at(occurred).into())
        .unwrap();

    assert_eq!(receipt.sequence_number, 1);
    assert_eq!(receipt.recorded_at, t0());
    assert_eq!(receipt.triggered_clocks.len(), 1);

    let clock = h.runtime.clocks.get_clock(&receipt.triggered_clocks[0]).unwrap();
    assert_eq!(clock.clock_type, "GDPR_72H");
    assert_eq!(clock.start_time, occurred);
    assert_eq!(clock.deadline, occurred + Duration::hours(72));
    assert_eq!(clock.related_event_id.as_deref(), Some(receipt.event_id.as_str()));

    let triggers = h
        .store
        .query_edges(
            &EdgeFilter::of_type(EdgeType::Triggers).from_node(NodeRef::event(&receipt.event_id)),
        )
        .unwrap();
    assert_eq!(triggers.len(), 1);
}

#[test]
fn test_auto_trigger_can_be_disabled() {
    let h = Harness::new();
    let receipt = h
        .runtime
        .orchestrator
        .create_event(CreateEventRequest {
            auto_trigger_clocks: false,
            ..breach_draft("siem").into()
        })
        .unwrap();
    assert!(receipt.triggered_clocks.is_empty());
    assert!(h.runtime.clocks.clocks(None).unwrap().is_empty());
}

#[test]
fn test_untagged_event_triggers_nothing() {
    let h = Harness::new();
    let receipt = h
        .runtime
        .orchestrator
        .create_event(
            EventDraft::new("BREACH.DETECTED", "siem", "INC-7", json!({"records_affected": 2}))
                .into(),
        )
        .unwrap();
    assert!(receipt.triggered_clocks.is_empty());
}

#[test]
fn test_unknown_actor_rejects_event() {
    let h = Harness::new();
    let err = h
        .runtime
        .orchestrator
        .create_event(CreateEventRequest {
            actor_ids: vec!["ghost".into()],
            ..breach_draft("siem").into()
        })
        .unwrap_err();
    assert!(matches!(err, EvidenceError::NotFound { .. }));
    assert!(h.store.latest_sequence("siem").unwrap().is_none());
}

#[test]
fn test_critical_event_raises_alert() {
    let mut h = Harness::new();
    let receipt = h
        .runtime
        .orchestrator
        .create_event(breach_draft("siem").with_severity(Severity::Critical).into())
        .unwrap();

    let alerts = h.drain_alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::CriticalEvent);
    assert_eq!(alerts[0].level, AlertLevel::Critical);
    assert_eq!(alerts[0].subject, receipt.event_id);
}

#[test]
fn test_escalation_decision_spawns_artifact() {
    let h = Harness::new();
    register_dpo(&h);
    let event = h
        .runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();

    let receipt = h
        .runtime
        .orchestrator
        .create_decision(decision_request(&event.event_id, "ESCALATION"))
        .unwrap();
    assert_eq!(receipt.content_hash.len(), 64);
    let artifact_id = receipt.artifact_id.expect("escalations produce an artifact");

    let decision_ref = NodeRef::decision(&receipt.decision_id);
    let made_by = h
        .store
        .query_edges(&EdgeFilter::of_type(EdgeType::MadeBy).from_node(decision_ref.clone()))
        .unwrap();
    assert_eq!(made_by[0].target, NodeRef::actor("dpo-1"));
    let caused_by = h
        .store
        .query_edges(&EdgeFilter::of_type(EdgeType::CausedBy).from_node(decision_ref.clone()))
        .unwrap();
    assert_eq!(caused_by[0].target, NodeRef::event(&event.event_id));
    let produced = h
        .store
        .query_edges(&EdgeFilter::of_type(EdgeType::Produced).from_node(decision_ref))
        .unwrap();
    assert_eq!(produced[0].target, NodeRef::artifact(&artifact_id));

    let plain = h
        .runtime
        .orchestrator
        .create_decision(decision_request(&event.event_id, "NOTIFICATION"))
        .unwrap();
    assert!(plain.artifact_id.is_none());
}

#[test]
fn test_decision_requires_justification_and_event() {
    let h = Harness::new();
    register_dpo(&h);
    let event = h
        .runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();

    let mut blank = decision_request(&event.event_id, "NOTIFICATION");
    blank.justification = "  ".into();
    assert!(matches!(
        h.runtime.orchestrator.create_decision(blank),
        Err(EvidenceError::Validation { .. })
    ));

    assert!(matches!(
        h.runtime
            .orchestrator
            .create_decision(decision_request("missing-event", "NOTIFICATION")),
        Err(EvidenceError::NotFound { .. })
    ));
}

#[test]
fn test_breach_notification_proven() {
    let h = Harness::new();
    let receipt = h
        .runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();
    h.time.advance(Duration::hours(40));
    notify(&h, &receipt.triggered_clocks[0]);

    let result = h
        .runtime
        .queries
        .run_compliance_query(GDPR_QUERY, day_around_t0())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Proven);
    assert_eq!(result.confidence_score, 1.0);
    assert!(result.gaps.is_empty());
    assert!(result.warnings.is_empty());

    let aliases: Vec<_> = result.evidence.iter().map(|e| e.alias.as_str()).collect();
    assert!(aliases.contains(&"breach"));
    assert!(aliases.contains(&"clock"));
    assert!(aliases.contains(&"notification"));
}

#[test]
fn test_breach_without_clock_not_proven() {
    let h = Harness::new();
    h.runtime
        .orchestrator
        .create_event(CreateEventRequest {
            auto_trigger_clocks: false,
            ..breach_draft("siem").into()
        })
        .unwrap();

    let result = h
        .runtime
        .queries
        .run_compliance_query(GDPR_QUERY, day_around_t0())
        .unwrap();
    assert_eq!(result.verdict, Verdict::NotProven);
    assert_eq!(result.confidence_score, 0.0);
    assert!(result.gaps.iter().any(|g| g.criterion_id == "clock_started"));
}

#[test]
fn test_running_clock_is_partial() {
    let h = Harness::new();
    h.runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();

    let result = h
        .runtime
        .queries
        .run_compliance_query(GDPR_QUERY, day_around_t0())
        .unwrap();
    assert_eq!(result.verdict, Verdict::Partial);
    // Only clock_started (weight 1 of 6) is met.
    assert_eq!(result.confidence_score, 0.166667);
    let gap_ids: Vec<_> = result.gaps.iter().map(|g| g.criterion_id.as_str()).collect();
    assert_eq!(
        gap_ids,
        vec!["clock_met", "notification_evidenced", "met_before_deadline"]
    );
}

#[test]
fn test_late_notification_is_partial() {
    let h = Harness::new();
    let receipt = h
        .runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();
    // Closed after the deadline without the monitor having breached it.
    h.time.advance(Duration::hours(80));
    notify(&h, &receipt.triggered_clocks[0]);

    let result = h
        .runtime
        .queries
        .run_compliance_query(GDPR_QUERY, day_around_t0())
        .unwrap();
    // Five of six weights fall short of the 0.9 requirement.
    assert_eq!(result.confidence_score, 0.833333);
    assert_eq!(result.verdict, Verdict::Partial);
    assert_eq!(result.gaps.len(), 1);
    assert_eq!(result.gaps[0].criterion_id, "met_before_deadline");
}

#[test]
fn test_degraded_stream_is_warned_about() {
    let h = Harness::new();
    h.runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();
    h.runtime
        .orchestrator
        .create_event(breach_draft("siem").occurred_at(t0() - Duration::days(30)).into())
        .unwrap();
    h.store.tamper_payload("siem", 2, json!({"records_affected": 0}));
    h.runtime.ledger.audit_stream("siem").unwrap();

    let result = h
        .runtime
        .queries
        .run_compliance_query(GDPR_QUERY, day_around_t0())
        .unwrap();
    assert_eq!(
        result.warnings,
        vec!["ledger stream siem is degraded: chain broken at sequence 2: payload hash does not match stored payload".to_string()]
    );
}

#[test]
fn test_unknown_query_is_not_found() {
    let h = Harness::new();
    assert!(matches!(
        h.runtime
            .queries
            .run_compliance_query("SOX_404", day_around_t0()),
        Err(EvidenceError::NotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_audit_surfaces_tampering() {
    let mut h = Harness::new();
    h.runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();
    h.runtime
        .orchestrator
        .create_event(breach_draft("siem").into())
        .unwrap();
    h.store.tamper_payload("siem", 2, json!({"records_affected": 0}));

    // Every background task fires once on start.
    let tasks = h.runtime.spawn_background();
    let mut flagged = false;
    for _ in 0..200 {
        if h.store.degraded_streams().unwrap().contains_key("siem") {
            flagged = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    for task in tasks {
        task.stop().await;
    }
    assert!(flagged, "integrity audit never flagged the tampered stream");

    let result = h
        .runtime
        .queries
        .run_compliance_query(GDPR_QUERY, day_around_t0())
        .unwrap();
    assert_eq!(result.warnings.len(), 1);
    assert!(result.warnings[0].starts_with("ledger stream siem is degraded"));
    assert!(h
        .drain_alerts()
        .iter()
        .any(|a| a.kind == AlertKind::IntegrityDegraded && a.subject == "siem"));
}
