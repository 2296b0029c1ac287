//! HTTP surface exercised in-process with `tower::ServiceExt::oneshot`.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use evidence_graph::alerts::TracingAlertSink;
use evidence_graph::api::build_router;
use evidence_graph::config::{EvidenceConfig, StoreBackend};
use evidence_graph::memory_store::MemoryGraphStore;
use evidence_graph::time_source::FixedTimeSource;
use evidence_graph::EvidenceRuntime;

fn app() -> Router {
    let config = EvidenceConfig {
        store: StoreBackend::Memory,
        ..EvidenceConfig::default()
    };
    let start = Utc.with_ymd_and_hms(2026, 2, 10, 12, 0, 0).unwrap();
    let runtime = EvidenceRuntime::with_parts(
        config,
        Arc::new(MemoryGraphStore::new()),
        Arc::new(FixedTimeSource::new(start)),
        Arc::new(TracingAlertSink),
    )
    .expect("runtime");
    build_router(Arc::new(runtime))
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json");
    let request = match body {
        Some(body) => request.body(Body::from(body.to_string())).unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

fn breach_body() -> Value {
    json!({
        "event_type": "BREACH.DETECTED",
        "source_system": "siem",
        "severity": "HIGH",
        "correlation_id": "INC-88",
        "payload": {"records_affected": 310},
        "regulatory_tags": ["GDPR"],
        "articles": ["Art. 33"]
    })
}

#[tokio::test]
async fn health_reports_ok() {
    let app = app();
    let (status, body) = call(&app, Method::GET, "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["degraded_streams"], 0);
}

#[tokio::test]
async fn event_ingest_starts_clock() {
    let app = app();
    let (status, receipt) = call(&app, Method::POST, "/v1/events", Some(breach_body())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(receipt["sequence_number"], 1);
    let clock_id = receipt["triggered_clocks"][0].as_str().unwrap().to_string();

    let (status, clock) = call(&app, Method::GET, &format!("/v1/clocks/{clock_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(clock["clock_type"], "GDPR_72H");
    assert_eq!(clock["status"], "RUNNING");

    let (status, running) = call(&app, Method::GET, "/v1/clocks?status=RUNNING", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(running.as_array().unwrap().len(), 1);

    let (_, second) = call(&app, Method::POST, "/v1/events", Some(breach_body())).await;
    assert_eq!(second["sequence_number"], 2);
    assert_eq!(second["previous_hash"], receipt["payload_hash"]);

    let (status, validation) = call(&app, Method::GET, "/v1/chain/validate?source=siem", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["checked_events"], 2);

    let (_, gaps) = call(&app, Method::GET, "/v1/chain/gaps", None).await;
    assert_eq!(gaps, json!([]));
}

#[tokio::test]
async fn invalid_event_is_bad_request() {
    let app = app();
    let mut body = breach_body();
    body["event_type"] = json!("breach detected");
    let (status, error) = call(&app, Method::POST, "/v1/events", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");

    let (status, _) = call(&app, Method::GET, "/v1/chain/validate?source=siem", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let app = app();
    let (status, error) = call(&app, Method::GET, "/v1/clocks/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(error["error"], "not_found");

    let (status, _) = call(&app, Method::GET, "/v1/anchors/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn closing_a_clock_twice_conflicts() {
    let app = app();
    let (_, receipt) = call(&app, Method::POST, "/v1/events", Some(breach_body())).await;
    let clock_id = receipt["triggered_clocks"][0].as_str().unwrap().to_string();
    let uri = format!("/v1/clocks/{clock_id}/status");

    let (status, clock) = call(&app, Method::POST, &uri, Some(json!({"status": "MET"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(clock["status"], "MET");

    let (status, error) = call(&app, Method::POST, &uri, Some(json!({"status": "MET"}))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(error["error"], "invalid_transition_error");
}

#[tokio::test]
async fn compliance_query_over_http() {
    let app = app();
    call(&app, Method::POST, "/v1/events", Some(breach_body())).await;

    let (status, ids) = call(&app, Method::GET, "/v1/compliance", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(ids
        .as_array()
        .unwrap()
        .contains(&json!("GDPR_ART33_BREACH_NOTIFICATION")));

    let range = json!({"from": "2026-02-10T00:00:00Z", "to": "2026-02-11T00:00:00Z"});
    let (status, result) = call(
        &app,
        Method::POST,
        "/v1/compliance/GDPR_ART33_BREACH_NOTIFICATION",
        Some(range.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["verdict"], "PARTIAL");
    assert_eq!(result["query_id"], "GDPR_ART33_BREACH_NOTIFICATION");

    let (status, _) = call(&app, Method::POST, "/v1/compliance/SOX_404", Some(range)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let backwards = json!({"from": "2026-02-11T00:00:00Z", "to": "2026-02-10T00:00:00Z"});
    let (status, _) = call(
        &app,
        Method::POST,
        "/v1/compliance/GDPR_ART33_BREACH_NOTIFICATION",
        Some(backwards),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn oversized_deadline_is_bad_request() {
    let app = app();
    let (status, error) = call(
        &app,
        Method::POST,
        "/v1/clocks",
        Some(json!({"clock_type": "GDPR_72H", "deadline_hours": 1e12})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(error["error"], "validation_error");

    let (_, receipt) = call(&app, Method::POST, "/v1/events", Some(breach_body())).await;
    let clock_id = receipt["triggered_clocks"][0].as_str().unwrap().to_string();
    let (status, _) = call(
        &app,
        Method::POST,
        &format!("/v1/clocks/{clock_id}/extend"),
        Some(json!({"additional_hours": 1e300, "decision_id": "whatever"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // The handler survived; the clock is untouched.
    let (status, clock) = call(&app, Method::GET, &format!("/v1/clocks/{clock_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(clock["status"], "RUNNING");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_posts_share_one_stream() {
    let app = app();
    let mut handles = Vec::new();
    for _ in 0..16 {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            call(&app, Method::POST, "/v1/events", Some(breach_body())).await
        }));
    }
    let mut sequences = Vec::new();
    for handle in handles {
        let (status, receipt) = handle.await.unwrap();
        assert_eq!(status, StatusCode::CREATED);
        sequences.push(receipt["sequence_number"].as_u64().unwrap());
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=16).collect::<Vec<_>>());

    let (_, validation) = call(&app, Method::GET, "/v1/chain/validate?source=siem", None).await;
    assert_eq!(validation["valid"], true);
    assert_eq!(validation["checked_events"], 16);
}
