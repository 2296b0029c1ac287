//! HTTP API for collaborators.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use crate::anchor_service::AnchorVerification;
use crate::clock_engine::NewClock;
use crate::errors::{EvidenceError, EvidenceResult};
use crate::ledger::{ChainValidation, SequenceGap};
use crate::merkle::InclusionProof;
use crate::model::{Actor, Artifact, Clock, ClockStatus, Control, MerkleAnchor};
use crate::orchestrator::{
    ClockStatusRequest, CreateDecisionRequest, CreateEventRequest, DecisionReceipt, EventReceipt,
    RecordArtifactRequest, RegisterActorRequest, RegisterControlRequest,
};
use crate::query::{ComplianceQueryResult, TimeRange};
use crate::runtime::EvidenceRuntime;

type AppState = Arc<EvidenceRuntime>;

pub fn build_router(runtime: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/events", post(create_event))
        .route("/v1/decisions", post(create_decision))
        .route("/v1/actors", post(register_actor))
        .route("/v1/controls", post(register_control))
        .route("/v1/artifacts", post(record_artifact))
        .route("/v1/clocks", post(create_clock).get(list_clocks))
        .route("/v1/clocks/{id}", get(get_clock))
        .route("/v1/clocks/{id}/status", post(update_clock_status))
        .route("/v1/clocks/{id}/pause", post(pause_clock))
        .route("/v1/clocks/{id}/resume", post(resume_clock))
        .route("/v1/clocks/{id}/extend", post(extend_clock))
        .route("/v1/chain/validate", get(validate_chain))
        .route("/v1/chain/gaps", get(chain_gaps))
        .route("/v1/anchors/{id}", get(get_anchor))
        .route("/v1/anchors/{id}/verify", get(verify_anchor))
        .route("/v1/anchors/{id}/proof/{event_id}", get(inclusion_proof))
        .route("/v1/compliance", get(list_queries))
        .route("/v1/compliance/{query_id}", post(run_compliance_query))
        .layer(CorsLayer::permissive())
        .with_state(runtime)
}

/// Run a store-bound call on the blocking pool. Stream locks and sled
/// flushes must not stall the async workers.
async fn blocking<T, F>(rt: &AppState, call: F) -> EvidenceResult<T>
where
    F: FnOnce(&EvidenceRuntime) -> EvidenceResult<T> + Send + 'static,
    T: Send + 'static,
{
    let rt = rt.clone();
    tokio::task::spawn_blocking(move || call(&rt))
        .await
        .map_err(|e| EvidenceError::internal(format!("request task failed: {e}")))?
}

#[derive(Serialize)]
struct Health {
    status: &'static str,
    degraded_streams: usize,
    pending_anchors: usize,
}

async fn healthz(State(rt): State<AppState>) -> EvidenceResult<Json<Health>> {
    let (degraded, pending) = blocking(&rt, |rt| {
        Ok((rt.store.degraded_streams()?.len(), rt.anchors.pending_anchors()?.len()))
    })
    .await?;
    Ok(Json(Health {
        status: if degraded == 0 { "ok" } else { "degraded" },
        degraded_streams: degraded,
        pending_anchors: pending,
    }))
}

async fn create_event(
    State(rt): State<AppState>,
    Json(req): Json<CreateEventRequest>,
) -> EvidenceResult<(StatusCode, Json<EventReceipt>)> {
    let receipt = blocking(&rt, move |rt| rt.orchestrator.create_event(req)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn create_decision(
    State(rt): State<AppState>,
    Json(req): Json<CreateDecisionRequest>,
) -> EvidenceResult<(StatusCode, Json<DecisionReceipt>)> {
    let receipt = blocking(&rt, move |rt| rt.orchestrator.create_decision(req)).await?;
    Ok((StatusCode::CREATED, Json(receipt)))
}

async fn register_actor(
    State(rt): State<AppState>,
    Json(req): Json<RegisterActorRequest>,
) -> EvidenceResult<(StatusCode, Json<Actor>)> {
    let actor = blocking(&rt, move |rt| rt.orchestrator.register_actor(req)).await?;
    Ok((StatusCode::CREATED, Json(actor)))
}

async fn register_control(
    State(rt): State<AppState>,
    Json(req): Json<RegisterControlRequest>,
) -> EvidenceResult<(StatusCode, Json<Control>)> {
    let control = blocking(&rt, move |rt| rt.orchestrator.register_control(req)).await?;
    Ok((StatusCode::CREATED, Json(control)))
}

async fn record_artifact(
    State(rt): State<AppState>,
    Json(req): Json<RecordArtifactRequest>,
) -> EvidenceResult<(StatusCode, Json<Artifact>)> {
    let artifact = blocking(&rt, move |rt| rt.orchestrator.record_artifact(req)).await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

async fn create_clock(
    State(rt): State<AppState>,
    Json(req): Json<NewClock>,
) -> EvidenceResult<(StatusCode, Json<Clock>)> {
    let clock = blocking(&rt, move |rt| rt.orchestrator.create_clock(req)).await?;
    Ok((StatusCode::CREATED, Json(clock)))
}

#[derive(Deserialize)]
struct ClockListParams {
    status: Option<ClockStatus>,
}

async fn list_clocks(
    State(rt): State<AppState>,
    Query(params): Query<ClockListParams>,
) -> EvidenceResult<Json<Vec<Clock>>> {
    Ok(Json(blocking(&rt, move |rt| rt.clocks.clocks(params.status)).await?))
}

async fn get_clock(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> EvidenceResult<Json<Clock>> {
    Ok(Json(blocking(&rt, move |rt| rt.clocks.get_clock(&id)).await?))
}

async fn update_clock_status(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ClockStatusRequest>,
) -> EvidenceResult<Json<Clock>> {
    Ok(Json(
        blocking(&rt, move |rt| rt.orchestrator.update_clock_status(&id, req)).await?,
    ))
}

#[derive(Deserialize)]
struct PauseRequest {
    decision_id: String,
}

async fn pause_clock(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PauseRequest>,
) -> EvidenceResult<Json<Clock>> {
    Ok(Json(
        blocking(&rt, move |rt| rt.clocks.pause_clock(&id, &req.decision_id)).await?,
    ))
}

async fn resume_clock(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> EvidenceResult<Json<Clock>> {
    Ok(Json(blocking(&rt, move |rt| rt.clocks.resume_clock(&id)).await?))
}

#[derive(Deserialize)]
struct ExtendRequest {
    additional_hours: f64,
    decision_id: String,
}

async fn extend_clock(
    State(rt): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExtendRequest>,
) -> EvidenceResult<Json<Clock>> {
    Ok(Json(
        blocking(&rt, move |rt| {
            rt.clocks
                .extend_deadline(&id, req.additional_hours, &req.decision_id)
        })
        .await?,
    ))
}

#[derive(Deserialize)]
struct ChainParams {
    source: Option<String>,
    from: Option<u64>,
    to: Option<u64>,
}

async fn validate_chain(
    State(rt): State<AppState>,
    Query(params): Query<ChainParams>,
) -> EvidenceResult<Json<ChainValidation>> {
    Ok(Json(
        blocking(&rt, move |rt| {
            rt.ledger
                .validate_chain(params.source.as_deref(), params.from, params.to)
        })
        .await?,
    ))
}

async fn chain_gaps(
    State(rt): State<AppState>,
    Query(params): Query<ChainParams>,
) -> EvidenceResult<Json<Vec<SequenceGap>>> {
    Ok(Json(
        blocking(&rt, move |rt| rt.ledger.detect_gaps(params.source.as_deref())).await?,
    ))
}

async fn get_anchor(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> EvidenceResult<Json<MerkleAnchor>> {
    Ok(Json(blocking(&rt, move |rt| rt.anchors.get_anchor(&id)).await?))
}

async fn verify_anchor(
    State(rt): State<AppState>,
    Path(id): Path<String>,
) -> EvidenceResult<Json<AnchorVerification>> {
    Ok(Json(rt.anchors.verify_anchor(&id).await?))
}

async fn inclusion_proof(
    State(rt): State<AppState>,
    Path((id, event_id)): Path<(String, String)>,
) -> EvidenceResult<Json<InclusionProof>> {
    Ok(Json(
        blocking(&rt, move |rt| rt.anchors.inclusion_proof(&id, &event_id)).await?,
    ))
}

async fn list_queries(State(rt): State<AppState>) -> EvidenceResult<Json<Vec<String>>> {
    Ok(Json(rt.queries.query_ids()?))
}

#[derive(Deserialize)]
struct ComplianceRequest {
    from: DateTime<Utc>,
    to: DateTime<Utc>,
}

async fn run_compliance_query(
    State(rt): State<AppState>,
    Path(query_id): Path<String>,
    Json(req): Json<ComplianceRequest>,
) -> EvidenceResult<Json<ComplianceQueryResult>> {
    let range = TimeRange::new(req.from, req.to)?;
    Ok(Json(
        blocking(&rt, move |rt| rt.queries.run_compliance_query(&query_id, range)).await?,
    ))
}
