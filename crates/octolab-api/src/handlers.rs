use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use chrono::Utc;
use octolab_core::DedupOutcome;
use octolab_domain::{LabId, OwnerId};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::warn;
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

// ── Health ────────────────────────────────────────────────────────────────

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn ready(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let report = state.registry.doctor_report();
    Ok(Json(json!({ "ok": report.ok, "checks": report.checks })))
}

// ── Labs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OwnerScopedBody {
    pub owner_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct OwnerScopedQuery {
    pub owner_id: Uuid,
}

/// Owner-scoped the same as every mutating handler below: a lab that
/// belongs to someone else is reported `NotFound`, not `Forbidden`, so a
/// caller can't distinguish "wrong owner" from "no such lab".
pub async fn get_lab(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<OwnerScopedQuery>,
) -> Result<Json<Value>, ApiError> {
    let lab = state
        .store
        .get_lab(&LabId(id))
        .await?
        .filter(|lab| lab.owner_id == OwnerId(query.owner_id))
        .ok_or_else(|| ApiError::not_found("lab not found"))?;
    Ok(Json(json!(lab)))
}

pub async fn post_provision(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OwnerScopedBody>,
) -> Result<StatusCode, ApiError> {
    state
        .provisioner
        .provision_lab(LabId(id), OwnerId(body.owner_id))
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn post_terminate(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OwnerScopedBody>,
) -> Result<StatusCode, ApiError> {
    octolab_core::terminate_lab(&state.store, LabId(id), OwnerId(body.owner_id)).await?;
    Ok(StatusCode::ACCEPTED)
}

pub async fn post_allocate_port(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OwnerScopedBody>,
) -> Result<Json<Value>, ApiError> {
    let ports = octolab_runtime::PortAllocator::new(
        state.store.clone(),
        state.config.port_min,
        state.config.port_max,
    );
    let port = octolab_core::allocate_port(&state.store, &ports, LabId(id), OwnerId(body.owner_id)).await?;
    Ok(Json(json!({ "port": port })))
}

pub async fn post_release_port(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<OwnerScopedBody>,
) -> Result<StatusCode, ApiError> {
    let ports = octolab_runtime::PortAllocator::new(
        state.store.clone(),
        state.config.port_min,
        state.config.port_max,
    );
    octolab_core::release_port(&state.store, &ports, LabId(id), OwnerId(body.owner_id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Evidence ingest ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct IngestEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub timestamp: chrono::DateTime<Utc>,
    pub container: Option<String>,
    #[serde(flatten)]
    pub extra: Value,
}

#[derive(Debug, Deserialize)]
pub struct IngestBody {
    pub events: Vec<IngestEvent>,
}

/// Accepts a batch of evidence events for one lab. Each event is
/// independently rate-limited and deduplicated; survivors are persisted via
/// upsert-on-conflict on `event_hash`. A single bad event in a batch never
/// fails the whole request — `accepted`/`rejected` counts are returned so
/// the caller can see what happened without the server leaking internals.
pub async fn post_events(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<IngestBody>,
) -> Result<Json<Value>, ApiError> {
    let lab_id = LabId(id);
    if state.store.get_lab(&lab_id).await?.is_none() {
        return Err(ApiError::not_found("lab not found"));
    }

    if !state.rate_limiter.check(&lab_id) {
        return Err(ApiError::too_many_requests("event ingest rate limit exceeded"));
    }

    let mut accepted = 0u32;
    let mut duplicates = 0u32;

    for event in body.events {
        let key_fields = event.extra.to_string();
        let key = octolab_core::DedupCache::canonical_key(
            &event.event_type,
            &event.timestamp.to_rfc3339(),
            &id.to_string(),
            &key_fields,
        );

        if state.dedup.check(&key) == DedupOutcome::Duplicate {
            duplicates += 1;
            continue;
        }

        let evidence_event = octolab_domain::EvidenceEvent {
            event_hash: key,
            lab_id,
            event_type: event.event_type,
            container_name: event.container,
            timestamp: event.timestamp,
            payload: event.extra,
        };

        match state.store.append_evidence_event(&evidence_event).await {
            Ok(inserted) => {
                if inserted {
                    accepted += 1;
                } else {
                    duplicates += 1;
                }
            }
            Err(e) => {
                warn!(lab_id = %lab_id, error = %e, "failed to persist evidence event");
            }
        }
    }

    Ok(Json(json!({ "accepted": accepted, "duplicates": duplicates })))
}
