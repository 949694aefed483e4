use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use knock_types::api::{Claims, KnockRequest, RelationshipResponse};
use knock_types::models::{Edge, KnockCounts};

use crate::auth::AppState;
use crate::error::{ApiResult, run_blocking};

pub async fn create_knock(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<KnockRequest>,
) -> ApiResult<impl IntoResponse> {
    let engine = state.engine.clone();
    let edge = run_blocking(move || Ok(engine.knock(claims.sub, req.to)?)).await?;
    Ok((StatusCode::CREATED, Json(edge)))
}

pub async fn knock_back(
    State(state): State<AppState>,
    Path(edge_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Edge>>> {
    let engine = state.engine.clone();
    let edges = run_blocking(move || Ok(engine.knock_back(claims.sub, edge_id)?)).await?;
    Ok(Json(edges))
}

pub async fn accept(
    State(state): State<AppState>,
    Path(edge_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Edge>> {
    let engine = state.engine.clone();
    let edge = run_blocking(move || Ok(engine.accept(claims.sub, edge_id)?)).await?;
    Ok(Json(edge))
}

pub async fn decline(
    State(state): State<AppState>,
    Path(edge_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    let engine = state.engine.clone();
    run_blocking(move || Ok(engine.decline(claims.sub, edge_id)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Withdraw one of the caller's own knocks.
pub async fn unknock(
    State(state): State<AppState>,
    Path(edge_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    let engine = state.engine.clone();
    run_blocking(move || Ok(engine.unknock(claims.sub, edge_id)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn break_lock(
    State(state): State<AppState>,
    Path(counterpart): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    let engine = state.engine.clone();
    run_blocking(move || Ok(engine.break_lock(claims.sub, counterpart)?)).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn incoming(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Edge>>> {
    let engine = state.engine.clone();
    let edges = run_blocking(move || Ok(engine.list_incoming(claims.sub)?)).await?;
    Ok(Json(edges))
}

pub async fn outgoing(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Edge>>> {
    let engine = state.engine.clone();
    let edges = run_blocking(move || Ok(engine.list_outgoing(claims.sub)?)).await?;
    Ok(Json(edges))
}

pub async fn pending(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Edge>>> {
    let engine = state.engine.clone();
    let edges = run_blocking(move || Ok(engine.list_pending(claims.sub)?)).await?;
    Ok(Json(edges))
}

pub async fn counts(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<KnockCounts>> {
    let engine = state.engine.clone();
    let counts = run_blocking(move || Ok(engine.counts(claims.sub)?)).await?;
    Ok(Json(counts))
}

pub async fn relationship(
    State(state): State<AppState>,
    Path(other): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<RelationshipResponse>> {
    let engine = state.engine.clone();
    let pair = run_blocking(move || Ok(engine.relationship(claims.sub, other)?)).await?;

    let is_locked_in = pair.is_locked_in();
    Ok(Json(RelationshipResponse {
        outgoing: pair.forward,
        incoming: pair.reverse,
        is_locked_in,
    }))
}
