use std::sync::Arc;

use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tourbook_core::models::{EntityType, RecordId, RemoteRecord, WorkspaceId};
use tourbook_core::remote::protocol::{
    DeltaResponse, UpsertAccepted, UpsertRequest, WORKSPACE_HEADER,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::AppConfig;
use crate::error::AppError;
use crate::store::RecordStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    store: Arc<RecordStore>,
}

impl AppState {
    pub const fn new(config: Arc<AppConfig>, store: Arc<RecordStore>) -> Self {
        Self { config, store }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route(
            "/records/{entity_type}",
            get(records_since).post(upsert_record),
        )
        .route("/records/{entity_type}/{id}", get(get_record))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
}

async fn healthz() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
    })
}

async fn require_token(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.api_token.as_deref() {
        let presented = extract_bearer_token(request.headers())?;
        if presented != expected {
            return Err(AppError::unauthorized("invalid API token"));
        }
    }
    Ok(next.run(request).await)
}

pub fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, AppError> {
    let value = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| AppError::unauthorized("missing Authorization header"))?
        .to_str()
        .map_err(|_| AppError::unauthorized("malformed Authorization header"))?;
    value
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::unauthorized("expected a Bearer token"))
}

/// Tenant of the request; every `/v1` call must carry one
pub fn workspace_from_headers(headers: &HeaderMap) -> Result<WorkspaceId, AppError> {
    let value = headers
        .get(WORKSPACE_HEADER)
        .ok_or_else(|| AppError::bad_request(format!("missing {WORKSPACE_HEADER} header")))?
        .to_str()
        .map_err(|_| AppError::bad_request(format!("malformed {WORKSPACE_HEADER} header")))?;
    WorkspaceId::new(value).map_err(|error| AppError::bad_request(error.to_string()))
}

fn parse_entity_type(entity_type: String) -> Result<EntityType, AppError> {
    EntityType::new(entity_type).map_err(|error| AppError::bad_request(error.to_string()))
}

async fn upsert_record(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    headers: HeaderMap,
    Json(request): Json<UpsertRequest>,
) -> Result<Json<UpsertAccepted>, AppError> {
    let workspace = workspace_from_headers(&headers)?;
    let entity_type = parse_entity_type(entity_type)?;
    if request.record.workspace_id != workspace {
        tracing::warn!(
            workspace = %workspace,
            record_workspace = %request.record.workspace_id,
            "Refused cross-tenant upsert"
        );
        return Err(AppError::unprocessable(format!(
            "record belongs to workspace {}, request scoped to {workspace}",
            request.record.workspace_id
        )));
    }

    let accepted = state.store.upsert(&entity_type, &workspace, &request).await?;
    tracing::info!(
        workspace = %workspace,
        entity_type = %entity_type,
        record_id = %request.record.id,
        version = accepted.version,
        canonical_code = accepted.canonical_code.as_deref(),
        "Accepted upsert"
    );
    Ok(Json(accepted))
}

#[derive(Debug, Deserialize)]
struct DeltaQuery {
    since: Option<i64>,
}

async fn records_since(
    State(state): State<AppState>,
    Path(entity_type): Path<String>,
    headers: HeaderMap,
    Query(query): Query<DeltaQuery>,
) -> Result<Json<DeltaResponse>, AppError> {
    let workspace = workspace_from_headers(&headers)?;
    let entity_type = parse_entity_type(entity_type)?;
    let records = state
        .store
        .updated_since(&workspace, &entity_type, query.since)
        .await?;
    tracing::debug!(
        workspace = %workspace,
        entity_type = %entity_type,
        since = query.since,
        count = records.len(),
        "Served delta"
    );
    Ok(Json(DeltaResponse { records }))
}

async fn get_record(
    State(state): State<AppState>,
    Path((entity_type, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<RemoteRecord>, AppError> {
    let workspace = workspace_from_headers(&headers)?;
    let entity_type = parse_entity_type(entity_type)?;
    let record_id: RecordId = id
        .parse()
        .map_err(|_| AppError::bad_request(format!("'{id}' is not a record ID")))?;
    state
        .store
        .get(&workspace, &entity_type, &record_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("{entity_type}:{id}")))
}
