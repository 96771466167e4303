use axum::Json;
use axum::Router;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use escalada_store::{AuditQuery, BoxId, DEFAULT_AUDIT_LIMIT, Provenance, StoreError};
use serde::Deserialize;
use serde_json::json;

use crate::auth::{Claims, Role};
use crate::backup::{DrillSource, SnapshotDocument};
use crate::command::{Command, CommandOutcome};
use crate::error::{AuthError, BackupError, CommandError};
use crate::http::{HttpState, ws};

pub fn router() -> Router<HttpState> {
    Router::new()
        .route("/cmd", post(cmd))
        .route("/state/{box_id}", get(state_get))
        .route("/ws/{box_id}", get(ws::box_socket))
        .route("/public/boxes", get(public_boxes))
        .route("/public/ws/{box_id}", get(ws::public_socket))
        .route("/admin/backup/box/{box_id}", get(backup_box))
        .route("/admin/backup/full", get(backup_full))
        .route("/admin/backup/last", get(backup_last))
        .route("/admin/restore", post(restore))
        .route("/admin/ops/backup/now", post(backup_now))
        .route("/admin/ops/drill", post(drill))
        .route("/admin/ops/status", get(ops_status))
        .route("/admin/ops/rate-limit", get(rate_limit_stats))
        .route("/admin/audit/events", get(audit_events))
}

#[derive(Debug)]
pub(crate) enum ApiError {
    Auth(AuthError),
    Command(CommandError),
    Backup(BackupError),
    Store(StoreError),
    NotPublic(BoxId),
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        ApiError::Auth(err)
    }
}

impl From<CommandError> for ApiError {
    fn from(err: CommandError) -> Self {
        ApiError::Command(err)
    }
}

impl From<BackupError> for ApiError {
    fn from(err: BackupError) -> Self {
        ApiError::Backup(err)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        ApiError::Store(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::Auth(AuthError::MissingToken | AuthError::InvalidToken) => {
                (StatusCode::UNAUTHORIZED, "unauthorized")
            }
            ApiError::Auth(_) => (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::Command(CommandError::Validation(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_command")
            }
            ApiError::Command(CommandError::Persistence { .. }) => {
                (StatusCode::SERVICE_UNAVAILABLE, "persistence_failed")
            }
            ApiError::Command(CommandError::Internal(_)) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal")
            }
            ApiError::Backup(BackupError::InvalidSnapshot(_)) => {
                (StatusCode::BAD_REQUEST, "invalid_snapshot")
            }
            ApiError::Backup(BackupError::UnknownBox(_) | BackupError::NoBackup(_)) => {
                (StatusCode::NOT_FOUND, "not_found")
            }
            ApiError::Backup(_) => (StatusCode::INTERNAL_SERVER_ERROR, "backup_failed"),
            ApiError::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "store_error"),
            ApiError::NotPublic(_) => (StatusCode::NOT_FOUND, "not_found"),
        };
        let message = match self {
            ApiError::Auth(err) => err.to_string(),
            ApiError::Command(err) => err.to_string(),
            ApiError::Backup(err) => err.to_string(),
            ApiError::Store(err) => err.to_string(),
            ApiError::NotPublic(box_id) => format!("box {box_id} is not public"),
        };
        (status, Json(json!({ "code": code, "message": message }))).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct TokenQuery {
    pub token: Option<String>,
}

fn claims(state: &HttpState, headers: &HeaderMap, query: &TokenQuery) -> Result<Claims, ApiError> {
    Ok(state.authenticate(headers, query.token.as_deref())?)
}

fn admin(state: &HttpState, headers: &HeaderMap, query: &TokenQuery) -> Result<Claims, ApiError> {
    let claims = claims(state, headers, query)?;
    claims.require_role(&[Role::Admin])?;
    Ok(claims)
}

fn provenance(claims: &Claims, headers: &HeaderMap) -> Provenance {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    };
    let ip = header("x-forwarded-for")
        .and_then(|v| v.split(',').next().map(|first| first.trim().to_string()))
        .or_else(|| header("x-real-ip"));
    Provenance {
        actor_username: Some(claims.username.clone()),
        actor_role: Some(claims.role.as_str().to_string()),
        actor_ip: ip,
        actor_user_agent: header("user-agent"),
    }
}

pub(crate) async fn health(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "version": env!("CARGO_PKG_VERSION"),
        "boxes": state.service.registry().len(),
        "connections": state.service.broadcaster().total_connections(),
    }))
}

async fn cmd(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(command): Json<Command>,
) -> Result<Response, ApiError> {
    let claims = claims(&state, &headers, &query)?;
    if command.is_global() {
        claims.require_role(&[Role::Admin, Role::Judge])?;
    } else if let Some(box_id) = command.box_id {
        claims.authorize_command(box_id)?;
    }
    let outcome = state
        .service
        .submit(command, provenance(&claims, &headers))
        .await?;
    let status = match outcome {
        CommandOutcome::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
        _ => StatusCode::OK,
    };
    Ok((status, Json(outcome)).into_response())
}

async fn state_get(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(box_id): Path<BoxId>,
) -> Result<impl IntoResponse, ApiError> {
    claims(&state, &headers, &query)?.authorize_view(box_id)?;
    Ok(Json(state.service.snapshot(box_id).await))
}

async fn public_boxes(State(state): State<HttpState>) -> impl IntoResponse {
    Json(json!({ "boxes": state.service.public_boxes().await }))
}

async fn backup_box(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Path(box_id): Path<BoxId>,
) -> Result<impl IntoResponse, ApiError> {
    admin(&state, &headers, &query)?;
    let snapshot = state.service.backups().export_box(box_id).await?;
    Ok(Json(json!({ "status": "ok", "snapshot": snapshot })))
}

async fn backup_full(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    admin(&state, &headers, &query)?;
    let snapshot = state.service.backups().export_all().await;
    Ok(Json(json!({ "status": "ok", "snapshot": snapshot })))
}

async fn backup_last(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    admin(&state, &headers, &query)?;
    let backups = state.service.backups();
    let last = backups
        .latest_backup()
        .await?
        .ok_or_else(|| BackupError::NoBackup(backups.config().dir.clone()))?;
    Ok(Json(json!({ "status": "ok", "file": last })))
}

async fn restore(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(doc): Json<SnapshotDocument>,
) -> Result<impl IntoResponse, ApiError> {
    let claims = admin(&state, &headers, &query)?;
    tracing::info!(user = %claims.username, boxes = doc.boxes.len(), "restore requested");
    let results = state.service.backups().restore(doc).await?;
    Ok(Json(json!({ "status": "ok", "results": results })))
}

async fn backup_now(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    admin(&state, &headers, &query)?;
    let file = state.service.backups().backup_now().await?;
    Ok(Json(json!({ "status": "ok", "file": file })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DrillRequest {
    /// Drill against this snapshot; the live registry when absent.
    #[serde(default)]
    snapshot: Option<SnapshotDocument>,
    #[serde(default, alias = "box_ids")]
    box_ids: Option<Vec<BoxId>>,
    #[serde(default, alias = "write_backup_file")]
    write_backup_file: bool,
}

async fn drill(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
    Json(request): Json<DrillRequest>,
) -> Result<impl IntoResponse, ApiError> {
    admin(&state, &headers, &query)?;
    let source = match request.snapshot {
        Some(doc) => DrillSource::Snapshot(doc),
        None => DrillSource::Live,
    };
    let report = state
        .service
        .backups()
        .drill(source, request.box_ids.as_deref(), request.write_backup_file)
        .await?;
    Ok(Json(report))
}

async fn ops_status(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> Result<impl IntoResponse, ApiError> {
    admin(&state, &headers, &query)?;
    Ok(Json(state.service.ops_status().await?))
}

#[derive(Debug, Deserialize)]
struct RateQuery {
    token: Option<String>,
    key: String,
}

async fn rate_limit_stats(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(query): Query<RateQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let token = TokenQuery {
        token: query.token.clone(),
    };
    admin(&state, &headers, &token)?;
    Ok(Json(state.service.limiter().stats(&query.key)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuditParams {
    token: Option<String>,
    #[serde(alias = "box_id")]
    box_id: Option<BoxId>,
    limit: Option<usize>,
    #[serde(default, alias = "include_payload")]
    include_payload: bool,
}

async fn audit_events(
    State(state): State<HttpState>,
    headers: HeaderMap,
    Query(params): Query<AuditParams>,
) -> Result<impl IntoResponse, ApiError> {
    let token = TokenQuery {
        token: params.token.clone(),
    };
    admin(&state, &headers, &token)?;
    let query = AuditQuery {
        box_id: params.box_id,
        limit: params.limit.unwrap_or(DEFAULT_AUDIT_LIMIT),
        include_payload: params.include_payload,
    };
    let limit = query.effective_limit();
    let events = state.service.list_audit(query).await?;
    Ok(Json(json!({ "events": events, "limit": limit })))
}
