// src/admin.rs

use crate::{
    config::{PoolConfig, PoolConfigPatch},
    error::Result,
    key_manager::{ImportSummary, KeyPage},
    monitoring::{KeyTestReport, TestAllSummary, TokenSnapshot},
    state::AppState,
    storage::{KeyRecord, KeyStatus, PoolGroup, PoolGroupStats, PoolStats},
};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Json},
    routing::{delete, get, patch, post, put},
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

const DEFAULT_PAGE_SIZE: usize = 10;

// --- Router Definition ---

/// All operator routes, nested under `/admin` and guarded by the admin token.
pub fn admin_routes(state: Arc<AppState>) -> Router<Arc<AppState>> {
    let routes = Router::new()
        .route("/keys", get(list_keys).post(add_key))
        .route("/keys/import", post(import_keys))
        .route("/keys/export", get(export_keys))
        .route("/keys/test-all", post(test_all_keys))
        .route("/keys/status/:status", delete(delete_keys_by_status))
        .route("/keys/:id", get(get_key).delete(delete_key))
        .route("/keys/:id/status", patch(update_status))
        .route("/keys/:id/notes", patch(update_notes))
        .route("/keys/:id/group", patch(assign_group))
        .route("/keys/:id/ban", post(ban_key))
        .route("/keys/:id/test", post(test_key))
        .route("/stats", get(get_stats))
        .route("/config", get(get_config).put(update_config))
        .route("/config/reset", post(reset_config))
        .route("/pool-groups", get(list_pool_groups).post(create_pool_group))
        .route("/pool-groups/:id", delete(delete_pool_group))
        .route("/token-usage", put(replace_token_usage))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::admin_auth_middleware,
        ));

    Router::new().nest("/admin", routes)
}

// --- Request/Response Structs ---

#[derive(Debug, Default, Deserialize)]
pub struct ListKeysQuery {
    pub page: Option<usize>,
    pub limit: Option<usize>,
    pub status: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusFilterQuery {
    pub status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddKeyRequest {
    pub key: String,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub pool_group: Option<String>,
}

/// Either a list of keys or newline-separated text (or both).
#[derive(Debug, Default, Deserialize)]
pub struct ImportKeysRequest {
    #[serde(default)]
    pub keys: Vec<String>,
    #[serde(default)]
    pub text: Option<String>,
}

impl ImportKeysRequest {
    fn into_lines(self) -> Vec<String> {
        let mut lines = self.keys;
        if let Some(text) = self.text {
            lines.extend(text.lines().map(str::to_string));
        }
        lines
    }
}

#[derive(Debug, Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct NotesRequest {
    pub notes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupRequest {
    #[serde(default)]
    pub pool_group: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BanRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub keys: PoolStats,
    pub algorithm: String,
    pub multi_tier_enabled: bool,
    pub pool_groups: Vec<PoolGroupStats>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeletedResponse {
    pub deleted: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolGroupDeletedResponse {
    pub id: String,
    pub moved_keys: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TokenUsageResponse {
    pub keys: usize,
}

fn parse_status(raw: Option<&str>) -> Result<Option<KeyStatus>> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::parse::<KeyStatus>)
        .transpose()
}

// --- Keys ---

pub async fn list_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListKeysQuery>,
) -> Result<Json<KeyPage>> {
    let status = parse_status(query.status.as_deref())?;
    Ok(Json(state.pool.get_keys(
        query.page.unwrap_or(1),
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        status,
    )))
}

pub async fn add_key(
    State(state): State<Arc<AppState>>,
    Json(request): Json<AddKeyRequest>,
) -> Result<(StatusCode, Json<KeyRecord>)> {
    let record = state
        .pool
        .add_key(&request.key, &request.notes, request.pool_group.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

pub async fn import_keys(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ImportKeysRequest>,
) -> Result<Json<ImportSummary>> {
    let lines = request.into_lines();
    info!(lines = lines.len(), "Received key import request");
    Ok(Json(state.pool.import_keys(&lines).await?))
}

/// Plain text, one credential per line.
pub async fn export_keys(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusFilterQuery>,
) -> Result<impl IntoResponse> {
    let status = parse_status(query.status.as_deref())?;
    let keys = state.pool.export_keys(status);
    info!(count = keys.len(), status = ?status, "Keys exported");
    let mut body = keys.join("\n");
    if !body.is_empty() {
        body.push('\n');
    }
    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body))
}

pub async fn get_key(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Json<KeyRecord>> {
    Ok(Json(state.pool.get_key(&id)?))
}

pub async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<KeyRecord>> {
    Ok(Json(state.pool.delete_key(&id).await?))
}

pub async fn delete_keys_by_status(
    State(state): State<Arc<AppState>>,
    Path(status): Path<String>,
) -> Result<Json<DeletedResponse>> {
    let status: KeyStatus = status.parse()?;
    let deleted = state.pool.delete_by_status(status).await?;
    Ok(Json(DeletedResponse { deleted }))
}

pub async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<StatusRequest>,
) -> Result<Json<KeyRecord>> {
    let status: KeyStatus = request.status.parse()?;
    Ok(Json(state.pool.toggle_status(&id, status).await?))
}

pub async fn update_notes(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<NotesRequest>,
) -> Result<Json<KeyRecord>> {
    Ok(Json(state.pool.update_notes(&id, &request.notes).await?))
}

pub async fn assign_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<GroupRequest>,
) -> Result<Json<KeyRecord>> {
    Ok(Json(
        state
            .pool
            .assign_pool_group(&id, request.pool_group.as_deref())
            .await?,
    ))
}

pub async fn ban_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<BanRequest>>,
) -> Result<Json<KeyRecord>> {
    let reason = body.and_then(|Json(b)| b.reason);
    Ok(Json(state.pool.ban_key(&id, reason.as_deref()).await?))
}

pub async fn test_key(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<KeyTestReport>> {
    Ok(Json(state.probe.test_key(&id).await?))
}

pub async fn test_all_keys(State(state): State<Arc<AppState>>) -> Json<TestAllSummary> {
    Json(state.probe.test_all_keys().await)
}

// --- Stats & config ---

pub async fn get_stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let config = state.pool.config();
    Json(StatsResponse {
        keys: state.pool.stats(),
        algorithm: config.algorithm.to_string(),
        multi_tier_enabled: config.multi_tier.enabled,
        pool_groups: state.pool.pool_group_stats(),
    })
}

pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<PoolConfig> {
    Json(state.pool.config())
}

pub async fn update_config(
    State(state): State<Arc<AppState>>,
    Json(patch): Json<PoolConfigPatch>,
) -> Result<Json<PoolConfig>> {
    info!("Received pool config update");
    Ok(Json(state.pool.update_config(&patch).await?))
}

pub async fn reset_config(State(state): State<Arc<AppState>>) -> Result<Json<PoolConfig>> {
    Ok(Json(state.pool.reset_config().await?))
}

// --- Pool groups ---

pub async fn list_pool_groups(State(state): State<Arc<AppState>>) -> Json<Vec<PoolGroupStats>> {
    Json(state.pool.pool_group_stats())
}

pub async fn create_pool_group(
    State(state): State<Arc<AppState>>,
    Json(group): Json<PoolGroup>,
) -> Result<(StatusCode, Json<PoolGroup>)> {
    let created = state.pool.create_pool_group(group).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn delete_pool_group(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<PoolGroupDeletedResponse>> {
    let moved_keys = state.pool.delete_pool_group(&id).await?;
    Ok(Json(PoolGroupDeletedResponse { id, moved_keys }))
}

// --- Token usage ---

pub async fn replace_token_usage(
    State(state): State<Arc<AppState>>,
    Json(snapshot): Json<TokenSnapshot>,
) -> Json<TokenUsageResponse> {
    let keys = snapshot.len();
    state.token_usage.replace(snapshot);
    info!(keys, "Token usage snapshot replaced");
    Json(TokenUsageResponse { keys })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppError;

    #[test]
    fn test_parse_status_filter() {
        assert_eq!(parse_status(None).unwrap(), None);
        assert_eq!(parse_status(Some("")).unwrap(), None);
        assert_eq!(parse_status(Some("banned")).unwrap(), Some(KeyStatus::Banned));
        assert!(matches!(parse_status(Some("frozen")), Err(AppError::Validation { .. })));
    }

    #[test]
    fn test_import_request_merges_sources() {
        let request: ImportKeysRequest =
            serde_json::from_str(r#"{"keys":["fk-a"],"text":"fk-b\nfk-c"}"#).unwrap();
        assert_eq!(request.into_lines(), vec!["fk-a", "fk-b", "fk-c"]);
    }
}
