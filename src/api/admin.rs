//! Configuration and token management API (C11): the `/config/proxy*`
//! surface, admin-secret gated, grounded on the reference Tauri command
//! layer's config CRUD (`modules/config.rs`) generalized from a desktop IPC
//! surface to JSON-over-HTTP endpoints.

use axum::extract::{Path, Query, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{ApiResponse, ApiResult, GatewayError};
use crate::model::{ConfigFilter, LogFilter, Permission, ProxyConfig, TokenPatch};
use crate::registry::{build_config, ImportMode};
use crate::state::AppState;

fn require_admin(state: &AppState, headers: &HeaderMap, raw_query: &Option<String>) -> Result<(), GatewayError> {
    state.authenticator.authenticate_for_config_parts(
        headers,
        raw_query.as_deref().unwrap_or(""),
        "/config/proxy",
    )
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Deserialize)]
pub struct CreateConfigRequest {
    pub name: String,
    pub subdomain: Option<String>,
    pub target_url: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_protocol() -> String {
    "https".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct ListResponse {
    pub items: Vec<ProxyConfig>,
    pub total: usize,
}

pub async fn list_configs(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(filter): Query<ConfigFilter>,
) -> ApiResult<ListResponse> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let (items, total) = state.registry.list(&filter).await;
    let items = items.iter().map(ProxyConfig::sanitized).collect();
    Ok(ApiResponse::ok(ListResponse { items, total }, StatusCode::OK))
}

pub async fn create_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Json(body): Json<CreateConfigRequest>,
) -> ApiResult<ProxyConfig> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let config = build_config(body.name, body.subdomain, body.target_url, &body.protocol, body.enabled)
        .map_err(|e| ApiResponse::err(e))?;
    let created = state.registry.add(config).await.map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(created.sanitized(), StatusCode::CREATED))
}

#[derive(Debug, Deserialize)]
pub struct IdQuery {
    pub id: String,
}

pub async fn update_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(IdQuery { id }): Query<IdQuery>,
    Json(body): Json<CreateConfigRequest>,
) -> ApiResult<ProxyConfig> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let replacement = build_config(body.name, body.subdomain, body.target_url, &body.protocol, body.enabled)
        .map_err(|e| ApiResponse::err(e))?;
    let updated = state
        .registry
        .update(&id, replacement)
        .await
        .map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(updated.sanitized(), StatusCode::OK))
}

pub async fn delete_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(IdQuery { id }): Query<IdQuery>,
) -> ApiResult<()> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    state.registry.delete(&id).await.map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok((), StatusCode::NO_CONTENT))
}

pub async fn export_configs(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> ApiResult<Vec<ProxyConfig>> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let configs = state.registry.export_all().await;
    Ok(ApiResponse::ok(configs, StatusCode::OK))
}

#[derive(Debug, Deserialize)]
pub struct ImportRequest {
    pub mode: String,
    pub configs: Vec<ProxyConfig>,
}

#[derive(Debug, Serialize)]
pub struct ImportResponse {
    pub imported: usize,
}

pub async fn import_configs(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Json(body): Json<ImportRequest>,
) -> ApiResult<ImportResponse> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let mode = match body.mode.to_ascii_lowercase().as_str() {
        "skip" => ImportMode::Skip,
        "replace" => ImportMode::Replace,
        "error" => ImportMode::Error,
        other => {
            return Err(ApiResponse::err(GatewayError::Validation(format!(
                "unknown import mode: {other}"
            ))))
        }
    };
    let imported = state
        .registry
        .import_configs(body.configs, mode)
        .await
        .map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(ImportResponse { imported }, StatusCode::OK))
}

#[derive(Debug, Deserialize)]
pub struct BatchRequest {
    pub operation: String,
    pub ids: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct BatchResultItem {
    pub id: String,
    pub success: bool,
    pub error: Option<String>,
}

pub async fn batch_operation(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Json(body): Json<BatchRequest>,
) -> ApiResult<Vec<BatchResultItem>> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let results = state.registry.batch_operation(&body.operation, &body.ids).await;
    let items = results
        .into_iter()
        .map(|(id, result)| match result {
            Ok(()) => BatchResultItem { id, success: true, error: None },
            Err(error) => BatchResultItem { id, success: false, error: Some(error) },
        })
        .collect();
    Ok(ApiResponse::ok(items, StatusCode::OK))
}

#[derive(Debug, Deserialize)]
pub struct CreateTokenRequest {
    pub name: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedToken {
    pub id: String,
    pub name: String,
    pub token: String,
    pub permissions: Vec<Permission>,
}

pub async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Path(config_id): Path<String>,
) -> ApiResult<Vec<crate::model::SanitizedToken>> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let tokens = state
        .registry
        .get_tokens(&config_id)
        .await
        .ok_or(GatewayError::NotFound)
        .map_err(|e| ApiResponse::err(e))?;
    let sanitized = tokens.iter().map(|t| t.sanitized()).collect();
    Ok(ApiResponse::ok(sanitized, StatusCode::OK))
}

pub async fn create_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Path(config_id): Path<String>,
    Json(body): Json<CreateTokenRequest>,
) -> ApiResult<CreatedToken> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let cleartext = generate_token();
    let token = state
        .registry
        .add_token(&config_id, body.name, &cleartext)
        .await
        .map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(
        CreatedToken {
            id: token.id,
            name: token.name,
            token: cleartext,
            permissions: token.permissions.into_iter().collect(),
        },
        StatusCode::CREATED,
    ))
}

pub async fn get_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Path((config_id, token_id)): Path<(String, String)>,
) -> ApiResult<crate::model::SanitizedToken> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let token = state
        .registry
        .get_token_by_id(&config_id, &token_id)
        .await
        .ok_or(GatewayError::NotFound)
        .map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(token.sanitized(), StatusCode::OK))
}

pub async fn update_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Path((config_id, token_id)): Path<(String, String)>,
    Json(patch): Json<TokenPatch>,
) -> ApiResult<crate::model::SanitizedToken> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let updated = state
        .registry
        .update_token(&config_id, &token_id, patch)
        .await
        .map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(updated.sanitized(), StatusCode::OK))
}

pub async fn delete_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Path((config_id, token_id)): Path<(String, String)>,
) -> ApiResult<()> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    state
        .registry
        .delete_token(&config_id, &token_id)
        .await
        .map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok((), StatusCode::NO_CONTENT))
}

#[derive(Debug, Serialize)]
pub struct LogQueryResponse {
    pub items: Vec<crate::model::AccessLog>,
    pub total: usize,
}

pub async fn query_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    Query(filter): Query<LogFilter>,
) -> ApiResult<LogQueryResponse> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    let (items, total) = state.access_log.query(&filter).await;
    Ok(ApiResponse::ok(LogQueryResponse { items, total }, StatusCode::OK))
}

pub async fn log_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> ApiResult<crate::accesslog::PipelineStats> {
    require_admin(&state, &headers, &raw_query).map_err(|e| ApiResponse::err(e))?;
    Ok(ApiResponse::ok(state.access_log.stats().await, StatusCode::OK))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::accesslog::{AccessLogPipeline, PipelineSettings};
    use crate::auth::Authenticator;
    use crate::model::{AccessLog, RequestType};
    use crate::registry::Registry;
    use crate::server::build_router;
    use crate::settings::GatewaySettings;
    use crate::state::AppState;

    fn sample(id: &str, status: u16) -> AccessLog {
        AccessLog {
            id: id.to_string(),
            timestamp: chrono::Utc::now(),
            method: "GET".to_string(),
            target_host: "api.test".to_string(),
            target_path: "/x".to_string(),
            status_code: status,
            duration_ms: 1,
            request_type: RequestType::Http,
            client_ip: "1.2.3.4".to_string(),
            user_agent: "ua".to_string(),
            proxy_info: None,
            request_headers: HashMap::new(),
            request_body: None,
            response_headers: HashMap::new(),
            response_body: None,
            request_size: 0,
            response_size: 10,
        }
    }

    async fn test_state() -> AppState {
        let mut settings = GatewaySettings::from_env();
        settings.admin_secret = Some("topsecret".to_string());
        let settings = Arc::new(settings);
        let registry = Registry::load(None, Duration::from_secs(30)).await;
        let access_log = AccessLogPipeline::new(PipelineSettings {
            max_entries: 100,
            max_memory_mb: 50,
            retention_hours: 24,
        });
        AppState {
            registry,
            authenticator: Arc::new(Authenticator::new(settings.admin_secret.clone())),
            settings,
            access_log,
        }
    }

    #[tokio::test]
    async fn status_codes_filter_survives_query_extraction() {
        let state = test_state().await;
        state.access_log.enqueue(sample("ok", 200));
        state.access_log.enqueue(sample("missing", 404));
        state.access_log.enqueue(sample("err", 500));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let app = build_router(state);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/logs?secret=topsecret&status_codes=2xx,404")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), axum::http::StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let parsed: Value = serde_json::from_slice(&body).unwrap();
        let ids: Vec<&str> = parsed["data"]["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"ok"));
        assert!(ids.contains(&"missing"));
        assert!(!ids.contains(&"err"));
    }
}
