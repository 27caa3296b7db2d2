//! Admin API for account and proxy management.
//!
//! Runs on a separate listener (`admin_listen_addr`, default 9090) so it
//! can be kept off the public ingress path entirely.
//!
//! Endpoints:
//! - GET    /admin/accounts                 — list accounts with status
//! - POST   /admin/accounts/init-oauth       — start PKCE flow, return auth URL
//! - POST   /admin/accounts/complete-oauth   — exchange code, store credential, add account
//! - DELETE /admin/accounts/{id}             — remove one account
//! - POST   /admin/accounts/batch-delete     — remove several accounts at once
//! - POST   /admin/accounts/{id}/refresh     — on-demand two-phase health probe
//! - POST   /admin/accounts/batch-refresh    — bounded-concurrency probe over several accounts
//! - GET    /admin/proxies                   — redacted proxy list + pool status
//! - PUT    /admin/proxies                   — replace the proxy list

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use account_registry::{Registry, Status, Tier};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{delete, get, post};
use proxy_pool::Pool as ProxyPool;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// In-memory PKCE state for an in-progress OAuth flow.
struct PkceState {
    verifier: String,
    created_at: Instant,
}

/// Maximum age of a PKCE state entry before it expires.
const PKCE_EXPIRY_SECS: u64 = 600;

#[derive(Clone)]
pub struct AdminState {
    registry: Arc<Registry>,
    proxies: Arc<ProxyPool>,
    http_client: reqwest::Client,
    pkce_states: Arc<Mutex<HashMap<String, PkceState>>>,
}

impl AdminState {
    pub fn new(registry: Arc<Registry>, proxies: Arc<ProxyPool>, http_client: reqwest::Client) -> Self {
        Self {
            registry,
            proxies,
            http_client,
            pkce_states: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/init-oauth", post(init_oauth))
        .route("/admin/accounts/complete-oauth", post(complete_oauth))
        .route("/admin/accounts/batch-delete", post(batch_delete_accounts))
        .route("/admin/accounts/batch-refresh", post(batch_refresh_accounts))
        .route("/admin/accounts/{id}", delete(delete_account))
        .route("/admin/accounts/{id}/refresh", post(refresh_account))
        .route("/admin/proxies", get(list_proxies).put(put_proxies))
        .with_state(state)
}

fn json_response(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (status, [(axum::http::header::CONTENT_TYPE, "application/json")], body.to_string())
}

/// GET /admin/accounts — list all accounts with pool status. Never exposes tokens.
async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let accounts = state.registry.list().await;
    json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts }))
}

/// POST /admin/accounts/init-oauth — generate a PKCE pair and an authorization URL.
async fn init_oauth(State(state): State<AdminState>) -> impl IntoResponse {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs();
    let account_id = format!("claude-max-{timestamp}");

    let verifier = anthropic_auth::generate_verifier();
    let challenge = anthropic_auth::compute_challenge(&verifier);
    let authorization_url = anthropic_auth::build_authorization_url(&account_id, &challenge);

    let pkce_state = PkceState { verifier, created_at: Instant::now() };

    let mut states = state.pkce_states.lock().await;
    states.retain(|_, s| s.created_at.elapsed().as_secs() < PKCE_EXPIRY_SECS);
    states.insert(account_id.clone(), pkce_state);

    info!(account_id, "PKCE flow initiated");

    json_response(
        StatusCode::OK,
        serde_json::json!({
            "authorization_url": authorization_url,
            "account_id": account_id,
            "instructions": "Open the URL in a browser, authorize, then paste the code to complete-oauth",
        }),
    )
}

#[derive(Deserialize)]
struct CompleteOAuthRequest {
    account_id: String,
    code: String,
    #[serde(default)]
    can_oauth: Option<bool>,
    #[serde(default)]
    can_web: Option<bool>,
    #[serde(default)]
    tier: Option<Tier>,
}

/// POST /admin/accounts/complete-oauth — exchange the authorization code and
/// add the account to the registry.
async fn complete_oauth(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<CompleteOAuthRequest>,
) -> impl IntoResponse {
    let pkce_state = {
        let mut states = state.pkce_states.lock().await;
        states.remove(&body.account_id)
    };

    let pkce_state = match pkce_state {
        Some(s) => s,
        None => {
            return json_response(
                StatusCode::BAD_REQUEST,
                serde_json::json!({ "error": "no pending OAuth flow for this account_id (expired or not initiated)" }),
            );
        }
    };

    if pkce_state.created_at.elapsed() > Duration::from_secs(PKCE_EXPIRY_SECS) {
        return json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "PKCE state expired (>10 minutes), please re-initiate with init-oauth" }),
        );
    }

    let authorization_code = body.code.split('#').next().unwrap_or(&body.code);

    let token_response =
        match anthropic_auth::exchange_code(&state.http_client, authorization_code, &pkce_state.verifier).await {
            Ok(r) => r,
            Err(e) => {
                warn!(account_id = body.account_id, error = %e, "token exchange failed");
                return json_response(
                    StatusCode::BAD_GATEWAY,
                    serde_json::json!({ "error": format!("token exchange failed: {e}") }),
                );
            }
        };

    let now_millis = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    let expires = now_millis + (token_response.expires_in * 1000);

    let credential = anthropic_auth::Credential {
        credential_type: "oauth".to_string(),
        refresh: token_response.refresh_token,
        access: token_response.access_token,
        expires,
        cookie: None,
    };

    let can_oauth = body.can_oauth.unwrap_or(true);
    let can_web = body.can_web.unwrap_or(false);
    let tier = body.tier.unwrap_or(Tier::Max);

    if let Err(e) = state.registry.add(body.account_id.clone(), credential, can_oauth, can_web, tier).await {
        warn!(account_id = body.account_id, error = %e, "failed to add account to registry");
        return json_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            serde_json::json!({ "error": format!("failed to add account: {e}") }),
        );
    }

    info!(account_id = body.account_id, "OAuth flow completed, account added");

    json_response(StatusCode::OK, serde_json::json!({ "account_id": body.account_id, "status": "added" }))
}

/// DELETE /admin/accounts/{id} — remove one account.
async fn delete_account(State(state): State<AdminState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.remove(&id).await {
        Ok(()) => {
            info!(account_id = id, "account removed");
            json_response(StatusCode::OK, serde_json::json!({ "account_id": id, "status": "removed" }))
        }
        Err(e) => {
            warn!(account_id = id, error = %e, "account removal failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "error": e.to_string() }))
        }
    }
}

#[derive(Deserialize)]
struct BatchDeleteRequest {
    account_ids: Vec<String>,
}

/// POST /admin/accounts/batch-delete — remove several accounts, persisting once.
async fn batch_delete_accounts(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BatchDeleteRequest>,
) -> impl IntoResponse {
    match state.registry.batch_remove(&body.account_ids).await {
        Ok(()) => json_response(
            StatusCode::OK,
            serde_json::json!({ "removed": body.account_ids, "count": body.account_ids.len() }),
        ),
        Err(e) => json_response(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "error": e.to_string() })),
    }
}

fn refresh_response(account_id: &str, status: Status) -> serde_json::Value {
    let resets_at = match status {
        Status::RateLimited { resets_at_ms } => Some(resets_at_ms),
        _ => None,
    };
    serde_json::json!({
        "account_id": account_id,
        "status": status.label(),
        "resetsAt": resets_at,
    })
}

/// POST /admin/accounts/{id}/refresh — admin-initiated refresh (§4.7): run
/// the two-phase health probe for one account right now instead of waiting
/// for the next background cycle.
async fn refresh_account(State(state): State<AdminState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.registry.refresh(&id).await {
        Ok(status) => {
            info!(account_id = id, status = status.label(), "account refreshed");
            json_response(StatusCode::OK, refresh_response(&id, status))
        }
        Err(e) => {
            warn!(account_id = id, error = %e, "account refresh failed");
            json_response(StatusCode::INTERNAL_SERVER_ERROR, serde_json::json!({ "error": e.to_string() }))
        }
    }
}

fn default_refresh_concurrency() -> usize {
    5
}

#[derive(Deserialize)]
struct BatchRefreshRequest {
    account_ids: Vec<String>,
    #[serde(default = "default_refresh_concurrency")]
    max_concurrency: usize,
}

/// POST /admin/accounts/batch-refresh — probe several accounts at once,
/// bounded to `max_concurrency` concurrent upstream calls.
async fn batch_refresh_accounts(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<BatchRefreshRequest>,
) -> impl IntoResponse {
    let results =
        account_registry::batch_refresh(&state.registry, &body.account_ids, body.max_concurrency).await;
    let accounts: Vec<_> = results
        .into_iter()
        .map(|(id, result)| match result {
            Ok(status) => refresh_response(&id, status),
            Err(e) => {
                warn!(account_id = id, error = %e, "batch refresh failed for account");
                serde_json::json!({ "account_id": id, "error": e.to_string() })
            }
        })
        .collect();
    json_response(StatusCode::OK, serde_json::json!({ "accounts": accounts }))
}

/// GET /admin/proxies — pool status plus the redacted proxy list.
async fn list_proxies(State(state): State<AdminState>) -> impl IntoResponse {
    let status = state.proxies.status().await;
    let proxies = state.proxies.list_redacted().await;
    json_response(
        StatusCode::OK,
        serde_json::json!({
            "mode": status.mode,
            "total": status.total,
            "available": status.available,
            "current_reference": status.current_reference,
            "strategy": status.strategy,
            "proxies": proxies,
        }),
    )
}

#[derive(Deserialize)]
struct PutProxiesRequest {
    /// Raw `proxies.txt` contents: one proxy per line, `#` comments and
    /// blank lines ignored.
    text: String,
}

/// PUT /admin/proxies — replace the pool's proxy list from raw text.
async fn put_proxies(
    State(state): State<AdminState>,
    axum::Json(body): axum::Json<PutProxiesRequest>,
) -> impl IntoResponse {
    match state.proxies.reload(&body.text).await {
        Ok(()) => {
            let status = state.proxies.status().await;
            json_response(StatusCode::OK, serde_json::json!({ "status": "reloaded", "total": status.total }))
        }
        Err(e) => json_response(StatusCode::BAD_REQUEST, serde_json::json!({ "error": e.to_string() })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use proxy_pool::ProxySettings;
    use tower::ServiceExt;

    async fn test_registry(dir: &std::path::Path) -> Arc<Registry> {
        let cred_path = dir.join("credentials.json");
        let store = Arc::new(anthropic_auth::CredentialStore::load(cred_path).await.unwrap());
        Arc::new(Registry::load(dir.join("accounts.json"), store, 10).await.unwrap())
    }

    fn test_pool() -> Arc<ProxyPool> {
        Arc::new(ProxyPool::new(ProxySettings::default(), vec![]))
    }

    fn test_admin_state(registry: Arc<Registry>) -> AdminState {
        AdminState::new(registry, test_pool(), reqwest::Client::new())
    }

    #[tokio::test]
    async fn list_accounts_empty_registry() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn list_accounts_never_exposes_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        registry
            .add(
                "test-account".into(),
                anthropic_auth::Credential {
                    credential_type: "oauth".into(),
                    refresh: "rt_test".into(),
                    access: "at_test".into(),
                    expires: u64::MAX,
                    cookie: None,
                },
                true,
                false,
                Tier::Max,
            )
            .await
            .unwrap();

        let app = build_admin_router(test_admin_state(registry));
        let response = app
            .oneshot(Request::builder().uri("/admin/accounts").body(Body::empty()).unwrap())
            .await
            .unwrap();

        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(!String::from_utf8_lossy(&body).contains("at_test"));
    }

    #[tokio::test]
    async fn init_oauth_returns_authorization_url() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(Request::builder().method("POST").uri("/admin/accounts/init-oauth").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json["authorization_url"].as_str().unwrap().starts_with("https://claude.ai/oauth/authorize"));
        assert!(json["account_id"].as_str().unwrap().starts_with("claude-max-"));
    }

    #[tokio::test]
    async fn complete_oauth_without_init_returns_400() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/complete-oauth")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "account_id": "claude-max-999", "code": "fake-code#fake-state" })
                            .to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn delete_nonexistent_account_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(
                Request::builder().method("DELETE").uri("/admin/accounts/does-not-exist").body(Body::empty()).unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn refresh_nonexistent_account_returns_error() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/does-not-exist/refresh")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn batch_refresh_accepts_empty_list() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/batch-refresh")
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::json!({ "account_ids": [] }).to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["accounts"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn batch_refresh_defaults_max_concurrency_when_omitted() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        // Omitting `max_concurrency` must not be a deserialization error.
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/admin/accounts/batch-refresh")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "account_ids": ["does-not-exist"] }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        let accounts = json["accounts"].as_array().unwrap();
        assert_eq!(accounts.len(), 1);
        assert!(accounts[0]["error"].is_string());
    }

    #[tokio::test]
    async fn list_proxies_reports_empty_pool() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(Request::builder().uri("/admin/proxies").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 0);
    }

    #[tokio::test]
    async fn put_proxies_replaces_list() {
        let dir = tempfile::tempdir().unwrap();
        let registry = test_registry(dir.path()).await;
        let app = build_admin_router(test_admin_state(registry));

        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/admin/proxies")
                    .header("content-type", "application/json")
                    .body(Body::from(
                        serde_json::json!({ "text": "http://10.0.0.1:8080\nhttp://10.0.0.2:8080\n" }).to_string(),
                    ))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["total"], 2);
    }
}
