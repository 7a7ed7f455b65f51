//! Axum HTTP gateway over the credit engine.
//!
//! The upstream auth layer identifies the caller with `X-Account-Id`.
//! Credit grants need the admin bearer token. Engine calls run on the
//! blocking pool since the SQLite backend does synchronous I/O.

use crate::billing::{
    BillingError, ConsumeFailure, CreditEngine, Feature, PoolTarget, UsageMetadata,
};
use crate::config::Config;
use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB)
pub const MAX_BODY_SIZE: usize = 65_536;
/// Request timeout (30s)
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// Header carrying the authenticated account id.
pub const ACCOUNT_HEADER: &str = "x-account-id";

const DEFAULT_USAGE_LIMIT: usize = 20;
const MAX_USAGE_LIMIT: usize = 100;

/// Concrete handler return type.
type ApiResponse = (StatusCode, Json<serde_json::Value>);

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CreditEngine>,
    /// SHA-256 hex of the admin token; `None` disables grants.
    pub admin_token_hash: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: Arc<CreditEngine>, admin_token: &str) -> Self {
        let trimmed = admin_token.trim();
        Self {
            engine,
            admin_token_hash: (!trimmed.is_empty()).then(|| Arc::<str>::from(hash_token(trimmed))),
        }
    }
}

fn hash_token(value: &str) -> String {
    use sha2::{Digest, Sha256};

    hex::encode(Sha256::digest(value.as_bytes()))
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            header::HeaderName::from_static(ACCOUNT_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    Router::new()
        .route("/health", get(handle_health))
        .route(
            "/api/features/check-availability",
            post(handle_check_availability),
        )
        .route("/api/features/use-feature", post(handle_use_feature))
        .route("/api/user/credits", get(handle_user_credits))
        .route("/api/user/usage", get(handle_user_usage))
        .route("/api/admin/credits", post(handle_admin_credits))
        .with_state(state)
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Serve until Ctrl-C.
pub async fn run_gateway(
    host: &str,
    port: u16,
    config: &Config,
    engine: Arc<CreditEngine>,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}").parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let actual = listener.local_addr()?;

    let state = AppState::new(engine, &config.gateway.admin_token);
    if state.admin_token_hash.is_none() {
        tracing::warn!("gateway.admin_token is empty; credit grants are disabled");
    }
    tracing::info!(addr = %actual, "Credit gateway listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutting down gateway");
        })
        .await?;
    Ok(())
}

fn error_body(status: StatusCode, message: impl Into<String>) -> ApiResponse {
    (
        status,
        Json(serde_json::json!({ "error": message.into() })),
    )
}

fn billing_error_response(err: BillingError) -> ApiResponse {
    match err {
        BillingError::AccountNotFound(_) => error_body(StatusCode::NOT_FOUND, "Account not found"),
        BillingError::InvalidUnits { .. } | BillingError::InvalidAmount | BillingError::InvalidPool => {
            error_body(StatusCode::BAD_REQUEST, err.to_string())
        }
        BillingError::Store(store) => {
            tracing::error!(error = %store, "Ledger store failure");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error")
        }
    }
}

/// Run a blocking engine call off the async workers.
async fn run_engine<T, F>(f: F) -> Result<T, ApiResponse>
where
    F: FnOnce() -> Result<T, BillingError> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(billing_error_response(err)),
        Err(join) => {
            tracing::error!(error = %join, "Engine task failed");
            Err(error_body(StatusCode::INTERNAL_SERVER_ERROR, "Internal error"))
        }
    }
}

fn require_account_id(headers: &HeaderMap) -> Result<String, ApiResponse> {
    headers
        .get(ACCOUNT_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or_else(|| error_body(StatusCode::UNAUTHORIZED, "Missing X-Account-Id header"))
}

fn parse_feature(raw: &str) -> Result<Feature, ApiResponse> {
    raw.parse::<Feature>()
        .map_err(|e| error_body(StatusCode::BAD_REQUEST, e.to_string()))
}

fn to_json<T: serde::Serialize>(value: &T) -> ApiResponse {
    match serde_json::to_value(value) {
        Ok(body) => (StatusCode::OK, Json(body)),
        Err(e) => error_body(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn bad_json(err: &JsonRejection) -> ApiResponse {
    error_body(StatusCode::BAD_REQUEST, format!("Invalid JSON: {err}"))
}

/// GET /health
async fn handle_health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "backend": state.engine.backend(),
    }))
}

#[derive(Debug, Deserialize)]
struct FeatureBody {
    feature: String,
}

/// POST /api/features/check-availability
async fn handle_check_availability(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<FeatureBody>, JsonRejection>,
) -> ApiResponse {
    let account_id = match require_account_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    let feature = match parse_feature(&body.feature) {
        Ok(f) => f,
        Err(resp) => return resp,
    };

    let engine = Arc::clone(&state.engine);
    match run_engine(move || engine.check_availability(&account_id, feature)).await {
        Ok(result) => to_json(&result),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
struct UseFeatureBody {
    feature: String,
    #[serde(default)]
    units: Option<u64>,
    #[serde(default)]
    metadata: Option<UsageMetadata>,
}

/// POST /api/features/use-feature
async fn handle_use_feature(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<UseFeatureBody>, JsonRejection>,
) -> ApiResponse {
    let account_id = match require_account_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    let feature = match parse_feature(&body.feature) {
        Ok(f) => f,
        Err(resp) => return resp,
    };
    let units = body.units.unwrap_or(1);
    let metadata = body.metadata;

    let engine = Arc::clone(&state.engine);
    let result = match run_engine(move || engine.consume(&account_id, feature, units, metadata)).await
    {
        Ok(result) => result,
        Err(resp) => return resp,
    };

    match result.failure {
        None => to_json(&result),
        Some(ConsumeFailure::AccountNotFound) => {
            error_body(StatusCode::NOT_FOUND, "Account not found")
        }
        // Lost races and empty pools look the same to the end user.
        Some(ConsumeFailure::InsufficientCredits | ConsumeFailure::ConcurrentUpdateLost) => (
            StatusCode::PAYMENT_REQUIRED,
            Json(serde_json::json!({
                "success": false,
                "feature": result.feature,
                "error": result.message,
            })),
        ),
    }
}

/// GET /api/user/credits
async fn handle_user_credits(State(state): State<AppState>, headers: HeaderMap) -> ApiResponse {
    let account_id = match require_account_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let engine = Arc::clone(&state.engine);
    match run_engine(move || engine.balance(&account_id)).await {
        Ok(summary) => to_json(&summary),
        Err(resp) => resp,
    }
}

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub limit: Option<usize>,
}

/// GET /api/user/usage?limit=N
async fn handle_user_usage(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<UsageQuery>,
) -> ApiResponse {
    let account_id = match require_account_id(&headers) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let limit = query
        .limit
        .unwrap_or(DEFAULT_USAGE_LIMIT)
        .clamp(1, MAX_USAGE_LIMIT);

    let engine = Arc::clone(&state.engine);
    match run_engine(move || engine.recent_usage(&account_id, limit)).await {
        Ok(records) => to_json(&serde_json::json!({ "records": records })),
        Err(resp) => resp,
    }
}

fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}

/// Check `Authorization: Bearer <token>` against the hashed admin token.
fn authenticate_admin(state: &AppState, headers: &HeaderMap) -> bool {
    let Some(ref expected) = state.admin_token_hash else {
        return false;
    };
    match extract_bearer_token(headers).map(str::trim) {
        Some(token) if !token.is_empty() => constant_time_eq(&hash_token(token), expected),
        _ => false,
    }
}

#[derive(Debug, Deserialize)]
struct AdminCreditBody {
    account_id: String,
    pool: String,
    #[serde(default)]
    feature: Option<String>,
    amount: u64,
}

fn grant_target(pool: &str, feature: Option<&str>) -> Result<PoolTarget, ApiResponse> {
    match pool.trim() {
        "general" => Ok(PoolTarget::General),
        "paid" => {
            let feature = feature.ok_or_else(|| {
                error_body(StatusCode::BAD_REQUEST, "Paid credits need a feature")
            })?;
            Ok(PoolTarget::Paid(parse_feature(feature)?))
        }
        "free" => Err(error_body(
            StatusCode::BAD_REQUEST,
            BillingError::InvalidPool.to_string(),
        )),
        other => Err(error_body(
            StatusCode::BAD_REQUEST,
            format!("Unknown pool '{other}'"),
        )),
    }
}

/// POST /api/admin/credits
async fn handle_admin_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AdminCreditBody>, JsonRejection>,
) -> ApiResponse {
    if !authenticate_admin(&state, &headers) {
        return error_body(StatusCode::UNAUTHORIZED, "Unauthorized");
    }
    let Json(body) = match body {
        Ok(b) => b,
        Err(e) => return bad_json(&e),
    };
    let target = match grant_target(&body.pool, body.feature.as_deref()) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let engine = Arc::clone(&state.engine);
    let account_id = body.account_id.clone();
    let amount = body.amount;
    match run_engine(move || engine.add_credits(&account_id, target, amount)).await {
        Ok(balance) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "account_id": body.account_id,
                "pool": target.kind(),
                "balance": balance,
            })),
        ),
        Err(resp) => resp,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::billing::{
        Account, EngineSettings, InMemoryLedgerStore, NO_CREDITS_MESSAGE, SubscriptionStatus,
        SubscriptionTier,
    };
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(admin_token: &str) -> AppState {
        let store = Arc::new(InMemoryLedgerStore::new());
        let engine = CreditEngine::with_system_clock(store.clone(), store, EngineSettings::default());
        engine.upsert_account(&Account::new("acct")).unwrap();
        AppState::new(Arc::new(engine), admin_token)
    }

    fn account_headers(id: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ACCOUNT_HEADER, HeaderValue::from_str(id).unwrap());
        headers
    }

    fn body_json(resp: ApiResponse) -> (StatusCode, serde_json::Value) {
        (resp.0, resp.1 .0)
    }

    fn use_body(feature: &str, units: Option<u64>) -> Result<Json<UseFeatureBody>, JsonRejection> {
        Ok(Json(UseFeatureBody {
            feature: feature.into(),
            units,
            metadata: None,
        }))
    }

    #[test]
    fn security_body_limit_is_64kb() {
        assert_eq!(MAX_BODY_SIZE, 65_536);
    }

    #[test]
    fn app_state_is_clone() {
        fn assert_clone<T: Clone>() {}
        assert_clone::<AppState>();
    }

    #[test]
    fn empty_admin_token_disables_grants() {
        let state = test_state("   ");
        assert!(state.admin_token_hash.is_none());
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer "));
        assert!(!authenticate_admin(&state, &headers));
    }

    #[test]
    fn admin_token_is_checked_against_hash() {
        let state = test_state("s3cret");
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));
        assert!(authenticate_admin(&state, &headers));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cre"));
        assert!(!authenticate_admin(&state, &headers));
    }

    #[tokio::test]
    async fn check_availability_requires_account_header() {
        let state = test_state("");
        let resp = handle_check_availability(
            State(state),
            HeaderMap::new(),
            Ok(Json(FeatureBody {
                feature: "image_upscale".into(),
            })),
        )
        .await;
        assert_eq!(resp.0, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn check_availability_reports_free_pool() {
        let state = test_state("");
        let (status, body) = body_json(
            handle_check_availability(
                State(state),
                account_headers("acct"),
                Ok(Json(FeatureBody {
                    feature: "background_removal".into(),
                })),
            )
            .await,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["allowed"], true);
        assert_eq!(body["paying_pool"], "free");
        assert_eq!(body["remaining"], 5);
    }

    #[tokio::test]
    async fn unknown_feature_is_bad_request() {
        let state = test_state("");
        let resp = handle_check_availability(
            State(state),
            account_headers("acct"),
            Ok(Json(FeatureBody {
                feature: "teleport".into(),
            })),
        )
        .await;
        assert_eq!(resp.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_account_is_not_found() {
        let state = test_state("");
        let resp = handle_check_availability(
            State(state.clone()),
            account_headers("ghost"),
            Ok(Json(FeatureBody {
                feature: "image_upscale".into(),
            })),
        )
        .await;
        assert_eq!(resp.0, StatusCode::NOT_FOUND);

        let resp = handle_use_feature(
            State(state),
            account_headers("ghost"),
            use_body("image_upscale", None),
        )
        .await;
        assert_eq!(resp.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn use_feature_returns_402_when_exhausted() {
        let state = test_state("");
        for remaining in [2, 1, 0] {
            let (status, body) = body_json(
                handle_use_feature(
                    State(state.clone()),
                    account_headers("acct"),
                    use_body("image_upscale", None),
                )
                .await,
            );
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["remaining_after"], remaining);
        }

        let (status, body) = body_json(
            handle_use_feature(
                State(state),
                account_headers("acct"),
                use_body("image_upscale", None),
            )
            .await,
        );
        assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
        assert_eq!(body["error"], NO_CREDITS_MESSAGE);
        assert!(body.get("failure").is_none());
    }

    #[tokio::test]
    async fn use_feature_rejects_out_of_range_units() {
        let state = test_state("");
        let resp = handle_use_feature(
            State(state),
            account_headers("acct"),
            use_body("image_upscale", Some(11)),
        )
        .await;
        assert_eq!(resp.0, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn subscription_consumption_reports_unlimited() {
        let state = test_state("");
        state
            .engine
            .upsert_account(
                &Account::new("acct")
                    .with_subscription(SubscriptionTier::Enterprise, SubscriptionStatus::Active),
            )
            .unwrap();
        let (status, body) = body_json(
            handle_use_feature(
                State(state),
                account_headers("acct"),
                use_body("image_editing", Some(2)),
            )
            .await,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["paying_pool"], "subscription");
        assert_eq!(body["remaining_after"], "unlimited");
    }

    #[tokio::test]
    async fn admin_grant_then_user_credits() {
        let state = test_state("s3cret");
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer s3cret"));

        let grant = |pool: &str,
                     feature: Option<&str>,
                     amount: u64|
         -> Result<Json<AdminCreditBody>, JsonRejection> {
            Ok(Json(AdminCreditBody {
                account_id: "acct".into(),
                pool: pool.into(),
                feature: feature.map(str::to_string),
                amount,
            }))
        };

        let (status, body) = body_json(
            handle_admin_credits(
                State(state.clone()),
                headers.clone(),
                grant("general", None, 25),
            )
            .await,
        );
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["balance"], 25);

        let resp =
            handle_admin_credits(State(state.clone()), headers.clone(), grant("free", None, 5)).await;
        assert_eq!(resp.0, StatusCode::BAD_REQUEST);

        let resp =
            handle_admin_credits(State(state.clone()), headers.clone(), grant("paid", None, 5)).await;
        assert_eq!(resp.0, StatusCode::BAD_REQUEST);

        let resp =
            handle_admin_credits(State(state.clone()), HeaderMap::new(), grant("general", None, 5)).await;
        assert_eq!(resp.0, StatusCode::UNAUTHORIZED);

        let (status, body) =
            body_json(handle_user_credits(State(state), account_headers("acct")).await);
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["general_tokens"], 25);
        assert_eq!(body["free_counters"]["image_upscale"], 3);
    }

    #[tokio::test]
    async fn usage_endpoint_lists_newest_first() {
        let state = test_state("");
        for feature in ["image_upscale", "background_removal"] {
            let (status, _) = handle_use_feature(
                State(state.clone()),
                account_headers("acct"),
                use_body(feature, None),
            )
            .await;
            assert_eq!(status, StatusCode::OK);
        }
        let (status, body) = body_json(
            handle_user_usage(
                State(state),
                account_headers("acct"),
                Query(UsageQuery { limit: Some(1) }),
            )
            .await,
        );
        assert_eq!(status, StatusCode::OK);
        let records = body["records"].as_array().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["feature"], "background_removal");
    }

    #[tokio::test]
    async fn router_serves_health() {
        let app = router(test_state(""));
        let resp = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let payload = resp.into_body().collect().await.unwrap().to_bytes();
        let parsed: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert_eq!(parsed["status"], "ok");
        assert_eq!(parsed["backend"], "memory");
    }

    #[tokio::test]
    async fn router_rejects_oversized_body() {
        let app = router(test_state(""));
        let padding = "x".repeat(MAX_BODY_SIZE + 1);
        let body = serde_json::json!({ "feature": "image_upscale", "padding": padding }).to_string();
        let resp = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/features/check-availability")
                    .header(header::CONTENT_TYPE, "application/json")
                    .header(header::CONTENT_LENGTH, body.len())
                    .header(ACCOUNT_HEADER, "acct")
                    .body(Body::from(body))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
