//! Builds the axum `Router` and runs it, mirroring the teacher's
//! `server::run_server`/`app` split: `app()` is pure (testable with
//! `tower::ServiceExt::oneshot`), `run_server()` adds the network listener
//! and graceful shutdown.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::middleware as axum_middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::admin::AdminAuthError;
use crate::config::BuildConfig;
use crate::state::{AppState, SharedState};

pub fn app(state: SharedState) -> Router {
    let gated = Router::new()
        .route("/v1/chat/completions", post(crate::handler::chat_completions))
        .route_layer(axum_middleware::from_fn_with_state(state.clone(), crate::stamp_gate::stamp_gate));

    let admin = Router::new()
        .route("/stats", get(stats))
        .route("/v1/gate/balance", get(gate_balance))
        .route("/v1/gate/melt", post(melt_onchain))
        .route("/homo/melt", post(melt_lightning))
        .route("/v1/gate/melt-ln", post(melt_lightning))
        .route("/homo/balance", get(homo_balance))
        .route("/homo/withdraw", post(withdraw))
        .route("/homo/cleanup", post(cleanup))
        .route("/homo/ui", get(dashboard))
        .route("/v1/gate/metrics", get(metrics_read))
        .route("/v1/gate/metrics/summary", get(metrics_summary))
        .route("/v1/gate/metrics/errors", get(metrics_read))
        .route("/v1/gate/token-errors", get(token_errors_read))
        .route("/v1/gate/token-errors/summary", get(token_errors_summary));

    let public = Router::new()
        .route("/", get(landing))
        .route("/health", get(health))
        .route("/v1/info", get(info))
        .route("/v1/pricing", get(pricing_route));

    let allow_origin = if state.config.allowed_origins.is_empty() {
        AllowOrigin::any()
    } else {
        let origins: Vec<_> = state
            .config
            .allowed_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        AllowOrigin::list(origins)
    };

    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any)
        .allow_origin(allow_origin);

    Router::new()
        .merge(public)
        .merge(gated)
        .merge(admin)
        .layer(axum_middleware::map_response(add_version_header))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

async fn add_version_header(mut response: Response) -> Response {
    response
        .headers_mut()
        .insert("X-Gate-Version", BuildConfig::version().parse().unwrap());
    response
}

async fn landing() -> impl IntoResponse {
    Json(json!({
        "name": "stampgate",
        "version": BuildConfig::version(),
        "description": "payment-metered reverse proxy for LLM chat-completion APIs, settled in Cashu ecash",
    }))
}

async fn health(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "mints": state.trusted_mints.iter().map(|u| u.to_string()).collect::<Vec<_>>(),
        "upstreams": state.upstreams.configured_patterns(),
    }))
}

async fn info() -> impl IntoResponse {
    Json(json!({
        "name": "stampgate",
        "version": BuildConfig::version(),
        "description": "payment-metered reverse proxy for LLM chat-completion APIs, settled in Cashu ecash",
    }))
}

async fn pricing_route(State(state): State<SharedState>) -> impl IntoResponse {
    Json(json!({
        "models": state.pricing_rules,
        "exchange_rate": { "usd_to_units": crate::pricing::USD_TO_UNITS },
    }))
}

fn require_admin(state: &SharedState, headers: &HeaderMap, token: Option<&str>) -> Result<(), Response> {
    match state.admin.check(headers, token) {
        Ok(()) => Ok(()),
        Err(AdminAuthError::NotConfigured) => {
            Err((StatusCode::SERVICE_UNAVAILABLE, Json(json!({ "error": "Admin endpoint not available" }))).into_response())
        }
        Err(AdminAuthError::Locked) => Err((StatusCode::TOO_MANY_REQUESTS, Json(json!({ "error": "too many requests" }))).into_response()),
        Err(AdminAuthError::Unauthorized) => Err((StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()),
    }
}

async fn stats(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let now = chrono::Utc::now();
    let today = now.format("%Y-%m-%d").to_string();
    let days: Vec<String> = (0..7)
        .map(|i| (now - chrono::Duration::days(i)).format("%Y-%m-%d").to_string())
        .collect();

    let today_summary = crate::metrics::summarize_range(state.kv.as_ref(), std::slice::from_ref(&today)).await;
    let week_summary = crate::metrics::summarize_range(state.kv.as_ref(), &days).await;
    Json(json!({ "today": today_summary, "last_7_days": week_summary })).into_response()
}

async fn gate_balance(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    match state.store.balance().await {
        Ok(balance) => Json(json!({ "balance_units": balance, "unit": "usd" })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

async fn homo_balance(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    match state.store.owned_proofs().await {
        Ok(owned) => {
            let entry_count = owned.iter().map(|o| &o.entry_key).collect::<std::collections::HashSet<_>>().len();
            let balance: u64 = owned.iter().map(|o| o.proof.amount).sum();
            Json(json!({
                "balance_units": balance,
                "proof_count": owned.len(),
                "entry_count": entry_count,
            }))
            .into_response()
        }
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct InvoiceBody {
    invoice: String,
}

async fn melt_lightning(State(state): State<SharedState>, headers: HeaderMap, Json(body): Json<InvoiceBody>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let keys = match state.wallet_cache.get_or_fetch(&state.http, &state.config.treasury.mint_url).await {
        Ok(k) => k,
        Err(err) => return (StatusCode::BAD_GATEWAY, Json(json!({ "error": "mint error", "details": err.to_string() }))).into_response(),
    };
    match crate::treasury::melt_lightning(&state.http, &state.store, &state.config.treasury.mint_url, &keys, &body.invoice).await {
        Ok(result) => Json(result).into_response(),
        Err(crate::treasury::TreasuryError::InsufficientBalance { have, need }) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "insufficient balance", "balance": have, "required": need }))).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": "melt failed", "details": err.to_string() }))).into_response(),
    }
}

async fn melt_onchain(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let keys = match state.wallet_cache.get_or_fetch(&state.http, &state.config.treasury.mint_url).await {
        Ok(k) => k,
        Err(err) => return (StatusCode::BAD_GATEWAY, Json(json!({ "error": "mint error", "details": err.to_string() }))).into_response(),
    };
    let balance = match state.store.balance().await {
        Ok(b) => b,
        Err(err) => return (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": err.to_string() }))).into_response(),
    };
    match crate::treasury::melt_onchain(
        &state.http,
        &state.store,
        &state.config.treasury.mint_url,
        &keys,
        &state.config.treasury.wallet_address,
        &state.config.treasury.chain_tag,
        balance,
    )
    .await
    {
        Ok(result) => Json(result).into_response(),
        Err(crate::treasury::TreasuryError::InsufficientBalance { have, need }) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "insufficient balance", "balance": have, "required": need }))).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": "melt failed", "details": err.to_string() }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct WithdrawBody {
    amount: u64,
}

async fn withdraw(State(state): State<SharedState>, headers: HeaderMap, Json(body): Json<WithdrawBody>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    if body.amount == 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({ "error": "amount must be a positive integer" }))).into_response();
    }
    match crate::treasury::withdraw(
        &state.http,
        &state.store,
        &state.config.treasury.mint_url,
        &state.breaker,
        &state.wallet_cache,
        body.amount,
    )
    .await
    {
        Ok(result) => Json(result).into_response(),
        Err(crate::treasury::TreasuryError::InsufficientBalance { have, need }) => {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": "insufficient balance", "balance": have, "required": need }))).into_response()
        }
        Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": "withdraw failed", "details": err.to_string() }))).into_response(),
    }
}

async fn cleanup(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    match crate::treasury::cleanup(&state.http, &state.store, &state.breaker, &state.wallet_cache).await {
        Ok(result) => Json(result).into_response(),
        Err(err) => (StatusCode::BAD_GATEWAY, Json(json!({ "error": "cleanup failed", "details": err.to_string() }))).into_response(),
    }
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

async fn dashboard(State(state): State<SharedState>, headers: HeaderMap, Query(query): Query<TokenQuery>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, query.token.as_deref()) {
        return resp;
    }
    axum::response::Html(include_str!("../assets/dashboard.html")).into_response()
}

#[derive(Debug, Deserialize)]
struct DateRangeQuery {
    start: Option<String>,
    end: Option<String>,
}

fn date_range(query: &DateRangeQuery) -> Vec<String> {
    let end = query
        .end
        .clone()
        .unwrap_or_else(|| chrono::Utc::now().format("%Y-%m-%d").to_string());
    let start = query.start.clone().unwrap_or_else(|| end.clone());
    let (Ok(start_date), Ok(end_date)) = (
        chrono::NaiveDate::parse_from_str(&start, "%Y-%m-%d"),
        chrono::NaiveDate::parse_from_str(&end, "%Y-%m-%d"),
    ) else {
        return vec![chrono::Utc::now().format("%Y-%m-%d").to_string()];
    };
    let mut days = Vec::new();
    let mut cursor = start_date;
    while cursor <= end_date {
        days.push(cursor.format("%Y-%m-%d").to_string());
        cursor += chrono::Duration::days(1);
    }
    days
}

async fn metrics_read(State(state): State<SharedState>, headers: HeaderMap, Query(query): Query<DateRangeQuery>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let days = date_range(&query);
    let mut records = Vec::new();
    for day in &days {
        records.extend(crate::metrics::fetch_metrics_for_day(state.kv.as_ref(), day).await);
    }
    Json(records).into_response()
}

async fn metrics_summary(State(state): State<SharedState>, headers: HeaderMap, Query(query): Query<DateRangeQuery>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let days = date_range(&query);
    Json(crate::metrics::summarize_range(state.kv.as_ref(), &days).await).into_response()
}

async fn token_errors_read(State(state): State<SharedState>, headers: HeaderMap, Query(query): Query<DateRangeQuery>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let days = date_range(&query);
    let mut records = Vec::new();
    for day in &days {
        records.extend(crate::metrics::fetch_token_errors_for_day(state.kv.as_ref(), day).await);
    }
    Json(records).into_response()
}

async fn token_errors_summary(State(state): State<SharedState>, headers: HeaderMap, Query(query): Query<DateRangeQuery>) -> Response {
    if let Err(resp) = require_admin(&state, &headers, None) {
        return resp;
    }
    let days = date_range(&query);
    Json(crate::metrics::summarize_token_error_range(state.kv.as_ref(), &days).await).into_response()
}

pub async fn run_server(state: Arc<AppState>) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.server.host, state.config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "stampgate listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
}
