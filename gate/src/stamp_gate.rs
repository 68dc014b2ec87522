//! Component C: the stamp-gate payment middleware — the heart of the
//! pipeline. Runs strictly in order (§4.C); every early return fires a
//! metric, and a decode failure additionally logs a token-decode error.

use axum::body::{to_bytes, Body};
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use bitcoin_hashes::{sha256, Hash};
use cashu::Proofs;
use serde_json::Value;
use std::sync::OnceLock;

use crate::metrics::{record_metric_async, record_token_error_async, MetricRecord, TokenErrorRecord};
use crate::mint_client::RedeemOutcome;
use crate::pricing::{self, PricingRule};
use crate::state::SharedState;
use crate::token::{self, Stamp};

const MAX_BODY_BYTES: usize = 2 * 1024 * 1024;

/// Everything downstream handlers need, attached to the request as an
/// extension once the gate has committed the redeem.
#[derive(Clone)]
pub struct GateContext {
    pub stamp: Stamp,
    pub rule: PricingRule,
    pub body: Value,
    pub charged_price: u64,
    pub keep: Proofs,
    pub change: Proofs,
    pub kv_key: Option<String>,
}

static RANDOM_SALT: OnceLock<String> = OnceLock::new();

fn ip_hash_salt(state: &SharedState) -> String {
    if let Some(salt) = &state.config.ip_hash_salt {
        return salt.clone();
    }
    RANDOM_SALT
        .get_or_init(|| {
            tracing::warn!("no IP_HASH_SALT configured, generating a process-random salt");
            cashu::generate_random_string()
        })
        .clone()
}

fn hash_ip(ip: &str, salt: &str) -> String {
    let digest = sha256::Hash::hash(format!("{ip}{salt}").as_bytes());
    hex::encode(digest.as_byte_array())[..16].to_string()
}

fn json_error(status: StatusCode, code: &str, message: &str, extra: Vec<(&str, Value)>) -> Response {
    let mut body = serde_json::json!({ "error": { "code": code, "message": message } });
    if let Some(obj) = body.get_mut("error").and_then(|v| v.as_object_mut()) {
        for (key, value) in extra {
            obj.insert(key.to_string(), value);
        }
    }
    (status, axum::Json(body)).into_response()
}

fn price_header(rule: Option<&PricingRule>, model: &str) -> HeaderValue {
    let mut body = match rule {
        Some(rule) => serde_json::to_value(rule).unwrap_or_default(),
        None => serde_json::json!({ "model": model }),
    };
    if let Some(obj) = body.as_object_mut() {
        obj.insert("unit".to_string(), Value::from("usd"));
    }
    HeaderValue::from_str(&body.to_string()).unwrap_or_else(|_| HeaderValue::from_static("{}"))
}

async fn emit_metric(
    state: &SharedState,
    model: &str,
    status: u16,
    ecash_in: u64,
    price: u64,
    change: u64,
    refunded: bool,
    upstream_ms: u64,
    error_code: Option<&str>,
    mint: &str,
    stream: bool,
) {
    record_metric_async(
        state.kv.clone(),
        MetricRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model: model.to_string(),
            status,
            ecash_in,
            price,
            change,
            refunded,
            upstream_ms,
            error_code: error_code.map(|s| s.to_string()),
            mint: mint.to_string(),
            stream,
        },
    );
}

/// The stamp-gate middleware entry point, registered via
/// `axum::middleware::from_fn_with_state`.
pub async fn stamp_gate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    request: Request<Body>,
    next: Next,
) -> Response {
    let ip = crate::admin::AdminAuth::extract_ip(&headers);
    let ip_hash = hash_ip(&ip, &ip_hash_salt(&state));
    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    // Step 1: no X-Cashu header.
    let Some(raw_token) = headers.get("X-Cashu").and_then(|v| v.to_str().ok()) else {
        emit_metric(&state, "unknown", 402, 0, 0, 0, false, 0, Some("payment_required"), "", false).await;
        let mut response = json_error(
            StatusCode::PAYMENT_REQUIRED,
            "payment_required",
            "attach an X-Cashu token to this request",
            vec![],
        );
        response
            .headers_mut()
            .insert("X-Cashu-Price", price_header(None, "unknown"));
        return response;
    };

    // Step 2: decode failure.
    let (stamp, diagnostics) = token::decode_with_diagnostics(raw_token);
    let Some(stamp) = stamp else {
        record_token_error_async(
            state.kv.clone(),
            TokenErrorRecord {
                timestamp: chrono::Utc::now().to_rfc3339(),
                token_version: diagnostics.token_version,
                error: diagnostics.error.unwrap_or_default(),
                raw_prefix: diagnostics.raw_prefix,
                raw_token: raw_token.to_string(),
                decode_time_ms: diagnostics.decode_time_ms,
                raw_cbor_structure: diagnostics.raw_cbor_structure,
                ip_hash,
                user_agent,
            },
        );
        emit_metric(&state, "unknown", 400, 0, 0, 0, false, 0, Some("invalid_token"), "", false).await;
        return json_error(StatusCode::BAD_REQUEST, "invalid_token", "could not decode the X-Cashu token", vec![]);
    };

    // Step 3: untrusted mint.
    if !token::mint_is_trusted(&stamp.mint, &state.trusted_mints) {
        emit_metric(&state, "unknown", 400, stamp.amount, 0, 0, false, 0, Some("untrusted_mint"), stamp.mint.as_str(), false).await;
        return json_error(StatusCode::BAD_REQUEST, "untrusted_mint", "token mint is not trusted", vec![]);
    }

    // Parse the body at most once; cache it for downstream handlers.
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, MAX_BODY_BYTES).await {
        Ok(b) => b,
        Err(_) => {
            emit_metric(&state, "unknown", 400, stamp.amount, 0, 0, false, 0, Some("invalid_request"), stamp.mint.as_str(), false).await;
            return json_error(StatusCode::BAD_REQUEST, "invalid_request", "could not read request body", vec![]);
        }
    };
    let parsed: Value = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(_) => {
            emit_metric(&state, "unknown", 400, stamp.amount, 0, 0, false, 0, Some("invalid_request"), stamp.mint.as_str(), false).await;
            return json_error(StatusCode::BAD_REQUEST, "invalid_request", "request body is not valid JSON", vec![]);
        }
    };

    // Step 4: body missing `model`.
    let Some(model) = parsed.get("model").and_then(|v| v.as_str()).map(str::to_string) else {
        emit_metric(&state, "unknown", 400, stamp.amount, 0, 0, false, 0, Some("invalid_request"), stamp.mint.as_str(), false).await;
        return json_error(StatusCode::BAD_REQUEST, "invalid_request", "request body is missing `model`", vec![]);
    };

    // Step 5: no pricing rule.
    let Some(rule) = pricing::resolve(&model, &state.pricing_rules) else {
        emit_metric(&state, &model, 400, stamp.amount, 0, 0, false, 0, Some("model_not_found"), stamp.mint.as_str(), false).await;
        return json_error(StatusCode::BAD_REQUEST, "model_not_found", &format!("unknown model: {model}"), vec![]);
    };

    let input_tokens = parsed
        .get("messages")
        .and_then(|v| v.as_array())
        .map(|msgs| pricing::estimate_input_tokens(msgs))
        .unwrap_or(0);
    let check = pricing::validate_amount(stamp.amount, &rule, input_tokens);

    // Step 6: insufficient payment.
    if !check.ok {
        emit_metric(&state, &model, 402, stamp.amount, 0, 0, false, 0, Some("insufficient_payment"), stamp.mint.as_str(), false).await;
        let mut response = json_error(
            StatusCode::PAYMENT_REQUIRED,
            "insufficient_payment",
            "provided amount is less than the required price",
            vec![
                ("required", Value::from(check.required)),
                ("provided", Value::from(check.provided)),
            ],
        );
        response
            .headers_mut()
            .insert("X-Cashu-Price", price_header(Some(&rule), &model));
        return response;
    }

    // Redeem is a barrier: the upstream call never begins until this
    // commits or fails.
    let outcome = crate::mint_client::redeem(
        &state.http,
        &state.breaker,
        &state.wallet_cache,
        &stamp.mint,
        &stamp.proofs,
        Some(check.required),
    )
    .await;

    let (keep, change) = match outcome {
        RedeemOutcome::Ok { keep, change } => (keep, change),
        RedeemOutcome::Spent => {
            emit_metric(&state, &model, 400, stamp.amount, 0, 0, false, 0, Some("token_spent"), stamp.mint.as_str(), false).await;
            return json_error(StatusCode::BAD_REQUEST, "token_spent", "this token has already been spent", vec![]);
        }
        RedeemOutcome::Timeout => {
            emit_metric(&state, &model, 504, stamp.amount, 0, 0, false, 0, Some("gateway_timeout"), stamp.mint.as_str(), false).await;
            return json_error(StatusCode::GATEWAY_TIMEOUT, "gateway_timeout", "timed out talking to the mint", vec![]);
        }
        RedeemOutcome::CircuitOpen | RedeemOutcome::Other(_) => {
            emit_metric(&state, &model, 500, stamp.amount, 0, 0, false, 0, Some("redeem_failed"), stamp.mint.as_str(), false).await;
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "redeem_failed", "the mint rejected this redeem", vec![]);
        }
    };

    let kv_key = match state.store.store(stamp.mint.clone(), keep.clone()).await {
        Ok(key) => Some(key),
        Err(err) => {
            tracing::error!(error = %err, "failed to persist redeemed proofs");
            None
        }
    };

    let context = GateContext {
        stamp: stamp.clone(),
        rule,
        body: parsed,
        charged_price: check.required,
        keep,
        change,
        kv_key,
    };

    let mut request = Request::from_parts(parts, Body::from(bytes));
    request.extensions_mut().insert(context);
    next.run(request).await
}
