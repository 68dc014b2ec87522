//! Component E: the chat-completion handler. Runs after the stamp-gate
//! middleware has committed a redeem; resolves the upstream, proxies the
//! request (unary or SSE), and emits the receipt/change/refund.

use axum::body::Body;
use axum::extract::{Extension, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use cashu::Proofs;
use futures_util::StreamExt;
use serde_json::Value;
use std::time::Instant;

use crate::metrics::record_metric_async;
use crate::receipt::Receipt;
use crate::router::is_streaming_response;
use crate::stamp_gate::GateContext;
use crate::state::SharedState;

async fn refund_and_cleanup(state: &SharedState, ctx: &GateContext) -> Option<String> {
    let mut all = ctx.keep.proofs();
    all.extend(ctx.change.proofs());
    if let Some(kv_key) = &ctx.kv_key {
        if let Err(err) = state.store.delete_keys(std::slice::from_ref(kv_key)).await {
            tracing::error!(error = %err, key = %kv_key, "failed to delete refunded kv entry");
        }
    }
    crate::token::encode_v4(&ctx.stamp.mint, "usd", Proofs::new(all)).ok()
}

fn error_body(code: &str, message: &str) -> Value {
    serde_json::json!({ "error": { "code": code, "message": message } })
}

pub async fn chat_completions(State(state): State<SharedState>, Extension(ctx): Extension<GateContext>) -> Response {
    let model = ctx
        .body
        .get("model")
        .and_then(|v| v.as_str())
        .unwrap_or(&ctx.rule.model)
        .to_string();
    let requested_stream = ctx.body.get("stream").and_then(|v| v.as_bool()).unwrap_or(false);

    let Some(route) = state.upstreams.resolve(&ctx.rule.model) else {
        let refund_token = refund_and_cleanup(&state, &ctx).await;
        record_metric_async(
            state.kv.clone(),
            metric(&model, 502, ctx.stamp.amount, ctx.charged_price, ctx.change.total_amount(), true, 0, Some("no_upstream"), &ctx),
        );
        let mut response = (StatusCode::BAD_GATEWAY, axum::Json(error_body("no_upstream", "no upstream configured for this model"))).into_response();
        attach_refund_header(&mut response, refund_token);
        return response;
    };

    let mut body = ctx.body.clone();
    if let Some(obj) = body.as_object_mut() {
        obj.insert("model".to_string(), Value::from(state.upstreams.model_for(route, &model)));
    }

    let start = Instant::now();
    let upstream_result = state
        .http
        .post(format!("{}/v1/chat/completions", route.base_url.trim_end_matches('/')))
        .bearer_auth(&route.api_key)
        .header("Content-Type", "application/json")
        .json(&body)
        .send()
        .await;

    let upstream_response = match upstream_result {
        Ok(response) => response,
        Err(err) => {
            let refund_token = refund_and_cleanup(&state, &ctx).await;
            record_metric_async(
                state.kv.clone(),
                metric(&model, 502, ctx.stamp.amount, ctx.charged_price, ctx.change.total_amount(), true, start.elapsed().as_millis() as u64, Some("upstream_error"), &ctx),
            );
            let mut response = (
                StatusCode::BAD_GATEWAY,
                axum::Json(error_body("upstream_error", &format!("upstream request failed: {err}"))),
            )
                .into_response();
            attach_refund_header(&mut response, refund_token);
            return response;
        }
    };

    let status = upstream_response.status();
    let content_type = upstream_response
        .headers()
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let upstream_ms = start.elapsed().as_millis() as u64;

    if is_streaming_response(requested_stream, content_type.as_deref()) && status.is_success() {
        return stream_response(state, ctx, model, upstream_response, upstream_ms);
    }

    // Unary path.
    let bytes = match upstream_response.bytes().await {
        Ok(b) => b,
        Err(err) => {
            let refund_token = refund_and_cleanup(&state, &ctx).await;
            record_metric_async(
                state.kv.clone(),
                metric(&model, 502, ctx.stamp.amount, ctx.charged_price, ctx.change.total_amount(), true, upstream_ms, Some("upstream_error"), &ctx),
            );
            let mut response = (
                StatusCode::BAD_GATEWAY,
                axum::Json(error_body("upstream_error", &format!("failed reading upstream body: {err}"))),
            )
                .into_response();
            attach_refund_header(&mut response, refund_token);
            return response;
        }
    };

    if !status.is_success() {
        let refund_token = refund_and_cleanup(&state, &ctx).await;
        record_metric_async(
            state.kv.clone(),
            metric(&model, status.as_u16(), ctx.stamp.amount, ctx.charged_price, ctx.change.total_amount(), true, upstream_ms, Some("upstream_error"), &ctx),
        );
        let mut response = (status, bytes).into_response();
        attach_refund_header(&mut response, refund_token);
        return response;
    }

    let receipt = Receipt::new(ctx.charged_price, model.clone(), &ctx.stamp.proofs.proofs());
    let receipt_json = serde_json::to_string(&receipt).unwrap_or_default();

    record_metric_async(
        state.kv.clone(),
        metric(&model, 200, ctx.stamp.amount, ctx.charged_price, ctx.change.total_amount(), false, upstream_ms, None, &ctx),
    );

    let mut response = (StatusCode::OK, bytes).into_response();
    response
        .headers_mut()
        .insert("X-Cashu-Receipt", HeaderValue::from_str(&receipt_json).unwrap_or_else(|_| HeaderValue::from_static("{}")));
    if !ctx.change.is_empty() {
        if let Ok(token) = crate::token::encode_v4(&ctx.stamp.mint, "usd", ctx.change.clone()) {
            if let Ok(value) = HeaderValue::from_str(&token) {
                response.headers_mut().insert("X-Cashu-Change", value);
            }
        }
    }
    response
}

fn attach_refund_header(response: &mut Response, refund_token: Option<String>) {
    if let Some(token) = refund_token {
        if let Ok(value) = HeaderValue::from_str(&token) {
            response.headers_mut().insert("X-Cashu-Refund", value);
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn metric(
    model: &str,
    status: u16,
    ecash_in: u64,
    price: u64,
    change: u64,
    refunded: bool,
    upstream_ms: u64,
    error_code: Option<&str>,
    ctx: &GateContext,
) -> crate::metrics::MetricRecord {
    crate::metrics::MetricRecord {
        timestamp: chrono::Utc::now().to_rfc3339(),
        model: model.to_string(),
        status,
        ecash_in,
        price,
        change,
        refunded,
        upstream_ms,
        error_code: error_code.map(|s| s.to_string()),
        mint: ctx.stamp.mint.to_string(),
        stream: false,
    }
}

/// Pipes the upstream SSE stream through unchanged; appends one
/// `cashu-change` event after the upstream stream ends if there is
/// overpayment. Never attaches the `X-Cashu-Change` header on a streaming
/// response — change is delivered exclusively through the trailing event.
fn stream_response(
    state: SharedState,
    ctx: GateContext,
    model: String,
    upstream_response: reqwest::Response,
    upstream_ms: u64,
) -> Response {
    let receipt = Receipt::new(ctx.charged_price, model.clone(), &ctx.stamp.proofs.proofs());
    let receipt_json = serde_json::to_string(&receipt).unwrap_or_default();
    let change = ctx.change.clone();
    let mint = ctx.stamp.mint.clone();
    let ecash_in = ctx.stamp.amount;
    let price = ctx.charged_price;

    record_metric_async(
        state.kv.clone(),
        crate::metrics::MetricRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model,
            status: 200,
            ecash_in,
            price,
            change: change.total_amount(),
            refunded: false,
            upstream_ms,
            error_code: None,
            mint: mint.to_string(),
            stream: true,
        },
    );

    let upstream_stream = upstream_response.bytes_stream();
    let tail = async move {
        if change.is_empty() {
            return None;
        }
        match crate::token::encode_v4(&mint, "usd", change) {
            Ok(token) => Some(Ok::<_, std::io::Error>(axum::body::Bytes::from(format!(
                "event: cashu-change\ndata: {token}\n\n"
            )))),
            Err(_) => None,
        }
    };

    let body_stream = upstream_stream
        .map(|chunk| chunk.map_err(std::io::Error::other))
        .chain(futures_util::stream::once(tail).filter_map(futures_util::future::ready));

    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(axum::http::header::CONTENT_TYPE, "text/event-stream")
        .header(axum::http::header::CACHE_CONTROL, "no-cache")
        .header(axum::http::header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body_stream))
        .expect("building a streaming response from a fixed header set cannot fail");
    response
        .headers_mut()
        .insert("X-Cashu-Receipt", HeaderValue::from_str(&receipt_json).unwrap_or_else(|_| HeaderValue::from_static("{}")));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_has_code_and_message() {
        let body = error_body("no_upstream", "boom");
        assert_eq!(body["error"]["code"], "no_upstream");
        assert_eq!(body["error"]["message"], "boom");
    }
}
