use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Errors surfaced to HTTP clients and to the stamp-gate middleware.
///
/// Variant names mirror the taxonomy a client needs to branch on: whether to
/// retry with a fresh token, top up, or treat the failure as ours.
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    #[error("payment required")]
    PaymentRequired,

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("token mint is not trusted")]
    UntrustedMint,

    #[error("unknown model: {0}")]
    ModelNotFound(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("insufficient payment: need {needed} sat, got {have} sat")]
    InsufficientPayment { needed: u64, have: u64 },

    #[error("token already spent")]
    TokenSpent,

    #[error("mint rejected redeem: {0}")]
    RedeemFailed(String),

    #[error("upstream timed out")]
    GatewayTimeout,

    #[error("upstream returned {status}: {detail}")]
    UpstreamError { status: StatusCode, detail: String },

    #[error("no upstream configured for this model")]
    NoUpstream,

    #[error("unauthorized")]
    Unauthorized,

    #[error("too many requests")]
    RateLimited,

    #[error("storage error: {0}")]
    Kv(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("mint http error: {0}")]
    MintHttp(#[from] reqwest::Error),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Machine-readable error body returned to clients, `{code, detail}`.
#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    detail: String,
}

impl GateError {
    fn code(&self) -> &'static str {
        match self {
            GateError::PaymentRequired => "payment_required",
            GateError::InvalidToken(_) => "invalid_token",
            GateError::UntrustedMint => "untrusted_mint",
            GateError::ModelNotFound(_) => "model_not_found",
            GateError::InvalidRequest(_) => "invalid_request",
            GateError::InsufficientPayment { .. } => "insufficient_payment",
            GateError::TokenSpent => "token_spent",
            GateError::RedeemFailed(_) => "redeem_failed",
            GateError::GatewayTimeout => "gateway_timeout",
            GateError::UpstreamError { .. } => "upstream_error",
            GateError::NoUpstream => "no_upstream",
            GateError::Unauthorized => "unauthorized",
            GateError::RateLimited => "rate_limited",
            GateError::Kv(_) => "internal_error",
            GateError::Serialization(_) => "internal_error",
            GateError::MintHttp(_) => "mint_unreachable",
            GateError::Config(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            GateError::PaymentRequired => StatusCode::PAYMENT_REQUIRED,
            GateError::InvalidToken(_) => StatusCode::BAD_REQUEST,
            GateError::UntrustedMint => StatusCode::PAYMENT_REQUIRED,
            GateError::ModelNotFound(_) => StatusCode::NOT_FOUND,
            GateError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GateError::InsufficientPayment { .. } => StatusCode::PAYMENT_REQUIRED,
            GateError::TokenSpent => StatusCode::PAYMENT_REQUIRED,
            GateError::RedeemFailed(_) => StatusCode::PAYMENT_REQUIRED,
            GateError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
            GateError::UpstreamError { status, .. } => *status,
            GateError::NoUpstream => StatusCode::BAD_GATEWAY,
            GateError::Unauthorized => StatusCode::UNAUTHORIZED,
            GateError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            GateError::Kv(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GateError::MintHttp(_) => StatusCode::BAD_GATEWAY,
            GateError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, "request rejected");
        }
        let body = ErrorBody {
            code: self.code(),
            detail: self.to_string(),
        };
        (status, axum::Json(body)).into_response()
    }
}

pub type GateResult<T> = Result<T, GateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payment_required_maps_to_402() {
        assert_eq!(GateError::PaymentRequired.status(), StatusCode::PAYMENT_REQUIRED);
        assert_eq!(GateError::TokenSpent.status(), StatusCode::PAYMENT_REQUIRED);
    }

    #[test]
    fn model_not_found_maps_to_404() {
        assert_eq!(
            GateError::ModelNotFound("gpt-9".into()).status(),
            StatusCode::NOT_FOUND
        );
    }

    #[test]
    fn internal_errors_map_to_500() {
        assert_eq!(GateError::Kv("boom".into()).status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn error_codes_are_stable_strings() {
        assert_eq!(GateError::RateLimited.code(), "rate_limited");
        assert_eq!(GateError::NoUpstream.code(), "no_upstream");
    }
}
