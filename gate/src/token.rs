//! Component A: decoding the `X-Cashu` header into a [`Stamp`], with
//! diagnostics suitable for the token-error log (component H).

use std::time::Instant;

use cashu::{detect_version, CashuError, Proofs, TokenV3, TokenV4, TokenVersion};
use serde::Serialize;
use url::Url;

const MAX_AMOUNT: u64 = 1 << 31;
const MAX_PROOFS: usize = 256;
const RAW_PREFIX_LEN: usize = 15;

/// A decoded payment envelope, immutable for the lifetime of one request.
#[derive(Debug, Clone)]
pub struct Stamp {
    pub raw: String,
    pub mint: Url,
    pub amount: u64,
    pub proofs: Proofs,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeErrorKind {
    #[error("empty token")]
    Empty,
    #[error("malformed token: {0}")]
    Malformed(String),
    #[error("unsupported token version")]
    UnsupportedVersion,
    #[error("token has no mint")]
    MissingMint,
    #[error("token has no proofs")]
    NoProofs,
    #[error("too many proofs")]
    TooManyProofs,
}

/// Diagnostics captured alongside every decode attempt, used both for the
/// happy path's tracing span and for the token-error log on failure.
#[derive(Debug, Clone, Serialize)]
pub struct Diagnostics {
    pub token_version: String,
    pub raw_prefix: String,
    pub decode_time_ms: u64,
    pub proof_count: usize,
    pub error: Option<String>,
    pub raw_cbor_structure: Option<String>,
}

fn raw_prefix(raw: &str) -> String {
    raw.chars().take(RAW_PREFIX_LEN).collect()
}

/// Pure, side-effect-free decode. Trims surrounding whitespace before
/// looking at the prefix.
pub fn decode(raw: &str) -> Result<Stamp, DecodeErrorKind> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(DecodeErrorKind::Empty);
    }

    let version = detect_version(trimmed);
    let (mint, proofs) = match version {
        TokenVersion::V3 => {
            let parsed = TokenV3::deserialize(trimmed).map_err(map_cashu_err)?;
            let mint = parsed.mint().ok_or(DecodeErrorKind::MissingMint)?;
            (mint, parsed.proofs())
        }
        TokenVersion::V4 => {
            let parsed = TokenV4::deserialize(trimmed).map_err(map_cashu_err)?;
            (parsed.mint.clone(), parsed.proofs.clone())
        }
        TokenVersion::Unknown => return Err(DecodeErrorKind::UnsupportedVersion),
    };

    if proofs.is_empty() {
        return Err(DecodeErrorKind::NoProofs);
    }
    if proofs.len() > MAX_PROOFS {
        return Err(DecodeErrorKind::TooManyProofs);
    }
    let amount = proofs.total_amount();
    if amount > MAX_AMOUNT {
        return Err(DecodeErrorKind::Malformed("amount exceeds maximum".into()));
    }

    Ok(Stamp {
        raw: trimmed.to_string(),
        mint,
        amount,
        proofs,
    })
}

fn map_cashu_err(err: CashuError) -> DecodeErrorKind {
    match err {
        CashuError::EmptyToken => DecodeErrorKind::Empty,
        CashuError::MissingMint => DecodeErrorKind::MissingMint,
        CashuError::NoProofs => DecodeErrorKind::NoProofs,
        CashuError::TooManyProofs => DecodeErrorKind::TooManyProofs,
        CashuError::UnsupportedVersion | CashuError::InvalidTokenPrefix => {
            DecodeErrorKind::UnsupportedVersion
        }
        other => DecodeErrorKind::Malformed(other.to_string()),
    }
}

/// Decode plus full diagnostics, used by the stamp-gate middleware so a
/// failure can be logged to the token-error store without re-parsing.
pub fn decode_with_diagnostics(raw: &str) -> (Option<Stamp>, Diagnostics) {
    let start = Instant::now();
    let version = detect_version(raw.trim());
    let result = decode(raw);
    let decode_time_ms = start.elapsed().as_millis() as u64;

    let raw_cbor_structure = if cfg!(debug_assertions) && result.is_err() && version == TokenVersion::V4 {
        Some(cashu::TokenV4::debug_cbor_dump(raw.trim()))
    } else {
        None
    };

    match result {
        Ok(stamp) => {
            let proof_count = stamp.proofs.len();
            let diagnostics = Diagnostics {
                token_version: version.as_str().to_string(),
                raw_prefix: raw_prefix(raw),
                decode_time_ms,
                proof_count,
                error: None,
                raw_cbor_structure: None,
            };
            (Some(stamp), diagnostics)
        }
        Err(err) => {
            let diagnostics = Diagnostics {
                token_version: version.as_str().to_string(),
                raw_prefix: raw_prefix(raw),
                decode_time_ms,
                proof_count: 0,
                error: Some(err.to_string()),
                raw_cbor_structure,
            };
            (None, diagnostics)
        }
    }
}

/// Encode a set of proofs for a mint as a V4 token, used for change, refund
/// and withdraw responses.
pub fn encode_v4(mint: &Url, unit: &str, proofs: Proofs) -> Result<String, CashuError> {
    TokenV4::new(mint.clone(), unit.to_string(), proofs).serialize()
}

/// Whether `candidate` matches a trusted mint, ignoring a trailing slash.
pub fn mint_is_trusted(candidate: &Url, trusted: &[Url]) -> bool {
    let normalize = |u: &Url| u.as_str().trim_end_matches('/').to_string();
    let candidate = normalize(candidate);
    trusted.iter().any(|t| normalize(t) == candidate)
}
