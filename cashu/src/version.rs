//! Cashu token version detection by prefix.

use crate::token::TOKEN_PREFIX_V3;
use crate::token_v4::TOKEN_PREFIX_V4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenVersion {
    V3,
    V4,
    Unknown,
}

impl TokenVersion {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenVersion::V3 => "V3",
            TokenVersion::V4 => "V4",
            TokenVersion::Unknown => "unknown",
        }
    }
}

/// Detects a token's encoding purely from its prefix: `"cashuA"` is V3 (JSON),
/// `"cashuB"` is V4 (CBOR). Anything else is unknown.
pub fn detect_version(raw: &str) -> TokenVersion {
    if raw.starts_with(TOKEN_PREFIX_V3) {
        TokenVersion::V3
    } else if raw.starts_with(TOKEN_PREFIX_V4) {
        TokenVersion::V4
    } else {
        TokenVersion::Unknown
    }
}
