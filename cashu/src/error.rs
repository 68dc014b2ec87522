//! Errors raised by the Cashu primitives in this crate.

use base64::DecodeError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CashuError {
    #[error("Secp256k1Error {0}")]
    Secp256k1Error(#[from] secp256k1::Error),

    #[error("InvalidTokenPrefix")]
    InvalidTokenPrefix,

    #[error("Base64DecodeError {0}")]
    Base64DecodeError(#[from] DecodeError),

    #[error("SerdeJsonError {0}")]
    SerdeJsonError(#[from] serde_json::Error),

    #[error("CborDecodeError {0}")]
    CborDecodeError(String),

    #[error("CborEncodeError {0}")]
    CborEncodeError(String),

    #[error("Not enough tokens")]
    NotEnoughTokens,

    #[error("Invalid token")]
    InvalidToken,

    #[error("Empty token")]
    EmptyToken,

    #[error("Missing mint")]
    MissingMint,

    #[error("No proofs in token")]
    NoProofs,

    #[error("Too many proofs in token")]
    TooManyProofs,

    #[error("Unsupported token version")]
    UnsupportedVersion,
}
