//! Cashu ecash primitives consumed by the gate: proofs, blind signatures,
//! DHKE, and the V3 (JSON) / V4 (CBOR) token encodings described in NUT-00.
//!
//! This crate treats mint-side signing/verification as out of scope (the
//! gate only ever holds the client half of the protocol) — it gives the
//! gate everything it needs to decode an incoming token, blind outgoing
//! secrets for a swap, and unblind the signatures a mint returns.

pub mod amount;
pub mod blind;
pub mod dhke;
pub mod error;
pub mod proof;
pub mod token;
pub mod token_v4;
pub mod version;

pub use amount::{generate_random_string, generate_random_suffix, split_amount, Amount, SplitAmount};
pub use blind::{BlindedMessage, BlindedSignature, TotalAmount};
pub use dhke::Dhke;
pub use error::CashuError;
pub use proof::{P2SHScript, Proof, Proofs};
pub use token::{Token, TokenV3};
pub use token_v4::TokenV4;
pub use version::{detect_version, TokenVersion};
