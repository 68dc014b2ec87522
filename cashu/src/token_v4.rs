//! TokenV4 — the compact CBOR `"cashuB"` encoding (NUT-00).
//!
//! The JSON-based V3 encoding pads tokens considerably; V4 packs the same
//! proofs into CBOR, grouped by keyset id, and base64url-encodes the result
//! without padding. Encoding/decoding only needs to round-trip through this
//! crate's own `Proofs`/`Token` model — it is not required to be byte-for-byte
//! identical to any particular mint implementation's V4 bytes.

use base64::{engine::general_purpose, Engine as _};
use secp256k1::PublicKey;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    error::CashuError,
    proof::{Proof, Proofs},
    token::Token,
};

pub const TOKEN_PREFIX_V4: &str = "cashuB";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TokenV4Proof {
    #[serde(rename = "a")]
    amount: u64,
    #[serde(rename = "s")]
    secret: String,
    #[serde(rename = "c")]
    c: PublicKey,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TokenV4Entry {
    #[serde(rename = "i")]
    keyset_id: String,
    #[serde(rename = "p")]
    proofs: Vec<TokenV4Proof>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TokenV4Wire {
    #[serde(rename = "m")]
    mint: String,
    #[serde(rename = "u")]
    unit: String,
    #[serde(rename = "t")]
    tokens: Vec<TokenV4Entry>,
    #[serde(rename = "d", skip_serializing_if = "Option::is_none")]
    memo: Option<String>,
}

/// In-memory representation the gate actually works with.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenV4 {
    pub mint: Url,
    pub unit: String,
    pub proofs: Proofs,
    pub memo: Option<String>,
}

impl TokenV4 {
    pub fn new(mint: Url, unit: impl Into<String>, proofs: Proofs) -> Self {
        Self {
            mint,
            unit: unit.into(),
            proofs,
            memo: None,
        }
    }

    pub fn total_amount(&self) -> u64 {
        self.proofs.total_amount()
    }

    pub fn as_token(&self) -> Token {
        Token {
            mint: Some(self.mint.clone()),
            proofs: self.proofs.clone(),
        }
    }

    fn to_wire(&self) -> TokenV4Wire {
        let mut by_keyset: Vec<(String, Vec<TokenV4Proof>)> = Vec::new();
        for proof in self.proofs.proofs() {
            let entry = TokenV4Proof {
                amount: proof.amount,
                secret: proof.secret,
                c: proof.c,
            };
            match by_keyset.iter_mut().find(|(id, _)| *id == proof.keyset_id) {
                Some((_, proofs)) => proofs.push(entry),
                None => by_keyset.push((proof.keyset_id, vec![entry])),
            }
        }

        let mut mint_str = self.mint.as_str().to_owned();
        if mint_str.ends_with('/') {
            mint_str.pop();
        }

        TokenV4Wire {
            mint: mint_str,
            unit: self.unit.clone(),
            tokens: by_keyset
                .into_iter()
                .map(|(keyset_id, proofs)| TokenV4Entry { keyset_id, proofs })
                .collect(),
            memo: self.memo.clone(),
        }
    }

    pub fn serialize(&self) -> Result<String, CashuError> {
        let wire = self.to_wire();
        let mut bytes = Vec::new();
        ciborium::into_writer(&wire, &mut bytes)
            .map_err(|e| CashuError::CborEncodeError(e.to_string()))?;
        Ok(format!(
            "{}{}",
            TOKEN_PREFIX_V4,
            general_purpose::URL_SAFE_NO_PAD.encode(bytes)
        ))
    }

    pub fn deserialize(data: impl Into<String>) -> Result<TokenV4, CashuError> {
        let data = data.into();
        let encoded = data
            .strip_prefix(TOKEN_PREFIX_V4)
            .ok_or(CashuError::InvalidTokenPrefix)?;
        let bytes = general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| general_purpose::URL_SAFE.decode(encoded))?;

        let wire: TokenV4Wire = ciborium::from_reader(bytes.as_slice())
            .map_err(|e| CashuError::CborDecodeError(e.to_string()))?;

        let mint = Url::parse(&wire.mint).map_err(|_| CashuError::MissingMint)?;
        let proofs: Vec<Proof> = wire
            .tokens
            .into_iter()
            .flat_map(|entry| {
                let keyset_id = entry.keyset_id;
                entry.proofs.into_iter().map(move |p| Proof {
                    amount: p.amount,
                    keyset_id: keyset_id.clone(),
                    secret: p.secret,
                    c: p.c,
                    script: None,
                })
            })
            .collect();

        Ok(TokenV4 {
            mint,
            unit: wire.unit,
            proofs: Proofs::new(proofs),
            memo: wire.memo,
        })
    }

    /// Best-effort structure dump of malformed CBOR, for operator diagnostics
    /// on a failed V4 decode. Never fails; falls back to a byte-length summary.
    pub fn debug_cbor_dump(data: &str) -> String {
        let Some(encoded) = data.strip_prefix(TOKEN_PREFIX_V4) else {
            return "no cashuB prefix".to_string();
        };
        let Ok(bytes) = general_purpose::URL_SAFE_NO_PAD
            .decode(encoded)
            .or_else(|_| general_purpose::URL_SAFE.decode(encoded))
        else {
            return "invalid base64url payload".to_string();
        };
        match ciborium::from_reader::<ciborium::value::Value, _>(bytes.as_slice()) {
            Ok(value) => format!("{value:?}"),
            Err(e) => format!("{} raw bytes, cbor parse error: {e}", bytes.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proof(amount: u64, keyset_id: &str) -> Proof {
        Proof::new(
            amount,
            format!("secret-{amount}"),
            crate::dhke::public_key_from_hex(
                "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4",
            )
            .unwrap(),
            keyset_id.to_string(),
        )
    }

    #[test]
    fn test_round_trip() -> anyhow::Result<()> {
        let token = TokenV4::new(
            Url::parse("https://mint.example.com")?,
            "sat",
            Proofs::new(vec![sample_proof(4, "keysetA"), sample_proof(8, "keysetA")]),
        );
        let encoded = token.serialize()?;
        assert!(encoded.starts_with("cashuB"));

        let decoded = TokenV4::deserialize(encoded)?;
        assert_eq!(decoded.mint, token.mint);
        assert_eq!(decoded.unit, token.unit);
        assert_eq!(decoded.total_amount(), 12);
        Ok(())
    }

    #[test]
    fn test_strips_mint_trailing_slash() -> anyhow::Result<()> {
        let token = TokenV4::new(
            Url::parse("https://mint.example.com/")?,
            "sat",
            Proofs::new(vec![sample_proof(4, "keysetA")]),
        );
        let encoded = token.serialize()?;
        let decoded = TokenV4::deserialize(encoded)?;
        assert_eq!(decoded.mint.as_str(), "https://mint.example.com/");
        Ok(())
    }

    #[test]
    fn test_invalid_prefix() {
        assert!(TokenV4::deserialize("cashuAabc").is_err());
    }

    #[test]
    fn test_debug_cbor_dump_never_panics() {
        let _ = TokenV4::debug_cbor_dump("cashuBnotvalidcbor!!!");
        let _ = TokenV4::debug_cbor_dump("no-prefix-at-all");
    }
}
