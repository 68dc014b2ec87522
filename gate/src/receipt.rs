//! The cryptographic receipt attached to every successful response (§3).

use bitcoin_hashes::{sha256, Hash};
use cashu::Proof;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: String,
    pub timestamp: String,
    pub amount: u64,
    pub unit: &'static str,
    pub model: String,
    pub token_hash: String,
}

/// First 16 hex chars of SHA-256(secrets joined by `|`); deterministic for
/// an identical, identically-ordered set of secrets.
pub fn token_hash(proofs: &[Proof]) -> String {
    let joined = proofs
        .iter()
        .map(|p| p.secret.as_str())
        .collect::<Vec<_>>()
        .join("|");
    let digest = sha256::Hash::hash(joined.as_bytes());
    hex::encode(digest.as_byte_array())[..16].to_string()
}

impl Receipt {
    pub fn new(amount: u64, model: String, proofs: &[Proof]) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            amount,
            unit: "usd",
            model,
            token_hash: token_hash(proofs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn proof(secret: &str) -> Proof {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[3u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        Proof::new(1, secret.to_string(), pk, "ks".to_string())
    }

    #[test]
    fn token_hash_is_deterministic() {
        let proofs = vec![proof("a"), proof("b")];
        assert_eq!(token_hash(&proofs), token_hash(&proofs));
    }

    #[test]
    fn token_hash_is_order_sensitive() {
        let forward = vec![proof("a"), proof("b")];
        let backward = vec![proof("b"), proof("a")];
        assert_ne!(token_hash(&forward), token_hash(&backward));
    }

    #[test]
    fn token_hash_is_16_hex_chars() {
        let hash = token_hash(&[proof("a")]);
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
