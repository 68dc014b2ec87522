//! Component F: the proof store. An append-only KV log of `{mintUrl,
//! proofs[]}` entries under `proofs:<ts-ms>:<rand6>`, with greedy
//! coin-selection for withdraw/melt.

use std::sync::Arc;

use cashu::{generate_random_suffix, Proof, Proofs};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::kv::{KvStore, ListOptions, PutOptions};

const PROOFS_PREFIX: &str = "proofs:";
const LIST_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProofEntry {
    #[serde(rename = "mintUrl")]
    pub mint_url: Url,
    pub proofs: Vec<Proof>,
}

impl ProofEntry {
    pub fn total_amount(&self) -> u64 {
        self.proofs.iter().map(|p| p.amount).sum()
    }
}

/// One proof plus the key of the entry it currently lives in, produced by
/// [`ProofStore::list_all`] for coin-selection.
#[derive(Debug, Clone)]
pub struct OwnedProof {
    pub proof: Proof,
    pub entry_key: String,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Kv(#[from] crate::kv::KvError),
    #[error("corrupt proof entry: {0}")]
    Corrupt(String),
}

#[derive(Clone)]
pub struct ProofStore {
    kv: Arc<dyn KvStore>,
}

impl ProofStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// Append a new entry; never merges with an existing one.
    pub async fn store(&self, mint: Url, proofs: Proofs) -> Result<String, StoreError> {
        let key = format!(
            "{PROOFS_PREFIX}{}:{}",
            chrono::Utc::now().timestamp_millis(),
            generate_random_suffix(6)
        );
        let entry = ProofEntry {
            mint_url: mint,
            proofs: proofs.proofs(),
        };
        let value = serde_json::to_string(&entry).map_err(|e| StoreError::Corrupt(e.to_string()))?;
        self.kv.put(&key, &value, PutOptions::default()).await?;
        Ok(key)
    }

    /// Paginated scan of every entry; malformed values are skipped rather
    /// than failing the whole read.
    pub async fn list_all(&self) -> Result<Vec<(String, ProofEntry)>, StoreError> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .kv
                .list(ListOptions {
                    prefix: Some(PROOFS_PREFIX.to_string()),
                    cursor: cursor.clone(),
                    limit: Some(LIST_PAGE_SIZE),
                })
                .await?;
            for key in &page.keys {
                match self.kv.get(&key.name).await? {
                    Some(raw) => match serde_json::from_str::<ProofEntry>(&raw) {
                        Ok(entry) => out.push((key.name.clone(), entry)),
                        Err(e) => tracing::warn!(key = %key.name, error = %e, "skipping malformed proof entry"),
                    },
                    None => continue,
                }
            }
            if page.list_complete {
                break;
            }
            cursor = page.cursor;
            if cursor.is_none() {
                break;
            }
        }
        Ok(out)
    }

    pub async fn balance(&self) -> Result<u64, StoreError> {
        Ok(self.list_all().await?.iter().map(|(_, e)| e.total_amount()).sum())
    }

    /// Flatten every stored entry into individual owned proofs, for
    /// coin-selection.
    pub async fn owned_proofs(&self) -> Result<Vec<OwnedProof>, StoreError> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .flat_map(|(key, entry)| {
                entry
                    .proofs
                    .into_iter()
                    .map(move |proof| OwnedProof {
                        proof,
                        entry_key: key.clone(),
                    })
            })
            .collect())
    }

    pub async fn delete_keys(&self, keys: &[String]) -> Result<(), StoreError> {
        for key in keys {
            self.kv.delete(key).await?;
        }
        Ok(())
    }

    pub fn kv(&self) -> &Arc<dyn KvStore> {
        &self.kv
    }
}

/// Greedy descending-amount coin selection across every stored proof.
/// Returns the selected proofs and, per touched entry, either the residual
/// proofs to rewrite or `None` meaning the entry is now empty and should be
/// deleted outright.
pub fn select_for_amount(
    mut owned: Vec<OwnedProof>,
    target: u64,
) -> Result<(Vec<Proof>, Vec<(String, Option<Vec<Proof>>)>), StoreError> {
    owned.sort_by(|a, b| b.proof.amount.cmp(&a.proof.amount));

    let mut by_entry: std::collections::HashMap<String, Vec<Proof>> = std::collections::HashMap::new();
    for owned_proof in &owned {
        by_entry
            .entry(owned_proof.entry_key.clone())
            .or_default()
            .push(owned_proof.proof.clone());
    }

    let mut selected = Vec::new();
    let mut touched_keys: Vec<String> = Vec::new();
    let mut accumulated = 0u64;
    for owned_proof in &owned {
        if accumulated >= target {
            break;
        }
        accumulated += owned_proof.proof.amount;
        selected.push(owned_proof.proof.clone());
        if !touched_keys.contains(&owned_proof.entry_key) {
            touched_keys.push(owned_proof.entry_key.clone());
        }
    }

    if accumulated < target {
        return Err(StoreError::Corrupt(format!(
            "insufficient stored balance: have {accumulated}, need {target}"
        )));
    }

    let selected_secrets: std::collections::HashSet<&str> =
        selected.iter().map(|p| p.secret.as_str()).collect();

    let rewrite_plan: Vec<(String, Option<Vec<Proof>>)> = touched_keys
        .into_iter()
        .map(|key| {
            let residual: Vec<Proof> = by_entry
                .remove(&key)
                .unwrap_or_default()
                .into_iter()
                .filter(|p| !selected_secrets.contains(p.secret.as_str()))
                .collect();
            if residual.is_empty() {
                (key, None)
            } else {
                (key, Some(residual))
            }
        })
        .collect();

    Ok((selected, rewrite_plan))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cashu::Proof;
    use secp256k1::{PublicKey, Secp256k1, SecretKey};

    fn dummy_pubkey() -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[7u8; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    fn proof(amount: u64, secret: &str) -> Proof {
        Proof::new(amount, secret.to_string(), dummy_pubkey(), "keyset-1".to_string())
    }

    #[test]
    fn greedy_selection_picks_largest_first() {
        let owned = vec![
            OwnedProof { proof: proof(1, "a"), entry_key: "e1".into() },
            OwnedProof { proof: proof(8, "b"), entry_key: "e1".into() },
            OwnedProof { proof: proof(4, "c"), entry_key: "e2".into() },
        ];
        let (selected, plan) = select_for_amount(owned, 8).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].amount, 8);
        assert_eq!(plan.len(), 1);
    }

    #[test]
    fn selection_fails_when_balance_insufficient() {
        let owned = vec![OwnedProof { proof: proof(4, "x"), entry_key: "e1".into() }];
        assert!(select_for_amount(owned, 100).is_err());
    }

    #[test]
    fn partial_entry_consumption_leaves_residual() {
        let owned = vec![
            OwnedProof { proof: proof(8, "a"), entry_key: "e1".into() },
            OwnedProof { proof: proof(1, "b"), entry_key: "e1".into() },
        ];
        let (selected, plan) = select_for_amount(owned, 8).unwrap();
        assert_eq!(selected.len(), 1);
        assert_eq!(plan.len(), 1);
        let (_, residual) = &plan[0];
        assert_eq!(residual.as_ref().unwrap().len(), 1);
        assert_eq!(residual.as_ref().unwrap()[0].amount, 1);
    }
}
