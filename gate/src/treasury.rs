//! Component G: treasury operations. All admin-gated; all return a
//! structured JSON result and never leak raw mint error text beyond a
//! single bounded `details` field.

use cashu::Proofs;
use serde::Serialize;
use url::Url;

use crate::mint_client::{self, MeltQuote, MintClientError, MintKeys};
use crate::store::{select_for_amount, ProofStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum TreasuryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("mint error: {0}")]
    Mint(String),
    #[error("insufficient balance: have {have}, need {need}")]
    InsufficientBalance { have: u64, need: u64 },
}

impl From<MintClientError> for TreasuryError {
    fn from(err: MintClientError) -> Self {
        TreasuryError::Mint(err.to_string())
    }
}

#[derive(Debug, Serialize)]
pub struct MeltLightningResult {
    pub success: bool,
    pub amount_units: u64,
    pub fee_units: u64,
    pub input_units: u64,
    pub change_units: u64,
    pub payment_preimage: Option<String>,
}

/// Melts the gate's entire stored balance against a Lightning invoice.
/// Writes returned change back to a fresh KV entry *before* deleting the
/// consumed originals, so a crash between the two steps leaves duplicated
/// but never lost value (reconcilable by `cleanup`).
pub async fn melt_lightning(
    client: &reqwest::Client,
    store: &ProofStore,
    mint: &Url,
    keys: &MintKeys,
    invoice: &str,
) -> Result<MeltLightningResult, TreasuryError> {
    let owned = store.owned_proofs().await?;
    let all_keys: Vec<String> = owned.iter().map(|o| o.entry_key.clone()).collect();
    let all_proofs = Proofs::new(owned.into_iter().map(|o| o.proof).collect());
    let balance = all_proofs.total_amount();

    let quote = mint_client::melt_quote_bolt11(client, mint, invoice).await?;
    if balance < quote.amount + quote.fee_reserve {
        return Err(TreasuryError::InsufficientBalance {
            have: balance,
            need: quote.amount + quote.fee_reserve,
        });
    }

    let result = mint_client::melt_bolt11(client, mint, keys, &quote, &all_proofs).await?;
    if !result.paid {
        return Err(TreasuryError::Mint("mint did not report payment as paid".to_string()));
    }

    if !result.change.is_empty() {
        store.store(mint.clone(), result.change.clone()).await?;
    }
    let mut unique_keys = all_keys;
    unique_keys.sort();
    unique_keys.dedup();
    store.delete_keys(&unique_keys).await?;

    Ok(MeltLightningResult {
        success: true,
        amount_units: quote.amount,
        fee_units: quote.fee_reserve,
        input_units: balance,
        change_units: result.change.total_amount(),
        payment_preimage: result.payment_preimage,
    })
}

#[derive(Debug, Serialize)]
pub struct MeltOnchainResult {
    pub success: bool,
    pub amount_units: u64,
    pub fee_units: u64,
    pub input_units: u64,
    pub change_units: u64,
    pub tx_hash: Option<String>,
}

pub async fn melt_onchain(
    client: &reqwest::Client,
    store: &ProofStore,
    mint: &Url,
    keys: &MintKeys,
    address: &str,
    chain: &str,
    amount: u64,
) -> Result<MeltOnchainResult, TreasuryError> {
    let owned = store.owned_proofs().await?;
    let all_keys: Vec<String> = owned.iter().map(|o| o.entry_key.clone()).collect();
    let all_proofs = Proofs::new(owned.into_iter().map(|o| o.proof).collect());
    let balance = all_proofs.total_amount();

    let quote: MeltQuote = mint_client::melt_quote_onchain(client, mint, amount, address, chain).await?;
    if balance < quote.amount + quote.fee_reserve {
        return Err(TreasuryError::InsufficientBalance {
            have: balance,
            need: quote.amount + quote.fee_reserve,
        });
    }

    let (result, change) = mint_client::melt_onchain(client, mint, keys, &quote, &all_proofs).await?;

    if !change.is_empty() {
        store.store(mint.clone(), change.clone()).await?;
    }
    let mut unique_keys = all_keys;
    unique_keys.sort();
    unique_keys.dedup();
    store.delete_keys(&unique_keys).await?;

    Ok(MeltOnchainResult {
        success: result.state == "PAID" || result.state == "CONFIRMED",
        amount_units: quote.amount,
        fee_units: quote.fee_reserve,
        input_units: balance,
        change_units: change.total_amount(),
        tx_hash: result.tx_hash,
    })
}

#[derive(Debug, Serialize)]
pub struct WithdrawResult {
    pub success: bool,
    pub token: String,
    pub amount_units: u64,
    pub change_units: u64,
    pub remaining_balance_units: u64,
}

/// Withdraws `amount` units as a fresh token for the caller; the change
/// stays with the gate.
pub async fn withdraw(
    client: &reqwest::Client,
    store: &ProofStore,
    mint: &Url,
    breaker: &crate::breaker::BreakerRegistry,
    wallet_cache: &crate::mint_client::WalletCache,
    amount: u64,
) -> Result<WithdrawResult, TreasuryError> {
    let owned = store.owned_proofs().await?;
    let balance: u64 = owned.iter().map(|o| o.proof.amount).sum();
    if balance < amount {
        return Err(TreasuryError::InsufficientBalance { have: balance, need: amount });
    }

    let (selected, rewrite_plan) = select_for_amount(owned, amount)?;
    let selected_proofs = Proofs::new(selected);

    let outcome = mint_client::redeem(client, breaker, wallet_cache, mint, &selected_proofs, Some(amount)).await;
    let (send, keep) = match outcome {
        crate::mint_client::RedeemOutcome::Ok { keep, change } => (keep, change),
        crate::mint_client::RedeemOutcome::Other(msg) => return Err(TreasuryError::Mint(msg)),
        crate::mint_client::RedeemOutcome::Spent => {
            return Err(TreasuryError::Mint("one or more stored proofs were already spent".to_string()))
        }
        crate::mint_client::RedeemOutcome::Timeout => return Err(TreasuryError::Mint("mint call timed out".to_string())),
        crate::mint_client::RedeemOutcome::CircuitOpen => return Err(TreasuryError::Mint("circuit open".to_string())),
    };

    let token = crate::token::encode_v4(mint, "usd", send.clone()).map_err(|e| TreasuryError::Mint(e.to_string()))?;

    for (key, residual) in rewrite_plan {
        if let Some(residual) = residual {
            store.store(mint.clone(), Proofs::new(residual)).await?;
        }
        store.delete_keys(&[key]).await?;
    }
    if !keep.is_empty() {
        store.store(mint.clone(), keep.clone()).await?;
    }

    Ok(WithdrawResult {
        success: true,
        token,
        amount_units: send.total_amount(),
        change_units: keep.total_amount(),
        remaining_balance_units: balance - amount + keep.total_amount(),
    })
}

#[derive(Debug, Serialize)]
pub struct CleanupResult {
    pub entries_processed: u64,
    pub proofs_removed: u64,
    pub units_removed: u64,
    pub units_kept: u64,
}

/// Sweeps every stored entry, attempting a self-swap (swap for the same
/// total) to surface dead proofs: if the whole-entry swap fails, falls
/// back to swapping each proof individually and drops the ones the mint
/// rejects as spent.
pub async fn cleanup(
    client: &reqwest::Client,
    store: &ProofStore,
    breaker: &crate::breaker::BreakerRegistry,
    wallet_cache: &crate::mint_client::WalletCache,
) -> Result<CleanupResult, TreasuryError> {
    let entries = store.list_all().await?;
    let mut result = CleanupResult { entries_processed: 0, proofs_removed: 0, units_removed: 0, units_kept: 0 };

    for (key, entry) in entries {
        result.entries_processed += 1;
        let total = entry.total_amount();
        let proofs = Proofs::new(entry.proofs.clone());

        let outcome = mint_client::redeem(client, breaker, wallet_cache, &entry.mint_url, &proofs, Some(total)).await;
        match outcome {
            mint_client::RedeemOutcome::Ok { keep, .. } => {
                store.delete_keys(&[key]).await?;
                if !keep.is_empty() {
                    store.store(entry.mint_url.clone(), keep.clone()).await?;
                    result.units_kept += keep.total_amount();
                }
            }
            _ => {
                let mut kept_proofs = Vec::new();
                let mut removed = 0u64;
                for proof in entry.proofs {
                    let single = Proofs::with_proof(proof.clone());
                    match mint_client::redeem(client, breaker, wallet_cache, &entry.mint_url, &single, Some(proof.amount)).await {
                        mint_client::RedeemOutcome::Ok { keep, .. } => kept_proofs.extend(keep.proofs()),
                        mint_client::RedeemOutcome::Spent => {
                            removed += proof.amount;
                            result.proofs_removed += 1;
                        }
                        _ => kept_proofs.push(proof),
                    }
                }
                result.units_removed += removed;
                store.delete_keys(&[key]).await?;
                if !kept_proofs.is_empty() {
                    let kept_units: u64 = kept_proofs.iter().map(|p| p.amount).sum();
                    result.units_kept += kept_units;
                    store.store(entry.mint_url.clone(), Proofs::new(kept_proofs)).await?;
                }
            }
        }
    }

    Ok(result)
}
