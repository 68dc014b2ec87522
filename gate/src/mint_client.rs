//! Component D: the mint-interaction layer. A small per-mint wallet cache
//! (active keyset pubkeys), a 10 s call deadline, and string-based error
//! classification turned into a proper sum type so downstream code never
//! branches on a message substring again.
//!
//! The wire shapes below follow the swap/melt/receive operations implied by
//! §6's Cashu library contract — `cashu::Proof`/`BlindedMessage`/
//! `BlindedSignature` already carry the NUT-00 field renames, so only the
//! thin request/response envelopes need defining here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use cashu::{dhke, BlindedMessage, BlindedSignature, Dhke, Proof, Proofs, SplitAmount};
use secp256k1::{PublicKey, SecretKey};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::breaker::BreakerRegistry;

const MINT_CALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum MintClientError {
    #[error("http error talking to mint: {0}")]
    Http(#[from] reqwest::Error),
    #[error("mint returned an error: {0}")]
    Mint(String),
    #[error("cashu protocol error: {0}")]
    Cashu(#[from] cashu::CashuError),
    #[error("url error: {0}")]
    Url(#[from] url::ParseError),
    #[error("mint response missing key for amount {0}")]
    MissingKey(u64),
}

/// The per-mint active keyset: one public key per denomination.
#[derive(Debug, Clone)]
pub struct MintKeys {
    pub keyset_id: String,
    pub keys: HashMap<u64, PublicKey>,
}

#[derive(Debug, Deserialize)]
struct KeysResponseWire {
    keysets: Vec<KeysetKeysWire>,
}

#[derive(Debug, Deserialize)]
struct KeysetKeysWire {
    id: String,
    #[allow(dead_code)]
    unit: String,
    keys: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct ErrorResponseWire {
    #[allow(dead_code)]
    code: Option<i64>,
    detail: Option<String>,
}

/// Caches the active keyset for every mint we've talked to, so a warm
/// request doesn't round-trip `/v1/keys` again.
#[derive(Default)]
pub struct WalletCache {
    keys: Mutex<HashMap<String, MintKeys>>,
}

impl WalletCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get_or_fetch(&self, client: &reqwest::Client, mint: &Url) -> Result<MintKeys, MintClientError> {
        if let Some(keys) = self.keys.lock().unwrap().get(mint.as_str()).cloned() {
            return Ok(keys);
        }
        let fetched = fetch_keys(client, mint).await?;
        self.keys.lock().unwrap().insert(mint.as_str().to_string(), fetched.clone());
        Ok(fetched)
    }

    pub fn invalidate(&self, mint: &Url) {
        self.keys.lock().unwrap().remove(mint.as_str());
    }
}

async fn fetch_keys(client: &reqwest::Client, mint: &Url) -> Result<MintKeys, MintClientError> {
    let url = mint.join("v1/keys")?;
    let response = client.get(url).send().await?;
    let wire: KeysResponseWire = response.json().await?;
    let keyset = wire
        .keysets
        .into_iter()
        .next()
        .ok_or_else(|| MintClientError::Mint("mint returned no keysets".to_string()))?;

    let mut keys = HashMap::new();
    for (amount_str, hex_key) in keyset.keys {
        let amount: u64 = amount_str
            .parse()
            .map_err(|_| MintClientError::Mint(format!("non-numeric denomination {amount_str}")))?;
        keys.insert(amount, dhke::public_key_from_hex(&hex_key)?);
    }
    Ok(MintKeys { keyset_id: keyset.id, keys })
}

/// A blinded message plus the blinding factor needed to unblind its
/// signature, kept together until the mint responds.
struct PendingOutput {
    message: BlindedMessage,
    secret: String,
    blinding_factor: SecretKey,
}

fn build_outputs(keyset_id: &str, split: SplitAmount) -> Result<Vec<PendingOutput>, MintClientError> {
    let dhke = Dhke::new();
    let mut outputs = Vec::new();
    for amount in split {
        let secret = cashu::generate_random_string();
        let (blinded_point, blinding_factor) = dhke.step1_alice(&secret, None)?;
        outputs.push(PendingOutput {
            message: BlindedMessage {
                amount,
                b_: blinded_point,
                id: keyset_id.to_string(),
            },
            secret,
            blinding_factor,
        });
    }
    Ok(outputs)
}

fn unblind_outputs(
    outputs: Vec<PendingOutput>,
    signatures: Vec<BlindedSignature>,
    keys: &MintKeys,
) -> Result<Vec<Proof>, MintClientError> {
    let dhke = Dhke::new();
    let mut proofs = Vec::with_capacity(outputs.len());
    for (output, signature) in outputs.into_iter().zip(signatures) {
        let mint_pubkey = keys
            .keys
            .get(&output.message.amount)
            .copied()
            .ok_or(MintClientError::MissingKey(output.message.amount))?;
        let c = dhke.step3_alice(signature.c_, output.blinding_factor, mint_pubkey)?;
        proofs.push(Proof::new(output.message.amount, output.secret, c, signature.id.unwrap_or_else(|| keys.keyset_id.clone())));
    }
    Ok(proofs)
}

#[derive(Debug, Serialize)]
struct SwapRequestWire<'a> {
    inputs: &'a [Proof],
    outputs: &'a [BlindedMessage],
}

#[derive(Debug, Deserialize)]
struct SwapResponseWire {
    signatures: Vec<BlindedSignature>,
}

/// Performs a swap that splits `inputs` into a `target`-worth bundle
/// ("send") and the remainder ("keep"/change). When `target` equals the
/// total input amount this degenerates into a plain receive: all proofs
/// come back as `send`, and `keep` is empty.
async fn swap(
    client: &reqwest::Client,
    mint: &Url,
    keys: &MintKeys,
    inputs: &Proofs,
    target: u64,
) -> Result<(Proofs, Proofs), MintClientError> {
    let total = inputs.total_amount();
    let change_amount = total.saturating_sub(target);

    let send_outputs = build_outputs(&keys.keyset_id, cashu::Amount(target).split())?;
    let keep_outputs = if change_amount > 0 {
        build_outputs(&keys.keyset_id, cashu::Amount(change_amount).split())?
    } else {
        Vec::new()
    };

    let send_count = send_outputs.len();
    let all_outputs: Vec<PendingOutput> = send_outputs.into_iter().chain(keep_outputs).collect();
    let messages: Vec<BlindedMessage> = all_outputs.iter().map(|o| o.message.clone()).collect();

    let url = mint.join("v1/swap")?;
    let request = SwapRequestWire {
        inputs: &inputs.proofs(),
        outputs: &messages,
    };
    let response = client.post(url).json(&request).send().await?;
    if !response.status().is_success() {
        let detail = response
            .json::<ErrorResponseWire>()
            .await
            .ok()
            .and_then(|e| e.detail)
            .unwrap_or_else(|| "swap failed".to_string());
        return Err(MintClientError::Mint(detail));
    }
    let wire: SwapResponseWire = response.json().await?;
    if wire.signatures.len() != all_outputs.len() {
        return Err(MintClientError::Mint("signature count mismatch".to_string()));
    }

    let mut proofs = unblind_outputs(all_outputs, wire.signatures, keys)?;
    let keep_proofs = proofs.split_off(send_count);
    Ok((Proofs::new(proofs), Proofs::new(keep_proofs)))
}

/// Outcome of a redeem attempt, classified so downstream code never
/// branches on a message substring.
#[derive(Debug)]
pub enum RedeemOutcome {
    Ok { keep: Proofs, change: Proofs },
    Spent,
    Timeout,
    CircuitOpen,
    Other(String),
}

fn classify_error(err: &MintClientError) -> RedeemOutcome {
    let message = err.to_string();
    let lower = message.to_lowercase();
    if lower.contains("already spent") || message.contains("PROOF_ALREADY_USED") || message.contains("11001") {
        RedeemOutcome::Spent
    } else if lower.contains("timeout") {
        RedeemOutcome::Timeout
    } else {
        RedeemOutcome::Other("Redeem failed".to_string())
    }
}

/// Redeems `stamp_proofs` at `mint`, trying to carve out exactly `price`
/// units as `keep` when `0 < price < total`, else treating it as a plain
/// receive (all proofs become `keep`, no `change`).
pub async fn redeem(
    client: &reqwest::Client,
    breaker: &BreakerRegistry,
    wallet_cache: &WalletCache,
    mint: &Url,
    proofs: &Proofs,
    price: Option<u64>,
) -> RedeemOutcome {
    let mint_key = mint.as_str();
    if !breaker.can_call(mint_key) {
        return RedeemOutcome::CircuitOpen;
    }

    let total = proofs.total_amount();
    let target = match price {
        Some(p) if p > 0 && p < total => p,
        _ => total,
    };

    let call = async {
        let keys = wallet_cache.get_or_fetch(client, mint).await?;
        swap(client, mint, &keys, proofs, target).await
    };

    match tokio::time::timeout(MINT_CALL_TIMEOUT, call).await {
        Ok(Ok((keep, change))) => {
            breaker.on_success(mint_key);
            RedeemOutcome::Ok { keep, change }
        }
        Ok(Err(err)) => {
            let outcome = classify_error(&err);
            if !matches!(outcome, RedeemOutcome::Spent) {
                breaker.on_failure(mint_key);
            }
            tracing::warn!(mint = %mint, error = %err, "redeem failed");
            outcome
        }
        Err(_elapsed) => {
            breaker.on_failure(mint_key);
            RedeemOutcome::Timeout
        }
    }
}

// --- Melt (Lightning + on-chain): used by treasury operations (component G).

#[derive(Debug, Clone, Deserialize)]
pub struct MeltQuote {
    pub quote: String,
    pub amount: u64,
    pub fee_reserve: u64,
    #[allow(dead_code)]
    pub state: String,
    #[allow(dead_code)]
    pub expiry: u64,
}

#[derive(Debug, Clone)]
pub struct MeltResult {
    pub paid: bool,
    pub payment_preimage: Option<String>,
    pub change: Proofs,
}

#[derive(Debug, Serialize)]
struct MeltQuoteRequestWire<'a> {
    request: &'a str,
    unit: &'a str,
}

pub async fn melt_quote_bolt11(client: &reqwest::Client, mint: &Url, invoice: &str) -> Result<MeltQuote, MintClientError> {
    let url = mint.join("v1/melt/quote/bolt11")?;
    let body = MeltQuoteRequestWire { request: invoice, unit: "sat" };
    let response = client.post(url).json(&body).send().await?;
    if !response.status().is_success() {
        return Err(MintClientError::Mint(format!("melt quote failed: {}", response.status())));
    }
    Ok(response.json().await?)
}

#[derive(Debug, Serialize)]
struct MeltRequestWire<'a> {
    quote: &'a str,
    inputs: &'a [Proof],
    outputs: &'a [BlindedMessage],
}

#[derive(Debug, Deserialize)]
struct MeltResponseWire {
    state: String,
    payment_preimage: Option<String>,
    #[serde(default)]
    change: Vec<BlindedSignature>,
}

/// Melts `proofs` against an already-fetched bolt11 quote. Per NUT-08,
/// blank "blank outputs" sized to cover up to `fee_reserve` are included so
/// the mint can return unspent fee reserve as fresh change proofs.
pub async fn melt_bolt11(
    client: &reqwest::Client,
    mint: &Url,
    keys: &MintKeys,
    quote: &MeltQuote,
    proofs: &Proofs,
) -> Result<MeltResult, MintClientError> {
    let blank_count = blank_output_count(quote.fee_reserve);
    let outputs = build_blank_outputs(&keys.keyset_id, blank_count)?;
    let messages: Vec<BlindedMessage> = outputs.iter().map(|o| o.message.clone()).collect();

    let url = mint.join("v1/melt/bolt11")?;
    let body = MeltRequestWire {
        quote: &quote.quote,
        inputs: &proofs.proofs(),
        outputs: &messages,
    };
    let response = client.post(url).json(&body).send().await?;
    if !response.status().is_success() {
        let detail = response
            .json::<ErrorResponseWire>()
            .await
            .ok()
            .and_then(|e| e.detail)
            .unwrap_or_else(|| "melt failed".to_string());
        return Err(MintClientError::Mint(detail));
    }
    let wire: MeltResponseWire = response.json().await?;
    let change = if wire.change.is_empty() {
        Proofs::empty()
    } else {
        Proofs::new(unblind_outputs(outputs, wire.change, keys)?)
    };

    Ok(MeltResult {
        paid: wire.state == "PAID",
        payment_preimage: wire.payment_preimage,
        change,
    })
}

/// Blank outputs use denomination 1 (so every output is independently
/// meaningful once unblinded); the count covers the worst case where the
/// whole fee reserve comes back as change.
fn blank_output_count(fee_reserve: u64) -> usize {
    if fee_reserve == 0 {
        0
    } else {
        (fee_reserve as f64).log2().ceil().max(1.0) as usize
    }
}

fn build_blank_outputs(keyset_id: &str, count: usize) -> Result<Vec<PendingOutput>, MintClientError> {
    let dhke = Dhke::new();
    let mut outputs = Vec::with_capacity(count);
    for _ in 0..count {
        let secret = cashu::generate_random_string();
        let (blinded_point, blinding_factor) = dhke.step1_alice(&secret, None)?;
        outputs.push(PendingOutput {
            message: BlindedMessage {
                amount: 0,
                b_: blinded_point,
                id: keyset_id.to_string(),
            },
            secret,
            blinding_factor,
        });
    }
    Ok(outputs)
}

#[derive(Debug, Serialize)]
struct OnchainMeltQuoteRequestWire<'a> {
    amount: u64,
    address: &'a str,
    chain: &'a str,
}

pub async fn melt_quote_onchain(
    client: &reqwest::Client,
    mint: &Url,
    amount: u64,
    address: &str,
    chain: &str,
) -> Result<MeltQuote, MintClientError> {
    let url = mint.join("v1/melt/quote/onchain")?;
    let body = OnchainMeltQuoteRequestWire { amount, address, chain };
    let response = client.post(url).json(&body).send().await?;
    if !response.status().is_success() {
        return Err(MintClientError::Mint(format!("onchain melt quote failed: {}", response.status())));
    }
    Ok(response.json().await?)
}

#[derive(Debug, Deserialize)]
pub struct OnchainMeltResult {
    pub state: String,
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub change: Vec<BlindedSignature>,
}

pub async fn melt_onchain(
    client: &reqwest::Client,
    mint: &Url,
    keys: &MintKeys,
    quote: &MeltQuote,
    proofs: &Proofs,
) -> Result<(OnchainMeltResult, Proofs), MintClientError> {
    let blank_count = blank_output_count(quote.fee_reserve);
    let outputs = build_blank_outputs(&keys.keyset_id, blank_count)?;
    let messages: Vec<BlindedMessage> = outputs.iter().map(|o| o.message.clone()).collect();

    let url = mint.join("v1/melt/onchain")?;
    let body = MeltRequestWire {
        quote: &quote.quote,
        inputs: &proofs.proofs(),
        outputs: &messages,
    };
    let response = client.post(url).json(&body).send().await?;
    if !response.status().is_success() {
        let detail = response
            .json::<ErrorResponseWire>()
            .await
            .ok()
            .and_then(|e| e.detail)
            .unwrap_or_else(|| "onchain melt failed".to_string());
        return Err(MintClientError::Mint(detail));
    }
    let wire: OnchainMeltResult = response.json().await?;
    let change = if wire.change.is_empty() {
        Proofs::empty()
    } else {
        Proofs::new(unblind_outputs(outputs, wire.change.clone(), keys)?)
    };
    Ok((wire, change))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_spent_variants() {
        let err = MintClientError::Mint("Token already spent".to_string());
        assert!(matches!(classify_error(&err), RedeemOutcome::Spent));
        let err = MintClientError::Mint("error code 11001".to_string());
        assert!(matches!(classify_error(&err), RedeemOutcome::Spent));
        let err = MintClientError::Mint("PROOF_ALREADY_USED".to_string());
        assert!(matches!(classify_error(&err), RedeemOutcome::Spent));
    }

    #[test]
    fn classify_timeout() {
        let err = MintClientError::Mint("request Timeout".to_string());
        assert!(matches!(classify_error(&err), RedeemOutcome::Timeout));
    }

    #[test]
    fn classify_other_is_opaque() {
        let err = MintClientError::Mint("keyset not found".to_string());
        match classify_error(&err) {
            RedeemOutcome::Other(msg) => assert_eq!(msg, "Redeem failed"),
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn blank_output_count_scales_with_fee_reserve() {
        assert_eq!(blank_output_count(0), 0);
        assert_eq!(blank_output_count(1), 1);
        assert!(blank_output_count(1000) >= 10);
    }
}
