//! Shared scaffolding for the black-box route tests in this directory:
//! a minimal `AppState` builder, a stamp-token encoder, and a `FakeMint`
//! that serves `/v1/keys` and `/v1/swap` without doing any real mint-side
//! cryptography (nothing downstream of `redeem()` ever re-verifies a
//! returned signature, so a structurally valid response is enough).

use std::sync::Arc;

use cashu::dhke::public_key_from_hex;
use cashu::{Proof, Proofs};
use gate::admin::AdminAuth;
use gate::breaker::BreakerRegistry;
use gate::config::{AdminConfig, GateConfig, ServerConfig, TreasuryConfig, UpstreamConfig};
use gate::kv::{KvStore, MemoryKv};
use gate::mint_client::WalletCache;
use gate::pricing::{PricingConfig, PricingMode, PricingRule};
use gate::router::UpstreamRoute;
use gate::state::AppState;
use gate::store::ProofStore;
use url::Url;

/// An arbitrary valid compressed secp256k1 point, reused everywhere a
/// `Proof::c` or mint pubkey is needed. The redeem path never checks a
/// proof's signature against anything, so its value doesn't matter.
const PLACEHOLDER_PUBKEY: &str = "02c020067db727d586bc3183aecf97fcb800c3f4cc4759f69c626c9db5d8f5b5d4";

pub fn per_request_rule(model: &str, price: u64) -> PricingRule {
    PricingRule {
        model: model.to_string(),
        mode: PricingMode::PerRequest { per_request: price },
    }
}

fn test_proof(amount: u64) -> Proof {
    Proof::new(
        amount,
        cashu::generate_random_string(),
        public_key_from_hex(PLACEHOLDER_PUBKEY).unwrap(),
        "test-keyset".to_string(),
    )
}

/// Encodes a single-proof V4 stamp token worth `amount` units at `mint`.
pub fn stamp_token(mint: &Url, amount: u64) -> String {
    gate::token::encode_v4(mint, "usd", Proofs::new(vec![test_proof(amount)])).expect("encode stamp token")
}

/// Builds a minimal, fully wired `AppState` around an in-memory KV store.
pub fn build_state(mint: Url, pricing_rules: Vec<PricingRule>, upstream_routes: Vec<UpstreamRoute>, admin_token: Option<&str>) -> Arc<AppState> {
    let kv: Arc<dyn KvStore> = Arc::new(MemoryKv::new());
    let admin_token = admin_token.map(str::to_string);

    Arc::new(AppState {
        config: GateConfig {
            server: ServerConfig { host: "127.0.0.1".to_string(), port: 0 },
            treasury: TreasuryConfig {
                wallet_address: "0xabc".to_string(),
                chain_tag: "base".to_string(),
                mint_url: mint.clone(),
                fee_reserve_sat: 10,
            },
            upstream: UpstreamConfig { routes: upstream_routes.clone() },
            admin: AdminConfig { admin_token: admin_token.clone() },
            pricing: PricingConfig { rules: pricing_rules.clone() },
            trusted_mints: vec![mint.clone()],
            allowed_origins: vec![],
            ip_hash_salt: Some("test-salt".to_string()),
            kv_sqlite_path: None,
        },
        trusted_mints: vec![mint],
        pricing_rules,
        upstreams: gate::router::UpstreamRouter::new(upstream_routes),
        http: reqwest::Client::new(),
        breaker: BreakerRegistry::new(),
        wallet_cache: WalletCache::new(),
        store: ProofStore::new(kv.clone()),
        kv,
        admin: AdminAuth::new(admin_token),
    })
}

/// A mint double that serves a fixed keyset and lets each test dictate
/// exactly how many blind signatures a swap should hand back.
pub struct FakeMint {
    server: mockito::ServerGuard,
}

impl FakeMint {
    pub async fn start() -> Self {
        let mut server = mockito::Server::new_async().await;
        let keys: serde_json::Map<String, serde_json::Value> = (0..24)
            .map(|i| (format!("{}", 1u64 << i), serde_json::Value::from(PLACEHOLDER_PUBKEY)))
            .collect();
        let body = serde_json::json!({
            "keysets": [{ "id": "test-keyset", "unit": "usd", "keys": keys }]
        });
        server
            .mock("GET", "/v1/keys")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(body.to_string())
            .create_async()
            .await;
        Self { server }
    }

    pub fn url(&self) -> Url {
        Url::parse(&self.server.url()).unwrap()
    }

    fn signatures_body(count: usize) -> String {
        let signatures: Vec<_> = (0..count)
            .map(|_| serde_json::json!({ "amount": 1, "C_": PLACEHOLDER_PUBKEY, "id": "test-keyset" }))
            .collect();
        serde_json::json!({ "signatures": signatures }).to_string()
    }

    /// Registers a `/v1/swap` response shaped exactly like a real one for a
    /// redeem of `total` units carving out `target` as keep: the output
    /// count mirrors what `build_outputs` would actually request.
    pub async fn expect_swap_success(&mut self, target: u64, total: u64) -> mockito::Mock {
        let change = total.saturating_sub(target);
        let mut count = cashu::split_amount(target).len();
        if change > 0 {
            count += cashu::split_amount(change).len();
        }
        self.server
            .mock("POST", "/v1/swap")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(Self::signatures_body(count))
            .create_async()
            .await
    }

    /// Registers a `/v1/swap` response matching a mint's "already spent"
    /// rejection of a replayed proof.
    pub async fn expect_swap_spent(&mut self) -> mockito::Mock {
        self.server
            .mock("POST", "/v1/swap")
            .with_status(400)
            .with_header("content-type", "application/json")
            .with_body(serde_json::json!({ "code": 11001, "detail": "Token already spent." }).to_string())
            .create_async()
            .await
    }
}

/// A minimal LLM upstream double answering every `/v1/chat/completions`
/// call with a fixed status/content-type/body.
pub async fn mock_upstream(status: usize, content_type: &str, body: &str) -> mockito::ServerGuard {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/v1/chat/completions")
        .with_status(status)
        .with_header("content-type", content_type)
        .with_body(body)
        .create_async()
        .await;
    server
}

pub fn upstream_route(pattern: &str, server: &mockito::ServerGuard) -> UpstreamRoute {
    UpstreamRoute {
        match_pattern: pattern.to_string(),
        base_url: server.url(),
        api_key: "test-key".to_string(),
        model_rewrite: None,
    }
}

pub fn chat_request(body: &serde_json::Value, token: &str) -> axum::http::Request<axum::body::Body> {
    axum::http::Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("Content-Type", "application/json")
        .header("X-Cashu", token)
        .body(axum::body::Body::from(body.to_string()))
        .unwrap()
}
