use std::sync::Arc;

use url::Url;

use crate::admin::AdminAuth;
use crate::breaker::BreakerRegistry;
use crate::config::GateConfig;
use crate::kv::KvStore;
use crate::mint_client::WalletCache;
use crate::pricing::PricingRule;
use crate::router::UpstreamRouter;
use crate::store::ProofStore;

/// Everything a handler or the stamp-gate middleware needs, shared behind
/// one `Arc` per connection.
pub struct AppState {
    pub config: GateConfig,
    pub trusted_mints: Vec<Url>,
    pub pricing_rules: Vec<PricingRule>,
    pub upstreams: UpstreamRouter,
    pub http: reqwest::Client,
    pub breaker: BreakerRegistry,
    pub wallet_cache: WalletCache,
    pub store: ProofStore,
    pub kv: Arc<dyn KvStore>,
    pub admin: AdminAuth,
}

pub type SharedState = Arc<AppState>;
