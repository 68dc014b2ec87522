use std::sync::Arc;

use gate::admin::AdminAuth;
use gate::breaker::BreakerRegistry;
use gate::config::GateConfig;
use gate::kv::{KvStore, MemoryKv, SqliteKv};
use gate::mint_client::WalletCache;
use gate::router::UpstreamRouter;
use gate::server::run_server;
use gate::state::AppState;
use gate::store::ProofStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = GateConfig::from_env();
    tracing::info!(version = %gate::config::BuildConfig::version(), "starting stampgate");

    let kv: Arc<dyn KvStore> = match &config.kv_sqlite_path {
        Some(path) => {
            tracing::info!(%path, "using sqlite-backed kv store");
            Arc::new(SqliteKv::connect(path).await?)
        }
        None => {
            tracing::info!("using in-memory kv store; proof balances will not survive a restart");
            Arc::new(MemoryKv::new())
        }
    };

    let trusted_mints = config.trusted_mints.clone();
    let pricing_rules = config.pricing.rules.clone();
    let upstreams = UpstreamRouter::new(config.upstream.routes.clone());
    let admin = AdminAuth::new(config.admin.admin_token.clone());
    let store = ProofStore::new(kv.clone());

    let state = Arc::new(AppState {
        config,
        trusted_mints,
        pricing_rules,
        upstreams,
        http: reqwest::Client::new(),
        breaker: BreakerRegistry::new(),
        wallet_cache: WalletCache::new(),
        store,
        kv,
        admin,
    });

    run_server(state).await
}
