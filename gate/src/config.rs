//! Ambient configuration layer (§10.2). Mirrors the teacher's
//! `MintConfig`/`env_or_default` pattern: every sub-config has its own
//! `from_env`, repeated per-upstream blocks are read with
//! `envy::prefixed(...)`, and the only way to fail construction is a
//! missing wallet address.

use std::env;
use std::str::FromStr;

use serde::Deserialize;
use url::Url;

use crate::pricing::{PricingConfig, PricingMode, PricingRule};
use crate::router::UpstreamRoute;

fn env_or_default<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            host: env::var("GATE_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_or_default("GATE_PORT", 8787),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TreasuryConfig {
    pub wallet_address: String,
    pub chain_tag: String,
    pub mint_url: Url,
    pub fee_reserve_sat: u64,
}

impl TreasuryConfig {
    pub fn from_env() -> Self {
        let wallet_address =
            env::var("GATE_WALLET_ADDRESS").expect("GATE_WALLET_ADDRESS is required to start the gate");
        let mint_url = env::var("GATE_MINT_URL")
            .ok()
            .and_then(|v| Url::parse(&v).ok())
            .expect("GATE_MINT_URL is required and must be a valid URL");
        Self {
            wallet_address,
            chain_tag: env::var("GATE_ONCHAIN_CHAIN").unwrap_or_else(|_| "base".to_string()),
            mint_url,
            fee_reserve_sat: env_or_default("GATE_FEE_RESERVE_SAT", 10),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpstreamEnv {
    #[serde(rename = "match")]
    match_pattern: String,
    base_url: String,
    api_key: String,
    model_rewrite: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamConfig {
    pub routes: Vec<UpstreamRoute>,
}

impl UpstreamConfig {
    /// Reads `GATE_UPSTREAM_<N>_{MATCH,BASE_URL,API_KEY,MODEL_REWRITE}` for
    /// increasing `N` starting at 1 until a gap is hit, via
    /// `envy::prefixed`, the same way the teacher reads its per-backend
    /// Lightning settings.
    pub fn from_env() -> Self {
        let mut routes = Vec::new();
        for n in 1.. {
            let prefix = format!("GATE_UPSTREAM_{n}_");
            match envy::prefixed(&prefix).from_env::<UpstreamEnv>() {
                Ok(parsed) => routes.push(UpstreamRoute {
                    match_pattern: parsed.match_pattern,
                    base_url: parsed.base_url,
                    api_key: parsed.api_key,
                    model_rewrite: parsed.model_rewrite,
                }),
                Err(_) => break,
            }
        }
        Self { routes }
    }
}

#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub admin_token: Option<String>,
}

impl AdminConfig {
    pub fn from_env() -> Self {
        Self {
            admin_token: env::var("GATE_ADMIN_TOKEN").ok(),
        }
    }
}

impl PricingConfig {
    /// Built-in fallback: a single `per_request` wildcard rule, cheap
    /// enough to be a safe default if no override is configured.
    pub fn defaults() -> Self {
        Self {
            rules: vec![PricingRule {
                model: "*".to_string(),
                mode: PricingMode::PerRequest { per_request: 200 },
            }],
        }
    }

    /// Reads `GATE_PRICING_JSON` (a JSON array of rules) if present; on
    /// parse failure, logs and falls back to [`PricingConfig::defaults`]
    /// rather than refusing to start.
    pub fn from_env() -> Self {
        let Ok(raw) = env::var("GATE_PRICING_JSON") else {
            return Self::defaults();
        };
        match serde_json::from_str::<Vec<PricingRule>>(&raw) {
            Ok(rules) => Self { rules },
            Err(err) => {
                tracing::warn!(error = %err, "GATE_PRICING_JSON is malformed, falling back to defaults");
                Self::defaults()
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub server: ServerConfig,
    pub treasury: TreasuryConfig,
    pub upstream: UpstreamConfig,
    pub admin: AdminConfig,
    pub pricing: PricingConfig,
    pub trusted_mints: Vec<Url>,
    pub allowed_origins: Vec<String>,
    pub ip_hash_salt: Option<String>,
    pub kv_sqlite_path: Option<String>,
}

impl GateConfig {
    pub fn from_env() -> Self {
        let trusted_mints = env::var("GATE_TRUSTED_MINTS")
            .unwrap_or_default()
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .filter_map(|s| Url::parse(s).ok())
            .collect();
        let allowed_origins = env::var("GATE_ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            server: ServerConfig::from_env(),
            treasury: TreasuryConfig::from_env(),
            upstream: UpstreamConfig::from_env(),
            admin: AdminConfig::from_env(),
            pricing: PricingConfig::from_env(),
            trusted_mints,
            allowed_origins,
            ip_hash_salt: env::var("GATE_IP_HASH_SALT").ok(),
            kv_sqlite_path: env::var("GATE_KV_SQLITE_PATH").ok(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildConfig;

impl BuildConfig {
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_defaults_has_one_wildcard_rule() {
        let config = PricingConfig::defaults();
        assert_eq!(config.rules.len(), 1);
        assert_eq!(config.rules[0].model, "*");
    }

    #[test]
    fn env_or_default_falls_back_on_unset_var() {
        assert_eq!(env_or_default::<u16>("GATE_TEST_UNSET_PORT_XYZ", 9999), 9999);
    }

    #[test]
    fn build_version_matches_cargo_pkg_version() {
        assert_eq!(BuildConfig::version(), env!("CARGO_PKG_VERSION"));
    }
}
