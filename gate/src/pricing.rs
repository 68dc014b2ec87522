//! Component B: resolves a model name to a pricing rule and estimates or
//! validates the cost of a request against it.

use serde::{Deserialize, Serialize};

/// 1 USD == 100,000 accounting units.
pub const USD_TO_UNITS: u64 = 100_000;

const CHARS_PER_TOKEN: f64 = 4.0;
const ROLE_OVERHEAD_TOKENS: u64 = 4;
const IMAGE_PART_TOKENS: u64 = 800;
const OVERHEAD_FACTOR: f64 = 1.10;
const MIN_ESTIMATED_TOKENS: u64 = 10;
const DEFAULT_MAX_OUTPUT: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum PricingMode {
    PerRequest { per_request: u64 },
    PerToken { input_per_million: u64, output_per_million: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingRule {
    pub model: String,
    #[serde(flatten)]
    pub mode: PricingMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PricingConfig {
    pub rules: Vec<PricingRule>,
}

#[derive(Debug, thiserror::Error)]
pub enum PricingError {
    #[error("estimateMax is only defined for per_token rules")]
    NotPerToken,
}

/// Exact match first; falls back to the wildcard `"*"` rule (with its
/// `model` field rewritten to the requested name so a 402 echoes what the
/// caller asked for); `None` if neither exists.
pub fn resolve(model: &str, rules: &[PricingRule]) -> Option<PricingRule> {
    if let Some(rule) = rules.iter().find(|r| r.model == model) {
        return Some(rule.clone());
    }
    rules.iter().find(|r| r.model == "*").map(|rule| PricingRule {
        model: model.to_string(),
        mode: rule.mode.clone(),
    })
}

/// Rough token estimate for a chat-completion request body, used to bound
/// `per_token` cost before the upstream call is made.
pub fn estimate_input_tokens(messages: &[serde_json::Value]) -> u64 {
    let mut total = 0u64;
    for message in messages {
        total += ROLE_OVERHEAD_TOKENS;
        match message.get("content") {
            Some(serde_json::Value::String(s)) => {
                total += (s.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as u64;
            }
            Some(serde_json::Value::Array(parts)) => {
                for part in parts {
                    if part.get("image_url").is_some() {
                        total += IMAGE_PART_TOKENS;
                    } else if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                        total += (text.chars().count() as f64 / CHARS_PER_TOKEN).ceil() as u64;
                    }
                }
            }
            _ => {}
        }
    }
    let scaled = (total as f64 * OVERHEAD_FACTOR).floor() as u64;
    scaled.max(MIN_ESTIMATED_TOKENS)
}

/// Upper-bound cost estimate, defined only for `per_token` rules.
pub fn estimate_max(rule: &PricingRule, input_tokens: u64, max_out: Option<u64>) -> Result<u64, PricingError> {
    match rule.mode {
        PricingMode::PerToken { input_per_million, output_per_million } => {
            let max_out = max_out.unwrap_or(DEFAULT_MAX_OUTPUT);
            let input_cost = ((input_tokens as f64 / 1_000_000.0) * input_per_million as f64).ceil();
            let output_cost = ((max_out as f64 / 1_000_000.0) * output_per_million as f64).ceil();
            Ok((input_cost + output_cost) as u64)
        }
        PricingMode::PerRequest { .. } => Err(PricingError::NotPerToken),
    }
}

/// Actual cost given realized token usage, defined only for `per_token`.
pub fn actual_cost(rule: &PricingRule, input_tokens: u64, output_tokens: u64) -> Result<u64, PricingError> {
    match rule.mode {
        PricingMode::PerToken { input_per_million, output_per_million } => {
            let input_cost = ((input_tokens as f64 / 1_000_000.0) * input_per_million as f64).ceil();
            let output_cost = ((output_tokens as f64 / 1_000_000.0) * output_per_million as f64).ceil();
            Ok((input_cost + output_cost) as u64)
        }
        PricingMode::PerRequest { .. } => Err(PricingError::NotPerToken),
    }
}

#[derive(Debug, Clone)]
pub struct AmountCheck {
    pub ok: bool,
    pub required: u64,
    pub provided: u64,
}

/// Computes the required amount for `rule` and compares it against the
/// amount a decoded stamp actually carries.
pub fn validate_amount(provided: u64, rule: &PricingRule, input_tokens: u64) -> AmountCheck {
    let required = match rule.mode {
        PricingMode::PerRequest { per_request } => per_request,
        PricingMode::PerToken { .. } => estimate_max(rule, input_tokens, None).expect("per_token rule"),
    };
    AmountCheck {
        ok: provided >= required,
        required,
        provided,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn per_request_rule(model: &str, price: u64) -> PricingRule {
        PricingRule { model: model.to_string(), mode: PricingMode::PerRequest { per_request: price } }
    }

    #[test]
    fn resolve_prefers_exact_match_over_wildcard() {
        let rules = vec![per_request_rule("gpt-4o", 500), per_request_rule("*", 100)];
        let resolved = resolve("gpt-4o", &rules).unwrap();
        assert_eq!(resolved.model, "gpt-4o");
    }

    #[test]
    fn resolve_falls_back_to_wildcard_with_requested_name() {
        let rules = vec![per_request_rule("*", 100)];
        let resolved = resolve("unlisted-model", &rules).unwrap();
        assert_eq!(resolved.model, "unlisted-model");
    }

    #[test]
    fn resolve_is_none_without_exact_or_wildcard() {
        let rules = vec![per_request_rule("gpt-4o", 500)];
        assert!(resolve("other-model", &rules).is_none());
    }

    #[test]
    fn estimate_max_rejects_per_request_rules() {
        let rule = per_request_rule("m", 200);
        assert!(estimate_max(&rule, 100, None).is_err());
    }

    #[test]
    fn estimate_input_tokens_applies_overhead_and_floor() {
        let messages = vec![serde_json::json!({"role": "user", "content": "hi"})];
        let tokens = estimate_input_tokens(&messages);
        assert!(tokens >= MIN_ESTIMATED_TOKENS);
    }

    #[test]
    fn estimate_input_tokens_counts_image_parts() {
        let messages = vec![serde_json::json!({
            "role": "user",
            "content": [{"image_url": {"url": "https://x"}}]
        })];
        let tokens = estimate_input_tokens(&messages);
        assert!(tokens > IMAGE_PART_TOKENS);
    }

    #[test]
    fn validate_amount_flags_insufficient_payment() {
        let rule = per_request_rule("m", 200);
        let check = validate_amount(50, &rule, 0);
        assert!(!check.ok);
        assert_eq!(check.required, 200);
        assert_eq!(check.provided, 50);
    }
}
