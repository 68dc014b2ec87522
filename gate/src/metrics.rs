//! Component H: per-request metrics, token-decode error capture, and the
//! aggregation queries behind the admin dashboard.
//!
//! Writes never block the response: callers `tokio::spawn` the write
//! future rather than awaiting it inline.

use std::collections::HashMap;
use std::sync::Arc;

use cashu::generate_random_suffix;
use serde::{Deserialize, Serialize};

use crate::kv::{KvStore, ListOptions, PutOptions};

const METRICS_PREFIX: &str = "metrics:";
const TOKEN_ERROR_PREFIX: &str = "token_error:";
const METRICS_TTL_SECS: u64 = 90 * 24 * 3600;
const TOKEN_ERROR_TTL_SECS: u64 = 24 * 3600;
const DAY_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricRecord {
    pub timestamp: String,
    pub model: String,
    pub status: u16,
    pub ecash_in: u64,
    pub price: u64,
    pub change: u64,
    pub refunded: bool,
    pub upstream_ms: u64,
    pub error_code: Option<String>,
    pub mint: String,
    pub stream: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenErrorRecord {
    pub timestamp: String,
    pub token_version: String,
    pub error: String,
    pub raw_prefix: String,
    pub raw_token: String,
    pub decode_time_ms: u64,
    pub raw_cbor_structure: Option<String>,
    pub ip_hash: String,
    pub user_agent: String,
}

fn day_key(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .unwrap_or_default()
        .format("%Y-%m-%d")
        .to_string()
}

pub async fn record_metric(kv: &dyn KvStore, record: &MetricRecord) {
    let now = chrono::Utc::now().timestamp_millis();
    let key = format!("{METRICS_PREFIX}{}:{}:{}", day_key(now), now, generate_random_suffix(6));
    let Ok(value) = serde_json::to_string(record) else {
        tracing::error!("failed to serialize metric record");
        return;
    };
    if let Err(err) = kv
        .put(&key, &value, PutOptions { expiration_ttl: Some(METRICS_TTL_SECS) })
        .await
    {
        tracing::warn!(error = %err, "failed to write metric record");
    }
}

pub async fn record_token_error(kv: &dyn KvStore, mut record: TokenErrorRecord) {
    record.raw_token.truncate(2000);
    let now = chrono::Utc::now().timestamp_millis();
    let key = format!("{TOKEN_ERROR_PREFIX}{}:{}:{}", day_key(now), now, generate_random_suffix(6));
    let Ok(value) = serde_json::to_string(&record) else {
        tracing::error!("failed to serialize token error record");
        return;
    };
    if let Err(err) = kv
        .put(&key, &value, PutOptions { expiration_ttl: Some(TOKEN_ERROR_TTL_SECS) })
        .await
    {
        tracing::warn!(error = %err, "failed to write token error record");
    }
}

/// Fire-and-forget: spawns the write so the response is never delayed by
/// metric I/O.
pub fn record_metric_async(kv: Arc<dyn KvStore>, record: MetricRecord) {
    tokio::spawn(async move { record_metric(kv.as_ref(), &record).await });
}

pub fn record_token_error_async(kv: Arc<dyn KvStore>, record: TokenErrorRecord) {
    tokio::spawn(async move { record_token_error(kv.as_ref(), record).await });
}

async fn list_prefix(kv: &dyn KvStore, prefix: &str) -> Vec<String> {
    let mut names = Vec::new();
    let mut cursor = None;
    loop {
        let Ok(page) = kv
            .list(ListOptions {
                prefix: Some(prefix.to_string()),
                cursor: cursor.clone(),
                limit: Some(1000),
            })
            .await
        else {
            break;
        };
        names.extend(page.keys.into_iter().map(|k| k.name));
        if page.list_complete {
            break;
        }
        cursor = page.cursor;
        if cursor.is_none() {
            break;
        }
    }
    names
}

pub async fn fetch_metrics_for_day(kv: &dyn KvStore, date: &str) -> Vec<MetricRecord> {
    let prefix = format!("{METRICS_PREFIX}{date}:");
    let keys = list_prefix(kv, &prefix).await;
    let mut records = Vec::new();
    for key in keys {
        if let Ok(Some(raw)) = kv.get(&key).await {
            if let Ok(record) = serde_json::from_str(&raw) {
                records.push(record);
            }
        }
    }
    records
}

/// Fetches every day in the inclusive `[start, end]` range (as
/// `YYYY-MM-DD` strings), batching reads in groups of `DAY_BATCH_SIZE` to
/// respect platform concurrency limits, then summarizes the combined set.
pub async fn summarize_range(kv: &dyn KvStore, days: &[String]) -> Summary {
    let mut all = Vec::new();
    for batch in days.chunks(DAY_BATCH_SIZE) {
        let futures = batch.iter().map(|day| fetch_metrics_for_day(kv, day));
        let results = futures_util::future::join_all(futures).await;
        for records in results {
            all.extend(records);
        }
    }
    summarize_records(&all)
}

pub async fn fetch_token_errors_for_day(kv: &dyn KvStore, date: &str) -> Vec<TokenErrorRecord> {
    let prefix = format!("{TOKEN_ERROR_PREFIX}{date}:");
    let keys = list_prefix(kv, &prefix).await;
    let mut records = Vec::new();
    for key in keys {
        if let Ok(Some(raw)) = kv.get(&key).await {
            if let Ok(record) = serde_json::from_str(&raw) {
                records.push(record);
            }
        }
    }
    records
}

pub async fn summarize_token_error_range(kv: &dyn KvStore, days: &[String]) -> TokenErrorSummary {
    let mut all = Vec::new();
    for batch in days.chunks(DAY_BATCH_SIZE) {
        let futures = batch.iter().map(|day| fetch_token_errors_for_day(kv, day));
        let results = futures_util::future::join_all(futures).await;
        for records in results {
            all.extend(records);
        }
    }
    summarize_token_errors(&all, chrono::Utc::now().timestamp_millis())
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct ModelBreakdown {
    pub count: u64,
    pub ecash_in: u64,
    pub errors: u64,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct Summary {
    pub total_requests: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub ecash_received: u64,
    pub estimated_cost: u64,
    pub avg_latency_ms: u64,
    pub error_breakdown: HashMap<String, u64>,
    pub model_breakdown: HashMap<String, ModelBreakdown>,
}

/// Pure aggregation over a record list; no I/O.
pub fn summarize_records(records: &[MetricRecord]) -> Summary {
    let mut summary = Summary::default();
    summary.total_requests = records.len() as u64;

    let mut latency_sum = 0u64;
    for record in records {
        summary.ecash_received += record.ecash_in;
        latency_sum += record.upstream_ms;

        let model_entry = summary.model_breakdown.entry(record.model.clone()).or_default();
        model_entry.count += 1;
        model_entry.ecash_in += record.ecash_in;

        match &record.error_code {
            None => {
                summary.success_count += 1;
                summary.estimated_cost += record.price;
            }
            Some(code) => {
                summary.error_count += 1;
                model_entry.errors += 1;
                *summary.error_breakdown.entry(code.clone()).or_insert(0) += 1;
            }
        }
    }

    if !records.is_empty() {
        summary.avg_latency_ms = (latency_sum as f64 / records.len() as f64).round() as u64;
    }
    summary
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct TokenErrorSummary {
    pub total_errors: u64,
    pub by_version: HashMap<String, u64>,
    pub by_error: HashMap<String, u64>,
    pub recent_count_24h: u64,
}

fn classify_error_message(message: &str) -> &'static str {
    let lower = message.to_lowercase();
    if lower.contains("cbor") {
        "CBOR decode"
    } else if lower.contains("base64") {
        "Base64 decode"
    } else if lower.contains("empty") {
        "Empty token"
    } else if lower.contains("mint") {
        "Missing mint"
    } else if lower.contains("proof") {
        "Missing proofs"
    } else if lower.contains("format") || lower.contains("version") {
        "Invalid format"
    } else {
        "Other"
    }
}

pub fn summarize_token_errors(records: &[TokenErrorRecord], now_ms: i64) -> TokenErrorSummary {
    let mut summary = TokenErrorSummary::default();
    summary.total_errors = records.len() as u64;
    for record in records {
        *summary.by_version.entry(record.token_version.clone()).or_insert(0) += 1;
        let class = classify_error_message(&record.error);
        *summary.by_error.entry(class.to_string()).or_insert(0) += 1;

        if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&record.timestamp) {
            if now_ms - ts.timestamp_millis() <= 24 * 3600 * 1000 {
                summary.recent_count_24h += 1;
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(price: u64, ecash_in: u64, error_code: Option<&str>, model: &str, latency: u64) -> MetricRecord {
        MetricRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            model: model.to_string(),
            status: if error_code.is_some() { 402 } else { 200 },
            ecash_in,
            price,
            change: 0,
            refunded: false,
            upstream_ms: latency,
            error_code: error_code.map(|s| s.to_string()),
            mint: "https://mint.example.com".to_string(),
            stream: false,
        }
    }

    #[test]
    fn summarize_counts_success_and_error_separately() {
        let records = vec![
            record(200, 320, None, "gpt-4o", 100),
            record(0, 50, Some("insufficient_payment"), "gpt-4o", 50),
        ];
        let summary = summarize_records(&records);
        assert_eq!(summary.total_requests, 2);
        assert_eq!(summary.success_count, 1);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.ecash_received, 370);
        assert_eq!(summary.estimated_cost, 200);
        assert_eq!(summary.avg_latency_ms, 75);
    }

    #[test]
    fn summarize_breaks_down_by_model_and_error_code() {
        let records = vec![
            record(200, 200, None, "gpt-4o", 10),
            record(0, 10, Some("token_spent"), "claude-3", 20),
        ];
        let summary = summarize_records(&records);
        assert_eq!(summary.model_breakdown["gpt-4o"].count, 1);
        assert_eq!(summary.model_breakdown["claude-3"].errors, 1);
        assert_eq!(summary.error_breakdown["token_spent"], 1);
    }

    #[test]
    fn empty_record_list_has_zero_averages() {
        let summary = summarize_records(&[]);
        assert_eq!(summary.avg_latency_ms, 0);
        assert_eq!(summary.total_requests, 0);
    }

    #[test]
    fn token_error_classification_buckets_known_strings() {
        assert_eq!(classify_error_message("CBOR decode failed"), "CBOR decode");
        assert_eq!(classify_error_message("token has no mint"), "Missing mint");
        assert_eq!(classify_error_message("something weird"), "Other");
    }

    #[tokio::test]
    async fn recorded_token_error_is_readable_back_for_its_day() {
        let kv = crate::kv::MemoryKv::new();
        let record = TokenErrorRecord {
            timestamp: chrono::Utc::now().to_rfc3339(),
            token_version: "v4".to_string(),
            error: "CBOR decode failed".to_string(),
            raw_prefix: "cashuBxyz".to_string(),
            raw_token: "cashuBxyz...".to_string(),
            decode_time_ms: 1,
            raw_cbor_structure: None,
            ip_hash: "abc123".to_string(),
            user_agent: "test-agent".to_string(),
        };
        record_token_error(&kv, record.clone()).await;

        let today = day_key(chrono::Utc::now().timestamp_millis());
        let fetched = fetch_token_errors_for_day(&kv, &today).await;
        assert_eq!(fetched.len(), 1);
        assert_eq!(fetched[0].error, record.error);

        let summary = summarize_token_error_range(&kv, &[today]).await;
        assert_eq!(summary.total_errors, 1);
        assert_eq!(summary.by_version["v4"], 1);
    }
}
