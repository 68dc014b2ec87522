//! Component I: admin authentication. Constant-time bearer comparison plus
//! a per-IP brute-force lockout, entirely process-local and in-memory.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use axum::http::HeaderMap;

const FAIL_WINDOW: Duration = Duration::from_secs(60);
const LOCKOUT_DURATION: Duration = Duration::from_secs(15 * 60);
const MAX_FAILS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminAuthError {
    NotConfigured,
    Locked,
    Unauthorized,
}

struct IpState {
    fail_count: u32,
    window_reset_at: Instant,
    locked_until: Option<Instant>,
}

/// Per-IP fail counters and lockouts. One mutex is fine: the critical
/// section is a handful of comparisons, never I/O.
#[derive(Default)]
pub struct AdminAuth {
    admin_token: Option<String>,
    state: Mutex<HashMap<String, IpState>>,
}

impl AdminAuth {
    pub fn new(admin_token: Option<String>) -> Self {
        Self {
            admin_token,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Extracts the caller's IP, preferring `CF-Connecting-IP` then
    /// `X-Forwarded-For`, falling back to `"unknown"`.
    pub fn extract_ip(headers: &HeaderMap) -> String {
        if let Some(v) = headers.get("CF-Connecting-IP").and_then(|v| v.to_str().ok()) {
            return v.trim().to_string();
        }
        if let Some(v) = headers.get("X-Forwarded-For").and_then(|v| v.to_str().ok()) {
            if let Some(first) = v.split(',').next() {
                return first.trim().to_string();
            }
        }
        "unknown".to_string()
    }

    fn is_locked(&self, ip: &str, now: Instant) -> bool {
        let state = self.state.lock().unwrap();
        matches!(state.get(ip), Some(s) if s.locked_until.is_some_and(|until| now < until))
    }

    fn record_failure(&self, ip: &str, now: Instant) -> bool {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(ip.to_string()).or_insert(IpState {
            fail_count: 0,
            window_reset_at: now + FAIL_WINDOW,
            locked_until: None,
        });
        if now >= entry.window_reset_at {
            entry.fail_count = 0;
            entry.window_reset_at = now + FAIL_WINDOW;
        }
        entry.fail_count += 1;
        if entry.fail_count >= MAX_FAILS {
            entry.locked_until = Some(now + LOCKOUT_DURATION);
            true
        } else {
            false
        }
    }

    fn clear(&self, ip: &str) {
        self.state.lock().unwrap().remove(ip);
    }

    /// Validates a bearer token extracted from the `Authorization` header
    /// or a `?token=` query parameter (dashboard convenience only).
    pub fn check(&self, headers: &HeaderMap, query_token: Option<&str>) -> Result<(), AdminAuthError> {
        let Some(expected) = &self.admin_token else {
            return Err(AdminAuthError::NotConfigured);
        };

        let ip = Self::extract_ip(headers);
        let now = Instant::now();
        if self.is_locked(&ip, now) {
            return Err(AdminAuthError::Locked);
        }

        let provided = headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .or(query_token);

        let provided = provided.unwrap_or("");
        if timing_safe_equal(provided, expected) {
            self.clear(&ip);
            Ok(())
        } else {
            let locked_now = self.record_failure(&ip, now);
            if locked_now {
                Err(AdminAuthError::Locked)
            } else {
                Err(AdminAuthError::Unauthorized)
            }
        }
    }
}

/// Constant-time string comparison: runtime depends only on
/// `max(|a|, |b|)`, never short-circuiting on a length mismatch.
pub fn timing_safe_equal(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    let max_len = a.len().max(b.len());
    let mut diff = (a.len() ^ b.len()) as u8;
    for i in 0..max_len {
        let byte_a = a.get(i).copied().unwrap_or(0);
        let byte_b = b.get(i).copied().unwrap_or(0);
        diff |= byte_a ^ byte_b;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers_with_bearer(token: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {token}")).unwrap(),
        );
        headers
    }

    #[test]
    fn timing_safe_equal_matches_regular_equality() {
        assert!(timing_safe_equal("secret", "secret"));
        assert!(!timing_safe_equal("secret", "secrex"));
        assert!(!timing_safe_equal("short", "much-longer-string"));
        assert!(!timing_safe_equal("", "nonempty"));
        assert!(timing_safe_equal("", ""));
    }

    #[test]
    fn no_token_configured_is_not_configured() {
        let auth = AdminAuth::new(None);
        let headers = headers_with_bearer("anything");
        assert_eq!(auth.check(&headers, None), Err(AdminAuthError::NotConfigured));
    }

    #[test]
    fn correct_token_succeeds() {
        let auth = AdminAuth::new(Some("s3cret".to_string()));
        let headers = headers_with_bearer("s3cret");
        assert!(auth.check(&headers, None).is_ok());
    }

    #[test]
    fn five_failures_then_lockout_even_with_correct_token() {
        let auth = AdminAuth::new(Some("s3cret".to_string()));
        let mut headers = HeaderMap::new();
        headers.insert("X-Forwarded-For", HeaderValue::from_static("1.2.3.4"));

        for _ in 0..4 {
            let mut h = headers.clone();
            h.insert(
                axum::http::header::AUTHORIZATION,
                HeaderValue::from_static("Bearer wrong"),
            );
            assert_eq!(auth.check(&h, None), Err(AdminAuthError::Unauthorized));
        }
        let mut h = headers.clone();
        h.insert(axum::http::header::AUTHORIZATION, HeaderValue::from_static("Bearer wrong"));
        assert_eq!(auth.check(&h, None), Err(AdminAuthError::Locked));

        let mut h2 = headers;
        h2.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer s3cret"),
        );
        assert_eq!(auth.check(&h2, None), Err(AdminAuthError::Locked));
    }

    #[test]
    fn query_token_accepted_for_dashboard() {
        let auth = AdminAuth::new(Some("dash-token".to_string()));
        let headers = HeaderMap::new();
        assert!(auth.check(&headers, Some("dash-token")).is_ok());
    }

    #[test]
    fn ip_extraction_prefers_cf_connecting_ip() {
        let mut headers = HeaderMap::new();
        headers.insert("CF-Connecting-IP", HeaderValue::from_static("9.9.9.9"));
        headers.insert("X-Forwarded-For", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(AdminAuth::extract_ip(&headers), "9.9.9.9");
    }
}
