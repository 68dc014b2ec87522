//! Component J (upstream half): resolves a chat-completion model name to
//! an upstream LLM provider, tried in order: exact match, prefix wildcard,
//! then a catch-all `"*"`.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamRoute {
    #[serde(rename = "match")]
    pub match_pattern: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub model_rewrite: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UpstreamRouter {
    routes: Vec<UpstreamRoute>,
}

impl UpstreamRouter {
    pub fn new(routes: Vec<UpstreamRoute>) -> Self {
        Self { routes }
    }

    /// Resolves `model` against the configured routes: exact match, then a
    /// `prefix*` match, then a bare `"*"` catch-all.
    pub fn resolve(&self, model: &str) -> Option<&UpstreamRoute> {
        if let Some(route) = self.routes.iter().find(|r| r.match_pattern == model) {
            return Some(route);
        }
        if let Some(route) = self.routes.iter().find(|r| {
            r.match_pattern
                .strip_suffix('*')
                .is_some_and(|prefix| !prefix.is_empty() && model.starts_with(prefix))
        }) {
            return Some(route);
        }
        self.routes.iter().find(|r| r.match_pattern == "*")
    }

    pub fn model_for(&self, route: &UpstreamRoute, requested: &str) -> String {
        route.model_rewrite.clone().unwrap_or_else(|| requested.to_string())
    }

    /// The configured match patterns, for the health endpoint.
    pub fn configured_patterns(&self) -> Vec<&str> {
        self.routes.iter().map(|r| r.match_pattern.as_str()).collect()
    }
}

/// Whether an upstream response should be treated as an SSE stream: the
/// request asked for `stream:true` and the content-type substring-matches
/// `text/event-stream` or `octet-stream` (tolerating providers that
/// mislabel SSE responses).
pub fn is_streaming_response(requested_stream: bool, content_type: Option<&str>) -> bool {
    if !requested_stream {
        return false;
    }
    let Some(content_type) = content_type else { return false };
    let lower = content_type.to_lowercase();
    lower.contains("text/event-stream") || lower.contains("octet-stream")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn route(pattern: &str) -> UpstreamRoute {
        UpstreamRoute {
            match_pattern: pattern.to_string(),
            base_url: "https://api.example.com".to_string(),
            api_key: "key".to_string(),
            model_rewrite: None,
        }
    }

    #[test]
    fn exact_match_wins_over_prefix_and_wildcard() {
        let router = UpstreamRouter::new(vec![route("gpt-4o"), route("gpt-*"), route("*")]);
        let resolved = router.resolve("gpt-4o").unwrap();
        assert_eq!(resolved.match_pattern, "gpt-4o");
    }

    #[test]
    fn prefix_match_used_when_no_exact() {
        let router = UpstreamRouter::new(vec![route("gpt-*"), route("*")]);
        let resolved = router.resolve("gpt-4o-mini").unwrap();
        assert_eq!(resolved.match_pattern, "gpt-*");
    }

    #[test]
    fn wildcard_used_as_last_resort() {
        let router = UpstreamRouter::new(vec![route("*")]);
        let resolved = router.resolve("anything").unwrap();
        assert_eq!(resolved.match_pattern, "*");
    }

    #[test]
    fn no_match_returns_none() {
        let router = UpstreamRouter::new(vec![route("gpt-*")]);
        assert!(router.resolve("claude-3").is_none());
    }

    #[test]
    fn streaming_detection_requires_requested_stream() {
        assert!(!is_streaming_response(false, Some("text/event-stream")));
        assert!(is_streaming_response(true, Some("text/event-stream; charset=utf-8")));
    }

    #[test]
    fn streaming_detection_tolerates_octet_stream_mislabel() {
        assert!(is_streaming_response(true, Some("application/octet-stream")));
    }
}
