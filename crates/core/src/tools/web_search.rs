//! # Web Search
//!
//! Search execution collaborator. Side-effect free; retried by the caller.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::orchestration::retry::Retryable;

/// One raw web result
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WebHit {
    pub title: String,
    pub url: String,
    pub snippet: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SearchError {
    /// Backend unreachable or timed out
    #[error("search backend unavailable: {0}")]
    Transient(String),
    #[error("search failed: {0}")]
    Failed(String),
}

impl Retryable for SearchError {
    fn is_retryable(&self) -> bool {
        matches!(self, SearchError::Transient(_))
    }

    fn timed_out(after: Duration) -> Self {
        SearchError::Transient(format!("search exceeded {:?}", after))
    }
}

#[async_trait]
pub trait WebSearch: Send + Sync {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebHit>, SearchError>;
}

/// SearXNG JSON API client
pub struct SearxngSearch {
    client: reqwest::Client,
    endpoints: Vec<String>,
}

impl SearxngSearch {
    /// Endpoints in priority order: configured URL, `SEARXNG_URL`, local instance.
    pub fn new(configured_url: Option<&str>) -> Self {
        let mut endpoints: Vec<String> = Vec::new();

        if let Some(url) = configured_url {
            endpoints.push(format!("{}/search", url.trim_end_matches('/')));
        }
        if let Ok(custom_url) = std::env::var("SEARXNG_URL") {
            endpoints.push(format!("{}/search", custom_url.trim_end_matches('/')));
        }
        endpoints.push("http://localhost:8888/search".to_string());
        endpoints.dedup();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent("dossier/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[async_trait]
impl WebSearch for SearxngSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebHit>, SearchError> {
        let mut last_error = String::from("no search endpoint configured");

        for endpoint in &self.endpoints {
            let url = format!("{}?q={}&format=json", endpoint, urlencoding::encode(query));

            let response = match self.client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "Search endpoint unreachable");
                    last_error = e.to_string();
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                last_error = format!("{} returned {}", endpoint, status);
                continue;
            }

            match response.json::<serde_json::Value>().await {
                Ok(json) => match parse_results(&json, max_results) {
                    Some(hits) => return Ok(hits),
                    None => last_error = format!("{} returned no result list", endpoint),
                },
                Err(e) => last_error = format!("{} returned invalid JSON: {}", endpoint, e),
            }
        }

        Err(SearchError::Transient(last_error))
    }
}

/// Extract hits from a SearXNG response body
pub fn parse_results(json: &serde_json::Value, max_results: usize) -> Option<Vec<WebHit>> {
    let results = json.get("results")?.as_array()?;
    let field = |r: &serde_json::Value, key: &str| {
        r.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string()
    };

    Some(
        results
            .iter()
            .take(max_results)
            .map(|r| WebHit {
                title: field(r, "title"),
                url: field(r, "url"),
                snippet: field(r, "content"),
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_results_limits_and_maps_fields() {
        let body = json!({
            "results": [
                { "title": "A", "url": "https://a.example", "content": "alpha" },
                { "title": "B", "url": "https://b.example" },
                { "title": "C", "url": "https://c.example", "content": "gamma" }
            ]
        });

        let hits = parse_results(&body, 2).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "alpha");
        assert_eq!(hits[1].snippet, "");
    }

    #[test]
    fn test_parse_results_requires_list() {
        assert!(parse_results(&json!({ "error": "rate limited" }), 5).is_none());
    }

    #[test]
    fn test_configured_endpoint_comes_first() {
        let search = SearxngSearch::new(Some("http://search.internal/"));
        assert_eq!(search.endpoints()[0], "http://search.internal/search");
        assert!(search
            .endpoints()
            .iter()
            .any(|e| e == "http://localhost:8888/search"));
    }

    #[test]
    fn test_only_transient_is_retryable() {
        assert!(SearchError::Transient("x".into()).is_retryable());
        assert!(!SearchError::Failed("x".into()).is_retryable());
    }
}
