//! Pair Enrichment
//!
//! Looks an identifier up on the DexScreener search endpoint and returns the
//! pair address and base-token address of the first result. Lookups are
//! retried with exponential backoff; running out of attempts is not fatal,
//! the caller simply proceeds without enrichment.

use async_trait::async_trait;
use serde::Deserialize;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::DEFAULT_ENRICHMENT_URL;

/// Number of lookup attempts before giving up
pub const MAX_ATTEMPTS: u32 = 5;

/// Delay after the first failed attempt; doubles each time
pub const INITIAL_BACKOFF_MS: u64 = 500;

/// Per-request timeout
pub const REQUEST_TIMEOUT_MS: u64 = 10_000;

pub const USER_AGENT: &str = "Mozilla/5.0";

/// Errors that can occur during a single lookup attempt
#[derive(Error, Debug)]
pub enum EnrichError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unexpected HTTP status: {0}")]
    Status(u16),

    #[error("Failed to parse search response: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Search endpoint response
#[derive(Debug, Deserialize)]
pub struct SearchResponse {
    #[serde(default)]
    pub pairs: Option<Vec<SearchPair>>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPair {
    #[serde(default)]
    pub pair_address: Option<String>,
    #[serde(default)]
    pub base_token: Option<SearchToken>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SearchToken {
    #[serde(default)]
    pub address: Option<String>,
}

/// Addresses related to an identifier
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PairInfo {
    pub pair_address: Option<String>,
    pub token_address: Option<String>,
}

impl PairInfo {
    /// Non-empty addresses, pair first, without duplicates
    pub fn addresses(&self) -> Vec<String> {
        let mut out: Vec<String> = Vec::with_capacity(2);
        for addr in [&self.pair_address, &self.token_address].into_iter().flatten() {
            if !addr.is_empty() && !out.contains(addr) {
                out.push(addr.clone());
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.addresses().is_empty()
    }
}

impl From<SearchResponse> for PairInfo {
    fn from(response: SearchResponse) -> Self {
        let first = response.pairs.and_then(|pairs| pairs.into_iter().next());
        match first {
            Some(pair) => PairInfo {
                pair_address: pair.pair_address,
                token_address: pair.base_token.and_then(|t| t.address),
            },
            None => PairInfo::default(),
        }
    }
}

/// Parse a search response body into the first pair's addresses
pub fn parse_search_response(body: &str) -> Result<PairInfo, EnrichError> {
    let response: SearchResponse = serde_json::from_str(body)?;
    Ok(response.into())
}

/// A single enrichment lookup
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn lookup(&self, ca: &str) -> Result<PairInfo, EnrichError>;
}

/// DexScreener search client
pub struct DexScreenerClient {
    client: reqwest::Client,
    search_url: String,
}

impl Default for DexScreenerClient {
    fn default() -> Self {
        Self::new(DEFAULT_ENRICHMENT_URL)
    }
}

impl DexScreenerClient {
    pub fn new(search_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_millis(REQUEST_TIMEOUT_MS))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                reqwest::Client::new()
            });
        Self {
            client,
            search_url: search_url.into(),
        }
    }

    pub fn search_url(&self) -> &str {
        &self.search_url
    }
}

#[async_trait]
impl Enricher for DexScreenerClient {
    async fn lookup(&self, ca: &str) -> Result<PairInfo, EnrichError> {
        debug!("Searching {} for {}", self.search_url, ca);

        let response = self
            .client
            .get(&self.search_url)
            .query(&[("q", ca)])
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(EnrichError::Status(status.as_u16()));
        }

        let body = response.text().await?;
        parse_search_response(&body)
    }
}

/// Retry schedule for enrichment lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_ATTEMPTS,
            initial_backoff_ms: INITIAL_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt number `attempt` (zero-based)
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.initial_backoff_ms * 2u64.pow(attempt.min(16)))
    }

    /// Run `op` until it succeeds or the attempts are used up
    ///
    /// Sleeps between attempts without blocking the runtime; there is no sleep
    /// after the final attempt.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        for attempt in 0..self.max_attempts {
            match op().await {
                Ok(value) => return Some(value),
                Err(e) => {
                    error!("Attempt {} failed: {}", attempt + 1, e);
                    if attempt + 1 < self.max_attempts {
                        let delay = self.backoff_delay(attempt);
                        warn!("Retrying in {:?}", delay);
                        sleep(delay).await;
                    }
                }
            }
        }
        error!("All {} retry attempts failed", self.max_attempts);
        None
    }
}

/// Look `ca` up with retries, yielding empty info when every attempt fails
pub async fn enrich<E: Enricher + ?Sized>(
    enricher: &E,
    policy: &RetryPolicy,
    ca: &str,
) -> PairInfo {
    policy
        .run(|| enricher.lookup(ca))
        .await
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    const SEARCH_BODY: &str = r#"{
        "schemaVersion": "1.0.0",
        "pairs": [
            {
                "chainId": "solana",
                "pairAddress": "PairAddr111",
                "baseToken": { "address": "TokenAddr111", "name": "Dog", "symbol": "DOG" }
            },
            {
                "chainId": "solana",
                "pairAddress": "PairAddr222",
                "baseToken": { "address": "TokenAddr222" }
            }
        ]
    }"#;

    // ==================== parse_search_response tests ====================

    #[test]
    fn test_parse_takes_first_pair() {
        let info = parse_search_response(SEARCH_BODY).unwrap();
        assert_eq!(info.pair_address.as_deref(), Some("PairAddr111"));
        assert_eq!(info.token_address.as_deref(), Some("TokenAddr111"));
    }

    #[test]
    fn test_parse_empty_pairs() {
        let info = parse_search_response(r#"{"pairs": []}"#).unwrap();
        assert_eq!(info, PairInfo::default());
    }

    #[test]
    fn test_parse_null_or_missing_pairs() {
        assert!(parse_search_response(r#"{"pairs": null}"#).unwrap().is_empty());
        assert!(parse_search_response(r#"{}"#).unwrap().is_empty());
    }

    #[test]
    fn test_parse_pair_without_base_token() {
        let info = parse_search_response(r#"{"pairs": [{"pairAddress": "P1"}]}"#).unwrap();
        assert_eq!(info.pair_address.as_deref(), Some("P1"));
        assert_eq!(info.token_address, None);
    }

    #[test]
    fn test_parse_malformed_body() {
        let result = parse_search_response("<html>rate limited</html>");
        assert!(matches!(result, Err(EnrichError::Parse(_))));
    }

    // ==================== PairInfo tests ====================

    #[test]
    fn test_addresses_skips_empty_and_duplicates() {
        let info = PairInfo {
            pair_address: Some("same".to_string()),
            token_address: Some("same".to_string()),
        };
        assert_eq!(info.addresses(), vec!["same"]);

        let info = PairInfo {
            pair_address: Some(String::new()),
            token_address: Some("token".to_string()),
        };
        assert_eq!(info.addresses(), vec!["token"]);
    }

    #[test]
    fn test_addresses_pair_first() {
        let info = PairInfo {
            pair_address: Some("pair".to_string()),
            token_address: Some("token".to_string()),
        };
        assert_eq!(info.addresses(), vec!["pair", "token"]);
    }

    // ==================== RetryPolicy tests ====================

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.initial_backoff_ms, 500);
    }

    #[test]
    fn test_backoff_delay_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_delay(0), Duration::from_millis(500));
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(policy.backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(4000));
        assert_eq!(policy.backoff_delay(4), Duration::from_millis(8000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fails_four_times_then_succeeds() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result = policy
            .run(|| {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                async move {
                    if n < 5 {
                        Err(format!("attempt {} down", n))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result, Some(5));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        assert!(start.elapsed() >= Duration::from_millis(7500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_returns_none() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Option<()> = policy
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("unreachable host") }
            })
            .await;

        assert_eq!(result, None);
        assert_eq!(calls.load(Ordering::SeqCst), 5);
        // 0.5 + 1 + 2 + 4, nothing after the last attempt
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(7500));
        assert!(elapsed < Duration::from_millis(15500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_first_success_does_not_sleep() {
        let policy = RetryPolicy::default();
        let start = Instant::now();

        let result = policy.run(|| async { Ok::<_, String>(42) }).await;

        assert_eq!(result, Some(42));
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    // ==================== enrich tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_enrich_uses_lookup_result() {
        let mut mock = MockEnricher::new();
        mock.expect_lookup()
            .withf(|ca| ca.contains("CA111"))
            .times(1)
            .returning(|_| {
                Ok(PairInfo {
                    pair_address: Some("P".to_string()),
                    token_address: Some("T".to_string()),
                })
            });

        let info = enrich(&mock, &RetryPolicy::default(), "CA111").await;
        assert_eq!(info.addresses(), vec!["P", "T"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enrich_exhaustion_yields_empty_info() {
        let mut mock = MockEnricher::new();
        mock.expect_lookup()
            .times(5)
            .returning(|_| Err(EnrichError::Status(429)));

        let info = enrich(&mock, &RetryPolicy::default(), "CA111").await;
        assert_eq!(info, PairInfo::default());
    }

    #[test]
    fn test_enrich_error_display() {
        assert!(EnrichError::Status(503).to_string().contains("503"));
    }

    // ==================== live endpoint ====================

    #[tokio::test]
    #[ignore = "Requires network access to the DexScreener API"]
    async fn test_live_search_wrapped_sol() {
        let client = DexScreenerClient::default();
        let info = client
            .lookup("So11111111111111111111111111111111111111112")
            .await
            .unwrap();
        assert!(info.pair_address.is_some());
    }
}
