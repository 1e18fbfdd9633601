use crate::coin_id::CoinId;
use crate::schedule::api_date;
use chrono::NaiveDate;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use serde_json::Value;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Header carrying the demo-plan API key.
pub const API_KEY_HEADER: &str = "x-cg-demo-api-key";

/// Upper bound on a server-requested `retry-after` pause.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(120);

/// Configuration for the CoinGecko client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// API root, without trailing slash
    pub base_url: String,
    /// Maximum number of retry attempts on 429/5xx/transport errors (default: 3)
    pub max_retries: u32,
    /// Rate limit: requests per second, 0 disables pacing (default: 0.5)
    pub requests_per_second: f64,
    /// Request timeout in seconds (default: 30)
    pub timeout_seconds: u64,
    /// First backoff delay; doubled on every further attempt (default: 1000)
    pub backoff_base_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: "https://api.coingecko.com/api/v3".to_string(),
            max_retries: 3,
            requests_per_second: 0.5,
            timeout_seconds: 30,
            backoff_base_ms: 1000,
        }
    }
}

impl ClientConfig {
    /// Builds the client configuration from the `[coingecko]` config section.
    pub fn from_section(section: &crate::config::CoinGeckoSection) -> Self {
        ClientConfig {
            base_url: section.base_url.trim_end_matches('/').to_string(),
            max_retries: section.max_retries,
            requests_per_second: section.requests_per_second,
            timeout_seconds: section.timeout_seconds,
            ..ClientConfig::default()
        }
    }

    fn min_interval(&self) -> Option<Duration> {
        if self.requests_per_second > 0.0 {
            Some(Duration::from_secs_f64(1.0 / self.requests_per_second))
        } else {
            None
        }
    }
}

/// CoinGecko `/coins/{id}/history` client.
///
/// Returns the raw JSON document for a coin on a given day. Any non-success
/// HTTP status that survives the retry policy is logged and reported as
/// `None` so that a single unavailable coin never blocks the others.
#[derive(Debug)]
pub struct CoinGeckoClient {
    client: Client,
    config: ClientConfig,
    api_key: String,
    last_request: Mutex<Option<Instant>>,
}

impl CoinGeckoClient {
    /// Creates a new client.
    ///
    /// # Errors
    /// Returns `FetchError::ClientCreation` if the HTTP client cannot be built.
    pub fn new(config: ClientConfig, api_key: impl Into<String>) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| FetchError::ClientCreation(e.to_string()))?;

        Ok(CoinGeckoClient {
            client,
            config,
            api_key: api_key.into(),
            last_request: Mutex::new(None),
        })
    }

    /// URL of the history endpoint for a coin.
    pub fn history_url(&self, coin: &CoinId) -> String {
        format!("{}/coins/{}/history", self.config.base_url, coin)
    }

    /// Fetches the historical snapshot of `coin` on `date`.
    ///
    /// # Returns
    /// `Ok(Some(json))` on HTTP 200, `Ok(None)` when the API refused or had no
    /// data for the coin.
    ///
    /// # Errors
    /// Returns `FetchError::NetworkError` when the API stays unreachable after
    /// all retries, or `FetchError::ParseError` when a 200 body is not JSON.
    pub async fn fetch_coin_history(
        &self,
        coin: &CoinId,
        date: NaiveDate,
    ) -> Result<Option<Value>, FetchError> {
        let url = self.history_url(coin);
        let date_param = api_date(date);
        let mut attempt: u32 = 0;

        loop {
            self.wait_for_slot().await;

            debug!(coin = %coin, date = %date_param, attempt, "CoinGecko: requesting history");

            let result = self
                .client
                .get(&url)
                .header(ACCEPT, "application/json")
                .header(API_KEY_HEADER, &self.api_key)
                .query(&[("date", date_param.as_str()), ("localization", "false")])
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let body = response
                            .json::<Value>()
                            .await
                            .map_err(|e| FetchError::ParseError(format!("{}: {}", coin, e)))?;
                        return Ok(Some(body));
                    }

                    if is_retryable(status) && attempt < self.config.max_retries {
                        let delay = retry_after(&response).unwrap_or_else(|| self.backoff(attempt));
                        warn!(
                            coin = %coin,
                            status = status.as_u16(),
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "CoinGecko: retryable status"
                        );
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    warn!(
                        coin = %coin,
                        status = status.as_u16(),
                        reason = status.canonical_reason().unwrap_or("Unknown error"),
                        "CoinGecko: request failed, skipping coin"
                    );
                    return Ok(None);
                }
                Err(e) => {
                    if attempt < self.config.max_retries {
                        let delay = self.backoff(attempt);
                        warn!(coin = %coin, attempt, error = %e, "CoinGecko: transport error, retrying");
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(FetchError::NetworkError(format!("{}: {}", coin, e)));
                }
            }
        }
    }

    /// Sleeps until the configured request rate allows another call.
    async fn wait_for_slot(&self) {
        let Some(interval) = self.config.min_interval() else {
            return;
        };

        let wait = {
            let mut last = match self.last_request.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            let now = Instant::now();
            let next_allowed = last.map(|t| t + interval).unwrap_or(now);
            let slot = next_allowed.max(now);
            *last = Some(slot);
            slot - now
        };

        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(1u64 << attempt.min(16)))
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

fn retry_after(response: &Response) -> Option<Duration> {
    response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(|secs| Duration::from_secs(secs).min(MAX_RETRY_AFTER))
}

/// Errors that can occur while talking to the CoinGecko API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// HTTP client creation failed
    ClientCreation(String),
    /// The API could not be reached after all retries
    NetworkError(String),
    /// A successful response body could not be decoded
    ParseError(String),
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchError::ClientCreation(msg) => write!(f, "Client creation error: {}", msg),
            FetchError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            FetchError::ParseError(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for FetchError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = CoinGeckoClient::new(ClientConfig::default(), "key");
        assert!(client.is_ok());
    }

    #[test]
    fn test_history_url() {
        let config = ClientConfig {
            base_url: "http://localhost:9999/api/v3".to_string(),
            ..ClientConfig::default()
        };
        let client = CoinGeckoClient::new(config, "key").unwrap();
        let coin = CoinId::new("bitcoin").unwrap();
        assert_eq!(
            client.history_url(&coin),
            "http://localhost:9999/api/v3/coins/bitcoin/history"
        );
    }

    #[test]
    fn test_backoff_doubles() {
        let config = ClientConfig {
            backoff_base_ms: 100,
            ..ClientConfig::default()
        };
        let client = CoinGeckoClient::new(config, "key").unwrap();
        assert_eq!(client.backoff(0), Duration::from_millis(100));
        assert_eq!(client.backoff(1), Duration::from_millis(200));
        assert_eq!(client.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_min_interval() {
        let mut config = ClientConfig::default();
        config.requests_per_second = 2.0;
        assert_eq!(config.min_interval(), Some(Duration::from_millis(500)));
        config.requests_per_second = 0.0;
        assert_eq!(config.min_interval(), None);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::NOT_FOUND));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
    }

    #[test]
    fn test_fetch_error_display() {
        let error = FetchError::NetworkError("bitcoin: connection refused".to_string());
        assert!(error.to_string().contains("Network error"));
        assert!(error.to_string().contains("bitcoin"));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let config = ClientConfig {
            base_url: "http://127.0.0.1:1".to_string(),
            max_retries: 1,
            requests_per_second: 0.0,
            timeout_seconds: 2,
            backoff_base_ms: 0,
        };
        let client = CoinGeckoClient::new(config, "key").unwrap();
        let coin = CoinId::new("bitcoin").unwrap();
        let date = NaiveDate::from_ymd_opt(2025, 1, 30).unwrap();

        let result = client.fetch_coin_history(&coin, date).await;
        assert!(matches!(result, Err(FetchError::NetworkError(_))));
    }
}
