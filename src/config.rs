//! Application configuration loaded from environment variables.
//!
//! Every variable is optional; empty values count as absent:
//! - `QUOTELINE_WEBSOCKET_URL` : feed endpoint (default `wss://ws.derivws.com/websockets/v3`)
//! - `QUOTELINE_APP_ID` : numeric application id (default `1089`)
//! - `QUOTELINE_LANGUAGE` : reply language (default `EN`)
//! - `QUOTELINE_AUTH_TOKEN` : session token sent with `authorize` on connect
//! - `QUOTELINE_MAX_RECONNECT_ATTEMPTS` : stale checks before the session is
//!   invalidated (default `5`)
//! - `QUOTELINE_SERIES_CAPACITY` : points kept per stream (default `1000`)

use std::time::Duration;

use crate::error::QuotelineError;
use crate::series::DEFAULT_CAPACITY;
use crate::websocket::RetryPolicy;

/// Default public WebSocket endpoint.
const DEFAULT_WEBSOCKET_URL: &str = "wss://ws.derivws.com/websockets/v3";
const DEFAULT_APP_ID: u32 = 1089;
const DEFAULT_LANGUAGE: &str = "EN";
const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Top-level application configuration.
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub feed: FeedConfig,
    pub stream: StreamConfig,
}

/// Connection settings.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub websocket_url: String,
    pub app_id: u32,
    pub language: String,
    pub auth_token: Option<String>,
    pub max_reconnect_attempts: u32,
    /// How long a request waits for its reply.
    pub request_timeout: Duration,
    /// Period of the keep-alive and reconnect watchdog.
    pub watchdog_interval: Duration,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            websocket_url: DEFAULT_WEBSOCKET_URL.to_string(),
            app_id: DEFAULT_APP_ID,
            language: DEFAULT_LANGUAGE.to_string(),
            auth_token: None,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            request_timeout: Duration::from_secs(30),
            watchdog_interval: Duration::from_secs(30),
        }
    }
}

impl FeedConfig {
    /// The URL actually dialed, carrying the app id and language.
    pub fn endpoint(&self) -> String {
        format!(
            "{}?app_id={}&l={}",
            self.websocket_url, self.app_id, self.language
        )
    }
}

/// Stream and chart settings.
#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub series_capacity: usize,
    /// Bound on catalog and historical quote fetches.
    pub fetch_timeout: Duration,
    /// Extra attempts when the symbol catalog comes back empty.
    pub chart_data_retries: u32,
    pub chart_data_retry_delay: Duration,
    pub retry: RetryPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            series_capacity: DEFAULT_CAPACITY,
            fetch_timeout: Duration::from_secs(10),
            chart_data_retries: 5,
            chart_data_retry_delay: Duration::from_secs(1),
            retry: RetryPolicy::default(),
        }
    }
}

/// Loads the application configuration from environment variables.
///
/// # Errors
///
/// Returns [`QuotelineError::Config`] if a numeric variable does not parse
/// or a count is zero.
pub fn fetch_config() -> crate::Result<AppConfig> {
    let mut config = AppConfig::default();

    if let Some(url) = non_empty_var("QUOTELINE_WEBSOCKET_URL") {
        config.feed.websocket_url = url;
    }
    if let Some(app_id) = parsed_var("QUOTELINE_APP_ID")? {
        config.feed.app_id = app_id;
    }
    if let Some(language) = non_empty_var("QUOTELINE_LANGUAGE") {
        config.feed.language = language;
    }
    config.feed.auth_token = non_empty_var("QUOTELINE_AUTH_TOKEN");

    if let Some(attempts) = parsed_var::<u32>("QUOTELINE_MAX_RECONNECT_ATTEMPTS")? {
        if attempts == 0 {
            return Err(QuotelineError::Config(
                "QUOTELINE_MAX_RECONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        config.feed.max_reconnect_attempts = attempts;
    }
    if let Some(capacity) = parsed_var::<usize>("QUOTELINE_SERIES_CAPACITY")? {
        if capacity == 0 {
            return Err(QuotelineError::Config(
                "QUOTELINE_SERIES_CAPACITY must be at least 1".to_string(),
            ));
        }
        config.stream.series_capacity = capacity;
    }

    Ok(config)
}

/// Returns the value of an environment variable if it exists and is non-empty.
fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.is_empty())
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> crate::Result<Option<T>> {
    non_empty_var(name)
        .map(|value| {
            value.trim().parse().map_err(|_| {
                QuotelineError::Config(format!("{name} must be a number, got {value:?}"))
            })
        })
        .transpose()
}
