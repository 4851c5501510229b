// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::error::ConfigError;
use crate::retry::RetryPolicy;
use std::env;
use std::time::Duration;

/// Gateway endpoint used when none is configured.
pub const DEFAULT_ENDPOINT: &str = "localhost:50051";
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 1_000;
/// Deadline applied to every unary call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// HTTP/2 PING settings for the transport connection.
///
/// These keep the TCP connection healthy and are unrelated to the per-trace keep-alive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionKeepAlive {
    pub interval: Duration,
    pub timeout: Duration,
    pub while_idle: bool,
}

impl Default for ConnectionKeepAlive {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(10),
            while_idle: true,
        }
    }
}

/// Configuration for a [`crate::client::TraceClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Gateway address as `host:port`
    pub endpoint: String,
    /// Sent as the `x-api-key` header on every call when set
    pub api_key: Option<String>,
    /// How often an active trace pings the gateway
    pub keep_alive_interval: Duration,
    /// Retries for the initial create/update call, on top of the first attempt
    pub max_retries: u32,
    /// Base delay between create/update attempts, doubled after each failure
    pub retry_backoff: Duration,
    pub request_timeout: Duration,
    pub connection_keep_alive: ConnectionKeepAlive,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: None,
            keep_alive_interval: Duration::from_millis(DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
            request_timeout: REQUEST_TIMEOUT,
            connection_keep_alive: ConnectionKeepAlive::default(),
            log_level: "info".to_string(),
        }
    }
}

impl ClientConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let endpoint = env::var("TRACE_GATEWAY_ENDPOINT")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());
        let api_key = env::var("TRACE_GATEWAY_API_KEY")
            .ok()
            .map(|val| val.trim().to_string())
            .filter(|val| !val.is_empty());
        let keep_alive_interval = Duration::from_millis(parse_env_or(
            "TRACE_GATEWAY_KEEP_ALIVE_INTERVAL_MS",
            DEFAULT_KEEP_ALIVE_INTERVAL_MS,
        ));
        let max_retries = parse_env_or("TRACE_GATEWAY_MAX_RETRIES", DEFAULT_MAX_RETRIES);
        let retry_backoff = Duration::from_millis(parse_env_or(
            "TRACE_GATEWAY_RETRY_BACKOFF_MS",
            DEFAULT_RETRY_BACKOFF_MS,
        ));
        let log_level = env::var("TRACE_GATEWAY_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| "info".to_string());

        let config = Self {
            endpoint,
            api_key,
            keep_alive_interval,
            max_retries,
            retry_backoff,
            log_level,
            ..Default::default()
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::Invalid(
                "gateway endpoint cannot be empty".to_string(),
            ));
        }
        match endpoint.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {}
            _ => {
                return Err(ConfigError::Invalid(format!(
                    "gateway endpoint '{endpoint}' must be in host:port form"
                )))
            }
        }

        if self.keep_alive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "keep-alive interval must be greater than 0".to_string(),
            ));
        }

        if self.retry_backoff.is_zero() {
            return Err(ConfigError::Invalid(
                "retry backoff must be greater than 0".to_string(),
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: trace, debug, info, warn, error",
                self.log_level
            )));
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> Result<RetryPolicy, ConfigError> {
        RetryPolicy::new(self.max_retries, self.retry_backoff)
    }

    /// `http://host:port` authority used for h2c requests.
    pub(crate) fn base_uri(&self) -> String {
        format!("http://{}", self.endpoint.trim())
    }
}

fn parse_env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|val| val.trim().parse::<T>().ok())
        .unwrap_or(default)
}
