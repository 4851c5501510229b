// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::config::{ClientConfig, DEFAULT_KEEP_ALIVE_INTERVAL_MS};
use crate::error::{ClientError, ConfigError};
use crate::retry::{RetryPolicy, Sleeper, TokioSleeper};
use crate::submitter::{GatewaySubmitter, Submitter};
use crate::trace::Trace;
use crate::transport::GrpcTransport;

/// Settings shared by every trace created from one client. The keep-alive interval is
/// always greater than zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceOptions {
    keep_alive_interval: Duration,
    retry_policy: RetryPolicy,
}

impl Default for TraceOptions {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_millis(DEFAULT_KEEP_ALIVE_INTERVAL_MS),
            retry_policy: RetryPolicy::default(),
        }
    }
}

impl TraceOptions {
    pub fn new(
        keep_alive_interval: Duration,
        retry_policy: RetryPolicy,
    ) -> Result<Self, ConfigError> {
        if keep_alive_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "keep-alive interval must be greater than 0".to_string(),
            ));
        }
        Ok(Self {
            keep_alive_interval,
            retry_policy,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Self::new(config.keep_alive_interval, config.retry_policy()?)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }
}

/// Entry point of the library: hands out [`Trace`]s bound to one gateway connection.
///
/// Cloning is cheap. Traces created from the same client share the submitter (and so the
/// transport connection) but nothing else.
#[derive(Clone)]
pub struct TraceClient {
    submitter: Arc<dyn Submitter>,
    options: Arc<TraceOptions>,
    sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for TraceClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TraceClient")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl TraceClient {
    /// Builds a client talking gRPC to `config.endpoint`.
    ///
    /// The connection itself is opened lazily by the first remote call, so this does not fail
    /// when the gateway is down.
    pub fn connect(config: &ClientConfig) -> Result<Self, ClientError> {
        let options = TraceOptions::from_config(config)?;
        let transport = GrpcTransport::new(config)?;
        debug!(
            endpoint = %transport.endpoint(),
            api_key_set = config.api_key.is_some(),
            "trace client configured"
        );
        let submitter = GatewaySubmitter::new(Arc::new(transport));
        Ok(Self::with_submitter(Arc::new(submitter), options))
    }

    pub fn from_env() -> Result<Self, ClientError> {
        let config = ClientConfig::from_env()?;
        Self::connect(&config)
    }

    /// Client backed by an arbitrary [`Submitter`].
    pub fn with_submitter(submitter: Arc<dyn Submitter>, options: TraceOptions) -> Self {
        Self {
            submitter,
            options: Arc::new(options),
            sleeper: Arc::new(TokioSleeper),
        }
    }

    /// Replaces how retry backoff delays are waited out.
    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn options(&self) -> &TraceOptions {
        &self.options
    }

    /// New trace in the Building state. Nothing is sent until [`Trace::create`].
    pub fn trace(&self, name: Option<&str>) -> Trace {
        Trace::new(
            name.map(str::to_string),
            self.submitter.clone(),
            self.options.clone(),
            self.sleeper.clone(),
        )
    }
}
