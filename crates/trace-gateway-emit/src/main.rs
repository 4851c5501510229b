// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use anyhow::Context;
use std::env;
use std::process::ExitCode;
use tokio::time::Duration;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use trace_gateway_client::{parse_key_values, ClientConfig, TraceClient};

const DEFAULT_TRACE_NAME: &str = "trace-gateway-emit";

/// What to submit, read from `TRACE_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EmitSettings {
    name: String,
    tags: Vec<String>,
    attributes: Vec<(String, String)>,
    hold: Duration,
    close_reason: Option<String>,
}

impl EmitSettings {
    fn from_env() -> anyhow::Result<Self> {
        let name = env::var("TRACE_NAME")
            .ok()
            .filter(|val| !val.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_TRACE_NAME.to_string());
        let tags = env::var("TRACE_TAGS")
            .map(|val| {
                val.split(',')
                    .map(str::trim)
                    .filter(|tag| !tag.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        let attributes = env::var("TRACE_ATTRIBUTES")
            .map(|val| parse_key_values(&val).into_iter().collect())
            .unwrap_or_default();
        let hold = match env::var("TRACE_HOLD_SECS") {
            Ok(val) => Duration::from_secs(
                val.trim()
                    .parse::<u64>()
                    .with_context(|| format!("TRACE_HOLD_SECS '{val}' is not a number of seconds"))?,
            ),
            Err(_) => Duration::ZERO,
        };
        let close_reason = env::var("TRACE_CLOSE_REASON")
            .ok()
            .filter(|val| !val.trim().is_empty());

        Ok(Self {
            name,
            tags,
            attributes,
            hold,
            close_reason,
        })
    }
}

fn init_logging(log_level: &str) -> anyhow::Result<()> {
    let env_filter = format!("h2=off,hyper=off,{log_level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::try_new(env_filter).context("could not parse log level")?)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    Ok(())
}

/// Returns whether the trace was accepted by the gateway.
async fn run(config: ClientConfig, settings: EmitSettings) -> anyhow::Result<bool> {
    let client = TraceClient::connect(&config).context("failed to build trace client")?;

    let mut trace = client.trace(Some(settings.name.as_str()));
    trace
        .add_attributes(settings.attributes)
        .add_tags(settings.tags)
        .add_event("emit.start", None);

    let Some(trace_id) = trace.create().await else {
        error!(endpoint = %config.endpoint, "Gateway did not accept the trace");
        trace.close(settings.close_reason.as_deref()).await;
        return Ok(false);
    };
    info!(trace_id = %trace_id, "Trace created");

    if !settings.hold.is_zero() {
        debug!(hold_secs = settings.hold.as_secs(), "Holding trace open");
        tokio::time::sleep(settings.hold).await;
    }

    trace.close(settings.close_reason.as_deref()).await;
    info!(trace_id = %trace_id, "Trace closed");
    Ok(true)
}

#[tokio::main]
pub async fn main() -> ExitCode {
    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.log_level) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }
    debug!("Logging subsystem enabled");

    let settings = match EmitSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    match run(config, settings).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
