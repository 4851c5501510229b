// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client library for submitting traces to a trace gateway.
//!
//! A [`TraceClient`] hands out [`Trace`]s. Each trace accumulates content locally, is
//! created on the gateway with bounded retries, kept alive on a fixed interval while open,
//! and closed exactly once. Remote calls go through a [`Transport`] that multiplexes every
//! call over a single gRPC connection.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod client;
pub mod config;
pub mod content;
pub mod error;
pub mod keep_alive;
pub mod retry;
pub mod submitter;
pub mod trace;
pub mod transport;

pub use client::{TraceClient, TraceOptions};
pub use config::ClientConfig;
pub use content::{parse_key_values, TraceContent};
pub use error::{ClientError, ConfigError, RetryError, TransportError};
pub use retry::{retry, RetryPolicy, Sleeper, TokioSleeper};
pub use submitter::{GatewaySubmitter, Submitter};
pub use trace::{Trace, TraceState};
pub use transport::{GrpcTransport, Metadata, ResponseStream, Transport};
