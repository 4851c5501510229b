// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::time::Duration;

/// Failures produced while issuing a remote call through a [`crate::transport::Transport`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Connection could not be established or was lost.
    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    #[error("deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// The call completed without error but carried no payload.
    #[error("gateway returned an empty response")]
    EmptyResponse,

    /// Non-OK `grpc-status` reported by the server.
    #[error("gateway returned grpc-status {code}: {message}")]
    Status { code: u16, message: String },

    #[error("{0} calls are not supported")]
    NotImplemented(&'static str),

    #[error("invalid call metadata: {0}")]
    InvalidMetadata(String),

    #[error("failed to decode protobuf payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("malformed gRPC exchange: {0}")]
    Protocol(String),
}

/// Last error seen by [`crate::retry::retry`] once every attempt failed.
#[derive(Debug, thiserror::Error)]
#[error("{label} failed after {attempts} attempt(s): {source}")]
pub struct RetryError<E>
where
    E: std::error::Error + 'static,
{
    pub label: String,
    pub attempts: u32,
    #[source]
    pub source: E,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build transport: {0}")]
    Transport(#[from] TransportError),
}
