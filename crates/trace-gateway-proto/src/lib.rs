// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Protobuf models for the `tracegateway.v1.TraceGateway` service.
//!
//! The message layout matches the gateway's `.proto` definitions field for field. Only the
//! four unary operations used by the client library are described here: `SendTrace`,
//! `UpdateTrace`, `KeepAlive` and `CloseTrace`.

use std::collections::BTreeMap;

/// Fully qualified gRPC service name.
pub const SERVICE: &str = "tracegateway.v1.TraceGateway";

/// Method names exposed by [`SERVICE`].
pub mod method {
    pub const SEND_TRACE: &str = "SendTrace";
    pub const UPDATE_TRACE: &str = "UpdateTrace";
    pub const KEEP_ALIVE: &str = "KeepAlive";
    pub const CLOSE_TRACE: &str = "CloseTrace";
}

/// Outcome classes reported by the gateway in a well-formed response.
///
/// Only [`StatusCode::Ok`] means the request was accepted; every other value is an
/// application-level rejection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
    InvalidArgument = 2,
    Unauthenticated = 3,
    NotFound = 4,
    ResourceExhausted = 5,
    Internal = 6,
}

impl StatusCode {
    /// String value of the enum field names used in the protobuf definition.
    pub fn as_str_name(&self) -> &'static str {
        match self {
            StatusCode::Ok => "OK",
            StatusCode::Error => "ERROR",
            StatusCode::InvalidArgument => "INVALID_ARGUMENT",
            StatusCode::Unauthenticated => "UNAUTHENTICATED",
            StatusCode::NotFound => "NOT_FOUND",
            StatusCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            StatusCode::Internal => "INTERNAL",
        }
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Status {
    #[prost(enumeration = "StatusCode", tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub error_message: String,
}

impl Status {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok as i32,
            error_message: String::new(),
        }
    }

    pub fn rejected(code: StatusCode, error_message: impl Into<String>) -> Self {
        Self {
            code: code as i32,
            error_message: error_message.into(),
        }
    }

    /// Unknown status values are treated as failures.
    pub fn is_success(&self) -> bool {
        StatusCode::try_from(self.code) == Ok(StatusCode::Ok)
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Event {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, optional, tag = "2")]
    pub details: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "3")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TxHint {
    #[prost(string, tag = "1")]
    pub hash: String,
    #[prost(string, tag = "2")]
    pub chain: String,
    #[prost(string, optional, tag = "3")]
    pub details: Option<String>,
    /// Milliseconds since the Unix epoch.
    #[prost(int64, tag = "4")]
    pub timestamp_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TraceContent {
    #[prost(btree_map = "string, string", tag = "1")]
    pub attributes: BTreeMap<String, String>,
    #[prost(string, repeated, tag = "2")]
    pub tags: Vec<String>,
    #[prost(message, repeated, tag = "3")]
    pub events: Vec<Event>,
    #[prost(message, repeated, tag = "4")]
    pub tx_hints: Vec<TxHint>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTraceRequest {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
    #[prost(message, optional, tag = "2")]
    pub data: Option<TraceContent>,
    #[prost(int64, tag = "3")]
    pub send_client_timestamp_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SendTraceResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
    #[prost(string, tag = "2")]
    pub trace_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateTraceRequest {
    #[prost(string, tag = "1")]
    pub trace_id: String,
    #[prost(message, optional, tag = "2")]
    pub data: Option<TraceContent>,
    #[prost(int64, tag = "3")]
    pub send_client_timestamp_ms: i64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct UpdateTraceResponse {
    #[prost(message, optional, tag = "1")]
    pub status: Option<Status>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeepAliveRequest {
    #[prost(string, tag = "1")]
    pub trace_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct KeepAliveResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseTraceRequest {
    #[prost(string, tag = "1")]
    pub trace_id: String,
    #[prost(string, optional, tag = "2")]
    pub text: Option<String>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CloseTraceResponse {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
}
