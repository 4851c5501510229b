// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use trace_gateway_proto as proto;

/// Timestamped sub-record attached to a trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TraceEvent {
    pub name: String,
    pub details: Option<String>,
    /// Milliseconds since the Unix epoch, captured when the event was added.
    pub timestamp_ms: i64,
}

/// Blockchain transaction referenced by a trace.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxHint {
    pub hash: String,
    pub chain: String,
    pub details: Option<String>,
    pub timestamp_ms: i64,
}

/// Content accumulated by a trace before and after it is submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceContent {
    attributes: BTreeMap<String, String>,
    tags: Vec<String>,
    events: Vec<TraceEvent>,
    tx_hints: Vec<TxHint>,
}

impl TraceContent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last write wins.
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.attributes.insert(key.into(), value.into());
    }

    pub fn push_tag(&mut self, tag: impl Into<String>) {
        self.tags.push(tag.into());
    }

    pub fn push_event(&mut self, name: impl Into<String>, details: Option<String>) {
        self.events.push(TraceEvent {
            name: name.into(),
            details,
            timestamp_ms: now_ms(),
        });
    }

    pub fn push_tx_hint(
        &mut self,
        hash: impl Into<String>,
        chain: impl Into<String>,
        details: Option<String>,
    ) {
        self.tx_hints.push(TxHint {
            hash: hash.into(),
            chain: chain.into(),
            details,
            timestamp_ms: now_ms(),
        });
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn tx_hints(&self) -> &[TxHint] {
        &self.tx_hints
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
            && self.tags.is_empty()
            && self.events.is_empty()
            && self.tx_hints.is_empty()
    }
}

impl From<&TraceContent> for proto::TraceContent {
    fn from(content: &TraceContent) -> Self {
        proto::TraceContent {
            attributes: content.attributes.clone(),
            tags: content.tags.clone(),
            events: content
                .events
                .iter()
                .map(|event| proto::Event {
                    name: event.name.clone(),
                    details: event.details.clone(),
                    timestamp_ms: event.timestamp_ms,
                })
                .collect(),
            tx_hints: content
                .tx_hints
                .iter()
                .map(|hint| proto::TxHint {
                    hash: hint.hash.clone(),
                    chain: hint.chain.clone(),
                    details: hint.details.clone(),
                    timestamp_ms: hint.timestamp_ms,
                })
                .collect(),
        }
    }
}

/// Milliseconds since the Unix epoch; 0 if the clock is before the epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Parses `key:value` pairs separated by spaces or commas. Malformed pairs are skipped.
pub fn parse_key_values(input: &str) -> BTreeMap<String, String> {
    let normalized = input.replace(',', " ");

    normalized
        .split_whitespace()
        .filter_map(|kv| {
            let (key, value) = kv.split_once(':')?;
            if key.is_empty() || value.is_empty() || value.contains(':') {
                return None;
            }
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}
