// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of a single trace: build, create (or resume), keep alive, close.
//!
//! Failures never cross this boundary. `create` reports failure as `None` plus an error log
//! and `close` always completes, so a degraded gateway cannot break the calling application.

use std::sync::Arc;
use tracing::{debug, error, warn};

use trace_gateway_proto::{
    self as proto, CloseTraceRequest, SendTraceRequest, Status, StatusCode, UpdateTraceRequest,
};

use crate::client::TraceOptions;
use crate::content::{now_ms, TraceContent};
use crate::keep_alive::KeepAliveScheduler;
use crate::retry::{retry, Sleeper};
use crate::submitter::Submitter;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TraceState {
    /// Accumulating content, nothing sent yet.
    Building,
    /// Create or update call in flight.
    Submitting,
    /// Accepted by the gateway and kept alive.
    Active,
    /// Close call in flight.
    Closing,
    Closed,
}

/// A trace owned by the caller. Created through [`crate::client::TraceClient::trace`].
pub struct Trace {
    name: Option<String>,
    trace_id: Option<String>,
    resume_from: Option<String>,
    content: TraceContent,
    state: TraceState,
    submitter: Arc<dyn Submitter>,
    options: Arc<TraceOptions>,
    sleeper: Arc<dyn Sleeper>,
    keep_alive: KeepAliveScheduler,
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("name", &self.name)
            .field("trace_id", &self.trace_id)
            .field("state", &self.state)
            .field("content", &self.content)
            .finish_non_exhaustive()
    }
}

impl Trace {
    pub(crate) fn new(
        name: Option<String>,
        submitter: Arc<dyn Submitter>,
        options: Arc<TraceOptions>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            name,
            trace_id: None,
            resume_from: None,
            content: TraceContent::new(),
            state: TraceState::Building,
            submitter,
            options,
            sleeper,
            keep_alive: KeepAliveScheduler::new(),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Id confirmed by the gateway. `None` until `create` succeeds.
    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn state(&self) -> TraceState {
        self.state
    }

    pub fn content(&self) -> &TraceContent {
        &self.content
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, TraceState::Closing | TraceState::Closed)
    }

    pub fn is_keep_alive_running(&self) -> bool {
        self.keep_alive.is_running()
    }

    pub fn add_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        if self.ignore_after_close("add_attribute") {
            return self;
        }
        self.content.set_attribute(key, value);
        self
    }

    pub fn add_attributes<K, V>(&mut self, attributes: impl IntoIterator<Item = (K, V)>) -> &mut Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        if self.ignore_after_close("add_attributes") {
            return self;
        }
        for (key, value) in attributes {
            self.content.set_attribute(key, value);
        }
        self
    }

    pub fn add_tag(&mut self, tag: impl Into<String>) -> &mut Self {
        if self.ignore_after_close("add_tag") {
            return self;
        }
        self.content.push_tag(tag);
        self
    }

    pub fn add_tags<T: Into<String>>(&mut self, tags: impl IntoIterator<Item = T>) -> &mut Self {
        if self.ignore_after_close("add_tags") {
            return self;
        }
        for tag in tags {
            self.content.push_tag(tag);
        }
        self
    }

    pub fn add_event(&mut self, name: impl Into<String>, details: Option<&str>) -> &mut Self {
        if self.ignore_after_close("add_event") {
            return self;
        }
        self.content.push_event(name, details.map(str::to_string));
        self
    }

    pub fn add_tx_hint(
        &mut self,
        hash: impl Into<String>,
        chain: impl Into<String>,
        details: Option<&str>,
    ) -> &mut Self {
        if self.ignore_after_close("add_tx_hint") {
            return self;
        }
        self.content
            .push_tx_hint(hash, chain, details.map(str::to_string));
        self
    }

    /// Continues an existing gateway trace: `create` then sends an update for `trace_id`
    /// instead of creating a new trace. Only allowed before the trace was submitted.
    pub fn resume(&mut self, trace_id: impl Into<String>) -> &mut Self {
        let trace_id = trace_id.into();
        if trace_id.trim().is_empty() {
            warn!("ignoring resume with an empty trace id");
            return self;
        }
        match self.state {
            TraceState::Building | TraceState::Submitting => {
                debug!(trace_id = %trace_id, "trace will resume an existing gateway trace");
                self.resume_from = Some(trace_id);
            }
            state => {
                warn!(
                    trace_id = ?self.trace_id,
                    ?state,
                    "trace already submitted, ignoring resume"
                );
            }
        }
        self
    }

    /// Submits the trace and starts the keep-alive.
    ///
    /// Returns the gateway trace id, or `None` if the gateway could not be reached after all
    /// retries or rejected the trace. A failed create leaves the trace in
    /// [`TraceState::Building`] so it may be retried.
    pub async fn create(&mut self) -> Option<String> {
        match self.state {
            TraceState::Closing | TraceState::Closed => {
                warn!(trace_id = ?self.trace_id, "trace is closed, ignoring create");
                return None;
            }
            TraceState::Active => {
                warn!(trace_id = ?self.trace_id, "trace already created");
                return self.trace_id.clone();
            }
            // Submitting here means an earlier create future was dropped before completing.
            TraceState::Building | TraceState::Submitting => {}
        }

        self.state = TraceState::Submitting;
        let data = proto::TraceContent::from(&self.content);
        let confirmed = match self.resume_from.clone() {
            Some(trace_id) => self.update(trace_id, data).await,
            None => self.send(data).await,
        };

        let Some(trace_id) = confirmed else {
            self.state = TraceState::Building;
            return None;
        };

        debug!(trace_id = %trace_id, "trace created");
        self.state = TraceState::Active;
        self.trace_id = Some(trace_id.clone());
        self.keep_alive.start(
            self.submitter.clone(),
            &trace_id,
            self.options.keep_alive_interval(),
        );
        Some(trace_id)
    }

    /// Stops the keep-alive, then makes one best-effort close call if the trace was created.
    /// Idempotent; later calls return immediately.
    pub async fn close(&mut self, reason: Option<&str>) {
        if self.is_closed() {
            debug!(trace_id = ?self.trace_id, "trace already closed");
            return;
        }

        self.state = TraceState::Closing;
        self.keep_alive.stop().await;

        if let Some(trace_id) = self.trace_id.clone() {
            let request = CloseTraceRequest {
                trace_id: trace_id.clone(),
                text: reason.map(str::to_string),
            };
            match self.submitter.close_trace(request).await {
                Ok(response) if response.accepted => {
                    debug!(trace_id = %trace_id, "trace closed");
                }
                Ok(_) => {
                    error!(trace_id = %trace_id, "gateway did not accept close");
                }
                Err(e) => {
                    error!(trace_id = %trace_id, "failed to close trace: {e}");
                }
            }
        }

        self.state = TraceState::Closed;
    }

    async fn send(&self, data: proto::TraceContent) -> Option<String> {
        let submitter = &self.submitter;
        let request = SendTraceRequest {
            name: self.name.clone(),
            data: Some(data),
            send_client_timestamp_ms: 0,
        };
        let result = retry(
            self.options.retry_policy(),
            "sendTrace",
            self.sleeper.as_ref(),
            || {
                let mut attempt = request.clone();
                attempt.send_client_timestamp_ms = now_ms();
                submitter.send_trace(attempt)
            },
        )
        .await;

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("failed to create trace: {e}");
                return None;
            }
        };
        if !accepted("sendTrace", response.status.as_ref()) {
            return None;
        }
        if response.trace_id.is_empty() {
            error!("gateway accepted trace without returning an id");
            return None;
        }
        Some(response.trace_id)
    }

    async fn update(&self, trace_id: String, data: proto::TraceContent) -> Option<String> {
        let submitter = &self.submitter;
        let request = UpdateTraceRequest {
            trace_id: trace_id.clone(),
            data: Some(data),
            send_client_timestamp_ms: 0,
        };
        let result = retry(
            self.options.retry_policy(),
            "updateTrace",
            self.sleeper.as_ref(),
            || {
                let mut attempt = request.clone();
                attempt.send_client_timestamp_ms = now_ms();
                submitter.update_trace(attempt)
            },
        )
        .await;

        match result {
            Ok(response) if accepted("updateTrace", response.status.as_ref()) => Some(trace_id),
            Ok(_) => None,
            Err(e) => {
                error!(trace_id = %trace_id, "failed to resume trace: {e}");
                None
            }
        }
    }

    fn ignore_after_close(&self, operation: &str) -> bool {
        if self.is_closed() {
            warn!(trace_id = ?self.trace_id, "trace is closed, ignoring {operation}");
            return true;
        }
        false
    }
}

/// A missing status counts as a rejection.
fn accepted(label: &str, status: Option<&Status>) -> bool {
    match status {
        Some(status) if status.is_success() => true,
        Some(status) => {
            let code = StatusCode::try_from(status.code)
                .map(|code| code.as_str_name())
                .unwrap_or("UNKNOWN");
            error!(
                label,
                code,
                "gateway rejected trace: {}",
                status.error_message
            );
            false
        }
        None => {
            error!(label, "gateway response carried no status");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::retry::tests::RecordingSleeper;
    use crate::retry::RetryPolicy;
    use crate::submitter::tests::{sent, Call, MockSubmitter};
    use std::time::Duration;
    use tokio::time::sleep;
    use trace_gateway_proto::{CloseTraceResponse, SendTraceResponse, UpdateTraceResponse};
    use tracing_test::traced_test;

    const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(10);

    struct Harness {
        submitter: Arc<MockSubmitter>,
        sleeper: Arc<RecordingSleeper>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_submitter(MockSubmitter::default())
        }

        fn with_submitter(submitter: MockSubmitter) -> Self {
            Self {
                submitter: Arc::new(submitter),
                sleeper: Arc::new(RecordingSleeper::default()),
            }
        }

        fn trace(&self, max_retries: u32, backoff_ms: u64) -> Trace {
            let retry_policy =
                RetryPolicy::new(max_retries, Duration::from_millis(backoff_ms)).unwrap();
            let options = TraceOptions::new(KEEP_ALIVE_INTERVAL, retry_policy).unwrap();
            Trace::new(
                Some("swap".to_string()),
                self.submitter.clone(),
                Arc::new(options),
                self.sleeper.clone(),
            )
        }
    }

    fn unavailable() -> Result<SendTraceResponse, TransportError> {
        Err(TransportError::Unavailable("connection refused".into()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_then_close_scenario() {
        let harness = Harness::new();
        harness.submitter.push_send(unavailable());
        harness.submitter.push_send(unavailable());
        harness.submitter.push_send(sent("t-1"));
        let mut trace = harness.trace(2, 100);

        assert_eq!(trace.create().await.as_deref(), Some("t-1"));
        assert_eq!(
            harness.sleeper.recorded(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(harness.submitter.send_calls(), 3);
        assert_eq!(trace.state(), TraceState::Active);
        assert_eq!(trace.trace_id(), Some("t-1"));
        assert!(trace.is_keep_alive_running());

        trace.close(Some("done")).await;
        assert!(!trace.is_keep_alive_running());
        assert_eq!(trace.state(), TraceState::Closed);
        assert_eq!(harness.submitter.close_calls(), 1);
        assert_eq!(
            harness.submitter.calls().last(),
            Some(&Call::Close(CloseTraceRequest {
                trace_id: "t-1".to_string(),
                text: Some("done".to_string()),
            }))
        );

        let calls_before = harness.submitter.calls().len();
        trace.close(None).await;
        assert_eq!(harness.submitter.calls().len(), calls_before);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_create_is_issued_at_most_once() {
        let harness = Harness::new();
        let mut trace = harness.trace(3, 100);

        assert_eq!(trace.create().await.as_deref(), Some("t-1"));
        assert_eq!(trace.create().await.as_deref(), Some("t-1"));
        assert_eq!(trace.create().await.as_deref(), Some("t-1"));
        assert_eq!(harness.submitter.send_calls(), 1);
        assert!(logs_contain("trace already created"));

        trace.close(None).await;
        assert_eq!(trace.create().await, None);
        assert_eq!(harness.submitter.send_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_many_times_issues_one_call() {
        let harness = Harness::new();
        let mut trace = harness.trace(0, 100);
        trace.create().await;

        for _ in 0..5 {
            trace.close(Some("bye")).await;
            assert_eq!(trace.state(), TraceState::Closed);
        }
        assert_eq!(harness.submitter.close_calls(), 1);
        assert_eq!(trace.trace_id(), Some("t-1"));
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_rejection_is_not_retried() {
        let harness = Harness::new();
        harness.submitter.push_send(Ok(SendTraceResponse {
            status: Some(Status::rejected(StatusCode::InvalidArgument, "name too long")),
            trace_id: String::new(),
        }));
        let mut trace = harness.trace(3, 100);

        assert_eq!(trace.create().await, None);
        assert_eq!(harness.submitter.send_calls(), 1);
        assert!(harness.sleeper.recorded().is_empty());
        assert_eq!(trace.state(), TraceState::Building);
        assert_eq!(trace.trace_id(), None);
        assert!(!trace.is_keep_alive_running());
        assert!(logs_contain("gateway rejected trace: name too long"));
        assert!(logs_contain("INVALID_ARGUMENT"));

        // Nothing was committed, so create may be retried.
        assert_eq!(trace.create().await.as_deref(), Some("t-1"));
        assert_eq!(trace.state(), TraceState::Active);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_missing_status_is_a_rejection() {
        let harness = Harness::new();
        harness.submitter.push_send(Ok(SendTraceResponse {
            status: None,
            trace_id: "t-1".to_string(),
        }));
        let mut trace = harness.trace(3, 100);

        assert_eq!(trace.create().await, None);
        assert_eq!(trace.trace_id(), None);
        assert!(logs_contain("gateway response carried no status"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_leave_trace_building() {
        let harness = Harness::new();
        for _ in 0..4 {
            harness.submitter.push_send(unavailable());
        }
        let mut trace = harness.trace(3, 50);

        assert_eq!(trace.create().await, None);
        assert_eq!(harness.submitter.send_calls(), 4);
        assert_eq!(
            harness.sleeper.recorded(),
            vec![
                Duration::from_millis(50),
                Duration::from_millis(100),
                Duration::from_millis(200)
            ]
        );
        assert_eq!(trace.state(), TraceState::Building);
        assert!(!trace.is_keep_alive_running());

        // Closing a trace that never got an id makes no remote call.
        trace.close(Some("abandoned")).await;
        assert_eq!(harness.submitter.close_calls(), 0);
        assert_eq!(trace.state(), TraceState::Closed);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_mutators_after_close_are_ignored() {
        let harness = Harness::new();
        let mut trace = harness.trace(0, 100);
        trace.add_attribute("user", "alice").add_tag("checkout");
        trace.create().await;
        trace.close(None).await;
        let snapshot = trace.content().clone();
        let calls = harness.submitter.calls().len();

        trace
            .add_attribute("user", "mallory")
            .add_attributes([("a", "1")])
            .add_tag("late")
            .add_tags(["later"])
            .add_event("after-close", None)
            .add_tx_hint("0xabc", "ethereum", None)
            .resume("t-2");
        assert_eq!(trace.create().await, None);

        assert_eq!(trace.content(), &snapshot);
        assert_eq!(trace.trace_id(), Some("t-1"));
        assert_eq!(harness.submitter.calls().len(), calls);
        assert!(logs_contain("trace is closed, ignoring add_attribute"));
        assert!(logs_contain("trace is closed, ignoring add_tx_hint"));
        assert!(logs_contain("trace is closed, ignoring create"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_content_is_sent_with_create() {
        let harness = Harness::new();
        let mut trace = harness.trace(0, 100);
        trace
            .add_attribute("pair", "ETH/USDC")
            .add_attribute("pair", "ETH/DAI")
            .add_tags(["swap", "mainnet"])
            .add_event("quote", Some("1inch"))
            .add_tx_hint("0xabc", "ethereum", None);
        trace.create().await;

        // Amendments stay legal while active.
        trace.add_tag("confirmed");
        assert_eq!(trace.content().tags().len(), 3);

        let Some(Call::Send(request)) = harness.submitter.calls().into_iter().next() else {
            panic!("expected a sendTrace call");
        };
        assert_eq!(request.name.as_deref(), Some("swap"));
        assert!(request.send_client_timestamp_ms > 0);
        let data = request.data.unwrap();
        assert_eq!(data.attributes["pair"], "ETH/DAI");
        assert_eq!(data.tags, vec!["swap".to_string(), "mainnet".to_string()]);
        assert_eq!(data.events[0].details.as_deref(), Some("1inch"));
        assert_eq!(data.tx_hints[0].hash, "0xabc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_issues_update() {
        let harness = Harness::new();
        let mut trace = harness.trace(1, 100);
        trace.resume("t-9").add_tag("resumed");
        assert_eq!(trace.trace_id(), None);

        assert_eq!(trace.create().await.as_deref(), Some("t-9"));
        assert_eq!(harness.submitter.send_calls(), 0);
        assert_eq!(harness.submitter.update_calls(), 1);
        let Some(Call::Update(request)) = harness.submitter.calls().into_iter().next() else {
            panic!("expected an updateTrace call");
        };
        assert_eq!(request.trace_id, "t-9");
        assert_eq!(request.data.unwrap().tags, vec!["resumed".to_string()]);
        assert!(trace.is_keep_alive_running());
        trace.close(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_update_is_retried_and_can_be_rejected() {
        let harness = Harness::new();
        harness
            .submitter
            .push_update(Err(TransportError::DeadlineExceeded(Duration::from_secs(5))));
        harness.submitter.push_update(Ok(UpdateTraceResponse {
            status: Some(Status::rejected(StatusCode::NotFound, "unknown trace")),
        }));
        let mut trace = harness.trace(2, 100);
        trace.resume("t-9");

        assert_eq!(trace.create().await, None);
        assert_eq!(harness.submitter.update_calls(), 2);
        assert_eq!(harness.sleeper.recorded(), vec![Duration::from_millis(100)]);
        assert_eq!(trace.trace_id(), None);
        assert_eq!(trace.state(), TraceState::Building);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_resume_after_create_is_ignored() {
        let harness = Harness::new();
        let mut trace = harness.trace(0, 100);
        trace.create().await;
        trace.resume("t-other");

        assert_eq!(trace.trace_id(), Some("t-1"));
        assert!(logs_contain("trace already submitted, ignoring resume"));
        trace.close(None).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_cadence_until_close() {
        let harness = Harness::new();
        let mut trace = harness.trace(0, 100);
        trace.create().await;

        sleep(Duration::from_secs(35)).await;
        assert_eq!(harness.submitter.keep_alive_calls(), 3);

        trace.close(None).await;
        sleep(Duration::from_secs(60)).await;
        assert_eq!(harness.submitter.keep_alive_calls(), 3);

        let calls = harness.submitter.calls();
        let close_at = calls
            .iter()
            .position(|c| matches!(c, Call::Close(_)))
            .unwrap();
        assert!(calls[close_at..]
            .iter()
            .all(|c| !matches!(c, Call::KeepAlive(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_in_flight_keep_alive_to_stop() {
        let harness = Harness::with_submitter(MockSubmitter {
            keep_alive_latency: Some(Duration::from_secs(30)),
            ..Default::default()
        });
        let mut trace = harness.trace(0, 100);
        trace.create().await;

        // A keep-alive starts at 10s and is still waiting on the gateway.
        sleep(Duration::from_secs(11)).await;
        assert_eq!(harness.submitter.keep_alive_calls(), 1);

        trace.close(Some("done")).await;
        assert!(!trace.is_keep_alive_running());
        sleep(Duration::from_secs(120)).await;

        let calls = harness.submitter.calls();
        assert!(matches!(calls.last(), Some(Call::Close(_))));
        assert_eq!(harness.submitter.keep_alive_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keep_alive_self_stop_keeps_trace_active() {
        let harness = Harness::new();
        harness
            .submitter
            .push_keep_alive(Ok(trace_gateway_proto::KeepAliveResponse { accepted: false }));
        let mut trace = harness.trace(0, 100);
        trace.create().await;

        sleep(Duration::from_secs(45)).await;
        assert_eq!(harness.submitter.keep_alive_calls(), 1);
        assert!(!trace.is_keep_alive_running());
        assert_eq!(trace.state(), TraceState::Active);

        trace.close(None).await;
        assert_eq!(harness.submitter.close_calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_close_failures_are_logged_not_raised() {
        let harness = Harness::new();
        harness
            .submitter
            .push_close(Err(TransportError::Unavailable("reset".into())));
        let mut trace = harness.trace(0, 100);
        trace.create().await;

        trace.close(Some("done")).await;
        assert_eq!(trace.state(), TraceState::Closed);
        assert!(logs_contain("failed to close trace"));

        let harness = Harness::new();
        harness
            .submitter
            .push_close(Ok(CloseTraceResponse { accepted: false }));
        let mut trace = harness.trace(0, 100);
        trace.create().await;
        trace.close(None).await;
        assert_eq!(trace.state(), TraceState::Closed);
        assert!(logs_contain("gateway did not accept close"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_create_can_be_retried() {
        let harness = Harness::with_submitter(MockSubmitter::default());
        // Every attempt fails; the backoff sleeps run on the paused tokio clock.
        for _ in 0..10 {
            harness.submitter.push_send(unavailable());
        }
        let retry_policy = RetryPolicy::new(1, Duration::from_secs(60)).unwrap();
        let options = TraceOptions::new(KEEP_ALIVE_INTERVAL, retry_policy).unwrap();
        let mut trace = Trace::new(
            None,
            harness.submitter.clone(),
            Arc::new(options),
            Arc::new(crate::retry::TokioSleeper),
        );

        let abandoned = tokio::time::timeout(Duration::from_secs(1), trace.create()).await;
        assert!(abandoned.is_err());
        assert_eq!(trace.state(), TraceState::Submitting);

        assert_eq!(trace.create().await, None);
        assert_eq!(trace.state(), TraceState::Building);
        assert_eq!(harness.submitter.send_calls(), 3);
    }
}
