// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic keep-alive pings for a submitted trace.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use trace_gateway_proto::KeepAliveRequest;

use crate::submitter::Submitter;

/// Owns at most one keep-alive task. Dropping the scheduler cancels the task.
#[derive(Debug, Default)]
pub struct KeepAliveScheduler {
    handle: Option<KeepAliveHandle>,
}

#[derive(Debug)]
struct KeepAliveHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl Drop for KeepAliveHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl KeepAliveScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts pinging `trace_id` every `interval`. Returns false, doing nothing, if a task is
    /// already running or the interval is zero.
    pub fn start(
        &mut self,
        submitter: Arc<dyn Submitter>,
        trace_id: &str,
        interval: Duration,
    ) -> bool {
        if self.is_running() {
            debug!(trace_id, "keep-alive already running");
            return false;
        }
        if interval.is_zero() {
            warn!(trace_id, "keep-alive interval must be greater than 0, not starting");
            return false;
        }

        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(
            submitter,
            trace_id.to_string(),
            interval,
            cancel.clone(),
        ));
        debug!(
            trace_id,
            interval_ms = interval.as_millis() as u64,
            "keep-alive started"
        );
        self.handle = Some(KeepAliveHandle { cancel, task });
        true
    }

    /// Cancels the task and waits for it to exit. No keep-alive call is in flight once this
    /// returns.
    pub async fn stop(&mut self) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        handle.cancel.cancel();
        if let Err(e) = (&mut handle.task).await {
            if e.is_panic() {
                warn!("keep-alive task panicked: {e}");
            }
        }
    }

    /// False once stopped, or after the gateway stopped accepting the trace.
    pub fn is_running(&self) -> bool {
        self.handle
            .as_ref()
            .is_some_and(|handle| !handle.task.is_finished())
    }
}

async fn run(
    submitter: Arc<dyn Submitter>,
    trace_id: String,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let request = KeepAliveRequest {
            trace_id: trace_id.clone(),
        };
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            result = submitter.keep_alive(request) => result,
        };

        match result {
            Ok(response) if response.accepted => {
                debug!(trace_id = %trace_id, "keep-alive accepted");
            }
            Ok(_) => {
                warn!(
                    trace_id = %trace_id,
                    "gateway no longer accepts trace, stopping keep-alive"
                );
                break;
            }
            Err(e) => {
                warn!(trace_id = %trace_id, "keep-alive failed: {e}");
            }
        }
    }
    debug!(trace_id = %trace_id, "keep-alive stopped");
}
