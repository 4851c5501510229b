// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::sync::Arc;
use tracing::debug;

use trace_gateway_proto::{
    method, CloseTraceRequest, CloseTraceResponse, KeepAliveRequest, KeepAliveResponse,
    SendTraceRequest, SendTraceResponse, UpdateTraceRequest, UpdateTraceResponse, SERVICE,
};

use crate::error::TransportError;
use crate::transport::Transport;

/// The four remote operations a trace needs from the gateway.
#[async_trait]
pub trait Submitter: Send + Sync {
    async fn send_trace(
        &self,
        request: SendTraceRequest,
    ) -> Result<SendTraceResponse, TransportError>;

    async fn update_trace(
        &self,
        request: UpdateTraceRequest,
    ) -> Result<UpdateTraceResponse, TransportError>;

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse, TransportError>;

    async fn close_trace(
        &self,
        request: CloseTraceRequest,
    ) -> Result<CloseTraceResponse, TransportError>;
}

/// [`Submitter`] that encodes each request with prost and sends it as a unary call.
#[derive(Clone)]
pub struct GatewaySubmitter {
    transport: Arc<dyn Transport>,
}

impl GatewaySubmitter {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    async fn call<Req, Resp>(&self, method: &str, request: &Req) -> Result<Resp, TransportError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let payload = Bytes::from(request.encode_to_vec());
        let response = self
            .transport
            .unary_call(SERVICE, method, payload, None)
            .await?;
        debug!(method, response_len = response.len(), "gateway call completed");
        Ok(Resp::decode(response)?)
    }
}

#[async_trait]
impl Submitter for GatewaySubmitter {
    async fn send_trace(
        &self,
        request: SendTraceRequest,
    ) -> Result<SendTraceResponse, TransportError> {
        self.call(method::SEND_TRACE, &request).await
    }

    async fn update_trace(
        &self,
        request: UpdateTraceRequest,
    ) -> Result<UpdateTraceResponse, TransportError> {
        self.call(method::UPDATE_TRACE, &request).await
    }

    async fn keep_alive(
        &self,
        request: KeepAliveRequest,
    ) -> Result<KeepAliveResponse, TransportError> {
        self.call(method::KEEP_ALIVE, &request).await
    }

    async fn close_trace(
        &self,
        request: CloseTraceRequest,
    ) -> Result<CloseTraceResponse, TransportError> {
        self.call(method::CLOSE_TRACE, &request).await
    }
}
