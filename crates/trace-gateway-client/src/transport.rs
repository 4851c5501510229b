// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! gRPC transport for the trace gateway.
//!
//! A [`GrpcTransport`] owns at most one live HTTP/2 cleartext connection to the gateway. The
//! connection is established on the first call and every later call multiplexes a new
//! HTTP/2 stream over it. Once that connection closes, the next call dials a replacement.
//! Messages use the standard gRPC length-prefixed framing and the call outcome is read from
//! the `grpc-status` trailer.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::client::conn::http2::{self, SendRequest};
use hyper::header::{HeaderName, HeaderValue, CONTENT_TYPE, TE};
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use percent_encoding::percent_decode_str;
use futures_core::Stream;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{ClientConfig, ConnectionKeepAlive};
use crate::error::TransportError;

/// Header carrying the API key on every call.
pub const API_KEY_HEADER: &str = "x-api-key";

const GRPC_CONTENT_TYPE: &str = "application/grpc";
const GRPC_STATUS_HEADER: &str = "grpc-status";
const GRPC_MESSAGE_HEADER: &str = "grpc-message";
const GRPC_TIMEOUT_HEADER: &str = "grpc-timeout";
const FRAME_HEADER_LEN: usize = 5;
const STREAM_CHANNEL_BUFFER_SIZE: usize = 16;

/// Per-call metadata sent as HTTP/2 headers. Keys are stored lowercase.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metadata {
    entries: Vec<(String, String)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value, replacing any previous value for the same key.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into().to_ascii_lowercase();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Issues logical remote calls against the gateway.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends one request message and resolves with the single response message.
    async fn unary_call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
        metadata: Option<Metadata>,
    ) -> Result<Bytes, TransportError>;

    /// Opens a fresh server stream. Chunks are produced in arrival order.
    async fn server_streaming_call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<ResponseStream, TransportError>;

    async fn client_streaming_call(
        &self,
        _service: &str,
        _method: &str,
    ) -> Result<Bytes, TransportError> {
        Err(TransportError::NotImplemented("client streaming"))
    }

    async fn bidirectional_streaming_call(
        &self,
        _service: &str,
        _method: &str,
    ) -> Result<ResponseStream, TransportError> {
        Err(TransportError::NotImplemented("bidirectional streaming"))
    }
}

/// Messages received on a server-streaming call.
///
/// Read with [`ResponseStream::message`] or through its [`Stream`] impl. Cancelling (or
/// dropping) the stream stops the reader task, which resets the underlying HTTP/2 stream.
/// The connection itself stays open for other calls.
#[derive(Debug)]
pub struct ResponseStream {
    rx: mpsc::Receiver<Result<Bytes, TransportError>>,
    cancel: CancellationToken,
}

impl ResponseStream {
    fn new(rx: mpsc::Receiver<Result<Bytes, TransportError>>, cancel: CancellationToken) -> Self {
        Self { rx, cancel }
    }

    /// Next message, or `None` once the stream completed, failed, or was cancelled.
    /// A failure is yielded once as `Some(Err(_))` before the stream ends.
    pub async fn message(&mut self) -> Option<Result<Bytes, TransportError>> {
        if self.cancel.is_cancelled() {
            return None;
        }
        self.rx.recv().await
    }

    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.rx.close();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Stream for ResponseStream {
    type Item = Result<Bytes, TransportError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.cancel.is_cancelled() {
            return Poll::Ready(None);
        }
        self.rx.poll_recv(cx)
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// [`Transport`] speaking gRPC over a single HTTP/2 cleartext connection, re-dialled when it
/// closes.
pub struct GrpcTransport {
    endpoint: String,
    base_uri: String,
    api_key: Option<HeaderValue>,
    request_timeout: Duration,
    keep_alive: ConnectionKeepAlive,
    connection: Mutex<Option<SendRequest<Full<Bytes>>>>,
}

impl std::fmt::Debug for GrpcTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrpcTransport")
            .field("endpoint", &self.endpoint)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("request_timeout", &self.request_timeout)
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl GrpcTransport {
    /// Builds the transport without connecting; the connection is opened by the first call.
    pub fn new(config: &ClientConfig) -> Result<Self, TransportError> {
        let api_key = config
            .api_key
            .as_deref()
            .map(|key| {
                let mut value = HeaderValue::from_str(key).map_err(|_| {
                    TransportError::InvalidMetadata("API key is not a valid header value".into())
                })?;
                value.set_sensitive(true);
                Ok::<_, TransportError>(value)
            })
            .transpose()?;

        Ok(Self {
            endpoint: config.endpoint.trim().to_string(),
            base_uri: config.base_uri(),
            api_key,
            request_timeout: config.request_timeout,
            keep_alive: config.connection_keep_alive,
            connection: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// False while a connection is being opened.
    pub fn is_connected(&self) -> bool {
        self.connection
            .try_lock()
            .is_ok_and(|slot| slot.as_ref().is_some_and(|sender| !sender.is_closed()))
    }

    async fn connect(&self) -> Result<SendRequest<Full<Bytes>>, TransportError> {
        debug!(endpoint = %self.endpoint, "Opening gateway connection");
        let stream = TcpStream::connect(&self.endpoint).await.map_err(|e| {
            TransportError::Unavailable(format!("failed to connect to {}: {e}", self.endpoint))
        })?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Unable to set TCP_NODELAY on gateway connection: {e}");
        }

        let mut builder = http2::Builder::new(TokioExecutor::new());
        builder
            .timer(TokioTimer::new())
            .keep_alive_interval(self.keep_alive.interval)
            .keep_alive_timeout(self.keep_alive.timeout)
            .keep_alive_while_idle(self.keep_alive.while_idle);
        let (sender, connection) = builder
            .handshake(TokioIo::new(stream))
            .await
            .map_err(|e| TransportError::Unavailable(format!("HTTP/2 handshake failed: {e}")))?;

        let endpoint = self.endpoint.clone();
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(endpoint = %endpoint, "Gateway connection closed with error: {e}");
            } else {
                debug!(endpoint = %endpoint, "Gateway connection closed");
            }
        });
        Ok(sender)
    }

    /// Returns a handle on the shared connection, opening it on first use and replacing it
    /// once it has closed. The lock is held while dialling so concurrent callers share the
    /// new connection.
    async fn sender(&self) -> Result<SendRequest<Full<Bytes>>, TransportError> {
        let mut slot = self.connection.lock().await;
        let live = slot
            .as_ref()
            .filter(|sender| !sender.is_closed())
            .cloned();
        let mut sender = match live {
            Some(sender) => sender,
            None => {
                if slot.take().is_some() {
                    debug!(endpoint = %self.endpoint, "Gateway connection closed, reconnecting");
                }
                let sender = self.connect().await?;
                *slot = Some(sender.clone());
                sender
            }
        };
        drop(slot);

        if let Err(e) = sender.ready().await {
            self.forget_closed().await;
            return Err(TransportError::Unavailable(e.to_string()));
        }
        Ok(sender)
    }

    /// Drops the cached connection if it has closed, so the next call dials again.
    async fn forget_closed(&self) {
        let mut slot = self.connection.lock().await;
        if slot.as_ref().is_some_and(|sender| sender.is_closed()) {
            *slot = None;
        }
    }

    fn build_request(
        &self,
        service: &str,
        method: &str,
        payload: &[u8],
        metadata: Option<&Metadata>,
        deadline: Option<Duration>,
    ) -> Result<Request<Full<Bytes>>, TransportError> {
        let uri = format!("{}/{service}/{method}", self.base_uri);
        let mut request = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .body(Full::new(encode_frame(payload)))
            .map_err(|e| TransportError::InvalidMetadata(e.to_string()))?;

        let headers = request.headers_mut();
        if let Some(metadata) = metadata {
            for (key, value) in metadata.iter() {
                let name = HeaderName::from_bytes(key.as_bytes())
                    .map_err(|_| TransportError::InvalidMetadata(format!("invalid key '{key}'")))?;
                let value = HeaderValue::from_str(value).map_err(|_| {
                    TransportError::InvalidMetadata(format!("invalid value for '{key}'"))
                })?;
                headers.insert(name, value);
            }
        }
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(GRPC_CONTENT_TYPE));
        headers.insert(TE, HeaderValue::from_static("trailers"));
        if let Some(deadline) = deadline {
            let value = HeaderValue::from_str(&encode_grpc_timeout(deadline))
                .map_err(|e| TransportError::InvalidMetadata(e.to_string()))?;
            headers.insert(GRPC_TIMEOUT_HEADER, value);
        }
        if let Some(api_key) = &self.api_key {
            headers.insert(API_KEY_HEADER, api_key.clone());
        }

        debug!(
            service,
            method,
            payload_len = payload.len(),
            headers = ?redact_headers(request.headers()),
            "gateway call"
        );
        Ok(request)
    }

    async fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> Result<Response<Incoming>, TransportError> {
        let mut sender = self.sender().await?;
        match sender.send_request(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                self.forget_closed().await;
                Err(TransportError::Unavailable(e.to_string()))
            }
        }
    }

    async fn exchange(&self, request: Request<Full<Bytes>>) -> Result<Bytes, TransportError> {
        let response = self.send(request).await?;
        let (parts, mut body) = response.into_parts();
        check_http_status(parts.status)?;

        // Trailers-only response: the status travels in the headers and there is no body.
        if let Some(result) = grpc_status(&parts.headers) {
            result?;
            return Err(TransportError::EmptyResponse);
        }

        let mut decoder = FrameDecoder::default();
        let mut message = None;
        let mut trailers = None;
        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(|e| TransportError::Unavailable(e.to_string()))?;
            match frame.into_data() {
                Ok(data) => {
                    decoder.push(&data);
                    while let Some(decoded) = decoder.next_message()? {
                        message.get_or_insert(decoded);
                    }
                }
                Err(frame) => {
                    if let Ok(map) = frame.into_trailers() {
                        trailers = Some(map);
                    }
                }
            }
        }
        decoder.finish()?;

        match trailers.as_ref().and_then(grpc_status) {
            Some(result) => result?,
            None => {
                return Err(TransportError::Protocol(
                    "response ended without grpc-status".to_string(),
                ))
            }
        }
        // A zero-length frame is a valid message (all fields default); only a missing frame
        // counts as an empty response.
        message.ok_or(TransportError::EmptyResponse)
    }
}

#[async_trait]
impl Transport for GrpcTransport {
    async fn unary_call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
        metadata: Option<Metadata>,
    ) -> Result<Bytes, TransportError> {
        let request = self.build_request(
            service,
            method,
            &payload,
            metadata.as_ref(),
            Some(self.request_timeout),
        )?;
        tokio::time::timeout(self.request_timeout, self.exchange(request))
            .await
            .map_err(|_| TransportError::DeadlineExceeded(self.request_timeout))?
    }

    async fn server_streaming_call(
        &self,
        service: &str,
        method: &str,
        payload: Bytes,
    ) -> Result<ResponseStream, TransportError> {
        let request = self.build_request(service, method, &payload, None, None)?;
        let response = tokio::time::timeout(self.request_timeout, self.send(request))
            .await
            .map_err(|_| TransportError::DeadlineExceeded(self.request_timeout))??;

        let (parts, body) = response.into_parts();
        check_http_status(parts.status)?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_BUFFER_SIZE);
        let cancel = CancellationToken::new();
        if let Some(result) = grpc_status(&parts.headers) {
            // Trailers-only: the stream is already complete.
            if let Err(e) = result {
                let _ = tx.send(Err(e)).await;
            }
            return Ok(ResponseStream::new(rx, cancel));
        }

        tokio::spawn(pump_stream(body, tx, cancel.clone()));
        Ok(ResponseStream::new(rx, cancel))
    }
}

/// Reads a server stream until it completes, fails, or `cancel` fires. Returning drops the
/// body, which resets the HTTP/2 stream.
async fn pump_stream(
    mut body: Incoming,
    tx: mpsc::Sender<Result<Bytes, TransportError>>,
    cancel: CancellationToken,
) {
    let mut decoder = FrameDecoder::default();
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!("server stream cancelled");
                return;
            }
            frame = body.frame() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(e)) => {
                forward(&tx, &cancel, Err(TransportError::Unavailable(e.to_string()))).await;
                return;
            }
            None => {
                let err = TransportError::Protocol("stream ended without grpc-status".into());
                forward(&tx, &cancel, Err(err)).await;
                return;
            }
        };

        match frame.into_data() {
            Ok(data) => {
                decoder.push(&data);
                loop {
                    match decoder.next_message() {
                        Ok(Some(message)) => {
                            if !forward(&tx, &cancel, Ok(message)).await {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            forward(&tx, &cancel, Err(e)).await;
                            return;
                        }
                    }
                }
            }
            Err(frame) => {
                if let Ok(trailers) = frame.into_trailers() {
                    let outcome = match grpc_status(&trailers) {
                        Some(result) => result.and_then(|_| decoder.finish()),
                        None => Err(TransportError::Protocol(
                            "stream ended without grpc-status".into(),
                        )),
                    };
                    if let Err(e) = outcome {
                        forward(&tx, &cancel, Err(e)).await;
                    }
                    return;
                }
            }
        }
    }
}

/// Returns false when the consumer is gone or the stream was cancelled.
async fn forward(
    tx: &mpsc::Sender<Result<Bytes, TransportError>>,
    cancel: &CancellationToken,
    item: Result<Bytes, TransportError>,
) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Prefixes `payload` with the gRPC frame header (uncompressed flag + big-endian length).
pub(crate) fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u8(0);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Incremental decoder for length-prefixed gRPC messages split across data frames.
#[derive(Debug, Default)]
pub(crate) struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub(crate) fn next_message(&mut self) -> Result<Option<Bytes>, TransportError> {
        if self.buf.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }
        if self.buf[0] != 0 {
            return Err(TransportError::Protocol(
                "compressed messages are not supported".to_string(),
            ));
        }
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if self.buf.len() < FRAME_HEADER_LEN + len {
            return Ok(None);
        }
        self.buf.advance(FRAME_HEADER_LEN);
        Ok(Some(self.buf.split_to(len).freeze()))
    }

    /// Fails if a partial frame is left over once the body ended.
    pub(crate) fn finish(&self) -> Result<(), TransportError> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            Err(TransportError::Protocol(format!(
                "response ended with {} bytes of a truncated message",
                self.buf.len()
            )))
        }
    }
}

fn check_http_status(status: StatusCode) -> Result<(), TransportError> {
    match status {
        StatusCode::OK => Ok(()),
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            Err(TransportError::Unavailable(format!("HTTP status {status}")))
        }
        other => Err(TransportError::Protocol(format!(
            "unexpected HTTP status {other}"
        ))),
    }
}

/// `None` when the map carries no `grpc-status`.
fn grpc_status(headers: &HeaderMap) -> Option<Result<(), TransportError>> {
    let raw = headers.get(GRPC_STATUS_HEADER)?;
    let code = match raw.to_str().ok().and_then(|v| v.trim().parse::<u16>().ok()) {
        Some(code) => code,
        None => {
            return Some(Err(TransportError::Protocol(format!(
                "invalid grpc-status {raw:?}"
            ))))
        }
    };
    if code == 0 {
        return Some(Ok(()));
    }
    let message = headers
        .get(GRPC_MESSAGE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| percent_decode_str(v).decode_utf8_lossy().into_owned())
        .unwrap_or_default();
    Some(Err(TransportError::Status { code, message }))
}

/// Formats a deadline as a `grpc-timeout` value (at most 8 digits).
fn encode_grpc_timeout(timeout: Duration) -> String {
    let millis = timeout.as_millis();
    if millis <= 99_999_999 {
        format!("{millis}m")
    } else {
        format!("{}S", timeout.as_secs().min(99_999_999))
    }
}

/// Returns a redacted view of request headers suitable for debug logging.
fn redact_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    const SENSITIVE_HEADERS: [&str; 2] = [API_KEY_HEADER, "authorization"];

    headers
        .iter()
        .map(|(name, value)| {
            let lower = name.as_str().to_ascii_lowercase();
            let display = if SENSITIVE_HEADERS.contains(&lower.as_str()) {
                "<redacted>".to_string()
            } else {
                value
                    .to_str()
                    .map(|s| s.to_string())
                    .unwrap_or_else(|_| "<non-utf8>".to_string())
            };
            (lower, display)
        })
        .collect()
}
