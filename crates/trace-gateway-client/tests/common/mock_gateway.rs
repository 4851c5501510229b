// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process gRPC gateway speaking HTTP/2 cleartext, for integration tests

use bytes::{BufMut, Bytes, BytesMut};
use http_body_util::BodyExt;
use hyper::body::{Body, Frame, Incoming};
use hyper::header::HeaderValue;
use hyper::{HeaderMap, Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo};
use prost::Message;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use trace_gateway_client::ClientConfig;
use trace_gateway_proto::{
    CloseTraceResponse, KeepAliveResponse, SendTraceResponse, Status, UpdateTraceResponse,
};

pub const TEST_API_KEY: &str = "test-api-key";

/// How the gateway answers one call.
#[derive(Clone, Debug)]
pub enum Reply {
    /// One message followed by an OK status
    Message(Bytes),
    /// OK status without any message
    Empty,
    /// Trailers-only error response
    Status { code: u16, message: &'static str },
    /// Never answers
    Hang,
    /// Messages spaced by `interval`, then an OK status
    Stream { messages: Vec<Bytes>, interval: Duration },
}

impl Reply {
    pub fn message<M: Message>(message: &M) -> Self {
        Reply::Message(Bytes::from(message.encode_to_vec()))
    }
}

#[derive(Clone, Debug)]
pub struct ReceivedCall {
    pub path: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    /// Message with the gRPC frame header removed
    pub payload: Bytes,
}

impl ReceivedCall {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn decode<M: Message + Default>(&self) -> M {
        M::decode(self.payload.clone()).expect("Failed to decode request payload")
    }
}

#[derive(Default)]
struct GatewayState {
    calls: Mutex<Vec<ReceivedCall>>,
    replies: Mutex<HashMap<String, VecDeque<Reply>>>,
    connections: AtomicUsize,
    served: Mutex<Vec<AbortHandle>>,
    stream_cancelled: AtomicBool,
}

impl GatewayState {
    fn next_reply(&self, method: &str, call_number: usize) -> Reply {
        let scripted = self
            .replies
            .lock()
            .unwrap()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        scripted.unwrap_or_else(|| default_reply(method, call_number))
    }
}

fn default_reply(method: &str, call_number: usize) -> Reply {
    match method {
        "SendTrace" => Reply::message(&SendTraceResponse {
            status: Some(Status::ok()),
            trace_id: format!("trace-{call_number}"),
        }),
        "UpdateTrace" => Reply::message(&UpdateTraceResponse {
            status: Some(Status::ok()),
        }),
        "KeepAlive" => Reply::message(&KeepAliveResponse { accepted: true }),
        "CloseTrace" => Reply::message(&CloseTraceResponse { accepted: true }),
        _ => Reply::Status {
            code: 12,
            message: "unknown method",
        },
    }
}

/// Response body fed frame by frame from a channel.
pub struct ChannelBody {
    rx: mpsc::Receiver<Frame<Bytes>>,
}

impl Body for ChannelBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        self.rx.poll_recv(cx).map(|frame| frame.map(Ok))
    }
}

fn grpc_frame(message: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(5 + message.len());
    buf.put_u8(0);
    buf.put_u32(message.len() as u32);
    buf.put_slice(message);
    buf.freeze()
}

fn ok_trailers() -> HeaderMap {
    let mut trailers = HeaderMap::new();
    trailers.insert("grpc-status", HeaderValue::from_static("0"));
    trailers
}

async fn handle(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
) -> Result<Response<ChannelBody>, Infallible> {
    let path = req.uri().path().to_string();
    let method = path.rsplit('/').next().unwrap_or_default().to_string();
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_str().unwrap_or("").to_string()))
        .collect();
    let body = req
        .into_body()
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .unwrap_or_default();
    let payload = if body.len() >= 5 {
        body.slice(5..)
    } else {
        Bytes::new()
    };

    let call_number = {
        let mut calls = state.calls.lock().unwrap();
        calls.push(ReceivedCall {
            path,
            method: method.clone(),
            headers,
            payload,
        });
        calls.iter().filter(|c| c.method == method).count()
    };

    let (tx, rx) = mpsc::channel(16);
    let mut response = Response::builder()
        .status(200)
        .header("content-type", "application/grpc");

    match state.next_reply(&method, call_number) {
        Reply::Message(message) => {
            let _ = tx.try_send(Frame::data(grpc_frame(&message)));
            let _ = tx.try_send(Frame::trailers(ok_trailers()));
        }
        Reply::Empty => {
            let _ = tx.try_send(Frame::trailers(ok_trailers()));
        }
        Reply::Status { code, message } => {
            response = response
                .header("grpc-status", code.to_string())
                .header("grpc-message", message.replace(' ', "%20"));
        }
        Reply::Hang => {
            tokio::time::sleep(Duration::from_secs(60)).await;
        }
        Reply::Stream { messages, interval } => {
            let state = state.clone();
            tokio::spawn(async move {
                for message in messages {
                    tokio::time::sleep(interval).await;
                    if tx.send(Frame::data(grpc_frame(&message))).await.is_err() {
                        state.stream_cancelled.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                let _ = tx.send(Frame::trailers(ok_trailers())).await;
            });
        }
    }

    Ok(response
        .body(ChannelBody { rx })
        .expect("Failed to build response"))
}

#[derive(Clone)]
pub struct MockGateway {
    pub addr: SocketAddr,
    state: Arc<GatewayState>,
}

impl MockGateway {
    /// Start a mock gateway on a random port
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind mock gateway");
        let addr = listener.local_addr().expect("Failed to get local addr");
        let state = Arc::new(GatewayState::default());
        let accept_state = state.clone();

        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => break,
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);

                let io = TokioIo::new(stream);
                let state = accept_state.clone();
                let served = tokio::spawn(async move {
                    let service = hyper::service::service_fn(move |req: Request<Incoming>| {
                        handle(req, state.clone())
                    });
                    let _ = hyper::server::conn::http2::Builder::new(TokioExecutor::new())
                        .serve_connection(io, service)
                        .await;
                });
                accept_state
                    .served
                    .lock()
                    .unwrap()
                    .push(served.abort_handle());
            }
        });

        MockGateway { addr, state }
    }

    pub fn endpoint(&self) -> String {
        self.addr.to_string()
    }

    /// Client configuration pointing at this gateway, with short intervals.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint(),
            api_key: Some(TEST_API_KEY.to_string()),
            keep_alive_interval: Duration::from_millis(100),
            max_retries: 2,
            retry_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    /// Queue a reply for the next call to `method`; unscripted calls get a successful answer.
    pub fn push_reply(&self, method: &str, reply: Reply) {
        self.state
            .replies
            .lock()
            .unwrap()
            .entry(method.to_string())
            .or_default()
            .push_back(reply);
    }

    pub fn calls(&self) -> Vec<ReceivedCall> {
        self.state.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<ReceivedCall> {
        self.calls()
            .into_iter()
            .filter(|call| call.method == method)
            .collect()
    }

    /// TCP connections accepted so far.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Tears down every open connection while the listener keeps accepting new ones.
    pub fn drop_connections(&self) {
        for served in self.state.served.lock().unwrap().drain(..) {
            served.abort();
        }
    }

    /// Whether a server stream was torn down by the client before it completed.
    pub fn stream_cancelled(&self) -> bool {
        self.state.stream_cancelled.load(Ordering::SeqCst)
    }
}
