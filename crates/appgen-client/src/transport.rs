//! Authenticated streaming transport over raw fetch-style byte streams.
//!
//! `EventSource` cannot attach an `Authorization` header, so streams are
//! opened as plain HTTP requests and decoded incrementally from the
//! response bytes. The transport performs no retries; reconnect policy
//! belongs to the subscriber layer.

use std::sync::Arc;

use futures::StreamExt as _;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::auth::TokenProvider;
use crate::errors::TransportError;
use crate::events::{StreamEvent, decode_frame};
use crate::sse::SseDecoder;

/// Bounded buffer between the reader task and the consumer.
const STREAM_BUFFER_CAPACITY: usize = 128;

/// HTTP method used to open a stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamMethod {
    Get,
    Post,
}

/// Description of a streaming request.
#[derive(Clone, Debug)]
pub struct StreamRequest {
    pub method: StreamMethod,
    pub url: String,
    /// JSON body for `Post` streams.
    pub body: Option<serde_json::Value>,
}

impl StreamRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: StreamMethod::Get,
            url: url.into(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            method: StreamMethod::Post,
            url: url.into(),
            body: Some(body),
        }
    }
}

/// Items delivered to the consumer of one streaming session, in frame order.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportItem {
    Event(StreamEvent),
    /// Clean stream end without a prior `complete` frame. Not an error at
    /// this layer; whether to reconnect is the caller's decision.
    Disconnected,
    /// Connect failure, rejected status, or mid-stream read failure.
    Failed(TransportError),
}

/// Requests cancellation of a streaming session.
///
/// Safe to call repeatedly and from any state, including before the
/// connection is established and after the session already ended.
#[derive(Clone)]
pub struct AbortHandle {
    tx: watch::Sender<bool>,
}

impl AbortHandle {
    pub(crate) fn new(tx: watch::Sender<bool>) -> Self {
        Self { tx }
    }

    pub fn abort(&self) {
        let _ = self.tx.send(true);
    }
}

#[cfg(test)]
impl AbortHandle {
    pub(crate) fn dummy() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }
}

/// Live streaming session handle.
///
/// The channel closes after a terminal item (`Disconnected`/`Failed`), on
/// abort, or once the stream ends following a `complete` frame.
pub struct StreamHandle {
    rx: mpsc::Receiver<TransportItem>,
    abort: AbortHandle,
}

impl StreamHandle {
    /// Waits for the next item; `None` once the session is over.
    pub async fn next(&mut self) -> Option<TransportItem> {
        self.rx.recv().await
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.abort.clone()
    }

    #[cfg(test)]
    pub(crate) fn from_parts(rx: mpsc::Receiver<TransportItem>, abort: AbortHandle) -> Self {
        Self { rx, abort }
    }
}

/// Opens authenticated `text/event-stream` sessions.
#[derive(Clone)]
pub struct EventStreamTransport {
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
}

impl EventStreamTransport {
    pub fn new(http: reqwest::Client, tokens: Arc<dyn TokenProvider>) -> Self {
        Self { http, tokens }
    }

    /// Starts the request and returns a handle immediately.
    ///
    /// Connection failures are delivered through the handle as
    /// `TransportItem::Failed`, never thrown, so callers hold exactly one
    /// error path for the whole session.
    pub fn open(&self, request: StreamRequest) -> StreamHandle {
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_CAPACITY);
        let (abort_tx, abort_rx) = watch::channel(false);
        let abort = AbortHandle { tx: abort_tx };
        tokio::spawn(stream_task(
            self.http.clone(),
            self.tokens.clone(),
            request,
            tx,
            abort_rx,
        ));
        StreamHandle { rx, abort }
    }
}

async fn stream_task(
    http: reqwest::Client,
    tokens: Arc<dyn TokenProvider>,
    request: StreamRequest,
    tx: mpsc::Sender<TransportItem>,
    mut abort_rx: watch::Receiver<bool>,
) {
    let mut builder = match request.method {
        StreamMethod::Get => http.get(&request.url),
        StreamMethod::Post => http.post(&request.url),
    };
    builder = builder.header(ACCEPT, "text/event-stream");
    if let Some(token) = tokens.token() {
        builder = builder.bearer_auth(token);
    }
    if let Some(body) = &request.body {
        builder = builder.json(body);
    }

    let response = tokio::select! {
        _ = aborted(&mut abort_rx) => return,
        response = builder.send() => response,
    };
    let response = match response {
        Ok(response) => response,
        Err(err) => {
            let _ = tx
                .send(TransportItem::Failed(TransportError::connect(
                    err.to_string(),
                )))
                .await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let message = response.text().await.unwrap_or_default();
        let _ = tx
            .send(TransportItem::Failed(TransportError::Http {
                status: status.as_u16(),
                message,
            }))
            .await;
        return;
    }
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.contains("text/event-stream") {
        let _ = tx
            .send(TransportItem::Failed(TransportError::ContentType {
                content_type,
            }))
            .await;
        return;
    }

    debug!(url = %request.url, "event stream open");
    let mut decoder = SseDecoder::default();
    let mut stream = response.bytes_stream();
    let mut saw_complete = false;
    loop {
        let chunk = tokio::select! {
            _ = aborted(&mut abort_rx) => return,
            chunk = stream.next() => chunk,
        };
        let chunk: bytes::Bytes = match chunk {
            Some(Ok(chunk)) => chunk,
            Some(Err(err)) => {
                let _ = tx
                    .send(TransportItem::Failed(TransportError::read(err.to_string())))
                    .await;
                return;
            }
            None => {
                if !saw_complete {
                    let _ = tx.send(TransportItem::Disconnected).await;
                }
                return;
            }
        };
        for frame in decoder.push_chunk(&chunk) {
            let Some(event) = decode_frame(&frame) else {
                continue;
            };
            if matches!(event, StreamEvent::Complete(_)) {
                saw_complete = true;
            }
            if tx.send(TransportItem::Event(event)).await.is_err() {
                return;
            }
        }
    }
}

/// Resolves once the watch flag flips true; parks forever if the sender
/// is gone without ever aborting.
pub(crate) async fn aborted(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            // Handle dropped without aborting; park forever and let the
            // other select arm drive the session to its end.
            std::future::pending::<()>().await;
        }
    }
}
