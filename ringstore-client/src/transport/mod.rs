//! HTTP transport to the remote store.
//!
//! One pooled `reqwest` client per adapter. Three timeouts apply to every
//! request: connection establishment (enforced by reqwest), time to first
//! byte counted from the end of the request body, and the per-chunk stall
//! limit while a body moves in either direction. Any breach drops the
//! connection and surfaces as a [`TransportError`].

pub mod body;
#[cfg(unix)]
pub mod raw;

use std::error::Error as _;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use reqwest::{Client, Method, StatusCode};
use tokio::time::{self, Instant};

use crate::health::FailureClass;
use body::{BodyFailure, BodyPhase, Progress, RequestBody};

/// Longest error body kept for diagnostics.
const MAX_ERROR_BODY: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("timed out {0}")]
    Timeout(&'static str),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    /// The request body ended early; the endpoint is not at fault.
    #[error("request body failed: {0}")]
    Body(BodyFailure),
}

impl TransportError {
    pub fn class(&self) -> FailureClass {
        match self {
            TransportError::Server { .. } => FailureClass::ServerError,
            TransportError::Body(_) => FailureClass::ClientError,
            _ => FailureClass::Transport,
        }
    }
}

/// Render an error with its source chain; reqwest's top-level message alone
/// rarely says what happened.
pub(crate) fn error_chain(err: &dyn std::error::Error) -> String {
    let mut msg = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        msg.push_str(": ");
        msg.push_str(&cause.to_string());
        source = cause.source();
    }
    msg
}

fn classify(err: reqwest::Error, progress: Option<&Progress>) -> TransportError {
    if let Some(failure) = progress.and_then(Progress::failure) {
        return TransportError::Body(failure);
    }
    if err.is_connect() {
        if err.is_timeout() {
            return TransportError::Timeout("connecting");
        }
        return TransportError::Connect(error_chain(&err));
    }
    if err.is_timeout() {
        return TransportError::Timeout("waiting for the store");
    }
    // Surface a timeout buried in the chain (e.g. an io::ErrorKind::TimedOut).
    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::TimedOut {
                return TransportError::Timeout("waiting for the store");
            }
        }
        source = cause.source();
    }
    TransportError::Io(error_chain(&err))
}

#[derive(Clone)]
pub struct Transport {
    client: Client,
    connect_timeout: Duration,
    proxy_timeout: Duration,
}

impl Transport {
    pub fn new(connect_timeout: Duration, proxy_timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .tcp_nodelay(true)
            .pool_idle_timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            connect_timeout,
            proxy_timeout,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn proxy_timeout(&self) -> Duration {
        self.proxy_timeout
    }

    /// When the in-flight request must have made progress by, and what it
    /// was doing at the time.
    fn deadline(&self, started: Instant, progress: Option<&Progress>) -> (Instant, &'static str) {
        let headers_due = started + self.connect_timeout + self.proxy_timeout;
        match progress.map(|p| (p, p.phase())) {
            None | Some((_, BodyPhase::Idle)) => (headers_due, "waiting for response headers"),
            // The writer enforces the stall limit on its own sends.
            Some((p, BodyPhase::Sending)) if p.paced_by_caller() => {
                (Instant::now() + self.proxy_timeout, "sending request body")
            }
            Some((p, BodyPhase::Sending)) => (p.last_activity() + self.proxy_timeout, "sending request body"),
            Some((p, BodyPhase::Finished)) => {
                (p.finished_at() + self.proxy_timeout, "waiting for response headers")
            }
        }
    }

    /// Send one request and wait for the response headers.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<RequestBody>,
    ) -> Result<Response, TransportError> {
        let mut request = self.client.request(method, url).headers(headers);
        let progress = body.as_ref().map(RequestBody::progress);
        if let Some(body) = body {
            request = request.body(body.body);
        }

        let started = Instant::now();
        let send = request.send();
        tokio::pin!(send);

        loop {
            let (deadline, phase) = self.deadline(started, progress.as_deref());
            tokio::select! {
                result = &mut send => {
                    return match result {
                        Ok(inner) => Ok(Response {
                            inner,
                            stall_timeout: self.proxy_timeout,
                        }),
                        Err(e) => Err(classify(e, progress.as_deref())),
                    };
                }
                _ = time::sleep_until(deadline) => {
                    // Progress may have moved the deadline while we slept.
                    let (current, _) = self.deadline(started, progress.as_deref());
                    if current <= Instant::now() {
                        return Err(TransportError::Timeout(phase));
                    }
                }
            }
        }
    }
}

/// Response whose body is read with the per-chunk stall limit.
pub struct Response {
    inner: reqwest::Response,
    stall_timeout: Duration,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.inner.status()
    }

    pub fn headers(&self) -> &HeaderMap {
        self.inner.headers()
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    pub async fn chunk(&mut self) -> Result<Option<Bytes>, TransportError> {
        match time::timeout(self.stall_timeout, self.inner.chunk()).await {
            Ok(Ok(chunk)) => Ok(chunk),
            Ok(Err(e)) => Err(classify(e, None)),
            Err(_) => Err(TransportError::Timeout("receiving response body")),
        }
    }

    /// Read and discard the rest of the body.
    pub async fn drain(&mut self) -> Result<u64, TransportError> {
        let mut total = 0u64;
        while let Some(chunk) = self.chunk().await? {
            total += chunk.len() as u64;
        }
        Ok(total)
    }

    /// Best-effort, truncated error body for diagnostics.
    pub async fn error_text(mut self) -> String {
        let mut text = Vec::new();
        while text.len() < MAX_ERROR_BODY {
            match self.chunk().await {
                Ok(Some(chunk)) => text.extend_from_slice(&chunk),
                _ => break,
            }
        }
        text.truncate(MAX_ERROR_BODY);
        String::from_utf8_lossy(&text).trim().to_string()
    }
}
