use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use reqwest::header::HeaderMap;
use reqwest::Method;
use ringstore_common::{Endpoint, ObjectWrite, StorageKey, StoreError};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, warn};

use crate::adapter::{body_failure, check_status, AttemptError};
use crate::health::HealthTracker;
use crate::transport::body::{Progress, RequestBody};
use crate::transport::{Response, Transport, TransportError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    /// Nothing sent yet; the request starts with the first write.
    Idle,
    Sending,
    /// Body complete, waiting for the store's answer.
    AwaitingAck,
    Committed,
    /// Failed or aborted. Nothing was committed.
    Failed,
}

/// Push-mode upload bound to a single endpoint.
///
/// Bytes pushed with [`ObjectWrite::write`] stream straight into one PUT.
/// The store only commits a request whose body completed, so an aborted or
/// dropped writer leaves nothing behind.
pub struct ObjectWriter {
    key: StorageKey,
    endpoint: Endpoint,
    tracker: Arc<HealthTracker>,
    transport: Transport,
    headers: HeaderMap,
    expected_len: Option<u64>,
    sender: Option<mpsc::Sender<io::Result<Bytes>>>,
    request: Option<JoinHandle<Result<Response, TransportError>>>,
    progress: Option<Arc<Progress>>,
    written: u64,
    state: WriteState,
}

impl ObjectWriter {
    pub(crate) fn new(
        key: StorageKey,
        endpoint: Endpoint,
        tracker: Arc<HealthTracker>,
        transport: Transport,
        headers: HeaderMap,
        expected_len: Option<u64>,
    ) -> Self {
        Self {
            key,
            endpoint,
            tracker,
            transport,
            headers,
            expected_len,
            sender: None,
            request: None,
            progress: None,
            written: 0,
            state: WriteState::Idle,
        }
    }

    pub fn state(&self) -> WriteState {
        self.state
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn start(&mut self) {
        let (sender, body) = RequestBody::channel(self.expected_len, true);
        self.progress = Some(body.progress());
        let transport = self.transport.clone();
        let url = self.endpoint.object_url(&self.key);
        let headers = self.headers.clone();
        self.request = Some(tokio::spawn(async move {
            transport.execute(Method::PUT, &url, headers, Some(body)).await
        }));
        self.sender = Some(sender);
        self.state = WriteState::Sending;
        debug!(key = %self.key, endpoint = %self.endpoint, "PUT sending");
    }

    fn ensure_open(&mut self) -> Result<(), StoreError> {
        match self.state {
            WriteState::Idle => {
                self.start();
                Ok(())
            }
            WriteState::Sending => Ok(()),
            state => Err(StoreError::InvalidRequest(format!(
                "{}: writer is no longer open ({state:?})",
                self.key
            ))),
        }
    }

    /// Wait for the request task and turn its result into the final outcome.
    async fn conclude(&mut self) -> Result<(), StoreError> {
        let result = match self.request.take() {
            Some(task) => match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!(key = %self.key, error = %e, "Upload task failed");
                    Err(TransportError::Io(format!("upload task failed: {e}")))
                }
            },
            None => Err(TransportError::Io("upload was never started".into())),
        };

        if let Some(failure) = self.progress.as_ref().and_then(|p| p.failure()) {
            self.state = WriteState::Failed;
            return Err(body_failure(&self.key, &failure));
        }
        let outcome = match result {
            Ok(response) => check_status(response, &self.key).await.map(|_| ()),
            Err(e) => Err(AttemptError::Retry(e)),
        };
        match outcome {
            Ok(()) => {
                self.state = WriteState::Committed;
                self.tracker.report_success(&self.endpoint);
                debug!(key = %self.key, endpoint = %self.endpoint, bytes = self.written, "PUT committed");
                Ok(())
            }
            Err(AttemptError::Final(e)) => {
                self.state = WriteState::Failed;
                Err(e)
            }
            Err(AttemptError::Retry(e) | AttemptError::Abandon(e)) => {
                self.state = WriteState::Failed;
                Err(self.endpoint_failure(e))
            }
            Err(AttemptError::CannotRetry(reason)) => {
                self.state = WriteState::Failed;
                Err(StoreError::BackendUnavailable {
                    attempts: 1,
                    last_error: reason,
                })
            }
        }
    }

    fn endpoint_failure(&self, e: TransportError) -> StoreError {
        warn!(key = %self.key, endpoint = %self.endpoint, error = %e, "Upload failed");
        self.tracker.report_failure(&self.endpoint, e.class());
        StoreError::BackendUnavailable {
            attempts: 1,
            last_error: format!("{}: {}", self.endpoint, e),
        }
    }

    fn cancel(&mut self) {
        // Cancel before the sender drops, or the body would end cleanly.
        if let Some(progress) = &self.progress {
            progress.cancel();
        }
        if let Some(task) = self.request.take() {
            task.abort();
        }
        self.sender = None;
    }
}

#[async_trait]
impl ObjectWrite for ObjectWriter {
    async fn write(&mut self, chunk: Bytes) -> Result<u64, StoreError> {
        self.ensure_open()?;
        if chunk.is_empty() {
            return Ok(self.written);
        }
        let len = chunk.len() as u64;
        let Some(sender) = self.sender.as_mut() else {
            return Err(StoreError::InvalidRequest(format!("{}: writer is closed", self.key)));
        };
        let sent = time::timeout(self.transport.proxy_timeout(), sender.send(Ok(chunk))).await;
        match sent {
            Ok(Ok(())) => {
                self.written += len;
                Ok(self.written)
            }
            // The request ended early; its result says why.
            Ok(Err(_)) => {
                self.sender = None;
                match self.conclude().await {
                    Ok(()) => Err(StoreError::IntegrityFailure(format!(
                        "{}: store acknowledged the upload before the body was complete",
                        self.key
                    ))),
                    Err(e) => Err(e),
                }
            }
            Err(_) => {
                self.cancel();
                self.state = WriteState::Failed;
                Err(self.endpoint_failure(TransportError::Timeout("sending request body")))
            }
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        if self.state == WriteState::Committed {
            return Ok(());
        }
        self.ensure_open()?;
        // Dropping the sender ends the body.
        self.sender = None;
        self.state = WriteState::AwaitingAck;
        self.conclude().await
    }

    fn abort(&mut self) {
        if matches!(self.state, WriteState::Sending | WriteState::AwaitingAck) {
            debug!(key = %self.key, bytes = self.written, "Upload aborted");
        }
        self.cancel();
        if self.state != WriteState::Committed {
            self.state = WriteState::Failed;
        }
    }
}

impl Drop for ObjectWriter {
    fn drop(&mut self) {
        if self.request.is_some() {
            self.cancel();
        }
    }
}
