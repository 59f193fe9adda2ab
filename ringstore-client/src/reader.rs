use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use ringstore_common::{Endpoint, Metadata, ObjectRead, StorageKey, StoreError};
use tracing::{debug, warn};

use crate::health::HealthTracker;
use crate::transport::Response;

/// Streaming read handle over one GET response.
///
/// The endpoint is fixed once the body starts; a transport failure
/// mid-stream is reported to the health tracker and ends the read with
/// `BackendUnavailable`.
pub struct ObjectReader {
    response: Option<Response>,
    key: StorageKey,
    endpoint: Endpoint,
    tracker: Arc<HealthTracker>,
    metadata: Metadata,
    /// Byte count the stream must add up to, when known.
    expected_len: Option<u64>,
    received: u64,
}

impl ObjectReader {
    pub(crate) fn new(
        response: Response,
        key: StorageKey,
        endpoint: Endpoint,
        tracker: Arc<HealthTracker>,
        metadata: Metadata,
        expected_len: Option<u64>,
    ) -> Self {
        Self {
            response: Some(response),
            key,
            endpoint,
            tracker,
            metadata,
            expected_len,
            received: 0,
        }
    }

    pub fn key(&self) -> &StorageKey {
        &self.key
    }

    /// Endpoint serving this read.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn bytes_read(&self) -> u64 {
        self.received
    }

    fn length_mismatch(&self) -> StoreError {
        StoreError::IntegrityFailure(format!(
            "{}: expected {} bytes, received {}",
            self.key,
            self.expected_len.unwrap_or_default(),
            self.received
        ))
    }
}

#[async_trait]
impl ObjectRead for ObjectReader {
    fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    async fn read_chunk(&mut self) -> Result<Option<Bytes>, StoreError> {
        let Some(response) = self.response.as_mut() else {
            return Ok(None);
        };
        match response.chunk().await {
            Ok(Some(chunk)) => {
                self.received += chunk.len() as u64;
                if self.expected_len.is_some_and(|expected| self.received > expected) {
                    self.response = None;
                    return Err(self.length_mismatch());
                }
                Ok(Some(chunk))
            }
            Ok(None) => {
                self.response = None;
                if self.expected_len.is_some_and(|expected| self.received != expected) {
                    return Err(self.length_mismatch());
                }
                debug!(key = %self.key, endpoint = %self.endpoint, bytes = self.received, "Read complete");
                Ok(None)
            }
            Err(e) => {
                self.response = None;
                warn!(key = %self.key, endpoint = %self.endpoint, error = %e, "Read failed mid-stream");
                self.tracker.report_failure(&self.endpoint, e.class());
                Err(StoreError::BackendUnavailable {
                    attempts: 1,
                    last_error: format!("{}: {}", self.endpoint, e),
                })
            }
        }
    }

    async fn close(&mut self) -> Result<(), StoreError> {
        while self.read_chunk().await?.is_some() {}
        Ok(())
    }

    fn abort(&mut self) {
        if self.response.take().is_some() {
            debug!(key = %self.key, bytes = self.received, "Read aborted");
        }
    }
}
