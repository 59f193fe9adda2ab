//! The object backend: addressing, endpoint selection and failover.
//!
//! Every call derives the storage key from the identity, then walks the
//! tracker's candidate list: healthy endpoints first, blacklisted ones last.
//! Only transport failures move on to the next endpoint; store answers such
//! as 404 are final.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, RANGE};
use reqwest::Method;
use ringstore_common::metadata::{declared_length, decode_metadata, encode_metadata};
use ringstore_common::{
    ByteRange, Endpoint, Metadata, ObjectBackend, ObjectIdentity, ObjectRead, ObjectSource,
    StorageKey, StoreError,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, ClientSettings};
use crate::health::{EndpointStatus, HealthTracker};
use crate::monitor::{self, HealthMonitor, ProbeError};
use crate::reader::ObjectReader;
use crate::transport::body::{BodyFailure, RequestBody, SharedSource, UploadSource};
use crate::transport::{Response, Transport, TransportError};
use crate::writer::ObjectWriter;

#[cfg(unix)]
use crate::bridge::{self, Transfer, TransferError};
#[cfg(unix)]
use crate::transport::raw;
#[cfg(unix)]
use std::os::fd::AsFd;

const UPDATE_COMMAND_HEADER: &str = "x-scal-cmd";
const UPDATE_USER_METADATA: &str = "update-usermd";

/// Outcome of one endpoint attempt, as seen by the failover loop.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// The endpoint failed; try the next candidate.
    Retry(TransportError),
    /// The endpoint failed after the call became unrepeatable.
    Abandon(TransportError),
    /// The upload source can't be replayed for another attempt.
    CannotRetry(String),
    /// A definitive answer: stop and return it.
    Final(StoreError),
}

impl From<StoreError> for AttemptError {
    fn from(e: StoreError) -> Self {
        AttemptError::Final(e)
    }
}

/// Map a non-2xx status to an attempt outcome.
fn status_failure(code: u16, key: &StorageKey, body: String) -> AttemptError {
    match code {
        404 => AttemptError::Final(StoreError::NotFound { key: *key }),
        416 => AttemptError::Final(StoreError::RangeNotSatisfiable { key: *key }),
        400..=499 => AttemptError::Final(StoreError::InvalidRequest(format!(
            "{key}: store rejected the request with {code}: {body}"
        ))),
        _ => AttemptError::Retry(TransportError::Server { status: code, body }),
    }
}

pub(crate) async fn check_status(response: Response, key: &StorageKey) -> Result<Response, AttemptError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let code = status.as_u16();
    let body = match code {
        404 | 416 => String::new(),
        _ => response.error_text().await,
    };
    Err(status_failure(code, key, body))
}

pub(crate) fn body_failure(key: &StorageKey, failure: &BodyFailure) -> StoreError {
    match failure {
        BodyFailure::LengthMismatch { .. } => StoreError::IntegrityFailure(format!("{key}: {failure}")),
        BodyFailure::Source(_) | BodyFailure::Cancelled => StoreError::Aborted(format!("{key}: {failure}")),
    }
}

pub(crate) fn metadata_headers(metadata: &Metadata) -> Result<HeaderMap, StoreError> {
    let mut headers = HeaderMap::new();
    for (name, value) in encode_metadata(metadata)? {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| StoreError::InvalidRequest(format!("metadata header {name}: {e}")))?;
        let value = HeaderValue::from_str(&value)
            .map_err(|e| StoreError::InvalidRequest(format!("metadata value for {name}: {e}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Headers for an upload: metadata plus `Content-Length` when declared.
fn upload_headers(metadata: &Metadata) -> Result<(HeaderMap, Option<u64>), StoreError> {
    let mut headers = metadata_headers(metadata)?;
    let expected_len = declared_length(metadata)?;
    if let Some(len) = expected_len {
        headers.insert(CONTENT_LENGTH, HeaderValue::from(len));
    }
    Ok((headers, expected_len))
}

fn response_metadata<'a, I>(key: &StorageKey, headers: I) -> Result<(Metadata, Option<u64>), StoreError>
where
    I: IntoIterator<Item = (&'a str, &'a [u8])>,
{
    let metadata = decode_metadata(headers)?;
    let declared = declared_length(&metadata).map_err(|_| {
        StoreError::IntegrityFailure(format!("{key}: stored Content-Length is not a number"))
    })?;
    Ok((metadata, declared))
}

/// How many body bytes a GET must deliver. A full (200) response is checked
/// against the length recorded at upload time.
fn expected_body_len(
    key: &StorageKey,
    status: u16,
    declared: Option<u64>,
    content_length: Option<u64>,
) -> Result<Option<u64>, StoreError> {
    if status != 200 {
        return Ok(content_length);
    }
    if let (Some(declared), Some(actual)) = (declared, content_length) {
        if declared != actual {
            return Err(StoreError::IntegrityFailure(format!(
                "{key}: metadata declares {declared} bytes but the store returned {actual}"
            )));
        }
    }
    Ok(declared.or(content_length))
}

fn range_header(range: Option<&ByteRange>) -> Result<HeaderMap, StoreError> {
    let mut headers = HeaderMap::new();
    if let Some(range) = range {
        let value = HeaderValue::from_str(&range.header_value())
            .map_err(|e| StoreError::InvalidRequest(format!("range {range}: {e}")))?;
        headers.insert(RANGE, value);
    }
    Ok(headers)
}

pub struct RingAdapter {
    tracker: Arc<HealthTracker>,
    transport: Transport,
    settings: ClientSettings,
    #[cfg(unix)]
    bridge: Arc<dyn Transfer>,
    monitor: Option<HealthMonitor>,
}

impl RingAdapter {
    pub fn new(endpoints: Vec<Endpoint>, settings: ClientSettings) -> anyhow::Result<Self> {
        let tracker = Arc::new(HealthTracker::new(endpoints, settings.blacklist_duration));
        Self::with_tracker(tracker, settings)
    }

    /// Build around an existing health table, e.g. one shared with other
    /// adapters or inspected by tests.
    pub fn with_tracker(tracker: Arc<HealthTracker>, settings: ClientSettings) -> anyhow::Result<Self> {
        if tracker.is_empty() {
            anyhow::bail!("at least one endpoint is required");
        }
        let transport = Transport::new(settings.connect_timeout, settings.proxy_timeout)
            .map_err(|e| anyhow::anyhow!("Failed to build HTTP client: {}", e))?;

        let monitor = match (settings.health_check_interval, tokio::runtime::Handle::try_current()) {
            (Some(interval), Ok(_)) => Some(HealthMonitor::spawn(
                Arc::clone(&tracker),
                transport.client().clone(),
                interval,
            )),
            (Some(_), Err(_)) => {
                warn!("Health checks need a tokio runtime; not starting them");
                None
            }
            (None, _) => None,
        };

        info!(
            endpoints = tracker.len(),
            max_attempts = settings.max_attempts,
            zero_copy = settings.zero_copy,
            health_checks = monitor.is_some(),
            "Ring adapter ready"
        );

        Ok(Self {
            #[cfg(unix)]
            bridge: bridge::select(settings.zero_copy),
            tracker,
            transport,
            settings,
            monitor,
        })
    }

    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        Self::new(config.parsed_endpoints()?, config.settings())
    }

    pub fn tracker(&self) -> &Arc<HealthTracker> {
        &self.tracker
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn health(&self) -> Vec<EndpointStatus> {
        self.tracker.snapshot()
    }

    /// Stop background health checks, if running.
    pub fn stop_health_monitor(&mut self) {
        if let Some(mut monitor) = self.monitor.take() {
            monitor.shutdown();
        }
    }

    /// Probe every endpoint's configuration once, in configuration order.
    pub async fn probe_endpoints(&self) -> Vec<(Endpoint, Result<(), ProbeError>)> {
        let probes = self.tracker.endpoints().map(|endpoint| async move {
            (endpoint.clone(), monitor::probe(self.transport.client(), endpoint).await)
        });
        futures::future::join_all(probes).await
    }

    /// Run `attempt` against up to `max_attempts` distinct candidates.
    async fn with_failover<T, F, Fut>(
        &self,
        op: &'static str,
        key: &StorageKey,
        mut attempt: F,
    ) -> Result<T, StoreError>
    where
        F: FnMut(usize, Endpoint) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let candidates = self.tracker.candidates();
        let limit = self.settings.max_attempts.min(candidates.len());
        let mut last_error = String::from("no endpoint attempted");
        let mut attempts = 0;

        for endpoint in candidates.into_iter().take(limit) {
            debug!(op, key = %key, endpoint = %endpoint, attempt = attempts + 1, "Dispatching");
            let outcome = attempt(attempts, endpoint.clone()).await;
            attempts += 1;
            match outcome {
                Ok(value) => {
                    self.tracker.report_success(&endpoint);
                    return Ok(value);
                }
                Err(AttemptError::Final(e)) => {
                    debug!(op, key = %key, endpoint = %endpoint, error = %e, "Final answer");
                    return Err(e);
                }
                Err(AttemptError::Retry(e)) => {
                    warn!(op, key = %key, endpoint = %endpoint, error = %e, "Attempt failed");
                    self.tracker.report_failure(&endpoint, e.class());
                    last_error = format!("{endpoint}: {e}");
                }
                Err(AttemptError::Abandon(e)) => {
                    warn!(op, key = %key, endpoint = %endpoint, error = %e, "Attempt failed, not retrying");
                    self.tracker.report_failure(&endpoint, e.class());
                    return Err(StoreError::BackendUnavailable {
                        attempts,
                        last_error: format!("{endpoint}: {e}"),
                    });
                }
                Err(AttemptError::CannotRetry(reason)) => {
                    return Err(StoreError::BackendUnavailable {
                        attempts: attempts - 1,
                        last_error: format!("{last_error}; {reason}"),
                    });
                }
            }
        }

        Err(StoreError::BackendUnavailable { attempts, last_error })
    }

    /// Open a streaming reader. Same as [`ObjectBackend::open_for_read`],
    /// without boxing.
    pub async fn open_reader(
        &self,
        identity: &ObjectIdentity,
        range: Option<ByteRange>,
    ) -> Result<ObjectReader, StoreError> {
        let key = identity.storage_key();
        let headers = range_header(range.as_ref())?;

        self.with_failover("read", &key, |_, endpoint| {
            let headers = headers.clone();
            async move {
                let url = endpoint.object_url(&key);
                let response = self
                    .transport
                    .execute(Method::GET, &url, headers, None)
                    .await
                    .map_err(AttemptError::Retry)?;
                let response = check_status(response, &key).await?;
                let status = response.status().as_u16();
                if status != 200 && status != 206 {
                    return Err(AttemptError::Retry(TransportError::Server {
                        status,
                        body: "unexpected status for GET".into(),
                    }));
                }
                let (metadata, declared) = response_metadata(
                    &key,
                    response.headers().iter().map(|(n, v)| (n.as_str(), v.as_bytes())),
                )?;
                let expected_len = expected_body_len(&key, status, declared, response.content_length())?;
                Ok(ObjectReader::new(
                    response,
                    key,
                    endpoint,
                    Arc::clone(&self.tracker),
                    metadata,
                    expected_len,
                ))
            }
        })
        .await
    }

    /// Push-mode upload. The writer is bound to the first candidate
    /// endpoint; a pushed stream can't be replayed elsewhere.
    pub fn create_writer(
        &self,
        identity: &ObjectIdentity,
        metadata: &Metadata,
    ) -> Result<ObjectWriter, StoreError> {
        let key = identity.storage_key();
        let (headers, expected_len) = upload_headers(metadata)?;
        let endpoint = self.tracker.candidates().into_iter().next().ok_or_else(|| {
            StoreError::BackendUnavailable {
                attempts: 0,
                last_error: "no endpoints configured".into(),
            }
        })?;
        debug!(key = %key, endpoint = %endpoint, "Opening writer");
        Ok(ObjectWriter::new(
            key,
            endpoint,
            Arc::clone(&self.tracker),
            self.transport.clone(),
            headers,
            expected_len,
        ))
    }

    /// Copy an object (or a range of it) into `dst`.
    ///
    /// Plain-HTTP endpoints hand the socket to the transfer strategy chosen
    /// at startup, so with zero-copy enabled the body never passes through
    /// user space. Once any byte has reached `dst` the call is no longer
    /// retried. Returns `dst` and the number of bytes written.
    #[cfg(unix)]
    pub async fn read_into<D>(
        &self,
        identity: &ObjectIdentity,
        range: Option<ByteRange>,
        dst: D,
    ) -> Result<(D, u64), StoreError>
    where
        D: std::io::Write + AsFd + Send + 'static,
    {
        let key = identity.storage_key();
        let slot = Arc::new(std::sync::Mutex::new(Some(dst)));

        let result = self
            .with_failover("read_into", &key, |_, endpoint| {
                let slot = Arc::clone(&slot);
                async move {
                    let taken = slot.lock().unwrap_or_else(|e| e.into_inner()).take();
                    let Some(mut dst) = taken else {
                        return Err(StoreError::Aborted(format!("{key}: destination lost")).into());
                    };
                    if !endpoint.is_plain_http() {
                        let outcome = self.stream_into(&endpoint, &key, range.as_ref(), &mut dst).await;
                        *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(dst);
                        return outcome;
                    }

                    let bridge = Arc::clone(&self.bridge);
                    let connect_timeout = self.settings.connect_timeout;
                    let proxy_timeout = self.settings.proxy_timeout;
                    let raw_endpoint = endpoint.clone();
                    let joined = tokio::task::spawn_blocking(move || {
                        let outcome = raw_read_into(
                            &raw_endpoint,
                            &key,
                            range.as_ref(),
                            connect_timeout,
                            proxy_timeout,
                            bridge.as_ref(),
                            &mut dst,
                        );
                        (dst, outcome)
                    })
                    .await;
                    match joined {
                        Ok((mut dst, Ok(None))) => {
                            debug!(key = %key, endpoint = %endpoint, "Chunked response, streaming instead");
                            let outcome = self.stream_into(&endpoint, &key, range.as_ref(), &mut dst).await;
                            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(dst);
                            outcome
                        }
                        Ok((dst, outcome)) => {
                            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(dst);
                            outcome.map(|written| written.unwrap_or_default())
                        }
                        Err(e) => {
                            error!(key = %key, error = %e, "Transfer task failed");
                            Err(StoreError::Aborted(format!("{key}: transfer task failed: {e}")).into())
                        }
                    }
                }
            })
            .await;

        let written = result?;
        let dst = slot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| StoreError::Aborted(format!("{key}: destination lost")))?;
        Ok((dst, written))
    }

    /// Descriptor read for endpoints the raw path can't serve (TLS).
    #[cfg(unix)]
    async fn stream_into<D: std::io::Write>(
        &self,
        endpoint: &Endpoint,
        key: &StorageKey,
        range: Option<&ByteRange>,
        dst: &mut D,
    ) -> Result<u64, AttemptError> {
        let response = self
            .transport
            .execute(Method::GET, &endpoint.object_url(key), range_header(range)?, None)
            .await
            .map_err(AttemptError::Retry)?;
        let mut response = check_status(response, key).await?;
        let status = response.status().as_u16();
        let (_, declared) = response_metadata(
            key,
            response.headers().iter().map(|(n, v)| (n.as_str(), v.as_bytes())),
        )?;
        let expected = expected_body_len(key, status, declared, response.content_length())?;

        let mut written = 0u64;
        loop {
            let chunk = match response.chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => break,
                Err(e) if written == 0 => return Err(AttemptError::Retry(e)),
                Err(e) => return Err(AttemptError::Abandon(e)),
            };
            dst.write_all(&chunk)
                .map_err(|e| StoreError::Aborted(format!("{key}: writing destination: {e}")))?;
            written += chunk.len() as u64;
        }
        check_received(key, expected, written)?;
        Ok(written)
    }
}

fn check_received(key: &StorageKey, expected: Option<u64>, received: u64) -> Result<(), StoreError> {
    match expected {
        Some(expected) if expected != received => Err(StoreError::IntegrityFailure(format!(
            "{key}: expected {expected} bytes, received {received}"
        ))),
        _ => Ok(()),
    }
}

/// One blocking GET over a raw socket, with the body moved into `dst`.
///
/// `Ok(None)` means the store answered with chunked framing and nothing was
/// written; the caller streams the object instead.
#[cfg(unix)]
fn raw_read_into<D: std::io::Write + AsFd>(
    endpoint: &Endpoint,
    key: &StorageKey,
    range: Option<&ByteRange>,
    connect_timeout: std::time::Duration,
    proxy_timeout: std::time::Duration,
    bridge: &dyn Transfer,
    dst: &mut D,
) -> Result<Option<u64>, AttemptError> {
    let mut response = raw::get(endpoint, key, range, connect_timeout, proxy_timeout)
        .map_err(AttemptError::Retry)?;
    match response.status {
        200 | 206 => {}
        code @ 200..=299 => {
            return Err(AttemptError::Retry(TransportError::Server {
                status: code,
                body: "unexpected status for GET".into(),
            }))
        }
        code => return Err(status_failure(code, key, response.error_text())),
    }
    if response.chunked {
        return Ok(None);
    }
    let (_, declared) = response_metadata(
        key,
        response.headers.iter().map(|(n, v)| (n.as_str(), v.as_bytes())),
    )?;
    let expected = expected_body_len(key, response.status, declared, response.content_length)?;

    let remaining = response.remaining();
    let buffered = std::mem::take(&mut response.buffered);
    dst.write_all(&buffered)
        .map_err(|e| StoreError::Aborted(format!("{key}: writing destination: {e}")))?;
    let already = buffered.len() as u64;

    let moved = match bridge.transfer(&mut response.socket, dst, remaining) {
        Ok(n) => n,
        Err(TransferError::Write { source, .. }) => {
            return Err(StoreError::Aborted(format!("{key}: writing destination: {source}")).into())
        }
        Err(e @ TransferError::Read { .. }) => {
            let partial = already + e.transferred() > 0;
            let err = match &e {
                TransferError::Read { source, .. } if source.kind() == std::io::ErrorKind::TimedOut => {
                    TransportError::Timeout("receiving response body")
                }
                _ => TransportError::Io(e.to_string()),
            };
            return Err(if partial {
                AttemptError::Abandon(err)
            } else {
                AttemptError::Retry(err)
            });
        }
    };
    let total = already + moved;
    check_received(key, expected, total)?;
    debug!(key = %key, endpoint = %endpoint, bytes = total, strategy = bridge.name(), "Descriptor read complete");
    Ok(Some(total))
}

#[async_trait]
impl ObjectBackend for RingAdapter {
    async fn create(
        &self,
        identity: &ObjectIdentity,
        source: Box<dyn ObjectSource>,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let key = identity.storage_key();
        let (headers, expected_len) = upload_headers(metadata)?;
        let source: SharedSource = Arc::new(Mutex::new(UploadSource::new(source)));

        self.with_failover("create", &key, |attempt, endpoint| {
            let headers = headers.clone();
            let source = Arc::clone(&source);
            async move {
                if attempt > 0 {
                    match source.lock().await.restart().await {
                        Ok(true) => {}
                        Ok(false) => {
                            return Err(AttemptError::CannotRetry(
                                "upload source cannot be rewound for a retry".into(),
                            ))
                        }
                        Err(e) => {
                            return Err(StoreError::Aborted(format!("{key}: rewinding upload source: {e}")).into())
                        }
                    }
                }

                let (pump, body) = RequestBody::from_source(Arc::clone(&source), expected_len);
                let progress = body.progress();
                debug!(key = %key, endpoint = %endpoint, "PUT sending");
                let result = self
                    .transport
                    .execute(Method::PUT, &endpoint.object_url(&key), headers, Some(body))
                    .await;
                pump.stop().await;

                if let Some(failure) = progress.failure() {
                    return Err(body_failure(&key, &failure).into());
                }
                let response = result.map_err(AttemptError::Retry)?;
                let mut response = check_status(response, &key).await?;
                // The acknowledgement body carries nothing we need.
                let _ = response.drain().await;
                debug!(key = %key, endpoint = %endpoint, bytes = progress.bytes(), "PUT committed");
                Ok(())
            }
        })
        .await
    }

    async fn open_for_read(
        &self,
        identity: &ObjectIdentity,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn ObjectRead>, StoreError> {
        Ok(Box::new(self.open_reader(identity, range).await?))
    }

    async fn head(&self, identity: &ObjectIdentity) -> Result<Metadata, StoreError> {
        let key = identity.storage_key();
        self.with_failover("head", &key, |_, endpoint| async move {
            let response = self
                .transport
                .execute(Method::HEAD, &endpoint.object_url(&key), HeaderMap::new(), None)
                .await
                .map_err(AttemptError::Retry)?;
            let response = check_status(response, &key).await?;
            let (metadata, _) = response_metadata(
                &key,
                response.headers().iter().map(|(n, v)| (n.as_str(), v.as_bytes())),
            )?;
            Ok(metadata)
        })
        .await
    }

    async fn update_metadata(
        &self,
        identity: &ObjectIdentity,
        metadata: &Metadata,
    ) -> Result<(), StoreError> {
        let key = identity.storage_key();
        let mut headers = metadata_headers(metadata)?;
        headers.insert(
            HeaderName::from_static(UPDATE_COMMAND_HEADER),
            HeaderValue::from_static(UPDATE_USER_METADATA),
        );
        headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));

        self.with_failover("update_metadata", &key, |_, endpoint| {
            let headers = headers.clone();
            async move {
                let body = RequestBody::from_bytes(Bytes::new());
                let response = self
                    .transport
                    .execute(Method::PUT, &endpoint.object_url(&key), headers, Some(body))
                    .await
                    .map_err(AttemptError::Retry)?;
                let mut response = check_status(response, &key).await?;
                let _ = response.drain().await;
                Ok(())
            }
        })
        .await
    }

    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), StoreError> {
        let key = identity.storage_key();
        self.with_failover("delete", &key, |_, endpoint| async move {
            let response = self
                .transport
                .execute(Method::DELETE, &endpoint.object_url(&key), HeaderMap::new(), None)
                .await
                .map_err(AttemptError::Retry)?;
            match check_status(response, &key).await {
                Ok(mut response) => {
                    let _ = response.drain().await;
                    Ok(())
                }
                Err(AttemptError::Final(StoreError::NotFound { .. })) => {
                    debug!(key = %key, "Delete of a missing object");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn exists(&self, identity: &ObjectIdentity) -> Result<bool, StoreError> {
        match self.head(identity).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}
