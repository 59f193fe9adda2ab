//! End-to-end tests against in-process mock endpoints.
//!
//! Every mock endpoint is a small axum server fronting one shared object map,
//! the way several proxies front the same ring.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use ringstore_client::{BytesSource, ClientSettings, RingAdapter, WriteState};
use ringstore_common::{
    ByteRange, Endpoint, Metadata, ObjectBackend, ObjectIdentity, ObjectRead, ObjectSource, ObjectWrite,
    StoreError,
};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const KEY_D: &str = "35b5988f47b2d24f33bb24de2bb9d1a02778b954";

// ── Mock store ──

#[derive(Clone)]
struct StoredObject {
    body: Bytes,
    meta: Vec<(String, String)>,
}

#[derive(Clone, Default)]
struct Ring {
    objects: Arc<Mutex<HashMap<String, StoredObject>>>,
}

impl Ring {
    fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects.lock().unwrap().get(key).cloned()
    }

    fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }
}

#[derive(Clone)]
struct MockState {
    ring: Ring,
    hits: Arc<AtomicUsize>,
    forced_status: Arc<Mutex<Option<StatusCode>>>,
    chunked: Arc<AtomicBool>,
}

impl MockState {
    fn enter(&self) -> Option<Response> {
        self.hits.fetch_add(1, Ordering::SeqCst);
        (*self.forced_status.lock().unwrap()).map(|status| status.into_response())
    }
}

fn meta_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter(|(name, _)| name.as_str().starts_with("x-scal-meta-"))
        .map(|(name, value)| (name.as_str().to_string(), value.to_str().unwrap().to_string()))
        .collect()
}

fn parse_range(value: &str, len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let start: usize = start.parse().ok()?;
    let last = len.checked_sub(1)?;
    let end = if end.is_empty() {
        last
    } else {
        end.parse::<usize>().ok()?.min(last)
    };
    (start <= end).then_some((start, end))
}

async fn get_object(
    State(state): State<MockState>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Some(forced) = state.enter() {
        return forced;
    }
    let Some(object) = state.ring.get(&key) else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let mut builder = Response::builder();
    for (name, value) in &object.meta {
        builder = builder.header(name, value);
    }
    let (status, body) = match headers.get(header::RANGE) {
        Some(range) => match parse_range(range.to_str().unwrap(), object.body.len()) {
            Some((start, end)) => (StatusCode::PARTIAL_CONTENT, object.body.slice(start..=end)),
            None => return StatusCode::RANGE_NOT_SATISFIABLE.into_response(),
        },
        None => (StatusCode::OK, object.body.clone()),
    };
    let body = if state.chunked.load(Ordering::SeqCst) {
        Body::from_stream(futures::stream::iter([Ok::<_, std::io::Error>(body)]))
    } else {
        Body::from(body)
    };
    builder.status(status).body(body).unwrap()
}

async fn put_object(
    State(state): State<MockState>,
    Path(key): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if let Some(forced) = state.enter() {
        return forced;
    }
    let meta = meta_headers(&headers);
    let mut objects = state.ring.objects.lock().unwrap();
    if headers.get("x-scal-cmd").is_some_and(|cmd| cmd == "update-usermd") {
        return match objects.get_mut(&key) {
            Some(object) => {
                object.meta = meta;
                StatusCode::OK.into_response()
            }
            None => StatusCode::NOT_FOUND.into_response(),
        };
    }
    objects.insert(key, StoredObject { body, meta });
    StatusCode::OK.into_response()
}

async fn delete_object(State(state): State<MockState>, Path(key): Path<String>) -> Response {
    if let Some(forced) = state.enter() {
        return forced;
    }
    match state.ring.objects.lock().unwrap().remove(&key) {
        Some(_) => StatusCode::OK.into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn conf() -> &'static str {
    "{\n    \"by_path_enabled\": true,\n    \"by_path_cos\": 0\n}\n"
}

struct MockEndpoint {
    endpoint: Endpoint,
    hits: Arc<AtomicUsize>,
    forced_status: Arc<Mutex<Option<StatusCode>>>,
    chunked: Arc<AtomicBool>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl MockEndpoint {
    async fn start(ring: &Ring) -> Self {
        let state = MockState {
            ring: ring.clone(),
            hits: Arc::new(AtomicUsize::new(0)),
            forced_status: Arc::new(Mutex::new(None)),
            chunked: Arc::new(AtomicBool::new(false)),
        };
        let app = Router::new()
            .route("/proxy/chord/.conf", get(conf))
            .route(
                "/proxy/chord/{key}",
                get(get_object).put(put_object).delete(delete_object),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            endpoint: Endpoint::parse(&format!("http://{addr}/proxy/chord")).unwrap(),
            hits: state.hits,
            forced_status: state.forced_status,
            chunked: state.chunked,
            shutdown: Some(tx),
            task,
        }
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    fn force_status(&self, status: StatusCode) {
        *self.forced_status.lock().unwrap() = Some(status);
    }

    /// Answer GETs with chunked framing.
    fn stream_chunked(&self) {
        self.chunked.store(true, Ordering::SeqCst);
    }

    /// Stop serving; later connections are refused.
    async fn kill(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = tokio::time::timeout(Duration::from_secs(5), &mut self.task).await;
        self.task.abort();
    }
}

/// An address with nothing listening.
fn refused_endpoint() -> Endpoint {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    Endpoint::parse(&format!("http://127.0.0.1:{port}/proxy/chord")).unwrap()
}

/// Accepts connections and closes them at once, counting them.
async fn black_hole() -> (Endpoint, Arc<AtomicUsize>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&accepted);
    tokio::spawn(async move {
        while let Ok((socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            drop(socket);
        }
    });
    (
        Endpoint::parse(&format!("http://{addr}/proxy/chord")).unwrap(),
        accepted,
    )
}

/// Yields its bytes once and can't rewind.
struct OneShot(Option<Bytes>);

#[async_trait::async_trait]
impl ObjectSource for OneShot {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        Ok(self.0.take())
    }
}

/// Yields one chunk, then never finishes.
struct Stalled(Option<Bytes>);

#[async_trait::async_trait]
impl ObjectSource for Stalled {
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>> {
        match self.0.take() {
            Some(chunk) => Ok(Some(chunk)),
            None => std::future::pending().await,
        }
    }
}

fn settings(endpoints: usize) -> ClientSettings {
    ClientSettings {
        connect_timeout: Duration::from_secs(1),
        proxy_timeout: Duration::from_secs(2),
        ..ClientSettings::with_defaults(endpoints)
    }
}

fn adapter(endpoints: Vec<Endpoint>) -> RingAdapter {
    let n = endpoints.len();
    RingAdapter::new(endpoints, settings(n)).unwrap()
}

fn identity() -> ObjectIdentity {
    ObjectIdentity::new("acct1", "cont1", "obj1").unwrap()
}

fn custom_meta() -> Metadata {
    Metadata::from([("x-custom".to_string(), b"v1".to_vec())])
}

async fn read_all(reader: &mut dyn ObjectRead) -> Result<Vec<u8>, StoreError> {
    let mut out = Vec::new();
    while let Some(chunk) = reader.read_chunk().await? {
        out.extend_from_slice(&chunk);
    }
    Ok(out)
}

// ── Lifecycle ──

#[tokio::test]
async fn test_write_then_read_round_trip() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = ObjectIdentity::new("AUTH_test", "photos", "2024/cat.jpg").unwrap();
    let meta = Metadata::from([
        ("Content-Type".to_string(), b"image/jpeg".to_vec()),
        ("Unicode Key é".to_string(), "value with spaces/and:colons ✓".into()),
        ("checksum".to_string(), vec![0xde, 0xad, 0x00, 0xff]),
    ]);
    let payload: Vec<u8> = (0..300_000u32).map(|i| (i % 241) as u8).collect();

    adapter
        .create(&id, Box::new(BytesSource::new(payload.clone())), &meta)
        .await
        .unwrap();
    assert!(ring.get(&id.storage_key().to_string()).is_some());

    let mut reader = adapter.open_for_read(&id, None).await.unwrap();
    assert_eq!(reader.metadata(), &meta);
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), payload);

    assert_eq!(adapter.head(&id).await.unwrap(), meta);
    assert!(adapter.exists(&id).await.unwrap());
}

#[tokio::test]
async fn test_concrete_scenario_with_failover_read() {
    let ring = Ring::default();
    let mut ep0 = MockEndpoint::start(&ring).await;
    let ep1 = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep0.endpoint.clone(), ep1.endpoint.clone()]);
    let id = identity();
    assert_eq!(id.storage_key().to_string(), KEY_D);

    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello"[..])), &custom_meta())
        .await
        .unwrap();
    assert_eq!(ep0.hits(), 1);
    assert_eq!(ep1.hits(), 0);
    let stored = ring.get(KEY_D).unwrap();
    assert_eq!(stored.body, Bytes::from_static(b"hello"));
    assert_eq!(
        stored.meta,
        vec![("x-scal-meta-782d637573746f6d".to_string(), "v1".to_string())]
    );

    let mut reader = adapter.open_for_read(&id, None).await.unwrap();
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), b"hello");
    assert_eq!(reader.metadata().get("x-custom").map(Vec::as_slice), Some(&b"v1"[..]));

    ep0.kill().await;

    let mut reader = adapter.open_for_read(&id, None).await.unwrap();
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), b"hello");
    assert_eq!(reader.metadata().get("x-custom").map(Vec::as_slice), Some(&b"v1"[..]));
    assert_eq!(ep1.hits(), 1);
    assert!(!adapter.tracker().is_healthy(&ep0.endpoint));
}

#[tokio::test]
async fn test_delete_then_read_is_not_found() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = identity();

    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello"[..])), &Metadata::new())
        .await
        .unwrap();
    adapter.delete(&id).await.unwrap();

    let err = adapter.open_for_read(&id, None).await.err().unwrap();
    assert!(err.is_not_found(), "{err}");
    assert!(!adapter.exists(&id).await.unwrap());
    // Deleting again is fine.
    adapter.delete(&id).await.unwrap();
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let ring = Ring::default();
    let ep0 = MockEndpoint::start(&ring).await;
    let ep1 = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep0.endpoint.clone(), ep1.endpoint.clone()]);

    let err = adapter.head(&identity()).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));
    assert_eq!(ep0.hits(), 1);
    assert_eq!(ep1.hits(), 0);
    assert!(adapter.tracker().is_healthy(&ep0.endpoint));
}

#[tokio::test]
async fn test_update_metadata_replaces_metadata() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = identity();

    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello"[..])), &custom_meta())
        .await
        .unwrap();
    let updated = Metadata::from([("x-other".to_string(), b"v2".to_vec())]);
    adapter.update_metadata(&id, &updated).await.unwrap();

    assert_eq!(adapter.head(&id).await.unwrap(), updated);
    assert_eq!(ring.get(KEY_D).unwrap().body, Bytes::from_static(b"hello"));

    let missing = ObjectIdentity::new("acct1", "cont1", "missing").unwrap();
    let err = adapter.update_metadata(&missing, &updated).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_range_reads() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = identity();
    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello world"[..])), &Metadata::new())
        .await
        .unwrap();

    let mut reader = adapter
        .open_for_read(&id, Some(ByteRange::new(6, Some(10)).unwrap()))
        .await
        .unwrap();
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), b"world");

    let mut reader = adapter
        .open_for_read(&id, Some(ByteRange::new(6, None).unwrap()))
        .await
        .unwrap();
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), b"world");

    let err = adapter
        .open_for_read(&id, Some(ByteRange::new(50, None).unwrap()))
        .await
        .err()
        .unwrap();
    assert!(matches!(err, StoreError::RangeNotSatisfiable { .. }));
}

// ── Integrity ──

#[tokio::test]
async fn test_declared_length_mismatch_aborts_create() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let meta = Metadata::from([("Content-Length".to_string(), b"10".to_vec())]);

    let err = adapter
        .create(&identity(), Box::new(BytesSource::new(&b"hello"[..])), &meta)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::IntegrityFailure(_)), "{err}");
    assert_eq!(ring.len(), 0);
    assert!(adapter.tracker().is_healthy(&ep.endpoint));
}

#[tokio::test]
async fn test_stored_length_mismatch_detected_on_read() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    // "Content-Length" = 99, while the body is 5 bytes.
    ring.objects.lock().unwrap().insert(
        KEY_D.to_string(),
        StoredObject {
            body: Bytes::from_static(b"hello"),
            meta: vec![(
                "x-scal-meta-436f6e74656e742d4c656e677468".to_string(),
                "99".to_string(),
            )],
        },
    );

    let err = adapter.open_for_read(&identity(), None).await.err().unwrap();
    assert!(matches!(err, StoreError::IntegrityFailure(_)), "{err}");
}

// ── Failover and health ──

#[tokio::test]
async fn test_failover_blacklists_and_skips_failed_endpoints() {
    let ring = Ring::default();
    let (hole, accepted) = black_hole().await;
    let refused = refused_endpoint();
    let good = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![hole.clone(), refused.clone(), good.endpoint.clone()]);
    let id = identity();

    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello"[..])), &custom_meta())
        .await
        .unwrap();
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert!(!adapter.tracker().is_healthy(&hole));
    assert!(!adapter.tracker().is_healthy(&refused));
    assert!(adapter.tracker().is_healthy(&good.endpoint));
    assert_eq!(adapter.tracker().candidates()[0], good.endpoint);

    // Within the blacklist window the failed endpoints are not contacted.
    assert!(adapter.exists(&id).await.unwrap());
    let mut reader = adapter.open_for_read(&id, None).await.unwrap();
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), b"hello");
    assert_eq!(accepted.load(Ordering::SeqCst), 1);
    assert_eq!(good.hits(), 3);
}

#[tokio::test]
async fn test_failover_replays_unsent_bytes_of_one_shot_source() {
    let ring = Ring::default();
    let refused = refused_endpoint();
    let good = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![refused.clone(), good.endpoint.clone()]);

    adapter
        .create(
            &identity(),
            Box::new(OneShot(Some(Bytes::from_static(b"hello")))),
            &custom_meta(),
        )
        .await
        .unwrap();
    assert_eq!(ring.get(KEY_D).unwrap().body, Bytes::from_static(b"hello"));
    assert!(!adapter.tracker().is_healthy(&refused));
    assert_eq!(good.hits(), 1);
}

#[tokio::test]
async fn test_all_endpoints_down() {
    let adapter = adapter(vec![refused_endpoint(), refused_endpoint()]);
    let err = adapter.head(&identity()).await.unwrap_err();
    match err {
        StoreError::BackendUnavailable { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("unexpected {other}"),
    }
}

#[tokio::test]
async fn test_max_attempts_caps_failover() {
    let ring = Ring::default();
    let good = MockEndpoint::start(&ring).await;
    let endpoints = vec![refused_endpoint(), refused_endpoint(), good.endpoint.clone()];
    let settings = ClientSettings {
        max_attempts: 2,
        ..settings(3)
    };
    let adapter = RingAdapter::new(endpoints, settings).unwrap();

    let err = adapter.head(&identity()).await.unwrap_err();
    assert!(matches!(err, StoreError::BackendUnavailable { attempts: 2, .. }), "{err}");
    assert_eq!(good.hits(), 0);
}

#[tokio::test]
async fn test_server_errors_fail_over_client_errors_do_not() {
    let ring = Ring::default();
    let sick = MockEndpoint::start(&ring).await;
    let good = MockEndpoint::start(&ring).await;
    sick.force_status(StatusCode::SERVICE_UNAVAILABLE);
    let failing_over = adapter(vec![sick.endpoint.clone(), good.endpoint.clone()]);

    failing_over
        .create(&identity(), Box::new(BytesSource::new(&b"hello"[..])), &Metadata::new())
        .await
        .unwrap();
    assert!(!failing_over.tracker().is_healthy(&sick.endpoint));
    assert_eq!(good.hits(), 1);

    let ring = Ring::default();
    let picky = MockEndpoint::start(&ring).await;
    let other = MockEndpoint::start(&ring).await;
    picky.force_status(StatusCode::FORBIDDEN);
    let answered = adapter(vec![picky.endpoint.clone(), other.endpoint.clone()]);
    let err = answered.head(&identity()).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)), "{err}");
    assert!(answered.tracker().is_healthy(&picky.endpoint));
    assert_eq!(other.hits(), 0);
}

#[tokio::test]
async fn test_probe_endpoints() {
    let ring = Ring::default();
    let up = MockEndpoint::start(&ring).await;
    let down = refused_endpoint();
    let adapter = adapter(vec![up.endpoint.clone(), down.clone()]);

    let results = adapter.probe_endpoints().await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, up.endpoint);
    assert!(results[0].1.is_ok());
    assert_eq!(results[1].0, down);
    assert!(results[1].1.is_err());
}

#[tokio::test]
async fn test_cancelled_create_leaves_nothing_readable() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = identity();

    let source = Stalled(Some(Bytes::from_static(b"first part")));
    let meta = custom_meta();
    let create = adapter.create(&id, Box::new(source), &meta);
    assert!(tokio::time::timeout(Duration::from_millis(300), create).await.is_err());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(ring.len(), 0);
    assert!(!adapter.exists(&id).await.unwrap());
    assert!(adapter.tracker().is_healthy(&ep.endpoint));
}

// ── Push-mode writer ──

#[tokio::test]
async fn test_writer_commits_on_close() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = identity();

    let mut writer = adapter.create_writer(&id, &custom_meta()).unwrap();
    assert_eq!(writer.state(), WriteState::Idle);
    assert_eq!(writer.write(Bytes::from_static(b"hel")).await.unwrap(), 3);
    assert_eq!(writer.write(Bytes::from_static(b"lo")).await.unwrap(), 5);
    writer.close().await.unwrap();
    assert_eq!(writer.state(), WriteState::Committed);

    let mut reader = adapter.open_for_read(&id, None).await.unwrap();
    assert_eq!(read_all(reader.as_mut()).await.unwrap(), b"hello");
    assert_eq!(reader.metadata(), &custom_meta());
}

#[tokio::test]
async fn test_aborted_writer_leaves_nothing_readable() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let id = identity();

    let mut writer = adapter.create_writer(&id, &Metadata::new()).unwrap();
    writer.write(Bytes::from_static(b"partial")).await.unwrap();
    writer.abort();
    assert_eq!(writer.state(), WriteState::Failed);
    assert!(writer.close().await.is_err());

    let mut dropped = adapter.create_writer(&id, &Metadata::new()).unwrap();
    dropped.write(Bytes::from_static(b"partial")).await.unwrap();
    drop(dropped);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!adapter.exists(&id).await.unwrap());
    assert_eq!(ring.len(), 0);
    assert!(adapter.tracker().is_healthy(&ep.endpoint));
}

#[tokio::test]
async fn test_writer_short_body_is_not_committed() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let meta = Metadata::from([("Content-Length".to_string(), b"10".to_vec())]);

    let mut writer = adapter.create_writer(&identity(), &meta).unwrap();
    writer.write(Bytes::from_static(b"hello")).await.unwrap();
    let err = writer.close().await.unwrap_err();
    assert!(matches!(err, StoreError::IntegrityFailure(_)), "{err}");
    assert_eq!(ring.len(), 0);
}

// ── Descriptor reads ──

async fn check_read_into(zero_copy: bool) {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let settings = ClientSettings {
        zero_copy,
        ..settings(1)
    };
    let adapter = RingAdapter::new(vec![ep.endpoint.clone()], settings).unwrap();
    let id = identity();
    let payload: Vec<u8> = (0..500_000u32).map(|i| (i % 253) as u8).collect();
    let meta = Metadata::from([("Content-Length".to_string(), payload.len().to_string().into_bytes())]);
    adapter
        .create(&id, Box::new(BytesSource::new(payload.clone())), &meta)
        .await
        .unwrap();

    let (mut file, written) = adapter
        .read_into(&id, None, tempfile::tempfile().unwrap())
        .await
        .unwrap();
    assert_eq!(written, payload.len() as u64);
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    assert_eq!(out, payload);

    let range = ByteRange::new(1000, Some(1999)).unwrap();
    let (mut file, written) = adapter
        .read_into(&id, Some(range), tempfile::tempfile().unwrap())
        .await
        .unwrap();
    assert_eq!(written, 1000);
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut out = Vec::new();
    file.read_to_end(&mut out).unwrap();
    assert_eq!(out, &payload[1000..2000]);

    let missing = ObjectIdentity::new("acct1", "cont1", "missing").unwrap();
    let err = adapter
        .read_into(&missing, None, tempfile::tempfile().unwrap())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_read_into_buffered() {
    check_read_into(false).await;
}

#[tokio::test]
async fn test_read_into_zero_copy() {
    check_read_into(true).await;
}

#[tokio::test]
async fn test_read_into_streams_chunked_responses() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let settings = ClientSettings {
        zero_copy: true,
        ..settings(1)
    };
    let adapter = RingAdapter::new(vec![ep.endpoint.clone()], settings).unwrap();
    let id = identity();
    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello"[..])), &Metadata::new())
        .await
        .unwrap();
    ep.stream_chunked();

    let (mut file, written) = adapter
        .read_into(&id, None, tempfile::tempfile().unwrap())
        .await
        .unwrap();
    assert_eq!(written, 5);
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut out = String::new();
    file.read_to_string(&mut out).unwrap();
    assert_eq!(out, "hello");
    assert!(adapter.tracker().is_healthy(&ep.endpoint));
}

#[tokio::test]
async fn test_read_into_fails_over_before_first_byte() {
    let ring = Ring::default();
    let good = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![refused_endpoint(), good.endpoint.clone()]);
    let id = identity();
    adapter
        .create(&id, Box::new(BytesSource::new(&b"hello"[..])), &Metadata::new())
        .await
        .unwrap();

    let (mut file, written) = adapter
        .read_into(&id, None, tempfile::tempfile().unwrap())
        .await
        .unwrap();
    assert_eq!(written, 5);
    file.seek(SeekFrom::Start(0)).unwrap();
    let mut out = String::new();
    file.read_to_string(&mut out).unwrap();
    assert_eq!(out, "hello");
}

#[tokio::test]
async fn test_invalid_metadata_never_reaches_network() {
    let ring = Ring::default();
    let ep = MockEndpoint::start(&ring).await;
    let adapter = adapter(vec![ep.endpoint.clone()]);
    let too_many: Metadata = (0..65).map(|i| (format!("k{i}"), b"v".to_vec())).collect();

    let err = adapter
        .create(&identity(), Box::new(BytesSource::new(&b"x"[..])), &too_many)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidRequest(_)));
    assert_eq!(ep.hits(), 0);
}
