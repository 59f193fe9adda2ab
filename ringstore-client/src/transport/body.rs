//! Request bodies with progress tracking.
//!
//! Upload bodies are fed through a bounded channel so the producer (a pump
//! task reading an [`ObjectSource`], or an `ObjectWriter` pushed by the host)
//! is decoupled from hyper. The stream handed to reqwest records when chunks
//! go out and when the body ends, which drives the send-side stall timeout
//! and the `Sending → AwaitingAck` transition of a pending write.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::channel::mpsc;
use futures::{SinkExt, Stream};
use ringstore_common::ObjectSource;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Chunks buffered between the producer and the connection.
const CHANNEL_DEPTH: usize = 2;

/// An upload source shared by successive attempts of one create.
///
/// Chunks read from the inner source are held until the connection has taken
/// them. An attempt that failed before any byte went out hands the same
/// chunks to the next endpoint; only after bytes were sent does another
/// attempt need the inner source to rewind.
pub struct UploadSource {
    inner: Box<dyn ObjectSource>,
    /// Read during the current attempt, not yet taken by the connection.
    held: VecDeque<Bytes>,
    /// Attempt offset of the first held chunk.
    held_from: u64,
    /// Handed out again before `inner` is read.
    replay: VecDeque<Bytes>,
    /// Bytes the connection took during the last finished attempt.
    sent: u64,
}

impl UploadSource {
    pub fn new(inner: Box<dyn ObjectSource>) -> Self {
        Self {
            inner,
            held: VecDeque::new(),
            held_from: 0,
            replay: VecDeque::new(),
            sent: 0,
        }
    }

    /// Next chunk for the current attempt. `taken` is how many bytes the
    /// connection has taken so far in this attempt.
    async fn next_chunk(&mut self, taken: u64) -> io::Result<Option<Bytes>> {
        self.release(taken);
        let chunk = match self.replay.pop_front() {
            Some(chunk) => Some(chunk),
            None => self.inner.next_chunk().await?,
        };
        if let Some(chunk) = &chunk {
            self.held.push_back(chunk.clone());
        }
        Ok(chunk)
    }

    fn release(&mut self, taken: u64) {
        while let Some(front) = self.held.front() {
            let end = self.held_from + front.len() as u64;
            if end > taken {
                break;
            }
            self.held_from = end;
            self.held.pop_front();
        }
    }

    fn end_attempt(&mut self, taken: u64) {
        self.sent = taken;
    }

    /// Get ready for another attempt. `Ok(false)` means bytes reached the
    /// previous endpoint and the source cannot replay them.
    pub async fn restart(&mut self) -> io::Result<bool> {
        if self.sent == 0 {
            while let Some(chunk) = self.held.pop_back() {
                self.replay.push_front(chunk);
            }
            self.held_from = 0;
            return Ok(true);
        }
        if self.inner.rewind().await? {
            self.held.clear();
            self.replay.clear();
            self.held_from = 0;
            self.sent = 0;
            return Ok(true);
        }
        Ok(false)
    }
}

pub type SharedSource = Arc<Mutex<UploadSource>>;

/// Why an upload body ended early. These are never the endpoint's fault.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BodyFailure {
    #[error("upload source failed: {0}")]
    Source(String),
    #[error("declared {expected} bytes but the source produced {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("upload cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyPhase {
    /// Nothing pulled yet (still connecting, or headers in flight).
    Idle,
    Sending,
    /// Last byte handed to the connection; waiting for the response.
    Finished,
}

const PHASE_IDLE: u8 = 0;
const PHASE_SENDING: u8 = 1;
const PHASE_FINISHED: u8 = 2;

/// Shared between the body stream and whoever waits on the request.
#[derive(Debug)]
pub struct Progress {
    base: Instant,
    phase: AtomicU8,
    last_activity_us: AtomicU64,
    finished_us: AtomicU64,
    bytes: AtomicU64,
    failure: OnceLock<BodyFailure>,
    cancelled: AtomicBool,
    paced_by_caller: bool,
}

impl Progress {
    fn new(paced_by_caller: bool) -> Self {
        Self {
            base: Instant::now(),
            phase: AtomicU8::new(PHASE_IDLE),
            last_activity_us: AtomicU64::new(0),
            finished_us: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            failure: OnceLock::new(),
            cancelled: AtomicBool::new(false),
            paced_by_caller,
        }
    }

    fn elapsed_us(&self) -> u64 {
        Instant::now().saturating_duration_since(self.base).as_micros() as u64
    }

    fn record_chunk(&self, len: usize) {
        self.bytes.fetch_add(len as u64, Ordering::AcqRel);
        self.last_activity_us.store(self.elapsed_us(), Ordering::Release);
        self.phase.store(PHASE_SENDING, Ordering::Release);
    }

    fn finish(&self) {
        self.finished_us.store(self.elapsed_us(), Ordering::Release);
        self.phase.store(PHASE_FINISHED, Ordering::Release);
    }

    fn fail(&self, failure: BodyFailure) {
        let _ = self.failure.set(failure);
    }

    /// Make the body fail on its next poll instead of ending cleanly, so the
    /// store never sees a complete request.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> BodyPhase {
        match self.phase.load(Ordering::Acquire) {
            PHASE_IDLE => BodyPhase::Idle,
            PHASE_SENDING => BodyPhase::Sending,
            _ => BodyPhase::Finished,
        }
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    pub fn failure(&self) -> Option<BodyFailure> {
        self.failure.get().cloned()
    }

    /// When the host paces the body itself, a quiet period is not a stall.
    pub fn paced_by_caller(&self) -> bool {
        self.paced_by_caller
    }

    pub fn last_activity(&self) -> Instant {
        self.base + Duration::from_micros(self.last_activity_us.load(Ordering::Acquire))
    }

    pub fn finished_at(&self) -> Instant {
        self.base + Duration::from_micros(self.finished_us.load(Ordering::Acquire))
    }
}

/// Body stream wrapper that enforces the declared length and reports progress.
struct TrackedStream {
    inner: mpsc::Receiver<io::Result<Bytes>>,
    progress: Arc<Progress>,
    expected_len: Option<u64>,
    sent: u64,
    done: bool,
}

impl TrackedStream {
    fn fail(&mut self, failure: BodyFailure) -> Poll<Option<io::Result<Bytes>>> {
        self.done = true;
        self.progress.fail(failure.clone());
        Poll::Ready(Some(Err(io::Error::other(failure))))
    }
}

impl Stream for TrackedStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.done {
            return Poll::Ready(None);
        }
        if self.progress.is_cancelled() {
            return self.fail(BodyFailure::Cancelled);
        }
        match ready!(Pin::new(&mut self.inner).poll_next(cx)) {
            Some(Ok(chunk)) => {
                self.sent += chunk.len() as u64;
                if let Some(expected) = self.expected_len {
                    if self.sent > expected {
                        let actual = self.sent;
                        return self.fail(BodyFailure::LengthMismatch { expected, actual });
                    }
                }
                self.progress.record_chunk(chunk.len());
                Poll::Ready(Some(Ok(chunk)))
            }
            Some(Err(e)) => self.fail(BodyFailure::Source(e.to_string())),
            None => {
                if let Some(expected) = self.expected_len {
                    if self.sent != expected {
                        let actual = self.sent;
                        return self.fail(BodyFailure::LengthMismatch { expected, actual });
                    }
                }
                self.done = true;
                self.progress.finish();
                Poll::Ready(None)
            }
        }
    }
}

pub struct RequestBody {
    pub(crate) body: reqwest::Body,
    pub(crate) progress: Arc<Progress>,
}

impl RequestBody {
    /// A body whose bytes are already in memory.
    pub fn from_bytes(data: Bytes) -> Self {
        Self {
            body: reqwest::Body::from(data),
            progress: Arc::new(Progress::new(false)),
        }
    }

    /// A streamed body fed through the returned sender. Dropping the sender
    /// ends the body. Without a Content-Length header it goes out chunked.
    pub fn channel(
        expected_len: Option<u64>,
        paced_by_caller: bool,
    ) -> (mpsc::Sender<io::Result<Bytes>>, Self) {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let progress = Arc::new(Progress::new(paced_by_caller));
        let stream = TrackedStream {
            inner: rx,
            progress: Arc::clone(&progress),
            expected_len,
            sent: 0,
            done: false,
        };
        let body = Self {
            body: reqwest::Body::wrap_stream(stream),
            progress,
        };
        (tx, body)
    }

    /// A streamed body pumped from `source` by a background task. The task
    /// must be stopped (see [`SourcePump::stop`]) before the source is reused.
    pub fn from_source(source: SharedSource, expected_len: Option<u64>) -> (SourcePump, Self) {
        let (mut tx, body) = Self::channel(expected_len, false);
        let progress = body.progress();
        let task = tokio::spawn({
            let source = Arc::clone(&source);
            let progress = Arc::clone(&progress);
            async move {
                loop {
                    let next = source.lock().await.next_chunk(progress.bytes()).await;
                    let item = match next {
                        Ok(Some(chunk)) => Ok(chunk),
                        Ok(None) => break,
                        Err(e) => Err(e),
                    };
                    let is_err = item.is_err();
                    if tx.send(item).await.is_err() || is_err {
                        break;
                    }
                }
            }
        });
        (SourcePump { task, source, progress }, body)
    }

    pub fn progress(&self) -> Arc<Progress> {
        Arc::clone(&self.progress)
    }
}

/// Background task moving chunks from an [`ObjectSource`] into a body.
/// Dropping it stops the task.
pub struct SourcePump {
    task: JoinHandle<()>,
    source: SharedSource,
    progress: Arc<Progress>,
}

impl SourcePump {
    /// Stop the pump, wait until it no longer touches the source, and record
    /// how much of the source the connection took.
    pub async fn stop(mut self) {
        self.task.abort();
        let _ = (&mut self.task).await;
        self.source.lock().await.end_attempt(self.progress.bytes());
    }
}

impl Drop for SourcePump {
    fn drop(&mut self) {
        self.task.abort();
    }
}
