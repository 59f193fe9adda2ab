use std::fmt;
use std::str::FromStr;

use bytes::Bytes;

use crate::error::StoreError;
use crate::identity::ObjectIdentity;
use crate::metadata::Metadata;

/// Object-lifecycle contract the host drives.
///
/// Implementations own addressing, endpoint selection and retries; the host
/// only sees identities and [`StoreError`] outcomes.
#[async_trait::async_trait]
pub trait ObjectBackend: Send + Sync {
    /// Store `source` and `metadata` under `identity` in a single request.
    async fn create(
        &self,
        identity: &ObjectIdentity,
        source: Box<dyn ObjectSource>,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// Open the object (or a byte range of it) for streaming.
    async fn open_for_read(
        &self,
        identity: &ObjectIdentity,
        range: Option<ByteRange>,
    ) -> Result<Box<dyn ObjectRead>, StoreError>;

    /// Fetch the object's metadata without its body.
    async fn head(&self, identity: &ObjectIdentity) -> Result<Metadata, StoreError>;

    /// Replace the metadata of an existing object, leaving its bytes alone.
    async fn update_metadata(
        &self,
        identity: &ObjectIdentity,
        metadata: &Metadata,
    ) -> Result<(), StoreError>;

    /// Delete the object. Deleting a missing object succeeds.
    async fn delete(&self, identity: &ObjectIdentity) -> Result<(), StoreError>;

    async fn exists(&self, identity: &ObjectIdentity) -> Result<bool, StoreError>;
}

/// Pull-mode byte source for uploads.
#[async_trait::async_trait]
pub trait ObjectSource: Send {
    /// Next chunk of the body, `None` at end of stream.
    async fn next_chunk(&mut self) -> std::io::Result<Option<Bytes>>;

    /// Restart from the first byte. Returns `false` if the source cannot be
    /// replayed, in which case an upload cannot be retried on another
    /// endpoint once it has started.
    async fn rewind(&mut self) -> std::io::Result<bool> {
        Ok(false)
    }
}

/// Read handle returned by [`ObjectBackend::open_for_read`].
#[async_trait::async_trait]
pub trait ObjectRead: Send {
    /// Metadata returned alongside the body.
    fn metadata(&self) -> &Metadata;

    /// Next chunk of the body, `None` at end of stream.
    async fn read_chunk(&mut self) -> Result<Option<Bytes>, StoreError>;

    /// Finish with the handle, draining what is left so the connection can
    /// be reused.
    async fn close(&mut self) -> Result<(), StoreError>;

    /// Drop the connection immediately.
    fn abort(&mut self);
}

/// Push-mode write handle for hosts that produce the body chunk by chunk.
#[async_trait::async_trait]
pub trait ObjectWrite: Send {
    /// Send a chunk; returns the total number of bytes written so far.
    async fn write(&mut self, chunk: Bytes) -> Result<u64, StoreError>;

    /// Complete the upload. Returns once the store has acknowledged it.
    async fn close(&mut self) -> Result<(), StoreError>;

    /// Cancel the upload. Nothing becomes visible under the key.
    fn abort(&mut self);
}

/// Inclusive byte range, open-ended when `end` is `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>,
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Result<Self, StoreError> {
        if let Some(end) = end {
            if end < start {
                return Err(StoreError::InvalidRequest(format!(
                    "range end {end} is before start {start}"
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Value for the HTTP `Range` header.
    pub fn header_value(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }

    pub fn len(&self) -> Option<u64> {
        self.end.map(|end| end - self.start + 1)
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// Parses `START-END` or `START-`.
impl FromStr for ByteRange {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || StoreError::InvalidRequest(format!("invalid range '{s}', expected START-END"));
        let (start, end) = s.trim().split_once('-').ok_or_else(bad)?;
        let start = start.parse::<u64>().map_err(|_| bad())?;
        let end = if end.is_empty() {
            None
        } else {
            Some(end.parse::<u64>().map_err(|_| bad())?)
        };
        ByteRange::new(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_header() {
        assert_eq!(ByteRange::new(0, Some(4)).unwrap().header_value(), "bytes=0-4");
        assert_eq!(ByteRange::new(10, None).unwrap().header_value(), "bytes=10-");
        assert_eq!(ByteRange::new(3, Some(3)).unwrap().len(), Some(1));
    }

    #[test]
    fn test_range_parse() {
        assert_eq!("2-7".parse::<ByteRange>().unwrap(), ByteRange { start: 2, end: Some(7) });
        assert_eq!("5-".parse::<ByteRange>().unwrap(), ByteRange { start: 5, end: None });
        assert!("7-2".parse::<ByteRange>().is_err());
        assert!("abc".parse::<ByteRange>().is_err());
        assert!("-5".parse::<ByteRange>().is_err());
    }
}
