//! Ready-made upload sources.

use std::io::{self, SeekFrom};
use std::path::Path;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use ringstore_common::ObjectSource;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

const CHUNK_SIZE: usize = 64 * 1024;

/// An in-memory body. Always rewindable.
#[derive(Debug, Clone)]
pub struct BytesSource {
    data: Bytes,
    offset: usize,
    chunk_size: usize,
}

impl BytesSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            offset: 0,
            chunk_size: CHUNK_SIZE,
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }
}

#[async_trait]
impl ObjectSource for BytesSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + self.chunk_size).min(self.data.len());
        let chunk = self.data.slice(self.offset..end);
        self.offset = end;
        Ok(Some(chunk))
    }

    async fn rewind(&mut self) -> io::Result<bool> {
        self.offset = 0;
        Ok(true)
    }
}

/// A file read from its current start; rewinding seeks back to offset 0.
#[derive(Debug)]
pub struct FileSource {
    file: File,
}

impl FileSource {
    pub async fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            file: File::open(path).await?,
        })
    }

    pub async fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata().await?.len())
    }
}

#[async_trait]
impl ObjectSource for FileSource {
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        let mut buf = BytesMut::with_capacity(CHUNK_SIZE);
        let n = self.file.read_buf(&mut buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(buf.freeze()))
    }

    async fn rewind(&mut self) -> io::Result<bool> {
        self.file.seek(SeekFrom::Start(0)).await?;
        Ok(true)
    }
}
