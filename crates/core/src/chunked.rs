use std::io::{ErrorKind, Read};
use std::sync::Arc;

use crate::cloud::ObjectStorage;
use crate::engine::ChunkSource;
use crate::error::FetchError;
use crate::model::{ChunkRequest, MAX_CHUNK_SIZE};

/// Lazily fetched view of one remote object as a sequence of byte ranges.
///
/// Single-use and owned by exactly one worker; nothing here is shared.
pub struct RemoteChunkedReader {
    storage: Arc<dyn ObjectStorage>,
    bucket: String,
    key: String,
    size: u64,
    chunk_size: u64,
    offset: u64,
    error: Option<FetchError>,
}

impl RemoteChunkedReader {
    /// `chunk_size` is clamped to `1..=MAX_CHUNK_SIZE`.
    pub fn new(
        storage: Arc<dyn ObjectStorage>,
        bucket: impl Into<String>,
        key: impl Into<String>,
        size: u64,
        chunk_size: u64,
    ) -> Self {
        Self {
            storage,
            bucket: bucket.into(),
            key: key.into(),
            size,
            chunk_size: chunk_size.clamp(1, MAX_CHUNK_SIZE),
            offset: 0,
            error: None,
        }
    }

    fn read_range(&self, chunk: ChunkRequest, buf: &mut [u8]) -> Result<(), FetchError> {
        let mut body = self
            .storage
            .get_object_range(&self.bucket, &self.key, chunk.base..chunk.end())?;

        let mut filled = 0_usize;
        while filled < buf.len() {
            match body.read(&mut buf[filled..]) {
                Ok(0) => {
                    return Err(FetchError::ShortRead {
                        expected: chunk.length,
                        received: filled as u64,
                    })
                }
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FetchError::Io(err)),
            }
        }
        Ok(())
    }
}

impl ChunkSource for RemoteChunkedReader {
    fn first(&mut self) -> Option<ChunkRequest> {
        self.offset = 0;
        self.next()
    }

    fn next(&mut self) -> Option<ChunkRequest> {
        let base = self.offset;
        let remaining = self.size.saturating_sub(base);
        if remaining == 0 {
            return None;
        }
        let length = remaining.min(self.chunk_size);
        self.offset += length;
        Some(ChunkRequest { base, length })
    }

    fn fetch(&mut self, chunk: ChunkRequest, buf: &mut [u8]) {
        if let Err(err) = self.read_range(chunk, buf) {
            // The first failure is the interesting one.
            self.error.get_or_insert(err);
        }
    }

    fn failed(&self) -> bool {
        self.error.is_some()
    }

    fn take_error(&mut self) -> Option<FetchError> {
        self.error.take()
    }

    fn label(&self) -> &str {
        &self.key
    }
}
