//! Outbound data channel: the request body a caller streams to a PUT.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::protocol::error::StorageError;

#[async_trait]
pub trait RequestSink: Send + fmt::Debug {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError>;

    /// Sends the optional final chunk and signals end of input.
    async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), StorageError>;

    /// Drops the channel without signalling end of input.
    fn destroy(&mut self);

    fn is_writable(&self) -> bool;
}

/// Sink of the operations that carry no request body. Writes are accepted and
/// discarded.
#[derive(Debug)]
pub struct NullSink {
    writable: bool,
}

impl NullSink {
    pub fn new() -> Self {
        Self { writable: true }
    }
}

impl Default for NullSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestSink for NullSink {
    async fn write(&mut self, _chunk: Bytes) -> Result<(), StorageError> {
        Ok(())
    }

    async fn end(&mut self, _chunk: Option<Bytes>) -> Result<(), StorageError> {
        self.writable = false;
        Ok(())
    }

    fn destroy(&mut self) {
        self.writable = false;
    }

    fn is_writable(&self) -> bool {
        self.writable
    }
}

#[derive(Debug)]
pub enum SinkMessage {
    Chunk(Bytes),
    End,
}

/// Caller half of a PUT body. Chunks travel over a bounded channel to the task
/// that owns the data file, so `write` waits when the file falls behind.
#[derive(Debug)]
pub struct FileSink {
    key: String,
    tx: Option<mpsc::Sender<SinkMessage>>,
}

impl FileSink {
    pub fn channel(key: &str, capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            key: key.to_string(),
            tx: Some(tx),
        };
        (sink, rx)
    }

    async fn send(&mut self, message: SinkMessage) -> Result<(), StorageError> {
        let tx = self.tx.as_ref().ok_or_else(|| self.closed())?;
        if tx.send(message).await.is_err() {
            // the writer stopped; its failure arrives as the response
            self.tx = None;
            return Err(self.closed());
        }
        Ok(())
    }

    fn closed(&self) -> StorageError {
        StorageError::access_denied(&self.key, "request body is no longer writable")
    }
}

#[async_trait]
impl RequestSink for FileSink {
    async fn write(&mut self, chunk: Bytes) -> Result<(), StorageError> {
        self.send(SinkMessage::Chunk(chunk)).await
    }

    async fn end(&mut self, chunk: Option<Bytes>) -> Result<(), StorageError> {
        if let Some(chunk) = chunk.filter(|c| !c.is_empty()) {
            self.send(SinkMessage::Chunk(chunk)).await?;
        }
        self.send(SinkMessage::End).await?;
        self.tx = None;
        Ok(())
    }

    fn destroy(&mut self) {
        self.tx = None;
    }

    fn is_writable(&self) -> bool {
        self.tx.is_some()
    }
}

/// Length and checksum of a fully written object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectDigest {
    pub length: u64,
    /// Quoted lower-case hex MD5, as sent in the `etag` header.
    pub etag: String,
}

/// Writes a data file while folding every chunk into a byte count and an MD5
/// accumulator.
pub struct ObjectWriter {
    file: File,
    length: u64,
    md5: md5::Context,
}

impl fmt::Debug for ObjectWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectWriter")
            .field("length", &self.length)
            .finish_non_exhaustive()
    }
}

impl ObjectWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            length: 0,
            md5: md5::Context::new(),
        }
    }

    pub async fn write_chunk(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        self.file.write_all(chunk).await?;
        self.length += chunk.len() as u64;
        self.md5.consume(chunk);
        Ok(())
    }

    /// Flushes the file to disk and finalizes the checksum.
    pub async fn finish(mut self) -> std::io::Result<ObjectDigest> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        let digest = self.md5.compute();
        Ok(ObjectDigest {
            length: self.length,
            etag: format!("\"{}\"", hex::encode(digest.0)),
        })
    }
}
