//! Inbound data channel: the body of a synthetic response.
//!
//! A body is a sequence of [`BodyEvent`]s ending in `Close`. [`FileBody`]
//! streams a file from a background reader; [`BufferedBody`] serves a fixed
//! payload (error bodies) or nothing at all (PUT, HEAD and DELETE responses).

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::constants::BODY_CHANNEL_CAPACITY;
use crate::protocol::error::StorageError;

#[derive(Debug)]
pub enum BodyEvent {
    Data(Bytes),
    End,
    /// Failure after the response was emitted, e.g. a read error mid-stream.
    Error(StorageError),
    Close,
}

#[async_trait]
pub trait ResponseBody: Send + fmt::Debug {
    /// Next signal of the body, or `None` once `Close` has been delivered or the
    /// body was destroyed.
    async fn next_event(&mut self) -> Option<BodyEvent>;

    /// Stops reading ahead. Buffered events stay available and `next_event`
    /// still pulls one chunk at a time.
    fn pause(&mut self);

    fn resume(&mut self);

    /// Tears the body down without raising an error.
    fn destroy(&mut self);

    fn is_readable(&self) -> bool;

    /// Collects every data chunk until the end of the body.
    async fn read_to_end(&mut self) -> Result<Bytes, StorageError> {
        let mut buf = BytesMut::new();
        while let Some(event) = self.next_event().await {
            match event {
                BodyEvent::Data(chunk) => buf.extend_from_slice(&chunk),
                BodyEvent::End => {}
                BodyEvent::Error(e) => return Err(e),
                BodyEvent::Close => break,
            }
        }
        Ok(buf.freeze())
    }
}

/// A body whose events are known up front.
#[derive(Debug)]
pub struct BufferedBody {
    events: VecDeque<BodyEvent>,
    readable: bool,
}

impl BufferedBody {
    pub fn new(payload: Bytes) -> Self {
        let mut events = VecDeque::with_capacity(3);
        if !payload.is_empty() {
            events.push_back(BodyEvent::Data(payload));
        }
        events.push_back(BodyEvent::End);
        events.push_back(BodyEvent::Close);
        Self {
            events,
            readable: true,
        }
    }

    pub fn empty() -> Self {
        Self::new(Bytes::new())
    }
}

#[async_trait]
impl ResponseBody for BufferedBody {
    async fn next_event(&mut self) -> Option<BodyEvent> {
        let event = self.events.pop_front()?;
        if matches!(event, BodyEvent::End | BodyEvent::Close) {
            self.readable = false;
        }
        Some(event)
    }

    // nothing is read ahead, so there is nothing to hold back
    fn pause(&mut self) {}

    fn resume(&mut self) {}

    fn destroy(&mut self) {
        self.readable = false;
        self.events.clear();
    }

    fn is_readable(&self) -> bool {
        self.readable
    }
}

/// Streams a file opened for reading. Data, end-of-file, read errors and the
/// final close are forwarded in order from a background reader task.
#[derive(Debug)]
pub struct FileBody {
    events: mpsc::Receiver<BodyEvent>,
    paused: watch::Sender<bool>,
    demand: Arc<Notify>,
    reader: JoinHandle<()>,
    readable: bool,
    closed: bool,
}

impl FileBody {
    /// Starts reading `file` in chunks of `chunk_size` bytes.
    pub fn spawn(file: File, key: &str, chunk_size: usize) -> Self {
        let (tx, events) = mpsc::channel(BODY_CHANNEL_CAPACITY);
        let (paused, paused_rx) = watch::channel(false);
        let demand = Arc::new(Notify::new());
        let reader = tokio::spawn(pump(
            file,
            key.to_string(),
            chunk_size.max(1),
            tx,
            paused_rx,
            Arc::clone(&demand),
        ));

        Self {
            events,
            paused,
            demand,
            reader,
            readable: true,
            closed: false,
        }
    }
}

#[async_trait]
impl ResponseBody for FileBody {
    async fn next_event(&mut self) -> Option<BodyEvent> {
        if self.closed {
            return None;
        }
        if *self.paused.borrow() {
            self.demand.notify_one();
        }

        match self.events.recv().await {
            Some(BodyEvent::Close) => {
                self.readable = false;
                self.closed = true;
                Some(BodyEvent::Close)
            }
            Some(event @ (BodyEvent::End | BodyEvent::Error(_))) => {
                self.readable = false;
                Some(event)
            }
            Some(event) => Some(event),
            None => {
                self.readable = false;
                self.closed = true;
                None
            }
        }
    }

    fn pause(&mut self) {
        self.paused.send_replace(true);
    }

    fn resume(&mut self) {
        self.paused.send_replace(false);
    }

    fn destroy(&mut self) {
        if self.closed {
            return;
        }
        debug!("Destroying file body");
        self.readable = false;
        self.closed = true;
        self.reader.abort();
        self.events.close();
    }

    fn is_readable(&self) -> bool {
        self.readable
    }
}

impl Drop for FileBody {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn pump(
    mut file: File,
    key: String,
    chunk_size: usize,
    tx: mpsc::Sender<BodyEvent>,
    mut paused: watch::Receiver<bool>,
    demand: Arc<Notify>,
) {
    let mut buf = vec![0u8; chunk_size];
    loop {
        if *paused.borrow_and_update() {
            tokio::select! {
                changed = paused.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    continue;
                }
                _ = demand.notified() => {}
            }
        }

        match file.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(BodyEvent::End).await;
                break;
            }
            Ok(n) => {
                if tx.send(BodyEvent::Data(Bytes::copy_from_slice(&buf[..n]))).await.is_err() {
                    debug!("Body consumer went away: key='{}'", key);
                    return;
                }
            }
            Err(e) => {
                warn!("Read failed mid-stream for key '{}': {}", key, e);
                let _ = tx.send(BodyEvent::Error(StorageError::internal(&key, e))).await;
                break;
            }
        }
    }
    let _ = tx.send(BodyEvent::Close).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn file_body(contents: &[u8], chunk_size: usize) -> (tempfile::TempDir, FileBody) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, contents).unwrap();
        let file = File::open(&path).await.unwrap();
        (dir, FileBody::spawn(file, "data", chunk_size))
    }

    #[tokio::test]
    async fn test_empty_body_ends_then_closes() {
        let mut body = BufferedBody::empty();
        assert!(body.is_readable());
        assert!(matches!(body.next_event().await, Some(BodyEvent::End)));
        assert!(!body.is_readable());
        assert!(matches!(body.next_event().await, Some(BodyEvent::Close)));
        assert!(body.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_buffered_body_delivers_payload() {
        let mut body = BufferedBody::new(Bytes::from_static(b"<Error/>"));
        assert_eq!(body.read_to_end().await.unwrap(), Bytes::from_static(b"<Error/>"));
        assert!(body.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_read_error_is_forwarded_before_close() {
        let dir = tempdir().unwrap();
        // opening a directory succeeds, reading it does not
        let file = File::open(dir.path()).await.unwrap();
        let mut body = FileBody::spawn(file, "dir", 16);

        match body.next_event().await {
            Some(BodyEvent::Error(e)) => assert_eq!(e.key(), "dir"),
            other => panic!("expected an error event, got {:?}", other),
        }
        assert!(!body.is_readable());
        assert!(matches!(body.next_event().await, Some(BodyEvent::Close)));
        assert!(body.next_event().await.is_none());
    }

    #[tokio::test]
    async fn test_file_body_streams_in_chunks() {
        let (_dir, mut body) = file_body(b"hello world", 4).await;

        let mut chunks = Vec::new();
        let mut saw_end = false;
        while let Some(event) = body.next_event().await {
            match event {
                BodyEvent::Data(chunk) => chunks.push(chunk),
                BodyEvent::End => saw_end = true,
                BodyEvent::Error(e) => panic!("unexpected error {}", e),
                BodyEvent::Close => break,
            }
        }
        assert!(saw_end);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks.concat(), b"hello world");
        assert!(!body.is_readable());
    }

    #[tokio::test]
    async fn test_paused_body_still_serves_pulls() {
        let (_dir, mut body) = file_body(b"abcdef", 2).await;
        body.pause();
        let data = body.read_to_end().await.unwrap();
        assert_eq!(data, Bytes::from_static(b"abcdef"));
        body.resume();
    }

    #[tokio::test]
    async fn test_destroy_is_quiet() {
        let (_dir, mut body) = file_body(&vec![7u8; 1024 * 1024], 1024).await;
        assert!(matches!(body.next_event().await, Some(BodyEvent::Data(_))));

        body.destroy();
        assert!(!body.is_readable());
        assert!(body.next_event().await.is_none());
        // destroying twice is harmless
        body.destroy();
    }
}
