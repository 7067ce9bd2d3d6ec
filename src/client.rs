//! Operation handlers and the request handle.
//!
//! Every operation returns a [`Request`] at once and runs its filesystem work
//! on a spawned task, which settles the request with exactly one response.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::File;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::protocol::constants::{
    HEADER_CONNECTION, HEADER_CONTENT_LENGTH, HEADER_DATE, HEADER_ETAG, STATUS_NO_CONTENT,
    STATUS_OK,
};
use crate::protocol::{
    Emission, FileBody, FileSink, NullSink, ObjectWriter, RequestEvent, RequestPhase,
    RequestSink, RequestState, Response, ResponseEmitter, SinkMessage, StorageError,
};
use crate::storage::{
    meta_path, read_metadata, remove_if_present, write_metadata, KeyEncoder, MetadataError,
    ObjectMetadata,
};
use crate::utils::time::http_date_now;

/// Local stand-in for an object-storage client bound to one bucket.
#[derive(Debug, Clone)]
pub struct Client {
    encoder: KeyEncoder,
    read_chunk_size: usize,
    sink_capacity: usize,
}

impl Client {
    /// Creates the storage root and bucket directory if needed.
    pub fn new(config: &ClientConfig) -> anyhow::Result<Self> {
        let bucket_path = config.ensure_directories()?;
        info!("Serving bucket '{}' from {:?}", config.bucket, bucket_path);
        Ok(Self {
            encoder: KeyEncoder::new(bucket_path),
            read_chunk_size: config.read_chunk_size,
            sink_capacity: config.sink_capacity,
        })
    }

    pub fn bucket_path(&self) -> &Path {
        self.encoder.root()
    }

    /// Starts an upload. Send the body with [`Request::write`] and
    /// [`Request::end`], ideally after the `Continue` event.
    pub fn put<I, K, V>(&self, key: &str, headers: I) -> Request
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let (emitter, events) = ResponseEmitter::channel(key);
        let (sink, chunks) = FileSink::channel(key, self.sink_capacity);
        let meta = ObjectMetadata::from_headers(headers);
        let state = Arc::clone(emitter.state());

        tokio::spawn(run_put(
            self.encoder.clone(),
            key.to_string(),
            meta,
            chunks,
            emitter,
        ));
        Request::new(key, events, Box::new(sink), state)
    }

    pub fn get(&self, key: &str) -> Request {
        let (emitter, events) = ResponseEmitter::channel(key);
        let state = Arc::clone(emitter.state());
        tokio::spawn(run_get(
            self.encoder.clone(),
            key.to_string(),
            self.read_chunk_size,
            emitter,
        ));
        Request::new(key, events, Box::new(NullSink::new()), state)
    }

    pub fn head(&self, key: &str) -> Request {
        let (emitter, events) = ResponseEmitter::channel(key);
        let state = Arc::clone(emitter.state());
        tokio::spawn(run_head(self.encoder.clone(), key.to_string(), emitter));
        Request::new(key, events, Box::new(NullSink::new()), state)
    }

    pub fn del(&self, key: &str) -> Request {
        let (emitter, events) = ResponseEmitter::channel(key);
        let state = Arc::clone(emitter.state());
        tokio::spawn(run_delete(self.encoder.clone(), key.to_string(), emitter));
        Request::new(key, events, Box::new(NullSink::new()), state)
    }
}

/// One in-flight operation. Yields `Continue` (PUT only), then a single
/// `Response`, possibly followed by stream-level `Error`s.
#[derive(Debug)]
pub struct Request {
    key: String,
    events: mpsc::UnboundedReceiver<RequestEvent>,
    sink: Box<dyn RequestSink>,
    state: Arc<RequestState>,
}

impl Request {
    fn new(
        key: &str,
        events: mpsc::UnboundedReceiver<RequestEvent>,
        sink: Box<dyn RequestSink>,
        state: Arc<RequestState>,
    ) -> Self {
        Self {
            key: key.to_string(),
            events,
            sink,
            state,
        }
    }

    pub fn phase(&self) -> RequestPhase {
        self.state.phase()
    }

    pub async fn next_event(&mut self) -> Option<RequestEvent> {
        self.events.recv().await
    }

    pub fn is_writable(&self) -> bool {
        self.state.is_pending() && self.sink.is_writable()
    }

    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), StorageError> {
        if !self.state.is_pending() {
            return Err(self.not_writable());
        }
        self.sink.write(chunk.into()).await
    }

    /// Signals the end of the request body.
    pub async fn end(&mut self) -> Result<(), StorageError> {
        self.finish(None).await
    }

    /// Sends a final chunk and signals the end of the request body.
    pub async fn end_with(&mut self, chunk: impl Into<Bytes>) -> Result<(), StorageError> {
        self.finish(Some(chunk.into())).await
    }

    async fn finish(&mut self, chunk: Option<Bytes>) -> Result<(), StorageError> {
        if !self.state.is_pending() {
            return Err(self.not_writable());
        }
        self.sink.end(chunk).await
    }

    /// Abandons the operation. No response is emitted afterwards; a no-op once
    /// the response has been emitted.
    pub fn abort(&mut self) {
        if self.state.abort() {
            info!("Request aborted: key='{}'", self.key);
            self.sink.destroy();
        }
    }

    /// Waits for the terminal response, skipping `Continue`.
    pub async fn response(&mut self) -> Result<Response, StorageError> {
        while let Some(event) = self.next_event().await {
            match event {
                RequestEvent::Continue => continue,
                RequestEvent::Response(response) => return Ok(response),
                RequestEvent::Error(e) => return Err(e),
            }
        }
        Err(StorageError::internal(&self.key, "request closed without a response"))
    }

    fn not_writable(&self) -> StorageError {
        StorageError::access_denied(&self.key, "request is no longer writable")
    }
}

async fn run_put(
    encoder: KeyEncoder,
    key: String,
    mut meta: ObjectMetadata,
    mut chunks: mpsc::Receiver<SinkMessage>,
    emitter: ResponseEmitter,
) {
    info!("Processing put: key='{}'", key);

    let path = match encoder.resolve(&key, true).await {
        Ok(path) => path,
        Err(e) => {
            error!("Cannot resolve key '{}' for writing: {}", key, e);
            emitter.fail(StorageError::access_denied(&key, e));
            return;
        }
    };

    let file = match File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!("Cannot open {:?} for writing: {}", path, e);
            emitter.fail(StorageError::access_denied(&key, e));
            return;
        }
    };
    emitter.signal_continue();

    let mut writer = ObjectWriter::new(file);
    loop {
        match chunks.recv().await {
            Some(SinkMessage::Chunk(chunk)) => {
                if let Err(e) = writer.write_chunk(&chunk).await {
                    error!("Write failed for key '{}': {}", key, e);
                    drop(writer);
                    discard_partial(&path).await;
                    emitter.fail(StorageError::access_denied(&key, e));
                    return;
                }
            }
            Some(SinkMessage::End) => break,
            None => {
                warn!("Upload abandoned before end of input: key='{}'", key);
                drop(writer);
                discard_partial(&path).await;
                return;
            }
        }
    }

    let digest = match writer.finish().await {
        Ok(digest) => digest,
        Err(e) => {
            error!("Flush failed for key '{}': {}", key, e);
            discard_partial(&path).await;
            emitter.fail(StorageError::access_denied(&key, e));
            return;
        }
    };

    if emitter.state().phase() == RequestPhase::Aborted {
        info!("Put aborted before commit: key='{}'", key);
        discard_partial(&path).await;
        return;
    }

    let date = http_date_now();
    meta.insert(HEADER_CONTENT_LENGTH, digest.length.to_string());
    meta.insert(HEADER_DATE, date);
    meta.insert(HEADER_ETAG, digest.etag.clone());

    if let Err(e) = write_metadata(&path, &meta).await {
        error!("Metadata write failed for key '{}': {}", key, e);
        discard_partial(&path).await;
        emitter.fail(StorageError::access_denied(&key, e));
        return;
    }

    let emitted = emitter.emit(
        Emission::new(STATUS_OK)
            .with_header(HEADER_ETAG, digest.etag.clone())
            .with_header(HEADER_CONTENT_LENGTH, "0"),
    );
    // an abort racing the commit still leaves nothing stored
    if !emitted && emitter.state().phase() == RequestPhase::Aborted {
        info!("Put aborted before response: key='{}'", key);
        discard_partial(&path).await;
        return;
    }
    info!("Stored key='{}', size={} bytes, etag={}", key, digest.length, digest.etag);
}

async fn run_get(encoder: KeyEncoder, key: String, chunk_size: usize, emitter: ResponseEmitter) {
    info!("Processing get: key='{}'", key);

    let (path, meta) = match lookup(&encoder, &key).await {
        Ok(found) => found,
        Err(e) => {
            emitter.fail(e);
            return;
        }
    };
    if emitter.state().phase() == RequestPhase::Aborted {
        debug!("Get aborted before open: key='{}'", key);
        return;
    }

    let file = match File::open(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!("Metadata present but data unreadable for key '{}': {}", key, e);
            emitter.fail(StorageError::from_read_io(&key, &e));
            return;
        }
    };

    let body = FileBody::spawn(file, &key, chunk_size);
    emitter.emit(
        Emission::new(STATUS_OK)
            .with_headers(meta.into_headers())
            .with_body(Box::new(body)),
    );
}

async fn run_head(encoder: KeyEncoder, key: String, emitter: ResponseEmitter) {
    info!("Processing head: key='{}'", key);

    match lookup(&encoder, &key).await {
        Ok((_, meta)) => {
            emitter.emit(Emission::new(STATUS_OK).with_headers(meta.into_headers()));
        }
        Err(e) => emitter.fail(e),
    }
}

async fn run_delete(encoder: KeyEncoder, key: String, emitter: ResponseEmitter) {
    info!("Processing delete: key='{}'", key);

    match encoder.resolve(&key, false).await {
        Ok(path) => {
            if let Err(e) = remove_if_present(&path).await {
                error!("Cannot remove data for key '{}': {}", key, e);
                emitter.fail(StorageError::internal(&key, e));
                return;
            }
            if let Err(e) = remove_if_present(&meta_path(&path)).await {
                error!("Cannot remove metadata for key '{}': {}", key, e);
                emitter.fail(StorageError::internal(&key, e));
                return;
            }
        }
        // nothing can be stored under a key that does not resolve
        Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
        Err(e) => {
            emitter.fail(StorageError::internal(&key, e));
            return;
        }
    }

    emitter.emit(
        Emission::new(STATUS_NO_CONTENT)
            .with_header(HEADER_CONTENT_LENGTH, "0")
            .with_header(HEADER_CONNECTION, "close"),
    );
}

/// Resolves `key` and reads its metadata record.
async fn lookup(encoder: &KeyEncoder, key: &str) -> Result<(PathBuf, ObjectMetadata), StorageError> {
    let path = encoder.resolve(key, false).await.map_err(|e| match e.kind() {
        io::ErrorKind::InvalidInput => StorageError::no_such_key(key),
        _ => StorageError::internal(key, e),
    })?;

    match read_metadata(&path).await {
        Ok(meta) => Ok((path, meta)),
        Err(MetadataError::NotFound) => {
            debug!("No metadata record for key '{}'", key);
            Err(StorageError::no_such_key(key))
        }
        Err(e) => {
            error!("Metadata read failed for key '{}': {}", key, e);
            Err(StorageError::internal(key, e))
        }
    }
}

/// Removes what a failed or abandoned upload left behind, so no record
/// describes a data file that was not fully written.
async fn discard_partial(path: &Path) {
    for target in [path.to_path_buf(), meta_path(path)] {
        if let Err(e) = remove_if_present(&target).await {
            warn!("Cannot clean up {:?}: {}", target, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BodyEvent, Headers};
    use tempfile::tempdir;

    fn client(root: &Path) -> Client {
        Client::new(&ClientConfig::new("bucket").with_prefix(root)).unwrap()
    }

    #[tokio::test]
    async fn test_put_emits_continue_before_response() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        let mut req = client.put("k", Headers::new());
        assert!(matches!(req.next_event().await, Some(RequestEvent::Continue)));
        assert!(req.is_writable());
        req.end_with("abc").await.unwrap();

        let Some(RequestEvent::Response(resp)) = req.next_event().await else {
            panic!("expected a response");
        };
        assert_eq!(resp.status_code, 200);
        assert_eq!(resp.header("content-length"), Some("0"));
        assert!(!req.is_writable());
        assert!(req.write("late").await.is_err());
    }

    #[tokio::test]
    async fn test_put_record_overrides_caller_length() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        let mut req = client.put("k", [("Content-Length", "999"), ("X-Custom", "v")]);
        req.write("12").await.unwrap();
        req.end_with("345").await.unwrap();
        req.response().await.unwrap();

        let path = client.bucket_path().join("k");
        let raw = std::fs::read(meta_path(&path)).unwrap();
        let stored: Headers = serde_json::from_slice(&raw).unwrap();
        assert_eq!(stored["content-length"], "5");
        assert_eq!(stored["x-custom"], "v");
        assert!(stored.contains_key("date"));
        assert!(stored["etag"].starts_with('"'));
    }

    #[tokio::test]
    async fn test_aborted_put_leaves_nothing_behind() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        let mut req = client.put("partial", Headers::new());
        assert!(matches!(req.next_event().await, Some(RequestEvent::Continue)));
        req.write("half").await.unwrap();
        req.abort();
        assert_eq!(req.phase(), RequestPhase::Aborted);
        assert!(!req.is_writable());

        // the handler drops its emitter without responding
        assert!(req.next_event().await.is_none());
        let path = client.bucket_path().join("partial");
        assert!(!path.exists());
        assert!(!meta_path(&path).exists());
    }

    #[tokio::test]
    async fn test_put_aborted_after_end_is_not_committed() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        let mut req = client.put("k", Headers::new());
        assert!(matches!(req.next_event().await, Some(RequestEvent::Continue)));
        req.end_with("hello").await.unwrap();
        req.abort();

        assert!(req.next_event().await.is_none());
        assert_eq!(client.head("k").response().await.unwrap().status_code, 404);
        let path = client.bucket_path().join("k");
        assert!(!path.exists());
        assert!(!meta_path(&path).exists());
    }

    #[tokio::test]
    async fn test_metadata_write_failure_is_access_denied() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());
        let path = client.bucket_path().join("k");
        std::fs::create_dir(meta_path(&path)).unwrap();

        let mut req = client.put("k", Headers::new());
        assert!(matches!(req.next_event().await, Some(RequestEvent::Continue)));
        req.end_with("hello").await.unwrap();
        let mut resp = req.response().await.unwrap();
        assert_eq!(resp.status_code, 403);
        let body = resp.read_body().await.unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("<Code>AccessDenied</Code>"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_read_failure_after_ok_arrives_on_body() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());
        // a record whose data path is a directory opens fine but cannot be read
        let path = client.bucket_path().join("k");
        std::fs::create_dir(&path).unwrap();
        std::fs::write(meta_path(&path), br#"{"content-length":"3"}"#).unwrap();

        let mut resp = client.get("k").response().await.unwrap();
        assert_eq!(resp.status_code, 200);
        match resp.body.next_event().await {
            Some(BodyEvent::Error(e)) => assert_eq!(e.code(), "InternalError"),
            other => panic!("expected a body error, got {:?}", other),
        }
        assert!(matches!(resp.body.next_event().await, Some(BodyEvent::Close)));
    }

    #[tokio::test]
    async fn test_overlong_keys_are_missing() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        // each "é" encodes to six bytes, so the file name exceeds the limit
        let wide = "é".repeat(60);
        // fits as a data file name, but not with the record suffix
        let long = "a".repeat(252);
        for key in [wide.as_str(), long.as_str()] {
            assert_eq!(client.get(key).response().await.unwrap().status_code, 404);
            assert_eq!(client.head(key).response().await.unwrap().status_code, 404);
            assert_eq!(client.del(key).response().await.unwrap().status_code, 204);
        }
    }

    #[tokio::test]
    async fn test_abort_after_response_is_noop() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        let mut req = client.del("missing");
        let resp = req.response().await.unwrap();
        assert_eq!(resp.status_code, 204);
        req.abort();
        assert_eq!(req.phase(), RequestPhase::Responded);
    }

    #[tokio::test]
    async fn test_put_into_file_path_is_access_denied() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        let mut req = client.put("plain", Headers::new());
        req.end_with("x").await.unwrap();
        assert_eq!(req.response().await.unwrap().status_code, 200);

        // "plain" is a data file, so it cannot become a directory
        let mut req = client.put("plain/child", Headers::new());
        let mut resp = req.response().await.unwrap();
        assert_eq!(resp.status_code, 403);
        let body = resp.read_body().await.unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("<Code>AccessDenied</Code>"));
    }

    #[tokio::test]
    async fn test_empty_key_outcomes() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());

        assert_eq!(client.put("", Headers::new()).response().await.unwrap().status_code, 403);
        assert_eq!(client.get("").response().await.unwrap().status_code, 404);
        assert_eq!(client.head("").response().await.unwrap().status_code, 404);
        assert_eq!(client.del("").response().await.unwrap().status_code, 204);
    }

    #[tokio::test]
    async fn test_corrupt_metadata_is_internal_error() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());
        let path = client.bucket_path().join("broken");
        std::fs::write(&path, b"data").unwrap();
        std::fs::write(meta_path(&path), b"{not json").unwrap();

        let mut resp = client.get("broken").response().await.unwrap();
        assert_eq!(resp.status_code, 500);
        let body = resp.read_body().await.unwrap();
        assert!(std::str::from_utf8(&body).unwrap().contains("<Code>InternalError</Code>"));

        assert_eq!(client.head("broken").response().await.unwrap().status_code, 500);
    }

    #[tokio::test]
    async fn test_metadata_without_data_is_no_such_key() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());
        let path = client.bucket_path().join("orphan");
        std::fs::write(meta_path(&path), br#"{"content-length":"3"}"#).unwrap();

        assert_eq!(client.get("orphan").response().await.unwrap().status_code, 404);
        // head only consults the record
        assert_eq!(client.head("orphan").response().await.unwrap().status_code, 200);
    }

    #[tokio::test]
    async fn test_delete_directory_key_is_internal_error() {
        let dir = tempdir().unwrap();
        let client = client(dir.path());
        std::fs::create_dir(client.bucket_path().join("d")).unwrap();

        let resp = client.del("d").response().await.unwrap();
        assert_eq!(resp.status_code, 500);
    }
}
