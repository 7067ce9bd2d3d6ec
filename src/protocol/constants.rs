//! Fixed values of the emulated object-storage protocol

/// Value of the `server` header stamped on every response
pub const SERVER_NAME: &str = "LocalBucket";

/// HTTP version reported on synthetic responses
pub const HTTP_VERSION: &str = "1.1";

/// Suffix appended to an object's data path to locate its metadata side-file
pub const METADATA_SUFFIX: &str = ".meta";

/// Media type of structured error bodies
pub const XML_CONTENT_TYPE: &str = "application/xml";

/// Header names, lower-cased as they are stored and emitted
pub const HEADER_DATE: &str = "date";
pub const HEADER_LAST_MODIFIED: &str = "last-modified";
pub const HEADER_SERVER: &str = "server";
pub const HEADER_ETAG: &str = "etag";
pub const HEADER_CONTENT_LENGTH: &str = "content-length";
pub const HEADER_CONTENT_TYPE: &str = "content-type";
pub const HEADER_CONNECTION: &str = "connection";

/// Status codes used by the operation handlers
pub const STATUS_OK: u16 = 200;
pub const STATUS_NO_CONTENT: u16 = 204;
pub const STATUS_FORBIDDEN: u16 = 403;
pub const STATUS_NOT_FOUND: u16 = 404;
pub const STATUS_INTERNAL_ERROR: u16 = 500;

/// Read size for streamed GET bodies
pub const DEFAULT_READ_CHUNK: usize = 64 * 1024; // 64KB

/// Chunks buffered between a PUT caller and the file writer before `write` waits
pub const DEFAULT_SINK_CAPACITY: usize = 16;

/// Data events buffered ahead of a GET body consumer
pub const BODY_CHANNEL_CAPACITY: usize = 8;
