pub mod body;
pub mod constants;
pub mod error;
pub mod response;
pub mod sink;

pub use body::{BodyEvent, BufferedBody, FileBody, ResponseBody};
pub use error::StorageError;
pub use response::{Emission, Headers, RequestEvent, RequestPhase, RequestState, Response, ResponseEmitter};
pub use sink::{FileSink, NullSink, ObjectDigest, ObjectWriter, RequestSink, SinkMessage};
