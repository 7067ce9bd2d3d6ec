use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::body::{BufferedBody, ResponseBody};
use crate::protocol::constants::{
    HEADER_CONTENT_LENGTH, HEADER_CONTENT_TYPE, HEADER_DATE, HEADER_SERVER, HTTP_VERSION,
    SERVER_NAME, XML_CONTENT_TYPE,
};
use crate::protocol::error::StorageError;
use crate::utils::time::http_date_now;

/// Lower-cased header names to values.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug)]
pub struct Response {
    pub status_code: u16,
    pub http_version: &'static str,
    pub headers: Headers,
    pub body: Box<dyn ResponseBody>,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub async fn read_body(&mut self) -> Result<Bytes, StorageError> {
        self.body.read_to_end().await
    }
}

/// Signals delivered on a request handle.
#[derive(Debug)]
pub enum RequestEvent {
    /// The data file is open; the caller may start sending the body.
    Continue,
    /// The terminal response. Emitted exactly once.
    Response(Response),
    /// A failure that happened after the terminal response was emitted.
    Error(StorageError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RequestPhase {
    Pending = 0,
    Responded = 1,
    Aborted = 2,
}

impl RequestPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => RequestPhase::Pending,
            1 => RequestPhase::Responded,
            _ => RequestPhase::Aborted,
        }
    }
}

/// Lifecycle of one request, shared by the caller's handle and the handler
/// task. Only `Pending` can move, and it moves at most once.
#[derive(Debug)]
pub struct RequestState {
    phase: AtomicU8,
}

impl RequestState {
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(RequestPhase::Pending as u8),
        }
    }

    pub fn phase(&self) -> RequestPhase {
        RequestPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    pub fn is_pending(&self) -> bool {
        self.phase() == RequestPhase::Pending
    }

    /// Moves `Pending` to `to`; returns the phase that blocked the move otherwise.
    fn settle(&self, to: RequestPhase) -> Result<(), RequestPhase> {
        self.phase
            .compare_exchange(
                RequestPhase::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .map(|_| ())
            .map_err(RequestPhase::from_u8)
    }

    /// Returns false when the request had already responded or been aborted.
    pub fn abort(&self) -> bool {
        self.settle(RequestPhase::Aborted).is_ok()
    }
}

impl Default for RequestState {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of an operation, ready to be emitted as a response.
#[derive(Debug)]
pub struct Emission {
    code: u16,
    headers: Headers,
    body: Option<Box<dyn ResponseBody>>,
    error: Option<StorageError>,
}

impl Emission {
    pub fn new(code: u16) -> Self {
        Self {
            code,
            headers: Headers::new(),
            body: None,
            error: None,
        }
    }

    /// A failure response; the code comes from the error kind and is always
    /// 4xx or 5xx.
    pub fn error(err: StorageError) -> Self {
        Self {
            code: err.status_code(),
            headers: Headers::new(),
            body: None,
            error: Some(err),
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers.extend(headers);
        self
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_body(mut self, body: Box<dyn ResponseBody>) -> Self {
        self.body = Some(body);
        self
    }
}

/// Handler-side half of a request: emits `Continue` and the single terminal
/// response onto the caller's event channel.
#[derive(Debug, Clone)]
pub struct ResponseEmitter {
    key: String,
    events: mpsc::UnboundedSender<RequestEvent>,
    state: Arc<RequestState>,
}

impl ResponseEmitter {
    pub fn channel(key: &str) -> (Self, mpsc::UnboundedReceiver<RequestEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let emitter = Self {
            key: key.to_string(),
            events,
            state: Arc::new(RequestState::new()),
        };
        (emitter, rx)
    }

    pub fn state(&self) -> &Arc<RequestState> {
        &self.state
    }

    /// Tells the caller the request body can be sent. Ignored once settled.
    pub fn signal_continue(&self) -> bool {
        if !self.state.is_pending() {
            return false;
        }
        self.send(RequestEvent::Continue)
    }

    /// Emits the terminal response. Returns false, leaving the request as it
    /// was, when a response already went out or the caller aborted.
    pub fn emit(&self, emission: Emission) -> bool {
        let Emission {
            code,
            mut headers,
            body,
            error,
        } = emission;

        match self.state.settle(RequestPhase::Responded) {
            Ok(()) => {}
            Err(RequestPhase::Aborted) => {
                debug!("Request aborted, dropping {} response: key='{}'", code, self.key);
                return false;
            }
            Err(_) => {
                warn!(
                    "Response already emitted, dropping second {} response: key='{}'",
                    code, self.key
                );
                return false;
            }
        }

        headers.insert(HEADER_DATE.to_string(), http_date_now());
        headers.insert(HEADER_SERVER.to_string(), SERVER_NAME.to_string());

        let body: Box<dyn ResponseBody> = match (error, body) {
            (Some(err), _) => {
                debug_assert!((400..600).contains(&code));
                let payload = err.to_xml();
                headers.insert(HEADER_CONTENT_TYPE.to_string(), XML_CONTENT_TYPE.to_string());
                headers.insert(HEADER_CONTENT_LENGTH.to_string(), payload.len().to_string());
                Box::new(BufferedBody::new(Bytes::from(payload)))
            }
            (None, Some(body)) => body,
            (None, None) => Box::new(BufferedBody::empty()),
        };

        debug!("Emitting {} response: key='{}'", code, self.key);
        self.send(RequestEvent::Response(Response {
            status_code: code,
            http_version: HTTP_VERSION,
            headers,
            body,
        }))
    }

    /// Reports a failure: as an error response while the request is pending,
    /// as a stream-level error after it has responded, and not at all once
    /// aborted.
    pub fn fail(&self, err: StorageError) {
        match self.state.phase() {
            RequestPhase::Pending => {
                self.emit(Emission::error(err));
            }
            RequestPhase::Responded => {
                self.send(RequestEvent::Error(err));
            }
            RequestPhase::Aborted => {
                debug!("Request aborted, dropping failure for key '{}': {}", self.key, err);
            }
        }
    }

    fn send(&self, event: RequestEvent) -> bool {
        if self.events.send(event).is_err() {
            debug!("Request handle dropped before delivery: key='{}'", self.key);
            return false;
        }
        true
    }
}
