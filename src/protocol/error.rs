use std::fmt;
use std::io;

use crate::protocol::constants::{STATUS_FORBIDDEN, STATUS_INTERNAL_ERROR, STATUS_NOT_FOUND};
use crate::storage::files::is_missing;

/// Failure kinds of the emulated service.
///
/// Every filesystem error is translated into one of these before it leaves an
/// operation handler; each maps to a fixed status code and symbolic error code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The key has no metadata record.
    NoSuchKey { key: String },
    /// The data file could not be opened or written.
    AccessDenied { key: String, message: String },
    /// Any other unlink, read or metadata failure.
    InternalError { key: String, message: String },
}

impl StorageError {
    pub fn no_such_key(key: impl Into<String>) -> Self {
        StorageError::NoSuchKey { key: key.into() }
    }

    pub fn access_denied(key: impl Into<String>, err: impl fmt::Display) -> Self {
        StorageError::AccessDenied {
            key: key.into(),
            message: err.to_string(),
        }
    }

    pub fn internal(key: impl Into<String>, err: impl fmt::Display) -> Self {
        StorageError::InternalError {
            key: key.into(),
            message: err.to_string(),
        }
    }

    /// Maps a read-side I/O failure: a missing file is `NoSuchKey`, anything else
    /// is `InternalError`.
    pub fn from_read_io(key: impl Into<String>, err: &io::Error) -> Self {
        if is_missing(err) {
            Self::no_such_key(key)
        } else {
            Self::internal(key, err)
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            StorageError::NoSuchKey { .. } => STATUS_NOT_FOUND,
            StorageError::AccessDenied { .. } => STATUS_FORBIDDEN,
            StorageError::InternalError { .. } => STATUS_INTERNAL_ERROR,
        }
    }

    /// Symbolic error code carried in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::NoSuchKey { .. } => "NoSuchKey",
            StorageError::AccessDenied { .. } => "AccessDenied",
            StorageError::InternalError { .. } => "InternalError",
        }
    }

    pub fn key(&self) -> &str {
        match self {
            StorageError::NoSuchKey { key }
            | StorageError::AccessDenied { key, .. }
            | StorageError::InternalError { key, .. } => key,
        }
    }

    pub fn message(&self) -> String {
        match self {
            StorageError::NoSuchKey { .. } => "The specified key does not exist.".to_string(),
            StorageError::AccessDenied { message, .. } => format!("Access Denied: {}", message),
            StorageError::InternalError { message, .. } => {
                format!("We encountered an internal error: {}", message)
            }
        }
    }

    /// Serialized error payload sent as the response body.
    pub fn to_xml(&self) -> String {
        format!(
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n<Error><Code>{}</Code><Message>{}</Message><Key>{}</Key></Error>",
            self.code(),
            xml_escape(&self.message()),
            xml_escape(self.key()),
        )
    }
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code(), self.status_code(), self.message())
    }
}

impl std::error::Error for StorageError {}

fn xml_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}
