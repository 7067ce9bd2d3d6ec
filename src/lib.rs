//! Filesystem-backed stand-in for an object-storage bucket.
//!
//! [`Client`] exposes PUT, GET, HEAD and DELETE on keys of one bucket. Each
//! call returns a [`Request`] handle that settles with a single synthetic
//! [`Response`] carrying the status codes, headers and error bodies of the
//! remote service, while objects live as plain files plus a `.meta` record.

pub mod client;
pub mod config;
pub mod protocol;
pub mod storage;
pub mod utils;

pub use client::{Client, Request};
pub use config::ClientConfig;
pub use protocol::{BodyEvent, Headers, RequestEvent, Response, ResponseBody, StorageError};
