use std::collections::BTreeMap;
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::protocol::constants::{HEADER_DATE, HEADER_LAST_MODIFIED, METADATA_SUFFIX};
use crate::storage::files::is_missing;
use crate::utils::time::http_date_now;

/// Header map persisted next to an object's data file. Names are always
/// lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectMetadata {
    headers: BTreeMap<String, String>,
}

impl ObjectMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a record from caller headers, lower-casing every name.
    pub fn from_headers<I, K, V>(headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut meta = Self::new();
        for (name, value) in headers {
            meta.insert(name.as_ref(), value);
        }
        meta
    }

    pub fn insert(&mut self, name: &str, value: impl Into<String>) {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.headers.remove(&name.to_ascii_lowercase())
    }

    pub fn into_headers(self) -> BTreeMap<String, String> {
        self.headers
    }
}

#[derive(Debug)]
pub enum MetadataError {
    /// The side-file does not exist.
    NotFound,
    Io(io::Error),
    Malformed(serde_json::Error),
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::NotFound => write!(f, "metadata record not found"),
            MetadataError::Io(e) => write!(f, "metadata i/o failed: {}", e),
            MetadataError::Malformed(e) => write!(f, "metadata record is malformed: {}", e),
        }
    }
}

impl std::error::Error for MetadataError {}

impl From<io::Error> for MetadataError {
    fn from(e: io::Error) -> Self {
        if is_missing(&e) {
            MetadataError::NotFound
        } else {
            MetadataError::Io(e)
        }
    }
}

/// Location of the side-file for the data file at `data_path`.
pub fn meta_path(data_path: &Path) -> PathBuf {
    let mut raw = OsString::from(data_path.as_os_str());
    raw.push(METADATA_SUFFIX);
    PathBuf::from(raw)
}

pub async fn write_metadata(data_path: &Path, meta: &ObjectMetadata) -> Result<(), MetadataError> {
    let json = serde_json::to_vec(meta).map_err(MetadataError::Malformed)?;
    fs::write(meta_path(data_path), json).await?;
    Ok(())
}

/// Reads the record for `data_path`. The stored `date` (the write time) is
/// reported as `last-modified`, and `date` becomes the time of this read.
pub async fn read_metadata(data_path: &Path) -> Result<ObjectMetadata, MetadataError> {
    let raw = fs::read(meta_path(data_path)).await?;
    let mut meta: ObjectMetadata = serde_json::from_slice(&raw).map_err(MetadataError::Malformed)?;

    if let Some(written) = meta.remove(HEADER_DATE) {
        meta.insert(HEADER_LAST_MODIFIED, written);
    }
    meta.insert(HEADER_DATE, http_date_now());
    Ok(meta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_names_are_lower_cased() {
        let meta = ObjectMetadata::from_headers([("Content-Type", "text/plain"), ("X-Amz-Meta-Foo", "bar")]);
        assert_eq!(meta.get("content-type"), Some("text/plain"));
        assert_eq!(meta.get("CONTENT-TYPE"), Some("text/plain"));
        assert!(meta.into_headers().contains_key("x-amz-meta-foo"));
    }

    #[test]
    fn test_meta_path_appends_suffix() {
        assert_eq!(
            meta_path(Path::new("/b/a/file.txt")),
            PathBuf::from("/b/a/file.txt.meta")
        );
    }

    #[tokio::test]
    async fn test_read_moves_date_to_last_modified() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("obj");

        let mut meta = ObjectMetadata::new();
        meta.insert("Date", "Tue, 15 Nov 1994 08:12:31 GMT");
        meta.insert("content-length", "5");
        write_metadata(&data, &meta).await.unwrap();

        let read = read_metadata(&data).await.unwrap();
        assert_eq!(read.get("last-modified"), Some("Tue, 15 Nov 1994 08:12:31 GMT"));
        assert_ne!(read.get("date"), Some("Tue, 15 Nov 1994 08:12:31 GMT"));
        assert_eq!(read.get("content-length"), Some("5"));

        // the stored record itself is untouched
        let again = read_metadata(&data).await.unwrap();
        assert_eq!(again.get("last-modified"), Some("Tue, 15 Nov 1994 08:12:31 GMT"));
    }

    #[tokio::test]
    async fn test_missing_record_is_not_found() {
        let dir = tempdir().unwrap();
        let err = read_metadata(&dir.path().join("absent")).await.unwrap_err();
        assert!(matches!(err, MetadataError::NotFound));
    }

    #[tokio::test]
    async fn test_garbage_record_is_malformed() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("obj");
        std::fs::write(meta_path(&data), b"not json").unwrap();

        let err = read_metadata(&data).await.unwrap_err();
        assert!(matches!(err, MetadataError::Malformed(_)));
    }

    #[tokio::test]
    async fn test_write_over_directory_is_io_failure() {
        let dir = tempdir().unwrap();
        let data = dir.path().join("obj");
        std::fs::create_dir(meta_path(&data)).unwrap();

        let err = write_metadata(&data, &ObjectMetadata::new()).await.unwrap_err();
        assert!(matches!(err, MetadataError::Io(_)));
    }
}
