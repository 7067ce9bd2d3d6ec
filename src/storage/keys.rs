use std::io;
use std::path::{Component, Path, PathBuf};

use tokio::fs;
use tracing::debug;

use crate::protocol::constants::METADATA_SUFFIX;

/// Encoded form of an empty interior segment (`a//b`, `dir/`). A real segment
/// never contains `/`, so it can never encode to this.
const EMPTY_SEGMENT: &str = "%2F";

/// Maps object keys to paths under a bucket directory.
#[derive(Debug, Clone)]
pub struct KeyEncoder {
    root: PathBuf,
}

impl KeyEncoder {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves `key` to its data path. With `for_write`, every missing
    /// intermediate directory is created; concurrent creation is tolerated.
    pub async fn resolve(&self, key: &str, for_write: bool) -> io::Result<PathBuf> {
        let segments = encode_key(key)?;

        if for_write {
            let mut dir = self.root.clone();
            for segment in &segments[..segments.len() - 1] {
                dir.push(segment);
                match fs::create_dir(&dir).await {
                    Ok(()) => debug!("Created directory {:?}", dir),
                    Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                    Err(e) => return Err(e),
                }
            }
        }

        let mut path = self.root.clone();
        path.extend(&segments);
        Ok(path)
    }

    /// Recovers the key stored at `path`, which may be absolute under the root
    /// or already relative to it.
    pub fn decode(&self, path: &Path) -> io::Result<String> {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        let mut segments = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(raw) => {
                    let raw = raw.to_str().ok_or_else(|| {
                        io::Error::new(io::ErrorKind::InvalidData, "path is not valid UTF-8")
                    })?;
                    segments.push(decode_segment(raw)?);
                }
                other => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        format!("unexpected path component {:?}", other),
                    ));
                }
            }
        }
        if segments.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty path"));
        }
        Ok(segments.join("/"))
    }
}

/// Splits a key into encoded path segments. A single leading `/` is ignored.
pub fn encode_key(key: &str) -> io::Result<Vec<String>> {
    let trimmed = key.strip_prefix('/').unwrap_or(key);
    if key.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "empty object key"));
    }
    Ok(trimmed.split('/').map(encode_segment).collect())
}

/// Percent-encodes one segment with the URI-component unreserved set, which
/// also escapes `! ' ( ) *`. Dot-segments and segments ending in the metadata
/// suffix get their dots escaped so they cannot traverse or shadow a side-file.
pub fn encode_segment(segment: &str) -> String {
    match segment {
        "" => EMPTY_SEGMENT.to_string(),
        "." => "%2E".to_string(),
        ".." => "%2E%2E".to_string(),
        _ => {
            let mut encoded = urlencoding::encode(segment).into_owned();
            if encoded.ends_with(METADATA_SUFFIX) {
                let at = encoded.len() - METADATA_SUFFIX.len();
                encoded.replace_range(at..at + 1, "%2E");
            }
            encoded
        }
    }
}

pub fn decode_segment(encoded: &str) -> io::Result<String> {
    if encoded == EMPTY_SEGMENT {
        return Ok(String::new());
    }
    urlencoding::decode(encoded)
        .map(|s| s.into_owned())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}
