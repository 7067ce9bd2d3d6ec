use std::io;
use std::path::Path;

use tokio::fs;

/// True for errors meaning "nothing is stored there": the file is absent, a
/// path component is a regular file, or the name is too long to ever have
/// been created.
pub fn is_missing(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory | io::ErrorKind::InvalidFilename
    )
}

/// Unlinks `path`. Returns whether a file was removed; absence is not an error.
pub async fn remove_if_present(path: &Path) -> io::Result<bool> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if is_missing(&e) => Ok(false),
        Err(e) => Err(e),
    }
}
