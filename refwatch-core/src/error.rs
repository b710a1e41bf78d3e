use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("watch backend error: {0}")]
    Watch(#[from] notify::Error),

    #[error("project root does not exist: {0}")]
    MissingRoot(PathBuf),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to rewrite {path}")]
    Rewrite {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// How many times a transient read is retried before giving up.
pub const TRANSIENT_RETRIES: u32 = 10;

/// Delay between transient-read retries.
pub const RETRY_DELAY: Duration = Duration::from_millis(50);

/// Whether an i/o error is worth retrying.
///
/// Editors hold exclusive locks while saving; on Windows a sharing violation
/// surfaces as `PermissionDenied`.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
            | io::ErrorKind::TimedOut
            | io::ErrorKind::PermissionDenied
    )
}

/// Run `op`, retrying transient failures up to [`TRANSIENT_RETRIES`] times.
pub fn retry_io<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(&err) && attempt < TRANSIENT_RETRIES => {
                attempt += 1;
                std::thread::sleep(RETRY_DELAY);
            },
            Err(err) => return Err(err),
        }
    }
}
