use std::path::PathBuf;
use thiserror::Error;

/// Result type for reconstruction setup and I/O.
pub type Result<T> = std::result::Result<T, PewrError>;

/// Errors surfaced before or between iterations. The iteration loop itself
/// cannot fail: every buffer is preallocated and every index is in range.
#[derive(Debug, Error)]
pub enum PewrError {
    #[error("config: {0}")]
    Config(String),

    #[error("{}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("mean intensity across planes is zero, cannot normalise")]
    DegenerateIntensity,

    #[error("installing signal handler: {0}")]
    Signal(String),
}

impl PewrError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PewrError::Io {
            path: path.into(),
            source,
        }
    }
}
