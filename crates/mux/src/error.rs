//! Muxer error types.

use capline_common::MediaError;
use thiserror::Error;

/// Errors that can occur while writing a container.
#[derive(Error, Debug)]
pub enum MuxError {
    /// I/O error during file write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid muxer configuration.
    #[error("Invalid muxer config: {0}")]
    InvalidConfig(String),

    /// Unknown track number, or a track added after the header was written.
    #[error("Track error: {0}")]
    TrackError(String),

    /// Write after `finish`.
    #[error("Muxer already finalized")]
    Finalized,
}

/// Convenience Result type for mux operations.
pub type MuxResult<T> = Result<T, MuxError>;

impl MuxError {
    /// Setup-time failure for `path`, as reported by `Encoder::open`.
    pub fn into_open_error(self, path: &std::path::Path) -> MediaError {
        MediaError::MuxerOpen {
            path: path.display().to_string(),
            reason: self.to_string(),
        }
    }
}

impl From<MuxError> for MediaError {
    fn from(err: MuxError) -> Self {
        match err {
            MuxError::Io(io) => MediaError::Io(io),
            MuxError::Finalized => MediaError::Stopped,
            other => MediaError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn mux_error_display() {
        let err = MuxError::InvalidConfig("no tracks".into());
        assert_eq!(err.to_string(), "Invalid muxer config: no tracks");
        let err = MuxError::TrackError("track 5 not found".into());
        assert_eq!(err.to_string(), "Track error: track 5 not found");
    }

    #[test]
    fn open_error_carries_path() {
        let err = MuxError::InvalidConfig("unknown extension".into())
            .into_open_error(Path::new("/tmp/out.avi"));
        match err {
            MediaError::MuxerOpen { path, reason } => {
                assert_eq!(path, "/tmp/out.avi");
                assert!(reason.contains("unknown extension"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn converts_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err: MediaError = MuxError::from(io_err).into();
        assert!(matches!(err, MediaError::Io(_)));
    }
}
