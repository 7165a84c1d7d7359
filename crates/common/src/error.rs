//! Central error type for the media engine (thiserror-based).
//!
//! Setup-time failures (`open`, `create_filter_graph`, device lookup) come
//! back synchronously as [`MediaError`]. Steady-state encode failures are
//! logged by the stage that hit them and never cross a thread boundary.

use thiserror::Error;

use crate::frame::MediaKind;

/// Top-level engine error.
#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Malformed graph description: {0}")]
    GraphParse(String),

    #[error("Graph references {0} but no producer provides it")]
    NoProducer(MediaKind),

    #[error("Hardware device type not supported on this platform: {0}")]
    DeviceUnsupported(String),

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Failed to open codec '{codec}': {reason}")]
    CodecOpen { codec: String, reason: String },

    #[error("Failed to open muxer for '{path}': {reason}")]
    MuxerOpen { path: String, reason: String },

    #[error("Already running")]
    AlreadyRunning,

    #[error("Stage is stopped")]
    Stopped,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Encode error ({kind}): {reason}")]
    Encode { kind: MediaKind, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias used across the engine.
pub type MediaResult<T> = Result<T, MediaError>;

impl MediaError {
    /// Small negative status code for callers that speak integer statuses.
    /// Success is `0`.
    pub fn code(&self) -> i32 {
        match self {
            Self::GraphParse(_) => -1,
            Self::NoProducer(_) => -2,
            Self::DeviceUnsupported(_) => -3,
            Self::NotReady(_) => -4,
            Self::CodecOpen { .. } => -5,
            Self::MuxerOpen { .. } => -6,
            Self::AlreadyRunning => -7,
            Self::Stopped => -8,
            Self::InvalidArgument(_) => -9,
            Self::Encode { .. } => -10,
            Self::Io(_) => -11,
        }
    }

    pub fn graph_parse(msg: impl Into<String>) -> Self {
        Self::GraphParse(msg.into())
    }

    pub fn codec_open(codec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CodecOpen {
            codec: codec.into(),
            reason: reason.into(),
        }
    }
}

/// Collapse a result into an integer status.
pub fn status<T>(result: &MediaResult<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(e) => e.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_messages() {
        let err = MediaError::NoProducer(MediaKind::Audio);
        assert_eq!(
            err.to_string(),
            "Graph references audio but no producer provides it"
        );
        let err = MediaError::codec_open("h264", "unknown codec");
        assert!(err.to_string().contains("h264"));
    }

    #[test]
    fn codes_are_negative_and_distinct() {
        let errors = [
            MediaError::graph_parse("x"),
            MediaError::NoProducer(MediaKind::Video),
            MediaError::DeviceUnsupported("cuda".into()),
            MediaError::NotReady("frames".into()),
            MediaError::codec_open("c", "r"),
            MediaError::MuxerOpen {
                path: "p".into(),
                reason: "r".into(),
            },
            MediaError::AlreadyRunning,
            MediaError::Stopped,
            MediaError::InvalidArgument("a".into()),
        ];
        let mut codes: Vec<i32> = errors.iter().map(MediaError::code).collect();
        assert!(codes.iter().all(|c| *c < 0));
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errors.len());
    }

    #[test]
    fn status_of_results() {
        let ok: MediaResult<()> = Ok(());
        assert_eq!(status(&ok), 0);
        let err: MediaResult<()> = Err(MediaError::AlreadyRunning);
        assert_eq!(status(&err), -7);
    }

    #[test]
    fn io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: MediaError = io.into();
        assert!(matches!(err, MediaError::Io(_)));
    }
}
