//! Encoder error types.
//!
//! Open-time failures are converted to [`MediaError`] and returned to the
//! caller. Errors raised by the worker while encoding stay inside the crate:
//! they are logged and close the affected media kind early.

use capline_common::{MediaError, MediaKind};
use capline_mux::MuxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("Unknown {kind} codec '{name}'")]
    UnknownCodec { kind: MediaKind, name: String },

    #[error("Codec '{codec}' cannot be opened: {reason}")]
    Unsupported { codec: &'static str, reason: String },

    #[error("Frame does not match the opened stream: {0}")]
    FormatMismatch(String),

    #[error("Hardware surface cannot be read: {0}")]
    Hardware(String),

    #[error("Container error: {0}")]
    Mux(#[from] MuxError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EncodeError {
    pub fn mismatch(msg: impl Into<String>) -> Self {
        Self::FormatMismatch(msg.into())
    }

    /// Report a mid-stream failure for `kind`.
    pub fn into_media(self, kind: MediaKind) -> MediaError {
        match self {
            Self::Mux(e) => e.into(),
            Self::Io(e) => MediaError::Io(e),
            other => MediaError::Encode {
                kind,
                reason: other.to_string(),
            },
        }
    }
}

impl From<EncodeError> for MediaError {
    fn from(err: EncodeError) -> Self {
        match err {
            EncodeError::UnknownCodec { name, .. } => {
                MediaError::codec_open(name, "no encoder with that name")
            }
            EncodeError::Unsupported { codec, reason } => MediaError::codec_open(codec, reason),
            EncodeError::Mux(e) => e.into(),
            EncodeError::Io(e) => MediaError::Io(e),
            other => MediaError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_codec_is_a_codec_open_error() {
        let err: MediaError = EncodeError::UnknownCodec {
            kind: MediaKind::Audio,
            name: "aac".into(),
        }
        .into();
        assert!(matches!(err, MediaError::CodecOpen { ref codec, .. } if codec == "aac"));
    }

    #[test]
    fn mid_stream_errors_keep_their_kind() {
        let err = EncodeError::mismatch("640x480 frame, stream is 320x240").into_media(MediaKind::Video);
        assert!(matches!(err, MediaError::Encode { kind: MediaKind::Video, .. }));
        assert_eq!(err.code(), -10);
    }
}
