//! Audio error types (thiserror-based).

use capline_common::MediaError;
use thiserror::Error;

/// Audio renderer error type.
#[derive(Error, Debug)]
pub enum AudioError {
    /// No output device matched the requested id.
    #[error("Audio device not found: {0}")]
    DeviceNotFound(String),

    /// The renderer was used before `open`.
    #[error("Audio renderer is not open")]
    NotOpen,

    /// Sample rate or channel count the renderer cannot use.
    #[error("Invalid audio configuration: {0}")]
    InvalidConfig(String),

    /// Audio output stream build error.
    #[error("Failed to build audio stream: {0}")]
    StreamBuild(String),

    /// Audio output stream play/pause error.
    #[error("Failed to control audio stream: {0}")]
    StreamControl(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<AudioError> for MediaError {
    fn from(err: AudioError) -> Self {
        match err {
            AudioError::NotOpen => MediaError::NotReady(err.to_string()),
            AudioError::DeviceNotFound(_) | AudioError::InvalidConfig(_) => {
                MediaError::InvalidArgument(err.to_string())
            }
            AudioError::Io(io) => MediaError::Io(io),
            other => MediaError::Io(std::io::Error::other(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = AudioError::DeviceNotFound("hw:9".to_string());
        assert_eq!(err.to_string(), "Audio device not found: hw:9");
    }

    #[test]
    fn converts_to_media_error() {
        assert!(matches!(
            MediaError::from(AudioError::NotOpen),
            MediaError::NotReady(_)
        ));
        assert!(matches!(
            MediaError::from(AudioError::InvalidConfig("0 channels".into())),
            MediaError::InvalidArgument(_)
        ));
        assert!(matches!(
            MediaError::from(AudioError::StreamBuild("busy".into())),
            MediaError::Io(_)
        ));
    }

    #[test]
    fn error_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "device gone");
        let audio_err: AudioError = io_err.into();
        assert!(matches!(audio_err, AudioError::Io(_)));
    }
}
