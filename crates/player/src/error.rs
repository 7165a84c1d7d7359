//! Player error types.

use capline_audio::AudioError;
use capline_common::MediaError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlayerError {
    #[error("Source carries neither audio nor video")]
    NoStreams,

    #[error("Invalid playback speed {0}")]
    InvalidSpeed(f64),

    #[error("Live sources cannot seek")]
    LiveSeek,

    #[error("Player is stopped")]
    Stopped,

    #[error("Audio output: {0}")]
    Audio(#[from] AudioError),

    #[error(transparent)]
    Media(#[from] MediaError),
}

pub type PlayerResult<T> = Result<T, PlayerError>;

impl From<PlayerError> for MediaError {
    fn from(err: PlayerError) -> Self {
        match err {
            PlayerError::Media(e) => e,
            PlayerError::Audio(e) => e.into(),
            PlayerError::Stopped => MediaError::Stopped,
            other => MediaError::InvalidArgument(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_media_taxonomy() {
        assert_eq!(MediaError::from(PlayerError::Stopped).code(), -8);
        assert_eq!(MediaError::from(PlayerError::LiveSeek).code(), -9);
        let err = MediaError::from(PlayerError::Audio(AudioError::NotOpen));
        assert!(matches!(err, MediaError::NotReady(_)));
    }
}
