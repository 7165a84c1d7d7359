//! Player configuration and state.

use serde::{Deserialize, Serialize};

/// How a source is played back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayerOptions {
    /// Present frames as they arrive and never rewind at the end. Implied
    /// by a live source.
    pub live: bool,
    pub speed: f64,
    /// Output gain in `[0.0, 1.0]`.
    pub volume: f32,
    pub muted: bool,
    /// Audio output device; `None` picks the default.
    pub audio_device: Option<String>,
    /// Frames the audio device pulls per period.
    pub period_frames: usize,
    /// Capacity of the source → player frame channel.
    pub channel_capacity: usize,
}

impl Default for PlayerOptions {
    fn default() -> Self {
        Self {
            live: false,
            speed: 1.0,
            volume: 1.0,
            muted: false,
            audio_device: None,
            period_frames: 1024,
            channel_capacity: 16,
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerState {
    /// Opened, not started yet.
    Idle,
    Playing,
    Paused,
    Stopped,
}

impl PlayerState {
    pub fn is_active(self) -> bool {
        matches!(self, Self::Playing | Self::Paused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let opts: PlayerOptions = serde_json::from_str(r#"{"speed":1.5,"muted":true}"#).unwrap();
        assert_eq!(opts.speed, 1.5);
        assert!(opts.muted);
        assert_eq!(opts.volume, 1.0);
        assert_eq!(opts.period_frames, 1024);
    }

    #[test]
    fn state_names() {
        assert_eq!(serde_json::to_string(&PlayerState::Paused).unwrap(), "\"paused\"");
        assert!(PlayerState::Playing.is_active());
        assert!(!PlayerState::Stopped.is_active());
    }
}
