//! Configuration structs for the dispatcher and encoder.

use std::collections::BTreeMap;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MediaError, MediaResult};
use crate::hw::DeviceType;

/// Opaque key/value options handed to codec and container open calls.
pub type Options = BTreeMap<String, String>;

/// Parse an option value, falling back to `default` when absent.
pub fn option_or<T: FromStr>(options: &Options, key: &str, default: T) -> MediaResult<T> {
    match options.get(key) {
        None => Ok(default),
        Some(raw) => raw.trim().parse::<T>().map_err(|_| {
            MediaError::InvalidArgument(format!("option '{key}' has invalid value '{raw}'"))
        }),
    }
}

/// Dispatcher/processing-graph configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Video graph description (empty = pass-through).
    pub video_filters: String,
    /// Audio graph description (empty = pass-through).
    pub audio_filters: String,
    /// Hardware device to bind into the graph.
    pub hwaccel: Option<DeviceType>,
    /// Capacity of the decode → dispatch frame channel.
    pub channel_capacity: usize,
    /// Pump back-off when the consumer is full or nothing is available.
    pub poll_interval_ms: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            video_filters: String::new(),
            audio_filters: String::new(),
            hwaccel: None,
            channel_capacity: 16,
            poll_interval_ms: 5,
        }
    }
}

/// Encoder configuration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Video codec name; `None` disables video.
    pub video_codec: Option<String>,
    /// Audio codec name; `None` disables audio.
    pub audio_codec: Option<String>,
    /// Emit a constant frame rate, repeating frames across gaps.
    pub constant_frame_rate: bool,
    /// Codec/container options (`framerate`, `frame_size`, `sample_rate`, ...).
    pub options: Options,
    pub video_buffer: usize,
    pub audio_buffer: usize,
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            video_codec: Some("rawvideo".to_string()),
            audio_codec: Some("pcm_s16le".to_string()),
            constant_frame_rate: true,
            options: Options::new(),
            video_buffer: 8,
            audio_buffer: 32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_defaults_match_buffer_sizes() {
        let cfg = EncoderConfig::default();
        assert_eq!(cfg.video_buffer, 8);
        assert_eq!(cfg.audio_buffer, 32);
        assert!(cfg.constant_frame_rate);
    }

    #[test]
    fn option_parsing() {
        let mut opts = Options::new();
        opts.insert("frame_size".into(), " 512 ".into());
        opts.insert("bad".into(), "x".into());
        assert_eq!(option_or(&opts, "frame_size", 1024usize).unwrap(), 512);
        assert_eq!(option_or(&opts, "missing", 7u32).unwrap(), 7);
        assert!(option_or::<u32>(&opts, "bad", 0).is_err());
    }

    #[test]
    fn pipeline_config_partial_json() {
        let cfg: PipelineConfig =
            serde_json::from_str(r#"{"video_filters":"hflip","hwaccel":"vaapi"}"#).unwrap();
        assert_eq!(cfg.video_filters, "hflip");
        assert_eq!(cfg.hwaccel, Some(DeviceType::Vaapi));
        assert_eq!(cfg.channel_capacity, 16);
    }

    #[test]
    fn serde_roundtrip() {
        let mut cfg = EncoderConfig::default();
        cfg.options.insert("framerate".into(), "30".into());
        let json = serde_json::to_string(&cfg).unwrap();
        let back: EncoderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }
}
