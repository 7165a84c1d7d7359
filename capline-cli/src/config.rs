//! Optional JSON configuration file. Command-line flags override it.

use std::path::Path;

use anyhow::{Context, Result};
use capline_common::{EncoderConfig, PipelineConfig};
use capline_decoder::GeneratorConfig;
use capline_player::PlayerOptions;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub pipeline: PipelineConfig,
    pub encoder: EncoderConfig,
    pub player: PlayerOptions,
    pub generator: GeneratorConfig,
}

impl CliConfig {
    /// Defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_are_optional() {
        let cfg: CliConfig = serde_json::from_str(
            r#"{"encoder":{"constant_frame_rate":false},"player":{"speed":2.0}}"#,
        )
        .unwrap();
        assert!(!cfg.encoder.constant_frame_rate);
        assert_eq!(cfg.encoder.video_buffer, 8);
        assert_eq!(cfg.player.speed, 2.0);
        assert_eq!(cfg.pipeline, PipelineConfig::default());
    }

    #[test]
    fn load_reports_the_path() {
        let missing = std::env::temp_dir().join(format!("capline-missing-{}.json", std::process::id()));
        let err = CliConfig::load(Some(&missing)).unwrap_err();
        assert!(err.to_string().contains("capline-missing"));
        assert_eq!(CliConfig::load(None).unwrap(), CliConfig::default());
    }

    #[test]
    fn file_roundtrip() {
        let path = std::env::temp_dir().join(format!("capline-config-{}.json", std::process::id()));
        let mut cfg = CliConfig::default();
        cfg.generator.duration_ms = Some(750);
        cfg.pipeline.video_filters = "hflip".into();
        std::fs::write(&path, serde_json::to_string_pretty(&cfg).unwrap()).unwrap();
        assert_eq!(CliConfig::load(Some(&path)).unwrap(), cfg);
        let _ = std::fs::remove_file(&path);
    }
}
