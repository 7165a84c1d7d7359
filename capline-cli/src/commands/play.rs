//! `capline play`: generator → player.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use capline_decoder::GeneratorSource;
use capline_player::{Player, PlayerState};
use clap::Args;
use tracing::info;

use crate::config::CliConfig;

const POLL: Duration = Duration::from_millis(50);

#[derive(Args, Debug)]
pub struct CmdPlay {
    /// Length of the generated clip
    #[arg(long, default_value = "2000")]
    duration_ms: u64,

    #[arg(long)]
    speed: Option<f64>,

    #[arg(long)]
    volume: Option<f32>,

    #[arg(long)]
    mute: bool,

    /// Audio output device name
    #[arg(long)]
    device: Option<String>,

    /// Start position
    #[arg(long)]
    seek_ms: Option<u64>,

    /// Treat the source as live; runs for `--duration-ms` then stops
    #[arg(long)]
    live: bool,
}

impl CmdPlay {
    pub fn run(self, config: CliConfig) -> Result<()> {
        let mut generator = config.generator;
        let mut options = config.player;
        if self.live {
            generator.live = true;
            generator.realtime = true;
            generator.duration_ms = None;
        } else {
            generator.duration_ms = Some(self.duration_ms);
        }
        options.speed = self.speed.unwrap_or(options.speed);
        options.volume = self.volume.unwrap_or(options.volume);
        options.muted |= self.mute;
        if self.device.is_some() {
            options.audio_device = self.device.clone();
        }

        let player = Player::open(Arc::new(GeneratorSource::new(generator)), options)
            .context("opening the player")?;
        if let Some(ms) = self.seek_ms {
            player.seek(ms as i64 * 1000, false).context("initial seek")?;
        }
        let started = Instant::now();
        player.play().context("starting playback")?;

        let limit = Duration::from_millis(self.duration_ms);
        loop {
            thread::sleep(POLL);
            let finished = match player.state() {
                PlayerState::Paused => !player.is_live(),
                PlayerState::Stopped => true,
                _ => false,
            };
            if finished || (player.is_live() && started.elapsed() >= limit) {
                break;
            }
        }
        player.stop();
        info!(
            presented = player.presented_frames(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Playback finished"
        );
        println!(
            "presented {} frames in {} ms",
            player.presented_frames(),
            started.elapsed().as_millis()
        );
        Ok(())
    }
}
