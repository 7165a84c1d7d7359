//! `capline record`: generator → dispatcher → encoder → Matroska.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use capline_common::{Consumer, DeviceType, Options};
use capline_decoder::{GeneratorConfig, GeneratorSource};
use capline_encoder::Encoder;
use capline_gpu_hal::DeviceRegistry;
use capline_pipeline::Dispatcher;
use clap::Args;
use tracing::info;

use crate::config::CliConfig;

const POLL: Duration = Duration::from_millis(20);

#[derive(Args, Debug)]
pub struct CmdRecord {
    /// Output file (.mkv or .mka)
    output: PathBuf,

    /// Length of the recording
    #[arg(long, default_value = "2000")]
    duration_ms: u64,

    #[arg(long)]
    width: Option<u32>,

    #[arg(long)]
    height: Option<u32>,

    /// Frame rate, e.g. `30` or `30000/1001`
    #[arg(long)]
    fps: Option<String>,

    #[arg(long)]
    video_codec: Option<String>,

    #[arg(long)]
    audio_codec: Option<String>,

    #[arg(long)]
    no_video: bool,

    #[arg(long)]
    no_audio: bool,

    /// Variable frame rate output (no gap filling)
    #[arg(long)]
    vfr: bool,

    /// Video graph description
    #[arg(long = "vf")]
    video_filters: Option<String>,

    /// Audio graph description
    #[arg(long = "af")]
    audio_filters: Option<String>,

    /// Acceleration device for `hwupload` graphs (vaapi, cuda, ...)
    #[arg(long)]
    hwaccel: Option<String>,

    /// Pace the source to wall clock like a capture device
    #[arg(long)]
    realtime: bool,

    /// Print statistics as JSON
    #[arg(long)]
    json: bool,
}

impl CmdRecord {
    fn generator(&self, mut config: GeneratorConfig) -> Result<GeneratorConfig> {
        config.duration_ms = Some(self.duration_ms);
        config.width = self.width.unwrap_or(config.width);
        config.height = self.height.unwrap_or(config.height);
        if let Some(fps) = &self.fps {
            config.frame_rate = capline_common::Rational::parse(fps)
                .filter(|r| r.is_valid())
                .with_context(|| format!("invalid frame rate '{fps}'"))?;
        }
        config.video &= !self.no_video;
        config.audio &= !self.no_audio;
        config.realtime |= self.realtime;
        if !config.video && !config.audio {
            bail!("nothing to record with both video and audio disabled");
        }
        Ok(config)
    }

    /// Stream parameters the encoder needs, unless the config file set them.
    fn encoder_options(options: &mut Options, generator: &GeneratorConfig) {
        let fps = generator.frame_rate;
        let defaults = [
            ("width", generator.width.to_string()),
            ("height", generator.height.to_string()),
            ("pix_fmt", generator.pixel_format.name().to_string()),
            ("framerate", format!("{}/{}", fps.num, fps.den)),
            ("sample_rate", generator.sample_rate.to_string()),
            ("channels", generator.channels.to_string()),
        ];
        for (key, value) in defaults {
            options.entry(key.to_string()).or_insert(value);
        }
    }

    pub fn run(self, config: CliConfig) -> Result<()> {
        let generator = self.generator(config.generator)?;

        let mut encoder_config = config.encoder;
        if let Some(codec) = &self.video_codec {
            encoder_config.video_codec = Some(codec.clone());
        }
        if let Some(codec) = &self.audio_codec {
            encoder_config.audio_codec = Some(codec.clone());
        }
        if !generator.video {
            encoder_config.video_codec = None;
        }
        if !generator.audio {
            encoder_config.audio_codec = None;
        }
        encoder_config.constant_frame_rate &= !self.vfr;
        Self::encoder_options(&mut encoder_config.options, &generator);

        let mut pipeline = config.pipeline;
        if let Some(vf) = self.video_filters {
            pipeline.video_filters = vf;
        }
        if let Some(af) = self.audio_filters {
            pipeline.audio_filters = af;
        }
        if let Some(name) = &self.hwaccel {
            let device = DeviceType::from_name(name)
                .with_context(|| format!("unknown hwaccel '{name}'"))?;
            pipeline.hwaccel = Some(device);
        }

        let encoder = Arc::new(Encoder::new(encoder_config));
        let mut dispatcher = Dispatcher::new(pipeline.clone());
        if let Some(device) = pipeline.hwaccel {
            let registry = Arc::new(DeviceRegistry::default());
            encoder.set_hardware(Arc::clone(&registry), device);
            dispatcher.set_registry(registry);
        }
        encoder
            .open_configured(&self.output)
            .with_context(|| format!("opening {}", self.output.display()))?;

        dispatcher.append(Arc::new(GeneratorSource::new(generator)))?;
        dispatcher.set_consumer(Arc::clone(&encoder) as Arc<dyn Consumer>)?;
        dispatcher
            .create_filter_graph(&pipeline.video_filters, &pipeline.audio_filters)
            .context("building filter graphs")?;

        let started = Instant::now();
        dispatcher.start().context("starting the pipeline")?;
        while !encoder.eof() {
            if !encoder.ready() {
                break;
            }
            thread::sleep(POLL);
        }
        encoder.wait();
        dispatcher.stop();
        encoder.stop();

        let stats = encoder.stats();
        let mux = encoder
            .mux_stats()
            .context("the container trailer was not written")?;
        info!(
            output = %self.output.display(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            video_frames = stats.video_frames,
            audio_samples = stats.audio_samples,
            "Recording finished"
        );
        if self.json {
            let report = serde_json::json!({
                "output": self.output,
                "encoder": stats,
                "container": {
                    "bytes_written": mux.bytes_written,
                    "clusters": mux.clusters,
                    "duration_ms": mux.duration_ms,
                },
            });
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!(
                "{}: {} video frames ({} repeated), {} audio samples, {} bytes, {} ms",
                self.output.display(),
                stats.video_frames,
                stats.repeated_frames,
                stats.audio_samples,
                mux.bytes_written,
                mux.duration_ms
            );
        }
        Ok(())
    }
}
