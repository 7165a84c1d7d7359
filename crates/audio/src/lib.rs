//! `capline-audio` — Playback clock, time-stretching, and audio output.
//!
//! - **Timeline**: the shared, audio-anchored playback clock
//! - **Stretcher**: overlap-add speed change without pitch shift
//! - **Resampler**: linear interpolation sample rate conversion
//! - **Renderer**: pull-model output sinks (null, and CPAL behind the
//!   `cpal-output` feature)
//!
//! # Architecture
//!
//! ```text
//! queued frames -> TimeStretcher -> pull callback -> AudioRenderer (device)
//!                                        |
//!                                        v
//!                                     Timeline  <- read by video pacing
//! ```

#[cfg(feature = "cpal-output")]
pub mod cpal_output;
pub mod error;
pub mod renderer;
pub mod resampler;
pub mod stretcher;
pub mod timeline;

#[cfg(feature = "cpal-output")]
pub use cpal_output::CpalAudioRenderer;
pub use error::AudioError;
pub use renderer::{AudioRenderer, NullAudioRenderer, PullCallback, RendererOptions};
pub use resampler::Resampler;
pub use stretcher::TimeStretcher;
pub use timeline::Timeline;
