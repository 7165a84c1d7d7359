//! `capline-common` — Shared types, traits, and errors for the capline media engine.
//!
//! This crate is the foundation that all other engine crates depend on:
//!
//! - **Types**: `Rational` time bases, `rescale`, the `NOPTS` sentinel
//! - **Convert**: software pixel format conversion through RGBA
//! - **Frames**: `Frame`, `VideoFrame`, `AudioFrame`, `StreamFormat`, `MediaKind`
//! - **Flow control**: `RingBuffer` (bounded), `SafeQueue` (unbounded), frame channels
//! - **Contract**: `Producer` / `Consumer` traits implemented by every stage
//! - **Hardware ids**: `DeviceType`, `FramesContext`
//! - **Errors**: `MediaError` (thiserror-based) with integer status codes
//! - **Config**: `PipelineConfig`, `EncoderConfig`

pub mod channel;
pub mod codec;
pub mod color;
pub mod config;
pub mod contract;
pub mod convert;
pub mod error;
pub mod frame;
pub mod hw;
pub mod queue;
pub mod ring;
pub mod types;

// Re-export commonly used items at crate root
pub use channel::{frame_channel, FrameEvent, FrameReceiver, FrameSender, Recv, SendFailure};
pub use codec::{AudioCodec, ContainerFormat, VideoCodec};
pub use color::{PixelFormat, PlaneLayout, SampleFormat};
pub use config::{option_or, EncoderConfig, Options, PipelineConfig};
pub use contract::{Consumer, Producer, Role};
pub use error::{status, MediaError, MediaResult};
pub use frame::{AudioFrame, Frame, FrameData, MediaKind, StreamFormat, VideoFrame};
pub use hw::{DeviceType, FramesContext};
pub use queue::SafeQueue;
pub use ring::{PushError, RingBuffer};
pub use types::{rescale, to_micros, to_nanos, Rational, NOPTS};
