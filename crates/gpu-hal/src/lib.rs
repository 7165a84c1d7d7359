//! `capline-gpu-hal` — Hardware acceleration device registry.
//!
//! Replaces a process-wide device list with an owned [`DeviceRegistry`]:
//! the session creates one, and the processing graph and the encoder
//! receive it by reference.
//!
//! # Architecture
//!
//! ```text
//! PlatformProbe ──▶ DeviceRegistry ──bind_to_graph──▶ FilterGraph nodes
//!                        │   ▲
//!                        │   └──bind_frames_context── graph sink
//!                        └──setup_for_encoding──────▶ EncoderHwState
//! ```

pub mod probe;
pub mod registry;

pub use probe::{PlatformProbe, StaticProbe, SystemProbe};
pub use registry::{
    DeviceBinding, DeviceContext, DeviceInfo, DeviceRegistry, EncoderHwState, FramesSource,
};
