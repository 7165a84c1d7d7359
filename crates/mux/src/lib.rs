//! `capline-mux` — Matroska container writer for the capline media engine.
//!
//! # Architecture
//!
//! - **Self-contained** — EBML elements are written directly with `byteorder`
//! - **Progressive write** — clusters go to disk as soon as they close
//! - **Patched on finish** — Segment size and Duration are filled in last,
//!   followed by a Cues index
//! - **Uncompressed payloads** — `V_UNCOMPRESSED` video and PCM audio
//!
//! # Usage
//!
//! ```ignore
//! use capline_mux::{FileMuxer, MuxerConfig, VideoTrackConfig};
//!
//! let mut muxer = FileMuxer::create(&MuxerConfig {
//!     output_path: "capture.mkv".into(),
//!     title: None,
//! })?;
//! let video = muxer.add_video_track(video_config)?;
//! muxer.write_block(video, pts_ms, duration_ms, &payload, true)?;
//! muxer.finish()?;
//! ```

pub mod ebml;
pub mod elements;
pub mod error;
pub mod mkv;

pub use error::{MuxError, MuxResult};
pub use mkv::{
    fourcc, AudioTrackConfig, FileMuxer, MatroskaWriter, MuxStats, MuxerConfig, VideoTrackConfig,
};
