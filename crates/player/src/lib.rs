//! `capline-player` — Playback of a decoded-frame [`Producer`] locked to
//! the audio device clock.
//!
//! Three actors share one [`Timeline`](capline_audio::Timeline):
//!
//! ```text
//!  Producer ──frames──▶ delivery thread ──▶ video queue ──▶ video-pacing thread ──▶ VideoRenderer
//!                                       └─▶ audio queue ──▶ pull callback ──▶ AudioRenderer
//!                                                               │
//!                                                               ▼
//!                                                           Timeline (read by pacing)
//! ```
//!
//! The audio pull callback anchors the timeline to what is about to be
//! heard; the pacing thread only measures against it. Sources without
//! audio run on a wall-clock timeline anchored at the first frame.
//!
//! [`Producer`]: capline_common::Producer

mod clock;
pub mod error;
pub mod options;
pub mod player;
pub mod video;

pub use error::{PlayerError, PlayerResult};
pub use options::{PlayerOptions, PlayerState};
pub use player::Player;
pub use video::{NullVideoRenderer, PresentLog, VideoRenderer};
