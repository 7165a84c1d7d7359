//! `capline-decoder` — Producers of decoded frames.
//!
//! Decoding proper (demux + codec) is an external collaborator. This crate
//! provides the two ways frames enter the engine:
//!
//! - [`feed`] — [`FeedSource`], fed by an external decoder thread through a
//!   [`FeedHandle`]
//! - [`generator`] — [`GeneratorSource`], a synthetic test-pattern and tone
//!   source used by tests and the CLI
//!
//! Both implement [`capline_common::Producer`] and deliver over the bounded
//! frame channel.
//!
//! ## Usage
//!
//! ```ignore
//! use capline_common::{frame_channel, Producer};
//! use capline_decoder::{GeneratorConfig, GeneratorSource};
//!
//! let source = GeneratorSource::new(GeneratorConfig::default());
//! let (tx, rx) = frame_channel(16);
//! source.set_sink(tx);
//! source.start()?;
//! ```

pub mod feed;
pub mod generator;
pub mod pattern;

pub use feed::{FeedHandle, FeedSource};
pub use generator::{GeneratorConfig, GeneratorSource};
pub use pattern::{read_counter, test_picture, ToneGenerator, Waveform};
