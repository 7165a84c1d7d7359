//! `capline-encoder` — Encoder consumer for the capline media engine.
//!
//! Receives frames from the dispatcher, encodes them with one of the
//! built-in codecs and writes a Matroska file through `capline-mux`.
//!
//! # Modules
//!
//! - [`encoder`] — [`Encoder`], the `Consumer` with its ring buffers and worker
//! - [`fifo`] — sample FIFO adapting decoded audio to fixed codec blocks
//! - [`eof`] — composite end-of-stream bitmask
//! - [`codec`] — `rawvideo`, `pcm_s16le` and `pcm_f32le`
//! - [`stats`] — [`EncoderStats`]
//! - [`error`] — [`EncodeError`]

pub mod codec;
pub mod encoder;
pub mod eof;
pub mod error;
pub mod fifo;
pub mod stats;

pub use codec::{AudioEncoder, VideoEncoder};
pub use encoder::Encoder;
pub use eof::{EofState, EOF_ALL, EOF_AUDIO, EOF_AUDIO_FIFO, EOF_VIDEO};
pub use error::EncodeError;
pub use fifo::{AudioBlock, AudioFifo};
pub use stats::EncoderStats;
