//! Matroska element IDs used by the writer.

// ─── EBML Header ─────────────────────────────────────────────────────

pub const EBML_HEADER: u32 = 0x1A45DFA3;
pub const EBML_VERSION: u32 = 0x4286;
pub const EBML_READ_VERSION: u32 = 0x42F7;
pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
pub const DOC_TYPE: u32 = 0x4282;
pub const DOC_TYPE_VERSION: u32 = 0x4287;
pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

// ─── Segment ─────────────────────────────────────────────────────────

pub const SEGMENT: u32 = 0x18538067;

// ─── Segment Information ─────────────────────────────────────────────

pub const INFO: u32 = 0x1549A966;
/// Nanoseconds per cluster/block tick.
pub const TIMECODE_SCALE: u32 = 0x2AD7B1;
/// Float, in ticks.
pub const DURATION: u32 = 0x4489;
pub const TITLE: u32 = 0x7BA9;
pub const MUXING_APP: u32 = 0x4D80;
pub const WRITING_APP: u32 = 0x5741;

// ─── Tracks ──────────────────────────────────────────────────────────

pub const TRACKS: u32 = 0x1654AE6B;
pub const TRACK_ENTRY: u32 = 0xAE;
pub const TRACK_NUMBER: u32 = 0xD7;
pub const TRACK_UID: u32 = 0x73C5;
/// 1 = video, 2 = audio.
pub const TRACK_TYPE: u32 = 0x83;
pub const CODEC_ID: u32 = 0x86;
/// Nanoseconds.
pub const DEFAULT_DURATION: u32 = 0x23E383;
pub const FLAG_LACING: u32 = 0x9C;
pub const LANGUAGE: u32 = 0x22B59C;

pub const VIDEO: u32 = 0xE0;
pub const PIXEL_WIDTH: u32 = 0xB0;
pub const PIXEL_HEIGHT: u32 = 0xBA;
/// FourCC of uncompressed video.
pub const COLOUR_SPACE: u32 = 0x2EB524;

pub const AUDIO: u32 = 0xE1;
pub const SAMPLING_FREQUENCY: u32 = 0xB5;
pub const CHANNELS: u32 = 0x9F;
pub const BIT_DEPTH: u32 = 0x6264;

// ─── Cluster ─────────────────────────────────────────────────────────

pub const CLUSTER: u32 = 0x1F43B675;
pub const TIMECODE: u32 = 0xE7;
pub const SIMPLE_BLOCK: u32 = 0xA3;

// ─── Cues ────────────────────────────────────────────────────────────

pub const CUES: u32 = 0x1C53BB6B;
pub const CUE_POINT: u32 = 0xBB;
pub const CUE_TIME: u32 = 0xB3;
pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
pub const CUE_TRACK: u32 = 0xF7;
/// Byte offset from the start of the Segment payload.
pub const CUE_CLUSTER_POSITION: u32 = 0xF1;

pub const TRACK_TYPE_VIDEO: u64 = 1;
pub const TRACK_TYPE_AUDIO: u64 = 2;
