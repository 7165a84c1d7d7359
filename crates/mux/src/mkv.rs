//! Matroska writer.
//!
//! Layout:
//!
//! ```text
//! EBML header
//! Segment (size patched on finish)
//!   Info      TimecodeScale = 1 ms, Duration (patched on finish)
//!   Tracks    one TrackEntry per added track
//!   Cluster*  Timecode + SimpleBlocks, flushed whole once closed
//!   Cues      one CuePoint per cluster
//! ```
//!
//! Tracks must all be added before the first block: the header goes out
//! with the first write. Clusters are assembled in memory so each is
//! written with a known size.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, WriteBytesExt};
use capline_common::{AudioCodec, ContainerFormat, PixelFormat, Rational, VideoCodec};
use tracing::{debug, info};

use crate::ebml::{self, EbmlBuf, UNKNOWN_SIZE};
use crate::elements::*;
use crate::error::{MuxError, MuxResult};

/// Nanoseconds per tick: every timestamp in the file is in milliseconds.
const TIMECODE_SCALE_NS: u64 = 1_000_000;
/// A cluster is closed once it spans this long...
const CLUSTER_MAX_SPAN_MS: i64 = 1_000;
/// ...or holds this many bytes.
const CLUSTER_MAX_BYTES: usize = 4 << 20;

const APP_NAME: &str = concat!("capline-mux ", env!("CARGO_PKG_VERSION"));

/// Where and what to write.
#[derive(Clone, Debug)]
pub struct MuxerConfig {
    pub output_path: PathBuf,
    pub title: Option<String>,
}

/// Uncompressed video track.
#[derive(Clone, Debug, PartialEq)]
pub struct VideoTrackConfig {
    pub codec: VideoCodec,
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    /// Sets the track's default frame duration when known.
    pub frame_rate: Option<Rational>,
}

/// PCM audio track.
#[derive(Clone, Debug, PartialEq)]
pub struct AudioTrackConfig {
    pub codec: AudioCodec,
    pub sample_rate: u32,
    pub channels: u16,
}

#[derive(Clone, Debug)]
enum TrackConfig {
    Video(VideoTrackConfig),
    Audio(AudioTrackConfig),
}

#[derive(Debug)]
struct TrackState {
    number: u64,
    config: TrackConfig,
    blocks: u64,
    bytes: u64,
}

#[derive(Debug)]
struct OpenCluster {
    timecode: i64,
    body: EbmlBuf,
    /// Track of the first block, for the cue point.
    cue_track: u64,
}

#[derive(Debug, Clone, Copy)]
struct CuePoint {
    time: i64,
    track: u64,
    position: u64,
}

/// Totals reported by [`MatroskaWriter::finish`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MuxStats {
    pub bytes_written: u64,
    pub clusters: usize,
    /// `(track number, blocks)` in track order.
    pub blocks: Vec<(u64, u64)>,
    pub duration_ms: i64,
}

/// FourCC stored in the `ColourSpace` of an uncompressed track.
pub fn fourcc(format: PixelFormat) -> Option<[u8; 4]> {
    Some(match format {
        PixelFormat::Rgba => *b"RGBA",
        PixelFormat::Bgra => *b"BGRA",
        PixelFormat::Yuv420p => *b"I420",
        PixelFormat::Nv12 => *b"NV12",
        PixelFormat::Gray8 => *b"Y800",
        PixelFormat::Hw => return None,
    })
}

/// Streaming Matroska writer over any seekable sink.
pub struct MatroskaWriter<W: Write + Seek> {
    writer: W,
    title: Option<String>,
    audio_only: bool,
    tracks: Vec<TrackState>,
    header_written: bool,
    segment_size_pos: u64,
    segment_data_start: u64,
    duration_pos: u64,
    cluster: Option<OpenCluster>,
    clusters: usize,
    cues: Vec<CuePoint>,
    end_ms: i64,
    finished: bool,
}

/// Writer on a buffered file.
pub type FileMuxer = MatroskaWriter<BufWriter<File>>;

impl FileMuxer {
    /// Create the output file. The container is picked from the extension:
    /// `.mkv`, or `.mka` for audio-only output.
    pub fn create(config: &MuxerConfig) -> MuxResult<Self> {
        let path = &config.output_path;
        match ContainerFormat::from_path(path) {
            Some(ContainerFormat::Matroska) => {}
            None => {
                return Err(MuxError::InvalidConfig(format!(
                    "no container for {}",
                    path.display()
                )))
            }
        }
        let file = File::create(path).map_err(|e| {
            MuxError::Io(std::io::Error::new(
                e.kind(),
                format!("Failed to create output file {}: {e}", path.display()),
            ))
        })?;
        let mut muxer = MatroskaWriter::new(BufWriter::new(file), config.title.clone());
        muxer.audio_only = is_audio_only(path);
        info!(path = %path.display(), "Matroska output created");
        Ok(muxer)
    }
}

fn is_audio_only(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("mka"))
}

impl<W: Write + Seek> MatroskaWriter<W> {
    pub fn new(writer: W, title: Option<String>) -> Self {
        Self {
            writer,
            title,
            audio_only: false,
            tracks: Vec::new(),
            header_written: false,
            segment_size_pos: 0,
            segment_data_start: 0,
            duration_pos: 0,
            cluster: None,
            clusters: 0,
            cues: Vec::new(),
            end_ms: 0,
            finished: false,
        }
    }

    fn check_can_add(&self) -> MuxResult<()> {
        if self.finished {
            return Err(MuxError::Finalized);
        }
        if self.header_written {
            return Err(MuxError::TrackError(
                "tracks must be added before the first block".into(),
            ));
        }
        Ok(())
    }

    fn push_track(&mut self, config: TrackConfig) -> u64 {
        let number = self.tracks.len() as u64 + 1;
        self.tracks.push(TrackState {
            number,
            config,
            blocks: 0,
            bytes: 0,
        });
        number
    }

    /// Returns the track number used by [`write_block`](Self::write_block).
    pub fn add_video_track(&mut self, config: VideoTrackConfig) -> MuxResult<u64> {
        self.check_can_add()?;
        if self.audio_only {
            return Err(MuxError::InvalidConfig(
                "audio-only container cannot hold video".into(),
            ));
        }
        if config.width == 0 || config.height == 0 {
            return Err(MuxError::InvalidConfig(format!(
                "invalid picture size {}x{}",
                config.width, config.height
            )));
        }
        if fourcc(config.pixel_format).is_none() {
            return Err(MuxError::InvalidConfig(format!(
                "pixel format {} cannot be stored uncompressed",
                config.pixel_format.name()
            )));
        }
        let codec = config.codec;
        let number = self.push_track(TrackConfig::Video(config));
        info!(track = number, codec = codec.name(), "Added video track");
        Ok(number)
    }

    pub fn add_audio_track(&mut self, config: AudioTrackConfig) -> MuxResult<u64> {
        self.check_can_add()?;
        if config.sample_rate == 0 || config.channels == 0 {
            return Err(MuxError::InvalidConfig(format!(
                "invalid audio layout {} Hz / {} channels",
                config.sample_rate, config.channels
            )));
        }
        let codec = config.codec;
        let number = self.push_track(TrackConfig::Audio(config));
        info!(track = number, codec = codec.name(), "Added audio track");
        Ok(number)
    }

    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    pub fn track_block_count(&self, track: u64) -> MuxResult<u64> {
        Ok(self.find_track(track)?.blocks)
    }

    /// Payload bytes written for `track`.
    pub fn track_bytes(&self, track: u64) -> MuxResult<u64> {
        Ok(self.find_track(track)?.bytes)
    }

    fn find_track(&self, track: u64) -> MuxResult<&TrackState> {
        self.tracks
            .iter()
            .find(|t| t.number == track)
            .ok_or_else(|| MuxError::TrackError(format!("Track {track} not found")))
    }

    fn write_header(&mut self) -> MuxResult<()> {
        if self.tracks.is_empty() {
            return Err(MuxError::InvalidConfig("no tracks".into()));
        }

        let mut head = EbmlBuf::new();
        head.master(EBML_HEADER, |h| {
            h.uint(EBML_VERSION, 1)?
                .uint(EBML_READ_VERSION, 1)?
                .uint(EBML_MAX_ID_LENGTH, 4)?
                .uint(EBML_MAX_SIZE_LENGTH, 8)?
                .string(DOC_TYPE, "matroska")?
                .uint(DOC_TYPE_VERSION, 4)?
                .uint(DOC_TYPE_READ_VERSION, 2)?;
            Ok(())
        })?;
        self.writer.write_all(head.as_bytes())?;

        ebml::write_id(&mut self.writer, SEGMENT)?;
        self.segment_size_pos = self.writer.stream_position()?;
        self.writer.write_all(&UNKNOWN_SIZE)?;
        self.segment_data_start = self.writer.stream_position()?;

        // Duration goes last so its payload is the final 8 bytes of Info.
        let title = self.title.clone();
        let mut info_el = EbmlBuf::new();
        info_el.master(INFO, |i| {
            i.uint(TIMECODE_SCALE, TIMECODE_SCALE_NS)?
                .string(MUXING_APP, APP_NAME)?
                .string(WRITING_APP, APP_NAME)?;
            if let Some(title) = &title {
                i.string(TITLE, title)?;
            }
            i.float(DURATION, 0.0)?;
            Ok(())
        })?;
        self.duration_pos = self.segment_data_start + info_el.len() as u64 - 8;
        self.writer.write_all(info_el.as_bytes())?;

        let mut tracks = EbmlBuf::new();
        tracks.master(TRACKS, |t| {
            for track in &self.tracks {
                t.master(TRACK_ENTRY, |e| write_track_entry(e, track))?;
            }
            Ok(())
        })?;
        self.writer.write_all(tracks.as_bytes())?;

        self.header_written = true;
        debug!(tracks = self.tracks.len(), "Matroska header written");
        Ok(())
    }

    /// Append one frame. `pts_ms` is the presentation time in
    /// milliseconds; `duration_ms` extends the segment duration.
    pub fn write_block(
        &mut self,
        track: u64,
        pts_ms: i64,
        duration_ms: i64,
        data: &[u8],
        keyframe: bool,
    ) -> MuxResult<()> {
        if self.finished {
            return Err(MuxError::Finalized);
        }
        let index = self
            .tracks
            .iter()
            .position(|t| t.number == track)
            .ok_or_else(|| MuxError::TrackError(format!("Track {track} not found")))?;
        if !self.header_written {
            self.write_header()?;
        }
        let pts_ms = pts_ms.max(0);

        let fits = self.cluster.as_ref().is_some_and(|c| {
            let rel = pts_ms - c.timecode;
            (0..CLUSTER_MAX_SPAN_MS).contains(&rel) && c.body.len() < CLUSTER_MAX_BYTES
        });
        if !fits {
            self.close_cluster()?;
            let mut body = EbmlBuf::new();
            body.uint(TIMECODE, pts_ms as u64)?;
            self.cluster = Some(OpenCluster {
                timecode: pts_ms,
                body,
                cue_track: track,
            });
        }
        let Some(cluster) = self.cluster.as_mut() else {
            return Err(MuxError::InvalidConfig("no open cluster".into()));
        };

        let rel = (pts_ms - cluster.timecode) as i16;
        let mut block = Vec::with_capacity(data.len() + 4);
        ebml::write_size(&mut block, track)?;
        block.write_i16::<BigEndian>(rel)?;
        block.push(if keyframe { 0x80 } else { 0x00 });
        block.extend_from_slice(data);
        cluster.body.binary(SIMPLE_BLOCK, &block)?;

        let state = &mut self.tracks[index];
        state.blocks += 1;
        state.bytes += data.len() as u64;
        self.end_ms = self.end_ms.max(pts_ms + duration_ms.max(0));
        Ok(())
    }

    fn close_cluster(&mut self) -> MuxResult<()> {
        let Some(cluster) = self.cluster.take() else {
            return Ok(());
        };
        let position = self.writer.stream_position()? - self.segment_data_start;
        ebml::write_id(&mut self.writer, CLUSTER)?;
        ebml::write_size(&mut self.writer, cluster.body.len() as u64)?;
        self.writer.write_all(cluster.body.as_bytes())?;
        self.cues.push(CuePoint {
            time: cluster.timecode,
            track: cluster.cue_track,
            position,
        });
        self.clusters += 1;
        Ok(())
    }

    /// Flush the last cluster, write the cue index and patch sizes. Must be
    /// called exactly once.
    pub fn finish(&mut self) -> MuxResult<MuxStats> {
        if self.finished {
            return Err(MuxError::Finalized);
        }
        if !self.header_written {
            self.write_header()?;
        }
        self.close_cluster()?;

        if !self.cues.is_empty() {
            let mut cues = EbmlBuf::new();
            cues.master(CUES, |c| {
                for cue in &self.cues {
                    c.master(CUE_POINT, |p| {
                        p.uint(CUE_TIME, cue.time as u64)?;
                        p.master(CUE_TRACK_POSITIONS, |tp| {
                            tp.uint(CUE_TRACK, cue.track)?
                                .uint(CUE_CLUSTER_POSITION, cue.position)?;
                            Ok(())
                        })?;
                        Ok(())
                    })?;
                }
                Ok(())
            })?;
            self.writer.write_all(cues.as_bytes())?;
        }

        let end = self.writer.stream_position()?;
        self.writer.seek(SeekFrom::Start(self.duration_pos))?;
        self.writer.write_f64::<BigEndian>(self.end_ms as f64)?;
        self.writer.seek(SeekFrom::Start(self.segment_size_pos))?;
        ebml::write_size_width(&mut self.writer, end - self.segment_data_start, 8)?;
        self.writer.seek(SeekFrom::Start(end))?;
        self.writer.flush()?;
        self.finished = true;

        let stats = MuxStats {
            bytes_written: end,
            clusters: self.clusters,
            blocks: self.tracks.iter().map(|t| (t.number, t.blocks)).collect(),
            duration_ms: self.end_ms,
        };
        info!(
            bytes = stats.bytes_written,
            clusters = stats.clusters,
            duration_ms = stats.duration_ms,
            "Matroska file finalized"
        );
        Ok(stats)
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Give back the sink, e.g. to inspect an in-memory file.
    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn write_track_entry(e: &mut EbmlBuf, track: &TrackState) -> MuxResult<()> {
    e.uint(TRACK_NUMBER, track.number)?
        .uint(TRACK_UID, track.number)?
        .uint(FLAG_LACING, 0)?
        .string(LANGUAGE, "und")?;
    match &track.config {
        TrackConfig::Video(v) => {
            e.uint(TRACK_TYPE, TRACK_TYPE_VIDEO)?
                .string(CODEC_ID, v.codec.matroska_id())?;
            if let Some(rate) = v.frame_rate.filter(|r| r.is_valid()) {
                let ns = 1_000_000_000u64 * rate.den as u64 / rate.num as u64;
                e.uint(DEFAULT_DURATION, ns)?;
            }
            let cc = fourcc(v.pixel_format).ok_or_else(|| {
                MuxError::InvalidConfig(format!("no fourcc for {}", v.pixel_format.name()))
            })?;
            e.master(VIDEO, |m| {
                m.uint(PIXEL_WIDTH, v.width as u64)?
                    .uint(PIXEL_HEIGHT, v.height as u64)?
                    .binary(COLOUR_SPACE, &cc)?;
                Ok(())
            })?;
        }
        TrackConfig::Audio(a) => {
            e.uint(TRACK_TYPE, TRACK_TYPE_AUDIO)?
                .string(CODEC_ID, a.codec.matroska_id())?;
            e.master(AUDIO, |m| {
                m.float(SAMPLING_FREQUENCY, a.sample_rate as f64)?
                    .uint(CHANNELS, a.channels as u64)?
                    .uint(BIT_DEPTH, a.codec.sample_format().bit_depth() as u64)?;
                Ok(())
            })?;
        }
    }
    Ok(())
}

impl<W: Write + Seek> std::fmt::Debug for MatroskaWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatroskaWriter")
            .field("tracks", &self.tracks.len())
            .field("clusters", &self.clusters)
            .field("finished", &self.finished)
            .finish()
    }
}

// ── Tests ────────────────────────────────────────────────────────────
