//! Video presentation sinks.

use std::sync::Arc;

use capline_common::{convert, Frame, FrameData, MediaResult, PixelFormat};
use parking_lot::Mutex;

/// Where paced pictures end up.
pub trait VideoRenderer: Send {
    /// Show one picture. Called from the `video-pacing` thread.
    fn present(&mut self, frame: &Frame) -> MediaResult<()>;

    /// Pixel formats [`present`](Self::present) accepts. Pictures in other
    /// software formats are converted to the first entry.
    fn supported_formats(&self) -> Vec<PixelFormat>;
}

/// Bring a picture into one of `formats`. `None` when it cannot be
/// converted (device surfaces, malformed planes).
pub(crate) fn adapt(frame: Frame, formats: &[PixelFormat]) -> Option<Frame> {
    let FrameData::Video(picture) = &frame.data else {
        return None;
    };
    if formats.is_empty() || formats.contains(&picture.format) {
        return Some(frame);
    }
    let converted = convert::convert(picture, formats[0])?;
    Some(Frame {
        data: FrameData::Video(converted),
        ..frame
    })
}

// ── Null renderer ────────────────────────────────────────────────────

/// Record of one presented picture.
#[derive(Clone, Debug, PartialEq)]
pub struct Presented {
    pub pts: Option<i64>,
    pub format: PixelFormat,
}

/// Shared view of what a [`NullVideoRenderer`] has shown.
#[derive(Clone, Debug, Default)]
pub struct PresentLog {
    entries: Arc<Mutex<Vec<Presented>>>,
}

impl PresentLog {
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Timestamps in presentation order; frames without one are skipped.
    pub fn pts(&self) -> Vec<i64> {
        self.entries.lock().iter().filter_map(|p| p.pts).collect()
    }

    pub fn last(&self) -> Option<Presented> {
        self.entries.lock().last().cloned()
    }
}

/// Headless renderer that only logs what it is given.
#[derive(Debug)]
pub struct NullVideoRenderer {
    formats: Vec<PixelFormat>,
    log: PresentLog,
}

impl Default for NullVideoRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl NullVideoRenderer {
    /// Accepts every software format.
    pub fn new() -> Self {
        Self::with_formats(Vec::new())
    }

    pub fn with_formats(formats: Vec<PixelFormat>) -> Self {
        Self {
            formats,
            log: PresentLog::default(),
        }
    }

    pub fn log(&self) -> PresentLog {
        self.log.clone()
    }
}

impl VideoRenderer for NullVideoRenderer {
    fn present(&mut self, frame: &Frame) -> MediaResult<()> {
        if let Some(picture) = frame.as_video() {
            self.log.entries.lock().push(Presented {
                pts: frame.pts,
                format: picture.format,
            });
        }
        Ok(())
    }

    fn supported_formats(&self) -> Vec<PixelFormat> {
        self.formats.clone()
    }
}
