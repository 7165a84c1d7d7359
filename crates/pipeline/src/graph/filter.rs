//! Filter node trait and the filter factory.

use std::sync::Arc;

use capline_common::{Frame, FramesContext, MediaError, MediaKind, MediaResult};
use capline_gpu_hal::DeviceContext;

use super::audio::{AFormat, AMix, AResample, Volume};
use super::hw::{HwDownload, HwUpload};
use super::parser::FilterSpec;
use super::video::{Crop, Fps, FormatFilter, HFlip, Overlay, Scale, VFlip};

/// A node of the processing graph.
///
/// Nodes have one output and [`num_inputs`](Self::num_inputs) input pads.
/// Frames produced by a call are appended to `out` in presentation order.
pub trait Filter: Send {
    fn name(&self) -> &'static str;

    fn kind(&self) -> MediaKind;

    fn num_inputs(&self) -> usize {
        1
    }

    /// Process one frame arriving on input `pad`.
    fn filter(&mut self, pad: usize, frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()>;

    /// Input `pad` reached end of stream; emit anything still held.
    fn end(&mut self, _pad: usize, _out: &mut Vec<Frame>) -> MediaResult<()> {
        Ok(())
    }

    /// Whether the output is finished given which inputs have ended.
    fn is_done(&self, ended: &[bool]) -> bool {
        ended.iter().all(|e| *e)
    }

    /// Take a hardware device. Returns false for software-only nodes.
    fn bind_device(&mut self, _device: &Arc<DeviceContext>) -> bool {
        false
    }

    fn output_frames_context(&self) -> Option<Arc<FramesContext>> {
        None
    }
}

/// `null` / `anull`.
pub struct Passthrough {
    kind: MediaKind,
}

impl Passthrough {
    pub fn new(kind: MediaKind) -> Self {
        Self { kind }
    }
}

impl Filter for Passthrough {
    fn name(&self) -> &'static str {
        match self.kind {
            MediaKind::Video => "null",
            MediaKind::Audio => "anull",
        }
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn filter(&mut self, _pad: usize, frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        out.push(frame);
        Ok(())
    }
}

pub(crate) fn bad_arg(filter: &str, what: impl std::fmt::Display) -> MediaError {
    MediaError::graph_parse(format!("{filter}: {what}"))
}

/// Parse a required numeric argument.
pub(crate) fn parse_arg<T: std::str::FromStr>(
    spec: &FilterSpec,
    position: usize,
    name: &str,
) -> MediaResult<T> {
    let raw = spec
        .arg(position, name)
        .ok_or_else(|| bad_arg(&spec.name, format!("missing '{name}'")))?;
    raw.parse()
        .map_err(|_| bad_arg(&spec.name, format!("invalid {name} '{raw}'")))
}

/// Parse an optional numeric argument.
pub(crate) fn parse_opt<T: std::str::FromStr>(
    spec: &FilterSpec,
    position: usize,
    name: &str,
) -> MediaResult<Option<T>> {
    match spec.arg(position, name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| bad_arg(&spec.name, format!("invalid {name} '{raw}'"))),
    }
}

/// Instantiate the filter named by `spec` for a graph of `kind`.
pub fn create(kind: MediaKind, spec: &FilterSpec) -> MediaResult<Box<dyn Filter>> {
    let filter: Box<dyn Filter> = match spec.name.as_str() {
        "null" => Box::new(Passthrough::new(MediaKind::Video)),
        "hflip" => Box::new(HFlip),
        "vflip" => Box::new(VFlip),
        "crop" => Box::new(Crop::from_spec(spec)?),
        "scale" => Box::new(Scale::from_spec(spec)?),
        "fps" => Box::new(Fps::from_spec(spec)?),
        "format" => Box::new(FormatFilter::from_spec(spec)?),
        "overlay" => Box::new(Overlay::from_spec(spec)?),
        "hwupload" => Box::new(HwUpload::default()),
        "hwdownload" => Box::new(HwDownload),
        "anull" => Box::new(Passthrough::new(MediaKind::Audio)),
        "volume" => Box::new(Volume::from_spec(spec)?),
        "amix" => Box::new(AMix::from_spec(spec)?),
        "aresample" => Box::new(AResample::from_spec(spec)?),
        "aformat" => Box::new(AFormat::from_spec(spec)?),
        other => return Err(MediaError::graph_parse(format!("unknown filter '{other}'"))),
    };
    if filter.kind() != kind {
        return Err(MediaError::graph_parse(format!(
            "'{}' is not a {kind} filter",
            spec.name
        )));
    }
    Ok(filter)
}
