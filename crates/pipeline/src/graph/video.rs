//! Software video filters.
//!
//! All of these work on host planes of any software [`PixelFormat`]; chroma
//! planes of subsampled formats are handled at their own resolution.
//! Hardware frames must pass through `hwdownload` first.

use capline_common::convert::{convert, from_rgba, to_rgba};
use capline_common::{
    rescale, Frame, MediaError, MediaKind, MediaResult, PixelFormat, Rational, VideoFrame,
};
use tracing::trace;

use super::filter::{bad_arg, parse_arg, parse_opt, Filter};
use super::parser::FilterSpec;

fn software<'a>(filter: &str, frame: &'a mut Frame) -> MediaResult<&'a mut VideoFrame> {
    let pic = frame
        .as_video_mut()
        .ok_or_else(|| MediaError::InvalidArgument(format!("{filter}: not a video frame")))?;
    if pic.format.is_hardware() {
        return Err(MediaError::InvalidArgument(format!(
            "{filter}: hardware frame needs hwdownload first"
        )));
    }
    Ok(pic)
}

/// Chroma subsampling factor of plane `index`.
fn subsampling(format: PixelFormat, index: usize) -> usize {
    if format.is_planar() && index > 0 {
        2
    } else {
        1
    }
}

// ── Flips ────────────────────────────────────────────────────────

pub struct HFlip;

impl Filter for HFlip {
    fn name(&self) -> &'static str {
        "hflip"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = software("hflip", &mut frame)?;
        let layouts = pic.format.planes(pic.width, pic.height);
        for (plane, layout) in pic.planes.iter_mut().zip(layouts) {
            if layout.stride() == 0 {
                continue;
            }
            let bpp = layout.bytes_per_pixel;
            for row in plane.chunks_exact_mut(layout.stride()) {
                for x in 0..layout.width / 2 {
                    let mirror = layout.width - 1 - x;
                    for b in 0..bpp {
                        row.swap(x * bpp + b, mirror * bpp + b);
                    }
                }
            }
        }
        out.push(frame);
        Ok(())
    }
}

pub struct VFlip;

impl Filter for VFlip {
    fn name(&self) -> &'static str {
        "vflip"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = software("vflip", &mut frame)?;
        let layouts = pic.format.planes(pic.width, pic.height);
        for (plane, layout) in pic.planes.iter_mut().zip(layouts) {
            if layout.stride() == 0 {
                continue;
            }
            let flipped: Vec<u8> = plane
                .chunks_exact(layout.stride())
                .rev()
                .flatten()
                .copied()
                .collect();
            *plane = flipped;
        }
        out.push(frame);
        Ok(())
    }
}

// ── Crop ─────────────────────────────────────────────────────────

/// `crop=w:h[:x:y]`, centred when no offset is given.
pub struct Crop {
    width: u32,
    height: u32,
    x: Option<u32>,
    y: Option<u32>,
}

impl Crop {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let crop = Self {
            width: parse_arg(spec, 0, "w")?,
            height: parse_arg(spec, 1, "h")?,
            x: parse_opt(spec, 2, "x")?,
            y: parse_opt(spec, 3, "y")?,
        };
        if crop.width == 0 || crop.height == 0 {
            return Err(bad_arg("crop", "size must be non-zero"));
        }
        Ok(crop)
    }
}

impl Filter for Crop {
    fn name(&self) -> &'static str {
        "crop"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = software("crop", &mut frame)?;
        if self.width > pic.width || self.height > pic.height {
            return Err(MediaError::InvalidArgument(format!(
                "crop: {}x{} exceeds {}x{}",
                self.width, self.height, pic.width, pic.height
            )));
        }
        let mut x = self.x.unwrap_or((pic.width - self.width) / 2);
        let mut y = self.y.unwrap_or((pic.height - self.height) / 2);
        if pic.format.is_planar() {
            x &= !1;
            y &= !1;
        }
        let x = x.min(pic.width - self.width) as usize;
        let y = y.min(pic.height - self.height) as usize;

        let src_layouts = pic.format.planes(pic.width, pic.height);
        let dst_layouts = pic.format.planes(self.width, self.height);
        let mut planes = Vec::with_capacity(pic.planes.len());
        for (i, (src, dst)) in src_layouts.iter().zip(&dst_layouts).enumerate() {
            let sub = subsampling(pic.format, i);
            let (px, py) = (x / sub, y / sub);
            let mut plane = Vec::with_capacity(dst.size());
            for row in 0..dst.height {
                let start = (py + row) * src.stride() + px * src.bytes_per_pixel;
                plane.extend_from_slice(&pic.planes[i][start..start + dst.stride()]);
            }
            planes.push(plane);
        }
        pic.planes = planes;
        pic.width = self.width;
        pic.height = self.height;
        out.push(frame);
        Ok(())
    }
}

// ── Scale ────────────────────────────────────────────────────────

/// `scale=w:h`, nearest neighbour. `-1` on one side keeps the aspect ratio.
pub struct Scale {
    width: i64,
    height: i64,
}

impl Scale {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let width: i64 = parse_arg(spec, 0, "w")?;
        let height: i64 = parse_arg(spec, 1, "h")?;
        let valid = |v: i64| v == -1 || v > 0;
        if !valid(width) || !valid(height) || (width == -1 && height == -1) {
            return Err(bad_arg("scale", format!("invalid size {width}x{height}")));
        }
        Ok(Self { width, height })
    }

    fn target(&self, width: u32, height: u32) -> (u32, u32) {
        let keep = |other: i64, num: u32, den: u32| {
            ((other as f64 * num as f64 / den.max(1) as f64).round() as u32).max(1)
        };
        match (self.width, self.height) {
            (-1, h) => (keep(h, width, height), h as u32),
            (w, -1) => (w as u32, keep(w, height, width)),
            (w, h) => (w as u32, h as u32),
        }
    }
}

impl Filter for Scale {
    fn name(&self) -> &'static str {
        "scale"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = software("scale", &mut frame)?;
        let (dw, dh) = self.target(pic.width, pic.height);
        if (dw, dh) == (pic.width, pic.height) {
            out.push(frame);
            return Ok(());
        }
        let src_layouts = pic.format.planes(pic.width, pic.height);
        let dst_layouts = pic.format.planes(dw, dh);
        let mut planes = Vec::with_capacity(pic.planes.len());
        for (i, (src, dst)) in src_layouts.iter().zip(&dst_layouts).enumerate() {
            let bpp = dst.bytes_per_pixel;
            let mut plane = vec![0u8; dst.size()];
            for y in 0..dst.height {
                let sy = y * src.height / dst.height.max(1);
                for x in 0..dst.width {
                    let sx = x * src.width / dst.width.max(1);
                    let s = sy * src.stride() + sx * bpp;
                    let d = y * dst.stride() + x * bpp;
                    plane[d..d + bpp].copy_from_slice(&pic.planes[i][s..s + bpp]);
                }
            }
            planes.push(plane);
        }
        pic.planes = planes;
        pic.width = dw;
        pic.height = dh;
        out.push(frame);
        Ok(())
    }
}

// ── Frame rate ───────────────────────────────────────────────────

/// `fps=N[/D]`: constant output rate by dropping and duplicating frames.
///
/// Output timestamps count frames in a `1/rate` time base.
pub struct Fps {
    time_base: Rational,
    next: Option<i64>,
    held: Option<Frame>,
}

impl Fps {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let raw = spec
            .arg(0, "fps")
            .ok_or_else(|| bad_arg("fps", "missing rate"))?;
        let rate = Rational::parse(raw)
            .filter(|r| r.is_valid())
            .ok_or_else(|| bad_arg("fps", format!("invalid rate '{raw}'")))?;
        Ok(Self::new(rate))
    }

    pub fn new(rate: Rational) -> Self {
        Self {
            time_base: rate.invert(),
            next: None,
            held: None,
        }
    }

    fn emit(&self, frame: &Frame, slot: i64) -> Frame {
        let mut copy = frame.clone();
        copy.pts = Some(slot);
        copy.time_base = self.time_base;
        copy.duration = 1;
        copy
    }
}

impl Filter for Fps {
    fn name(&self) -> &'static str {
        "fps"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let slot = match frame.pts {
            Some(pts) => rescale(pts, frame.time_base, self.time_base),
            None => self.next.unwrap_or(0),
        };
        let Some(mut next) = self.next else {
            self.next = Some(slot);
            self.held = Some(frame);
            return Ok(());
        };
        if let Some(held) = &self.held {
            while next < slot {
                out.push(self.emit(held, next));
                next += 1;
            }
        }
        if slot < next {
            trace!(slot, next, "fps: dropping late frame");
        }
        self.next = Some(next);
        self.held = Some(frame);
        Ok(())
    }

    fn end(&mut self, _pad: usize, out: &mut Vec<Frame>) -> MediaResult<()> {
        if let (Some(held), Some(next)) = (self.held.take(), self.next) {
            out.push(self.emit(&held, next));
            self.next = Some(next + 1);
        }
        Ok(())
    }
}

// ── Pixel format ─────────────────────────────────────────────────

/// `format=pix_fmt`.
pub struct FormatFilter {
    target: PixelFormat,
    pass_hardware: bool,
}

impl FormatFilter {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        let raw = spec
            .arg(0, "pix_fmts")
            .ok_or_else(|| bad_arg("format", "missing pixel format"))?;
        let target = PixelFormat::from_name(raw)
            .filter(|f| !f.is_hardware())
            .ok_or_else(|| bad_arg("format", format!("unknown pixel format '{raw}'")))?;
        Ok(Self::new(target))
    }

    pub fn new(target: PixelFormat) -> Self {
        Self {
            target,
            pass_hardware: false,
        }
    }

    /// Let hardware surfaces through untouched instead of failing.
    pub fn passing_hardware(mut self) -> Self {
        self.pass_hardware = true;
        self
    }
}

impl Filter for FormatFilter {
    fn name(&self) -> &'static str {
        "format"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let hardware = frame.as_video().is_some_and(|v| v.format.is_hardware());
        if hardware && self.pass_hardware {
            out.push(frame);
            return Ok(());
        }
        let pic = software("format", &mut frame)?;
        if pic.format != self.target {
            *pic = convert(pic, self.target).ok_or_else(|| {
                MediaError::InvalidArgument(format!(
                    "format: cannot convert {} to {}",
                    pic.format.name(),
                    self.target.name()
                ))
            })?;
        }
        out.push(frame);
        Ok(())
    }
}

// ── Overlay ──────────────────────────────────────────────────────

/// `overlay=x:y`: pad 0 is the main picture, pad 1 is drawn on top of it.
///
/// The most recent overlay picture is reused until a newer one arrives.
/// Output ends with the main input.
pub struct Overlay {
    x: i64,
    y: i64,
    top: Option<(Vec<u8>, u32, u32)>,
}

impl Overlay {
    pub fn from_spec(spec: &FilterSpec) -> MediaResult<Self> {
        Ok(Self {
            x: parse_opt(spec, 0, "x")?.unwrap_or(0),
            y: parse_opt(spec, 1, "y")?.unwrap_or(0),
            top: None,
        })
    }

    fn blend(&self, base: &mut [u8], width: u32, height: u32) {
        let Some((top, tw, th)) = &self.top else {
            return;
        };
        for ty in 0..*th as i64 {
            let by = ty + self.y;
            if by < 0 || by >= height as i64 {
                continue;
            }
            for tx in 0..*tw as i64 {
                let bx = tx + self.x;
                if bx < 0 || bx >= width as i64 {
                    continue;
                }
                let t = ((ty * *tw as i64 + tx) * 4) as usize;
                let b = ((by * width as i64 + bx) * 4) as usize;
                let alpha = top[t + 3] as u32;
                for c in 0..3 {
                    let mixed = (top[t + c] as u32 * alpha + base[b + c] as u32 * (255 - alpha)) / 255;
                    base[b + c] = mixed as u8;
                }
            }
        }
    }
}

impl Filter for Overlay {
    fn name(&self) -> &'static str {
        "overlay"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn num_inputs(&self) -> usize {
        2
    }

    fn filter(&mut self, pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = software("overlay", &mut frame)?;
        let rgba = to_rgba(pic).ok_or_else(|| {
            MediaError::InvalidArgument(format!("overlay: unsupported format {}", pic.format.name()))
        })?;
        if pad == 1 {
            self.top = Some((rgba, pic.width, pic.height));
            return Ok(());
        }
        if self.top.is_some() {
            let mut rgba = rgba;
            self.blend(&mut rgba, pic.width, pic.height);
            *pic = from_rgba(&rgba, pic.width, pic.height, pic.format).ok_or_else(|| {
                MediaError::InvalidArgument("overlay: cannot restore pixel format".into())
            })?;
        }
        out.push(frame);
        Ok(())
    }

    fn is_done(&self, ended: &[bool]) -> bool {
        ended.first().copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::parser::parse_graph;

    fn spec(desc: &str) -> FilterSpec {
        parse_graph(desc).unwrap().remove(0).remove(0)
    }

    fn gray(width: u32, height: u32, pts: i64) -> Frame {
        let mut pic = VideoFrame::new(PixelFormat::Gray8, width, height);
        for (i, px) in pic.planes[0].iter_mut().enumerate() {
            *px = i as u8;
        }
        Frame::video(pic, Some(pts), Rational::MILLIS)
    }

    fn run(filter: &mut dyn Filter, frame: Frame) -> Vec<Frame> {
        let mut out = Vec::new();
        filter.filter(0, frame, &mut out).unwrap();
        out
    }

    fn plane(frame: &Frame) -> &[u8] {
        &frame.as_video().unwrap().planes[0]
    }

    #[test]
    fn hflip_mirrors_rows() {
        let out = run(&mut HFlip, gray(3, 2, 0));
        assert_eq!(plane(&out[0]), &[2, 1, 0, 5, 4, 3]);
    }

    #[test]
    fn vflip_reverses_rows() {
        let out = run(&mut VFlip, gray(2, 3, 0));
        assert_eq!(plane(&out[0]), &[4, 5, 2, 3, 0, 1]);
    }

    #[test]
    fn hflip_keeps_rgba_pixels_intact() {
        let mut pic = VideoFrame::new(PixelFormat::Rgba, 2, 1);
        pic.planes[0] = vec![1, 2, 3, 4, 5, 6, 7, 8];
        let out = run(&mut HFlip, Frame::video(pic, Some(0), Rational::MILLIS));
        assert_eq!(plane(&out[0]), &[5, 6, 7, 8, 1, 2, 3, 4]);
    }

    #[test]
    fn crop_with_offset_and_centre() {
        let mut crop = Crop::from_spec(&spec("crop=2:1:1:1")).unwrap();
        let out = run(&mut crop, gray(4, 3, 0));
        assert_eq!(plane(&out[0]), &[5, 6]);

        let mut centred = Crop::from_spec(&spec("crop=2:1")).unwrap();
        let out = run(&mut centred, gray(4, 3, 0));
        assert_eq!(plane(&out[0]), &[5, 6]);
    }

    #[test]
    fn crop_planar_keeps_chroma_consistent() {
        let pic = VideoFrame::new(PixelFormat::Yuv420p, 8, 8);
        let mut crop = Crop::from_spec(&spec("crop=4:4:3:3")).unwrap();
        let out = run(&mut crop, Frame::video(pic, Some(0), Rational::MILLIS));
        let pic = out[0].as_video().unwrap();
        assert_eq!(pic.planes.iter().map(Vec::len).collect::<Vec<_>>(), vec![16, 4, 4]);
    }

    #[test]
    fn crop_larger_than_input_fails() {
        let mut crop = Crop::from_spec(&spec("crop=10:10")).unwrap();
        let mut out = Vec::new();
        assert!(crop.filter(0, gray(4, 4, 0), &mut out).is_err());
    }

    #[test]
    fn scale_nearest_and_aspect() {
        let mut scale = Scale::from_spec(&spec("scale=2:1")).unwrap();
        let out = run(&mut scale, gray(4, 2, 0));
        assert_eq!(plane(&out[0]), &[0, 2]);

        let mut keep = Scale::from_spec(&spec("scale=w=8:h=-1")).unwrap();
        let out = run(&mut keep, gray(4, 2, 0));
        let pic = out[0].as_video().unwrap();
        assert_eq!((pic.width, pic.height), (8, 4));
        assert!(Scale::from_spec(&spec("scale=-1:-1")).is_err());
    }

    #[test]
    fn fps_duplicates_gaps_and_drops_extras() {
        let mut fps = Fps::from_spec(&spec("fps=10")).unwrap();
        let mut out = Vec::new();
        // 0ms, 300ms, 310ms at 10 fps: slots 0, 3, 3
        for pts in [0, 300, 310] {
            fps.filter(0, gray(1, 1, pts), &mut out).unwrap();
        }
        fps.end(0, &mut out).unwrap();
        let slots: Vec<i64> = out.iter().map(|f| f.pts.unwrap()).collect();
        assert_eq!(slots, vec![0, 1, 2, 3]);
        assert!(out.iter().all(|f| f.time_base == Rational::new(1, 10)));
        // slot 3 carries the last frame to arrive
        assert_eq!(out[3].as_video().unwrap().planes[0][0], 0);
    }

    #[test]
    fn format_converts_and_rejects_hw() {
        let mut fmt = FormatFilter::from_spec(&spec("format=yuv420p")).unwrap();
        let out = run(&mut fmt, gray(2, 2, 0));
        assert_eq!(out[0].as_video().unwrap().format, PixelFormat::Yuv420p);
        assert!(FormatFilter::from_spec(&spec("format=hw")).is_err());
        assert!(FormatFilter::from_spec(&spec("format=p010")).is_err());
    }

    #[test]
    fn overlay_draws_latest_top_picture() {
        let mut overlay = Overlay::from_spec(&spec("overlay=1:0")).unwrap();
        let mut out = Vec::new();
        let mut top = VideoFrame::new(PixelFormat::Rgba, 1, 1);
        top.planes[0] = vec![255, 0, 0, 255];
        overlay
            .filter(1, Frame::video(top, Some(0), Rational::MILLIS), &mut out)
            .unwrap();
        assert!(out.is_empty());

        let base = VideoFrame::new(PixelFormat::Rgba, 2, 1);
        overlay
            .filter(0, Frame::video(base, Some(0), Rational::MILLIS), &mut out)
            .unwrap();
        assert_eq!(plane(&out[0]), &[0, 0, 0, 0, 255, 0, 0, 0]);
        assert!(overlay.is_done(&[true, false]));
        assert!(!overlay.is_done(&[false, true]));
    }
}
