//! Software pixel format conversion through packed RGBA (BT.601, full range).

use crate::color::PixelFormat;
use crate::frame::VideoFrame;

#[inline]
fn clamp_u8(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}

#[inline]
fn rgb_to_yuv(r: f32, g: f32, b: f32) -> (f32, f32, f32) {
    let y = 0.299 * r + 0.587 * g + 0.114 * b;
    let u = -0.168_736 * r - 0.331_264 * g + 0.5 * b + 128.0;
    let v = 0.5 * r - 0.418_688 * g - 0.081_312 * b + 128.0;
    (y, u, v)
}

#[inline]
fn yuv_to_rgb(y: f32, u: f32, v: f32) -> [u8; 3] {
    let (u, v) = (u - 128.0, v - 128.0);
    [
        clamp_u8(y + 1.402 * v),
        clamp_u8(y - 0.344_136 * u - 0.714_136 * v),
        clamp_u8(y + 1.772 * u),
    ]
}

/// Expand a software picture to packed RGBA. `None` for hardware frames or
/// planes too short for the declared size.
pub fn to_rgba(frame: &VideoFrame) -> Option<Vec<u8>> {
    let (w, h) = (frame.width as usize, frame.height as usize);
    let sizes = frame.format.plane_sizes(frame.width, frame.height);
    if frame.format.is_hardware()
        || frame.planes.len() != sizes.len()
        || frame.planes.iter().zip(&sizes).any(|(p, s)| p.len() < *s)
    {
        return None;
    }
    let mut out = vec![0u8; w * h * 4];
    let cw = w.div_ceil(2);
    for y in 0..h {
        for x in 0..w {
            let i = y * w + x;
            let px = match frame.format {
                PixelFormat::Rgba => {
                    let p = &frame.planes[0][i * 4..i * 4 + 4];
                    [p[0], p[1], p[2], p[3]]
                }
                PixelFormat::Bgra => {
                    let p = &frame.planes[0][i * 4..i * 4 + 4];
                    [p[2], p[1], p[0], p[3]]
                }
                PixelFormat::Rgb24 => {
                    let p = &frame.planes[0][i * 3..i * 3 + 3];
                    [p[0], p[1], p[2], 255]
                }
                PixelFormat::Gray8 => {
                    let l = frame.planes[0][i];
                    [l, l, l, 255]
                }
                PixelFormat::Yuv420p => {
                    let c = (y / 2) * cw + x / 2;
                    let [r, g, b] = yuv_to_rgb(
                        frame.planes[0][i] as f32,
                        frame.planes[1][c] as f32,
                        frame.planes[2][c] as f32,
                    );
                    [r, g, b, 255]
                }
                PixelFormat::Nv12 => {
                    let c = ((y / 2) * cw + x / 2) * 2;
                    let [r, g, b] = yuv_to_rgb(
                        frame.planes[0][i] as f32,
                        frame.planes[1][c] as f32,
                        frame.planes[1][c + 1] as f32,
                    );
                    [r, g, b, 255]
                }
                PixelFormat::Hw => return None,
            };
            out[i * 4..i * 4 + 4].copy_from_slice(&px);
        }
    }
    Some(out)
}

/// Pack RGBA pixels into `format`. Chroma is averaged over 2x2 blocks.
pub fn from_rgba(rgba: &[u8], width: u32, height: u32, format: PixelFormat) -> Option<VideoFrame> {
    let (w, h) = (width as usize, height as usize);
    if format.is_hardware() || rgba.len() < w * h * 4 {
        return None;
    }
    let mut frame = VideoFrame::new(format, width, height);
    match format {
        PixelFormat::Rgba => frame.planes[0].copy_from_slice(&rgba[..w * h * 4]),
        PixelFormat::Bgra | PixelFormat::Rgb24 | PixelFormat::Gray8 => {
            let bpp = format.bytes_per_pixel().unwrap_or(1);
            let dst = &mut frame.planes[0];
            for (i, px) in rgba.chunks_exact(4).take(w * h).enumerate() {
                let o = i * bpp;
                match format {
                    PixelFormat::Bgra => dst[o..o + 4].copy_from_slice(&[px[2], px[1], px[0], px[3]]),
                    PixelFormat::Rgb24 => dst[o..o + 3].copy_from_slice(&px[..3]),
                    _ => {
                        let (l, _, _) = rgb_to_yuv(px[0] as f32, px[1] as f32, px[2] as f32);
                        dst[o] = clamp_u8(l);
                    }
                }
            }
        }
        PixelFormat::Yuv420p | PixelFormat::Nv12 => {
            let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
            for y in 0..h {
                for x in 0..w {
                    let i = (y * w + x) * 4;
                    let (l, _, _) =
                        rgb_to_yuv(rgba[i] as f32, rgba[i + 1] as f32, rgba[i + 2] as f32);
                    frame.planes[0][y * w + x] = clamp_u8(l);
                }
            }
            for cy in 0..ch {
                for cx in 0..cw {
                    let (mut su, mut sv, mut n) = (0.0f32, 0.0f32, 0.0f32);
                    for y in (cy * 2)..((cy * 2 + 2).min(h)) {
                        for x in (cx * 2)..((cx * 2 + 2).min(w)) {
                            let i = (y * w + x) * 4;
                            let (_, u, v) =
                                rgb_to_yuv(rgba[i] as f32, rgba[i + 1] as f32, rgba[i + 2] as f32);
                            su += u;
                            sv += v;
                            n += 1.0;
                        }
                    }
                    let (u, v) = (clamp_u8(su / n), clamp_u8(sv / n));
                    let c = cy * cw + cx;
                    if format == PixelFormat::Yuv420p {
                        frame.planes[1][c] = u;
                        frame.planes[2][c] = v;
                    } else {
                        frame.planes[1][c * 2] = u;
                        frame.planes[1][c * 2 + 1] = v;
                    }
                }
            }
        }
        PixelFormat::Hw => return None,
    }
    Some(frame)
}

/// Convert a software picture to another software format.
pub fn convert(frame: &VideoFrame, format: PixelFormat) -> Option<VideoFrame> {
    if frame.format == format {
        return Some(frame.clone());
    }
    let rgba = to_rgba(frame)?;
    from_rgba(&rgba, frame.width, frame.height, format)
}
