//! Device memory transfer nodes.
//!
//! Surfaces are modelled as the host planes tagged with a
//! [`FramesContext`]: `hwupload` switches the frame to
//! [`PixelFormat::Hw`] and attaches the context, `hwdownload` restores the
//! software layout recorded in it. The frames context is created from the
//! first uploaded picture and shared by every later one of the same size.

use std::sync::Arc;

use capline_common::{Frame, FramesContext, MediaError, MediaKind, MediaResult, PixelFormat};
use capline_gpu_hal::DeviceContext;
use tracing::debug;

use super::filter::Filter;

#[derive(Default)]
pub struct HwUpload {
    device: Option<Arc<DeviceContext>>,
    frames: Option<Arc<FramesContext>>,
}

impl HwUpload {
    fn frames_for(&mut self, sw_format: PixelFormat, width: u32, height: u32) -> MediaResult<Arc<FramesContext>> {
        let device = self
            .device
            .as_ref()
            .ok_or_else(|| MediaError::NotReady("hwupload has no device bound".into()))?;
        match &self.frames {
            Some(frames)
                if frames.sw_format == sw_format && frames.width == width && frames.height == height =>
            {
                Ok(Arc::clone(frames))
            }
            _ => {
                let frames = Arc::new(FramesContext::new(device.device_type(), sw_format, width, height));
                debug!(
                    device = %device.device_type(),
                    frames_id = frames.id,
                    width,
                    height,
                    "Created frames context"
                );
                self.frames = Some(Arc::clone(&frames));
                Ok(frames)
            }
        }
    }
}

impl Filter for HwUpload {
    fn name(&self) -> &'static str {
        "hwupload"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = frame
            .as_video_mut()
            .ok_or_else(|| MediaError::InvalidArgument("hwupload: not a video frame".into()))?;
        if !pic.format.is_hardware() {
            let frames = self.frames_for(pic.format, pic.width, pic.height)?;
            pic.format = PixelFormat::Hw;
            pic.hw = Some(frames);
        }
        out.push(frame);
        Ok(())
    }

    fn bind_device(&mut self, device: &Arc<DeviceContext>) -> bool {
        self.device = Some(Arc::clone(device));
        true
    }

    fn output_frames_context(&self) -> Option<Arc<FramesContext>> {
        self.frames.clone()
    }
}

pub struct HwDownload;

impl Filter for HwDownload {
    fn name(&self) -> &'static str {
        "hwdownload"
    }

    fn kind(&self) -> MediaKind {
        MediaKind::Video
    }

    fn filter(&mut self, _pad: usize, mut frame: Frame, out: &mut Vec<Frame>) -> MediaResult<()> {
        let pic = frame
            .as_video_mut()
            .ok_or_else(|| MediaError::InvalidArgument("hwdownload: not a video frame".into()))?;
        if pic.format.is_hardware() {
            let frames = pic.hw.take().ok_or_else(|| {
                MediaError::InvalidArgument("hwdownload: surface has no frames context".into())
            })?;
            pic.format = frames.sw_format;
        }
        out.push(frame);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use capline_common::{DeviceType, Rational, VideoFrame};
    use capline_gpu_hal::{DeviceRegistry, StaticProbe};

    fn device() -> Arc<DeviceContext> {
        DeviceRegistry::new(StaticProbe::new([DeviceType::Vaapi]))
            .find_or_create(DeviceType::Vaapi)
            .unwrap()
    }

    fn picture() -> Frame {
        let mut pic = VideoFrame::new(PixelFormat::Nv12, 4, 2);
        pic.planes[0][0] = 9;
        Frame::video(pic, Some(0), Rational::MILLIS)
    }

    #[test]
    fn upload_without_device_is_not_ready() {
        let mut up = HwUpload::default();
        let mut out = Vec::new();
        assert!(matches!(
            up.filter(0, picture(), &mut out),
            Err(MediaError::NotReady(_))
        ));
    }

    #[test]
    fn upload_then_download_restores_layout() {
        let mut up = HwUpload::default();
        assert!(up.bind_device(&device()));
        let mut out = Vec::new();
        up.filter(0, picture(), &mut out).unwrap();
        up.filter(0, picture(), &mut out).unwrap();

        let first = out[0].as_video().unwrap();
        assert_eq!(first.format, PixelFormat::Hw);
        let ctx = up.output_frames_context().unwrap();
        assert_eq!(ctx.sw_format, PixelFormat::Nv12);
        assert_eq!(ctx.device, DeviceType::Vaapi);
        // one context shared by same-sized surfaces
        assert_eq!(out[1].as_video().unwrap().hw.as_ref().unwrap().id, ctx.id);

        let mut down = Vec::new();
        HwDownload.filter(0, out.remove(0), &mut down).unwrap();
        let pic = down[0].as_video().unwrap();
        assert_eq!(pic.format, PixelFormat::Nv12);
        assert!(pic.hw.is_none());
        assert_eq!(pic.planes[0][0], 9);
    }
}
