use image::RgbImage;
use opencv::{
    core::Mat,
    imgproc,
    prelude::*,
    videoio::{VideoCapture, CAP_FFMPEG, CAP_PROP_BUFFERSIZE, CAP_PROP_FPS},
};
use tracing::info;

use crate::capture::{FrameSource, SourceConnector};
use crate::capture_ffmpeg::redact;
use crate::error::SourceError;

/// Opens streams through OpenCV's FFmpeg backend.
pub struct OpencvConnector;

impl SourceConnector for OpencvConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        let open_err = |reason: String| SourceError::Open {
            uri: redact(uri),
            reason,
        };

        let mut cap = VideoCapture::from_file(uri, CAP_FFMPEG).map_err(|e| open_err(e.to_string()))?;
        if !cap.is_opened().unwrap_or(false) {
            return Err(open_err("VideoCapture not opened".into()));
        }

        // Small buffer — we want fresh frames, not queued ones
        cap.set(CAP_PROP_BUFFERSIZE, 1.0).ok();

        let native_fps = cap.get(CAP_PROP_FPS).unwrap_or(25.0);
        info!("OpenCV source opened: {} (native FPS {:.1})", redact(uri), native_fps);

        Ok(Box::new(OpencvSource { cap }))
    }
}

pub struct OpencvSource {
    cap: VideoCapture,
}

impl FrameSource for OpencvSource {
    fn grab(&mut self) -> Result<(), SourceError> {
        match self.cap.grab() {
            Ok(true) => Ok(()),
            Ok(false) => Err(SourceError::Read("grab returned false".into())),
            Err(e) => Err(SourceError::Read(e.to_string())),
        }
    }

    fn read(&mut self) -> Result<RgbImage, SourceError> {
        let mut frame = Mat::default();
        let ok = self
            .cap
            .read(&mut frame)
            .map_err(|e| SourceError::Read(e.to_string()))?;
        if !ok || frame.empty() {
            return Err(SourceError::Read("empty frame — stream may have dropped".into()));
        }
        mat_to_rgb(&frame)
    }

    fn release(&mut self) {
        let _ = self.cap.release();
    }
}

fn mat_to_rgb(bgr: &Mat) -> Result<RgbImage, SourceError> {
    let mut rgb = Mat::default();
    imgproc::cvt_color_def(bgr, &mut rgb, imgproc::COLOR_BGR2RGB)
        .map_err(|e| SourceError::Decode(e.to_string()))?;

    let width = rgb.cols() as u32;
    let height = rgb.rows() as u32;
    let bytes = rgb
        .data_bytes()
        .map_err(|e| SourceError::Decode(e.to_string()))?
        .to_vec();

    RgbImage::from_raw(width, height, bytes)
        .ok_or_else(|| SourceError::Decode(format!("buffer does not match {}x{}", width, height)))
}
