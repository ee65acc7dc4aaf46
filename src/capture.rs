//! Video source abstraction.
//!
//! A [`SourceConnector`] opens a [`FrameSource`] for a URI; the producer owns
//! the source for as long as it is streaming and drops it on reconnect or
//! stop. Reads are blocking and run on the producer's own thread.

use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{SourceBackend, StreamConfig};
use crate::error::SourceError;

/// Unblocks a read in progress on another thread. After it fires the source
/// only returns errors.
pub type AbortHandle = Arc<dyn Fn() + Send + Sync>;

/// An opened stream.
pub trait FrameSource: Send {
    /// Pull the next buffered frame without decoding it.
    fn grab(&mut self) -> Result<(), SourceError>;

    /// Read and decode the next frame.
    fn read(&mut self) -> Result<RgbImage, SourceError>;

    /// Release the underlying handle. Called before drop on reconnect/stop.
    fn release(&mut self) {}

    /// Handle the stop path can fire while `grab`/`read` is blocked.
    fn abort_handle(&self) -> Option<AbortHandle> {
        None
    }
}

pub trait SourceConnector: Send + Sync {
    fn connect(&self, uri: &str) -> Result<Box<dyn FrameSource>, SourceError>;
}

/// Wait before the next connect attempt after `attempt` consecutive failed
/// attempts (0-based): `min(base * 2^attempt, cap)`.
pub fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
    base.checked_mul(factor).unwrap_or(cap).min(cap)
}

/// Connector for the configured backend.
pub fn connector_for(cfg: &StreamConfig) -> Result<Arc<dyn SourceConnector>, SourceError> {
    match cfg.backend {
        SourceBackend::Ffmpeg => Ok(Arc::new(crate::capture_ffmpeg::FfmpegConnector::new(
            &cfg.ffmpeg_path,
            &cfg.rtsp_transport,
        ))),
        #[cfg(feature = "opencv")]
        SourceBackend::Opencv => Ok(Arc::new(crate::capture_opencv::OpencvConnector)),
        #[cfg(not(feature = "opencv"))]
        SourceBackend::Opencv => Err(SourceError::Open {
            uri: String::new(),
            reason: "built without the `opencv` feature".into(),
        }),
    }
}
