/// Analysis consumer — one per camera
///
/// Loop:
///   take newest frame (skip if already analysed) → downscale → JPEG →
///   analyzer → AnalysisResult → AlertDispatcher → export → sleep interval
///
/// Inference failures become a zero-score sentinel result; the loop only ends
/// on the stop signal.
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::alert::{AlertDispatcher, Decision};
use crate::config::CameraConfig;
use crate::error::InferenceError;
use crate::export::FrameExporter;
use crate::inference::{FrameAnalyzer, Verdict};
use crate::mailbox::{Frame, FrameMailbox};

/// Wait between mailbox checks when no new frame is available.
pub const POLL_DELAY: Duration = Duration::from_millis(250);

const HUMAN_KEYWORDS: [&str; 7] = ["human", "humano", "persona", "person", "people", "hombre", "mujer"];

/// One analysis cycle's outcome.
#[derive(Debug, Clone)]
pub struct AnalysisResult {
    /// In [0, 1]; 0.0 for a sentinel.
    pub score: f64,
    pub description: String,
    pub human_present: bool,
    pub image_jpeg: Vec<u8>,
    pub captured_at: DateTime<Utc>,
    /// Sentinel produced by a failed inference call or unreadable verdict.
    pub failed: bool,
}

impl AnalysisResult {
    fn sentinel(cause: impl std::fmt::Display, image_jpeg: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self {
            score: 0.0,
            description: format!("Analysis error: {}", cause),
            human_present: false,
            image_jpeg,
            captured_at,
            failed: true,
        }
    }
}

pub fn mentions_human(description: &str) -> bool {
    let lower = description.to_lowercase();
    HUMAN_KEYWORDS.iter().any(|k| lower.contains(k))
}

/// Shrink to `max_width` keeping the aspect ratio; smaller frames pass through.
pub fn downscale(image: RgbImage, max_width: u32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w <= max_width || max_width == 0 {
        return image;
    }
    let new_h = ((h as f64) * (max_width as f64) / (w as f64)).round().max(1.0) as u32;
    imageops::resize(&image, max_width, new_h, FilterType::Triangle)
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, InferenceError> {
    let mut buf = Vec::with_capacity(64 * 1024);
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|e| InferenceError::Encode(e.to_string()))?;
    Ok(buf)
}

/// Downscale, encode and classify one frame. Never fails: errors are folded
/// into a sentinel result.
pub async fn analyze_frame(
    analyzer: &dyn FrameAnalyzer,
    camera: &CameraConfig,
    frame: Frame,
) -> AnalysisResult {
    let captured_at = frame.captured_at;
    let image = downscale(frame.image, camera.max_width);

    let jpeg = match encode_jpeg(&image, camera.jpeg_quality) {
        Ok(j) => j,
        Err(e) => return AnalysisResult::sentinel(e, Vec::new(), captured_at),
    };

    match analyzer.analyze(&camera.prompt, &jpeg).await {
        Ok(Verdict::Parsed {
            score,
            description,
            human,
        }) => {
            let human_present = human.unwrap_or_else(|| mentions_human(&description));
            AnalysisResult {
                score,
                description,
                human_present,
                image_jpeg: jpeg,
                captured_at,
                failed: false,
            }
        }
        Ok(Verdict::ParseError { raw, cause }) => {
            debug!("[{}] unparseable verdict: {}", camera.name, raw);
            AnalysisResult::sentinel(format!("invalid model response ({})", cause), jpeg, captured_at)
        }
        Err(e) => AnalysisResult::sentinel(e, jpeg, captured_at),
    }
}

pub struct AnalysisConsumer {
    camera: Arc<CameraConfig>,
    mailbox: Arc<FrameMailbox>,
    analyzer: Arc<dyn FrameAnalyzer>,
    dispatcher: AlertDispatcher,
    exporter: Arc<dyn FrameExporter>,
    stop: watch::Receiver<bool>,
    last_seq: u64,
}

impl AnalysisConsumer {
    pub fn new(
        camera: Arc<CameraConfig>,
        mailbox: Arc<FrameMailbox>,
        analyzer: Arc<dyn FrameAnalyzer>,
        dispatcher: AlertDispatcher,
        exporter: Arc<dyn FrameExporter>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            camera,
            mailbox,
            analyzer,
            dispatcher,
            exporter,
            stop,
            last_seq: 0,
        }
    }

    pub fn dispatcher(&self) -> &AlertDispatcher {
        &self.dispatcher
    }

    /// Analyse the newest unseen frame, if any. `None` when the mailbox holds
    /// nothing new since the previous cycle.
    pub async fn run_once(&mut self) -> Option<(AnalysisResult, Decision)> {
        let frame = self.mailbox.take_newer(self.last_seq)?;
        self.last_seq = frame.seq;
        let name = self.camera.name.as_str();

        let result = analyze_frame(self.analyzer.as_ref(), &self.camera, frame).await;
        if result.failed {
            warn!("[{}] {}", name, result.description);
        } else {
            info!(
                "[{}] score={:.2} human={} | {}",
                name, result.score, result.human_present, result.description
            );
        }

        let decision = self.dispatcher.dispatch(&result, Utc::now()).await;

        if !result.image_jpeg.is_empty() {
            if let Err(e) = self.exporter.export(name, &result.image_jpeg).await {
                warn!("[{}] {}", name, e);
            }
        }

        Some((result, decision))
    }

    pub async fn run(mut self) {
        info!(
            "[{}] consumer started (interval {:?}, analyzer {})",
            self.camera.name,
            self.camera.interval,
            self.analyzer.label()
        );

        loop {
            if *self.stop.borrow() {
                break;
            }

            let wait = match self.run_once().await {
                Some(_) => self.camera.interval,
                None => POLL_DELAY,
            };

            if self.sleep_or_stop(wait).await {
                break;
            }
        }

        info!("[{}] consumer stopped", self.camera.name);
    }

    /// Returns true when the stop signal fired (or its sender is gone).
    async fn sleep_or_stop(&mut self, wait: Duration) -> bool {
        if wait.is_zero() {
            tokio::task::yield_now().await;
            return *self.stop.borrow();
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => *self.stop.borrow(),
            changed = self.stop.changed() => changed.is_err() || *self.stop.borrow(),
        }
    }
}
