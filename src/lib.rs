//! broxeen-watch: multi-camera watch service.
//!
//! Every camera gets a capture thread ([`producer::StreamProducer`]) and an
//! analysis task ([`consumer::AnalysisConsumer`]) joined by a single-slot
//! [`mailbox::FrameMailbox`]. Verdicts from a vision LLM drive tiered alerts
//! with per-tier cooldowns ([`alert`]).

pub mod alert;
pub mod audio;
pub mod capture;
pub mod capture_ffmpeg;
#[cfg(feature = "opencv")]
pub mod capture_opencv;
pub mod config;
pub mod consumer;
pub mod error;
pub mod export;
pub mod heartbeat;
pub mod inference;
pub mod logging;
pub mod mailbox;
pub mod metrics;
pub mod notifier;
pub mod producer;
pub mod supervisor;
