//! Error types, one per collaborator boundary.
//!
//! Every per-camera unit converts these into log lines at its own boundary;
//! none of them is allowed to escape a producer or consumer loop.

use thiserror::Error;

/// Video source cannot be opened or read.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("failed to open source {uri}: {reason}")]
    Open { uri: String, reason: String },
    #[error("read failed: {0}")]
    Read(String),
    #[error("source ended")]
    EndOfStream,
    #[error("frame decode failed: {0}")]
    Decode(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Network or decoding failure talking to the inference service.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("inference request timed out")]
    Timeout,
    #[error("inference transport error: {0}")]
    Transport(String),
    #[error("inference HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected inference response: {0}")]
    Malformed(String),
    #[error("image encode failed: {0}")]
    Encode(String),
}

impl From<reqwest::Error> for InferenceError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            InferenceError::Timeout
        } else {
            InferenceError::Transport(e.to_string())
        }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("notifier transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio backend unavailable: {0}")]
    Unavailable(String),
    #[error("audio playback failed: {0}")]
    Playback(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics HTTP {0}")]
    Status(u16),
    #[error("metrics transport error: {0}")]
    Transport(#[from] reqwest::Error),
}

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("frame export failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Startup configuration problems. `Camera` is scoped to a single camera and
/// only prevents that camera from registering.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),
    #[error("camera {camera}: {reason}")]
    Camera { camera: String, reason: String },
    #[error("no valid cameras configured")]
    NoCameras,
}
