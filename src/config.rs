/// Watch configuration
///
/// Loaded from broxeen-watch.toml (working directory) with env-var overrides.
/// Env format: BROXEEN__SECTION__KEY (double underscore separators), e.g.
/// BROXEEN__CAMERAS__GATE__URL or BROXEEN__INFERENCE__MODEL.
///
/// The raw, serde-shaped config is validated once into an immutable
/// [`AppConfig`]; nothing downstream reads the environment.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::alert::AlertPolicy;
use crate::error::ConfigError;

// ─── Raw (deserialized) shape ───────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawConfig {
    #[serde(default)]
    pub cameras: BTreeMap<String, CameraEntry>,
    #[serde(default)]
    pub defaults: CameraDefaults,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default)]
    pub inference: InferenceConfig,
    #[serde(default)]
    pub telegram: TelegramConfig,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One `[cameras.<key>]` table. Everything except `url` falls back to
/// `[defaults]`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CameraEntry {
    /// Display name; the table key (upper-cased) when absent.
    pub name: Option<String>,
    pub url: Option<String>,
    pub prompt: Option<String>,
    pub critical_threshold: Option<f64>,
    pub warning_threshold: Option<f64>,
    pub human_min_score: Option<f64>,
    pub critical_cooldown_secs: Option<u64>,
    pub warning_cooldown_secs: Option<u64>,
    pub human_cooldown_secs: Option<u64>,
    pub max_width: Option<u32>,
    pub jpeg_quality: Option<u8>,
    pub interval_secs: Option<f64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CameraDefaults {
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_critical_threshold")]
    pub critical_threshold: f64,
    #[serde(default = "default_warning_threshold")]
    pub warning_threshold: f64,
    #[serde(default = "default_human_min_score")]
    pub human_min_score: f64,
    #[serde(default = "default_critical_cooldown")]
    pub critical_cooldown_secs: u64,
    #[serde(default = "default_warning_cooldown")]
    pub warning_cooldown_secs: u64,
    #[serde(default = "default_human_cooldown")]
    pub human_cooldown_secs: u64,
    #[serde(default = "default_max_width")]
    pub max_width: u32,
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,
    #[serde(default = "default_interval_secs")]
    pub interval_secs: f64,
}

fn default_critical_threshold() -> f64 {
    0.8
}
fn default_warning_threshold() -> f64 {
    0.4
}
fn default_human_min_score() -> f64 {
    0.2
}
fn default_critical_cooldown() -> u64 {
    60
}
fn default_warning_cooldown() -> u64 {
    120
}
fn default_human_cooldown() -> u64 {
    300
}
fn default_max_width() -> u32 {
    960
}
fn default_jpeg_quality() -> u8 {
    85
}
fn default_interval_secs() -> f64 {
    60.0
}

impl Default for CameraDefaults {
    fn default() -> Self {
        Self {
            prompt: String::new(),
            critical_threshold: default_critical_threshold(),
            warning_threshold: default_warning_threshold(),
            human_min_score: default_human_min_score(),
            critical_cooldown_secs: default_critical_cooldown(),
            warning_cooldown_secs: default_warning_cooldown(),
            human_cooldown_secs: default_human_cooldown(),
            max_width: default_max_width(),
            jpeg_quality: default_jpeg_quality(),
            interval_secs: default_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceBackend {
    Ffmpeg,
    Opencv,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_backend")]
    pub backend: SourceBackend,
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,
    #[serde(default = "default_transport")]
    pub rtsp_transport: String,
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    #[serde(default = "default_backoff_cap_secs")]
    pub backoff_cap_secs: u64,
    /// Consecutive failures (connect or read) tolerated before the camera
    /// gives up for good.
    #[serde(default = "default_max_failures")]
    pub max_failures: u32,
    /// Consecutive read failures that force a full reconnect.
    #[serde(default = "default_reconnect_after")]
    pub reconnect_after: u32,
    /// Buffered frames dropped before each meaningful read.
    #[serde(default = "default_discard_frames")]
    pub discard_frames: u32,
    /// Pause after a failed read before trying the same connection again.
    #[serde(default = "default_read_retry_ms")]
    pub read_retry_ms: u64,
}

fn default_backend() -> SourceBackend {
    SourceBackend::Ffmpeg
}
fn default_ffmpeg_path() -> String {
    "ffmpeg".to_string()
}
fn default_transport() -> String {
    "tcp".to_string()
}
fn default_base_backoff_ms() -> u64 {
    5_000
}
fn default_backoff_cap_secs() -> u64 {
    60
}
fn default_max_failures() -> u32 {
    10
}
fn default_reconnect_after() -> u32 {
    5
}
fn default_discard_frames() -> u32 {
    2
}
fn default_read_retry_ms() -> u64 {
    2_000
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            ffmpeg_path: default_ffmpeg_path(),
            rtsp_transport: default_transport(),
            base_backoff_ms: default_base_backoff_ms(),
            backoff_cap_secs: default_backoff_cap_secs(),
            max_failures: default_max_failures(),
            reconnect_after: default_reconnect_after(),
            discard_frames: default_discard_frames(),
            read_retry_ms: default_read_retry_ms(),
        }
    }
}

impl StreamConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_millis(self.base_backoff_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_secs)
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct InferenceConfig {
    /// OpenAI-compatible base URL (LM Studio, Ollama, a proxy in front of them)
    #[serde(default = "default_inference_url")]
    pub base_url: String,
    #[serde(default = "default_inference_path")]
    pub path: String,
    #[serde(default = "default_model")]
    pub model: String,
    /// Prefer env INFERENCE_API_KEY
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

fn default_inference_url() -> String {
    "http://localhost:1234/v1".to_string()
}
fn default_inference_path() -> String {
    "/chat/completions".to_string()
}
fn default_model() -> String {
    "qwen3-vl-8b".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_tokens() -> u32 {
    700
}
fn default_temperature() -> f32 {
    0.1
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            base_url: default_inference_url(),
            path: default_inference_path(),
            model: default_model(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
        }
    }
}

impl InferenceConfig {
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub chat_id: Option<String>,
    #[serde(default = "default_telegram_api")]
    pub api_base: String,
}

fn default_telegram_api() -> String {
    "https://api.telegram.org".to_string()
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            chat_id: None,
            api_base: default_telegram_api(),
        }
    }
}

impl TelegramConfig {
    pub fn is_configured(&self) -> bool {
        matches!((&self.bot_token, &self.chat_id), (Some(t), Some(c)) if !t.is_empty() && !c.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AudioConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Pre-rendered siren WAV played on CRITICAL.
    pub siren_path: Option<String>,
    #[serde(default = "default_volume")]
    pub siren_volume: f32,
    /// Player used for the siren when built without the `rodio` feature.
    #[serde(default = "default_player")]
    pub player: String,
    /// Speak `speech_phrase` on WARNING.
    #[serde(default)]
    pub speech_on_warning: bool,
    #[serde(default = "default_phrase")]
    pub speech_phrase: String,
    #[serde(default = "default_voice")]
    pub speech_voice: String,
    #[serde(default = "default_speech_repeat")]
    pub speech_repeat: u32,
    #[serde(default = "default_speech_pause_secs")]
    pub speech_pause_secs: u64,
}

fn default_volume() -> f32 {
    1.0
}
fn default_player() -> String {
    "paplay".to_string()
}
fn default_phrase() -> String {
    "Warning. Suspicious activity detected.".to_string()
}
fn default_voice() -> String {
    "en".to_string()
}
fn default_speech_repeat() -> u32 {
    3
}
fn default_speech_pause_secs() -> u64 {
    3
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            siren_path: None,
            siren_volume: default_volume(),
            player: default_player(),
            speech_on_warning: false,
            speech_phrase: default_phrase(),
            speech_voice: default_voice(),
            speech_repeat: default_speech_repeat(),
            speech_pause_secs: default_speech_pause_secs(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_heartbeat_secs")]
    pub interval_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_heartbeat_secs() -> u64 {
    3600
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_heartbeat_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_export_dir")]
    pub dir: String,
}

fn default_export_dir() -> String {
    "last_frames".to_string()
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_export_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Daily-rotated file sink in addition to stdout.
    #[serde(default = "default_true")]
    pub file: bool,
    /// Overrides `<data_dir>/broxeen/logs`.
    pub dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { file: true, dir: None }
    }
}

// ─── Validated shape ────────────────────────────────────────────────────────

/// One camera, immutable after load.
#[derive(Debug, Clone)]
pub struct CameraConfig {
    pub name: String,
    pub url: String,
    pub prompt: String,
    pub policy: AlertPolicy,
    pub max_width: u32,
    pub jpeg_quality: u8,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub cameras: Vec<Arc<CameraConfig>>,
    pub stream: StreamConfig,
    pub inference: InferenceConfig,
    pub telegram: TelegramConfig,
    pub audio: AudioConfig,
    pub metrics: MetricsConfig,
    pub heartbeat: HeartbeatConfig,
    pub export: ExportConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Validate every camera independently. A bad camera is returned in the
    /// rejection list and does not stop the others from registering.
    pub fn from_raw(raw: RawConfig) -> (Self, Vec<ConfigError>) {
        let mut cameras: Vec<Arc<CameraConfig>> = Vec::new();
        let mut rejected = Vec::new();

        for (key, entry) in &raw.cameras {
            match build_camera(key, entry, &raw.defaults, &raw.audio) {
                Ok(cam) => {
                    if cameras.iter().any(|c| c.name == cam.name) {
                        rejected.push(ConfigError::Camera {
                            camera: cam.name.clone(),
                            reason: "duplicate camera name".into(),
                        });
                    } else {
                        cameras.push(Arc::new(cam));
                    }
                }
                Err(e) => rejected.push(e),
            }
        }

        let app = AppConfig {
            cameras,
            stream: raw.stream,
            inference: raw.inference,
            telegram: raw.telegram,
            audio: raw.audio,
            metrics: raw.metrics,
            heartbeat: raw.heartbeat,
            export: raw.export,
            logging: raw.logging,
        };
        (app, rejected)
    }

    pub fn camera(&self, name: &str) -> Option<&Arc<CameraConfig>> {
        self.cameras.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

/// Upper-case, non-alphanumerics replaced by `_`.
pub fn normalize_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

fn build_camera(
    key: &str,
    entry: &CameraEntry,
    defaults: &CameraDefaults,
    audio: &AudioConfig,
) -> Result<CameraConfig, ConfigError> {
    let name = normalize_name(entry.name.as_deref().unwrap_or(key));
    let reject = |reason: String| ConfigError::Camera {
        camera: name.clone(),
        reason,
    };

    if name.is_empty() {
        return Err(reject("empty camera name".into()));
    }

    let url = entry
        .url
        .as_deref()
        .map(str::trim)
        .filter(|u| !u.is_empty())
        .ok_or_else(|| reject("missing source url".into()))?
        .to_string();

    let critical = entry.critical_threshold.unwrap_or(defaults.critical_threshold);
    let warning = entry.warning_threshold.unwrap_or(defaults.warning_threshold);
    let human_min = entry.human_min_score.unwrap_or(defaults.human_min_score);

    for (label, v) in [("critical_threshold", critical), ("warning_threshold", warning), ("human_min_score", human_min)] {
        if !(0.0..=1.0).contains(&v) {
            return Err(reject(format!("{label}={v} outside [0, 1]")));
        }
    }
    if warning > critical {
        return Err(reject(format!(
            "warning_threshold {warning} above critical_threshold {critical}"
        )));
    }

    let max_width = entry.max_width.unwrap_or(defaults.max_width);
    if max_width == 0 {
        return Err(reject("max_width must be positive".into()));
    }
    let jpeg_quality = entry.jpeg_quality.unwrap_or(defaults.jpeg_quality);
    if !(1..=100).contains(&jpeg_quality) {
        return Err(reject(format!("jpeg_quality={jpeg_quality} outside 1..=100")));
    }
    let interval_secs = entry.interval_secs.unwrap_or(defaults.interval_secs);
    let interval = Duration::try_from_secs_f64(interval_secs)
        .map_err(|e| reject(format!("interval_secs={interval_secs} invalid: {e}")))?;

    let prompt = entry
        .prompt
        .clone()
        .unwrap_or_else(|| defaults.prompt.clone());

    Ok(CameraConfig {
        name,
        url,
        prompt,
        policy: AlertPolicy {
            critical_threshold: critical,
            warning_threshold: warning,
            human_min_score: human_min,
            critical_cooldown: Duration::from_secs(
                entry.critical_cooldown_secs.unwrap_or(defaults.critical_cooldown_secs),
            ),
            warning_cooldown: Duration::from_secs(
                entry.warning_cooldown_secs.unwrap_or(defaults.warning_cooldown_secs),
            ),
            human_cooldown: Duration::from_secs(
                entry.human_cooldown_secs.unwrap_or(defaults.human_cooldown_secs),
            ),
            siren: audio.enabled,
            speech_on_warning: audio.enabled && audio.speech_on_warning,
        },
        max_width,
        jpeg_quality,
        interval,
    })
}

/// Load configuration from broxeen-watch.toml + environment variable overrides.
///
/// Search order:
///   1. `path` if given, else ./broxeen-watch.toml (optional)
///   2. Environment variables: BROXEEN__CAMERAS__GATE__URL, etc.
///   3. Convenience vars: TELEGRAM_BOT_TOKEN, TELEGRAM_CHAT_ID, INFERENCE_API_KEY
pub fn load_raw(path: Option<&Path>) -> Result<RawConfig, ConfigError> {
    let file = match path {
        Some(p) => config::File::from(p).required(true),
        None => config::File::with_name("broxeen-watch").required(false),
    };

    let settings = config::Config::builder()
        .add_source(file)
        .add_source(
            config::Environment::with_prefix("BROXEEN")
                .separator("__")
                .try_parsing(true),
        )
        .build()?;
    let mut raw: RawConfig = settings.try_deserialize()?;

    if raw.telegram.bot_token.is_none() {
        raw.telegram.bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok();
    }
    if raw.telegram.chat_id.is_none() {
        raw.telegram.chat_id = std::env::var("TELEGRAM_CHAT_ID").ok();
    }
    if raw.inference.api_key.is_none() {
        raw.inference.api_key = std::env::var("INFERENCE_API_KEY").ok();
    }

    Ok(raw)
}
