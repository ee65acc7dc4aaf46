#![allow(dead_code)]

use async_trait::async_trait;
use image::{Rgb, RgbImage};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use broxeen_watch::alert::{AlertPolicy, Effects};
use broxeen_watch::audio::{AudioAlerter, AudioCue};
use broxeen_watch::capture::{AbortHandle, FrameSource, SourceConnector};
use broxeen_watch::config::CameraConfig;
use broxeen_watch::error::{AudioError, InferenceError, MetricsError, NotifyError, SourceError};
use broxeen_watch::inference::{FrameAnalyzer, Verdict};
use broxeen_watch::metrics::{MetricsEvent, MetricsSink};
use broxeen_watch::notifier::Notifier;
use broxeen_watch::producer::ProducerSettings;

// ─── Cameras ────────────────────────────────────────────────────────────────

pub fn policy() -> AlertPolicy {
    AlertPolicy {
        critical_threshold: 0.45,
        warning_threshold: 0.25,
        human_min_score: 0.2,
        critical_cooldown: Duration::from_secs(60),
        warning_cooldown: Duration::from_secs(120),
        human_cooldown: Duration::from_secs(300),
        siren: true,
        speech_on_warning: true,
    }
}

pub fn camera(name: &str, url: &str, prompt: &str, interval: Duration) -> Arc<CameraConfig> {
    Arc::new(CameraConfig {
        name: name.to_string(),
        url: url.to_string(),
        prompt: prompt.to_string(),
        policy: policy(),
        max_width: 960,
        jpeg_quality: 85,
        interval,
    })
}

pub fn fast_settings(max_failures: u32, reconnect_after: u32) -> ProducerSettings {
    ProducerSettings {
        base_backoff: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(4),
        max_failures,
        reconnect_after,
        discard_frames: 0,
        read_retry: Duration::from_millis(1),
    }
}

pub fn test_image(shade: u8) -> RgbImage {
    RgbImage::from_pixel(64, 48, Rgb([shade, shade, shade]))
}

// ─── Video source ───────────────────────────────────────────────────────────

#[derive(Default)]
pub struct SourceCounters {
    pub connects: AtomicU32,
    pub grabs: AtomicU32,
    pub reads: AtomicU32,
    pub releases: AtomicU32,
    pub connect_times: Mutex<Vec<Instant>>,
}

impl SourceCounters {
    /// Time between consecutive connect attempts.
    pub fn connect_gaps(&self) -> Vec<Duration> {
        let times = self.connect_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadMode {
    Frames,
    /// Every read fails with a transient error.
    Broken,
    /// Every read reports the stream closed.
    Ended,
    /// Every read blocks until the source is aborted.
    Stalled,
}

/// Connects unless `fail_connect` is set or the URI contains "dead". A
/// non-empty `script` overrides both, one outcome per attempt (true = ok).
pub struct FakeConnector {
    pub fail_connect: bool,
    pub script: Mutex<VecDeque<bool>>,
    pub reads: ReadMode,
    pub read_delay: Duration,
    pub counters: Arc<SourceCounters>,
}

impl FakeConnector {
    pub fn healthy(read_delay: Duration) -> Self {
        Self {
            fail_connect: false,
            script: Mutex::default(),
            reads: ReadMode::Frames,
            read_delay,
            counters: Arc::default(),
        }
    }

    pub fn unreachable() -> Self {
        Self {
            fail_connect: true,
            ..Self::healthy(Duration::ZERO)
        }
    }

    pub fn broken_stream() -> Self {
        Self::with_reads(ReadMode::Broken)
    }

    pub fn with_reads(reads: ReadMode) -> Self {
        Self {
            reads,
            ..Self::healthy(Duration::ZERO)
        }
    }

    pub fn scripted(outcomes: &[bool], reads: ReadMode) -> Self {
        Self {
            script: Mutex::new(outcomes.iter().copied().collect()),
            ..Self::with_reads(reads)
        }
    }
}

impl SourceConnector for FakeConnector {
    fn connect(&self, uri: &str) -> Result<Box<dyn FrameSource>, SourceError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        self.counters.connect_times.lock().unwrap().push(Instant::now());
        let ok = match self.script.lock().unwrap().pop_front() {
            Some(ok) => ok,
            None => !self.fail_connect && !uri.contains("dead"),
        };
        if !ok {
            return Err(SourceError::Open {
                uri: uri.to_string(),
                reason: "connection refused".into(),
            });
        }
        Ok(Box::new(FakeSource {
            reads: self.reads,
            read_delay: self.read_delay,
            counters: self.counters.clone(),
            shade: 0,
            aborted: Arc::default(),
        }))
    }
}

pub struct FakeSource {
    reads: ReadMode,
    read_delay: Duration,
    counters: Arc<SourceCounters>,
    shade: u8,
    aborted: Arc<(Mutex<bool>, Condvar)>,
}

impl FrameSource for FakeSource {
    fn grab(&mut self) -> Result<(), SourceError> {
        self.counters.grabs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn read(&mut self) -> Result<RgbImage, SourceError> {
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            std::thread::sleep(self.read_delay);
        }
        match self.reads {
            ReadMode::Frames => {
                self.shade = self.shade.wrapping_add(1);
                Ok(test_image(self.shade))
            }
            ReadMode::Broken => Err(SourceError::Read("empty frame".into())),
            ReadMode::Ended => Err(SourceError::EndOfStream),
            ReadMode::Stalled => {
                let (lock, cvar) = &*self.aborted;
                let mut aborted = lock.lock().unwrap();
                while !*aborted {
                    aborted = cvar.wait(aborted).unwrap();
                }
                Err(SourceError::EndOfStream)
            }
        }
    }

    fn release(&mut self) {
        self.counters.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn abort_handle(&self) -> Option<AbortHandle> {
        let aborted = self.aborted.clone();
        Some(Arc::new(move || {
            let (lock, cvar) = &*aborted;
            *lock.lock().unwrap() = true;
            cvar.notify_all();
        }))
    }
}

// ─── Analyzer ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum Reply {
    Verdict {
        score: f64,
        description: &'static str,
        human: Option<bool>,
    },
    Unparseable,
    Timeout,
}

pub fn verdict(score: f64, description: &'static str) -> Reply {
    Reply::Verdict {
        score,
        description,
        human: None,
    }
}

/// Replies from a script, then repeats `fallback`. Panics for the prompt
/// "panic".
pub struct FakeAnalyzer {
    script: Mutex<VecDeque<Reply>>,
    fallback: Reply,
    pub prompts: Mutex<Vec<String>>,
    pub calls: AtomicUsize,
}

impl FakeAnalyzer {
    pub fn new(script: Vec<Reply>, fallback: Reply) -> Self {
        Self {
            script: Mutex::new(script.into()),
            fallback,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn always(reply: Reply) -> Self {
        Self::new(Vec::new(), reply)
    }

    pub fn calls_for(&self, prompt: &str) -> usize {
        self.prompts.lock().unwrap().iter().filter(|p| *p == prompt).count()
    }
}

#[async_trait]
impl FrameAnalyzer for FakeAnalyzer {
    async fn analyze(&self, system_prompt: &str, jpeg: &[u8]) -> Result<Verdict, InferenceError> {
        assert!(jpeg.starts_with(&[0xFF, 0xD8]), "analyzer expects JPEG bytes");
        if system_prompt == "panic" {
            panic!("analyzer exploded");
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(system_prompt.to_string());

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match reply {
            Reply::Verdict {
                score,
                description,
                human,
            } => Ok(Verdict::Parsed {
                score,
                description: description.to_string(),
                human,
            }),
            Reply::Unparseable => Ok(Verdict::ParseError {
                raw: "no idea".into(),
                cause: "no JSON object in response".into(),
            }),
            Reply::Timeout => Err(InferenceError::Timeout),
        }
    }

    fn label(&self) -> String {
        "fake".into()
    }
}

// ─── Effects ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct Recorder {
    pub photos: Mutex<Vec<String>>,
    pub texts: Mutex<Vec<String>>,
    pub audio: Mutex<Vec<AudioCue>>,
    pub metrics: Mutex<Vec<MetricsEvent>>,
    pub fail_everything: bool,
}

impl Recorder {
    pub fn failing() -> Self {
        Self {
            fail_everything: true,
            ..Default::default()
        }
    }

    pub fn photos(&self) -> Vec<String> {
        self.photos.lock().unwrap().clone()
    }

    pub fn audio(&self) -> Vec<AudioCue> {
        self.audio.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> Vec<MetricsEvent> {
        self.metrics.lock().unwrap().clone()
    }

    /// Audio plays on a detached task; give it a moment to start.
    pub async fn audio_after_playback(&self, expected: usize) -> Vec<AudioCue> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.audio.lock().unwrap().len() < expected && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.audio()
    }
}

#[async_trait]
impl Notifier for Recorder {
    async fn send_photo(&self, _jpeg: &[u8], caption: &str) -> Result<(), NotifyError> {
        self.photos.lock().unwrap().push(caption.to_string());
        if self.fail_everything {
            return Err(NotifyError::Status {
                status: 502,
                body: "bad gateway".into(),
            });
        }
        Ok(())
    }

    async fn send_text(&self, text: &str) -> Result<(), NotifyError> {
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}

#[async_trait]
impl AudioAlerter for Recorder {
    async fn play(&self, cue: AudioCue) -> Result<(), AudioError> {
        self.audio.lock().unwrap().push(cue);
        if self.fail_everything {
            return Err(AudioError::Unavailable("no sound card".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl MetricsSink for Recorder {
    async fn record(&self, event: &MetricsEvent) -> Result<(), MetricsError> {
        self.metrics.lock().unwrap().push(event.clone());
        if self.fail_everything {
            return Err(MetricsError::Status(500));
        }
        Ok(())
    }
}

/// Audio that takes `duration` to play.
pub struct SlowAudio {
    pub duration: Duration,
    pub started: AtomicUsize,
    pub finished: AtomicUsize,
}

impl SlowAudio {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            started: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AudioAlerter for SlowAudio {
    async fn play(&self, _cue: AudioCue) -> Result<(), AudioError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.duration).await;
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub fn effects(rec: &Arc<Recorder>) -> Effects {
    Effects {
        notifier: rec.clone(),
        audio: rec.clone(),
        metrics: rec.clone(),
    }
}

// ─── Log capture ────────────────────────────────────────────────────────────

/// Tracing layer that keeps every event's level and formatted message.
#[derive(Clone, Default)]
pub struct EventCapture {
    events: Arc<Mutex<Vec<(Level, String)>>>,
}

impl EventCapture {
    pub fn count(&self, level: Level, needle: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, msg)| *l == level && msg.contains(needle))
            .count()
    }
}

struct MessageVisitor(String);

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for EventCapture {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor(String::new());
        event.record(&mut visitor);
        self.events
            .lock()
            .unwrap()
            .push((*event.metadata().level(), visitor.0));
    }
}

// ─── HTTP stubs ─────────────────────────────────────────────────────────────

fn header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn request_complete(buf: &[u8]) -> bool {
    let Some(end) = header_end(buf) else {
        return false;
    };
    let head = String::from_utf8_lossy(&buf[..end]).to_ascii_lowercase();
    let length = head
        .lines()
        .find_map(|l| l.strip_prefix("content-length:"))
        .and_then(|v| v.trim().parse::<usize>().ok());
    match length {
        Some(len) => buf.len() >= end + len,
        None if head.contains("transfer-encoding: chunked") => buf.ends_with(b"0\r\n\r\n"),
        None => true,
    }
}

/// Answer exactly one request with `status` and `body`; the handle yields
/// the raw request text.
pub async fn serve_once(status: u16, body: String) -> (String, JoinHandle<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let handle = tokio::spawn(async move {
        let (mut sock, _) = listener.accept().await.unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 8192];
        while !request_complete(&buf) {
            let n = sock.read(&mut chunk).await.unwrap();
            if n == 0 {
                break;
            }
            buf.extend_from_slice(&chunk[..n]);
        }

        let response = format!(
            "HTTP/1.1 {} Stub\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        sock.write_all(response.as_bytes()).await.unwrap();
        let _ = sock.shutdown().await;
        String::from_utf8_lossy(&buf).into_owned()
    });

    (format!("http://{}", addr), handle)
}

/// Accepts connections and never answers.
pub async fn serve_silence() -> (String, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });
    (format!("http://{}", addr), handle)
}

pub fn chat_completion(content: &str) -> String {
    serde_json::json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }]
    })
    .to_string()
}
