/// Stream producer — one per camera
///
/// States:
///   Disconnected → Connecting → Streaming → (read failure)* → Connecting …
///   any state → Stopped (stop signal, or failure budget exhausted)
///
/// Runs on its own blocking thread. The only side effects are mailbox
/// publishes and log lines.

use image::RgbImage;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::capture::{backoff_delay, AbortHandle, FrameSource, SourceConnector};
use crate::capture_ffmpeg::redact;
use crate::config::{CameraConfig, StreamConfig};
use crate::error::SourceError;
use crate::mailbox::{Frame, FrameMailbox};

/// Upper bound on how long a sleeping producer takes to notice a stop signal.
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerState {
    Disconnected,
    Connecting,
    Streaming,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProducerExit {
    /// Stop signal received; source released.
    StopRequested,
    /// Consecutive-failure budget exceeded; camera is down for good.
    Exhausted { failures: u32 },
}

#[derive(Debug, Clone)]
pub struct ProducerSettings {
    pub base_backoff: Duration,
    pub backoff_cap: Duration,
    pub max_failures: u32,
    pub reconnect_after: u32,
    pub discard_frames: u32,
    /// Pause between failed reads on a connection that is still open.
    pub read_retry: Duration,
}

impl From<&StreamConfig> for ProducerSettings {
    fn from(cfg: &StreamConfig) -> Self {
        Self {
            base_backoff: cfg.base_backoff(),
            backoff_cap: cfg.backoff_cap(),
            max_failures: cfg.max_failures,
            reconnect_after: cfg.reconnect_after.max(1),
            discard_frames: cfg.discard_frames,
            read_retry: cfg.read_retry(),
        }
    }
}

/// Cuts off a read that is blocked inside the current source.
///
/// The producer arms it with the source's [`AbortHandle`] while connected;
/// firing it after the stop signal makes the blocked call return so the loop
/// can see the signal.
#[derive(Clone, Default)]
pub struct Interrupt {
    slot: Arc<Mutex<Option<AbortHandle>>>,
}

impl Interrupt {
    pub fn fire(&self) {
        let handle = self.lock().clone();
        if let Some(abort) = handle {
            abort();
        }
    }

    fn arm(&self, handle: Option<AbortHandle>) {
        *self.lock() = handle;
    }

    fn disarm(&self) {
        self.lock().take();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<AbortHandle>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Step {
    Connect,
    Frame(RgbImage),
    ReadFailed(SourceError),
}

pub struct StreamProducer {
    camera: Arc<CameraConfig>,
    connector: Arc<dyn SourceConnector>,
    mailbox: Arc<FrameMailbox>,
    settings: ProducerSettings,
    stop: watch::Receiver<bool>,
    state_tx: watch::Sender<ProducerState>,
    interrupt: Interrupt,
}

impl StreamProducer {
    pub fn new(
        camera: Arc<CameraConfig>,
        connector: Arc<dyn SourceConnector>,
        mailbox: Arc<FrameMailbox>,
        settings: ProducerSettings,
        stop: watch::Receiver<bool>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ProducerState::Disconnected);
        Self {
            camera,
            connector,
            mailbox,
            settings,
            stop,
            state_tx,
            interrupt: Interrupt::default(),
        }
    }

    /// Observe state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ProducerState> {
        self.state_tx.subscribe()
    }

    /// Handle that unblocks a stalled read; fire it after sending stop.
    pub fn interrupt(&self) -> Interrupt {
        self.interrupt.clone()
    }

    /// Blocking capture loop. Returns only on stop or exhaustion.
    pub fn run(self) -> ProducerExit {
        let name = self.camera.name.clone();
        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut failures: u32 = 0;
        let mut connect_attempt: u32 = 0;
        let mut read_failures: u32 = 0;

        info!("[{}] producer started ({})", name, redact(&self.camera.url));

        loop {
            if self.stop_requested() {
                self.release(&mut source);
                self.set_state(ProducerState::Stopped);
                info!("[{}] producer stop signal received, source released", name);
                return ProducerExit::StopRequested;
            }

            let step = match source.as_mut() {
                None => Step::Connect,
                Some(src) => match read_fresh(&mut **src, self.settings.discard_frames) {
                    Ok(img) => Step::Frame(img),
                    Err(e) => Step::ReadFailed(e),
                },
            };

            match step {
                Step::Connect => {
                    self.set_state(ProducerState::Connecting);
                    match self.connector.connect(&self.camera.url) {
                        Ok(s) => {
                            info!("[{}] connected (after {} failed attempts)", name, connect_attempt);
                            self.interrupt.arm(s.abort_handle());
                            source = Some(s);
                            connect_attempt = 0;
                            read_failures = 0;
                            self.set_state(ProducerState::Streaming);
                        }
                        Err(e) => {
                            failures += 1;
                            self.set_state(ProducerState::Disconnected);
                            if failures > self.settings.max_failures {
                                return self.give_up(failures);
                            }
                            let wait = backoff_delay(
                                self.settings.base_backoff,
                                self.settings.backoff_cap,
                                connect_attempt,
                            );
                            connect_attempt = connect_attempt.saturating_add(1);
                            warn!(
                                "[{}] connect failed ({}/{}): {} — retrying in {:?}",
                                name, failures, self.settings.max_failures, e, wait
                            );
                            self.sleep_unless_stopped(wait);
                        }
                    }
                }

                Step::Frame(img) => {
                    if failures > 0 {
                        debug!("[{}] stream recovered after {} failures", name, failures);
                    }
                    failures = 0;
                    read_failures = 0;
                    let seq = self.mailbox.publish(Frame::new(img));
                    if seq == 1 || seq % 500 == 0 {
                        debug!("[{}] published frame #{}", name, seq);
                    }
                }

                Step::ReadFailed(e) => {
                    // an interrupted read is not a stream fault
                    if self.stop_requested() {
                        continue;
                    }
                    failures += 1;
                    read_failures += 1;
                    warn!(
                        "[{}] frame read failed ({}/{}): {}",
                        name, failures, self.settings.max_failures, e
                    );

                    if failures > self.settings.max_failures {
                        self.release(&mut source);
                        return self.give_up(failures);
                    }

                    let ended = matches!(e, SourceError::EndOfStream);
                    if ended || read_failures >= self.settings.reconnect_after {
                        if ended {
                            warn!("[{}] stream ended — reconnecting", name);
                        } else {
                            warn!(
                                "[{}] {} consecutive read failures — forcing reconnect",
                                name, read_failures
                            );
                        }
                        self.release(&mut source);
                        read_failures = 0;
                        self.set_state(ProducerState::Disconnected);
                    } else {
                        self.sleep_unless_stopped(self.settings.read_retry);
                    }
                }
            }
        }
    }

    fn release(&self, source: &mut Option<Box<dyn FrameSource>>) {
        self.interrupt.disarm();
        if let Some(mut s) = source.take() {
            s.release();
        }
    }

    fn give_up(&self, failures: u32) -> ProducerExit {
        self.set_state(ProducerState::Stopped);
        error!(
            "[{}] exhausted retries after {} consecutive failures — camera stopped",
            self.camera.name, failures
        );
        ProducerExit::Exhausted { failures }
    }

    fn set_state(&self, state: ProducerState) {
        self.state_tx.send_replace(state);
    }

    fn stop_requested(&self) -> bool {
        *self.stop.borrow()
    }

    /// Sleep in short slices so a stop signal is noticed within `STOP_POLL`.
    fn sleep_unless_stopped(&self, total: Duration) {
        let mut remaining = total;
        while !remaining.is_zero() {
            if self.stop_requested() {
                return;
            }
            let step = remaining.min(STOP_POLL);
            std::thread::sleep(step);
            remaining -= step;
        }
    }
}

/// Drop `discard` buffered frames, then read the next one.
fn read_fresh(src: &mut dyn FrameSource, discard: u32) -> Result<RgbImage, SourceError> {
    for _ in 0..discard {
        src.grab()?;
    }
    src.read()
}
