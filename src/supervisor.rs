/// Supervisor — owns every running unit
///
///   per camera: FrameMailbox + StreamProducer (blocking thread)
///               + AnalysisConsumer (tokio task) + stop channel
///   once:       HeartbeatMonitor
///
/// Each unit's JoinHandle is awaited by a small watcher task, so a panic or
/// exhaustion in one unit is logged and contained there.
use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::alert::{AlertDispatcher, Effects};
use crate::capture::SourceConnector;
use crate::config::CameraConfig;
use crate::consumer::AnalysisConsumer;
use crate::export::FrameExporter;
use crate::heartbeat::HeartbeatMonitor;
use crate::inference::FrameAnalyzer;
use crate::mailbox::FrameMailbox;
use crate::producer::{Interrupt, ProducerExit, ProducerSettings, ProducerState, StreamProducer};

/// How long shutdown waits for each unit before leaving it behind.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared, read-only collaborators handed to every camera.
#[derive(Clone)]
pub struct Services {
    pub connector: Arc<dyn SourceConnector>,
    pub analyzer: Arc<dyn FrameAnalyzer>,
    pub effects: Effects,
    pub exporter: Arc<dyn FrameExporter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitExit {
    Stopped,
    Exhausted { failures: u32 },
    Panicked(String),
    Cancelled,
    /// Did not finish within the shutdown grace period.
    TimedOut,
}

/// A running camera: its stop switch and the watchers of its two units.
pub struct CameraHandle {
    pub name: String,
    pub started_at: DateTime<Utc>,
    mailbox: Arc<FrameMailbox>,
    state: watch::Receiver<ProducerState>,
    stop_tx: watch::Sender<bool>,
    interrupt: Interrupt,
    producer: JoinHandle<UnitExit>,
    consumer: JoinHandle<UnitExit>,
}

impl CameraHandle {
    /// Raise the stop flag, then cut off any read blocked in the source.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.interrupt.fire();
    }

    pub fn producer_state(&self) -> ProducerState {
        *self.state.borrow()
    }

    pub fn frames_published(&self) -> u64 {
        self.mailbox.published()
    }

    pub fn producer_finished(&self) -> bool {
        self.producer.is_finished()
    }

    pub fn consumer_finished(&self) -> bool {
        self.consumer.is_finished()
    }

    async fn join(self) -> (String, UnitExit, UnitExit) {
        self.stop();
        let producer = settle(self.producer).await;
        let consumer = settle(self.consumer).await;
        (self.name, producer, consumer)
    }
}

async fn settle(handle: JoinHandle<UnitExit>) -> UnitExit {
    match tokio::time::timeout(SHUTDOWN_GRACE, handle).await {
        Ok(Ok(exit)) => exit,
        Ok(Err(e)) => join_failure(e),
        Err(_) => UnitExit::TimedOut,
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn join_failure(e: JoinError) -> UnitExit {
    if e.is_panic() {
        UnitExit::Panicked(panic_message(e.into_panic()))
    } else {
        UnitExit::Cancelled
    }
}

pub struct Supervisor {
    settings: ProducerSettings,
    services: Services,
    cameras: Vec<CameraHandle>,
    live: Arc<AtomicUsize>,
    heartbeat: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

impl Supervisor {
    pub fn new(settings: ProducerSettings, services: Services) -> Self {
        Self {
            settings,
            services,
            cameras: Vec::new(),
            live: Arc::new(AtomicUsize::new(0)),
            heartbeat: None,
        }
    }

    /// Spawn the producer/consumer pair for one camera.
    pub fn start_camera(&mut self, camera: Arc<CameraConfig>) {
        let name = camera.name.clone();
        if self.camera(&name).is_some() {
            warn!("[{}] already running, not started twice", name);
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mailbox = Arc::new(FrameMailbox::new());

        let producer = StreamProducer::new(
            camera.clone(),
            self.services.connector.clone(),
            mailbox.clone(),
            self.settings.clone(),
            stop_rx.clone(),
        );
        let state = producer.subscribe();
        let interrupt = producer.interrupt();
        self.live.fetch_add(1, Ordering::SeqCst);
        let producer_task = tokio::task::spawn_blocking(move || producer.run());

        let consumer = AnalysisConsumer::new(
            camera.clone(),
            mailbox.clone(),
            self.services.analyzer.clone(),
            AlertDispatcher::new(camera.clone(), self.services.effects.clone()),
            self.services.exporter.clone(),
            stop_rx,
        );
        let consumer_task = tokio::spawn(consumer.run());

        let producer_name = name.clone();
        let live = self.live.clone();
        let producer_watch = tokio::spawn(async move {
            let exit = match producer_task.await {
                Ok(ProducerExit::StopRequested) => {
                    info!("[{}] producer exited cleanly", producer_name);
                    UnitExit::Stopped
                }
                Ok(ProducerExit::Exhausted { failures }) => {
                    error!("[{}] producer gave up; camera offline until restart", producer_name);
                    UnitExit::Exhausted { failures }
                }
                Err(e) => {
                    let exit = join_failure(e);
                    error!("[{}] producer died: {:?}", producer_name, exit);
                    exit
                }
            };
            live.fetch_sub(1, Ordering::SeqCst);
            exit
        });

        let consumer_name = name.clone();
        let consumer_watch = tokio::spawn(async move {
            match consumer_task.await {
                Ok(()) => UnitExit::Stopped,
                Err(e) => {
                    let exit = join_failure(e);
                    error!("[{}] consumer died: {:?}", consumer_name, exit);
                    exit
                }
            }
        });

        info!("[{}] started", name);
        self.cameras.push(CameraHandle {
            name,
            started_at: Utc::now(),
            mailbox,
            state,
            stop_tx,
            interrupt,
            producer: producer_watch,
            consumer: consumer_watch,
        });
    }

    pub fn start_heartbeat(&mut self, interval: Duration) {
        if self.heartbeat.is_some() {
            return;
        }
        let (tx, rx) = watch::channel(false);
        let monitor = HeartbeatMonitor::new(
            self.services.effects.notifier.clone(),
            interval,
            self.live.clone(),
            rx,
        );
        self.heartbeat = Some((tx, tokio::spawn(monitor.run())));
    }

    /// Cameras whose producer has not exited.
    pub fn live_cameras(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn cameras(&self) -> &[CameraHandle] {
        &self.cameras
    }

    pub fn camera(&self, name: &str) -> Option<&CameraHandle> {
        self.cameras.iter().find(|c| c.name.eq_ignore_ascii_case(name))
    }

    /// Signal one camera's units to stop. Returns false for an unknown name.
    pub fn stop_camera(&self, name: &str) -> bool {
        match self.camera(name) {
            Some(cam) => {
                info!("[{}] stop requested", cam.name);
                cam.stop();
                true
            }
            None => false,
        }
    }

    /// Stop everything and wait (bounded) for every unit to exit.
    pub async fn shutdown(self) -> Vec<(String, UnitExit, UnitExit)> {
        info!("shutting down {} camera(s)", self.cameras.len());
        for cam in &self.cameras {
            cam.stop();
        }
        if let Some((tx, handle)) = self.heartbeat {
            let _ = tx.send(true);
            let _ = tokio::time::timeout(SHUTDOWN_GRACE, handle).await;
        }

        let mut exits = Vec::with_capacity(self.cameras.len());
        for cam in self.cameras {
            let (name, producer, consumer) = cam.join().await;
            if producer == UnitExit::TimedOut || consumer == UnitExit::TimedOut {
                warn!("[{}] did not stop within {:?}", name, SHUTDOWN_GRACE);
            }
            exits.push((name, producer, consumer));
        }
        info!("shutdown complete");
        exits
    }

    /// Block until Ctrl-C, then shut down.
    pub async fn run_until_ctrl_c(self) -> std::io::Result<()> {
        tokio::signal::ctrl_c().await?;
        info!("Ctrl-C received");
        self.shutdown().await;
        Ok(())
    }
}
