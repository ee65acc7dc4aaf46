//! Periodic "still alive" message through the notifier's text channel.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::notifier::Notifier;

pub fn heartbeat_text(cameras: usize, uptime: Duration) -> String {
    let mins = uptime.as_secs() / 60;
    format!(
        "💓 broxeen-watch alive | cameras={} | uptime={}h{:02}m",
        cameras,
        mins / 60,
        mins % 60
    )
}

pub struct HeartbeatMonitor {
    notifier: Arc<dyn Notifier>,
    interval: Duration,
    /// Cameras whose producer is still running.
    live: Arc<AtomicUsize>,
    started: Instant,
    stop: watch::Receiver<bool>,
}

impl HeartbeatMonitor {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        interval: Duration,
        live: Arc<AtomicUsize>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self {
            notifier,
            interval,
            live,
            started: Instant::now(),
            stop,
        }
    }

    pub async fn run(mut self) {
        if self.interval.is_zero() {
            warn!("heartbeat interval is zero, heartbeat disabled");
            return;
        }
        info!("heartbeat every {:?}", self.interval);

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                changed = self.stop.changed() => {
                    if changed.is_err() || *self.stop.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let text = heartbeat_text(self.live.load(Ordering::SeqCst), self.started.elapsed());
            match self.notifier.send_text(&text).await {
                Ok(()) => debug!("heartbeat sent"),
                Err(e) => warn!("heartbeat failed: {}", e),
            }
        }
        debug!("heartbeat stopped");
    }
}
