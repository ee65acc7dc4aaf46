use std::path::PathBuf;
use std::sync::{Once, OnceLock};

use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::LoggingConfig;

/// Global tracing subscriber: stdout always, plus a daily-rotated file under
/// `<data_dir>/broxeen/logs` unless disabled. Filter from `RUST_LOG`, then
/// `BROXEEN_LOG_LEVEL`, then `info`.

static INIT_LOGGING: Once = Once::new();
static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

pub fn default_log_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("broxeen")
        .join("logs")
}

fn file_appender(dir: PathBuf) -> Result<(RollingFileAppender, PathBuf), (PathBuf, std::io::Error)> {
    match std::fs::create_dir_all(&dir) {
        Ok(()) => Ok((
            RollingFileAppender::new(Rotation::DAILY, &dir, "broxeen-watch.log"),
            dir,
        )),
        Err(e) => Err((dir, e)),
    }
}

pub fn init_logging(cfg: &LoggingConfig) {
    INIT_LOGGING.call_once(|| {
        let appender = cfg.file.then(|| {
            let dir = cfg.dir.as_ref().map(PathBuf::from).unwrap_or_else(default_log_dir);
            file_appender(dir)
        });

        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(std::env::var("BROXEEN_LOG_LEVEL").unwrap_or_else(|_| "info".into())))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let stdout_layer = fmt::layer()
            .with_target(false)
            .with_ansi(true)
            .with_timer(UtcTime::rfc_3339());

        let registry = tracing_subscriber::registry().with(filter).with(stdout_layer);

        match appender {
            Some(Ok((appender, dir))) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                let file_layer = fmt::layer()
                    .with_ansi(false)
                    .with_target(true)
                    .with_timer(UtcTime::rfc_3339())
                    .with_writer(non_blocking);
                LOG_GUARD.set(guard).ok();
                registry.with(file_layer).init();
                info!("logging to stdout and {} (daily rotation)", dir.display());
            }
            Some(Err((dir, e))) => {
                registry.init();
                warn!("cannot create log directory {}: {}; stdout only", dir.display(), e);
            }
            None => registry.init(),
        }
    });
}
