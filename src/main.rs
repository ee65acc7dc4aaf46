use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use broxeen_watch::alert::Effects;
use broxeen_watch::capture::connector_for;
use broxeen_watch::capture_ffmpeg::redact;
use broxeen_watch::config::{self, AppConfig};
use broxeen_watch::consumer::analyze_frame;
use broxeen_watch::inference::{FrameAnalyzer, InferenceClient};
use broxeen_watch::logging::init_logging;
use broxeen_watch::mailbox::Frame;
use broxeen_watch::producer::ProducerSettings;
use broxeen_watch::supervisor::{Services, Supervisor};
use broxeen_watch::{audio, export, metrics, notifier};

#[derive(Parser)]
#[command(name = "broxeen-watch", version)]
#[command(about = "Multi-camera watch — vision LLM risk scoring with tiered Telegram/audio alerts")]
struct Cli {
    /// Config file (default: ./broxeen-watch.toml, optional)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Watch all cameras (or only those given) until Ctrl-C
    Run {
        #[arg(short = 'C', long = "camera")]
        cameras: Vec<String>,
    },

    /// Validate configuration and print the resolved cameras
    Check,

    /// Capture one frame from a camera, analyse it, print the verdict (no alerts)
    Probe {
        #[arg(short = 'C', long)]
        camera: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let raw = config::load_raw(cli.config.as_deref()).context("loading configuration")?;
    init_logging(&raw.logging);

    let (cfg, rejected) = AppConfig::from_raw(raw);
    for e in &rejected {
        warn!("skipping camera: {}", e);
    }

    match cli.command {
        Command::Run { cameras } => run(cfg, &cameras).await?,
        Command::Check => {
            print_startup_info(&cfg);
            if !rejected.is_empty() {
                bail!("{} camera(s) rejected", rejected.len());
            }
        }
        Command::Probe { camera } => probe(&cfg, &camera).await?,
    }
    Ok(())
}

fn services(cfg: &AppConfig) -> Result<Services> {
    let notifier: Arc<dyn notifier::Notifier> = notifier::from_config(&cfg.telegram)?.into();
    let audio: Arc<dyn audio::AudioAlerter> = audio::from_config(&cfg.audio).into();
    let metrics: Arc<dyn metrics::MetricsSink> = metrics::from_config(&cfg.metrics)?.into();

    Ok(Services {
        connector: connector_for(&cfg.stream)?,
        analyzer: Arc::new(InferenceClient::from_config(&cfg.inference)?),
        effects: Effects {
            notifier,
            audio,
            metrics,
        },
        exporter: export::from_config(&cfg.export).into(),
    })
}

async fn run(cfg: AppConfig, only: &[String]) -> Result<()> {
    let selected: Vec<_> = cfg
        .cameras
        .iter()
        .filter(|c| only.is_empty() || only.iter().any(|n| c.name.eq_ignore_ascii_case(n)))
        .cloned()
        .collect();
    for name in only {
        if cfg.camera(name).is_none() {
            warn!("camera {} not configured (or rejected)", name);
        }
    }
    if selected.is_empty() {
        bail!(broxeen_watch::error::ConfigError::NoCameras);
    }

    print_startup_info(&cfg);
    let mut supervisor = Supervisor::new(ProducerSettings::from(&cfg.stream), services(&cfg)?);
    for camera in selected {
        supervisor.start_camera(camera);
    }
    if cfg.heartbeat.enabled {
        supervisor.start_heartbeat(Duration::from_secs(cfg.heartbeat.interval_secs));
    }

    info!("watching {} camera(s); Ctrl-C to stop", supervisor.cameras().len());
    supervisor.run_until_ctrl_c().await?;
    Ok(())
}

async fn probe(cfg: &AppConfig, name: &str) -> Result<()> {
    let camera = cfg
        .camera(name)
        .with_context(|| format!("camera {} not configured", name))?
        .clone();
    let connector = connector_for(&cfg.stream)?;
    let analyzer = InferenceClient::from_config(&cfg.inference)?;

    let url = camera.url.clone();
    let image = tokio::task::spawn_blocking(move || -> Result<_> {
        let mut source = connector.connect(&url)?;
        let image = source.read()?;
        source.release();
        Ok(image)
    })
    .await??;

    println!("Captured {}x{} from {}", image.width(), image.height(), redact(&camera.url));
    println!("Analyzer: {}", analyzer.label());

    let result = analyze_frame(&analyzer, &camera, Frame::new(image)).await;
    println!("  score:       {:.2}", result.score);
    println!("  human:       {}", result.human_present);
    println!("  description: {}", result.description);
    if result.failed {
        bail!("analysis failed");
    }
    Ok(())
}

fn print_startup_info(cfg: &AppConfig) {
    let telegram = if cfg.telegram.is_configured() { "enabled" } else { "disabled" };
    let metrics = match (&cfg.metrics.endpoint, cfg.metrics.enabled) {
        (Some(ep), true) => ep.as_str(),
        _ => "disabled",
    };

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║            BROXEEN WATCH v{:<31}║", env!("CARGO_PKG_VERSION"));
    println!("╠══════════════════════════════════════════════════════════╣");
    println!("  Inference: {} @ {}", cfg.inference.model, cfg.inference.endpoint());
    println!("  Backend:   {:?} (backoff {}ms..{}s, max {} failures)",
        cfg.stream.backend, cfg.stream.base_backoff_ms, cfg.stream.backoff_cap_secs, cfg.stream.max_failures);
    println!("  Telegram:  {}", telegram);
    println!("  Audio:     {}", if cfg.audio.enabled { "enabled" } else { "disabled" });
    println!("  Metrics:   {}", metrics);
    println!("  Export:    {}", if cfg.export.enabled { cfg.export.dir.as_str() } else { "disabled" });
    println!("╠══════════════════════════════════════════════════════════╣");
    for c in &cfg.cameras {
        println!(
            "  {:<10} {} | every {:?} | crit≥{:.2} warn≥{:.2} human≥{:.2}",
            c.name, redact(&c.url), c.interval,
            c.policy.critical_threshold, c.policy.warning_threshold, c.policy.human_min_score
        );
    }
    println!("╚══════════════════════════════════════════════════════════╝");
}
