//! Local audible alarms: a siren on CRITICAL, a spoken phrase on WARNING.
//!
//! Playback blocks, so it always runs on tokio's blocking pool, and
//! `AlertDispatcher` runs each `play` as a detached task. Speech goes
//! through espeak-ng (espeak as fallback). The siren is a WAV file played by
//! rodio when built with the `rodio` feature, otherwise by an external player
//! such as `paplay` or `aplay`.

use async_trait::async_trait;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::error::AudioError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCue {
    Siren,
    Speech,
}

#[async_trait]
pub trait AudioAlerter: Send + Sync {
    async fn play(&self, cue: AudioCue) -> Result<(), AudioError>;
}

pub struct SilentAudio;

#[async_trait]
impl AudioAlerter for SilentAudio {
    async fn play(&self, cue: AudioCue) -> Result<(), AudioError> {
        debug!("audio disabled, skipping {:?}", cue);
        Ok(())
    }
}

pub struct LocalAudio {
    cfg: AudioConfig,
}

impl LocalAudio {
    pub fn new(cfg: AudioConfig) -> Self {
        Self { cfg }
    }
}

#[async_trait]
impl AudioAlerter for LocalAudio {
    async fn play(&self, cue: AudioCue) -> Result<(), AudioError> {
        let cfg = self.cfg.clone();
        tokio::task::spawn_blocking(move || match cue {
            AudioCue::Siren => play_siren(&cfg),
            AudioCue::Speech => speak(&cfg),
        })
        .await
        .map_err(|e| AudioError::Playback(format!("audio task failed: {e}")))?
    }
}

pub fn from_config(cfg: &AudioConfig) -> Box<dyn AudioAlerter> {
    if cfg.enabled {
        Box::new(LocalAudio::new(cfg.clone()))
    } else {
        Box::new(SilentAudio)
    }
}

fn espeak_binary() -> Option<&'static str> {
    ["espeak-ng", "espeak"].into_iter().find(|bin| {
        Command::new(bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .is_ok()
    })
}

/// Speak the configured phrase `speech_repeat` times with a pause between.
fn speak(cfg: &AudioConfig) -> Result<(), AudioError> {
    let binary = espeak_binary()
        .ok_or_else(|| AudioError::Unavailable("espeak-ng not installed".into()))?;
    let voice = cfg.speech_voice.split('-').next().unwrap_or("en");
    let repeat = cfg.speech_repeat.max(1);

    for i in 0..repeat {
        let status = Command::new(binary)
            .args(["-v", voice, "-s", "150"])
            .arg(&cfg.speech_phrase)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        if !status.success() {
            return Err(AudioError::Playback(format!("{binary} exited with {status}")));
        }
        if i + 1 < repeat {
            std::thread::sleep(Duration::from_secs(cfg.speech_pause_secs));
        }
    }
    info!("spoken warning played {} time(s)", repeat);
    Ok(())
}

#[cfg(feature = "rodio")]
fn play_siren(cfg: &AudioConfig) -> Result<(), AudioError> {
    use rodio::{Decoder, OutputStream, Sink};
    use std::io::BufReader;

    let path = cfg
        .siren_path
        .as_deref()
        .ok_or_else(|| AudioError::Unavailable("no siren_path configured".into()))?;
    let file = std::fs::File::open(path)?;

    let (_stream, handle) = OutputStream::try_default()
        .map_err(|e| AudioError::Unavailable(format!("cannot open audio output: {e}")))?;
    let sink = Sink::try_new(&handle)
        .map_err(|e| AudioError::Playback(format!("cannot create audio sink: {e}")))?;
    sink.set_volume(cfg.siren_volume.clamp(0.0, 1.0));

    let source = Decoder::new(BufReader::new(file))
        .map_err(|e| AudioError::Playback(format!("cannot decode {path}: {e}")))?;
    sink.append(source);
    sink.sleep_until_end();
    info!("siren played");
    Ok(())
}

#[cfg(not(feature = "rodio"))]
fn play_siren(cfg: &AudioConfig) -> Result<(), AudioError> {
    let path = cfg
        .siren_path
        .as_deref()
        .ok_or_else(|| AudioError::Unavailable("no siren_path configured".into()))?;

    let status = Command::new(&cfg.player)
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|e| AudioError::Unavailable(format!("cannot run {}: {e}", cfg.player)))?;
    if !status.success() {
        return Err(AudioError::Playback(format!("{} exited with {status}", cfg.player)));
    }
    info!("siren played via {}", cfg.player);
    Ok(())
}
