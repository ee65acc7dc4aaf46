//! Tiered alerting with per-camera, per-tier cooldowns.
//!
//! [`decide`] is pure: given a score, the presence flag, the current time and
//! the camera's [`AlertState`], it returns what should fire and the next
//! state. [`AlertDispatcher`] owns one camera's state and runs the effects.
//!
//! Tier precedence, highest first; at most one tier fires per cycle:
//!   CRITICAL  score ≥ critical        notification always, siren on cooldown
//!   WARNING   score ≥ warning         notification always, speech on cooldown
//!   HUMAN     presence, score ≥ floor notification on cooldown
//! Metrics are emitted every cycle. Audio playback is detached from the cycle;
//! `Decision::audio` records what was started.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::audio::{AudioAlerter, AudioCue};
use crate::config::CameraConfig;
use crate::consumer::AnalysisResult;
use crate::metrics::{MetricsEvent, MetricsSink};
use crate::notifier::Notifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Critical,
    Warning,
    Human,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Critical => "CRITICAL",
            Tier::Warning => "WARNING",
            Tier::Human => "HUMAN",
        }
    }

    fn index(self) -> usize {
        match self {
            Tier::Critical => 0,
            Tier::Warning => 1,
            Tier::Human => 2,
        }
    }
}

/// Thresholds and cooldowns for one camera.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub critical_threshold: f64,
    pub warning_threshold: f64,
    pub human_min_score: f64,
    pub critical_cooldown: Duration,
    pub warning_cooldown: Duration,
    pub human_cooldown: Duration,
    /// Siren on CRITICAL.
    pub siren: bool,
    /// Spoken alert on WARNING.
    pub speech_on_warning: bool,
}

impl AlertPolicy {
    fn cooldown(&self, tier: Tier) -> Duration {
        match tier {
            Tier::Critical => self.critical_cooldown,
            Tier::Warning => self.warning_cooldown,
            Tier::Human => self.human_cooldown,
        }
    }
}

/// Last firing time per tier. Never moves backwards.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AlertState {
    last_fired: [Option<DateTime<Utc>>; 3],
}

impl AlertState {
    pub fn last_fired(&self, tier: Tier) -> Option<DateTime<Utc>> {
        self.last_fired[tier.index()]
    }

    /// Time left on `tier`'s cooldown at `now`; zero when expired or never fired.
    pub fn remaining(&self, tier: Tier, now: DateTime<Utc>, cooldown: Duration) -> Duration {
        match self.last_fired(tier) {
            None => Duration::ZERO,
            Some(last) => {
                // clock stepping backwards counts as no time elapsed
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                cooldown.saturating_sub(elapsed)
            }
        }
    }

    fn mark(&mut self, tier: Tier, now: DateTime<Utc>) {
        let slot = &mut self.last_fired[tier.index()];
        *slot = Some(match *slot {
            Some(prev) if prev > now => prev,
            _ => now,
        });
    }
}

/// Why something that could have fired did not.
#[derive(Debug, Clone, PartialEq)]
pub enum Hold {
    AudioCooldown { tier: Tier, remaining: Duration },
    HumanCooldown { remaining: Duration },
    HumanBelowFloor { score: f64, floor: f64 },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Decision {
    /// Tier that fired this cycle; a notification goes out iff this is set.
    pub tier: Option<Tier>,
    pub audio: Option<AudioCue>,
    pub hold: Option<Hold>,
}

pub fn decide(
    score: f64,
    human_present: bool,
    now: DateTime<Utc>,
    state: &AlertState,
    policy: &AlertPolicy,
) -> (Decision, AlertState) {
    let mut next = state.clone();

    let severity = if score >= policy.critical_threshold {
        Some((Tier::Critical, policy.siren, AudioCue::Siren))
    } else if score >= policy.warning_threshold {
        Some((Tier::Warning, policy.speech_on_warning, AudioCue::Speech))
    } else {
        None
    };

    if let Some((tier, audio_enabled, cue)) = severity {
        let remaining = state.remaining(tier, now, policy.cooldown(tier));
        next.mark(tier, now);

        let mut decision = Decision {
            tier: Some(tier),
            ..Default::default()
        };
        if audio_enabled {
            if remaining.is_zero() {
                decision.audio = Some(cue);
            } else {
                decision.hold = Some(Hold::AudioCooldown { tier, remaining });
            }
        }
        return (decision, next);
    }

    if !human_present {
        return (Decision::default(), next);
    }

    if score < policy.human_min_score {
        let hold = Hold::HumanBelowFloor {
            score,
            floor: policy.human_min_score,
        };
        return (
            Decision {
                hold: Some(hold),
                ..Default::default()
            },
            next,
        );
    }

    let remaining = state.remaining(Tier::Human, now, policy.human_cooldown);
    if !remaining.is_zero() {
        return (
            Decision {
                hold: Some(Hold::HumanCooldown { remaining }),
                ..Default::default()
            },
            next,
        );
    }

    next.mark(Tier::Human, now);
    (
        Decision {
            tier: Some(Tier::Human),
            ..Default::default()
        },
        next,
    )
}

/// Notification caption for the tier that fired.
pub fn caption(tier: Tier, camera: &str, score: f64, description: &str) -> String {
    match tier {
        Tier::Critical => format!("🚨 {}: {} | Risk={:.2}", camera, description, score),
        Tier::Warning => format!("⚠️ {}: {} | Risk={:.2}", camera, description, score),
        Tier::Human => format!(
            "🧍 {}: Person detected | Risk={:.2} | {}",
            camera, score, description
        ),
    }
}

// ─── Dispatcher ─────────────────────────────────────────────────────────────

/// External collaborators, shared read-only by every camera.
#[derive(Clone)]
pub struct Effects {
    pub notifier: Arc<dyn Notifier>,
    pub audio: Arc<dyn AudioAlerter>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Owns one camera's cooldown state.
pub struct AlertDispatcher {
    camera: Arc<CameraConfig>,
    state: AlertState,
    effects: Effects,
}

impl AlertDispatcher {
    pub fn new(camera: Arc<CameraConfig>, effects: Effects) -> Self {
        Self {
            camera,
            state: AlertState::default(),
            effects,
        }
    }

    pub fn state(&self) -> &AlertState {
        &self.state
    }

    /// Decide, update state, then run effects. Collaborator failures are
    /// logged here and go no further.
    pub async fn dispatch(&mut self, result: &AnalysisResult, now: DateTime<Utc>) -> Decision {
        let name = self.camera.name.as_str();
        let (decision, next) = decide(
            result.score,
            result.human_present,
            now,
            &self.state,
            &self.camera.policy,
        );
        self.state = next;

        match &decision.hold {
            Some(Hold::AudioCooldown { tier, remaining }) => info!(
                "[{}] {} audio cooling down ({}s remaining)",
                name,
                tier.as_str(),
                remaining.as_secs()
            ),
            Some(Hold::HumanCooldown { remaining }) => info!(
                "[{}] Person detected but in cooldown ({}s remaining)",
                name,
                remaining.as_secs()
            ),
            Some(Hold::HumanBelowFloor { score, floor }) => info!(
                "[{}] Person detected, but score={:.2} < min {:.2}; alert not sent",
                name, score, floor
            ),
            None => {}
        }

        if let Some(tier) = decision.tier {
            let text = caption(tier, name, result.score, &result.description);
            info!("[{}] {} alert (score={:.2})", name, tier.as_str(), result.score);
            if let Err(e) = self.effects.notifier.send_photo(&result.image_jpeg, &text).await {
                warn!("[{}] notification failed: {}", name, e);
            }
        }

        // Playback can run for seconds; the cycle and its metrics do not wait.
        if let Some(cue) = decision.audio {
            let audio = Arc::clone(&self.effects.audio);
            let camera = name.to_string();
            tokio::spawn(async move {
                if let Err(e) = audio.play(cue).await {
                    warn!("[{}] audio alert failed: {}", camera, e);
                }
            });
        }

        let event = MetricsEvent {
            source: name.to_string(),
            description: result.description.clone(),
            score: result.score,
        };
        if let Err(e) = self.effects.metrics.record(&event).await {
            warn!("[{}] metrics emission failed: {}", name, e);
        } else {
            debug!("[{}] metrics emitted", name);
        }

        decision
    }
}
