//! Inference client for any OpenAI-compatible vision endpoint (LM Studio,
//! Ollama, llama.cpp server, or a proxy in front of one of them).
//!
//! The model is prompted per camera to answer with a JSON object carrying a
//! risk `score` in [0,1], a `description`, and optionally a `human` flag.
//! [`decode_verdict`] is the single place that turns the model's free text
//! into a typed [`Verdict`].

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as B64, Engine};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;
use std::time::Duration;
use tracing::debug;

use crate::config::InferenceConfig;
use crate::error::InferenceError;

// ─── Request / response types (OpenAI-compatible) ────────────────────────────

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<Message>,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: MessageContent,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String, // "data:image/jpeg;base64,..."
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: Option<String>,
}

// ─── Verdict ─────────────────────────────────────────────────────────────────

/// Outcome of decoding the model's answer.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Parsed {
        /// Already clamped to [0, 1].
        score: f64,
        description: String,
        /// Explicit presence flag, when the model gave a boolean.
        human: Option<bool>,
    },
    ParseError {
        raw: String,
        cause: String,
    },
}

/// Lenient numeric field: models sometimes quote numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Number {
    Num(f64),
    Text(String),
}

impl Number {
    fn value(&self) -> Option<f64> {
        match self {
            Number::Num(v) => Some(*v),
            Number::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Only a real JSON boolean counts as an explicit flag.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Flag {
    Bool(bool),
    Other(serde_json::Value),
}

impl Flag {
    fn as_bool(&self) -> Option<bool> {
        match self {
            Flag::Bool(b) => Some(*b),
            Flag::Other(_) => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawVerdict {
    score: Option<Number>,
    riesgo: Option<Number>,
    risk: Option<Number>,
    description: Option<String>,
    descripcion: Option<String>,
    text: Option<String>,
    human: Option<Flag>,
    human_detected: Option<Flag>,
}

/// Clamp into [0, 1]; non-finite values are rejected.
pub fn clamp_score(v: f64) -> Option<f64> {
    v.is_finite().then(|| v.clamp(0.0, 1.0))
}

fn score_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)"(?:score|riesgo|risk)"\s*:\s*"?(-?\d+(?:\.\d+)?)"#).expect("valid score regex")
    })
}

fn description_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?i)"(?:description|descripcion)"\s*:\s*"((?:[^"\\]|\\.)*)""#)
            .expect("valid description regex")
    })
}

/// The JSON object inside `content`, with markdown fences and chatter removed.
fn json_object_slice(content: &str) -> Option<&str> {
    let start = content.find('{')?;
    let end = content.rfind('}')?;
    (end > start).then(|| &content[start..=end])
}

/// Decode the model's message content into a [`Verdict`].
pub fn decode_verdict(content: &str) -> Verdict {
    let raw = content.trim();
    if raw.is_empty() {
        return Verdict::ParseError {
            raw: String::new(),
            cause: "empty response".into(),
        };
    }

    let strict = json_object_slice(raw)
        .ok_or_else(|| "no JSON object in response".to_string())
        .and_then(|obj| serde_json::from_str::<RawVerdict>(obj).map_err(|e| e.to_string()));

    match strict {
        Ok(v) => {
            let number = v.score.or(v.riesgo).or(v.risk);
            let Some(value) = number.as_ref().and_then(Number::value) else {
                return Verdict::ParseError {
                    raw: raw.to_string(),
                    cause: "missing or non-numeric score".into(),
                };
            };
            let Some(score) = clamp_score(value) else {
                return Verdict::ParseError {
                    raw: raw.to_string(),
                    cause: format!("score {value} is not finite"),
                };
            };
            let description = v
                .description
                .or(v.descripcion)
                .or(v.text)
                .unwrap_or_default()
                .trim()
                .to_string();
            let human = v
                .human
                .as_ref()
                .and_then(Flag::as_bool)
                .or_else(|| v.human_detected.as_ref().and_then(Flag::as_bool));
            Verdict::Parsed {
                score,
                description,
                human,
            }
        }
        Err(cause) => decode_lenient(raw).unwrap_or(Verdict::ParseError {
            raw: raw.to_string(),
            cause,
        }),
    }
}

/// Salvage a score from almost-JSON (trailing commas, unquoted keys elsewhere,
/// truncated output).
fn decode_lenient(raw: &str) -> Option<Verdict> {
    let caps = score_regex().captures(raw)?;
    let score = clamp_score(caps.get(1)?.as_str().parse().ok()?)?;
    let description = description_regex()
        .captures(raw)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().replace("\\\"", "\""))
        .unwrap_or_else(|| raw.chars().take(300).collect());
    Some(Verdict::Parsed {
        score,
        description,
        human: None,
    })
}

pub fn jpeg_data_uri(jpeg: &[u8]) -> String {
    format!("data:image/jpeg;base64,{}", B64.encode(jpeg))
}

// ─── Analyzer seam ───────────────────────────────────────────────────────────

/// What the consumer needs from an inference backend.
#[async_trait]
pub trait FrameAnalyzer: Send + Sync {
    async fn analyze(&self, system_prompt: &str, jpeg: &[u8]) -> Result<Verdict, InferenceError>;

    fn label(&self) -> String;
}

// ─── Client ──────────────────────────────────────────────────────────────────

pub struct InferenceClient {
    http: Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    temperature: f32,
}

impl InferenceClient {
    pub fn from_config(cfg: &InferenceConfig) -> Result<Self, InferenceError> {
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()
            .map_err(|e| InferenceError::Transport(e.to_string()))?;

        Ok(Self {
            http,
            endpoint: cfg.endpoint(),
            model: cfg.model.clone(),
            api_key: cfg.api_key.clone().filter(|k| !k.is_empty()),
            max_tokens: cfg.max_tokens,
            temperature: cfg.temperature,
        })
    }
}

#[async_trait]
impl FrameAnalyzer for InferenceClient {
    async fn analyze(&self, system_prompt: &str, jpeg: &[u8]) -> Result<Verdict, InferenceError> {
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                Message {
                    role: "system",
                    content: MessageContent::Text(system_prompt.to_string()),
                },
                Message {
                    role: "user",
                    content: MessageContent::Parts(vec![ContentPart::ImageUrl {
                        image_url: ImageUrl {
                            url: jpeg_data_uri(jpeg),
                        },
                    }]),
                },
            ],
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: false,
        };

        debug!("inference call → {} ({} byte image)", self.endpoint, jpeg.len());

        let mut req = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            req = req.bearer_auth(key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(InferenceError::Status {
                status: status.as_u16(),
                body: text.chars().take(300).collect(),
            });
        }

        let parsed: ChatResponse = serde_json::from_str(&text)
            .map_err(|e| InferenceError::Malformed(format!("{}: {}", e, text.chars().take(200).collect::<String>())))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| InferenceError::Malformed("no message content in choices".into()))?;

        Ok(decode_verdict(&content))
    }

    fn label(&self) -> String {
        format!("{} @ {}", self.model, self.endpoint)
    }
}
