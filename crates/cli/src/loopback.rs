//! In-process stage adapters for running scenarios without model backends.
//!
//! Understanding tags the text with a keyword intent, Generation streams a
//! reply word by word using whatever live context the snapshot carries, and
//! Synthesis wraps the reply in an `audio:` reference.

use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use drivetalk_core::{
    PipelineStage, QualityTier, StageChunk, StageError, StageKind, StageOutput, StageRequest,
    StageResult,
};

const INTENTS: &[(&str, &[&str])] = &[
    ("navigation", &["navigate", "route", "directions", "take me"]),
    ("media", &["play", "music", "song", "podcast"]),
    ("phone", &["call", "dial", "text"]),
    ("climate", &["temperature", "warm", "cold", "heat", "ac"]),
];

/// Keyword intent for `text`; `chat` when nothing matches.
pub fn classify(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    let words: Vec<&str> = lowered
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    INTENTS
        .iter()
        .find(|(_, keywords)| {
            keywords.iter().any(|k| {
                if k.contains(' ') {
                    lowered.contains(k)
                } else {
                    words.contains(k)
                }
            })
        })
        .map(|(intent, _)| *intent)
        .unwrap_or("chat")
}

pub struct LoopbackStage {
    kind: StageKind,
    latency: Duration,
    field_max_age: chrono::Duration,
}

impl LoopbackStage {
    pub fn new(kind: StageKind, latency: Duration) -> Self {
        Self {
            kind,
            latency,
            field_max_age: chrono::Duration::seconds(30),
        }
    }

    /// Hide context fields older than this from generated replies.
    pub fn with_field_max_age(mut self, secs: u64) -> Self {
        self.field_max_age = chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX));
        self
    }

    /// Lower tiers answer faster.
    fn latency_for(&self, tier: QualityTier) -> Duration {
        match tier {
            QualityTier::Normal => self.latency,
            QualityTier::Degraded => self.latency / 2,
            QualityTier::Minimal => self.latency / 4,
        }
    }

    fn understand(request: &StageRequest) -> StageOutput {
        let intent = classify(&request.input.text);
        let content = serde_json::json!({
            "intent": intent,
            "text": request.input.text,
        });
        let mut output = StageOutput::new(StageKind::Understanding, content.to_string());
        output.metadata.insert("intent".into(), intent.into());
        output
    }

    fn reply(&self, request: &StageRequest) -> String {
        let intent = request
            .input
            .understanding
            .as_ref()
            .and_then(|u| u.metadata.get("intent"))
            .and_then(|v| v.as_str())
            .unwrap_or("chat");
        let context = request.snapshot.view(Utc::now(), self.field_max_age);

        let mut reply = match intent {
            "navigation" => "Starting route guidance.".to_string(),
            "media" => "Playing that now.".to_string(),
            "phone" => "Placing the call.".to_string(),
            "climate" => "Adjusting the cabin temperature.".to_string(),
            _ => format!("You said: {}.", request.input.text.trim()),
        };
        if let Some(speed) = context.get("vehicle.speed_kph") {
            reply.push_str(&format!(" Current speed {speed} km/h."));
        }
        if let Some(weather) = context.get("external.weather.condition").and_then(|v| v.as_str()) {
            reply.push_str(&format!(" Weather ahead: {weather}."));
        }
        if !request.input.history.is_empty() {
            reply.push_str(&format!(" ({} earlier turns considered)", request.input.history.len()));
        }

        let words: Vec<&str> = reply.split_whitespace().collect();
        let limit = usize::try_from(request.budget.max_tokens).unwrap_or(usize::MAX).max(1);
        words[..words.len().min(limit)].join(" ")
    }
}

#[async_trait]
impl PipelineStage for LoopbackStage {
    fn name(&self) -> &str {
        match self.kind {
            StageKind::Understanding => "loopback-understanding",
            StageKind::Generation => "loopback-generation",
            StageKind::Synthesis => "loopback-synthesis",
        }
    }

    fn kind(&self) -> StageKind {
        self.kind
    }

    async fn invoke(&self, request: StageRequest, cancel: CancellationToken) -> StageResult {
        tokio::select! {
            _ = cancel.cancelled() => return StageResult::Error(StageError::Cancelled),
            _ = tokio::time::sleep(self.latency_for(request.tier)) => {}
        }

        match self.kind {
            StageKind::Understanding => StageResult::Success(Self::understand(&request)),
            StageKind::Generation => {
                let reply = self.reply(&request);
                let (tx, rx) = mpsc::channel(16);
                tokio::spawn(async move {
                    let words: Vec<String> = reply.split(' ').map(str::to_string).collect();
                    let last = words.len().saturating_sub(1);
                    for (i, word) in words.into_iter().enumerate() {
                        if cancel.is_cancelled() {
                            let _ = tx.send(Err(StageError::Cancelled)).await;
                            return;
                        }
                        let content = if i == last { word } else { format!("{word} ") };
                        if tx.send(Ok(StageChunk { content, done: i == last })).await.is_err() {
                            return;
                        }
                    }
                });
                StageResult::Partial(rx)
            }
            StageKind::Synthesis => {
                let text = request
                    .input
                    .response
                    .as_ref()
                    .map(|r| r.content.as_str())
                    .unwrap_or(&request.input.text);
                StageResult::Success(StageOutput::new(
                    StageKind::Synthesis,
                    format!("audio:{}:{text}", request.tier),
                ))
            }
        }
    }
}
