//! `drivetalk run` — replay a scenario against loopback stages.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

use drivetalk_config::AppConfig;
use drivetalk_core::{SessionId, TurnId, TurnInput};
use drivetalk_ingest::RawEvent;
use drivetalk_scheduler::TurnOutput;
use drivetalk_telemetry::TelemetrySummary;

use crate::runtime::Runtime;
use crate::scenario::{self, Action, Step};

pub async fn run(
    config: AppConfig,
    scenario_path: &Path,
    settle_ms: u64,
    json: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let steps = scenario::load(scenario_path)?;
    info!(steps = steps.len(), path = %scenario_path.display(), "Scenario loaded");

    let mut runtime = Runtime::new(config);
    let mut outputs = runtime.start()?;

    let started = Instant::now();
    let settle = Duration::from_millis(settle_ms);
    let mut last_activity = started;
    let mut labels: HashMap<String, TurnId> = HashMap::new();
    let mut steps = steps.into_iter().peekable();

    loop {
        let wake_at = match steps.peek() {
            Some(step) => started + Duration::from_millis(step.at_ms),
            None => last_activity + settle,
        };
        tokio::select! {
            output = outputs.recv() => {
                let Some(output) = output else { break };
                last_activity = Instant::now();
                print_output(&output, json)?;
            }
            _ = tokio::time::sleep_until(wake_at) => {
                let Some(step) = steps.next() else { break };
                last_activity = Instant::now();
                apply(&runtime, step, &mut labels).await;
            }
        }
    }

    let summary = runtime.telemetry().summary();
    runtime.stop().await;
    print_summary(&summary, json)?;
    Ok(())
}

async fn apply(runtime: &Runtime, step: Step, labels: &mut HashMap<String, TurnId>) {
    let scheduler = runtime.scheduler();
    match step.action {
        Action::Open { session, user } => {
            if !scheduler.store().open_with_id(SessionId::from(session.as_str()), user) {
                warn!(session = %session, "Session already open");
            }
        }
        Action::Signal {
            source,
            session,
            timestamp,
            payload,
        } => {
            let event = RawEvent {
                session_id: session,
                timestamp,
                payload,
            };
            runtime.feed(source, event).await;
        }
        Action::Utterance {
            session,
            text,
            confidence,
            label,
        } => {
            let session = SessionId::from(session);
            match scheduler.submit_utterance(&session, &text, confidence).await {
                Ok(Some(turn_id)) => remember(labels, label, turn_id),
                Ok(None) => info!(session = %session, confidence, "Utterance below confidence"),
                Err(e) => warn!(session = %session, error = %e, "Utterance rejected"),
            }
        }
        Action::Text {
            session,
            text,
            priority,
            label,
        } => {
            let session = SessionId::from(session);
            match scheduler.submit_turn(&session, TurnInput::text(text), priority) {
                Ok(turn_id) => remember(labels, label, turn_id),
                Err(e) => warn!(session = %session, error = %e, "Turn rejected"),
            }
        }
        Action::Cancel { label } => match labels.get(&label) {
            Some(turn_id) => {
                if let Err(e) = scheduler.cancel_turn(turn_id) {
                    warn!(label = %label, error = %e, "Cancel failed");
                }
            }
            None => warn!(label = %label, "No turn submitted under this label"),
        },
        Action::Close { session } => {
            if let Err(e) = scheduler.close_session(&SessionId::from(session)) {
                warn!(error = %e, "Close failed");
            }
        }
    }
}

fn remember(labels: &mut HashMap<String, TurnId>, label: Option<String>, turn_id: TurnId) {
    info!(turn_id = %turn_id, label = ?label, "Turn submitted");
    if let Some(label) = label {
        labels.insert(label, turn_id);
    }
}

fn print_output(output: &TurnOutput, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string(output)?);
        return Ok(());
    }

    match output {
        // Chunks are visible with -v; the final response repeats them.
        TurnOutput::Chunk {
            turn_id, content, ..
        } => tracing::debug!(turn_id = %turn_id, content = %content, "Chunk"),
        TurnOutput::Completed {
            turn_id,
            session_id,
            response,
            audio,
            tier,
        } => {
            println!("✅ [{session_id}] {turn_id} ({tier})");
            println!("   {response}");
            println!("   🔊 {audio}");
        }
        TurnOutput::Fallback {
            turn_id,
            session_id,
            reason,
            text,
            audio,
        } => {
            println!("⚠️  [{session_id}] {turn_id} failed: {reason}");
            println!("   {text}");
            if let Some(audio) = audio {
                println!("   🔊 {audio}");
            }
        }
        TurnOutput::Reprompt {
            session_id,
            text,
            confidence,
        } => {
            println!("🎙️  [{session_id}] reprompt (confidence {confidence:.2}): {text}");
        }
    }
    Ok(())
}

fn print_summary(summary: &TelemetrySummary, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    if json {
        println!("{}", serde_json::to_string(summary)?);
        return Ok(());
    }

    println!();
    println!("📊 Run Summary");
    println!("─────────────────────────────────────");
    println!("  Turns submitted:  {}", summary.turns_submitted);
    println!("  Succeeded:        {}", summary.turns_succeeded);
    println!("  Failed:           {}", summary.turns_failed);
    println!("  Cancelled:        {}", summary.turns_cancelled);
    println!("  Fallbacks:        {}", summary.fallbacks);
    println!(
        "  Slow (> {}ms):   {}",
        summary.response_threshold_ms, summary.slow_turns
    );
    println!("  Tier changes:     {}", summary.tier_changes);
    println!("  Context updates:  {}", summary.context_updates);
    println!("  Context refresh:  {}", summary.context_refreshes);
    println!("  Proactive turns:  {}", summary.proactive_turns);

    if !summary.dropped_deltas.is_empty() {
        println!();
        println!("  Dropped deltas:");
        for (reason, count) in &summary.dropped_deltas {
            println!("    {reason:<16} {count}");
        }
    }

    if !summary.stages.is_empty() {
        println!();
        println!("  {:<14} {:>6} {:>8} {:>6} {:>6}", "Stage", "Calls", "Mean", "Min", "Max");
        for (stage, latency) in &summary.stages {
            println!(
                "  {:<14} {:>6} {:>6.0}ms {:>4}ms {:>4}ms",
                stage.to_string(),
                latency.invocations,
                latency.mean_ms,
                latency.min_ms,
                latency.max_ms
            );
        }
    }

    Ok(())
}
