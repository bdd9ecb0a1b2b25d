//! One stage invocation, raced against cancellation and the hard ceiling.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use drivetalk_core::{
    PipelineStage, SessionId, StageError, StageKind, StageOutput, StageRequest, StageResult,
    TurnId,
};

use crate::output::TurnOutput;

/// The turn's hard ceiling, measured from submission.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Deadline {
    pub started: Instant,
    pub ceiling: Duration,
}

impl Deadline {
    pub fn at(&self) -> Instant {
        self.started + self.ceiling
    }

    pub fn exceeded(&self) -> StageError {
        StageError::DeadlineExceeded {
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            ceiling_ms: self.ceiling.as_millis() as u64,
        }
    }
}

/// Where streamed chunks go.
pub(crate) struct ChunkSink {
    pub tx: mpsc::Sender<TurnOutput>,
    pub turn_id: TurnId,
    pub session_id: SessionId,
}

impl ChunkSink {
    async fn forward(&self, stage: StageKind, content: &str) {
        let chunk = TurnOutput::Chunk {
            turn_id: self.turn_id.clone(),
            session_id: self.session_id.clone(),
            stage,
            content: content.to_string(),
        };
        if self.tx.send(chunk).await.is_err() {
            debug!(turn_id = %self.turn_id, "Output receiver dropped");
        }
    }
}

/// Invoke `stage` and wait for its outcome.
///
/// After cancellation (by the caller or by the hard ceiling) the adapter gets
/// `grace` to acknowledge; whatever it produces after that is discarded.
pub(crate) async fn run_stage(
    stage: Arc<dyn PipelineStage>,
    request: StageRequest,
    cancel: CancellationToken,
    deadline: Deadline,
    grace: Duration,
    sink: Option<&ChunkSink>,
) -> Result<StageOutput, StageError> {
    let kind = request.stage;
    let mut invoke = stage.invoke(request, cancel.clone());

    let result = tokio::select! {
        biased;
        result = &mut invoke => result,
        _ = cancel.cancelled() => {
            let _ = tokio::time::timeout(grace, &mut invoke).await;
            return Err(StageError::Cancelled);
        }
        _ = tokio::time::sleep_until(deadline.at()) => {
            cancel.cancel();
            let _ = tokio::time::timeout(grace, &mut invoke).await;
            return Err(deadline.exceeded());
        }
    };

    match result {
        StageResult::Success(output) if output.stage == kind => Ok(output),
        StageResult::Success(output) => Err(StageError::InvalidOutput(format!(
            "{} stage returned {} output",
            kind, output.stage
        ))),
        StageResult::Error(e) => Err(e),
        StageResult::Partial(mut chunks) => {
            let mut content = String::new();
            let mut count = 0u64;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(StageError::Cancelled),
                    _ = tokio::time::sleep_until(deadline.at()) => {
                        cancel.cancel();
                        return Err(deadline.exceeded());
                    }
                    next = chunks.recv() => next,
                };
                match next {
                    None => break,
                    Some(Err(e)) => return Err(e),
                    Some(Ok(chunk)) => {
                        if !chunk.content.is_empty() {
                            count += 1;
                            content.push_str(&chunk.content);
                            if let Some(sink) = sink {
                                sink.forward(kind, &chunk.content).await;
                            }
                        }
                        if chunk.done {
                            break;
                        }
                    }
                }
            }

            let mut output = StageOutput::new(kind, content);
            output.metadata.insert("streamed".into(), true.into());
            output.metadata.insert("chunks".into(), count.into());
            Ok(output)
        }
    }
}
