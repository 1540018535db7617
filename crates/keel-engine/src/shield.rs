use crate::lifecycle::{RunLifecycle, RunOutcome, TransitionError};
use keel_contract::RunStatus;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::oneshot;

/// How a caller's bounded wait on a run resolved.
#[derive(Debug)]
pub enum WaitOutcome {
    /// The run reached a terminal status inside the wait window.
    Finished(RunOutcome),
    /// The wait window elapsed. The run keeps executing in the
    /// background and is now marked deferred.
    Deferred,
}

/// Wait up to `wait_timeout` for the run's completion signal.
///
/// The wait timer is decoupled from the execution task: its expiry
/// defers the run, it never cancels anything. Cancellation is a
/// separate, explicit operation.
pub async fn shielded_wait(
    lifecycle: &RunLifecycle,
    run_id: &str,
    wait_timeout: Duration,
    mut completion: oneshot::Receiver<RunOutcome>,
) -> Result<WaitOutcome, TransitionError> {
    tokio::select! {
        outcome = &mut completion => match outcome {
            Ok(outcome) => Ok(WaitOutcome::Finished(outcome)),
            // The execution task dropped its sender without reporting;
            // the run record has the authoritative terminal state.
            Err(_) => finished_from_record(lifecycle, run_id).await,
        },
        () = tokio::time::sleep(wait_timeout) => {
            match lifecycle.defer(run_id).await {
                Ok(_) => {
                    tracing::info!(
                        run_id,
                        wait_ms = wait_timeout.as_millis() as u64,
                        "wait window elapsed; run continues in background"
                    );
                    Ok(WaitOutcome::Deferred)
                }
                // The run went terminal while the timer was firing.
                Err(TransitionError::Invalid { .. }) => {
                    finished_from_record(lifecycle, run_id).await
                }
                Err(e) => Err(e),
            }
        }
    }
}

async fn finished_from_record(
    lifecycle: &RunLifecycle,
    run_id: &str,
) -> Result<WaitOutcome, TransitionError> {
    let run = lifecycle
        .get_run(run_id)
        .await?
        .ok_or_else(|| TransitionError::NotFound(run_id.to_string()))?;
    let outcome = match run.status {
        RunStatus::Succeeded => RunOutcome::Success(run.result.unwrap_or(Value::Null)),
        RunStatus::Failed => {
            RunOutcome::Failure(run.error.unwrap_or_else(|| "run failed".to_string()))
        }
        from => {
            return Err(TransitionError::Invalid {
                run_id: run_id.to_string(),
                from,
                to: RunStatus::Deferred,
            })
        }
    };
    Ok(WaitOutcome::Finished(outcome))
}
