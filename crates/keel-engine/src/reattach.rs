use crate::bus::EventBus;
use async_stream::stream;
use futures::Stream;
use keel_contract::{EventRecord, RunStorage, Sequence, StorageError};
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;

/// Gap-free, duplicate-free stream of a run's events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<EventRecord, AttachError>> + Send>>;

#[derive(Debug, Error)]
pub enum AttachError {
    #[error("run not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Attach to a run's event stream at a client-remembered position.
///
/// Replays every durable event with sequence greater than `after`,
/// then hands over to the live tail. The live subscription is taken
/// out before the history snapshot is read, so an event appended
/// between the two lands in the subscription buffer instead of a gap;
/// the sequence cursor suppresses the overlap. The stream ends when
/// the run's channel is retired at the terminal transition, after a
/// final flush from the log.
pub async fn attach(
    storage: Arc<dyn RunStorage>,
    bus: Arc<EventBus>,
    run_id: &str,
    after: Sequence,
) -> Result<EventStream, AttachError> {
    let run = storage
        .get_run(run_id)
        .await?
        .ok_or_else(|| AttachError::NotFound(run_id.to_string()))?;
    let run_id = run_id.to_string();

    // Terminal runs emit their final event before the terminal
    // transition, so the log is already complete: replay only.
    if run.status.is_terminal() {
        return replay_only(&storage, &run_id, after).await;
    }

    let mut rx = bus.subscribe(&run_id).await;

    // The run may have gone terminal between the status read and the
    // subscription. Its channel is retired at the terminal transition,
    // so the subscription above would have re-created one that nothing
    // will ever publish to or close. Re-read before trusting the tail.
    let run = storage
        .get_run(&run_id)
        .await?
        .ok_or_else(|| AttachError::NotFound(run_id.clone()))?;
    if run.status.is_terminal() {
        drop(rx);
        bus.retire(&run_id).await;
        return replay_only(&storage, &run_id, after).await;
    }
    tracing::debug!(run_id, after, "attached live");

    let stream = stream! {
        let mut cursor = after;
        match storage.events_after(&run_id, cursor).await {
            Ok(events) => {
                for ev in events {
                    cursor = cursor.max(ev.sequence);
                    yield Ok(ev);
                }
            }
            Err(e) => {
                yield Err(e.into());
                return;
            }
        }

        loop {
            match rx.recv().await {
                Ok(ev) => {
                    // Anything at or below the cursor was already
                    // replayed from the log.
                    if ev.sequence > cursor {
                        cursor = ev.sequence;
                        yield Ok((*ev).clone());
                    }
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::debug!(
                        run_id = %run_id,
                        missed,
                        "live tail lagged; re-syncing from the log"
                    );
                    match storage.events_after(&run_id, cursor).await {
                        Ok(events) => {
                            for ev in events {
                                cursor = cursor.max(ev.sequence);
                                yield Ok(ev);
                            }
                        }
                        Err(e) => {
                            yield Err(e.into());
                            return;
                        }
                    }
                }
                Err(RecvError::Closed) => {
                    // Retired at the terminal transition. Flush
                    // whatever the buffer did not carry and finish.
                    match storage.events_after(&run_id, cursor).await {
                        Ok(events) => {
                            for ev in events {
                                cursor = cursor.max(ev.sequence);
                                yield Ok(ev);
                            }
                        }
                        Err(e) => yield Err(e.into()),
                    }
                    return;
                }
            }
        }
    };
    Ok(Box::pin(stream))
}

async fn replay_only(
    storage: &Arc<dyn RunStorage>,
    run_id: &str,
    after: Sequence,
) -> Result<EventStream, AttachError> {
    let events = storage.events_after(run_id, after).await?;
    tracing::debug!(run_id, after, count = events.len(), "replay-only attach");
    let stream = stream! {
        for ev in events {
            yield Ok(ev);
        }
    };
    Ok(Box::pin(stream))
}
