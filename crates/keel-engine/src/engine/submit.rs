use super::*;
use crate::lifecycle::Applied;
use crate::reattach::{attach, EventStream};
use crate::shield::{shielded_wait, WaitOutcome};
use keel_contract::{ExecutionContext, ExecutorError, RunStatus, Sequence};
use serde_json::json;

impl Engine {
    /// Submit a task and wait up to the request's wait window for it to
    /// finish. The window bounds the caller's patience only; its expiry
    /// defers the run and execution carries on in the background.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Submitted, EngineError> {
        let run_id = generate_run_id();
        let mut run = RunRecord::new(&run_id, &request.thread_id, request.payload);
        run.correlation_id = request.correlation_id;

        let (done_tx, done_rx) = oneshot::channel();
        self.launch(run, Some(done_tx)).await?;

        let wait = request.wait_timeout.unwrap_or(self.config.default_wait);
        match shielded_wait(&self.lifecycle, &run_id, wait, done_rx).await? {
            WaitOutcome::Finished(_) => Ok(Submitted::Finished(self.get_status(&run_id).await?)),
            WaitOutcome::Deferred => Ok(Submitted::Deferred { run_id }),
        }
    }

    /// Current run record, straight from storage.
    pub async fn get_status(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        self.lifecycle
            .get_run(run_id)
            .await?
            .ok_or_else(|| EngineError::NotFound(run_id.to_string()))
    }

    /// Attach to a run's event stream from a client-remembered
    /// position; replay and live tail are seamless, gap-free and
    /// duplicate-free.
    pub async fn stream(&self, run_id: &str, after: Sequence) -> Result<EventStream, EngineError> {
        Ok(attach(self.storage.clone(), self.bus.clone(), run_id, after).await?)
    }

    /// Runs matching the given statuses; empty means every non-terminal
    /// status.
    pub async fn list_active(
        &self,
        statuses: &[RunStatus],
    ) -> Result<Vec<RunRecord>, EngineError> {
        Ok(self.lifecycle.list_active(statuses).await?)
    }

    /// Explicitly stop a run. The run fails with a cancellation reason
    /// and its token fires so a cooperative executor can stop promptly.
    /// Cancelling an already-terminal run is a no-op returning the
    /// record as is. Cancelled runs never dispatch continuations.
    pub async fn cancel(&self, run_id: &str, reason: &str) -> Result<RunRecord, EngineError> {
        if let Some(token) = self.tokens.lock().await.get(run_id).cloned() {
            token.cancel();
        }
        tracing::info!(run_id, reason, "cancellation requested");
        self.finish_run(
            run_id,
            RunOutcome::Failure(format!("cancelled: {reason}")),
            false,
        )
        .await
    }

    /// Fire every in-flight run's cancellation token and close the bus.
    pub async fn shutdown(&self) {
        let tokens: Vec<CancellationToken> = self
            .tokens
            .lock()
            .await
            .drain()
            .map(|(_, token)| token)
            .collect();
        for token in tokens {
            token.cancel();
        }
        self.bus.shutdown().await;
        tracing::info!("engine shut down");
    }

    /// Persist a queued run, mark it picked up, and hand it to the
    /// executor on a background task. Pickup happens before the spawn
    /// so a wait timer can never observe a still-queued run.
    pub(crate) async fn launch(
        &self,
        run: RunRecord,
        waiter: Option<oneshot::Sender<RunOutcome>>,
    ) -> Result<(), EngineError> {
        let run = self.lifecycle.create_run(run).await?;
        self.lifecycle.mark_running(&run.id).await?;
        self.events
            .emit(&run.id, "run.started", json!({ "thread_id": run.thread_id }))
            .await?;

        let token = CancellationToken::new();
        self.tokens
            .lock()
            .await
            .insert(run.id.clone(), token.clone());
        if let Some(waiter) = waiter {
            self.waiters.lock().await.insert(run.id.clone(), waiter);
        }
        self.spawn_execution(run, token);
        Ok(())
    }

    fn spawn_execution(&self, run: RunRecord, token: CancellationToken) {
        let engine = self.clone();
        tokio::spawn(async move {
            let run_id = run.id.clone();
            let ctx = ExecutionContext {
                run_id: run.id.clone(),
                thread_id: run.thread_id.clone(),
                payload: run.payload.clone(),
                events: engine.events.clone(),
                cancellation: token.clone(),
            };

            let result = match engine.config.hard_timeout {
                Some(limit) => tokio::select! {
                    result = engine.executor.execute(ctx) => result,
                    () = tokio::time::sleep(limit) => {
                        token.cancel();
                        Err(ExecutorError::failed(format!(
                            "execution exceeded hard limit of {}ms",
                            limit.as_millis()
                        )))
                    }
                },
                None => engine.executor.execute(ctx).await,
            };
            let outcome = match result {
                Ok(value) => RunOutcome::Success(value),
                Err(e) => RunOutcome::Failure(e.to_string()),
            };
            if let Err(e) = engine.finish_run(&run_id, outcome, true).await {
                tracing::error!(run_id = %run_id, error = %e, "failed to record run completion");
            }
        });
    }

    /// Single completion path for every finisher (executor return,
    /// cancellation, hard timeout). The claim gate makes it first
    /// writer wins; losers observe whatever the winner persisted.
    pub(crate) async fn finish_run(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        dispatch: bool,
    ) -> Result<RunRecord, EngineError> {
        let current = self.get_status(run_id).await?;
        if current.status.is_terminal() {
            return Ok(current);
        }
        if !self.continuations.claim_completion(run_id).await {
            // The winning finisher is mid-flight; report its outcome
            // once the terminal record lands.
            return self.await_terminal(run_id).await;
        }
        // A finisher that held the claim may have persisted and
        // released between our status read and our claim.
        let current = self.get_status(run_id).await?;
        if current.status.is_terminal() {
            self.continuations.release(run_id).await;
            return Ok(current);
        }

        // The final event goes durable before the terminal transition,
        // so a terminal status always implies a complete log.
        let (event_type, payload) = match &outcome {
            RunOutcome::Success(result) => ("run.finished", json!({ "result": result })),
            RunOutcome::Failure(error) => ("run.failed", json!({ "error": error })),
        };
        if let Err(e) = self.events.emit(run_id, event_type, payload).await {
            self.continuations.release(run_id).await;
            return Err(e.into());
        }
        let applied = match self.lifecycle.complete(run_id, &outcome).await {
            Ok(applied) => applied,
            Err(e) => {
                self.continuations.release(run_id).await;
                return Err(e.into());
            }
        };
        let record = self.get_status(run_id).await?;

        if let Some(waiter) = self.waiters.lock().await.remove(run_id) {
            let _ = waiter.send(outcome);
        }
        self.bus.retire(run_id).await;
        self.heartbeats.clear(run_id).await;
        self.tokens.lock().await.remove(run_id);
        // Terminal state is durable; late duplicates re-read it after
        // claiming and back off, so the claim can be dropped here.
        self.continuations.release(run_id).await;

        if dispatch
            && matches!(
                applied,
                Applied::Changed {
                    from: RunStatus::Deferred
                }
            )
        {
            self.dispatch_continuation(&record).await;
        }
        Ok(record)
    }

    /// Wait briefly for a concurrent finisher's terminal record; falls
    /// back to the current record if it never lands.
    async fn await_terminal(&self, run_id: &str) -> Result<RunRecord, EngineError> {
        for _ in 0..50 {
            let run = self.get_status(run_id).await?;
            if run.status.is_terminal() {
                return Ok(run);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.get_status(run_id).await
    }

    /// Queue and launch the follow-up run for a finished deferred run.
    /// Happens under the parent's completion claim, so at most once per
    /// parent.
    async fn dispatch_continuation(&self, parent: &RunRecord) {
        let child = ContinuationDispatcher::follow_up(parent);
        tracing::info!(
            parent_run_id = %parent.id,
            continuation_run_id = %child.id,
            "dispatching continuation"
        );
        if let Err(e) = self.launch(child, None).await {
            tracing::error!(
                parent_run_id = %parent.id,
                error = %e,
                "continuation dispatch failed"
            );
        }
    }
}
