//! Hanging-poll loop around a [`DeltaFetcher`].
//!
//! One driver owns one scope's cursor. Each iteration awaits the previous
//! fetch before issuing the next, so batches reach the sink in cursor order.
//! Successful responses loop back immediately; failures pause for a fixed
//! backoff and retry forever. Only the cancellation token ends the loop.

use std::time::Duration;

use console_sdk::Cursor;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

use crate::fetcher::{Delta, DeltaFetcher, Timestamped};
use crate::metrics;
use crate::{Deliver, Scope};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Idle,
    /// Between requests: applying a response or about to issue the next one.
    Running,
    /// Request in flight, held open by the server.
    Waiting,
    /// Pausing after a failed request.
    Failing,
    Stopped,
}

/// Final accounting returned when a loop stops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollReport {
    pub scope: Scope,
    pub cursor: Cursor,
    pub batches: u64,
    pub heartbeats: u64,
    pub failures: u64,
}

pub struct PollLoopDriver<F, S> {
    fetcher: F,
    sink: S,
    cursor: Cursor,
    retry_backoff: Duration,
    cancel: CancellationToken,
    state: watch::Sender<PollState>,
}

impl<F, S> PollLoopDriver<F, S>
where
    F: DeltaFetcher + 'static,
    S: Deliver<Vec<F::Item>>,
{
    pub fn new(
        fetcher: F,
        sink: S,
        cursor: Cursor,
        retry_backoff: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (state, _) = watch::channel(PollState::Idle);
        Self {
            fetcher,
            sink,
            cursor,
            retry_backoff,
            cancel,
            state,
        }
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollState> {
        self.state.subscribe()
    }

    pub fn spawn(self) -> PollHandle {
        let scope = self.fetcher.scope();
        let cancel = self.cancel.clone();
        let state = self.subscribe_state();
        let join = tokio::spawn(self.run());
        PollHandle {
            scope,
            cancel: cancel.clone(),
            state,
            join,
            _guard: cancel.drop_guard(),
        }
    }

    pub async fn run(mut self) -> PollReport {
        let scope = self.fetcher.scope();
        let label = scope.kind();
        let mut report = PollReport {
            scope,
            cursor: self.cursor,
            batches: 0,
            heartbeats: 0,
            failures: 0,
        };
        debug!(target: "sync::poll", %scope, cursor = %self.cursor, "poll loop started");

        while !self.cancel.is_cancelled() {
            self.set_state(PollState::Waiting);
            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                outcome = self.fetcher.fetch(&self.cursor, &self.cancel) => outcome,
            };
            if self.cancel.is_cancelled() {
                debug!(target: "sync::poll", %scope, "discarding response completed after cancellation");
                break;
            }
            self.set_state(PollState::Running);

            match outcome {
                Ok(Delta::Updated { items, latest }) => {
                    report.batches += 1;
                    metrics::POLL_BATCHES.with_label_values(&[label]).inc();
                    let newest_item = items.iter().map(|item| Cursor::at(item.activity_at())).max();
                    self.advance(latest.into_iter().chain(newest_item).max());
                    debug!(
                        target: "sync::poll",
                        %scope,
                        items = items.len(),
                        cursor = %self.cursor,
                        "delivering batch"
                    );
                    if !self.sink.deliver(items) {
                        debug!(target: "sync::poll", %scope, "sink closed; stopping");
                        break;
                    }
                }
                Ok(Delta::Heartbeat { latest }) => {
                    report.heartbeats += 1;
                    metrics::POLL_HEARTBEATS.with_label_values(&[label]).inc();
                    self.advance(latest);
                }
                Err(err) if err.is_cancelled() => break,
                Err(err) => {
                    report.failures += 1;
                    metrics::POLL_FAILURES.with_label_values(&[label]).inc();
                    self.set_state(PollState::Failing);
                    warn!(
                        target: "sync::poll",
                        %scope,
                        error = %err,
                        retry_ms = self.retry_backoff.as_millis() as u64,
                        "poll failed; retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(self.retry_backoff) => {}
                    }
                }
            }
        }

        self.set_state(PollState::Stopped);
        report.cursor = self.cursor;
        debug!(target: "sync::poll", %scope, cursor = %self.cursor, "poll loop stopped");
        report
    }

    fn advance(&mut self, candidate: Option<Cursor>) {
        let Some(candidate) = candidate else {
            return;
        };
        if !self.cursor.advance(candidate) && candidate < self.cursor {
            debug!(
                target: "sync::poll",
                stored = %self.cursor,
                received = %candidate,
                "ignoring cursor regression"
            );
        }
    }

    fn set_state(&self, state: PollState) {
        self.state.send_replace(state);
    }
}

/// Owner's handle on a spawned loop. Dropping it cancels the loop; call
/// [`PollHandle::stop`] to also wait for it to finish.
pub struct PollHandle {
    scope: Scope,
    cancel: CancellationToken,
    state: watch::Receiver<PollState>,
    join: JoinHandle<PollReport>,
    _guard: DropGuard,
}

impl PollHandle {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn state(&self) -> PollState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PollState> {
        self.state.clone()
    }

    /// Cancels the loop and waits until it has released its in-flight
    /// request. Returns `None` only if the task panicked.
    pub async fn stop(self) -> Option<PollReport> {
        self.cancel.cancel();
        match self.join.await {
            Ok(report) => Some(report),
            Err(err) => {
                warn!(target: "sync::poll", scope = %self.scope, error = %err, "poll task failed");
                None
            }
        }
    }
}
