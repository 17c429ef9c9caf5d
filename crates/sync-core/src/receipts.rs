use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use console_sdk::{ConsoleError, ThreadId};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::fetcher::ChatBackend;
use crate::metrics;

#[async_trait]
pub trait ReadMarker: Send + Sync {
    async fn mark_read(&self, thread_id: ThreadId) -> Result<(), ConsoleError>;
}

/// Routes read receipts through a full [`ChatBackend`].
pub struct BackendMarker(pub Arc<dyn ChatBackend>);

#[async_trait]
impl ReadMarker for BackendMarker {
    async fn mark_read(&self, thread_id: ThreadId) -> Result<(), ConsoleError> {
        self.0.mark_read(thread_id).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiptSettled {
    pub thread_id: ThreadId,
    pub ok: bool,
    /// Activity arrived while the call was in flight and a follow-up call
    /// has been issued.
    pub requeued: bool,
}

/// Debounced mark-as-read.
///
/// At most one call per thread is in flight. Activity during a call marks
/// the thread as queued and exactly one follow-up call runs once the
/// current one settles. Failures are logged and otherwise ignored; the next
/// activity retries. Calls still pending at shutdown are abandoned.
pub struct ReadReceiptTrigger {
    marker: Arc<dyn ReadMarker>,
    cancel: CancellationToken,
    tasks: TaskTracker,
    /// Threads with a call in flight, and whether a follow-up is queued.
    in_flight: HashMap<ThreadId, bool>,
    settled_tx: mpsc::UnboundedSender<(ThreadId, Result<(), ConsoleError>)>,
    settled_rx: mpsc::UnboundedReceiver<(ThreadId, Result<(), ConsoleError>)>,
}

impl ReadReceiptTrigger {
    pub fn new(marker: Arc<dyn ReadMarker>, cancel: CancellationToken) -> Self {
        let (settled_tx, settled_rx) = mpsc::unbounded_channel();
        Self {
            marker,
            cancel,
            tasks: TaskTracker::new(),
            in_flight: HashMap::new(),
            settled_tx,
            settled_rx,
        }
    }

    pub fn on_inbound_activity(&mut self, thread_id: ThreadId) {
        match self.in_flight.get_mut(&thread_id) {
            Some(queued) => {
                if !*queued {
                    debug!(target: "sync::receipts", thread_id, "mark-read in flight; queueing follow-up");
                }
                *queued = true;
            }
            None => {
                self.in_flight.insert(thread_id, false);
                self.dispatch(thread_id);
            }
        }
    }

    pub fn is_in_flight(&self, thread_id: ThreadId) -> bool {
        self.in_flight.contains_key(&thread_id)
    }

    /// Waits for the next call to settle and issues its queued follow-up,
    /// if any. Cancel-safe; pends forever while nothing is in flight.
    pub async fn settled(&mut self) -> ReceiptSettled {
        let Some((thread_id, result)) = self.settled_rx.recv().await else {
            // Unreachable while `settled_tx` is held; keep the select arm quiet.
            return std::future::pending().await;
        };

        let ok = match result {
            Ok(()) => {
                metrics::READ_RECEIPTS.with_label_values(&["ok"]).inc();
                true
            }
            Err(err) => {
                metrics::READ_RECEIPTS.with_label_values(&["error"]).inc();
                warn!(target: "sync::receipts", thread_id, error = %err, "mark-read failed");
                false
            }
        };

        let requeued = if self.in_flight.get(&thread_id).copied().unwrap_or(false) {
            self.in_flight.insert(thread_id, false);
            self.dispatch(thread_id);
            true
        } else {
            self.in_flight.remove(&thread_id);
            false
        };

        ReceiptSettled {
            thread_id,
            ok,
            requeued,
        }
    }

    fn dispatch(&self, thread_id: ThreadId) {
        let marker = Arc::clone(&self.marker);
        let settled_tx = self.settled_tx.clone();
        let cancel = self.cancel.clone();
        debug!(target: "sync::receipts", thread_id, "issuing mark-read");
        self.tasks.spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!(target: "sync::receipts", thread_id, "mark-read abandoned at shutdown");
                }
                result = marker.mark_read(thread_id) => {
                    let _ = settled_tx.send((thread_id, result));
                }
            }
        });
    }

    /// Aborts pending calls and waits until their requests are released.
    pub async fn shutdown(&mut self) {
        self.cancel.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.in_flight.clear();
    }
}
