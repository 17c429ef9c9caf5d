//! Binds drivers to whatever the user is looking at.
//!
//! The binder owns the local collections. Poll loops and the push channel
//! only forward batches over an in-process queue; [`SessionBinder::next_event`]
//! applies them one at a time, so reconciliation never interleaves.
//!
//! Each binding gets a fresh generation number. A batch queued by a loop
//! that has since been unbound still carries the old generation and is
//! discarded instead of resurrecting state into a torn-down view.

use std::collections::{BTreeMap, HashMap};
use std::mem;
use std::sync::Arc;

use console_sdk::{
    Cursor, Message, MessageDraft, Principal, SlotChange, SlotId, Thread, ThreadDraft, ThreadId,
};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::fetcher::{ChatBackend, ThreadListFetcher, ThreadMessagesFetcher};
use crate::metrics;
use crate::poll::{PollHandle, PollLoopDriver};
use crate::push::{ChannelStatus, PushChannelManager, PushConnector, PushHandle};
use crate::receipts::{BackendMarker, ReadReceiptTrigger, ReceiptSettled};
use crate::reconcile::{
    apply_slot_change, reconcile_messages, reconcile_threads, refresh_thread_summary,
    CalendarSlot, SlotOutcome,
};
use crate::Scope;

/// Collaborators a session talks to.
#[derive(Clone)]
pub struct SessionDeps {
    pub backend: Arc<dyn ChatBackend>,
    /// Calendar push transport; `None` leaves the calendar without live updates.
    pub calendar: Option<Arc<dyn PushConnector>>,
    /// Identity of the signed-in user, used to tell counterparty messages apart.
    pub principal: Principal,
}

/// Local view of the server's data.
#[derive(Debug, Clone, Default)]
pub struct SyncState {
    /// Server order, most recent activity first.
    pub threads: Vec<Thread>,
    /// Per-thread messages, ascending by `created_at`.
    pub messages: HashMap<ThreadId, Vec<Message>>,
    pub slots: BTreeMap<SlotId, CalendarSlot>,
}

/// What changed after applying one inbound item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    ThreadsChanged,
    MessagesChanged { thread_id: ThreadId },
    CalendarChanged { slot_id: SlotId },
    ReadReceipt { thread_id: ThreadId, ok: bool },
}

enum Inbound {
    Threads {
        generation: u64,
        items: Vec<Thread>,
    },
    Messages {
        generation: u64,
        thread_id: ThreadId,
        items: Vec<Message>,
    },
    Slot {
        generation: u64,
        change: SlotChange,
    },
}

struct Binding<H> {
    generation: u64,
    handle: H,
}

pub struct SessionBinder {
    deps: SessionDeps,
    config: SyncConfig,
    cancel: CancellationToken,
    _guard: DropGuard,
    inbound_tx: mpsc::UnboundedSender<Inbound>,
    inbound_rx: mpsc::UnboundedReceiver<Inbound>,
    generation: u64,
    thread_list: Option<Binding<PollHandle>>,
    selected: Option<(ThreadId, Binding<PollHandle>)>,
    calendar: Option<Binding<PushHandle>>,
    receipts: ReadReceiptTrigger,
    state: SyncState,
}

impl SessionBinder {
    pub fn new(deps: SessionDeps, config: SyncConfig) -> Self {
        let cancel = CancellationToken::new();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let receipts = ReadReceiptTrigger::new(
            Arc::new(BackendMarker(deps.backend.clone())),
            cancel.child_token(),
        );
        Self {
            deps,
            config,
            _guard: cancel.clone().drop_guard(),
            cancel,
            inbound_tx,
            inbound_rx,
            generation: 0,
            thread_list: None,
            selected: None,
            calendar: None,
            receipts,
            state: SyncState::default(),
        }
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn threads(&self) -> &[Thread] {
        &self.state.threads
    }

    pub fn messages(&self, thread_id: ThreadId) -> &[Message] {
        self.state
            .messages
            .get(&thread_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn slots(&self) -> &BTreeMap<SlotId, CalendarSlot> {
        &self.state.slots
    }

    pub fn active_thread(&self) -> Option<ThreadId> {
        self.selected.as_ref().map(|(thread_id, _)| *thread_id)
    }

    /// Hydrates the thread list and starts its poll loop. No-op when
    /// already bound.
    pub async fn open_messenger(&mut self) {
        if self.thread_list.is_some() {
            return;
        }
        let cursor = Cursor::now();
        match self.deps.backend.list_threads().await {
            Ok(snapshot) => {
                let (threads, merge) = reconcile_threads(mem::take(&mut self.state.threads), snapshot);
                self.state.threads = threads;
                debug!(target: "sync::binder", inserted = merge.inserted, "thread list hydrated");
            }
            Err(err) => {
                warn!(target: "sync::binder", error = %err, "thread list snapshot failed; polling anyway");
            }
        }

        let generation = self.next_generation();
        let tx = self.inbound_tx.clone();
        let handle = PollLoopDriver::new(
            ThreadListFetcher::new(self.deps.backend.clone(), self.config.poll_hold),
            move |items| tx.send(Inbound::Threads { generation, items }).is_ok(),
            cursor,
            self.config.poll_retry_backoff,
            self.cancel.child_token(),
        )
        .spawn();
        info!(target: "sync::binder", generation, "messenger bound");
        self.thread_list = Some(Binding { generation, handle });
    }

    /// Unbinds the thread list and the selected thread.
    pub async fn close_messenger(&mut self) {
        self.select_thread(None).await;
        if let Some(binding) = self.thread_list.take() {
            binding.handle.stop().await;
            info!(target: "sync::binder", "messenger unbound");
        }
    }

    /// Moves the thread-scoped loop to `thread_id`. The previous loop is
    /// fully stopped before the new one starts.
    pub async fn select_thread(&mut self, thread_id: Option<ThreadId>) {
        if self.active_thread() == thread_id {
            return;
        }
        if let Some((previous, binding)) = self.selected.take() {
            binding.handle.stop().await;
            debug!(target: "sync::binder", thread_id = previous, "thread unbound");
        }
        let Some(thread_id) = thread_id else {
            return;
        };

        let cursor = Cursor::now();
        match self.deps.backend.list_messages(thread_id).await {
            Ok(snapshot) => {
                self.merge_messages(thread_id, snapshot);
            }
            Err(err) => {
                warn!(target: "sync::binder", thread_id, error = %err, "message snapshot failed; polling anyway");
            }
        }

        let generation = self.next_generation();
        let tx = self.inbound_tx.clone();
        let handle = PollLoopDriver::new(
            ThreadMessagesFetcher::new(self.deps.backend.clone(), thread_id, self.config.poll_hold),
            move |items| {
                tx.send(Inbound::Messages {
                    generation,
                    thread_id,
                    items,
                })
                .is_ok()
            },
            cursor,
            self.config.poll_retry_backoff,
            self.cancel.child_token(),
        )
        .spawn();
        self.selected = Some((thread_id, Binding { generation, handle }));
        info!(target: "sync::binder", thread_id, generation, "thread bound");

        if self.unread(thread_id) > 0 {
            self.receipts.on_inbound_activity(thread_id);
        }
    }

    /// Binds the calendar push channel. Returns false when live calendar
    /// updates are switched off or no transport is configured.
    pub fn show_calendar(&mut self) -> bool {
        if !self.config.calendar_push {
            debug!(target: "sync::binder", "calendar push disabled by configuration");
            return false;
        }
        if let Some(binding) = &self.calendar {
            binding.handle.enable();
            return true;
        }
        let Some(connector) = self.deps.calendar.clone() else {
            debug!(target: "sync::binder", "no calendar transport configured");
            return false;
        };

        let generation = self.next_generation();
        let tx = self.inbound_tx.clone();
        let handle = PushChannelManager::new(
            connector,
            move |change| tx.send(Inbound::Slot { generation, change }).is_ok(),
            self.config.reconnect,
            self.cancel.child_token(),
        )
        .spawn();
        info!(target: "sync::binder", generation, "calendar bound");
        self.calendar = Some(Binding { generation, handle });
        true
    }

    pub async fn hide_calendar(&mut self) {
        if let Some(binding) = self.calendar.take() {
            binding.handle.shutdown().await;
            info!(target: "sync::binder", "calendar unbound");
        }
    }

    /// Manual reconnect; resets the channel's attempt counter.
    pub fn reconnect_calendar(&self) -> bool {
        match &self.calendar {
            Some(binding) => {
                binding.handle.reconnect();
                true
            }
            None => false,
        }
    }

    pub fn calendar_status(&self) -> Option<ChannelStatus> {
        self.calendar.as_ref().map(|binding| binding.handle.status())
    }

    /// Sends a message and merges the server's copy right away. A later
    /// polled copy with the same id replaces it.
    pub async fn send_message(
        &mut self,
        thread_id: ThreadId,
        draft: &MessageDraft,
    ) -> Result<Message, SyncError> {
        let message = self.deps.backend.send_message(thread_id, draft).await?;
        self.merge_messages(thread_id, vec![message.clone()]);
        Ok(message)
    }

    pub async fn create_thread(&mut self, draft: &ThreadDraft) -> Result<Thread, SyncError> {
        let thread = self.deps.backend.create_thread(draft).await?;
        let (threads, _) = reconcile_threads(mem::take(&mut self.state.threads), vec![thread.clone()]);
        self.state.threads = threads;
        Ok(thread)
    }

    /// Applies inbound items until one changes local state and reports it.
    /// Cancel-safe.
    pub async fn next_event(&mut self) -> SessionEvent {
        loop {
            let event = tokio::select! {
                biased;
                settled = self.receipts.settled() => Some(self.on_receipt(settled)),
                Some(inbound) = self.inbound_rx.recv() => self.apply(inbound),
            };
            if let Some(event) = event {
                return event;
            }
        }
    }

    /// Stops every binding and waits for their tasks to release their
    /// requests and sockets.
    pub async fn shutdown(mut self) {
        self.close_messenger().await;
        self.hide_calendar().await;
        self.receipts.shutdown().await;
        self.cancel.cancel();
        info!(target: "sync::binder", "session shut down");
    }

    fn apply(&mut self, inbound: Inbound) -> Option<SessionEvent> {
        match inbound {
            Inbound::Threads { generation, items } => {
                if !bound(&self.thread_list, generation) {
                    return stale(Scope::ThreadList, generation);
                }
                let (threads, merge) = reconcile_threads(mem::take(&mut self.state.threads), items);
                self.state.threads = threads;
                debug!(
                    target: "sync::binder",
                    inserted = merge.inserted,
                    replaced = merge.replaced,
                    "thread list reconciled"
                );
                // Unread counts here lag behind our own receipts; only
                // inbound messages notify the trigger.
                Some(SessionEvent::ThreadsChanged)
            }
            Inbound::Messages {
                generation,
                thread_id,
                items,
            } => {
                let current = matches!(
                    &self.selected,
                    Some((active, binding)) if *active == thread_id && binding.generation == generation
                );
                if !current {
                    return stale(Scope::Thread(thread_id), generation);
                }
                let counterparty = self.merge_messages(thread_id, items);
                if counterparty > 0 {
                    self.receipts.on_inbound_activity(thread_id);
                }
                Some(SessionEvent::MessagesChanged { thread_id })
            }
            Inbound::Slot { generation, change } => {
                if !bound(&self.calendar, generation) {
                    return stale(Scope::Calendar, generation);
                }
                let slot_id = change.slot_id;
                let (slots, outcome) = apply_slot_change(mem::take(&mut self.state.slots), change);
                self.state.slots = slots;
                match outcome {
                    SlotOutcome::Upserted | SlotOutcome::Removed => {
                        Some(SessionEvent::CalendarChanged { slot_id })
                    }
                    SlotOutcome::Missing | SlotOutcome::Stale => None,
                }
            }
        }
    }

    fn on_receipt(&mut self, settled: ReceiptSettled) -> SessionEvent {
        let ReceiptSettled { thread_id, ok, .. } = settled;
        if ok {
            if let Some(thread) = self.state.threads.iter_mut().find(|t| t.id == thread_id) {
                thread.unread_count = 0;
            }
        }
        SessionEvent::ReadReceipt { thread_id, ok }
    }

    /// Reconciles into a thread's messages and refreshes its list entry.
    /// Returns how many counterparty messages were newly inserted.
    fn merge_messages(&mut self, thread_id: ThreadId, items: Vec<Message>) -> usize {
        let existing = self.state.messages.remove(&thread_id).unwrap_or_default();
        let (merged, merge) = reconcile_messages(existing, thread_id, items, &self.deps.principal);
        refresh_thread_summary(&mut self.state.threads, thread_id, &merged);
        self.state.messages.insert(thread_id, merged);
        debug!(
            target: "sync::binder",
            thread_id,
            inserted = merge.inserted,
            replaced = merge.replaced,
            rejected = merge.rejected,
            "messages reconciled"
        );
        merge.counterparty_inserts
    }

    fn unread(&self, thread_id: ThreadId) -> u32 {
        self.state
            .threads
            .iter()
            .find(|thread| thread.id == thread_id)
            .map(|thread| thread.unread_count)
            .unwrap_or(0)
    }

    fn next_generation(&mut self) -> u64 {
        self.generation += 1;
        self.generation
    }
}

fn bound<H>(binding: &Option<Binding<H>>, generation: u64) -> bool {
    binding
        .as_ref()
        .is_some_and(|binding| binding.generation == generation)
}

fn stale(scope: Scope, generation: u64) -> Option<SessionEvent> {
    metrics::STALE_BATCHES.with_label_values(&[scope.kind()]).inc();
    debug!(target: "sync::binder", %scope, generation, "discarding batch from unbound loop");
    None
}
