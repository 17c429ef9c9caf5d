//! Real-time synchronization core for the recruiting console.
//!
//! Keeps a local view of chat threads, messages and calendar slots
//! consistent with the server of record:
//! - cursor-based long polling for the thread list and the selected thread
//! - a reconnecting push socket for calendar slot changes
//! - identity-keyed reconciliation of every inbound batch
//! - debounced read receipts for counterparty activity
//!
//! All reconciliation runs on the task that owns the [`SessionBinder`];
//! drivers only hand batches over, so local collections need no locks.

pub mod binder;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod metrics;
pub mod poll;
pub mod push;
pub mod receipts;
pub mod reconcile;
pub mod socket;

use std::fmt;

pub use binder::{SessionBinder, SessionDeps, SessionEvent, SyncState};
pub use config::{ReconnectPolicy, SyncConfig};
pub use console_sdk::{
    Cursor, Message, MessageDraft, MessageId, Principal, PrincipalKind, SlotChange, SlotId,
    Thread, ThreadDraft, ThreadId, ThreadKind,
};
pub use error::{FetchError, PushError, SyncError};

/// What a poll loop or push channel is watching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    ThreadList,
    Thread(ThreadId),
    Calendar,
}

impl Scope {
    /// Low-cardinality label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Scope::ThreadList => "thread_list",
            Scope::Thread(_) => "thread",
            Scope::Calendar => "calendar",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::ThreadList => f.write_str("threads"),
            Scope::Thread(id) => write!(f, "thread:{id}"),
            Scope::Calendar => f.write_str("calendar"),
        }
    }
}

/// Receiving end for drivers. Returns false once the consumer is gone,
/// which stops the driver.
pub trait Deliver<T>: Send + 'static {
    fn deliver(&mut self, item: T) -> bool;
}

impl<T, F> Deliver<T> for F
where
    F: FnMut(T) -> bool + Send + 'static,
{
    fn deliver(&mut self, item: T) -> bool {
        (self)(item)
    }
}
