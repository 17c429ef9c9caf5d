use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use console_sdk::{
    ConsoleClient, ConsoleError, Cursor, Message, MessageDraft, Thread, ThreadDraft, ThreadId,
    UpdatesPage,
};
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;
use crate::Scope;

/// Typed result of one successful long poll.
#[derive(Debug, Clone, PartialEq)]
pub enum Delta<T> {
    /// New or changed items. May be empty for metadata-only changes.
    Updated {
        items: Vec<T>,
        latest: Option<Cursor>,
    },
    /// Server hold elapsed with nothing new.
    Heartbeat { latest: Option<Cursor> },
}

impl<T> Delta<T> {
    pub fn latest(&self) -> Option<Cursor> {
        match self {
            Delta::Updated { latest, .. } | Delta::Heartbeat { latest } => *latest,
        }
    }
}

impl<T> From<UpdatesPage<T>> for Delta<T> {
    fn from(page: UpdatesPage<T>) -> Self {
        if page.updated {
            Delta::Updated {
                items: page.items,
                latest: page.latest_event_at,
            }
        } else {
            Delta::Heartbeat {
                latest: page.latest_event_at,
            }
        }
    }
}

/// Server activity instant carried by an item, used for cursor max-merge.
pub trait Timestamped {
    fn activity_at(&self) -> DateTime<Utc>;
}

impl Timestamped for Thread {
    fn activity_at(&self) -> DateTime<Utc> {
        self.last_activity_at
    }
}

impl Timestamped for Message {
    fn activity_at(&self) -> DateTime<Utc> {
        match self.edited_at {
            Some(edited) if edited > self.created_at => edited,
            _ => self.created_at,
        }
    }
}

/// One cursor-based long-poll request for a fixed scope.
#[async_trait]
pub trait DeltaFetcher: Send + Sync {
    type Item: Timestamped + Send + 'static;

    fn scope(&self) -> Scope;

    /// Issues exactly one request and resolves on response, server hold
    /// timeout, or cancellation. Dropping the future aborts the request.
    async fn fetch(
        &self,
        since: &Cursor,
        cancel: &CancellationToken,
    ) -> Result<Delta<Self::Item>, FetchError>;
}

/// The request/response surface of the console backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    async fn thread_updates(
        &self,
        since: &Cursor,
        hold: Duration,
    ) -> Result<UpdatesPage<Thread>, ConsoleError>;

    async fn message_updates(
        &self,
        thread_id: ThreadId,
        since: &Cursor,
        hold: Duration,
    ) -> Result<UpdatesPage<Message>, ConsoleError>;

    async fn list_threads(&self) -> Result<Vec<Thread>, ConsoleError>;

    async fn list_messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, ConsoleError>;

    async fn mark_read(&self, thread_id: ThreadId) -> Result<(), ConsoleError>;

    async fn send_message(
        &self,
        thread_id: ThreadId,
        draft: &MessageDraft,
    ) -> Result<Message, ConsoleError>;

    async fn create_thread(&self, draft: &ThreadDraft) -> Result<Thread, ConsoleError>;
}

#[async_trait]
impl ChatBackend for ConsoleClient {
    async fn thread_updates(
        &self,
        since: &Cursor,
        hold: Duration,
    ) -> Result<UpdatesPage<Thread>, ConsoleError> {
        self.fetch_updates("chats", since, hold).await
    }

    async fn message_updates(
        &self,
        thread_id: ThreadId,
        since: &Cursor,
        hold: Duration,
    ) -> Result<UpdatesPage<Message>, ConsoleError> {
        self.fetch_updates(&format!("chats/{thread_id}/messages"), since, hold)
            .await
    }

    async fn list_threads(&self) -> Result<Vec<Thread>, ConsoleError> {
        ConsoleClient::list_threads(self).await
    }

    async fn list_messages(&self, thread_id: ThreadId) -> Result<Vec<Message>, ConsoleError> {
        ConsoleClient::list_messages(self, thread_id).await
    }

    async fn mark_read(&self, thread_id: ThreadId) -> Result<(), ConsoleError> {
        ConsoleClient::mark_read(self, thread_id).await
    }

    async fn send_message(
        &self,
        thread_id: ThreadId,
        draft: &MessageDraft,
    ) -> Result<Message, ConsoleError> {
        ConsoleClient::send_message(self, thread_id, draft).await
    }

    async fn create_thread(&self, draft: &ThreadDraft) -> Result<Thread, ConsoleError> {
        ConsoleClient::create_thread(self, draft).await
    }
}

pub struct ThreadListFetcher {
    backend: Arc<dyn ChatBackend>,
    hold: Duration,
}

impl ThreadListFetcher {
    pub fn new(backend: Arc<dyn ChatBackend>, hold: Duration) -> Self {
        Self { backend, hold }
    }
}

#[async_trait]
impl DeltaFetcher for ThreadListFetcher {
    type Item = Thread;

    fn scope(&self) -> Scope {
        Scope::ThreadList
    }

    async fn fetch(
        &self,
        since: &Cursor,
        cancel: &CancellationToken,
    ) -> Result<Delta<Thread>, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            page = self.backend.thread_updates(since, self.hold) => Ok(page?.into()),
        }
    }
}

pub struct ThreadMessagesFetcher {
    backend: Arc<dyn ChatBackend>,
    thread_id: ThreadId,
    hold: Duration,
}

impl ThreadMessagesFetcher {
    pub fn new(backend: Arc<dyn ChatBackend>, thread_id: ThreadId, hold: Duration) -> Self {
        Self {
            backend,
            thread_id,
            hold,
        }
    }
}

#[async_trait]
impl DeltaFetcher for ThreadMessagesFetcher {
    type Item = Message;

    fn scope(&self) -> Scope {
        Scope::Thread(self.thread_id)
    }

    async fn fetch(
        &self,
        since: &Cursor,
        cancel: &CancellationToken,
    ) -> Result<Delta<Message>, FetchError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            page = self.backend.message_updates(self.thread_id, since, self.hold) => Ok(page?.into()),
        }
    }
}
