use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub type ThreadId = i64;
pub type MessageId = i64;
pub type SlotId = i64;

/// Last known server activity instant for one subscription scope.
///
/// Cursors only move forward: [`Cursor::advance`] keeps the later of the
/// stored and the candidate instant, so an empty or out-of-order page can
/// never regress what the client has already seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(DateTime<Utc>);

impl Cursor {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn at(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    pub fn instant(&self) -> DateTime<Utc> {
        self.0
    }

    /// Max-merge `candidate` into the cursor. Returns true when it moved.
    pub fn advance(&mut self, candidate: Cursor) -> bool {
        if candidate > *self {
            *self = candidate;
            true
        } else {
            false
        }
    }

    /// Query-string form sent as `since=`.
    pub fn to_query(&self) -> String {
        self.0.to_rfc3339_opts(SecondsFormat::Micros, true)
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_query())
    }
}

impl From<DateTime<Utc>> for Cursor {
    fn from(value: DateTime<Utc>) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadKind {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalKind {
    User,
    Recruiter,
    Candidate,
    System,
    #[serde(other)]
    Unknown,
}

/// Sender identity: a principal type plus its id within that type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Principal {
    #[serde(rename = "type")]
    pub kind: PrincipalKind,
    pub id: i64,
}

impl Principal {
    pub fn new(kind: PrincipalKind, id: i64) -> Self {
        Self { kind, id }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageSummary {
    pub message_id: MessageId,
    pub sender: Principal,
    #[serde(default)]
    pub preview: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub title: String,
    pub kind: ThreadKind,
    #[serde(default)]
    pub last_message: Option<MessageSummary>,
    #[serde(default)]
    pub unread_count: u32,
    pub last_activity_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub id: i64,
    pub file_name: String,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadCounters {
    #[serde(default)]
    pub read: u32,
    #[serde(default)]
    pub total: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub sender: Principal,
    #[serde(default)]
    pub body: Option<String>,
    /// Structured task card attached instead of (or alongside) a text body.
    #[serde(default)]
    pub task: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub edited_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub read_by: ReadCounters,
}

impl Message {
    pub fn summary(&self) -> MessageSummary {
        MessageSummary {
            message_id: self.id,
            sender: self.sender,
            preview: self.body.clone().unwrap_or_default(),
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageDraft {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment_ids: Vec<i64>,
}

impl MessageDraft {
    pub fn text(body: impl Into<String>) -> Self {
        Self {
            body: Some(body.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThreadDraft {
    pub title: String,
    pub kind: ThreadKind,
    pub participants: Vec<Principal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One calendar push event. Everything beyond the routing fields is kept
/// verbatim in `payload`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotChange {
    pub change_type: SlotChangeKind,
    pub slot_id: SlotId,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

/// Decoded long-poll response.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdatesPage<T> {
    pub updated: bool,
    pub items: Vec<T>,
    /// Items present on the wire that failed to decode.
    pub dropped: usize,
    pub latest_event_at: Option<Cursor>,
}
