//! Identity-keyed merge of inbound batches into local collections.
//!
//! Every function takes the current collection by value and returns the
//! merged one plus a summary; nothing here touches global state. Callers
//! act on the summary (e.g. read receipts).

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use console_sdk::{
    Message, MessageId, Principal, SlotChange, SlotChangeKind, SlotId, Thread, ThreadId,
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageMerge {
    pub inserted: usize,
    pub replaced: usize,
    /// Items addressed to a different thread than the collection's.
    pub rejected: usize,
    /// Newly inserted messages whose sender is not the local principal.
    pub counterparty_inserts: usize,
}

impl MessageMerge {
    pub fn changed(&self) -> bool {
        self.inserted + self.replaced > 0
    }
}

/// Upserts `incoming` into a thread's messages and restores ascending
/// `created_at` order.
///
/// An id already present is replaced in place, so an optimistic echo and
/// a later polled copy of the same message converge to one entry.
pub fn reconcile_messages(
    mut collection: Vec<Message>,
    thread_id: ThreadId,
    incoming: Vec<Message>,
    local: &Principal,
) -> (Vec<Message>, MessageMerge) {
    let mut merge = MessageMerge::default();
    let mut positions: HashMap<MessageId, usize> = collection
        .iter()
        .enumerate()
        .map(|(idx, message)| (message.id, idx))
        .collect();

    for message in incoming {
        if message.thread_id != thread_id {
            merge.rejected += 1;
            warn!(
                target: "sync::reconcile",
                expected = thread_id,
                received = message.thread_id,
                message_id = message.id,
                "dropping message addressed to another thread"
            );
            continue;
        }
        match positions.get(&message.id) {
            Some(&idx) => {
                collection[idx] = message;
                merge.replaced += 1;
            }
            None => {
                if message.sender != *local {
                    merge.counterparty_inserts += 1;
                }
                positions.insert(message.id, collection.len());
                collection.push(message);
                merge.inserted += 1;
            }
        }
    }

    // Stable: equal timestamps keep their arrival order.
    collection.sort_by_key(|message| message.created_at);
    (collection, merge)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThreadMerge {
    pub inserted: usize,
    pub replaced: usize,
}

/// Replace-or-append by thread id. Server order is trusted, so nothing is
/// re-sorted.
pub fn reconcile_threads(
    mut collection: Vec<Thread>,
    incoming: Vec<Thread>,
) -> (Vec<Thread>, ThreadMerge) {
    let mut merge = ThreadMerge::default();
    for thread in incoming {
        match collection.iter_mut().find(|existing| existing.id == thread.id) {
            Some(existing) => {
                *existing = thread;
                merge.replaced += 1;
            }
            None => {
                collection.push(thread);
                merge.inserted += 1;
            }
        }
    }
    (collection, merge)
}

/// Refreshes a thread-list entry's summary from its newest local message.
/// Returns true when the entry changed.
pub fn refresh_thread_summary(threads: &mut [Thread], thread_id: ThreadId, messages: &[Message]) -> bool {
    let (Some(thread), Some(newest)) = (
        threads.iter_mut().find(|thread| thread.id == thread_id),
        messages.last(),
    ) else {
        return false;
    };

    let summary = newest.summary();
    let mut changed = false;
    let stale = match &thread.last_message {
        Some(current) => {
            current.created_at < summary.created_at
                || (current.message_id == summary.message_id && *current != summary)
        }
        None => true,
    };
    if stale {
        thread.last_message = Some(summary);
        changed = true;
    }
    if newest.created_at > thread.last_activity_at {
        thread.last_activity_at = newest.created_at;
        changed = true;
    }
    changed
}

/// Local copy of a calendar slot as last reported by the push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct CalendarSlot {
    pub id: SlotId,
    pub updated_at: DateTime<Utc>,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOutcome {
    Upserted,
    Removed,
    /// Deletion of a slot we never held.
    Missing,
    /// Older than what we already hold; last writer wins.
    Stale,
}

pub fn apply_slot_change(
    mut slots: BTreeMap<SlotId, CalendarSlot>,
    change: SlotChange,
) -> (BTreeMap<SlotId, CalendarSlot>, SlotOutcome) {
    if let Some(existing) = slots.get(&change.slot_id) {
        if change.timestamp < existing.updated_at {
            debug!(
                target: "sync::reconcile",
                slot_id = change.slot_id,
                "ignoring slot change older than local copy"
            );
            return (slots, SlotOutcome::Stale);
        }
    }

    let outcome = match change.change_type {
        SlotChangeKind::Created | SlotChangeKind::Updated => {
            slots.insert(
                change.slot_id,
                CalendarSlot {
                    id: change.slot_id,
                    updated_at: change.timestamp,
                    fields: change.payload,
                },
            );
            SlotOutcome::Upserted
        }
        SlotChangeKind::Deleted => match slots.remove(&change.slot_id) {
            Some(_) => SlotOutcome::Removed,
            None => SlotOutcome::Missing,
        },
    };
    (slots, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use console_sdk::{MessageSummary, PrincipalKind, ThreadKind};

    const ME: Principal = Principal {
        kind: PrincipalKind::Recruiter,
        id: 1,
    };
    const THEM: Principal = Principal {
        kind: PrincipalKind::Candidate,
        id: 2,
    };

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn msg(id: MessageId, secs: i64, sender: Principal, body: &str) -> Message {
        Message {
            id,
            thread_id: 7,
            sender,
            body: Some(body.to_string()),
            task: None,
            created_at: at(secs),
            edited_at: None,
            attachments: vec![],
            read_by: Default::default(),
        }
    }

    fn thread(id: ThreadId, unread: u32) -> Thread {
        Thread {
            id,
            title: format!("thread {id}"),
            kind: ThreadKind::Direct,
            last_message: None,
            unread_count: unread,
            last_activity_at: at(0),
        }
    }

    fn ids(messages: &[Message]) -> Vec<MessageId> {
        messages.iter().map(|m| m.id).collect()
    }

    #[test]
    fn batches_end_up_sorted_regardless_of_arrival_order() {
        let first = vec![msg(3, 30, THEM, "c"), msg(1, 10, THEM, "a")];
        let second = vec![msg(4, 5, ME, "early"), msg(2, 20, ME, "b")];

        let (collection, _) = reconcile_messages(Vec::new(), 7, first, &ME);
        let (collection, merge) = reconcile_messages(collection, 7, second, &ME);

        assert_eq!(ids(&collection), [4, 1, 2, 3]);
        assert!(collection
            .windows(2)
            .all(|pair| pair[0].created_at <= pair[1].created_at));
        assert_eq!(merge.inserted, 2);
        assert_eq!(merge.counterparty_inserts, 0);
    }

    #[test]
    fn duplicate_id_replaces_in_place() {
        let (collection, _) = reconcile_messages(
            Vec::new(),
            7,
            vec![msg(5, 1, THEM, "hi"), msg(6, 2, ME, "hello")],
            &ME,
        );
        let mut edited = msg(5, 1, THEM, "edited");
        edited.edited_at = Some(at(50));

        let (collection, merge) = reconcile_messages(collection, 7, vec![edited], &ME);

        assert_eq!(collection.len(), 2);
        assert_eq!(ids(&collection), [5, 6]);
        assert_eq!(collection[0].body.as_deref(), Some("edited"));
        assert_eq!(merge.replaced, 1);
        assert_eq!(merge.inserted, 0);
        assert!(merge.changed());
    }

    #[test]
    fn echo_and_polled_copy_converge() {
        let (collection, _) =
            reconcile_messages(Vec::new(), 7, vec![msg(5, 1, ME, "sent")], &ME);
        let (collection, merge) =
            reconcile_messages(collection, 7, vec![msg(5, 1, ME, "sent")], &ME);
        assert_eq!(collection.len(), 1);
        assert_eq!(merge.replaced, 1);
    }

    #[test]
    fn duplicates_within_one_batch_collapse() {
        let (collection, merge) = reconcile_messages(
            Vec::new(),
            7,
            vec![msg(5, 1, THEM, "v1"), msg(5, 1, THEM, "v2")],
            &ME,
        );
        assert_eq!(collection.len(), 1);
        assert_eq!(collection[0].body.as_deref(), Some("v2"));
        assert_eq!(merge.inserted, 1);
        assert_eq!(merge.replaced, 1);
        assert_eq!(merge.counterparty_inserts, 1);
    }

    #[test]
    fn foreign_thread_items_are_rejected() {
        let mut stray = msg(9, 1, THEM, "wrong room");
        stray.thread_id = 8;
        let (collection, merge) = reconcile_messages(Vec::new(), 7, vec![stray], &ME);
        assert!(collection.is_empty());
        assert_eq!(merge.rejected, 1);
        assert!(!merge.changed());
    }

    #[test]
    fn thread_list_keeps_server_order() {
        let (collection, _) =
            reconcile_threads(Vec::new(), vec![thread(3, 0), thread(1, 2), thread(2, 0)]);
        let (collection, merge) = reconcile_threads(collection, vec![thread(1, 0), thread(9, 1)]);

        let order: Vec<ThreadId> = collection.iter().map(|t| t.id).collect();
        assert_eq!(order, [3, 1, 2, 9]);
        assert_eq!(collection[1].unread_count, 0);
        assert_eq!(merge, ThreadMerge { inserted: 1, replaced: 1 });
    }

    #[test]
    fn summary_tracks_newest_message() {
        let mut threads = vec![thread(7, 0)];
        let messages = vec![msg(1, 10, THEM, "older"), msg(2, 20, ME, "newest")];

        assert!(refresh_thread_summary(&mut threads, 7, &messages));
        let summary = threads[0].last_message.clone().unwrap();
        assert_eq!(summary.message_id, 2);
        assert_eq!(summary.preview, "newest");
        assert_eq!(threads[0].last_activity_at, at(20));

        assert!(!refresh_thread_summary(&mut threads, 7, &messages));
        assert!(!refresh_thread_summary(&mut threads, 99, &messages));
    }

    #[test]
    fn summary_ignores_older_local_messages() {
        let mut threads = vec![thread(7, 0)];
        threads[0].last_message = Some(MessageSummary {
            message_id: 40,
            sender: THEM,
            preview: "server knows newer".into(),
            created_at: at(40),
        });
        threads[0].last_activity_at = at(40);

        assert!(!refresh_thread_summary(&mut threads, 7, &[msg(1, 10, ME, "old")]));
        assert_eq!(threads[0].last_message.as_ref().unwrap().message_id, 40);
    }

    fn slot_change(kind: SlotChangeKind, slot_id: SlotId, secs: i64) -> SlotChange {
        let mut payload = serde_json::Map::new();
        payload.insert("revision".into(), serde_json::json!(secs));
        SlotChange {
            change_type: kind,
            slot_id,
            timestamp: at(secs),
            payload,
        }
    }

    #[test]
    fn slot_changes_follow_last_writer_wins() {
        let slots = BTreeMap::new();
        let (slots, outcome) = apply_slot_change(slots, slot_change(SlotChangeKind::Created, 1, 10));
        assert_eq!(outcome, SlotOutcome::Upserted);

        let (slots, outcome) = apply_slot_change(slots, slot_change(SlotChangeKind::Updated, 1, 5));
        assert_eq!(outcome, SlotOutcome::Stale);
        assert_eq!(slots[&1].fields["revision"], 10);

        let (slots, outcome) = apply_slot_change(slots, slot_change(SlotChangeKind::Updated, 1, 20));
        assert_eq!(outcome, SlotOutcome::Upserted);
        assert_eq!(slots[&1].updated_at, at(20));

        let (slots, outcome) = apply_slot_change(slots, slot_change(SlotChangeKind::Deleted, 1, 30));
        assert_eq!(outcome, SlotOutcome::Removed);
        assert!(slots.is_empty());

        let (_, outcome) = apply_slot_change(slots, slot_change(SlotChangeKind::Deleted, 1, 31));
        assert_eq!(outcome, SlotOutcome::Missing);
    }
}
