//! Notification log.
//!
//! Keys in the `notifications` namespace:
//!
//! ```text
//! n \0 {recipient} \0 {id:020}              -> Notification (JSON)
//! k \0 {source} \0 {kind} \0 {recipient}    -> id    (idempotency)
//! w \0 {recipient}                          -> u64   (read watermark)
//! ```
//!
//! Ids come from one global monotonic sequence, so a recipient's entries
//! sort oldest-first and are read newest-first. Everything at or below the
//! watermark is read. Entries are never deleted.

use std::fmt;

use brewlog_core::ResourceUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::DerivedIndex;
use crate::error::Result;
use crate::store::{Namespace, StoreBatch, key, prefix, sortable, split_key};

const SEQUENCE: &str = "notification";

/// Page size used when the caller passes `limit == 0`.
pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    /// Someone liked the recipient's record.
    Like,
    /// Someone commented on the recipient's record.
    Comment,
    /// Someone replied to the recipient's comment.
    Reply,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Reply => "reply",
        }
    }
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub id: u64,
    pub recipient: String,
    pub actor: String,
    pub kind: NotificationKind,
    /// The record that was liked or commented on.
    pub subject: ResourceUri,
    /// The like or comment that caused the notification.
    pub source: ResourceUri,
    pub created_at: DateTime<Utc>,
    /// Derived from the recipient's watermark at read time.
    #[serde(default)]
    pub read: bool,
}

/// A page of notifications, newest first.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NotificationPage {
    pub items: Vec<Notification>,
    /// Opaque cursor for the next (older) page.
    pub next_cursor: Option<String>,
}

/// A notification a content handler wants created.
#[derive(Debug, Clone)]
pub(crate) struct NewNotification {
    pub recipient: String,
    pub actor: String,
    pub kind: NotificationKind,
    pub subject: ResourceUri,
    pub source: ResourceUri,
    pub created_at: DateTime<Utc>,
}

fn entry_key(recipient: &str, id: u64) -> Vec<u8> {
    key(&["n", recipient, &sortable(id)])
}

fn idempotency_key(source: &str, kind: NotificationKind, recipient: &str) -> Vec<u8> {
    key(&["k", source, kind.as_str(), recipient])
}

fn watermark_key(recipient: &str) -> Vec<u8> {
    key(&["w", recipient])
}

fn id_from_key(raw: &[u8]) -> Option<u64> {
    split_key(raw).get(2)?.parse().ok()
}

impl DerivedIndex {
    /// Stage notifications into `batch`, skipping self-notifications and
    /// ones already created for the same `(source, kind, recipient)`.
    ///
    /// Must be called with the notifications lock held.
    pub(super) fn stage_notifications(
        &self,
        batch: &mut StoreBatch,
        pending: Vec<NewNotification>,
    ) -> Result<usize> {
        let mut created = 0;
        for note in pending {
            if note.actor == note.recipient {
                continue;
            }
            let idem = idempotency_key(&note.source.to_string(), note.kind, &note.recipient);
            if self.store.contains(Namespace::Notifications, &idem)? {
                continue;
            }

            let id = self.store.next_sequence(SEQUENCE)?;
            let notification = Notification {
                id,
                recipient: note.recipient,
                actor: note.actor,
                kind: note.kind,
                subject: note.subject,
                source: note.source,
                created_at: note.created_at,
                read: false,
            };
            batch.put_json(
                Namespace::Notifications,
                entry_key(&notification.recipient, id),
                &notification,
            )?;
            batch.put_u64(Namespace::Notifications, idem, id);
            metrics::counter!("index_notifications_total", "kind" => note.kind.as_str())
                .increment(1);
            created += 1;
        }
        Ok(created)
    }

    /// Notifications for `recipient`, newest first.
    ///
    /// Pass the previous page's `next_cursor` to continue. Entries created
    /// after the first page was fetched never appear on later pages. An
    /// unrecognised cursor yields an empty page.
    pub fn get_notifications(
        &self,
        recipient: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<NotificationPage> {
        let limit = match limit {
            0 => DEFAULT_PAGE_SIZE,
            n => n.min(MAX_PAGE_SIZE),
        };
        let before = match cursor {
            Some(raw) => match raw.parse::<u64>() {
                Ok(id) => Some(entry_key(recipient, id)),
                Err(_) => return Ok(NotificationPage::default()),
            },
            None => None,
        };

        let watermark = self.read_watermark(recipient)?;
        let rows = self.store.scan_prefix_rev(
            Namespace::Notifications,
            &prefix(&["n", recipient]),
            before.as_deref(),
            limit + 1,
        )?;

        let has_more = rows.len() > limit;
        let mut items = Vec::with_capacity(limit);
        for (_, raw) in rows.into_iter().take(limit) {
            let mut notification: Notification = serde_json::from_slice(&raw)?;
            notification.read = notification.id <= watermark;
            items.push(notification);
        }

        let next_cursor = if has_more {
            items.last().map(|n| n.id.to_string())
        } else {
            None
        };
        Ok(NotificationPage { items, next_cursor })
    }

    /// Mark everything `recipient` has received so far as read.
    ///
    /// Returns how many notifications flipped from unread to read.
    pub fn mark_all_read(&self, recipient: &str) -> Result<usize> {
        let _guard = self.locks.notifications.lock();
        let newest = self
            .store
            .scan_prefix_rev(
                Namespace::Notifications,
                &prefix(&["n", recipient]),
                None,
                1,
            )?
            .first()
            .and_then(|(k, _)| id_from_key(k));

        let Some(newest) = newest else {
            return Ok(0);
        };
        let flipped = self.unread_count(recipient)?;
        if flipped == 0 {
            return Ok(0);
        }

        let mut batch = StoreBatch::default();
        batch.put_u64(Namespace::Notifications, watermark_key(recipient), newest);
        self.store.write(batch)?;
        Ok(flipped)
    }

    /// Number of unread notifications for `recipient`.
    pub fn unread_count(&self, recipient: &str) -> Result<usize> {
        let watermark = self.read_watermark(recipient)?;
        let first_unread = entry_key(recipient, watermark.saturating_add(1));
        let rows = self.store.scan_prefix(
            Namespace::Notifications,
            &prefix(&["n", recipient]),
            Some(&first_unread),
            usize::MAX,
        )?;
        Ok(rows.len())
    }

    fn read_watermark(&self, recipient: &str) -> Result<u64> {
        self.store
            .get_u64(Namespace::Notifications, &watermark_key(recipient))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::collections::HashSet;

    fn seed_likes(h: &Harness, owner: &str, n: usize) {
        let s = brew_uri(owner, "s");
        for i in 0..n {
            h.index
                .upsert_like(&format!("did:plc:fan{i}"), &format!("l{i}"), &s)
                .unwrap();
        }
    }

    #[test]
    fn test_pages_are_newest_first_and_complete() {
        let h = harness();
        seed_likes(&h, "did:plc:owner", 7);

        let mut seen = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = h
                .index
                .get_notifications("did:plc:owner", 3, cursor.as_deref())
                .unwrap();
            assert!(page.items.len() <= 3);
            seen.extend(page.items.iter().map(|n| n.id));
            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        assert_eq!(seen.len(), 7);
        let mut sorted = seen.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(seen, sorted, "newest first");
    }

    #[test]
    fn test_concurrent_writes_do_not_shift_pages() {
        let h = harness();
        seed_likes(&h, "did:plc:owner", 4);

        let first = h.index.get_notifications("did:plc:owner", 2, None).unwrap();
        let snapshot: HashSet<u64> = {
            let all = h.index.get_notifications("did:plc:owner", 0, None).unwrap();
            all.items.iter().map(|n| n.id).collect()
        };

        // New activity lands between page fetches.
        let s = brew_uri("did:plc:owner", "s");
        h.index.upsert_like("did:plc:late", "late", &s).unwrap();

        let second = h
            .index
            .get_notifications("did:plc:owner", 2, first.next_cursor.as_deref())
            .unwrap();
        assert!(second.next_cursor.is_none());

        let paged: Vec<u64> = first
            .items
            .iter()
            .chain(second.items.iter())
            .map(|n| n.id)
            .collect();
        assert_eq!(paged.len(), 4);
        assert_eq!(paged.iter().copied().collect::<HashSet<_>>(), snapshot);
    }

    #[test]
    fn test_mark_all_read() {
        let h = harness();
        seed_likes(&h, "did:plc:owner", 3);
        assert_eq!(h.index.unread_count("did:plc:owner").unwrap(), 3);

        assert_eq!(h.index.mark_all_read("did:plc:owner").unwrap(), 3);
        assert_eq!(h.index.unread_count("did:plc:owner").unwrap(), 0);
        let page = h.index.get_notifications("did:plc:owner", 0, None).unwrap();
        assert!(page.items.iter().all(|n| n.read));

        // Newer notifications arrive unread.
        let s = brew_uri("did:plc:owner", "s");
        h.index.upsert_like("did:plc:new", "n1", &s).unwrap();
        assert_eq!(h.index.unread_count("did:plc:owner").unwrap(), 1);
        let page = h.index.get_notifications("did:plc:owner", 1, None).unwrap();
        assert!(!page.items[0].read);

        assert_eq!(h.index.mark_all_read("did:plc:owner").unwrap(), 1);
        assert_eq!(h.index.mark_all_read("did:plc:owner").unwrap(), 0);
    }

    #[test]
    fn test_recipients_are_isolated() {
        let h = harness();
        seed_likes(&h, "did:plc:one", 2);
        seed_likes(&h, "did:plc:two", 1);

        h.index.mark_all_read("did:plc:one").unwrap();
        assert_eq!(h.index.unread_count("did:plc:two").unwrap(), 1);
        assert_eq!(
            h.index.get_notifications("did:plc:two", 0, None).unwrap().items.len(),
            1
        );
    }

    #[test]
    fn test_empty_and_bad_cursor() {
        let h = harness();
        let page = h.index.get_notifications("did:plc:nobody", 10, None).unwrap();
        assert!(page.items.is_empty());
        assert!(page.next_cursor.is_none());
        assert_eq!(h.index.mark_all_read("did:plc:nobody").unwrap(), 0);

        seed_likes(&h, "did:plc:owner", 1);
        let page = h
            .index
            .get_notifications("did:plc:owner", 10, Some("garbage"))
            .unwrap();
        assert!(page.items.is_empty());
    }
}
