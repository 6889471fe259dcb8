//! Like ledger.
//!
//! Keys in the `likes` namespace:
//!
//! ```text
//! s \0 {subject} \0 {actor}   -> Like (JSON)        subject → actors
//! a \0 {actor} \0 {subject}   -> rkey               actor → subjects
//! r \0 {actor} \0 {rkey}      -> subject            resolves stream deletes
//! c \0 {subject}              -> u64                live like count
//! ```
//!
//! A like is keyed by `(actor, subject)`; the record key is only an
//! attribute, so a second like record for the same pair replaces the first.

use brewlog_core::record::LIKE_COLLECTION;
use brewlog_core::ResourceUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::notifications::{NewNotification, NotificationKind};
use super::{DerivedIndex, PendingWrite};
use crate::error::Result;
use crate::store::{Namespace, key};

/// A live like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Like {
    pub actor: String,
    pub rkey: String,
    pub subject: ResourceUri,
    pub created_at: DateTime<Utc>,
}

impl Like {
    pub fn uri(&self) -> ResourceUri {
        ResourceUri::new(&self.actor, LIKE_COLLECTION, &self.rkey)
    }
}

fn entry_key(subject: &str, actor: &str) -> Vec<u8> {
    key(&["s", subject, actor])
}

fn actor_key(actor: &str, subject: &str) -> Vec<u8> {
    key(&["a", actor, subject])
}

fn rkey_key(actor: &str, rkey: &str) -> Vec<u8> {
    key(&["r", actor, rkey])
}

fn count_key(subject: &str) -> Vec<u8> {
    key(&["c", subject])
}

impl DerivedIndex {
    /// Number of actors currently liking `subject`.
    pub fn get_like_count(&self, subject: &ResourceUri) -> Result<u64> {
        self.store
            .get_u64(Namespace::Likes, &count_key(&subject.to_string()))
    }

    /// Whether `actor` currently likes `subject`.
    pub fn has_user_liked(&self, actor: &str, subject: &ResourceUri) -> Result<bool> {
        self.store
            .contains(Namespace::Likes, &actor_key(actor, &subject.to_string()))
    }

    /// The live like by `actor` on `subject`, if any.
    pub fn get_like(&self, actor: &str, subject: &ResourceUri) -> Result<Option<Like>> {
        self.store
            .get_json(Namespace::Likes, &entry_key(&subject.to_string(), actor))
    }

    /// Record a like from the interactive path.
    pub fn upsert_like(&self, actor: &str, rkey: &str, subject: &ResourceUri) -> Result<()> {
        self.put_like(actor, rkey, subject, Utc::now())?;
        Ok(())
    }

    /// Remove `actor`'s like on `subject`. Removing a missing like is a no-op.
    pub fn delete_like(&self, actor: &str, subject: &ResourceUri) -> Result<()> {
        let _guard = self.locks.likes.lock();
        let Some(like) = self.get_like(actor, subject)? else {
            return Ok(());
        };
        let mut pending = PendingWrite::default();
        self.stage_like_removal(&mut pending, &like)?;
        self.commit(pending)?;
        Ok(())
    }

    /// Remove a like identified by its record key (stream deletes carry no
    /// payload). Returns the subject that was unliked.
    pub(crate) fn delete_like_by_rkey(
        &self,
        actor: &str,
        rkey: &str,
    ) -> Result<Option<ResourceUri>> {
        let _guard = self.locks.likes.lock();
        let Some(subject) = self.subject_for_rkey(actor, rkey)? else {
            return Ok(None);
        };
        let Some(like) = self.get_like(actor, &subject)? else {
            return Ok(None);
        };
        let mut pending = PendingWrite::default();
        self.stage_like_removal(&mut pending, &like)?;
        self.commit(pending)?;
        Ok(Some(subject))
    }

    /// Upsert by `(actor, subject)`. Returns `true` when a new like was
    /// created (and the subject owner notified).
    pub(crate) fn put_like(
        &self,
        actor: &str,
        rkey: &str,
        subject: &ResourceUri,
        created_at: DateTime<Utc>,
    ) -> Result<bool> {
        let _guard = self.locks.likes.lock();
        let subject_str = subject.to_string();
        let mut pending = PendingWrite::default();

        // The same record key previously pointed at another subject (an
        // update that retargeted the like): drop that like first.
        if let Some(previous) = self.subject_for_rkey(actor, rkey)?
            && previous != *subject
            && let Some(stale) = self.get_like(actor, &previous)?
            && stale.rkey == rkey
        {
            self.stage_like_removal(&mut pending, &stale)?;
        }

        let existing = self.get_like(actor, subject)?;
        if let Some(existing) = &existing {
            if existing.rkey == rkey {
                if !pending.batch.is_empty() {
                    self.commit(pending)?;
                }
                return Ok(false);
            }
            // Second like record for the same pair: replace, count unchanged.
            debug!(actor, subject = %subject, old = %existing.rkey, new = rkey, "replacing like");
            pending
                .batch
                .delete(Namespace::Likes, rkey_key(actor, &existing.rkey));
        }

        let like = Like {
            actor: actor.to_string(),
            rkey: rkey.to_string(),
            subject: subject.clone(),
            created_at,
        };
        pending
            .batch
            .put_json(Namespace::Likes, entry_key(&subject_str, actor), &like)?;
        pending
            .batch
            .put(Namespace::Likes, actor_key(actor, &subject_str), rkey.as_bytes().to_vec());
        pending.batch.put(
            Namespace::Likes,
            rkey_key(actor, rkey),
            subject_str.clone().into_bytes(),
        );
        pending.author = Some((actor.to_string(), created_at));

        let created = existing.is_none();
        if created {
            let count = self.get_like_count(subject)? + 1;
            pending
                .batch
                .put_u64(Namespace::Likes, count_key(&subject_str), count);
            pending.notifications.push(NewNotification {
                recipient: subject.owner().to_string(),
                actor: actor.to_string(),
                kind: NotificationKind::Like,
                subject: subject.clone(),
                source: like.uri(),
                created_at,
            });
        }

        self.commit(pending)?;
        if created {
            metrics::counter!("index_likes_total").increment(1);
        }
        Ok(created)
    }

    fn subject_for_rkey(&self, actor: &str, rkey: &str) -> Result<Option<ResourceUri>> {
        let Some(raw) = self.store.get(Namespace::Likes, &rkey_key(actor, rkey))? else {
            return Ok(None);
        };
        let subject = ResourceUri::parse(&String::from_utf8_lossy(&raw))?;
        Ok(Some(subject))
    }

    fn stage_like_removal(&self, pending: &mut PendingWrite, like: &Like) -> Result<()> {
        let subject = like.subject.to_string();
        let batch = &mut pending.batch;
        batch.delete(Namespace::Likes, entry_key(&subject, &like.actor));
        batch.delete(Namespace::Likes, actor_key(&like.actor, &subject));
        batch.delete(Namespace::Likes, rkey_key(&like.actor, &like.rkey));

        let count = self.get_like_count(&like.subject)?.saturating_sub(1);
        if count == 0 {
            batch.delete(Namespace::Likes, count_key(&subject));
        } else {
            batch.put_u64(Namespace::Likes, count_key(&subject), count);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;

    #[test]
    fn test_like_count_example() {
        let h = harness();
        let s = brew_uri("did:plc:owner", "s");

        h.index.upsert_like("did:plc:a", "la", &s).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 1);
        assert!(h.index.has_user_liked("did:plc:a", &s).unwrap());

        h.index.upsert_like("did:plc:b", "lb", &s).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 2);

        h.index.delete_like("did:plc:a", &s).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 1);
        assert!(!h.index.has_user_liked("did:plc:a", &s).unwrap());
        assert!(h.index.has_user_liked("did:plc:b", &s).unwrap());
    }

    #[test]
    fn test_second_like_record_replaces_first() {
        let h = harness();
        let s = brew_uri("did:plc:owner", "s");

        h.index.apply(&like_event(1, "did:plc:a", "l1", &s)).unwrap();
        h.index.apply(&like_event(2, "did:plc:a", "l2", &s)).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 1);
        assert_eq!(h.index.get_like("did:plc:a", &s).unwrap().unwrap().rkey, "l2");

        // Deleting the replaced record key finds nothing.
        h.index.apply(&unlike_event(3, "did:plc:a", "l1")).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 1);

        h.index.apply(&unlike_event(4, "did:plc:a", "l2")).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 0);
        assert!(!h.index.has_user_liked("did:plc:a", &s).unwrap());
    }

    #[test]
    fn test_delete_missing_like_is_noop() {
        let h = harness();
        let s = brew_uri("did:plc:owner", "s");
        h.index.delete_like("did:plc:a", &s).unwrap();
        h.index.apply(&unlike_event(1, "did:plc:a", "nope")).unwrap();
        assert_eq!(h.index.get_like_count(&s).unwrap(), 0);
    }

    #[test]
    fn test_interleaved_actors_track_live_likes() {
        let h = harness();
        let s = brew_uri("did:plc:owner", "s");
        let actors = ["did:plc:a", "did:plc:b", "did:plc:c", "did:plc:d"];

        let mut seq = 0;
        for (i, actor) in actors.iter().enumerate() {
            seq += 1;
            h.index
                .apply(&like_event(seq, actor, &format!("l{i}"), &s))
                .unwrap();
        }
        // b and d unlike; c likes again with a fresh record key.
        seq += 1;
        h.index.apply(&unlike_event(seq, "did:plc:b", "l1")).unwrap();
        seq += 1;
        h.index.apply(&like_event(seq, "did:plc:c", "l9", &s)).unwrap();
        seq += 1;
        h.index.apply(&unlike_event(seq, "did:plc:d", "l3")).unwrap();

        assert_eq!(h.index.get_like_count(&s).unwrap(), 2);
        for (actor, live) in [
            ("did:plc:a", true),
            ("did:plc:b", false),
            ("did:plc:c", true),
            ("did:plc:d", false),
        ] {
            assert_eq!(h.index.has_user_liked(actor, &s).unwrap(), live, "{actor}");
        }
    }

    #[test]
    fn test_like_notifies_owner_but_not_self() {
        let h = harness();
        let s = brew_uri("did:plc:owner", "s");

        h.index.upsert_like("did:plc:owner", "self", &s).unwrap();
        assert!(h.index.get_notifications("did:plc:owner", 10, None).unwrap().items.is_empty());

        h.index.upsert_like("did:plc:a", "la", &s).unwrap();
        let page = h.index.get_notifications("did:plc:owner", 10, None).unwrap();
        assert_eq!(page.items.len(), 1);
        assert_eq!(page.items[0].actor, "did:plc:a");
    }

    #[test]
    fn test_relike_after_unlike_does_not_renotify() {
        let h = harness();
        let s = brew_uri("did:plc:owner", "s");
        h.index.apply(&like_event(1, "did:plc:a", "l1", &s)).unwrap();
        h.index.apply(&unlike_event(2, "did:plc:a", "l1")).unwrap();
        h.index.apply(&like_event(3, "did:plc:a", "l1", &s)).unwrap();

        assert_eq!(h.index.get_like_count(&s).unwrap(), 1);
        let page = h.index.get_notifications("did:plc:owner", 10, None).unwrap();
        assert_eq!(page.items.len(), 1);
    }
}
