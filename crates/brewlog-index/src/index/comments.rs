//! Comments and thread reconstruction.
//!
//! Keys in the `comments` namespace:
//!
//! ```text
//! e \0 {uri}                                   -> Comment (JSON)
//! s \0 {subject} \0 {created_us:020} \0 {uri}  -> ()      per-subject order
//! c \0 {subject}                               -> u64     comment count
//! ```
//!
//! Parent links come from untrusted records, so threading never follows
//! them blindly: a link counts only if the parent exists under the same
//! subject, is not the comment itself and does not postdate it. Depth is
//! capped and every comment is visited at most once.

use std::collections::{HashMap, HashSet};

use brewlog_core::{CommentRecord, ResourceUri};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::notifications::{NewNotification, NotificationKind};
use super::{DerivedIndex, PendingWrite, micros};
use crate::error::Result;
use crate::store::{Namespace, key, prefix, sortable, split_key};

/// Replies nested deeper than this are shown at this depth.
pub const MAX_THREAD_DEPTH: usize = 8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    pub uri: ResourceUri,
    pub author: String,
    pub subject: ResourceUri,
    #[serde(default)]
    pub parent: Option<ResourceUri>,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// A comment placed in its thread.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadedComment {
    pub comment: Comment,
    /// 0 for top-level comments.
    pub depth: usize,
    /// Only ever `true` for moderator viewers.
    pub hidden: bool,
}

fn entry_key(uri: &str) -> Vec<u8> {
    key(&["e", uri])
}

fn order_key(comment: &Comment) -> Vec<u8> {
    key(&[
        "s",
        &comment.subject.to_string(),
        &sortable(micros(comment.created_at)),
        &comment.uri.to_string(),
    ])
}

fn count_key(subject: &str) -> Vec<u8> {
    key(&["c", subject])
}

impl DerivedIndex {
    pub fn get_comment_count(&self, subject: &ResourceUri) -> Result<u64> {
        self.store
            .get_u64(Namespace::Comments, &count_key(&subject.to_string()))
    }

    pub fn get_comment(&self, uri: &ResourceUri) -> Result<Option<Comment>> {
        self.store
            .get_json(Namespace::Comments, &entry_key(&uri.to_string()))
    }

    /// Insert or update a comment. Returns `true` if it was new.
    pub fn upsert_comment(&self, uri: &ResourceUri, record: CommentRecord) -> Result<bool> {
        let comment = Comment {
            uri: uri.clone(),
            author: uri.owner().to_string(),
            subject: record.subject.uri,
            parent: record.parent.map(|p| p.uri),
            text: record.text,
            created_at: record.created_at,
        };

        let _guard = self.locks.comments.lock();
        let existing = self.get_comment(uri)?;
        if existing.as_ref() == Some(&comment) {
            return Ok(false);
        }

        let mut pending = PendingWrite::default();
        let subject = comment.subject.to_string();
        match &existing {
            Some(old) => {
                debug!(uri = %uri, "updating comment");
                pending.batch.delete(Namespace::Comments, order_key(old));
                if old.subject != comment.subject {
                    self.stage_count_delta(&mut pending, &old.subject.to_string(), -1)?;
                    self.stage_count_delta(&mut pending, &subject, 1)?;
                }
            }
            None => {
                self.stage_count_delta(&mut pending, &subject, 1)?;
                pending.notifications = self.comment_notifications(&comment)?;
            }
        }

        pending
            .batch
            .put_json(Namespace::Comments, entry_key(&uri.to_string()), &comment)?;
        pending
            .batch
            .put(Namespace::Comments, order_key(&comment), Vec::new());
        pending.author = Some((comment.author.clone(), comment.created_at));

        let created = existing.is_none();
        self.commit(pending)?;
        if created {
            metrics::counter!("index_comments_total").increment(1);
        }
        Ok(created)
    }

    /// Remove a comment. Replies keep their parent link and surface as top
    /// level once the parent is gone.
    pub fn delete_comment(&self, uri: &ResourceUri) -> Result<bool> {
        let _guard = self.locks.comments.lock();
        let Some(comment) = self.get_comment(uri)? else {
            return Ok(false);
        };

        let mut pending = PendingWrite::default();
        pending
            .batch
            .delete(Namespace::Comments, entry_key(&uri.to_string()));
        pending.batch.delete(Namespace::Comments, order_key(&comment));
        self.stage_count_delta(&mut pending, &comment.subject.to_string(), -1)?;
        self.commit(pending)?;
        Ok(true)
    }

    /// Comments on `subject` in thread order: oldest first within each
    /// level, each reply directly after its parent's subtree position.
    ///
    /// Hidden comments and their replies are left out unless `viewer` is a
    /// moderator. `limit == 0` returns everything.
    pub fn get_threaded_comments_for_subject(
        &self,
        subject: &ResourceUri,
        limit: usize,
        viewer: Option<&str>,
    ) -> Result<Vec<ThreadedComment>> {
        let rows = self.store.scan_prefix(
            Namespace::Comments,
            &prefix(&["s", &subject.to_string()]),
            None,
            usize::MAX,
        )?;

        let mut comments = Vec::with_capacity(rows.len());
        for (raw_key, _) in rows {
            let parts = split_key(&raw_key);
            let Some(uri) = parts.get(3) else { continue };
            if let Some(comment) = self
                .store
                .get_json::<Comment>(Namespace::Comments, &entry_key(uri))?
            {
                comments.push(comment);
            }
        }

        let show_hidden = viewer.is_some_and(|v| self.moderation.is_moderator(v));
        Ok(build_thread(
            comments,
            |uri| self.moderation.is_record_hidden(uri),
            show_hidden,
            limit,
        ))
    }

    fn stage_count_delta(&self, pending: &mut PendingWrite, subject: &str, delta: i64) -> Result<()> {
        let current = self.store.get_u64(Namespace::Comments, &count_key(subject))?;
        let next = current.saturating_add_signed(delta);
        if next == 0 {
            pending.batch.delete(Namespace::Comments, count_key(subject));
        } else {
            pending.batch.put_u64(Namespace::Comments, count_key(subject), next);
        }
        Ok(())
    }

    /// Subject owner gets `Comment`; the parent comment's author gets
    /// `Reply`. Someone who is both gets only the reply.
    fn comment_notifications(&self, comment: &Comment) -> Result<Vec<NewNotification>> {
        let mut notes = Vec::with_capacity(2);
        let reply_to = match &comment.parent {
            Some(parent) => self.get_comment(parent)?.map(|p| p.author),
            None => None,
        };

        if let Some(parent_author) = &reply_to {
            notes.push(NewNotification {
                recipient: parent_author.clone(),
                actor: comment.author.clone(),
                kind: NotificationKind::Reply,
                subject: comment.subject.clone(),
                source: comment.uri.clone(),
                created_at: comment.created_at,
            });
        }

        let owner = comment.subject.owner();
        if reply_to.as_deref() != Some(owner) {
            notes.push(NewNotification {
                recipient: owner.to_string(),
                actor: comment.author.clone(),
                kind: NotificationKind::Comment,
                subject: comment.subject.clone(),
                source: comment.uri.clone(),
                created_at: comment.created_at,
            });
        }
        Ok(notes)
    }
}

/// Arrange comments (sorted oldest first) into thread order.
fn build_thread(
    comments: Vec<Comment>,
    is_hidden: impl Fn(&ResourceUri) -> bool,
    show_hidden: bool,
    limit: usize,
) -> Vec<ThreadedComment> {
    let limit = if limit == 0 { usize::MAX } else { limit };
    let index: HashMap<&ResourceUri, usize> =
        comments.iter().enumerate().map(|(i, c)| (&c.uri, i)).collect();

    let parent_of = |i: usize| -> Option<usize> {
        let comment = &comments[i];
        let parent = comment.parent.as_ref()?;
        let p = *index.get(parent)?;
        (p != i && comments[p].created_at <= comment.created_at).then_some(p)
    };

    let mut children: Vec<Vec<usize>> = vec![Vec::new(); comments.len()];
    let mut roots = Vec::new();
    for i in 0..comments.len() {
        match parent_of(i) {
            Some(p) => children[p].push(i),
            None => roots.push(i),
        }
    }

    let mut out = Vec::new();
    let mut visited = HashSet::new();
    let walk = |start: usize, out: &mut Vec<ThreadedComment>, visited: &mut HashSet<usize>| {
        // (node, depth, ancestor hidden)
        let mut stack = vec![(start, 0usize, false)];
        while let Some((i, depth, hidden_above)) = stack.pop() {
            if !visited.insert(i) {
                continue;
            }
            let hidden = hidden_above || is_hidden(&comments[i].uri);
            if (!hidden || show_hidden) && out.len() < limit {
                out.push(ThreadedComment {
                    comment: comments[i].clone(),
                    depth,
                    hidden,
                });
            }
            let child_depth = (depth + 1).min(MAX_THREAD_DEPTH);
            for &child in children[i].iter().rev() {
                stack.push((child, child_depth, hidden));
            }
        }
    };

    for &root in &roots {
        walk(root, &mut out, &mut visited);
    }
    // Equal timestamps can form a parent cycle with no root; surface those
    // comments as top level rather than lose them.
    for i in 0..comments.len() {
        if !visited.contains(&i) {
            walk(i, &mut out, &mut visited);
        }
    }
    out
}
