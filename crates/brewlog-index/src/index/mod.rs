//! Derived index: the materialized, queryable view of the event log.
//!
//! # Locking
//!
//! Readers take no locks; RocksDB point reads and iterators are consistent
//! on their own. Writers take one mutex per logical store around their
//! read-modify-write and commit a single [`StoreBatch`], so every
//! mutation is applied completely or not at all. When a writer needs more
//! than one lock they are always taken in the order
//! content (likes / comments / records) → authors → notifications.
//!
//! No network I/O happens while a lock is held. Cache fills (remote record,
//! profile) fetch first and write back under a short lock.

mod authors;
mod comments;
mod feed;
mod likes;
mod notifications;
mod records;

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Duration;

use brewlog_core::{DomainRecord, RecordKind, ResourceUri, StreamEvent, decode_event};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::sync::Cache as SyncCache;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::trace;

use crate::client::{Profile, RepoClient};
use crate::error::Result;
use crate::store::{Namespace, Store, StoreBatch};

pub use authors::AuthorEntry;
pub use comments::{Comment, MAX_THREAD_DEPTH, ThreadedComment};
pub use feed::{DecayScorer, FeedItem, FeedPage, FeedQuery, FeedSort, PopularityScorer};
pub use likes::Like;
pub use notifications::{Notification, NotificationKind, NotificationPage};
pub use records::CachedRecord;

use feed::Ranking;
use notifications::NewNotification;

/// Moderation state the read path joins against.
///
/// Implemented by the automod engine; checked live at query time.
pub trait ModerationView: Send + Sync {
    fn is_record_hidden(&self, uri: &ResourceUri) -> bool;
    fn is_moderator(&self, did: &str) -> bool;
}

/// A [`ModerationView`] that hides nothing.
pub struct NoModeration;

impl ModerationView for NoModeration {
    fn is_record_hidden(&self, _uri: &ResourceUri) -> bool {
        false
    }

    fn is_moderator(&self, _did: &str) -> bool {
        false
    }
}

/// What [`DerivedIndex::apply`] did with an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A create or update was upserted.
    Applied(RecordKind),
    /// A delete removed (or found nothing to remove for) the record.
    Deleted(RecordKind),
    /// The collection is not one this index understands.
    Skipped,
}

/// Tunables for the index caches.
#[derive(Debug, Clone)]
pub struct IndexConfig {
    /// Number of items held in the anonymous public feed snapshot.
    pub public_feed_size: usize,
    /// How long the public feed snapshot is served before rebuilding.
    pub public_feed_ttl: Duration,
    pub profile_cache_capacity: u64,
    pub profile_ttl: Duration,
    /// Popular-feed rankings kept for cursor pagination.
    pub ranking_capacity: u64,
    /// Idle time after which a popular-feed cursor stops resolving.
    pub ranking_idle: Duration,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            public_feed_size: 50,
            public_feed_ttl: Duration::from_secs(30),
            profile_cache_capacity: 10_000,
            profile_ttl: Duration::from_secs(600),
            ranking_capacity: 256,
            ranking_idle: Duration::from_secs(900),
        }
    }
}

/// Approximate entry counts per namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub likes: u64,
    pub comments: u64,
    pub notifications: u64,
    pub authors: u64,
    pub records: u64,
}

#[derive(Default)]
struct WriteLocks {
    likes: Mutex<()>,
    comments: Mutex<()>,
    records: Mutex<()>,
    authors: Mutex<()>,
    notifications: Mutex<()>,
}

/// Mutations staged by a content handler, committed by [`DerivedIndex::commit`].
#[derive(Default)]
struct PendingWrite {
    batch: StoreBatch,
    /// Author to register on first sighting.
    author: Option<(String, DateTime<Utc>)>,
    notifications: Vec<NewNotification>,
}

/// The derived index.
///
/// Thread-safe: share via `Arc<DerivedIndex>`. Exactly one stream writer and
/// any number of interactive callers may use it concurrently.
pub struct DerivedIndex {
    store: Arc<Store>,
    client: Arc<dyn RepoClient>,
    moderation: Arc<dyn ModerationView>,
    scorer: Arc<dyn PopularityScorer>,
    config: IndexConfig,
    locks: WriteLocks,
    profiles: Cache<String, Profile>,
    public_feed: Cache<&'static str, Arc<Vec<FeedItem>>>,
    rankings: SyncCache<u64, Arc<Ranking>>,
    next_ranking: AtomicU64,
}

impl DerivedIndex {
    pub fn new(
        store: Arc<Store>,
        client: Arc<dyn RepoClient>,
        moderation: Arc<dyn ModerationView>,
        config: IndexConfig,
    ) -> Self {
        let profiles = Cache::builder()
            .max_capacity(config.profile_cache_capacity)
            .time_to_live(config.profile_ttl)
            .build();
        let public_feed = Cache::builder()
            .max_capacity(1)
            .time_to_live(config.public_feed_ttl)
            .build();
        let rankings = SyncCache::builder()
            .max_capacity(config.ranking_capacity)
            .time_to_idle(config.ranking_idle)
            .build();

        Self {
            store,
            client,
            moderation,
            scorer: Arc::new(DecayScorer),
            config,
            locks: WriteLocks::default(),
            profiles,
            public_feed,
            rankings,
            // Seeded from the clock so ids stay unique across restarts.
            next_ranking: AtomicU64::new(micros(Utc::now())),
        }
    }

    /// Replace the popularity scorer used by `sort=popular` feeds.
    pub fn with_scorer(mut self, scorer: Arc<dyn PopularityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    /// Apply one stream event.
    ///
    /// Idempotent: replaying an event leaves the index unchanged.
    ///
    /// # Errors
    ///
    /// [`Error::Decode`](crate::Error::Decode) when the payload is invalid
    /// (permanent, the caller should drop the event); storage errors are
    /// transient.
    pub fn apply(&self, event: &StreamEvent) -> Result<ApplyOutcome> {
        let kind = RecordKind::from_collection(&event.collection);
        if kind == RecordKind::Unknown {
            trace!(collection = %event.collection, "skipping unknown collection");
            return Ok(ApplyOutcome::Skipped);
        }

        let uri = event.uri()?;
        if event.is_delete() {
            match kind {
                RecordKind::Like => {
                    self.delete_like_by_rkey(&event.did, &event.rkey)?;
                }
                RecordKind::Comment => {
                    self.delete_comment(&uri)?;
                }
                _ => {
                    self.delete_record(&uri)?;
                }
            }
            return Ok(ApplyOutcome::Deleted(kind));
        }

        match decode_event(event)? {
            DomainRecord::Like(like) => {
                self.put_like(
                    &event.did,
                    &event.rkey,
                    &like.subject.uri,
                    like.created_at,
                )?;
            }
            DomainRecord::Comment(comment) => {
                self.upsert_comment(&uri, comment)?;
            }
            DomainRecord::Unknown => return Ok(ApplyOutcome::Skipped),
            record => {
                self.upsert_record(event, uri, &record)?;
            }
        }
        Ok(ApplyOutcome::Applied(kind))
    }

    /// Approximate entry counts per namespace.
    pub fn stats(&self) -> Result<IndexStats> {
        Ok(IndexStats {
            likes: self.store.approximate_keys(Namespace::Likes)?,
            comments: self.store.approximate_keys(Namespace::Comments)?,
            notifications: self.store.approximate_keys(Namespace::Notifications)?,
            authors: self.store.approximate_keys(Namespace::Authors)?,
            records: self.store.approximate_keys(Namespace::Records)?,
        })
    }

    /// Commit staged content mutations together with any author
    /// registration and notifications they imply, as one batch.
    ///
    /// Must be called with the caller's content lock held.
    fn commit(&self, pending: PendingWrite) -> Result<usize> {
        let PendingWrite {
            mut batch,
            author,
            notifications,
        } = pending;

        let _authors = author.as_ref().map(|_| self.locks.authors.lock());
        if let Some((did, seen_at)) = &author {
            self.stage_author(&mut batch, did, *seen_at)?;
        }

        let _notifications = (!notifications.is_empty()).then(|| self.locks.notifications.lock());
        let created = self.stage_notifications(&mut batch, notifications)?;

        self.store.write(batch)?;
        Ok(created)
    }
}

/// Microseconds since the epoch, clamped at zero, for sortable keys.
pub(crate) fn micros(ts: DateTime<Utc>) -> u64 {
    ts.timestamp_micros().max(0) as u64
}
