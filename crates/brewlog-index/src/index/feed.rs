//! Community feed queries.
//!
//! Recent feeds walk the creation-time index newest first. Popular feeds
//! score every record created up to the first page's instant, freeze the
//! resulting order as a ranking, and serve later pages by position in that
//! ranking. Likes and comments arriving between pages change the counts
//! shown but never the order, so no record is skipped or repeated.
//!
//! Cursors are opaque strings:
//!
//! ```text
//! r:{created_us}:{uri}         recent
//! p:{ranking_id}:{offset}      popular
//! ```
//!
//! A popular cursor whose ranking has been evicted yields an empty page.

use std::cmp::Ordering;
use std::sync::Arc;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::time::Instant;

use brewlog_core::{RecordKind, ResourceUri};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::records::{CachedRecord, entry_key, time_key};
use super::{DerivedIndex, micros};
use crate::error::Result;
use crate::store::{Namespace, prefix, split_key};

pub const DEFAULT_FEED_LIMIT: usize = 20;
pub const MAX_FEED_LIMIT: usize = 100;

const SCAN_CHUNK: usize = 256;
const PUBLIC_FEED_KEY: &str = "public";

/// Ranks records for `sort=popular`.
pub trait PopularityScorer: Send + Sync {
    /// Higher scores rank first. `age` is measured from the page's pinned
    /// `as_of` instant and is never negative.
    fn score(&self, likes: u64, comments: u64, age: Duration) -> f64;
}

/// `(likes + 0.5 * comments + 1) / (age_hours + 2) ^ 1.5`
#[derive(Debug, Clone, Copy, Default)]
pub struct DecayScorer;

impl PopularityScorer for DecayScorer {
    fn score(&self, likes: u64, comments: u64, age: Duration) -> f64 {
        let age_hours = age.num_seconds().max(0) as f64 / 3600.0;
        let engagement = likes as f64 + 0.5 * comments as f64 + 1.0;
        engagement / (age_hours + 2.0).powf(1.5)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum FeedSort {
    #[default]
    Recent,
    Popular,
}

#[derive(Debug, Clone, Default)]
pub struct FeedQuery {
    /// 0 uses the default page size.
    pub limit: usize,
    pub cursor: Option<String>,
    /// Restrict to one entity kind.
    pub type_filter: Option<RecordKind>,
    pub sort: FeedSort,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedItem {
    pub record: CachedRecord,
    pub like_count: u64,
    pub comment_count: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FeedPage {
    pub items: Vec<FeedItem>,
    pub next_cursor: Option<String>,
}

/// Frozen popular order for one pagination session.
pub(crate) struct Ranking {
    type_filter: Option<RecordKind>,
    uris: Vec<ResourceUri>,
}

enum Cursor {
    Recent { created_us: u64, uri: String },
    Popular { ranking: u64, offset: usize },
}

impl Cursor {
    fn parse(raw: &str) -> Option<Self> {
        let (tag, rest) = raw.split_once(':')?;
        match tag {
            "r" => {
                let (created, uri) = rest.split_once(':')?;
                Some(Self::Recent {
                    created_us: created.parse().ok()?,
                    uri: uri.to_string(),
                })
            }
            "p" => {
                let (ranking, offset) = rest.split_once(':')?;
                Some(Self::Popular {
                    ranking: ranking.parse().ok()?,
                    offset: offset.parse().ok()?,
                })
            }
            _ => None,
        }
    }

    fn encode(&self) -> String {
        match self {
            Self::Recent { created_us, uri } => format!("r:{created_us}:{uri}"),
            Self::Popular { ranking, offset } => format!("p:{ranking}:{offset}"),
        }
    }
}

fn clamp_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_FEED_LIMIT,
        n => n.min(MAX_FEED_LIMIT),
    }
}

fn from_micros(us: u64) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(us as i64).unwrap_or_default()
}

impl DerivedIndex {
    /// Newest visible entity records.
    pub fn get_recent_records(&self, limit: usize) -> Result<Vec<FeedItem>> {
        let (items, _) = self.scan_recent(limit, None, None)?;
        Ok(items)
    }

    /// Snapshot of the recent feed for anonymous traffic, rebuilt at most
    /// once per TTL.
    pub async fn get_cached_public_feed(&self) -> Result<Arc<Vec<FeedItem>>> {
        if let Some(feed) = self.public_feed.get(PUBLIC_FEED_KEY).await {
            return Ok(feed);
        }
        let feed = Arc::new(self.get_recent_records(self.config.public_feed_size)?);
        self.public_feed
            .insert(PUBLIC_FEED_KEY, Arc::clone(&feed))
            .await;
        Ok(feed)
    }

    /// Filtered, sorted and paginated feed.
    ///
    /// A cursor from a different sort order, or one that cannot be parsed,
    /// yields an empty page.
    pub fn get_feed_with_query(&self, query: &FeedQuery) -> Result<FeedPage> {
        let started = Instant::now();
        let cursor = match query.cursor.as_deref() {
            Some(raw) => match Cursor::parse(raw) {
                Some(c) => Some(c),
                None => return Ok(FeedPage::default()),
            },
            None => None,
        };
        let limit = clamp_limit(query.limit);

        let page = match (query.sort, cursor) {
            (FeedSort::Recent, None) => {
                let (items, next) = self.scan_recent(limit, None, query.type_filter)?;
                FeedPage {
                    items,
                    next_cursor: next.map(|c| c.encode()),
                }
            }
            (FeedSort::Recent, Some(Cursor::Recent { created_us, uri })) => {
                let before = time_key(from_micros(created_us), &uri);
                let (items, next) = self.scan_recent(limit, Some(before), query.type_filter)?;
                FeedPage {
                    items,
                    next_cursor: next.map(|c| c.encode()),
                }
            }
            (FeedSort::Popular, None) => {
                self.first_popular_page(limit, Utc::now(), query.type_filter)?
            }
            (FeedSort::Popular, Some(Cursor::Popular { ranking, offset })) => {
                self.next_popular_page(limit, ranking, offset, query.type_filter)?
            }
            _ => FeedPage::default(),
        };

        metrics::histogram!("index_feed_query_duration_seconds")
            .record(started.elapsed().as_secs_f64());
        Ok(page)
    }

    /// [`get_feed_with_query`](Self::get_feed_with_query) on the blocking
    /// pool. A first popular page scans every record.
    pub async fn query_feed(self: &Arc<Self>, query: FeedQuery) -> Result<FeedPage> {
        let index = Arc::clone(self);
        tokio::task::spawn_blocking(move || index.get_feed_with_query(&query)).await?
    }

    /// Walk the time index newest first from `before` (exclusive),
    /// collecting up to `limit` visible records.
    fn scan_recent(
        &self,
        limit: usize,
        before: Option<Vec<u8>>,
        type_filter: Option<RecordKind>,
    ) -> Result<(Vec<FeedItem>, Option<Cursor>)> {
        let index_prefix = prefix(&["t"]);
        let mut items = Vec::with_capacity(limit.min(SCAN_CHUNK));
        let mut before = before;
        let mut more = false;

        'scan: loop {
            let rows = self.store.scan_prefix_rev(
                Namespace::Records,
                &index_prefix,
                before.as_deref(),
                SCAN_CHUNK,
            )?;
            let exhausted = rows.len() < SCAN_CHUNK;

            for (raw_key, _) in rows {
                before = Some(raw_key.clone());
                let Some(record) = self.visible_record(&raw_key, type_filter)? else {
                    continue;
                };
                if items.len() == limit {
                    more = true;
                    break 'scan;
                }
                items.push(self.feed_item(record)?);
            }
            if exhausted {
                break;
            }
        }

        let next = if more {
            items.last().map(|item: &FeedItem| Cursor::Recent {
                created_us: micros(item.record.created_at),
                uri: item.record.uri.to_string(),
            })
        } else {
            None
        };
        Ok((items, next))
    }

    /// Rank every visible record created up to `as_of`, keep the order for
    /// later pages and return the head of it.
    fn first_popular_page(
        &self,
        limit: usize,
        as_of: DateTime<Utc>,
        type_filter: Option<RecordKind>,
    ) -> Result<FeedPage> {
        let upper = time_key(from_micros(micros(as_of).saturating_add(1)), "");
        let (candidates, _) = self.scan_recent(usize::MAX, Some(upper), type_filter)?;

        let mut ranked: Vec<(f64, String, FeedItem)> = candidates
            .into_iter()
            .map(|item| {
                let age = (as_of - item.record.created_at).max(Duration::zero());
                let score = self
                    .scorer
                    .score(item.like_count, item.comment_count, age);
                (score, item.record.uri.to_string(), item)
            })
            .collect();
        ranked.sort_by(|a, b| rank_order((a.0, a.1.as_str()), (b.0, b.1.as_str())));

        let total = ranked.len();
        let mut items: Vec<FeedItem> = ranked.into_iter().map(|(_, _, item)| item).collect();
        let next_cursor = if total > limit {
            let ranking = self.next_ranking.fetch_add(1, AtomicOrdering::Relaxed);
            let uris = items.iter().map(|item| item.record.uri.clone()).collect();
            self.rankings.insert(
                ranking,
                Arc::new(Ranking {
                    type_filter,
                    uris,
                }),
            );
            Some(
                Cursor::Popular {
                    ranking,
                    offset: limit,
                }
                .encode(),
            )
        } else {
            None
        };
        items.truncate(limit);

        Ok(FeedPage { items, next_cursor })
    }

    /// Continue a frozen ranking from `offset`, skipping entries that were
    /// deleted or hidden since it was built.
    fn next_popular_page(
        &self,
        limit: usize,
        ranking_id: u64,
        offset: usize,
        type_filter: Option<RecordKind>,
    ) -> Result<FeedPage> {
        let Some(ranking) = self.rankings.get(&ranking_id) else {
            return Ok(FeedPage::default());
        };
        if ranking.type_filter != type_filter {
            return Ok(FeedPage::default());
        }

        let mut items = Vec::with_capacity(limit);
        let mut position = offset;
        while position < ranking.uris.len() && items.len() < limit {
            let uri = &ranking.uris[position];
            position += 1;
            let Some(record) = self.cached_record(uri)? else {
                continue;
            };
            if self.moderation.is_record_hidden(uri) {
                continue;
            }
            items.push(self.feed_item(record)?);
        }

        let next_cursor = (position < ranking.uris.len()).then(|| {
            Cursor::Popular {
                ranking: ranking_id,
                offset: position,
            }
            .encode()
        });
        Ok(FeedPage { items, next_cursor })
    }

    fn visible_record(
        &self,
        time_index_key: &[u8],
        type_filter: Option<RecordKind>,
    ) -> Result<Option<CachedRecord>> {
        let parts = split_key(time_index_key);
        let Some(uri) = parts.get(2) else {
            return Ok(None);
        };
        let Some(record) = self
            .store
            .get_json::<CachedRecord>(Namespace::Records, &entry_key(uri))?
        else {
            return Ok(None);
        };
        if type_filter.is_some_and(|kind| kind != record.kind) {
            return Ok(None);
        }
        if self.moderation.is_record_hidden(&record.uri) {
            return Ok(None);
        }
        Ok(Some(record))
    }

    fn feed_item(&self, record: CachedRecord) -> Result<FeedItem> {
        let like_count = self.get_like_count(&record.uri)?;
        let comment_count = self.get_comment_count(&record.uri)?;
        Ok(FeedItem {
            record,
            like_count,
            comment_count,
        })
    }

    /// Whether `subject` would currently appear in feeds.
    pub fn is_feed_visible(&self, subject: &ResourceUri) -> Result<bool> {
        Ok(self.cached_record(subject)?.is_some() && !self.moderation.is_record_hidden(subject))
    }
}

/// Score descending, then uri ascending. `Less` means "ranks earlier".
fn rank_order(a: (f64, &str), b: (f64, &str)) -> Ordering {
    b.0.total_cmp(&a.0).then_with(|| a.1.cmp(b.1))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use std::collections::HashSet;

    fn uris(items: &[FeedItem]) -> Vec<String> {
        items.iter().map(|i| i.record.uri.rkey().to_string()).collect()
    }

    #[test]
    fn test_decay_scorer() {
        let scorer = DecayScorer;
        let fresh = scorer.score(0, 0, Duration::zero());
        assert!((fresh - 1.0 / 2f64.powf(1.5)).abs() < 1e-12);

        // More engagement ranks higher at equal age; age decays.
        assert!(scorer.score(5, 0, Duration::hours(1)) > scorer.score(1, 0, Duration::hours(1)));
        assert!(scorer.score(5, 0, Duration::hours(1)) > scorer.score(5, 0, Duration::hours(48)));
        // A comment is worth half a like.
        let a = scorer.score(1, 0, Duration::hours(3));
        let b = scorer.score(0, 2, Duration::hours(3));
        assert!((a - b).abs() < 1e-12);
        // Negative ages are clamped.
        assert_eq!(
            scorer.score(1, 1, Duration::hours(-5)),
            scorer.score(1, 1, Duration::zero())
        );
    }

    #[test]
    fn test_recent_feed_newest_first_with_counts() {
        let h = harness();
        h.index.apply(&brew_event(1, "did:plc:a", "old", 0)).unwrap();
        h.index.apply(&bean_event(2, "did:plc:b", "mid", 60)).unwrap();
        h.index.apply(&brew_event(3, "did:plc:c", "new", 120)).unwrap();
        let old = brew_uri("did:plc:a", "old");
        h.index.upsert_like("did:plc:z", "l", &old).unwrap();

        let feed = h.index.get_recent_records(10).unwrap();
        assert_eq!(uris(&feed), vec!["new", "mid", "old"]);
        assert_eq!(feed[2].like_count, 1);
        assert_eq!(feed[0].like_count, 0);
    }

    #[test]
    fn test_hidden_records_never_in_feeds() {
        let h = harness();
        h.index.apply(&brew_event(1, "did:plc:a", "keep", 0)).unwrap();
        h.index.apply(&brew_event(2, "did:plc:a", "gone", 10)).unwrap();
        let gone = brew_uri("did:plc:a", "gone");
        h.moderation.hide(&gone);

        assert_eq!(uris(&h.index.get_recent_records(10).unwrap()), vec!["keep"]);
        for sort in [FeedSort::Recent, FeedSort::Popular] {
            let page = h
                .index
                .get_feed_with_query(&FeedQuery {
                    sort,
                    ..Default::default()
                })
                .unwrap();
            assert_eq!(uris(&page.items), vec!["keep"]);
        }
        assert!(!h.index.is_feed_visible(&gone).unwrap());
    }

    #[test]
    fn test_type_filter() {
        let h = harness();
        h.index.apply(&brew_event(1, "did:plc:a", "brew1", 0)).unwrap();
        h.index.apply(&bean_event(2, "did:plc:a", "bean1", 10)).unwrap();

        let page = h
            .index
            .get_feed_with_query(&FeedQuery {
                type_filter: Some(RecordKind::Bean),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(uris(&page.items), vec!["bean1"]);
    }

    #[test]
    fn test_recent_pagination_stable_under_writes() {
        let h = harness();
        for i in 0..5 {
            h.index
                .apply(&brew_event(i, "did:plc:a", &format!("b{i}"), i as i64 * 10))
                .unwrap();
        }

        let mut query = FeedQuery {
            limit: 2,
            ..Default::default()
        };
        let first = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(uris(&first.items), vec!["b4", "b3"]);

        // A newer record arrives between pages.
        h.index.apply(&brew_event(9, "did:plc:a", "late", 1000)).unwrap();

        query.cursor = first.next_cursor.clone();
        let second = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(uris(&second.items), vec!["b2", "b1"]);

        query.cursor = second.next_cursor.clone();
        let third = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(uris(&third.items), vec!["b0"]);
        assert!(third.next_cursor.is_none());
    }

    #[test]
    fn test_popular_ranks_by_engagement_and_pages_once() {
        let h = harness();
        for i in 0..4 {
            h.index
                .apply(&brew_event(i, "did:plc:a", &format!("b{i}"), i as i64))
                .unwrap();
        }
        // b1 gets the most likes, b3 one like.
        let b1 = brew_uri("did:plc:a", "b1");
        let b3 = brew_uri("did:plc:a", "b3");
        for fan in ["did:plc:x", "did:plc:y", "did:plc:z"] {
            h.index.upsert_like(fan, "l", &b1).unwrap();
        }
        h.index.upsert_like("did:plc:x", "l", &b3).unwrap();

        let mut query = FeedQuery {
            limit: 2,
            sort: FeedSort::Popular,
            ..Default::default()
        };
        let first = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(uris(&first.items), vec!["b1", "b3"]);

        // Created after the pinned instant: must not enter the ranking.
        h.index.apply(&brew_event(7, "did:plc:a", "fresh", 400_000_000)).unwrap();

        query.cursor = first.next_cursor.clone();
        let second = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(second.items.len(), 2);
        assert!(second.next_cursor.is_none());

        let all: HashSet<String> = uris(&first.items)
            .into_iter()
            .chain(uris(&second.items))
            .collect();
        assert_eq!(all.len(), 4);
        assert!(!all.contains("fresh"));
    }

    #[test]
    fn test_bad_or_mismatched_cursor_is_empty_page() {
        let h = harness();
        h.index.apply(&brew_event(1, "did:plc:a", "b", 0)).unwrap();

        let page = h
            .index
            .get_feed_with_query(&FeedQuery {
                cursor: Some("zzz".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(page.items.is_empty());

        let popular_cursor = Cursor::Popular {
            ranking: 1,
            offset: 2,
        }
        .encode();
        let page = h
            .index
            .get_feed_with_query(&FeedQuery {
                cursor: Some(popular_cursor),
                sort: FeedSort::Recent,
                ..Default::default()
            })
            .unwrap();
        assert!(page.items.is_empty());
    }

    #[test]
    fn test_cursor_round_trip() {
        let raw = Cursor::Popular {
            ranking: 42,
            offset: 20,
        }
        .encode();
        assert_eq!(raw, "p:42:20");
        match Cursor::parse(&raw) {
            Some(Cursor::Popular { ranking, offset }) => {
                assert_eq!(ranking, 42);
                assert_eq!(offset, 20);
            }
            _ => panic!("expected popular cursor"),
        }
        assert!(Cursor::parse("p:42").is_none());
        assert!(Cursor::parse("p:x:1").is_none());
    }

    fn popular_fixture() -> Harness {
        let h = harness();
        for i in 0..4 {
            h.index
                .apply(&brew_event(i, "did:plc:a", &format!("b{i}"), i as i64))
                .unwrap();
        }
        let b1 = brew_uri("did:plc:a", "b1");
        let b3 = brew_uri("did:plc:a", "b3");
        for (n, fan) in ["did:plc:x", "did:plc:y", "did:plc:z"].iter().enumerate() {
            h.index.upsert_like(fan, &format!("l1-{n}"), &b1).unwrap();
        }
        h.index.upsert_like("did:plc:x", "l3", &b3).unwrap();
        h
    }

    #[test]
    fn test_popular_pages_ignore_likes_between_pages() {
        let h = popular_fixture();
        let mut query = FeedQuery {
            limit: 2,
            sort: FeedSort::Popular,
            ..Default::default()
        };
        let first = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(uris(&first.items), vec!["b1", "b3"]);

        // An unseen record overtakes everything, a seen one loses its like.
        let b0 = brew_uri("did:plc:a", "b0");
        for n in 0..6 {
            h.index
                .upsert_like(&format!("did:plc:f{n}"), "l0", &b0)
                .unwrap();
        }
        h.index.delete_like_by_rkey("did:plc:x", "l3").unwrap();

        query.cursor = first.next_cursor.clone();
        let second = h.index.get_feed_with_query(&query).unwrap();
        assert!(second.next_cursor.is_none());

        let mut seen = uris(&first.items);
        seen.extend(uris(&second.items));
        let distinct: HashSet<&String> = seen.iter().collect();
        assert_eq!(seen.len(), 4);
        assert_eq!(distinct.len(), 4);

        // Counts are live even though the order is frozen.
        let b0_item = second
            .items
            .iter()
            .find(|i| i.record.uri == b0)
            .unwrap();
        assert_eq!(b0_item.like_count, 6);
    }

    #[test]
    fn test_popular_page_skips_records_hidden_since_ranking() {
        let h = popular_fixture();
        let mut query = FeedQuery {
            limit: 1,
            sort: FeedSort::Popular,
            ..Default::default()
        };
        let first = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(uris(&first.items), vec!["b1"]);

        h.moderation.hide(&brew_uri("did:plc:a", "b3"));

        query.cursor = first.next_cursor.clone();
        let second = h.index.get_feed_with_query(&query).unwrap();
        assert_eq!(second.items.len(), 1);
        assert_ne!(uris(&second.items), vec!["b3"]);
    }

    #[test]
    fn test_popular_cursor_for_unknown_ranking_or_filter_is_empty() {
        let h = popular_fixture();
        let first = h
            .index
            .get_feed_with_query(&FeedQuery {
                limit: 2,
                sort: FeedSort::Popular,
                ..Default::default()
            })
            .unwrap();

        let filtered = h
            .index
            .get_feed_with_query(&FeedQuery {
                limit: 2,
                sort: FeedSort::Popular,
                cursor: first.next_cursor.clone(),
                type_filter: Some(RecordKind::Bean),
            })
            .unwrap();
        assert!(filtered.items.is_empty());

        let evicted = h
            .index
            .get_feed_with_query(&FeedQuery {
                limit: 2,
                sort: FeedSort::Popular,
                cursor: Some(Cursor::Popular { ranking: 7, offset: 2 }.encode()),
                ..Default::default()
            })
            .unwrap();
        assert!(evicted.items.is_empty());
        assert!(evicted.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_query_feed_pages_popular_off_runtime() {
        let h = popular_fixture();
        let index = Arc::new(h.index);
        let first = index
            .query_feed(FeedQuery {
                limit: 3,
                sort: FeedSort::Popular,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(first.items.len(), 3);
        let second = index
            .query_feed(FeedQuery {
                limit: 3,
                sort: FeedSort::Popular,
                cursor: first.next_cursor,
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(second.items.len(), 1);
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_public_feed_is_a_snapshot() {
        let h = harness();
        h.index.apply(&brew_event(1, "did:plc:a", "b1", 0)).unwrap();
        let first = h.index.get_cached_public_feed().await.unwrap();
        assert_eq!(first.len(), 1);

        // Within the TTL the snapshot is served unchanged.
        h.index.apply(&brew_event(2, "did:plc:a", "b2", 10)).unwrap();
        let second = h.index.get_cached_public_feed().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(h.index.get_recent_records(10).unwrap().len(), 2);
    }
}
