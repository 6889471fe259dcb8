//! Backfill coordinator.
//!
//! Replays an author's full record history through [`DerivedIndex::apply`],
//! the same path the live stream uses. The registry's backfill mark is
//! written only after every listing succeeded and every record was applied,
//! so an interrupted backfill is retried rather than falsely marked done.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use brewlog_core::{Operation, StreamEvent, TRACKED_COLLECTIONS};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::client::{RemoteRecord, RepoClient};
use crate::error::{Error, Result};
use crate::index::DerivedIndex;

/// Records requested per `list_records` call.
pub const PAGE_SIZE: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    /// History replayed and the author marked backfilled.
    Completed {
        records: usize,
        /// Records skipped because they failed to decode.
        rejected: usize,
    },
    /// Nothing to do; no network calls were made.
    AlreadyBackfilled,
    /// Another backfill of the same author is running.
    InProgress,
}

/// Aggregate result of [`BackfillCoordinator::backfill_many`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackfillSummary {
    pub completed: usize,
    pub already_backfilled: usize,
    pub in_progress: usize,
    pub records: usize,
    pub rejected: usize,
    /// `(did, error)` for every author that failed.
    pub failed: Vec<(String, String)>,
}

impl BackfillSummary {
    fn record(&mut self, did: String, result: Result<BackfillOutcome>) {
        match result {
            Ok(BackfillOutcome::Completed { records, rejected }) => {
                self.completed += 1;
                self.records += records;
                self.rejected += rejected;
            }
            Ok(BackfillOutcome::AlreadyBackfilled) => self.already_backfilled += 1,
            Ok(BackfillOutcome::InProgress) => self.in_progress += 1,
            Err(e) => self.failed.push((did, e.to_string())),
        }
    }
}

/// Removes an author from the in-flight set when the backfill ends,
/// including when its future is dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<String>>,
    did: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.did);
        metrics::gauge!("backfill_running").decrement(1.0);
    }
}

pub struct BackfillCoordinator {
    index: Arc<DerivedIndex>,
    client: Arc<dyn RepoClient>,
    in_flight: Mutex<HashSet<String>>,
}

impl BackfillCoordinator {
    pub fn new(index: Arc<DerivedIndex>, client: Arc<dyn RepoClient>) -> Self {
        Self {
            index,
            client,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Backfill one author.
    ///
    /// # Errors
    ///
    /// Listing or storage failures. The author is left unmarked so a later
    /// call retries from scratch.
    pub async fn backfill(&self, did: &str) -> Result<BackfillOutcome> {
        if self.index.is_backfilled(did)? {
            debug!(did, "already backfilled");
            return Ok(BackfillOutcome::AlreadyBackfilled);
        }
        let Some(guard) = self.claim(did) else {
            debug!(did, "backfill already in progress");
            return Ok(BackfillOutcome::InProgress);
        };
        self.backfill_claimed(did, guard).await
    }

    async fn backfill_claimed(&self, did: &str, _guard: InFlight<'_>) -> Result<BackfillOutcome> {
        // Another caller may have finished this author between the first
        // check and the claim.
        if self.index.is_backfilled(did)? {
            debug!(did, "backfilled while waiting for claim");
            return Ok(BackfillOutcome::AlreadyBackfilled);
        }

        let started = Instant::now();
        let result = self.run(did).await;
        match &result {
            Ok(BackfillOutcome::Completed { records, rejected }) => {
                metrics::counter!("backfill_authors_total").increment(1);
                metrics::counter!("backfill_records_total").increment(*records as u64);
                info!(
                    did,
                    records,
                    rejected,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "backfill complete"
                );
            }
            Ok(_) => {}
            Err(e) => {
                metrics::counter!("backfill_failures_total").increment(1);
                warn!(did, error = %e, "backfill failed");
            }
        }
        result
    }

    /// Register a newly authenticated author and backfill them.
    pub async fn ensure_backfilled(&self, did: &str) -> Result<BackfillOutcome> {
        self.index.register_author(did)?;
        self.backfill(did).await
    }

    /// Backfill many authors with bounded concurrency. One author failing
    /// never stops the others.
    pub async fn backfill_many(&self, dids: Vec<String>, concurrency: usize) -> BackfillSummary {
        let started = Instant::now();
        let total = dids.len();

        let mut results = stream::iter(dids)
            .map(|did| async move {
                let result = self.backfill(&did).await;
                (did, result)
            })
            .buffer_unordered(concurrency.max(1));

        let mut summary = BackfillSummary::default();
        while let Some((did, result)) = results.next().await {
            summary.record(did, result);
        }

        info!(
            authors = total,
            completed = summary.completed,
            already_backfilled = summary.already_backfilled,
            in_progress = summary.in_progress,
            failed = summary.failed.len(),
            records = summary.records,
            rejected = summary.rejected,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "backfill summary"
        );
        summary
    }

    fn claim(&self, did: &str) -> Option<InFlight<'_>> {
        if !self.in_flight.lock().insert(did.to_string()) {
            return None;
        }
        metrics::gauge!("backfill_running").increment(1.0);
        Some(InFlight {
            set: &self.in_flight,
            did: did.to_string(),
        })
    }

    async fn run(&self, did: &str) -> Result<BackfillOutcome> {
        // List everything first: a listing failure must not leave a
        // half-applied history behind a "done" mark.
        let mut listed = Vec::new();
        for collection in TRACKED_COLLECTIONS {
            listed.extend(self.list_all(did, collection).await?);
        }

        // Applying a whole history is a long run of RocksDB writes; keep it
        // off the runtime threads.
        let index = Arc::clone(&self.index);
        let did = did.to_string();
        tokio::task::spawn_blocking(move || apply_history(&index, &did, listed)).await?
    }

    async fn list_all(&self, did: &str, collection: &str) -> Result<Vec<RemoteRecord>> {
        let mut out = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .client
                .list_records(did, collection, PAGE_SIZE, cursor.as_deref())
                .await?;
            let empty = page.records.is_empty();
            out.extend(page.records);

            match page.cursor {
                // A repeated cursor or an empty page with a cursor would loop
                // forever.
                Some(next) if !empty && cursor.as_deref() != Some(next.as_str()) => {
                    cursor = Some(next);
                }
                _ => break,
            }
        }
        Ok(out)
    }
}

/// Replay listed records through the index, then mark the author.
fn apply_history(
    index: &DerivedIndex,
    did: &str,
    listed: Vec<RemoteRecord>,
) -> Result<BackfillOutcome> {
    let mut records = 0;
    let mut rejected = 0;
    for remote in listed {
        if remote.uri.owner() != did {
            rejected += 1;
            continue;
        }
        let event = StreamEvent {
            seq: 0,
            did: did.to_string(),
            collection: remote.uri.collection().to_string(),
            rkey: remote.uri.rkey().to_string(),
            operation: Operation::Create,
            record: Some(remote.value),
            cid: remote.cid,
            rev: String::new(),
        };
        match index.apply(&event) {
            Ok(_) => records += 1,
            Err(Error::Decode(e)) => {
                debug!(uri = %remote.uri, error = %e, "skipping undecodable record");
                rejected += 1;
            }
            Err(e) => return Err(e),
        }
    }

    index.mark_backfilled(did)?;
    Ok(BackfillOutcome::Completed { records, rejected })
}
