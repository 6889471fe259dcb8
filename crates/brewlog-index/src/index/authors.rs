//! Author registry.
//!
//! `a \0 {did} -> AuthorEntry` in the `authors` namespace. An entry is
//! created the first time an author produces a record (or is registered
//! explicitly) and its backfill mark is set at most once.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::DerivedIndex;
use crate::error::Result;
use crate::store::{Namespace, StoreBatch, key, prefix};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorEntry {
    pub did: String,
    pub registered_at: DateTime<Utc>,
    /// Set once the author's history has been replayed.
    #[serde(default)]
    pub backfilled_at: Option<DateTime<Utc>>,
}

fn author_key(did: &str) -> Vec<u8> {
    key(&["a", did])
}

impl DerivedIndex {
    pub fn get_author(&self, did: &str) -> Result<Option<AuthorEntry>> {
        self.store.get_json(Namespace::Authors, &author_key(did))
    }

    /// True once `did` has produced a record or been registered explicitly.
    pub fn is_registered(&self, did: &str) -> Result<bool> {
        self.store.contains(Namespace::Authors, &author_key(did))
    }

    /// Register `did`. Returns `true` if it was not registered before.
    pub fn register_author(&self, did: &str) -> Result<bool> {
        let _guard = self.locks.authors.lock();
        let mut batch = StoreBatch::default();
        let created = self.stage_author(&mut batch, did, Utc::now())?;
        self.store.write(batch)?;
        Ok(created)
    }

    pub fn is_backfilled(&self, did: &str) -> Result<bool> {
        Ok(self
            .get_author(did)?
            .is_some_and(|a| a.backfilled_at.is_some()))
    }

    /// Set the backfill mark. Returns `false` (and changes nothing) if it
    /// was already set.
    pub fn mark_backfilled(&self, did: &str) -> Result<bool> {
        let _guard = self.locks.authors.lock();
        let now = Utc::now();
        let mut entry = self.get_author(did)?.unwrap_or_else(|| AuthorEntry {
            did: did.to_string(),
            registered_at: now,
            backfilled_at: None,
        });
        if entry.backfilled_at.is_some() {
            return Ok(false);
        }

        entry.backfilled_at = Some(now);
        let mut batch = StoreBatch::default();
        batch.put_json(Namespace::Authors, author_key(did), &entry)?;
        self.store.write(batch)?;
        info!(did, "author marked backfilled");
        Ok(true)
    }

    /// Every registered author, ordered by identity.
    pub fn known_authors(&self) -> Result<Vec<AuthorEntry>> {
        self.store
            .scan_prefix(Namespace::Authors, &prefix(&["a"]), None, usize::MAX)?
            .into_iter()
            .map(|(_, raw)| Ok(serde_json::from_slice(&raw)?))
            .collect()
    }

    /// Stage a registry entry if `did` has none. Caller holds the authors lock.
    pub(super) fn stage_author(
        &self,
        batch: &mut StoreBatch,
        did: &str,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        if self.is_registered(did)? {
            return Ok(false);
        }
        let entry = AuthorEntry {
            did: did.to_string(),
            registered_at: seen_at,
            backfilled_at: None,
        };
        batch.put_json(Namespace::Authors, author_key(did), &entry)?;
        Ok(true)
    }
}
