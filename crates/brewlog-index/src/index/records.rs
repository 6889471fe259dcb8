//! Entity record cache and profile lookups.
//!
//! Keys in the `records` namespace:
//!
//! ```text
//! e \0 {uri}                        -> CachedRecord (JSON)
//! t \0 {created_us:020} \0 {uri}    -> ()   creation-time index for feeds
//! ```

use brewlog_core::{DomainRecord, RecordKind, ResourceUri, StreamEvent, decode};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{DerivedIndex, PendingWrite, micros};
use crate::client::Profile;
use crate::error::Result;
use crate::store::{Namespace, StoreBatch, key, sortable};

/// A brew, bean, roaster, grinder or brewer as last seen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedRecord {
    pub uri: ResourceUri,
    pub kind: RecordKind,
    #[serde(default)]
    pub cid: Option<String>,
    /// The raw record payload.
    pub value: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub indexed_at: DateTime<Utc>,
}

impl CachedRecord {
    pub fn author(&self) -> &str {
        self.uri.owner()
    }
}

pub(super) fn entry_key(uri: &str) -> Vec<u8> {
    key(&["e", uri])
}

pub(super) fn time_key(created_at: DateTime<Utc>, uri: &str) -> Vec<u8> {
    key(&["t", &sortable(micros(created_at)), uri])
}

impl DerivedIndex {
    /// Upsert an entity record from the stream.
    pub(crate) fn upsert_record(
        &self,
        event: &StreamEvent,
        uri: ResourceUri,
        record: &DomainRecord,
    ) -> Result<bool> {
        let Some(created_at) = record.created_at() else {
            return Ok(false);
        };
        let cached = CachedRecord {
            uri,
            kind: record.kind(),
            cid: event.cid.clone(),
            value: event.record.clone().unwrap_or_default(),
            created_at,
            indexed_at: Utc::now(),
        };

        let _guard = self.locks.records.lock();
        let mut pending = PendingWrite {
            author: Some((event.did.clone(), created_at)),
            ..Default::default()
        };
        let changed = self.stage_record(&mut pending.batch, cached)?;
        self.commit(pending)?;
        Ok(changed)
    }

    /// Remove an entity record from the cache. Missing records are a no-op.
    pub fn delete_record(&self, uri: &ResourceUri) -> Result<bool> {
        let _guard = self.locks.records.lock();
        let uri_str = uri.to_string();
        let Some(existing) = self.cached_record(uri)? else {
            return Ok(false);
        };

        let mut batch = StoreBatch::default();
        batch.delete(Namespace::Records, entry_key(&uri_str));
        batch.delete(Namespace::Records, time_key(existing.created_at, &uri_str));
        self.store.write(batch)?;
        Ok(true)
    }

    /// Look up a record, fetching it from the author's repository on a
    /// cache miss. Entity records fetched remotely are written back.
    pub async fn get_record(&self, uri: &ResourceUri) -> Result<Option<CachedRecord>> {
        if let Some(cached) = self.cached_record(uri)? {
            return Ok(Some(cached));
        }

        metrics::counter!("index_record_fetches_total").increment(1);
        let Some(remote) = self.client.get_record(uri).await? else {
            return Ok(None);
        };

        let kind = RecordKind::from_collection(uri.collection());
        let created_at = match decode(uri.collection(), &remote.value) {
            Ok(record) => record.created_at().unwrap_or_else(Utc::now),
            Err(e) => {
                warn!(uri = %uri, error = %e, "remote record failed to decode");
                return Ok(None);
            }
        };
        let cached = CachedRecord {
            uri: uri.clone(),
            kind,
            cid: remote.cid,
            value: remote.value,
            created_at,
            indexed_at: Utc::now(),
        };

        if kind.is_entity() {
            let _guard = self.locks.records.lock();
            // The stream may have filled the entry while we were fetching.
            if self.cached_record(uri)?.is_none() {
                let mut batch = StoreBatch::default();
                self.stage_record(&mut batch, cached.clone())?;
                self.store.write(batch)?;
                debug!(uri = %uri, "cached remote record");
            }
        }
        Ok(Some(cached))
    }

    /// Profile for `did`, cached in memory.
    pub async fn get_profile(&self, did: &str) -> Result<Option<Profile>> {
        if let Some(profile) = self.profiles.get(did).await {
            return Ok(Some(profile));
        }

        metrics::counter!("index_profile_fetches_total").increment(1);
        let profile = self.client.get_profile(did).await?;
        if let Some(profile) = &profile {
            self.profiles
                .insert(did.to_string(), profile.clone())
                .await;
        }
        Ok(profile)
    }

    pub(super) fn cached_record(&self, uri: &ResourceUri) -> Result<Option<CachedRecord>> {
        self.store
            .get_json(Namespace::Records, &entry_key(&uri.to_string()))
    }

    /// Stage an upsert. Returns `false` when the stored copy is the same
    /// version. Caller holds the records lock.
    fn stage_record(&self, batch: &mut StoreBatch, record: CachedRecord) -> Result<bool> {
        let uri = record.uri.to_string();
        if let Some(existing) = self.cached_record(&record.uri)? {
            if existing.cid == record.cid && existing.value == record.value {
                return Ok(false);
            }
            if existing.created_at != record.created_at {
                batch.delete(Namespace::Records, time_key(existing.created_at, &uri));
            }
        }
        batch.put(
            Namespace::Records,
            time_key(record.created_at, &uri),
            Vec::new(),
        );
        batch.put_json(Namespace::Records, entry_key(&uri), &record)?;
        Ok(true)
    }
}
