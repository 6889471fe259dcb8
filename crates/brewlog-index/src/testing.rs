//! In-memory fakes shared by the unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use brewlog_core::ResourceUri;
use parking_lot::Mutex;

use crate::client::{Profile, RecordPage, RemoteRecord, RepoClient};
use crate::error::{Error, Result};

/// A [`RepoClient`] backed by maps, counting every call.
#[derive(Default)]
pub struct FakeRepoClient {
    records: Mutex<BTreeMap<String, RemoteRecord>>,
    profiles: Mutex<HashMap<String, Profile>>,
    /// Identities whose listings fail with a client error.
    failing: Mutex<HashSet<String>>,
    /// Page size used by `list_records` regardless of the requested limit.
    pub page_size: Mutex<Option<usize>>,
    pub get_record_calls: AtomicUsize,
    pub get_profile_calls: AtomicUsize,
    pub list_calls: AtomicUsize,
}

impl FakeRepoClient {
    pub fn put_record(&self, record: RemoteRecord) {
        self.records.lock().insert(record.uri.to_string(), record);
    }

    pub fn put_profile(&self, profile: Profile) {
        self.profiles.lock().insert(profile.did.clone(), profile);
    }

    pub fn fail_listings_for(&self, did: &str) {
        self.failing.lock().insert(did.to_string());
    }

    pub fn network_calls(&self) -> usize {
        self.get_record_calls.load(Ordering::SeqCst)
            + self.get_profile_calls.load(Ordering::SeqCst)
            + self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RepoClient for FakeRepoClient {
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>> {
        Ok(self
            .profiles
            .lock()
            .values()
            .find(|p| p.handle == handle)
            .map(|p| p.did.clone()))
    }

    async fn get_record(&self, uri: &ResourceUri) -> Result<Option<RemoteRecord>> {
        self.get_record_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.records.lock().get(&uri.to_string()).cloned())
    }

    async fn list_records(
        &self,
        did: &str,
        collection: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(did) {
            return Err(Error::Client(format!("listRecords failed for {did}")));
        }

        let page_size = self.page_size.lock().unwrap_or(limit).max(1);
        let offset: usize = cursor.and_then(|c| c.parse().ok()).unwrap_or(0);
        let matching: Vec<RemoteRecord> = self
            .records
            .lock()
            .values()
            .filter(|r| r.uri.owner() == did && r.uri.collection() == collection)
            .cloned()
            .collect();

        let records: Vec<_> = matching.iter().skip(offset).take(page_size).cloned().collect();
        let next = offset + records.len();
        Ok(RecordPage {
            cursor: (next < matching.len()).then(|| next.to_string()),
            records,
        })
    }

    async fn get_profile(&self, did: &str) -> Result<Option<Profile>> {
        self.get_profile_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.profiles.lock().get(did).cloned())
    }
}
