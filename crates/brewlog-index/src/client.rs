//! External repository client.
//!
//! The indexer never talks to author repositories directly outside this
//! module. [`RepoClient`] is the seam: the daemon uses [`XrpcClient`] over
//! HTTP, tests substitute in-memory fakes.

use std::time::Duration;

use async_trait::async_trait;
use brewlog_core::ResourceUri;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::Result;

/// Default timeout for outbound requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// A record as returned by a repository.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub uri: ResourceUri,
    #[serde(default)]
    pub cid: Option<String>,
    pub value: serde_json::Value,
}

/// One page of a collection listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordPage {
    pub records: Vec<RemoteRecord>,
    /// Pass back to fetch the next page; `None` on the last page.
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Public profile of an author.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Profile {
    pub did: String,
    pub handle: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Read access to author repositories and identity resolution.
///
/// "Not found" is `Ok(None)` (or an empty page); `Err` means the request
/// itself failed and may be retried.
#[async_trait]
pub trait RepoClient: Send + Sync {
    /// Resolve a handle (`alice.example.com`) to an author identity.
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>>;

    /// Fetch a single record.
    async fn get_record(&self, uri: &ResourceUri) -> Result<Option<RemoteRecord>>;

    /// List one page of an author's records in a collection.
    async fn list_records(
        &self,
        did: &str,
        collection: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage>;

    /// Fetch an author's public profile.
    async fn get_profile(&self, did: &str) -> Result<Option<Profile>>;
}

/// [`RepoClient`] speaking XRPC over HTTP.
///
/// Repository reads go to the PDS; profiles come from the app view.
pub struct XrpcClient {
    http: reqwest::Client,
    pds_url: String,
    appview_url: String,
}

#[derive(Deserialize)]
struct ResolveHandleResponse {
    did: String,
}

impl XrpcClient {
    pub fn new(pds_url: impl Into<String>, appview_url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .user_agent(concat!("brewlog-indexer/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            http,
            pds_url: pds_url.into().trim_end_matches('/').to_string(),
            appview_url: appview_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn xrpc(base: &str, method: &str) -> String {
        format!("{base}/xrpc/{method}")
    }

    /// Issue a GET and decode the body, mapping "not found" to `None`.
    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: String,
        query: &[(&str, &str)],
    ) -> Result<Option<T>> {
        let response = self.http.get(&url).query(query).send().await?;

        // XRPC reports missing repos and records as 400 with an error body.
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::BAD_REQUEST
        ) {
            debug!(url = %url, status = %response.status(), "XRPC lookup not found");
            return Ok(None);
        }

        let body = response.error_for_status()?.json::<T>().await?;
        Ok(Some(body))
    }
}

#[async_trait]
impl RepoClient for XrpcClient {
    async fn resolve_handle(&self, handle: &str) -> Result<Option<String>> {
        let url = Self::xrpc(&self.pds_url, "com.atproto.identity.resolveHandle");
        let resolved: Option<ResolveHandleResponse> =
            self.get_json(url, &[("handle", handle)]).await?;
        Ok(resolved.map(|r| r.did))
    }

    async fn get_record(&self, uri: &ResourceUri) -> Result<Option<RemoteRecord>> {
        let url = Self::xrpc(&self.pds_url, "com.atproto.repo.getRecord");
        self.get_json(
            url,
            &[
                ("repo", uri.owner()),
                ("collection", uri.collection()),
                ("rkey", uri.rkey()),
            ],
        )
        .await
    }

    async fn list_records(
        &self,
        did: &str,
        collection: &str,
        limit: usize,
        cursor: Option<&str>,
    ) -> Result<RecordPage> {
        let url = Self::xrpc(&self.pds_url, "com.atproto.repo.listRecords");
        let limit = limit.to_string();
        let mut query = vec![
            ("repo", did),
            ("collection", collection),
            ("limit", limit.as_str()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let page: Option<RecordPage> = self.get_json(url, &query).await?;
        Ok(page.unwrap_or_default())
    }

    async fn get_profile(&self, did: &str) -> Result<Option<Profile>> {
        let url = Self::xrpc(&self.appview_url, "app.bsky.actor.getProfile");
        self.get_json(url, &[("actor", did)]).await
    }
}
