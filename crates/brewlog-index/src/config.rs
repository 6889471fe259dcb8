//! Indexer configuration loaded from environment variables.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::index::IndexConfig;
use crate::moderation::AutomodConfig;

const DEFAULT_JETSTREAM_URL: &str = "wss://jetstream2.us-east.bsky.network/subscribe";
const DEFAULT_PDS_URL: &str = "https://bsky.social";
const DEFAULT_APPVIEW_URL: &str = "https://public.api.bsky.app";

/// Indexer configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// RocksDB directory.
    pub data_dir: PathBuf,

    /// Jetstream subscribe endpoint.
    pub jetstream_url: String,

    /// Repository host used for record lookups and backfill listings.
    pub pds_url: String,

    /// App view used for profile lookups.
    pub appview_url: String,

    /// Identities backfilled at startup.
    pub known_authors: Vec<String>,

    pub moderators: HashSet<String>,

    /// Reports per reporter per hour.
    pub report_rate_limit: usize,
    pub auto_hide_threshold: usize,
    pub auto_hide_owner_threshold: usize,

    pub public_feed_size: usize,
    pub public_feed_ttl: Duration,

    /// Identities backfilled concurrently.
    pub backfill_concurrency: usize,

    /// Metrics HTTP server port (0 to disable).
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - None (all have defaults for local development)
    ///
    /// Optional:
    /// - `BREWLOG_DATA_DIR`: RocksDB directory (default: "./data/index")
    /// - `BREWLOG_JETSTREAM_URL`: Jetstream subscribe URL
    /// - `BREWLOG_PDS_URL`: Repository host (default: "https://bsky.social")
    /// - `BREWLOG_APPVIEW_URL`: App view (default: "https://public.api.bsky.app")
    /// - `BREWLOG_KNOWN_AUTHORS`: Comma-separated DIDs to backfill at startup
    /// - `BREWLOG_MODERATORS`: Comma-separated moderator DIDs
    /// - `BREWLOG_REPORT_RATE_LIMIT`: Reports per reporter per hour (default: 10)
    /// - `BREWLOG_AUTO_HIDE_THRESHOLD`: Reports per record (default: 3)
    /// - `BREWLOG_AUTO_HIDE_OWNER_THRESHOLD`: Reports per owner (default: 5)
    /// - `BREWLOG_PUBLIC_FEED_SIZE`: Public feed snapshot size (default: 50)
    /// - `BREWLOG_PUBLIC_FEED_TTL_SECS`: Public feed snapshot TTL (default: 30)
    /// - `BREWLOG_BACKFILL_CONCURRENCY`: (default: number of CPUs, at most 8)
    /// - `BREWLOG_METRICS_PORT`: Metrics port, 0 disables (default: 9090)
    ///
    /// # Errors
    ///
    /// [`Error::Config`] when a numeric variable does not parse.
    pub fn from_env() -> Result<Self> {
        let data_dir = PathBuf::from(
            std::env::var("BREWLOG_DATA_DIR").unwrap_or_else(|_| "./data/index".to_string()),
        );

        let jetstream_url = std::env::var("BREWLOG_JETSTREAM_URL")
            .unwrap_or_else(|_| DEFAULT_JETSTREAM_URL.to_string());

        let pds_url = std::env::var("BREWLOG_PDS_URL")
            .unwrap_or_else(|_| DEFAULT_PDS_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let appview_url = std::env::var("BREWLOG_APPVIEW_URL")
            .unwrap_or_else(|_| DEFAULT_APPVIEW_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let known_authors = did_list("BREWLOG_KNOWN_AUTHORS");
        let moderators: HashSet<String> = did_list("BREWLOG_MODERATORS").into_iter().collect();

        let automod = AutomodConfig::default();
        let index = IndexConfig::default();

        let config = Self {
            data_dir,
            jetstream_url,
            pds_url,
            appview_url,
            known_authors,
            moderators,
            report_rate_limit: parse_var("BREWLOG_REPORT_RATE_LIMIT", automod.report_rate_limit)?,
            auto_hide_threshold: parse_var(
                "BREWLOG_AUTO_HIDE_THRESHOLD",
                automod.auto_hide_threshold,
            )?,
            auto_hide_owner_threshold: parse_var(
                "BREWLOG_AUTO_HIDE_OWNER_THRESHOLD",
                automod.auto_hide_owner_threshold,
            )?,
            public_feed_size: parse_var("BREWLOG_PUBLIC_FEED_SIZE", index.public_feed_size)?,
            public_feed_ttl: Duration::from_secs(parse_var(
                "BREWLOG_PUBLIC_FEED_TTL_SECS",
                index.public_feed_ttl.as_secs(),
            )?),
            backfill_concurrency: parse_var(
                "BREWLOG_BACKFILL_CONCURRENCY",
                num_cpus::get().clamp(1, 8),
            )?
            .max(1),
            metrics_port: parse_var("BREWLOG_METRICS_PORT", 9090)?,
        };

        tracing::info!(
            data_dir = %config.data_dir.display(),
            jetstream_url = %config.jetstream_url,
            pds_url = %config.pds_url,
            known_authors = config.known_authors.len(),
            moderators = config.moderators.len(),
            report_rate_limit = config.report_rate_limit,
            auto_hide_threshold = config.auto_hide_threshold,
            "indexer configuration loaded"
        );

        Ok(config)
    }

    pub fn index_config(&self) -> IndexConfig {
        IndexConfig {
            public_feed_size: self.public_feed_size,
            public_feed_ttl: self.public_feed_ttl,
            ..Default::default()
        }
    }

    pub fn automod_config(&self) -> AutomodConfig {
        AutomodConfig {
            report_rate_limit: self.report_rate_limit,
            auto_hide_threshold: self.auto_hide_threshold,
            auto_hide_owner_threshold: self.auto_hide_owner_threshold,
            moderators: self.moderators.clone(),
            ..Default::default()
        }
    }
}

fn did_list(name: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| s.starts_with("did:"))
        .filter(|s| seen.insert(s.to_string()))
        .map(str::to_string)
        .collect()
}

fn parse_var<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("{name}={raw:?}: {e}"))),
        _ => Ok(default),
    }
}
