//! Brewlog record indexer.
//!
//! Consumes the network's record event stream, keeps a derived index of
//! brews, likes, comments and notifications, replays historical records for
//! newly seen authors, and runs report-driven automatic moderation.
//!
//! # Modules
//!
//! - [`stream`] - Stream consumer and the Jetstream source
//! - [`index`] - Derived index (likes, comments, notifications, feeds)
//! - [`backfill`] - Backfill coordinator
//! - [`moderation`] - Automod engine
//! - [`store`] - RocksDB store shared by the index and the automod engine
//! - [`client`] - Repository client for record and profile lookups
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ StreamConsumer  │     │  BackfillCoord  │  (listRecords per author)
//! └────────┬────────┘     └────────┬────────┘
//!          └──────────┬────────────┘
//!                     ▼  apply(event)
//!            ┌─────────────────┐  is_record_hidden  ┌─────────────────┐
//!            │  DerivedIndex   │ ─────────────────► │  AutomodEngine  │
//!            └────────┬────────┘                    └────────┬────────┘
//!                     └──────────────┬───────────────────────┘
//!                                    ▼
//!                           ┌─────────────────┐
//!                           │ Store (RocksDB) │
//!                           └─────────────────┘
//! ```
//!
//! Backfill and the live stream share one apply path, so a record seen by
//! both is indexed once.

pub mod backfill;
pub mod client;
pub mod config;
pub mod error;
pub mod index;
pub mod moderation;
pub mod store;
pub mod stream;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

pub use backfill::{BackfillCoordinator, BackfillOutcome, BackfillSummary};
pub use client::{Profile, RecordPage, RemoteRecord, RepoClient, XrpcClient};
pub use config::Config;
pub use index::{
    ApplyOutcome, DerivedIndex, FeedQuery, FeedSort, IndexConfig, IndexStats, ModerationView,
};
pub use moderation::{
    AuditEntry, AutomodConfig, AutomodEngine, HiddenRecord, ModerationError, Rejection, Report,
    ReportStatus,
};
pub use store::Store;
pub use stream::{
    ConsumerConfig, ConsumerStats, FrameSource, HealthHandle, JetstreamSource, StreamConsumer,
    StreamHealth,
};
