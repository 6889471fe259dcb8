//! Core types shared by the brewlog indexer.
//!
//! This crate provides:
//! - Resource identifiers (`at://did/collection/rkey`) and strong references
//! - Stream events and Jetstream frame parsing
//! - The record decoder (collection type → typed domain record)
//! - Prometheus metrics helpers
//! - Shared error types

mod error;
pub mod event;
pub mod metrics;
pub mod record;
pub mod uri;

pub use error::{Error, Result};
pub use event::{Frame, Operation, StreamEvent, parse_jetstream_frame};
pub use record::{
    Bean, Brew, Brewer, CommentRecord, DomainRecord, Grinder, LikeRecord, RecordKind, Roaster,
    TRACKED_COLLECTIONS, decode, decode_event,
};
pub use uri::{ResourceUri, StrongRef};
