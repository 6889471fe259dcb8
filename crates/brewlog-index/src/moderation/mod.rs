//! Automod engine.
//!
//! Owns reports, hidden records and the moderation audit log. Reports move
//! `pending -> dismissed | actioned`; once a subject collects enough reports
//! (per record, or across all of its owner's records) it is hidden on
//! behalf of [`AUTOMOD_ACTOR`] and every pending report against it becomes
//! `actioned`. Moderators can hide, unhide and dismiss by hand; every state
//! change writes an [`AuditEntry`] in the same batch.
//!
//! The derived index only sees this engine through
//! [`ModerationView`](crate::index::ModerationView), queried at read time.
//!
//! All mutations serialise on one writer lock. Reads take no lock.

mod audit;
mod hidden;
mod reports;

pub use audit::{AuditAction, AuditEntry};
pub use hidden::HiddenRecord;
pub use reports::{Report, ReportStatus};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use brewlog_core::ResourceUri;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::warn;

use crate::error::Error;
use crate::index::ModerationView;
use crate::store::Store;

/// `hidden_by` for automatic hides.
pub const AUTOMOD_ACTOR: &str = "automod";

/// Listing size used when the caller passes `limit == 0`.
pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 500;

#[derive(Debug, Clone)]
pub struct AutomodConfig {
    /// Reports one reporter may file per `rate_limit_window`.
    pub report_rate_limit: usize,
    pub rate_limit_window: Duration,
    /// Reports against one record that hide it. 0 disables.
    pub auto_hide_threshold: usize,
    /// Reports against all of an owner's records that hide the reported
    /// record. 0 disables.
    pub auto_hide_owner_threshold: usize,
    /// Reasons are truncated to this many characters.
    pub max_reason_len: usize,
    pub moderators: HashSet<String>,
}

impl Default for AutomodConfig {
    fn default() -> Self {
        Self {
            report_rate_limit: 10,
            rate_limit_window: Duration::from_secs(3600),
            auto_hide_threshold: 3,
            auto_hide_owner_threshold: 5,
            max_reason_len: 500,
            moderators: HashSet::new(),
        }
    }
}

/// A policy decision returned to the caller, not a failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("invalid subject '{0}'")]
    InvalidSubject(String),

    #[error("cannot report your own record")]
    SelfReport,

    #[error("report limit of {limit} per hour reached")]
    RateLimited { limit: usize },

    #[error("record already reported")]
    Duplicate,

    #[error("{0} is not a moderator")]
    NotModerator(String),

    #[error("report is already {from}")]
    InvalidTransition { from: ReportStatus },

    #[error("report {0} not found")]
    UnknownReport(u64),
}

impl Rejection {
    /// Bounded metric label.
    pub fn label(&self) -> &'static str {
        match self {
            Self::InvalidSubject(_) => "invalid_subject",
            Self::SelfReport => "self_report",
            Self::RateLimited { .. } => "rate_limited",
            Self::Duplicate => "duplicate",
            Self::NotModerator(_) => "not_moderator",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::UnknownReport(_) => "unknown_report",
        }
    }
}

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error(transparent)]
    Store(#[from] Error),
}

impl ModerationError {
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Self::Rejected(r) => Some(r),
            Self::Store(_) => None,
        }
    }
}

impl From<serde_json::Error> for ModerationError {
    fn from(err: serde_json::Error) -> Self {
        Self::Store(err.into())
    }
}

pub type ModerationResult<T> = std::result::Result<T, ModerationError>;

fn reject<T>(rejection: Rejection) -> ModerationResult<T> {
    metrics::counter!("automod_reports_rejected_total", "reason" => rejection.label()).increment(1);
    Err(rejection.into())
}

pub struct AutomodEngine {
    store: Arc<Store>,
    config: AutomodConfig,
    writer: Mutex<()>,
}

impl AutomodEngine {
    pub fn new(store: Arc<Store>, config: AutomodConfig) -> Self {
        Self {
            store,
            config,
            writer: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &AutomodConfig {
        &self.config
    }

    pub fn is_moderator(&self, did: &str) -> bool {
        self.config.moderators.contains(did)
    }

    fn require_moderator(&self, did: &str) -> ModerationResult<()> {
        if self.is_moderator(did) {
            Ok(())
        } else {
            Err(Rejection::NotModerator(did.to_string()).into())
        }
    }
}

impl ModerationView for AutomodEngine {
    fn is_record_hidden(&self, uri: &ResourceUri) -> bool {
        match self.hidden_record(uri) {
            Ok(hidden) => hidden.is_some(),
            Err(e) => {
                warn!(%uri, error = %e, "hidden lookup failed, treating as visible");
                false
            }
        }
    }

    fn is_moderator(&self, did: &str) -> bool {
        AutomodEngine::is_moderator(self, did)
    }
}

fn clamp_limit(limit: usize) -> usize {
    match limit {
        0 => DEFAULT_LIST_LIMIT,
        n => n.min(MAX_LIST_LIMIT),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use chrono::{DateTime, Utc};
    use tempfile::TempDir;

    pub const MODERATOR: &str = "did:plc:mod";

    pub struct Fixture {
        pub _tmp: TempDir,
        pub engine: AutomodEngine,
    }

    pub fn fixture() -> Fixture {
        fixture_with(AutomodConfig::default())
    }

    pub fn fixture_with(mut config: AutomodConfig) -> Fixture {
        config.moderators.insert(MODERATOR.to_string());
        let tmp = TempDir::new().unwrap();
        let store = Arc::new(Store::open(tmp.path()).unwrap());
        Fixture {
            _tmp: tmp,
            engine: AutomodEngine::new(store, config),
        }
    }

    pub fn at(offset_secs: i64) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
            + chrono::Duration::seconds(offset_secs)
    }

    pub fn subject(owner: &str, rkey: &str) -> String {
        format!("at://{owner}/social.arabica.alpha.brew/{rkey}")
    }
}
