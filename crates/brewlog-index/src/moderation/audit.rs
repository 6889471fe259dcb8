//! Append-only audit log: `a \0 {id:020} -> AuditEntry` in `audit`.

use std::fmt;

use brewlog_core::ResourceUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{AutomodEngine, clamp_limit};
use crate::error::Result;
use crate::store::{Namespace, StoreBatch, key, prefix, sortable};

const SEQUENCE: &str = "audit";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Hide,
    Unhide,
    DismissReport,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Hide => "hide",
            Self::Unhide => "unhide",
            Self::DismissReport => "dismiss_report",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    pub action: AuditAction,
    /// Moderator identity, or `automod`.
    pub actor: String,
    pub target: ResourceUri,
    /// Set for report actions.
    #[serde(default)]
    pub report_id: Option<u64>,
    pub reason: String,
    pub timestamp: DateTime<Utc>,
    pub automated: bool,
}

pub(super) struct NewAudit<'a> {
    pub action: AuditAction,
    pub actor: &'a str,
    pub target: &'a ResourceUri,
    pub report_id: Option<u64>,
    pub reason: &'a str,
    pub timestamp: DateTime<Utc>,
    pub automated: bool,
}

impl AutomodEngine {
    /// Audit entries, newest first.
    pub fn list_audit(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        self.store
            .scan_prefix_rev(Namespace::Audit, &prefix(&["a"]), None, clamp_limit(limit))?
            .into_iter()
            .map(|(_, raw)| Ok(serde_json::from_slice(&raw)?))
            .collect()
    }

    pub(super) fn stage_audit(&self, batch: &mut StoreBatch, new: NewAudit<'_>) -> Result<AuditEntry> {
        let entry = AuditEntry {
            id: self.store.next_sequence(SEQUENCE)?,
            action: new.action,
            actor: new.actor.to_string(),
            target: new.target.clone(),
            report_id: new.report_id,
            reason: new.reason.to_string(),
            timestamp: new.timestamp,
            automated: new.automated,
        };
        batch.put_json(Namespace::Audit, key(&["a", &sortable(entry.id)]), &entry)?;
        Ok(entry)
    }
}
