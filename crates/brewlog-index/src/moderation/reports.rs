//! User reports.
//!
//! Keys in the `reports` namespace:
//!
//! ```text
//! r \0 {id:020}                                   -> Report (JSON)
//! s \0 {subject} \0 {id:020}                      -> ()  active, per record
//! o \0 {owner} \0 {id:020}                        -> ()  active, per owner
//! d \0 {reporter} \0 {subject}                    -> id  (one per pair)
//! t \0 {reporter} \0 {created:020} \0 {id:020}    -> ()  (rate limiting)
//! ```
//!
//! "Active" means counting towards auto-hide. Dismissing a report drops it
//! from the `s` and `o` indexes; unhiding a record drops every report
//! against it, so only reports filed after the unhide can hide it again.

use std::fmt;

use brewlog_core::ResourceUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::audit::NewAudit;
use super::{AuditAction, AutomodEngine, ModerationResult, Rejection, clamp_limit, reject};
use crate::error::Result;
use crate::index::micros;
use crate::store::{Namespace, StoreBatch, key, prefix, sortable, split_key};

const SEQUENCE: &str = "report";
const SCAN_CHUNK: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Pending,
    Dismissed,
    Actioned,
}

impl fmt::Display for ReportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Dismissed => "dismissed",
            Self::Actioned => "actioned",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    pub id: u64,
    pub subject: ResourceUri,
    pub subject_owner: String,
    pub reporter: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub status: ReportStatus,
}

fn report_key(id: u64) -> Vec<u8> {
    key(&["r", &sortable(id)])
}

fn subject_key(subject: &str, id: u64) -> Vec<u8> {
    key(&["s", subject, &sortable(id)])
}

fn owner_key(owner: &str, id: u64) -> Vec<u8> {
    key(&["o", owner, &sortable(id)])
}

fn pair_key(reporter: &str, subject: &str) -> Vec<u8> {
    key(&["d", reporter, subject])
}

fn truncate_reason(reason: &str, max_chars: usize) -> String {
    reason.trim().chars().take(max_chars).collect()
}

impl AutomodEngine {
    pub fn submit_report(
        &self,
        reporter: &str,
        subject: &str,
        reason: &str,
    ) -> ModerationResult<Report> {
        self.submit_report_at(reporter, subject, reason, Utc::now())
    }

    /// [`submit_report`](Self::submit_report) with an explicit clock.
    ///
    /// Rejects invalid subjects, reports on the reporter's own records,
    /// repeat reports of the same subject, and reporters over the rolling
    /// rate limit. On success the report is stored and auto-hide is
    /// evaluated; the returned report reflects the outcome.
    pub fn submit_report_at(
        &self,
        reporter: &str,
        subject: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> ModerationResult<Report> {
        let Ok(subject_uri) = ResourceUri::parse(subject) else {
            return reject(Rejection::InvalidSubject(subject.to_string()));
        };
        if subject_uri.owner() == reporter {
            return reject(Rejection::SelfReport);
        }
        let subject = subject_uri.to_string();

        let _guard = self.writer.lock();
        if self.store.contains(Namespace::Reports, &pair_key(reporter, &subject))? {
            return reject(Rejection::Duplicate);
        }
        let limit = self.config.report_rate_limit;
        if self.recent_reports_by(reporter, now)? >= limit {
            debug!(reporter, limit, "report rate limit reached");
            return reject(Rejection::RateLimited { limit });
        }

        let mut report = Report {
            id: self.store.next_sequence(SEQUENCE)?,
            subject_owner: subject_uri.owner().to_string(),
            subject: subject_uri,
            reporter: reporter.to_string(),
            reason: truncate_reason(reason, self.config.max_reason_len),
            created_at: now,
            status: ReportStatus::Pending,
        };

        let mut batch = self.store.batch();
        batch.put_json(Namespace::Reports, report_key(report.id), &report)?;
        batch.put(Namespace::Reports, subject_key(&subject, report.id), Vec::new());
        batch.put(
            Namespace::Reports,
            owner_key(&report.subject_owner, report.id),
            Vec::new(),
        );
        batch.put_u64(Namespace::Reports, pair_key(reporter, &subject), report.id);
        batch.put(
            Namespace::Reports,
            key(&["t", reporter, &sortable(micros(now)), &sortable(report.id)]),
            Vec::new(),
        );
        self.store.write(batch)?;
        metrics::counter!("automod_reports_total").increment(1);
        info!(id = report.id, reporter, %report.subject, "report submitted");

        if self.auto_hide_locked(&report, now)?.is_some() {
            report.status = ReportStatus::Actioned;
        }
        Ok(report)
    }

    pub fn get_report(&self, id: u64) -> Result<Option<Report>> {
        self.store.get_json(Namespace::Reports, &report_key(id))
    }

    /// Reports newest first, optionally filtered by status.
    pub fn list_reports(&self, status: Option<ReportStatus>, limit: usize) -> Result<Vec<Report>> {
        let limit = clamp_limit(limit);
        let report_prefix = prefix(&["r"]);
        let mut reports = Vec::new();
        let mut before: Option<Vec<u8>> = None;

        loop {
            let chunk = self.store.scan_prefix_rev(
                Namespace::Reports,
                &report_prefix,
                before.as_deref(),
                SCAN_CHUNK,
            )?;
            let exhausted = chunk.len() < SCAN_CHUNK;
            before = chunk.last().map(|(k, _)| k.clone());

            for (_, raw) in chunk {
                let report: Report = serde_json::from_slice(&raw)?;
                if status.is_none_or(|s| s == report.status) {
                    reports.push(report);
                    if reports.len() >= limit {
                        return Ok(reports);
                    }
                }
            }
            if exhausted || before.is_none() {
                return Ok(reports);
            }
        }
    }

    /// Close a pending report without action.
    ///
    /// Dismissing an already dismissed report is a no-op.
    pub fn dismiss_report(&self, moderator: &str, id: u64, reason: &str) -> ModerationResult<Report> {
        self.require_moderator(moderator)?;
        let _guard = self.writer.lock();
        let Some(mut report) = self.get_report(id)? else {
            return Err(Rejection::UnknownReport(id).into());
        };
        match report.status {
            ReportStatus::Pending => {}
            ReportStatus::Dismissed => return Ok(report),
            from @ ReportStatus::Actioned => {
                return Err(Rejection::InvalidTransition { from }.into());
            }
        }

        report.status = ReportStatus::Dismissed;
        let subject = report.subject.to_string();
        let mut batch = self.store.batch();
        batch.put_json(Namespace::Reports, report_key(id), &report)?;
        batch.delete(Namespace::Reports, subject_key(&subject, id));
        batch.delete(Namespace::Reports, owner_key(&report.subject_owner, id));
        self.stage_audit(
            &mut batch,
            NewAudit {
                action: AuditAction::DismissReport,
                actor: moderator,
                target: &report.subject,
                report_id: Some(id),
                reason,
                timestamp: Utc::now(),
                automated: false,
            },
        )?;
        self.store.write(batch)?;

        metrics::counter!("automod_moderator_actions_total", "action" => "dismiss").increment(1);
        info!(id, moderator, "report dismissed");
        Ok(report)
    }

    pub(super) fn active_reports_against(&self, subject: &ResourceUri) -> Result<usize> {
        self.store
            .count_prefix(Namespace::Reports, &prefix(&["s", &subject.to_string()]))
    }

    pub(super) fn active_reports_against_owner(&self, owner: &str) -> Result<usize> {
        self.store
            .count_prefix(Namespace::Reports, &prefix(&["o", owner]))
    }

    /// Stop every report against `subject` from counting towards auto-hide.
    /// Statuses are left as they are.
    pub(super) fn stage_retired(&self, batch: &mut StoreBatch, subject: &ResourceUri) -> Result<()> {
        let subject_str = subject.to_string();
        for (k, _) in self.store.scan_prefix(
            Namespace::Reports,
            &prefix(&["s", &subject_str]),
            None,
            usize::MAX,
        )? {
            let Some(id) = split_key(&k).last().and_then(|p| p.parse::<u64>().ok()) else {
                continue;
            };
            batch.delete(Namespace::Reports, subject_key(&subject_str, id));
            batch.delete(Namespace::Reports, owner_key(subject.owner(), id));
        }
        Ok(())
    }

    /// Mark every pending report against `subject` as actioned.
    pub(super) fn stage_actioned(&self, batch: &mut StoreBatch, subject: &ResourceUri) -> Result<()> {
        let subject_prefix = prefix(&["s", &subject.to_string()]);
        for (k, _) in self
            .store
            .scan_prefix(Namespace::Reports, &subject_prefix, None, usize::MAX)?
        {
            let Some(id) = split_key(&k).last().and_then(|p| p.parse::<u64>().ok()) else {
                continue;
            };
            if let Some(mut report) = self.get_report(id)?
                && report.status == ReportStatus::Pending
            {
                report.status = ReportStatus::Actioned;
                batch.put_json(Namespace::Reports, report_key(id), &report)?;
            }
        }
        Ok(())
    }

    /// Reports filed by `reporter` inside the rolling window ending at `now`.
    fn recent_reports_by(&self, reporter: &str, now: DateTime<Utc>) -> Result<usize> {
        let window = chrono::Duration::from_std(self.config.rate_limit_window)
            .unwrap_or(chrono::Duration::MAX);
        let start = now
            .checked_sub_signed(window)
            .map_or(0, |t| micros(t).saturating_add(1));
        let from = key(&["t", reporter, &sortable(start)]);
        let rows = self.store.scan_prefix(
            Namespace::Reports,
            &prefix(&["t", reporter]),
            Some(&from),
            self.config.report_rate_limit.saturating_add(1),
        )?;
        Ok(rows.len())
    }
}
