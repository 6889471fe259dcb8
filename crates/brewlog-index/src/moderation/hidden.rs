//! Hidden records.
//!
//! Keys in the `hidden` namespace:
//!
//! ```text
//! h \0 {uri}                   -> HiddenRecord (JSON)
//! t \0 {hidden_at:020} \0 {uri} -> uri          (listing order)
//! ```

use brewlog_core::ResourceUri;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::audit::NewAudit;
use super::reports::Report;
use super::{AUTOMOD_ACTOR, AuditAction, AutomodEngine, ModerationResult, clamp_limit};
use crate::error::Result;
use crate::index::micros;
use crate::store::{Namespace, key, prefix, sortable};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HiddenRecord {
    pub uri: ResourceUri,
    pub hidden_at: DateTime<Utc>,
    /// Moderator identity, or `automod`.
    pub hidden_by: String,
    pub reason: String,
    pub auto_hidden: bool,
}

fn hidden_key(uri: &ResourceUri) -> Vec<u8> {
    key(&["h", &uri.to_string()])
}

fn time_key(hidden_at: DateTime<Utc>, uri: &ResourceUri) -> Vec<u8> {
    key(&["t", &sortable(micros(hidden_at)), &uri.to_string()])
}

impl AutomodEngine {
    pub fn hidden_record(&self, uri: &ResourceUri) -> Result<Option<HiddenRecord>> {
        self.store.get_json(Namespace::Hidden, &hidden_key(uri))
    }

    /// Hidden records, most recently hidden first.
    pub fn list_hidden(&self, limit: usize) -> Result<Vec<HiddenRecord>> {
        let mut hidden = Vec::new();
        for (_, raw) in
            self.store
                .scan_prefix_rev(Namespace::Hidden, &prefix(&["t"]), None, clamp_limit(limit))?
        {
            let uri = String::from_utf8_lossy(&raw);
            if let Some(record) = self
                .store
                .get_json(Namespace::Hidden, &key(&["h", uri.as_ref()]))?
            {
                hidden.push(record);
            }
        }
        Ok(hidden)
    }

    /// Hide `uri` by hand. `None` if it was already hidden.
    pub fn hide_record(
        &self,
        moderator: &str,
        uri: &ResourceUri,
        reason: &str,
    ) -> ModerationResult<Option<HiddenRecord>> {
        self.require_moderator(moderator)?;
        let _guard = self.writer.lock();
        let hidden = self.hide_locked(uri, moderator, reason, false, Utc::now())?;
        if hidden.is_some() {
            metrics::counter!("automod_moderator_actions_total", "action" => "hide").increment(1);
            info!(%uri, moderator, reason, "record hidden");
        }
        Ok(hidden)
    }

    /// Make `uri` visible again. `false` if it was not hidden.
    ///
    /// Reports stay `actioned` but no longer count towards either auto-hide
    /// threshold.
    pub fn unhide_record(
        &self,
        moderator: &str,
        uri: &ResourceUri,
        reason: &str,
    ) -> ModerationResult<bool> {
        self.require_moderator(moderator)?;
        let _guard = self.writer.lock();
        let Some(existing) = self.hidden_record(uri)? else {
            return Ok(false);
        };

        let now = Utc::now();
        let mut batch = self.store.batch();
        batch.delete(Namespace::Hidden, hidden_key(uri));
        batch.delete(Namespace::Hidden, time_key(existing.hidden_at, uri));
        self.stage_retired(&mut batch, uri)?;
        self.stage_audit(
            &mut batch,
            NewAudit {
                action: AuditAction::Unhide,
                actor: moderator,
                target: uri,
                report_id: None,
                reason,
                timestamp: now,
                automated: false,
            },
        )?;
        self.store.write(batch)?;

        metrics::counter!("automod_moderator_actions_total", "action" => "unhide").increment(1);
        info!(%uri, moderator, reason, "record unhidden");
        Ok(true)
    }

    /// Hide the report's subject if it, or its owner, crossed a threshold.
    ///
    /// No-op when the subject is already hidden.
    pub fn evaluate_auto_hide(&self, report: &Report) -> ModerationResult<Option<HiddenRecord>> {
        let _guard = self.writer.lock();
        self.auto_hide_locked(report, Utc::now())
    }

    pub(super) fn auto_hide_locked(
        &self,
        report: &Report,
        now: DateTime<Utc>,
    ) -> ModerationResult<Option<HiddenRecord>> {
        if self.hidden_record(&report.subject)?.is_some() {
            return Ok(None);
        }

        let per_record = self.active_reports_against(&report.subject)?;
        let per_owner = self.active_reports_against_owner(&report.subject_owner)?;
        let threshold = self.config.auto_hide_threshold;
        let owner_threshold = self.config.auto_hide_owner_threshold;

        let reason = if threshold > 0 && per_record >= threshold {
            format!("{per_record} reports against record")
        } else if owner_threshold > 0 && per_owner >= owner_threshold {
            format!("{per_owner} reports against {}", report.subject_owner)
        } else {
            return Ok(None);
        };

        let hidden = self.hide_locked(&report.subject, AUTOMOD_ACTOR, &reason, true, now)?;
        if hidden.is_some() {
            metrics::counter!("automod_auto_hides_total").increment(1);
            warn!(
                uri = %report.subject,
                owner = %report.subject_owner,
                per_record,
                per_owner,
                "record auto-hidden"
            );
        }
        Ok(hidden)
    }

    /// Write the hidden record, its audit entry and the actioned reports in
    /// one batch. Caller holds the writer lock.
    fn hide_locked(
        &self,
        uri: &ResourceUri,
        actor: &str,
        reason: &str,
        automated: bool,
        now: DateTime<Utc>,
    ) -> ModerationResult<Option<HiddenRecord>> {
        if self.hidden_record(uri)?.is_some() {
            return Ok(None);
        }

        let record = HiddenRecord {
            uri: uri.clone(),
            hidden_at: now,
            hidden_by: actor.to_string(),
            reason: reason.to_string(),
            auto_hidden: automated,
        };

        let mut batch = self.store.batch();
        batch.put_json(Namespace::Hidden, hidden_key(uri), &record)?;
        batch.put(Namespace::Hidden, time_key(now, uri), uri.to_string());
        self.stage_actioned(&mut batch, uri)?;
        self.stage_audit(
            &mut batch,
            NewAudit {
                action: AuditAction::Hide,
                actor,
                target: uri,
                report_id: None,
                reason,
                timestamp: now,
                automated,
            },
        )?;
        self.store.write(batch)?;
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::super::{AutomodConfig, Rejection, ReportStatus};
    use super::*;
    use crate::index::ModerationView;

    fn uri(owner: &str, rkey: &str) -> ResourceUri {
        ResourceUri::parse(&subject(owner, rkey)).unwrap()
    }

    #[test]
    fn test_third_report_auto_hides_with_one_automated_audit_entry() {
        let f = fixture();
        let target = subject("did:plc:bob", "b1");
        let target_uri = uri("did:plc:bob", "b1");

        for (i, reporter) in ["did:plc:r1", "did:plc:r2"].iter().enumerate() {
            f.engine
                .submit_report_at(reporter, &target, "spam", at(i as i64))
                .unwrap();
            assert!(!f.engine.is_record_hidden(&target_uri));
        }

        let third = f
            .engine
            .submit_report_at("did:plc:r3", &target, "spam", at(2))
            .unwrap();
        assert!(f.engine.is_record_hidden(&target_uri));
        assert_eq!(third.status, ReportStatus::Actioned);

        let automated: Vec<_> = f
            .engine
            .list_audit(0)
            .unwrap()
            .into_iter()
            .filter(|e| e.automated)
            .collect();
        assert_eq!(automated.len(), 1);
        assert_eq!(automated[0].target, target_uri);
        assert_eq!(automated[0].actor, AUTOMOD_ACTOR);

        let hidden = f.engine.hidden_record(&target_uri).unwrap().unwrap();
        assert!(hidden.auto_hidden);
        assert_eq!(hidden.hidden_by, AUTOMOD_ACTOR);
        assert!(
            f.engine
                .list_reports(Some(ReportStatus::Pending), 0)
                .unwrap()
                .is_empty()
        );

        // Already hidden: a fourth report does not audit again.
        f.engine
            .submit_report_at("did:plc:r4", &target, "spam", at(3))
            .unwrap();
        let automated = f.engine.list_audit(0).unwrap().iter().filter(|e| e.automated).count();
        assert_eq!(automated, 1);
    }

    #[test]
    fn test_owner_threshold_hides_across_records() {
        let f = fixture_with(AutomodConfig {
            auto_hide_threshold: 0,
            auto_hide_owner_threshold: 2,
            ..Default::default()
        });
        f.engine
            .submit_report_at("did:plc:r1", &subject("did:plc:bob", "b1"), "spam", at(0))
            .unwrap();
        assert!(!f.engine.is_record_hidden(&uri("did:plc:bob", "b1")));

        f.engine
            .submit_report_at("did:plc:r2", &subject("did:plc:bob", "b2"), "spam", at(1))
            .unwrap();
        assert!(f.engine.is_record_hidden(&uri("did:plc:bob", "b2")));
        assert!(!f.engine.is_record_hidden(&uri("did:plc:bob", "b1")));
    }

    #[test]
    fn test_dismissed_reports_do_not_count() {
        let f = fixture();
        let target = subject("did:plc:bob", "b1");
        let first = f
            .engine
            .submit_report_at("did:plc:r1", &target, "spam", at(0))
            .unwrap();
        f.engine
            .submit_report_at("did:plc:r2", &target, "spam", at(1))
            .unwrap();
        f.engine
            .dismiss_report(MODERATOR, first.id, "not spam")
            .unwrap();

        f.engine
            .submit_report_at("did:plc:r3", &target, "spam", at(2))
            .unwrap();
        assert!(!f.engine.is_record_hidden(&uri("did:plc:bob", "b1")));
    }

    #[test]
    fn test_rehide_is_noop_and_unhide_restores_visibility() {
        let f = fixture();
        let target = uri("did:plc:bob", "b1");

        assert!(f.engine.hide_record(MODERATOR, &target, "spam").unwrap().is_some());
        assert!(f.engine.hide_record(MODERATOR, &target, "again").unwrap().is_none());
        assert_eq!(f.engine.list_audit(0).unwrap().len(), 1);
        assert_eq!(f.engine.list_hidden(0).unwrap().len(), 1);

        assert!(f.engine.unhide_record(MODERATOR, &target, "appeal").unwrap());
        assert!(!f.engine.is_record_hidden(&target));
        assert!(f.engine.list_hidden(0).unwrap().is_empty());
        assert!(!f.engine.unhide_record(MODERATOR, &target, "appeal").unwrap());
    }

    #[test]
    fn test_unhide_resets_record_threshold() {
        let f = fixture();
        let target = subject("did:plc:bob", "b1");
        let target_uri = uri("did:plc:bob", "b1");
        for (i, reporter) in ["did:plc:r1", "did:plc:r2", "did:plc:r3"].iter().enumerate() {
            f.engine
                .submit_report_at(reporter, &target, "spam", at(i as i64))
                .unwrap();
        }
        assert!(f.engine.is_record_hidden(&target_uri));
        assert!(f.engine.unhide_record(MODERATOR, &target_uri, "appeal").unwrap());

        // One new report does not override the moderator.
        let fourth = f
            .engine
            .submit_report_at("did:plc:r4", &target, "spam", at(10))
            .unwrap();
        assert_eq!(fourth.status, ReportStatus::Pending);
        assert!(!f.engine.is_record_hidden(&target_uri));

        // Earlier reports keep their status.
        let actioned = f
            .engine
            .list_reports(Some(ReportStatus::Actioned), 0)
            .unwrap();
        assert_eq!(actioned.len(), 3);

        // A fresh threshold's worth of reports hides it again.
        for (i, reporter) in ["did:plc:r5", "did:plc:r6"].iter().enumerate() {
            f.engine
                .submit_report_at(reporter, &target, "spam", at(11 + i as i64))
                .unwrap();
        }
        assert!(f.engine.is_record_hidden(&target_uri));
    }

    #[test]
    fn test_unhide_resets_owner_count_for_that_record() {
        let f = fixture_with(AutomodConfig {
            auto_hide_threshold: 0,
            auto_hide_owner_threshold: 2,
            ..Default::default()
        });
        let b1 = uri("did:plc:bob", "b1");
        f.engine.hide_record(MODERATOR, &b1, "manual").unwrap();
        f.engine
            .submit_report_at("did:plc:r1", &subject("did:plc:bob", "b1"), "spam", at(0))
            .unwrap();
        f.engine.unhide_record(MODERATOR, &b1, "appeal").unwrap();

        f.engine
            .submit_report_at("did:plc:r2", &subject("did:plc:bob", "b2"), "spam", at(1))
            .unwrap();
        assert!(!f.engine.is_record_hidden(&uri("did:plc:bob", "b2")));
    }

    #[test]
    fn test_manual_hide_actions_pending_reports() {
        let f = fixture();
        let report = f
            .engine
            .submit_report_at("did:plc:r1", &subject("did:plc:bob", "b1"), "spam", at(0))
            .unwrap();
        f.engine
            .hide_record(MODERATOR, &uri("did:plc:bob", "b1"), "confirmed")
            .unwrap();

        let stored = f.engine.get_report(report.id).unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Actioned);
    }

    #[test]
    fn test_only_moderators_hide() {
        let f = fixture();
        let err = f
            .engine
            .hide_record("did:plc:eve", &uri("did:plc:bob", "b1"), "spam")
            .unwrap_err();
        assert_eq!(
            err.rejection(),
            Some(&Rejection::NotModerator("did:plc:eve".to_string()))
        );
        assert!(f.engine.list_audit(0).unwrap().is_empty());
    }

    #[test]
    fn test_list_hidden_newest_first() {
        let f = fixture();
        let a = uri("did:plc:bob", "a");
        let b = uri("did:plc:bob", "b");
        {
            let _guard = f.engine.writer.lock();
            f.engine.hide_locked(&a, MODERATOR, "x", false, at(0)).unwrap();
            f.engine.hide_locked(&b, MODERATOR, "x", false, at(10)).unwrap();
        }
        let hidden = f.engine.list_hidden(0).unwrap();
        assert_eq!(hidden.iter().map(|h| h.uri.clone()).collect::<Vec<_>>(), vec![b, a]);
    }
}
