//! One reconciliation session and its state machine.
//!
//! ```text
//! Idle -> Parsing -> ParseError | Parsed
//! Parsed -> Matching -> Ready | Failed
//! Ready -> Executing -> Completed | PartiallyFailed | Failed
//! ```
//!
//! Every step is a checked transition; a session never skips `Ready` and
//! cannot be re-entered while `Executing`. Parsed phone numbers are released
//! once matching starts and targets once the batch ends; only counters and
//! the report outlive their phase.

use std::fmt;

use bpre_core::{BatchIntent, BatchReport, CustomerRecord, PhoneKey, ReconciliationSummary};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::ingest::{self, Delimiter, IngestResult};
use crate::plan::ReconciliationPlan;
use crate::report::upload_fingerprint;
use crate::roster::RosterSnapshot;
use crate::ReconcileError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Parsing,
    ParseError,
    Parsed,
    Matching,
    Ready,
    Failed,
    Executing,
    Completed,
    PartiallyFailed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Parsing)
                | (Idle, Failed)
                | (Parsing, ParseError)
                | (Parsing, Parsed)
                | (Parsed, Matching)
                | (Matching, Ready)
                | (Matching, Failed)
                | (Ready, Executing)
                | (Executing, Completed)
                | (Executing, PartiallyFailed)
                | (Executing, Failed)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::ParseError
                | SessionState::Failed
                | SessionState::Completed
                | SessionState::PartiallyFailed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Parsing => "parsing",
            SessionState::ParseError => "parse_error",
            SessionState::Parsed => "parsed",
            SessionState::Matching => "matching",
            SessionState::Ready => "ready",
            SessionState::Failed => "failed",
            SessionState::Executing => "executing",
            SessionState::Completed => "completed",
            SessionState::PartiallyFailed => "partially_failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a batch run needs, detached from the session so the session
/// does not have to be borrowed while mutations are in flight.
#[derive(Debug, Clone)]
pub struct BatchJob {
    pub session_id: Uuid,
    pub store_id: String,
    pub intent: BatchIntent,
    pub upload_sha256: String,
    pub summary: ReconciliationSummary,
    pub targets: Vec<CustomerRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestStats {
    pub lines: usize,
    pub phone_numbers: usize,
    pub delimiter: Option<Delimiter>,
    pub has_header: bool,
    pub phone_column: usize,
    pub skipped_rows: usize,
}

impl From<&IngestResult> for IngestStats {
    fn from(result: &IngestResult) -> Self {
        Self {
            lines: result.raw_lines.len(),
            phone_numbers: result.phone_numbers.len(),
            delimiter: result.delimiter,
            has_header: result.has_header,
            phone_column: result.phone_column,
            skipped_rows: result.skipped_rows,
        }
    }
}

/// Serializable view for the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub id: Uuid,
    pub store_id: Option<String>,
    pub intent: BatchIntent,
    pub state: SessionState,
    pub created_at: DateTime<Utc>,
    pub ingest: Option<IngestStats>,
    pub summary: Option<ReconciliationSummary>,
    pub roster_size: usize,
    pub report: Option<BatchReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ReconcileSession {
    id: Uuid,
    store_id: Option<String>,
    intent: BatchIntent,
    state: SessionState,
    created_at: DateTime<Utc>,
    upload_sha256: Option<String>,
    ingest: Option<IngestResult>,
    ingest_stats: Option<IngestStats>,
    summary: Option<ReconciliationSummary>,
    targets: Vec<CustomerRecord>,
    roster_size: usize,
    report: Option<BatchReport>,
    error: Option<String>,
}

impl ReconcileSession {
    pub fn new(store_id: Option<&str>, intent: BatchIntent) -> Self {
        Self {
            id: Uuid::new_v4(),
            store_id: store_id
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            intent,
            state: SessionState::Idle,
            created_at: Utc::now(),
            upload_sha256: None,
            ingest: None,
            ingest_stats: None,
            summary: None,
            targets: Vec::new(),
            roster_size: 0,
            report: None,
            error: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn store_id(&self) -> Option<&str> {
        self.store_id.as_deref()
    }

    pub fn intent(&self) -> BatchIntent {
        self.intent
    }

    pub fn ingest_stats(&self) -> Option<&IngestStats> {
        self.ingest_stats.as_ref()
    }

    pub fn summary(&self) -> Option<ReconciliationSummary> {
        self.summary
    }

    pub fn targets(&self) -> &[CustomerRecord] {
        &self.targets
    }

    pub fn report(&self) -> Option<&BatchReport> {
        self.report.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    fn advance(&mut self, next: SessionState) -> Result<(), ReconcileError> {
        if !self.state.can_transition_to(next) {
            return Err(ReconcileError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Idle -> Parsing -> Parsed. No store or no usable phone number halts the
    /// session here, before anything touches the network.
    pub fn parse_upload(&mut self, raw_text: &str) -> Result<IngestStats, ReconcileError> {
        if self.state == SessionState::Idle && self.store_id.is_none() {
            let err = ReconcileError::MissingStore;
            self.error = Some(err.to_string());
            self.advance(SessionState::Failed)?;
            return Err(err);
        }

        self.advance(SessionState::Parsing)?;
        self.upload_sha256 = Some(upload_fingerprint(raw_text.as_bytes()));

        let parsed = ingest::parse(raw_text);
        let stats = IngestStats::from(&parsed);
        self.ingest_stats = Some(stats.clone());

        match parsed.require_phones() {
            Ok(result) => {
                self.advance(SessionState::Parsed)?;
                self.ingest = Some(result);
                Ok(stats)
            }
            Err(err) => {
                self.error = Some(err.to_string());
                self.advance(SessionState::ParseError)?;
                Err(err)
            }
        }
    }

    /// Parsed -> Matching. Hands back the store and keys to match.
    pub fn begin_matching(&mut self) -> Result<(String, Vec<PhoneKey>), ReconcileError> {
        self.advance(SessionState::Matching)?;
        let store_id = self.store_id.clone().ok_or(ReconcileError::MissingStore)?;
        let keys = self
            .ingest
            .take()
            .map(|i| i.phone_numbers)
            .unwrap_or_default();
        Ok((store_id, keys))
    }

    /// Matching -> Ready.
    pub fn finish_matching(
        &mut self,
        plan: ReconciliationPlan,
        snapshot: &RosterSnapshot,
    ) -> Result<ReconciliationSummary, ReconcileError> {
        self.advance(SessionState::Ready)?;
        let by_id = snapshot.records_by_id();
        self.targets = plan
            .target_ids
            .iter()
            .filter_map(|id| by_id.get(id.as_str()).map(|r| (*r).clone()))
            .collect();
        self.roster_size = snapshot.records.len();
        self.summary = Some(plan.summary);
        Ok(plan.summary)
    }

    /// Matching -> Failed.
    pub fn fail_matching(&mut self, err: &ReconcileError) {
        self.error = Some(err.to_string());
        if self.advance(SessionState::Failed).is_err() {
            tracing::debug!(state = %self.state, "fail_matching outside Matching ignored");
        }
    }

    /// Ready -> Executing.
    pub fn begin_execution(&mut self) -> Result<BatchJob, ReconcileError> {
        if self.state == SessionState::Executing {
            return Err(ReconcileError::SessionBusy);
        }
        self.advance(SessionState::Executing)?;
        Ok(BatchJob {
            session_id: self.id,
            store_id: self.store_id.clone().unwrap_or_default(),
            intent: self.intent,
            upload_sha256: self.upload_sha256.clone().unwrap_or_default(),
            summary: self.summary().unwrap_or_default(),
            targets: self.targets.clone(),
        })
    }

    /// Executing -> Completed | PartiallyFailed.
    pub fn finish_execution(&mut self, report: BatchReport) -> Result<SessionState, ReconcileError> {
        let next = if report.is_clean() {
            SessionState::Completed
        } else {
            SessionState::PartiallyFailed
        };
        self.advance(next)?;
        self.report = Some(report);
        self.targets = Vec::new();
        Ok(next)
    }

    /// Executing -> Failed, for a batch that ended without a report.
    pub fn abort_execution(&mut self, message: &str) -> Result<(), ReconcileError> {
        self.advance(SessionState::Failed)?;
        self.error = Some(message.to_string());
        self.targets = Vec::new();
        Ok(())
    }

    pub fn view(&self) -> SessionView {
        SessionView {
            id: self.id,
            store_id: self.store_id.clone(),
            intent: self.intent,
            state: self.state,
            created_at: self.created_at,
            ingest: self.ingest_stats.clone(),
            summary: self.summary(),
            roster_size: self.roster_size,
            report: self.report.clone(),
            error: self.error.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::plan;
    use crate::roster::PhoneIndex;

    fn customer(id: &str, phone: &str) -> CustomerRecord {
        CustomerRecord {
            id: id.into(),
            phone_number: phone.into(),
            first_name: String::new(),
            country_code: None,
            stores: vec!["s1".into()],
            active: true,
        }
    }

    fn ready_session() -> ReconcileSession {
        let mut session = ReconcileSession::new(Some("s1"), BatchIntent::Deactivate);
        session.parse_upload("phone\n5551234567\n5550000000").expect("parse");
        let (_, keys) = session.begin_matching().expect("matching");
        let snapshot = RosterSnapshot {
            store_id: "s1".into(),
            records: vec![customer("a", "5551234567"), customer("b", "5559999999")],
            ..Default::default()
        };
        let index = PhoneIndex::for_intent(&snapshot.records, BatchIntent::Deactivate);
        session
            .finish_matching(plan(&keys, &index), &snapshot)
            .expect("ready");
        session
    }

    fn report_for(job: &BatchJob, failed: usize) -> BatchReport {
        BatchReport {
            session_id: job.session_id,
            store_id: job.store_id.clone(),
            intent: job.intent,
            upload_sha256: job.upload_sha256.clone(),
            summary: job.summary,
            total: job.targets.len(),
            succeeded: job.targets.len() - failed,
            failed,
            failures: Vec::new(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[test]
    fn happy_path_walks_every_state() {
        let mut session = ready_session();
        assert_eq!(session.state(), SessionState::Ready);
        assert_eq!(session.targets().len(), 1);
        assert_eq!(session.summary().map(|s| s.found), Some(1));

        let job = session.begin_execution().expect("executing");
        assert_eq!(job.targets[0].id, "a");
        assert_eq!(job.upload_sha256.len(), 64);
        assert_eq!(session.state(), SessionState::Executing);

        let state = session.finish_execution(report_for(&job, 0)).expect("done");
        assert_eq!(state, SessionState::Completed);
        assert!(session.state().is_terminal());
    }

    #[test]
    fn finished_session_keeps_counters_only() {
        let mut session = ready_session();
        assert!(session.ingest.is_none());
        assert_eq!(session.ingest_stats().map(|s| s.phone_numbers), Some(2));

        let job = session.begin_execution().expect("executing");
        session.finish_execution(report_for(&job, 0)).expect("done");
        assert!(session.targets().is_empty());

        let view = session.view();
        assert_eq!(view.summary.map(|s| s.found), Some(1));
        assert_eq!(view.ingest.map(|s| s.lines), Some(3));
        assert!(view.report.is_some());
    }

    #[test]
    fn aborted_batch_ends_failed() {
        let mut session = ready_session();
        session.begin_execution().expect("executing");
        session.abort_execution("batch task panicked").expect("failed");
        assert_eq!(session.state(), SessionState::Failed);
        assert_eq!(session.error(), Some("batch task panicked"));
        assert!(session.targets().is_empty());
        assert!(session.report().is_none());
    }

    #[test]
    fn abort_requires_executing() {
        let mut session = ready_session();
        assert!(matches!(
            session.abort_execution("nope"),
            Err(ReconcileError::InvalidTransition {
                from: SessionState::Ready,
                to: SessionState::Failed
            })
        ));
    }

    #[test]
    fn failures_end_in_partially_failed() {
        let mut session = ready_session();
        let job = session.begin_execution().expect("executing");
        let state = session.finish_execution(report_for(&job, 1)).expect("done");
        assert_eq!(state, SessionState::PartiallyFailed);
        assert_eq!(session.view().report.map(|r| r.failed), Some(1));
    }

    #[test]
    fn executing_session_cannot_be_reentered() {
        let mut session = ready_session();
        session.begin_execution().expect("executing");
        assert!(matches!(
            session.begin_execution(),
            Err(ReconcileError::SessionBusy)
        ));
    }

    #[test]
    fn execution_requires_ready() {
        let mut session = ReconcileSession::new(Some("s1"), BatchIntent::Deactivate);
        session.parse_upload("5551234567").expect("parse");
        assert!(matches!(
            session.begin_execution(),
            Err(ReconcileError::InvalidTransition {
                from: SessionState::Parsed,
                to: SessionState::Executing
            })
        ));
    }

    #[test]
    fn missing_store_fails_before_parsing() {
        let mut session = ReconcileSession::new(Some("   "), BatchIntent::Deactivate);
        assert!(matches!(
            session.parse_upload("5551234567"),
            Err(ReconcileError::MissingStore)
        ));
        assert_eq!(session.state(), SessionState::Failed);
        assert!(session.ingest_stats().is_none());
    }

    #[test]
    fn header_only_upload_is_a_parse_error() {
        let mut session = ReconcileSession::new(Some("s1"), BatchIntent::Deactivate);
        assert!(matches!(
            session.parse_upload("phone\n"),
            Err(ReconcileError::Parse)
        ));
        assert_eq!(session.state(), SessionState::ParseError);
        assert_eq!(session.error(), Some("no valid phone numbers found"));
        assert_eq!(session.ingest_stats().map(|s| s.phone_numbers), Some(0));
        assert!(session.begin_matching().is_err());
    }
}
