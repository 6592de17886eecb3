pub mod config;
pub mod executor;
pub mod gateway;
pub mod ingest;
pub mod pipeline;
pub mod plan;
pub mod progress;
pub mod report;
pub mod roster;
pub mod session;

use bpre_adapters::SourceError;
use thiserror::Error;

pub use config::ReconcileConfig;
pub use executor::{run_bounded, run_bounded_with, DEFAULT_CONCURRENCY};
pub use gateway::{MutationError, OptimisticMutationGateway};
pub use ingest::{parse as parse_upload, Delimiter, IngestResult};
pub use pipeline::{Reconciler, StoreGuard};
pub use plan::{plan, ReconciliationPlan};
pub use progress::ProgressTracker;
pub use report::{build_report, render_summary_markdown, upload_fingerprint, write_reports};
pub use roster::{PhoneIndex, RosterIndexer, RosterSnapshot};
pub use session::{BatchJob, IngestStats, ReconcileSession, SessionState, SessionView};

pub const CRATE_NAME: &str = "bpre-reconcile";

/// Errors that halt a session. Per-customer failures are [`MutationError`]s
/// and stay inside the batch report instead.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("no valid phone numbers found")]
    Parse,
    #[error("no store selected")]
    MissingStore,
    #[error("fetching roster for store {store_id} failed at page {page}: {source}")]
    RosterFetch {
        store_id: String,
        page: usize,
        #[source]
        source: SourceError,
    },
    #[error("invalid session transition {from} -> {to}")]
    InvalidTransition {
        from: SessionState,
        to: SessionState,
    },
    #[error("a batch is already executing for this store")]
    SessionBusy,
}

impl ReconcileError {
    /// Server-reported detail behind a roster failure, if any.
    pub fn detail(&self) -> Option<&str> {
        match self {
            ReconcileError::RosterFetch { source, .. } => source.detail(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roster_error_exposes_server_detail() {
        let err = ReconcileError::RosterFetch {
            store_id: "s1".into(),
            page: 3,
            source: SourceError::Rejected {
                message: "page 3 unavailable".into(),
                detail: Some("503 Service Unavailable".into()),
            },
        };
        assert_eq!(err.detail(), Some("503 Service Unavailable"));
        assert!(err.to_string().contains("page 3"));
        assert_eq!(ReconcileError::Parse.detail(), None);
    }
}
