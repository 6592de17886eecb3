//! Wires ingest, roster indexing, planning and the batch executor together.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};

use bpre_adapters::RosterSource;
use bpre_core::{BatchReport, ReconciliationSummary};
use bpre_storage::RosterCache;
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::ReconcileConfig;
use crate::executor::run_bounded_with;
use crate::gateway::OptimisticMutationGateway;
use crate::plan::plan;
use crate::progress::ProgressTracker;
use crate::report::{build_report, write_reports};
use crate::roster::RosterIndexer;
use crate::session::{BatchJob, ReconcileSession, SessionState};
use crate::ReconcileError;

pub struct Reconciler {
    source: Arc<dyn RosterSource>,
    config: ReconcileConfig,
    caches: Mutex<HashMap<String, Arc<RosterCache>>>,
    executing: Arc<StdMutex<HashSet<String>>>,
}

/// Held while a batch runs against a store; releases the store on drop.
#[derive(Debug)]
pub struct StoreGuard {
    store_id: String,
    executing: Arc<StdMutex<HashSet<String>>>,
}

impl Drop for StoreGuard {
    fn drop(&mut self) {
        let mut executing = self.executing.lock().unwrap_or_else(|e| e.into_inner());
        executing.remove(&self.store_id);
    }
}

impl Reconciler {
    pub fn new(source: Arc<dyn RosterSource>, config: ReconcileConfig) -> Self {
        Self {
            source,
            config,
            caches: Mutex::new(HashMap::new()),
            executing: Arc::new(StdMutex::new(HashSet::new())),
        }
    }

    pub fn config(&self) -> &ReconcileConfig {
        &self.config
    }

    pub async fn cache_for(&self, store_id: &str) -> Arc<RosterCache> {
        let mut caches = self.caches.lock().await;
        caches
            .entry(store_id.to_string())
            .or_insert_with(|| Arc::new(RosterCache::new()))
            .clone()
    }

    fn indexer(&self) -> RosterIndexer<'_> {
        RosterIndexer::new(self.source.as_ref())
            .with_limits(self.config.page_size, self.config.max_pages)
    }

    /// Parse the upload, download the roster and plan the batch. Leaves the
    /// session `Ready`, or in `ParseError` / `Failed` with the error returned.
    pub async fn prepare(
        &self,
        session: &mut ReconcileSession,
        raw_text: &str,
    ) -> Result<ReconciliationSummary, ReconcileError> {
        session.parse_upload(raw_text)?;
        let (store_id, keys) = session.begin_matching()?;

        let (index, snapshot) = match self.indexer().build_index(&store_id, session.intent()).await {
            Ok(built) => built,
            Err(err) => {
                session.fail_matching(&err);
                return Err(err);
            }
        };

        // A running batch owns the cache until its closing resync.
        if self.is_claimed(&store_id) {
            debug!(store_id = %store_id, "batch in flight; cached roster left as is");
        } else {
            self.cache_for(&store_id)
                .await
                .replace(snapshot.records.clone())
                .await;
        }

        let planned = plan(&keys, &index);
        let summary = session.finish_matching(planned, &snapshot)?;
        info!(
            session_id = %session.id(),
            store_id = %store_id,
            roster = snapshot.records.len(),
            total_csv = summary.total_csv,
            found = summary.found,
            not_found = summary.not_found,
            targets = summary.to_deactivate_unique_count,
            "reconciliation ready"
        );
        Ok(summary)
    }

    /// Reserve `store_id` for one batch at a time.
    pub fn claim_store(&self, store_id: &str) -> Result<StoreGuard, ReconcileError> {
        let mut executing = self.executing.lock().unwrap_or_else(|e| e.into_inner());
        if !executing.insert(store_id.to_string()) {
            return Err(ReconcileError::SessionBusy);
        }
        Ok(StoreGuard {
            store_id: store_id.to_string(),
            executing: Arc::clone(&self.executing),
        })
    }

    fn is_claimed(&self, store_id: &str) -> bool {
        let executing = self.executing.lock().unwrap_or_else(|e| e.into_inner());
        executing.contains(store_id)
    }

    /// Run every target through the gateway with bounded concurrency, then
    /// resynchronise the cached roster from the source of truth.
    pub async fn run_batch(&self, job: &BatchJob, tracker: &ProgressTracker) -> BatchReport {
        let started_at = Utc::now();
        let cache = self.cache_for(&job.store_id).await;
        let gateway = OptimisticMutationGateway::new(Arc::clone(&self.source), Arc::clone(&cache));
        let active = job.intent.target_active();

        let tasks: Vec<_> = job
            .targets
            .iter()
            .map(|customer| gateway.set_active(customer, active))
            .collect();

        let span = info_span!(
            "batch",
            session_id = %job.session_id,
            store_id = %job.store_id,
            intent = job.intent.as_str(),
            targets = job.targets.len()
        );
        let results = run_bounded_with(tasks, self.config.concurrency, |_, _| {
            tracker.record();
        })
        .instrument(span)
        .await;
        let finished_at = Utc::now();

        let report = build_report(job, results, started_at, finished_at);
        info!(
            session_id = %job.session_id,
            store_id = %job.store_id,
            succeeded = report.succeeded,
            failed = report.failed,
            "batch finished"
        );

        self.resync(&job.store_id, &cache).await;

        if let Some(dir) = &self.config.reports_dir {
            if let Err(err) = write_reports(dir, &report).await {
                warn!(error = %format!("{err:#}"), "writing batch report failed");
            }
        }

        report
    }

    async fn resync(&self, store_id: &str, cache: &RosterCache) {
        match self.indexer().fetch_roster(store_id).await {
            Ok(snapshot) => cache.replace(snapshot.records).await,
            Err(err) => {
                cache.invalidate().await;
                warn!(store_id, error = %err, "roster resync failed; cache left stale");
            }
        }
    }

    /// Ready -> Executing -> Completed | PartiallyFailed for a session owned
    /// by the caller.
    pub async fn execute(
        &self,
        session: &mut ReconcileSession,
        tracker: Option<&ProgressTracker>,
    ) -> Result<BatchReport, ReconcileError> {
        if session.state() == SessionState::Executing {
            return Err(ReconcileError::SessionBusy);
        }
        let store_id = session.store_id().ok_or(ReconcileError::MissingStore)?.to_string();
        let _guard = self.claim_store(&store_id)?;
        let job = session.begin_execution()?;

        let own_tracker;
        let tracker = match tracker {
            Some(tracker) => tracker,
            None => {
                own_tracker = ProgressTracker::new(job.targets.len());
                &own_tracker
            }
        };

        let report = self.run_batch(&job, tracker).await;
        session.finish_execution(report.clone())?;
        Ok(report)
    }
}
