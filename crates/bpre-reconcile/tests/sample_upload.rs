use std::path::{Path, PathBuf};
use std::sync::Arc;

use bpre_adapters::FixtureRosterSource;
use bpre_core::BatchIntent;
use bpre_reconcile::{ReconcileConfig, ReconcileSession, Reconciler, SessionState};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../..")
}

fn reconciler(source: Arc<FixtureRosterSource>) -> Reconciler {
    let config = ReconcileConfig {
        reports_dir: None,
        concurrency: 2,
        ..Default::default()
    };
    Reconciler::new(source, config)
}

#[tokio::test]
async fn sample_upload_against_sample_store() {
    let root = workspace_root();
    let source = Arc::new(
        FixtureRosterSource::from_fixture_path(root.join("fixtures/roster/sample_store.json"))
            .expect("fixture"),
    );
    let raw = std::fs::read_to_string(root.join("fixtures/uploads/sample_upload.csv")).expect("upload");
    let reconciler = reconciler(source.clone());

    let mut session = ReconcileSession::new(Some("store-001"), BatchIntent::Deactivate);
    let summary = reconciler.prepare(&mut session, &raw).await.expect("prepare");

    let ingest = session.ingest_stats().expect("ingest");
    assert!(ingest.has_header);
    assert_eq!(ingest.phone_column, 1);
    assert_eq!(ingest.skipped_rows, 1);

    // Dev is already inactive and Ghost is not a customer; Cleo's number is
    // shared by two customers.
    assert_eq!(summary.total_csv, 5);
    assert_eq!(summary.found, 3);
    assert_eq!(summary.not_found, 2);
    assert_eq!(summary.to_deactivate_unique_count, 4);

    let report = reconciler.execute(&mut session, None).await.expect("execute");
    assert_eq!(report.summary_line(), "succeeded: 4, failed: 0");
    assert_eq!(session.state(), SessionState::Completed);

    let customers = source.customers().await;
    let active: Vec<_> = customers
        .iter()
        .filter(|c| c.active && c.stores.iter().any(|s| s == "store-001"))
        .map(|c| c.first_name.as_str())
        .collect();
    assert_eq!(active, vec!["No Phone", "No Id"]);
}

#[tokio::test]
async fn reactivating_the_same_upload_restores_only_inactive_matches() {
    let root = workspace_root();
    let source = Arc::new(
        FixtureRosterSource::from_fixture_path(root.join("fixtures/roster/sample_store.json"))
            .expect("fixture"),
    );
    let raw = std::fs::read_to_string(root.join("fixtures/uploads/sample_upload.csv")).expect("upload");
    let reconciler = reconciler(source.clone());

    let mut session = ReconcileSession::new(Some("store-001"), BatchIntent::Reactivate);
    let summary = reconciler.prepare(&mut session, &raw).await.expect("prepare");
    assert_eq!(summary.found, 1);
    assert_eq!(summary.to_deactivate_unique_count, 1);
    assert_eq!(session.targets()[0].id, "c-103");

    reconciler.execute(&mut session, None).await.expect("execute");
    assert_eq!(source.upsert_calls(), 1);
}
