use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use bpre_adapters::{FixtureRosterSource, HttpRosterSource, RosterSource};
use bpre_core::BatchIntent;
use bpre_reconcile::{ProgressTracker, ReconcileConfig, ReconcileSession, Reconciler};
use bpre_storage::ApiClient;
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "bpre")]
#[command(about = "Bulk phone reconciliation and deactivation")]
struct Cli {
    /// Read the roster from a JSON fixture instead of the remote API.
    #[arg(long, global = true)]
    fixture: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match an upload against the roster without changing anything.
    Plan {
        #[arg(long)]
        store: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        reactivate: bool,
    },
    /// Match an upload and apply the state change to every matched customer.
    Deactivate {
        #[arg(long)]
        store: String,
        #[arg(long)]
        file: PathBuf,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        reactivate: bool,
    },
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ReconcileConfig::from_env()?;

    match cli.command {
        Commands::Plan {
            store,
            file,
            reactivate,
        } => {
            let reconciler = Reconciler::new(roster_source(cli.fixture.as_deref(), &config)?, config);
            let mut session = ReconcileSession::new(Some(&store), intent(reactivate));
            let raw = read_upload(&file).await?;
            let summary = reconciler.prepare(&mut session, &raw).await?;

            println!(
                "plan: store={} intent={} total_csv={} found={} not_found={} targets={}",
                store,
                session.intent().as_str(),
                summary.total_csv,
                summary.found,
                summary.not_found,
                summary.to_deactivate_unique_count
            );
            for customer in session.targets() {
                println!("  {}\t{}\t{}", customer.id, customer.phone_number, customer.first_name);
            }
        }
        Commands::Deactivate {
            store,
            file,
            concurrency,
            reactivate,
        } => {
            if let Some(k) = concurrency {
                config.concurrency = k.max(1);
            }
            let reconciler = Reconciler::new(roster_source(cli.fixture.as_deref(), &config)?, config);
            let mut session = ReconcileSession::new(Some(&store), intent(reactivate));
            let raw = read_upload(&file).await?;
            let summary = reconciler.prepare(&mut session, &raw).await?;
            info!(
                found = summary.found,
                not_found = summary.not_found,
                targets = summary.to_deactivate_unique_count,
                "matched upload"
            );

            let tracker = ProgressTracker::new(session.targets().len());
            let mut progress = tracker.subscribe();
            let watcher = tokio::spawn(async move {
                while progress.changed().await.is_ok() {
                    let state = *progress.borrow();
                    eprintln!("progress: {}/{}", state.done, state.total);
                }
            });

            let report = reconciler.execute(&mut session, Some(&tracker)).await?;
            drop(tracker);
            if let Err(err) = watcher.await {
                warn!(error = %err, "progress watcher stopped");
            }

            println!("{}", report.summary_line());
            for failure in &report.failures {
                println!(
                    "  failed {} ({}): {}",
                    failure.customer_id,
                    failure.phone_number,
                    failure.detail.as_deref().unwrap_or(&failure.message)
                );
            }
        }
        Commands::Serve => {
            let reconciler = Reconciler::new(roster_source(cli.fixture.as_deref(), &config)?, config);
            bpre_web::serve(reconciler).await?;
        }
    }

    Ok(())
}

fn intent(reactivate: bool) -> BatchIntent {
    if reactivate {
        BatchIntent::Reactivate
    } else {
        BatchIntent::Deactivate
    }
}

fn roster_source(fixture: Option<&Path>, config: &ReconcileConfig) -> Result<Arc<dyn RosterSource>> {
    match fixture {
        Some(path) => Ok(Arc::new(FixtureRosterSource::from_fixture_path(path)?)),
        None => {
            let client = ApiClient::new(config.api_client_config())?;
            Ok(Arc::new(HttpRosterSource::new(client)))
        }
    }
}

async fn read_upload(path: &Path) -> Result<String> {
    tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))
}
