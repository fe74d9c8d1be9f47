//! Rivven changefeed CLI
//!
//! Creates, updates, imports and cancels a CockroachDB changefeed job. The
//! job's record is kept in a JSON state file between invocations.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rivven_changefeed::postgres;
use rivven_changefeed::prelude::*;
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::fmt::format::FmtSpan;

/// Rivven changefeed manager
#[derive(Parser, Debug)]
#[command(name = "rivven-changefeed")]
#[command(about = "Manage the lifecycle of CockroachDB changefeed jobs")]
#[command(version)]
struct Args {
    /// Database connection URL
    #[arg(long, env = "RIVVEN_CHANGEFEED_URL")]
    url: Option<String>,

    /// State file holding the changefeed record
    #[arg(long, env = "RIVVEN_CHANGEFEED_STATE", default_value = "changefeed.json")]
    state: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: Level,

    /// Enable JSON log format
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    log_json: bool,

    /// Interval between job status reads
    #[arg(long, default_value = "1000")]
    poll_interval_ms: u64,

    /// Upper bound on a job status wait
    #[arg(long, default_value = "600")]
    wait_timeout_secs: u64,

    /// Leave the job paused when altering its tables fails
    #[arg(long)]
    no_resume_on_failure: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the job or converge it to a spec file
    Apply {
        /// YAML changefeed spec
        #[arg(long)]
        spec: PathBuf,
    },
    /// Refresh the record from the database
    Read,
    /// Adopt an existing job into the state file
    Import {
        /// Job id
        job_id: JobId,
    },
    /// Cancel the job
    Delete,
    /// Print whether the job is running
    Exists,
    /// Wait until the job reports a status
    Wait {
        /// Target status, e.g. `paused`
        status: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let config = ReconcilerConfig {
        poll_interval_ms: args.poll_interval_ms,
        wait_timeout_secs: args.wait_timeout_secs,
        resume_on_failure: !args.no_resume_on_failure,
    };
    config.check().context("Invalid reconciler settings")?;
    let reconciler = ChangefeedReconciler::new(config);

    let Some(url) = args.url.as_deref() else {
        bail!("No database URL given, use --url or RIVVEN_CHANGEFEED_URL");
    };
    let conn = postgres::connect(&ConnectionConfig::new(url))
        .await
        .context("Failed to connect to database")?;
    let conn = conn.as_ref();
    let store = FileRecordStore::new(&args.state);

    match args.command {
        Command::Apply { spec } => {
            let yaml = std::fs::read_to_string(&spec)
                .with_context(|| format!("Failed to read spec {}", spec.display()))?;
            let desired = ChangefeedSpec::from_yaml(&yaml).context("Invalid spec")?;

            let mut record = match load_record(&store).await? {
                Some(mut record) => {
                    let outcome = reconciler.read(conn, &mut record).await;
                    save_record(&store, &record).await?;
                    outcome?;
                    record
                }
                None => ChangefeedRecord::pending(desired.clone()),
            };
            let outcome = reconciler
                .apply_with_store(conn, &mut record, &desired, &store)
                .await;
            save_record(&store, &record).await?;
            match outcome? {
                ApplyOutcome::Created(id) => println!("created changefeed {}", id),
                ApplyOutcome::Recreated { previous, id, fields } => println!(
                    "replaced changefeed {} with {} ({} changed)",
                    previous,
                    id,
                    fields.join(", ")
                ),
                ApplyOutcome::Updated(_) => {
                    println!("updated changefeed {}", record.id_str())
                }
                ApplyOutcome::Unchanged => println!("changefeed {} unchanged", record.id_str()),
            }
        }
        Command::Read => {
            let mut record = require_record(&store).await?;
            let outcome = reconciler.read(conn, &mut record).await?;
            save_record(&store, &record).await?;
            match outcome {
                ReadOutcome::Refreshed(report) => {
                    for drift in &report.drift {
                        println!(
                            "{}: local '{}', remote '{}'",
                            drift.field, drift.local, drift.remote
                        );
                    }
                    if let Some(pending) = &report.pending_tables {
                        println!(
                            "tables: add {:?}, drop {:?}",
                            pending.to_add, pending.to_remove
                        );
                    }
                    if report.is_clean() {
                        println!("changefeed {} in sync", record.id_str());
                    }
                }
                ReadOutcome::Recreated { id, .. } => println!("recreated changefeed as {}", id),
            }
        }
        Command::Import { job_id } => {
            let (record, _) = reconciler.import(conn, job_id).await?;
            save_record(&store, &record).await?;
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Command::Delete => {
            let mut record = require_record(&store).await?;
            reconciler.delete(conn, &mut record).await?;
            save_record(&store, &record).await?;
            println!("changefeed cancelled");
        }
        Command::Exists => {
            let record = require_record(&store).await?;
            let exists = match &record.id {
                Some(id) => reconciler.exists(conn, id).await?,
                None => false,
            };
            println!("{}", exists);
        }
        Command::Wait { status } => {
            let record = require_record(&store).await?;
            let Some(id) = &record.id else {
                bail!("Changefeed has no job id");
            };
            let observed = reconciler.wait_for_status(conn, id, &status).await?;
            println!("{}", observed);
        }
    }

    info!("done");
    Ok(())
}

/// Initialize logging subsystem
fn init_logging(args: &Args) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(true)
        .with_writer(std::io::stderr);

    if args.log_json {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    Ok(())
}

async fn load_record(store: &FileRecordStore) -> Result<Option<ChangefeedRecord>> {
    store
        .load()
        .await
        .with_context(|| format!("Corrupt state file {}", store.path().display()))
}

async fn require_record(store: &FileRecordStore) -> Result<ChangefeedRecord> {
    load_record(store)
        .await?
        .with_context(|| format!("No state file at {}", store.path().display()))
}

async fn save_record(store: &FileRecordStore, record: &ChangefeedRecord) -> Result<()> {
    store
        .save(record)
        .await
        .with_context(|| format!("Failed to write state {}", store.path().display()))
}
