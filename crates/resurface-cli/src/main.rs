use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use resurface_sync::{
    DiffRun, PlannedAction, RecoveryConfig, RecoveryPipeline, RestoreReport, RestoreStatus,
};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "resurface")]
#[command(about = "Recover content missing from the live store out of a snapshot archive")]
#[command(version)]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,

    /// Emit logs as JSON lines on stderr
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

// Flags take precedence over RESURFACE_* environment variables.
#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    snapshot: Option<PathBuf>,
    #[arg(long, global = true)]
    staging: Option<PathBuf>,
    #[arg(long, global = true)]
    reports_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    live_url: Option<String>,
    #[arg(long, global = true)]
    timeout_secs: Option<u64>,
    #[arg(long, global = true)]
    concurrency: Option<usize>,
}

impl Overrides {
    fn apply(self, mut config: RecoveryConfig) -> RecoveryConfig {
        if let Some(path) = self.snapshot {
            config.snapshot_path = path;
        }
        if let Some(path) = self.staging {
            config.staging_path = path;
        }
        if let Some(path) = self.reports_dir {
            config.reports_dir = path;
        }
        if let Some(url) = self.live_url {
            config.live_base_url = url;
        }
        if let Some(secs) = self.timeout_secs {
            config.http_timeout_secs = Some(secs);
        }
        if let Some(concurrency) = self.concurrency {
            config.restore_concurrency = concurrency;
        }
        config
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compare the snapshot with the live store and print what is missing
    Diff {
        /// Also stage the missing records for review
        #[arg(long)]
        write: bool,
    },
    /// Stage the missing records for review
    Extract,
    /// Upsert the reviewed staged records into the live store
    Restore {
        /// Show what would be created or updated without writing
        #[arg(long)]
        dry_run: bool,
    },
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("resurface=info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.json_logs);

    let config = cli.overrides.apply(RecoveryConfig::from_env());
    let pipeline = RecoveryPipeline::from_config(config)?;

    match cli.command {
        Commands::Diff { write } => {
            let run = pipeline.run_diff(write).await?;
            print_diff(&run);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Extract => {
            let run = pipeline.run_diff(true).await?;
            print_diff(&run);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restore { dry_run: true } => {
            for planned in pipeline.plan_restore().await? {
                let action = match &planned.action {
                    PlannedAction::Create => "create".to_string(),
                    PlannedAction::Update => "update".to_string(),
                    PlannedAction::Fail { reason } => format!("fail: {reason}"),
                };
                println!(
                    "[{}] {} ({}): {}",
                    planned.index,
                    planned.title,
                    planned.id.as_deref().unwrap_or("no id"),
                    action
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Restore { dry_run: false } => {
            let stop = Arc::new(AtomicBool::new(false));
            let stop_on_signal = Arc::clone(&stop);
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("interrupt received; finishing in-flight records");
                    stop_on_signal.store(true, Ordering::SeqCst);
                }
            });

            let report = pipeline.run_restore(stop).await?;
            print_restore(&report);
            if report.run.is_clean() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::from(2))
            }
        }
    }
}

fn print_diff(run: &DiffRun) {
    println!(
        "diff complete: run_id={} snapshot={} live={} matched_by_id={} matched_by_title={} missing={}",
        run.run_id,
        run.snapshot_records,
        run.live_records,
        run.diff.matched_by_id(),
        run.diff.matched_by_title(),
        run.diff.len()
    );
    for missing in &run.diff.missing {
        println!(
            "  missing [{}] {} ({})",
            missing.snapshot_index,
            missing.record.title,
            missing.record.stable_id().unwrap_or("no id")
        );
    }
    if let Some(artifact) = &run.artifact {
        println!(
            "staged: {} sha256={} ({} bytes); review it, then run `resurface restore`",
            artifact.path.display(),
            artifact.content_hash,
            artifact.byte_size
        );
    }
    if let Some(dir) = &run.report_dir {
        println!("report: {}", dir.display());
    }
}

fn print_restore(report: &RestoreReport) {
    let summary = report.run.summary();
    println!(
        "restore complete: run_id={} created={} updated={} failed={} not_attempted={}",
        report.run.run_id, summary.created, summary.updated, summary.failed, summary.not_attempted
    );
    for outcome in &report.run.outcomes {
        if let RestoreStatus::Failed { reason } = &outcome.status {
            println!(
                "  failed [{}] {} ({}): {}",
                outcome.index,
                outcome.title,
                outcome.id.as_deref().unwrap_or("no id"),
                reason
            );
        }
    }
    if let Some(dir) = &report.report_dir {
        println!("report: {}", dir.display());
    }
}
