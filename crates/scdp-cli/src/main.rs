use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use scdp_adapters::Scope;
use scdp_storage::CancelToken;
use scdp_sync::{diff_export_dirs, parse_formats, report_markdown, RunConfig, SyncPipeline};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "scdp")]
#[command(about = "Shariah Compliance Data Pipeline command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the pipeline once, or on the configured cron with --schedule.
    Sync(SyncArgs),
    /// Serve the JSON query API over the latest export.
    Serve {
        #[arg(long, env = "SCDP_WEB_PORT", default_value_t = 8000)]
        port: u16,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
        #[arg(long)]
        exports_dir: Option<PathBuf>,
    },
    /// Print the field-level delta between two export directories as JSON.
    Diff { previous: PathBuf, current: PathBuf },
    /// Summarize the most recent run reports as markdown.
    Report {
        #[arg(short = 'n', long, default_value_t = 5)]
        runs: usize,
        #[arg(long)]
        workspace_root: Option<PathBuf>,
    },
}

#[derive(Debug, Default, Args)]
struct SyncArgs {
    /// all, market:<key> or board:<key>
    #[arg(long)]
    scope: Option<Scope>,
    /// Comma-separated subset of json,csv,xlsx,xml,parquet
    #[arg(long)]
    formats: Option<String>,
    #[arg(long)]
    max_pages: Option<usize>,
    #[arg(long)]
    concurrency: Option<usize>,
    #[arg(long)]
    retry_limit: Option<usize>,
    #[arg(long)]
    confidence_threshold: Option<f64>,
    #[arg(long)]
    exports_dir: Option<PathBuf>,
    #[arg(long)]
    workspace_root: Option<PathBuf>,
    #[arg(long)]
    ocr_command: Option<String>,
    /// Keep running and sync on SCDP_SYNC_CRON until interrupted.
    #[arg(long)]
    schedule: bool,
}

impl SyncArgs {
    fn apply(self, mut config: RunConfig) -> Result<RunConfig> {
        if let Some(scope) = self.scope {
            config.scope = scope;
        }
        if let Some(formats) = self.formats {
            config.formats = parse_formats(&formats).context("parsing --formats")?;
        }
        if let Some(n) = self.max_pages {
            config.max_pages = n.max(1);
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n.max(1);
        }
        if let Some(n) = self.retry_limit {
            config.retry_limit = n;
        }
        if let Some(t) = self.confidence_threshold {
            anyhow::ensure!((0.0..=1.0).contains(&t), "--confidence-threshold must be within [0, 1]");
            config.confidence_threshold = t;
        }
        if let Some(dir) = self.exports_dir {
            config.exports_dir = dir;
        }
        if let Some(root) = self.workspace_root {
            config.workspace_root = root;
        }
        if let Some(cmd) = self.ocr_command {
            config.ocr_command = Some(cmd);
        }
        if self.schedule {
            config.scheduler_enabled = true;
        }
        Ok(config)
    }
}

async fn sync(args: SyncArgs) -> Result<()> {
    let config = args.apply(RunConfig::from_env()?)?;
    let pipeline = Arc::new(SyncPipeline::new(config)?);

    if let Some(mut sched) = pipeline.maybe_build_scheduler().await? {
        sched.start().await.context("starting scheduler")?;
        info!(cron = %pipeline.config().sync_cron, "scheduler running; ctrl-c to stop");
        tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
        sched.shutdown().await.context("stopping scheduler")?;
        return Ok(());
    }

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling run");
            on_interrupt.cancel();
        }
    });

    let summary = pipeline.run_once(&cancel).await?;
    println!(
        "sync complete: run_id={} records={} added={} removed={} changed={} skipped_documents={} dropped_records={} exports={} reports={}",
        summary.run_id,
        summary.records_exported,
        summary.added,
        summary.removed,
        summary.changed,
        summary.skipped.documents.len(),
        summary.skipped.records.len(),
        summary.exports_dir,
        summary.reports_dir
    );
    Ok(())
}

/// A missing `.env` is normal; anything else deserves a warning.
fn dotenv_problem(result: &dotenvy::Result<PathBuf>) -> Option<&dotenvy::Error> {
    match result {
        Err(e) if !e.not_found() => Some(e),
        _ => None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
    if let Some(e) = dotenv_problem(&dotenv) {
        warn!(error = %e, "ignoring unreadable .env file");
    }

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => sync(args).await?,
        Commands::Serve {
            port,
            workspace_root,
            exports_dir,
        } => {
            let mut state = scdp_web::AppState::new(workspace_root.unwrap_or_else(|| PathBuf::from(".")));
            if let Some(dir) = exports_dir.or_else(|| std::env::var("SCDP_EXPORTS_DIR").ok().map(PathBuf::from)) {
                state = state.with_exports_dir(dir);
            }
            scdp_web::serve(state, port).await?;
        }
        Commands::Diff { previous, current } => {
            let delta = diff_export_dirs(&previous, &current)?;
            println!("{}", serde_json::to_string_pretty(&delta)?);
        }
        Commands::Report { runs, workspace_root } => {
            print!("{}", report_markdown(runs, workspace_root)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scdp_sync::ExportFormat;

    fn sync_args(argv: &[&str]) -> SyncArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Some(Commands::Sync(args)) => args,
            other => panic!("expected sync, got {other:?}"),
        }
    }

    #[test]
    fn flags_override_environment_config() {
        let args = sync_args(&[
            "scdp",
            "sync",
            "--scope",
            "board:alrajhi",
            "--formats",
            "parquet,json",
            "--concurrency",
            "0",
        ]);
        let config = args.apply(RunConfig::default()).unwrap();
        assert_eq!(config.scope, Scope::Board("alrajhi".into()));
        assert_eq!(config.formats, vec![ExportFormat::Json, ExportFormat::Parquet]);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.max_pages, 20);
    }

    #[test]
    fn invalid_scope_is_rejected_by_the_parser() {
        assert!(Cli::try_parse_from(["scdp", "sync", "--scope", "sector:banks"]).is_err());
    }

    #[test]
    fn malformed_env_file_is_reported_but_a_missing_one_is_not() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dotenvy::from_path(dir.path().join(".env")).map(|_| dir.path().join(".env"));
        assert!(dotenv_problem(&missing).is_none());

        let path = dir.path().join(".env");
        std::fs::write(&path, "SCDP_SCOPE=all\nthis line has no equals sign\n").unwrap();
        let malformed = dotenvy::from_path_iter(&path)
            .and_then(|iter| iter.collect::<dotenvy::Result<Vec<_>>>())
            .map(|_| path.clone());
        assert!(dotenv_problem(&malformed).is_some());
    }

    #[test]
    fn out_of_range_threshold_is_an_error() {
        let args = sync_args(&["scdp", "sync", "--confidence-threshold", "1.5"]);
        assert!(args.apply(RunConfig::default()).is_err());
    }
}
