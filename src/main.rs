//! CLI entry point for the readstash tool.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use readstash::{
    ArticleLimitQuota, AuthMaterial, ExportService, HttpContentClient, HttpListingClient,
    QuotaPolicy, ServiceConfig, SessionStore, StatusReport, TaskStatus, UnlimitedQuota,
};
use tracing::{debug, info, warn};

mod cli;

use cli::{Args, Command};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Determine log level based on verbose/quiet flags
    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (warn)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "warn",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();

    debug!(?args, "CLI arguments parsed");

    let token = args
        .resolve_token()
        .context("no access token: pass --token or set READSTASH_TOKEN")?;
    let auth = AuthMaterial::from_token(token);

    let store = Arc::new(SessionStore::new(&args.data_dir));
    let quota: Arc<dyn QuotaPolicy> = match &args.command {
        Command::Fetch { limit: Some(limit) } => Arc::new(ArticleLimitQuota::new(*limit)),
        _ => Arc::new(UnlimitedQuota),
    };

    let config = ServiceConfig::default();
    let content_timeout = config.download.request_timeout;
    let service = ExportService::new(
        store,
        Arc::new(HttpListingClient::new(&args.api_base)),
        Arc::new(HttpContentClient::new(content_timeout)),
        quota,
        config,
    );

    let session = service.open_session(&auth)?;
    info!(session = %session.id, "session ready");

    match args.command {
        Command::Fetch { .. } => run_fetch(&service, &session.id, args.quiet).await,
        Command::Download { ids } => run_download(&service, &session.id, ids, args.quiet).await,
        Command::Status => show_status(&service, &session.id),
        Command::Boost { count } => {
            let discarded = service.boost(&session.id, count).await?;
            println!("discarded {discarded} rate-window timestamps");
            Ok(())
        }
        Command::Delete { yes } => {
            if !yes {
                bail!("refusing to delete session state without --yes");
            }
            service.delete_session(&session.id).await?;
            println!("session deleted");
            Ok(())
        }
    }
}

/// Which task a progress wait tracks.
#[derive(Clone, Copy)]
enum TaskKind {
    Fetch,
    Download,
}

async fn run_fetch(service: &ExportService, session_id: &str, quiet: bool) -> Result<()> {
    service.start_fetch(session_id).await?;

    let bar = progress_bar(quiet);
    let status = wait_for(service, session_id, &bar, TaskKind::Fetch).await?;
    bar.finish_and_clear();

    match status.fetch.status {
        TaskStatus::Completed => {
            println!("fetch completed: {} articles on disk", status.articles_on_disk);
            Ok(())
        }
        TaskStatus::Stopped => {
            println!(
                "fetch stopped: {} ({} articles on disk)",
                status.fetch.error.unwrap_or_else(|| "user request".to_string()),
                status.articles_on_disk
            );
            Ok(())
        }
        _ => bail!(
            "fetch failed: {}",
            status.fetch.error.unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

async fn run_download(
    service: &ExportService,
    session_id: &str,
    ids: Vec<String>,
    quiet: bool,
) -> Result<()> {
    let ids = if ids.is_empty() {
        service.store().article_ids(session_id)?
    } else {
        ids
    };
    if ids.is_empty() {
        println!("no articles on disk yet; run `readstash fetch` first");
        return Ok(());
    }

    service.start_download(session_id, ids).await?;

    let bar = progress_bar(quiet);
    let status = wait_for(service, session_id, &bar, TaskKind::Download).await?;
    bar.finish_and_clear();

    match status.download.status {
        TaskStatus::Completed => {
            println!(
                "download completed: {}/{} articles have content",
                status.download.count, status.download.total
            );
            Ok(())
        }
        TaskStatus::Stopped => {
            println!("download stopped ({}/{})", status.download.count, status.download.total);
            Ok(())
        }
        _ => bail!(
            "download failed: {}",
            status
                .download
                .error
                .unwrap_or_else(|| "unknown error".to_string())
        ),
    }
}

fn show_status(service: &ExportService, session_id: &str) -> Result<()> {
    let status = service.get_status(session_id)?;

    println!("session          {}", status.session_id);
    println!(
        "fetch            {} ({}/{} articles)",
        status.fetch.status, status.fetch.count, status.fetch.total
    );
    if let Some(error) = &status.fetch.error {
        println!("fetch note       {error}");
    }
    println!(
        "download         {} ({}/{} articles)",
        status.download.status, status.download.count, status.download.total
    );
    if let Some(error) = &status.download.error {
        println!("download note    {error}");
    }
    println!("articles on disk {}", status.articles_on_disk);
    println!(
        "rate window      {}/{} requests{}",
        status.rate_limit.used,
        status.rate_limit.cap,
        if status.rate_limit.slow_mode { " (slow mode)" } else { "" }
    );
    println!("next request at  {}", status.rate_limit.next_allowed_at);
    println!("total size       {} bytes", status.total_size_bytes);
    Ok(())
}

/// Polls the persisted task state until it reaches a terminal status.
///
/// Ctrl-C requests a stop; the in-flight request is never pre-empted, so
/// the loop keeps polling until the orchestrator observes the stop.
async fn wait_for(
    service: &ExportService,
    session_id: &str,
    bar: &ProgressBar,
    kind: TaskKind,
) -> Result<StatusReport> {
    let mut stop_requested = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !stop_requested => {
                warn!("stop requested, waiting for the current operation to wind down");
                match kind {
                    TaskKind::Fetch => service.stop_fetch(session_id).await?,
                    TaskKind::Download => service.stop_download(session_id).await?,
                }
                stop_requested = true;
            }
            () = tokio::time::sleep(Duration::from_secs(1)) => {}
        }

        let status = service.get_status(session_id)?;
        let (count, total, task_status) = match kind {
            TaskKind::Fetch => (status.fetch.count, status.fetch.total, status.fetch.status),
            TaskKind::Download => (
                status.download.count,
                status.download.total,
                status.download.status,
            ),
        };

        bar.set_length(total.max(count));
        bar.set_position(count);
        if status.rate_limit.slow_mode {
            bar.set_message("slow mode");
        }

        if task_status.is_terminal() {
            return Ok(status);
        }
    }
}

fn progress_bar(quiet: bool) -> ProgressBar {
    if quiet {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template("{spinner} {pos}/{len} articles {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}
