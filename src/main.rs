use anyhow::{Context, Result, anyhow};
use clap::Parser;
use indicatif::{MultiProgress, ProgressDrawTarget};
use splitfetch::config::Settings;
use splitfetch::observer::{ConsoleProgress, NoopObserver, ObserverFactory};
use splitfetch::utils::{self, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT};
use splitfetch::worker::{CHUNK_SIZE, DEFAULT_RETRY_DELAY, MAX_RETRIES};
use splitfetch::{Args, DownloadMode, DownloadOptions, FetchOptions, MAX_WORKERS, OutputLayout};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Merges flags over settings over built-in defaults.
fn download_options(args: &Args, settings: &Settings) -> DownloadOptions {
    let requested = args.threads.or(settings.threads).unwrap_or(4);
    if requested > MAX_WORKERS {
        warn!("{} workers requested, capping at {}", requested, MAX_WORKERS);
    }

    let layout = if args.part_files || settings.part_files.unwrap_or(false) {
        OutputLayout::PartFiles
    } else {
        OutputLayout::SharedFile
    };

    DownloadOptions {
        workers: requested.min(MAX_WORKERS),
        layout,
        fetch: FetchOptions {
            chunk_size: args
                .chunk_size
                .or(settings.chunk_size)
                .unwrap_or(CHUNK_SIZE)
                .max(1),
            max_retries: args.retries.or(settings.retries).unwrap_or(MAX_RETRIES),
            retry_delay: settings
                .retry_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_RETRY_DELAY),
            read_timeout: settings
                .read_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_READ_TIMEOUT),
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let settings = Settings::load().unwrap_or_default();
    let options = download_options(&args, &settings);

    let filename = args
        .output
        .clone()
        .unwrap_or_else(|| utils::get_filename_from_url(&args.url));
    let dir = args
        .dir
        .clone()
        .or(settings.default_dir.clone())
        .unwrap_or_else(|| ".".to_string());

    if dir != "." {
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("Failed to create {}", dir))?;
    }
    let mut output_path = PathBuf::from(&dir);
    output_path.push(&filename);

    let connect_timeout = settings
        .connect_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);
    let client = utils::build_client(connect_timeout)?;

    let cancel_token = CancellationToken::new();
    let signal_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nReceived Ctrl+C, stopping workers...");
            signal_token.cancel();
        }
    });

    let progress: Box<dyn ObserverFactory> = if args.quiet {
        Box::new(NoopObserver)
    } else {
        Box::new(ConsoleProgress::new(MultiProgress::with_draw_target(
            ProgressDrawTarget::stderr(),
        )))
    };

    info!("Starting download for: {}", args.url);

    let report = splitfetch::download(
        &client,
        &args.url,
        &output_path,
        &options,
        progress.as_ref(),
        &cancel_token,
    )
    .await
    .map_err(|e| anyhow!("{} stage failed: {}", e.stage(), e))?;

    let mode = match report.mode {
        DownloadMode::Parallel { workers } => format!("{} workers", workers),
        DownloadMode::SingleStream => "a single stream".to_string(),
    };
    println!(
        "Downloaded {} ({} bytes) using {} in {:.2} seconds.",
        report.path.display(),
        report.bytes,
        mode,
        report.elapsed.as_secs_f64()
    );

    Ok(())
}
