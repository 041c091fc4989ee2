//! Download orchestration.
//!
//! [`download`] probes the target, then either splits it into ranges fetched
//! in parallel ([`download_parallel`]) or falls back to one sequential GET
//! ([`download_single`]). Both paths write to a staging file that is only
//! moved onto the destination once its size checks out.
use crate::error::{DownloadError, Result};
use crate::finalize::{self, PartFile};
use crate::observer::{ObserverFactory, ProgressObserver};
use crate::range::{self, ByteRange, DownloadTarget, FetchResult, MAX_WORKERS};
use crate::utils;
use crate::worker::{self, AttemptError, FetchOptions, RangeSink};
use futures_util::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::BufWriter;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How parallel ranges are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputLayout {
    /// Every range writes into one file pre-sized to the full length.
    #[default]
    SharedFile,
    /// Every range writes its own part file; parts are concatenated afterwards.
    PartFiles,
}

#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Requested worker count, clamped to [`MAX_WORKERS`].
    pub workers: usize,
    pub layout: OutputLayout,
    pub fetch: FetchOptions,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            layout: OutputLayout::default(),
            fetch: FetchOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    Parallel { workers: usize },
    SingleStream,
}

/// Summary of a completed download.
#[derive(Debug)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub bytes: u64,
    pub mode: DownloadMode,
    /// Per-range results, in range order. Empty in single-stream mode.
    pub results: Vec<FetchResult>,
    pub elapsed: Duration,
}

/// Where the workers of a parallel download write.
#[derive(Debug, Clone)]
pub enum OutputFile {
    /// One file of exactly the target length, shared by all workers.
    Shared { path: PathBuf },
    /// One `<dest>.part<i>` file per range.
    Parts { dest: PathBuf },
}

impl OutputFile {
    fn sink_for(&self, range: &ByteRange) -> RangeSink {
        match self {
            OutputFile::Shared { path } => RangeSink {
                path: path.clone(),
                base_offset: range.start,
            },
            OutputFile::Parts { dest } => RangeSink {
                path: finalize::part_path(dest, range.index),
                base_offset: 0,
            },
        }
    }

    /// Creates the files workers will open, at their final sizes.
    ///
    /// Workers only ever open existing files for writing, so this must run
    /// before any of them starts.
    pub async fn prepare(&self, ranges: &[ByteRange], total_length: u64) -> Result<()> {
        match self {
            OutputFile::Shared { path } => {
                let file = File::create(path).await?;
                file.set_len(total_length).await?;
            }
            OutputFile::Parts { dest } => {
                for range in ranges {
                    let file = File::create(finalize::part_path(dest, range.index)).await?;
                    file.set_len(range.len_within(total_length)).await?;
                }
            }
        }
        Ok(())
    }

    fn part_files(&self, ranges: &[ByteRange]) -> Vec<PartFile> {
        match self {
            OutputFile::Shared { .. } => Vec::new(),
            OutputFile::Parts { dest } => ranges
                .iter()
                .map(|r| PartFile {
                    range_index: r.index,
                    path: finalize::part_path(dest, r.index),
                })
                .collect(),
        }
    }
}

/// Downloads `url` to `dest`.
///
/// Probes the server first; uses parallel range fetches when the server
/// supports them, the length is known, and more than one worker is useful.
/// Otherwise falls back to a single stream. On any failure nothing is left at
/// `dest` and the staging files are removed.
pub async fn download(
    client: &Client,
    url: &str,
    dest: &Path,
    options: &DownloadOptions,
    progress: &dyn ObserverFactory,
    cancel: &CancellationToken,
) -> Result<DownloadReport> {
    let target = utils::probe_target(url, client, options.fetch.read_timeout).await?;
    let staging = finalize::staging_path(dest);
    let started = Instant::now();

    let (mode, outcome) = match target.parallel_workers(options.workers) {
        Some(workers) => {
            info!("downloading with {} workers", workers);
            let outcome =
                run_parallel(client, &target, dest, &staging, workers, options, progress, cancel)
                    .await;
            (DownloadMode::Parallel { workers }, outcome)
        }
        None => {
            info!(
                range_supported = target.range_supported,
                length = ?target.total_length,
                "downloading with a single stream"
            );
            let observer = progress.for_stream(target.total_length);
            let outcome = download_single(
                client,
                &target.url,
                &staging,
                &options.fetch,
                observer.as_ref(),
                cancel,
            )
            .await
            .map(|_| Vec::new());
            (DownloadMode::SingleStream, outcome)
        }
    };

    let committed = match outcome {
        Ok(results) => match finalize::verify_size(&staging, target.total_length).await {
            Ok(bytes) => finalize::commit(&staging, dest)
                .await
                .map(|()| (bytes, results)),
            Err(e) => Err(e),
        },
        Err(e) => Err(e),
    };

    let (bytes, results) = match committed {
        Ok(committed) => committed,
        Err(e) => {
            let mut leftovers = vec![staging.clone()];
            if options.layout == OutputLayout::PartFiles
                && let DownloadMode::Parallel { workers } = mode
                && let Some(length) = target.total_length
            {
                leftovers.extend(
                    range::partition(length, workers)
                        .iter()
                        .map(|r| finalize::part_path(dest, r.index)),
                );
            }
            finalize::discard(&leftovers).await;
            return Err(e);
        }
    };

    Ok(DownloadReport {
        path: dest.to_path_buf(),
        bytes,
        mode,
        results,
        elapsed: started.elapsed(),
    })
}

/// Partition, prepare, fetch and (for part files) combine into `staging`.
#[allow(clippy::too_many_arguments)]
async fn run_parallel(
    client: &Client,
    target: &DownloadTarget,
    dest: &Path,
    staging: &Path,
    workers: usize,
    options: &DownloadOptions,
    progress: &dyn ObserverFactory,
    cancel: &CancellationToken,
) -> Result<Vec<FetchResult>> {
    let length = target.total_length.unwrap_or(0);
    let ranges = range::partition(length, workers);
    debug!(
        "byte ranges: {:?}",
        ranges.iter().map(ToString::to_string).collect::<Vec<_>>()
    );

    let output = match options.layout {
        OutputLayout::SharedFile => OutputFile::Shared {
            path: staging.to_path_buf(),
        },
        OutputLayout::PartFiles => OutputFile::Parts {
            dest: dest.to_path_buf(),
        },
    };
    output.prepare(&ranges, length).await?;

    let results = download_parallel(
        client,
        target,
        &ranges,
        &output,
        workers,
        &options.fetch,
        progress,
        cancel,
    )
    .await?;

    let parts = output.part_files(&ranges);
    if !parts.is_empty() {
        finalize::combine_parts(&parts, staging, options.fetch.chunk_size).await?;
    }

    Ok(results)
}

/// Fetches every range concurrently, at most `min(workers, MAX_WORKERS)` at a
/// time.
///
/// `output` must already be prepared. The first failing range cancels the
/// others; this still waits for every worker to stop before returning that
/// first error, so no writer outlives the call.
#[allow(clippy::too_many_arguments)]
pub async fn download_parallel(
    client: &Client,
    target: &DownloadTarget,
    ranges: &[ByteRange],
    output: &OutputFile,
    workers: usize,
    options: &FetchOptions,
    progress: &dyn ObserverFactory,
    cancel: &CancellationToken,
) -> Result<Vec<FetchResult>> {
    let length = target.total_length.unwrap_or(0);
    let permits = Arc::new(Semaphore::new(workers.clamp(1, MAX_WORKERS)));
    let abort = cancel.child_token();
    let target = Arc::new(target.clone());
    let options = Arc::new(options.clone());

    let mut tasks = FuturesUnordered::new();

    for &range in ranges {
        let client = client.clone();
        let target = target.clone();
        let options = options.clone();
        let permits = permits.clone();
        let abort = abort.clone();
        let sink = output.sink_for(&range);
        let observer = progress.for_range(&range, range.len_within(length));

        let task = tokio::spawn(async move {
            let _permit = permits
                .acquire_owned()
                .await
                .map_err(|_| DownloadError::Cancelled)?;
            if abort.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            worker::fetch_range(
                &client,
                &target,
                range,
                &sink,
                &options,
                observer.as_ref(),
                &abort,
            )
            .await
        });

        tasks.push(task.map(move |joined| (range.index, joined)));
    }

    let mut results = Vec::with_capacity(ranges.len());
    let mut first_error: Option<DownloadError> = None;

    while let Some((index, joined)) = tasks.next().await {
        let outcome = joined.unwrap_or_else(|e| {
            Err(DownloadError::RangeFetch {
                range_index: index,
                cause: format!("worker panicked: {}", e),
            })
        });

        match outcome {
            Ok(result) => results.push(result),
            Err(e) if first_error.is_none() => {
                abort.cancel();
                first_error = Some(e);
            }
            Err(e) => debug!("range {} stopped after an earlier failure: {}", index, e),
        }
    }

    if let Some(e) = first_error {
        return Err(e);
    }

    results.sort_by_key(|r| r.range_index);
    let total: u64 = results.iter().map(|r| r.bytes_written).sum();
    if total != length {
        return Err(DownloadError::IncompleteDownload {
            expected: length,
            actual: total,
        });
    }

    Ok(results)
}

/// Streams the whole body with one plain GET into a freshly created `path`.
///
/// Without ranges there is no way to resume, so a transient failure restarts
/// the body from the first byte.
pub async fn download_single(
    client: &Client,
    url: &str,
    path: &Path,
    options: &FetchOptions,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut failures = 0u32;

    loop {
        let mut writer = BufWriter::with_capacity(options.chunk_size, File::create(path).await?);
        let mut written = 0u64;

        let result = async {
            let response = worker::send(client.get(url), options.read_timeout, cancel).await?;
            let status = response.status();
            if !status.is_success() {
                return Err(worker::classify_status(status));
            }
            worker::stream_body(
                response,
                &mut writer,
                &mut written,
                None,
                options.read_timeout,
                observer,
                cancel,
            )
            .await
        }
        .await;

        let cause = match result {
            Ok(()) => {
                observer.finish();
                return Ok(written);
            }
            Err(AttemptError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(AttemptError::Fatal(cause)) => return Err(DownloadError::SingleStream(cause)),
            Err(AttemptError::Transient(cause)) => cause,
        };

        failures += 1;
        if failures > options.max_retries {
            return Err(DownloadError::SingleStream(format!(
                "retries exhausted: {}",
                cause
            )));
        }

        warn!(
            "single-stream download failed after {} bytes: {}, restarting ({}/{})",
            written, cause, failures, options.max_retries
        );
        observer.reset();
        observer.message(format!("Retry #{}: {}", failures, cause));
        worker::backoff(options.retry_delay, cancel).await?;
    }
}
