//! The chunked range fetcher.
//!
//! A worker streams one [`ByteRange`] from the server and writes it into the
//! output file at the range's own offset. Each worker opens its own handle on
//! the output path, so no cursor or lock is shared between workers; the
//! disjoint ranges are what keep their writes apart.
use crate::error::{DownloadError, Result};
use crate::observer::ProgressObserver;
use crate::range::{ByteRange, DownloadTarget, FetchResult};
use crate::utils::DEFAULT_READ_TIMEOUT;
use reqwest::header::RANGE;
use reqwest::{Client, Response, StatusCode};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, instrument, warn};

/// Default write buffer size. Peak memory per worker stays around this bound
/// plus one network frame, whatever the size of the range.
pub const CHUNK_SIZE: usize = 4096;

/// Retries allowed per range after transient failures.
pub const MAX_RETRIES: u32 = 5;

pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(2);

/// Tunables for the fetch loop.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub chunk_size: usize,
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// Longest wait for response headers or for the next body frame.
    pub read_timeout: Duration,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_retries: MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
            read_timeout: DEFAULT_READ_TIMEOUT,
        }
    }
}

/// Where the bytes of a range land: byte `n` of the range goes to
/// `base_offset + n` of `path`.
#[derive(Debug, Clone)]
pub struct RangeSink {
    pub path: PathBuf,
    pub base_offset: u64,
}

/// Why a single attempt stopped.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Worth retrying: connection trouble, stalls, short bodies, 5xx.
    Transient(String),
    Fatal(String),
    Cancelled,
}

/// Downloads one range into its sink, retrying the unwritten suffix of the
/// range after transient failures.
///
/// # Errors
///
/// Returns [`DownloadError::RangeFetch`] once the retry budget is spent or a
/// non-retryable failure occurs, and [`DownloadError::Cancelled`] if `cancel`
/// fires first.
#[instrument(skip_all, fields(range = range.index))]
pub async fn fetch_range(
    client: &Client,
    target: &DownloadTarget,
    range: ByteRange,
    sink: &RangeSink,
    options: &FetchOptions,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> Result<FetchResult> {
    let expected = target.total_length.map(|len| range.len_within(len));
    let mut written = 0u64;
    let mut failures = 0u32;

    debug!("fetching bytes {} ({:?} bytes)", range, expected);

    loop {
        let result = fetch_attempt(
            client,
            &target.url,
            range,
            sink,
            &mut written,
            expected,
            options,
            observer,
            cancel,
        )
        .await;

        let cause = match result {
            Ok(()) => break,
            Err(AttemptError::Cancelled) => return Err(DownloadError::Cancelled),
            Err(AttemptError::Fatal(cause)) => {
                error!("range {} failed: {}", range, cause);
                observer.message(format!("Failed: {}", cause));
                return Err(DownloadError::RangeFetch {
                    range_index: range.index,
                    cause,
                });
            }
            Err(AttemptError::Transient(cause)) => cause,
        };

        failures += 1;
        if failures > options.max_retries {
            error!("range {} gave up after {} retries: {}", range, options.max_retries, cause);
            observer.message(format!("Failed: {}", cause));
            return Err(DownloadError::RangeFetch {
                range_index: range.index,
                cause: format!("retries exhausted: {}", cause),
            });
        }

        warn!(
            "range {}: {} ({} bytes written), retry {}/{}",
            range, cause, written, failures, options.max_retries
        );
        observer.message(format!("Retry #{}: {}", failures, cause));
        backoff(options.retry_delay, cancel).await?;
    }

    observer.finish();
    debug!("range {} complete, {} bytes", range, written);

    Ok(FetchResult {
        range_index: range.index,
        bytes_written: written,
    })
}

/// One request for the still-missing suffix of `range`.
#[allow(clippy::too_many_arguments)]
async fn fetch_attempt(
    client: &Client,
    url: &str,
    range: ByteRange,
    sink: &RangeSink,
    written: &mut u64,
    expected: Option<u64>,
    options: &FetchOptions,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> std::result::Result<(), AttemptError> {
    let header = range.header_value(*written);
    debug!("GET {} with Range: {}", url, header);

    let request = client.get(url).header(RANGE, header);
    let response = send(request, options.read_timeout, cancel).await?;

    match response.status() {
        StatusCode::PARTIAL_CONTENT => {}
        StatusCode::OK => {
            return Err(AttemptError::Fatal(
                "server ignored the range request (200 OK)".into(),
            ));
        }
        status => return Err(classify_status(status)),
    }

    let mut file = OpenOptions::new()
        .write(true)
        .open(&sink.path)
        .await
        .map_err(|e| AttemptError::Fatal(format!("failed to open output file: {}", e)))?;
    file.seek(SeekFrom::Start(sink.base_offset + *written))
        .await
        .map_err(|e| AttemptError::Fatal(e.to_string()))?;

    let mut writer = BufWriter::with_capacity(options.chunk_size, file);
    stream_body(
        response,
        &mut writer,
        written,
        expected,
        options.read_timeout,
        observer,
        cancel,
    )
    .await
}

/// Sends `request`, bounding the wait for response headers.
pub(crate) async fn send(
    request: reqwest::RequestBuilder,
    read_timeout: Duration,
    cancel: &CancellationToken,
) -> std::result::Result<Response, AttemptError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(AttemptError::Cancelled),
        res = timeout(read_timeout, request.send()) => match res {
            Err(_) => Err(AttemptError::Transient(format!(
                "no response within {:?}",
                read_timeout
            ))),
            Ok(Err(e)) => Err(AttemptError::Transient(e.to_string())),
            Ok(Ok(response)) => Ok(response),
        },
    }
}

/// Maps an unexpected status onto retry semantics.
pub(crate) fn classify_status(status: StatusCode) -> AttemptError {
    let msg = format!("unexpected status code {}", status);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        AttemptError::Transient(msg)
    } else {
        AttemptError::Fatal(msg)
    }
}

/// Copies a response body into `writer` frame by frame.
///
/// `written` counts bytes handed to the writer and is advanced in step with
/// it. Before returning a transient error the writer is flushed, so on retry
/// `written` is exactly what landed on disk. When `limit` is known, surplus
/// bytes are dropped and a body ending short of it is a transient error.
pub(crate) async fn stream_body<W>(
    mut response: Response,
    writer: &mut W,
    written: &mut u64,
    limit: Option<u64>,
    read_timeout: Duration,
    observer: &dyn ProgressObserver,
    cancel: &CancellationToken,
) -> std::result::Result<(), AttemptError>
where
    W: AsyncWrite + Unpin,
{
    let outcome = loop {
        if limit.is_some_and(|limit| *written >= limit) {
            break Ok(());
        }

        let next = tokio::select! {
            _ = cancel.cancelled() => return Err(AttemptError::Cancelled),
            next = timeout(read_timeout, response.chunk()) => next,
        };

        let bytes = match next {
            Err(_) => {
                break Err(AttemptError::Transient(format!(
                    "read stalled for {:?}",
                    read_timeout
                )));
            }
            Ok(Err(e)) => break Err(AttemptError::Transient(e.to_string())),
            Ok(Ok(None)) => match limit {
                Some(limit) if *written < limit => {
                    break Err(AttemptError::Transient(format!(
                        "body ended early at {} of {} bytes",
                        written, limit
                    )));
                }
                _ => break Ok(()),
            },
            Ok(Ok(Some(bytes))) => bytes,
        };

        let take = match limit {
            Some(limit) => bytes
                .len()
                .min(usize::try_from(limit - *written).unwrap_or(usize::MAX)),
            None => bytes.len(),
        };

        if let Err(e) = writer.write_all(&bytes[..take]).await {
            return Err(AttemptError::Fatal(format!("write failed: {}", e)));
        }
        *written += take as u64;
        observer.inc(take as u64);
    };

    writer
        .flush()
        .await
        .map_err(|e| AttemptError::Fatal(format!("flush failed: {}", e)))?;

    outcome
}

/// Waits out the retry delay unless cancelled first.
pub(crate) async fn backoff(delay: Duration, cancel: &CancellationToken) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(DownloadError::Cancelled),
        _ = sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::NoopObserver;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::NamedTempFile;
    use wiremock::matchers::{header, method};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    fn quick_options() -> FetchOptions {
        FetchOptions {
            retry_delay: Duration::from_millis(10),
            read_timeout: Duration::from_secs(5),
            ..FetchOptions::default()
        }
    }

    fn presized_file(len: u64) -> NamedTempFile {
        let file = NamedTempFile::new().unwrap();
        file.as_file().set_len(len).unwrap();
        file
    }

    /// Fails with 503 a fixed number of times, then serves the body.
    struct FlakyResponder {
        failures_left: AtomicUsize,
        body: &'static str,
    }

    impl Respond for FlakyResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                ResponseTemplate::new(503)
            } else {
                ResponseTemplate::new(206).set_body_string(self.body)
            }
        }
    }

    /// Counts calls; the first one answers only after `first_delay`.
    struct SlowFirstResponder {
        calls: Arc<AtomicUsize>,
        first_delay: Duration,
        body: &'static str,
    }

    impl Respond for SlowFirstResponder {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let template = ResponseTemplate::new(206).set_body_string(self.body);
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                template.set_delay(self.first_delay)
            } else {
                template
            }
        }
    }

    #[test]
    fn test_classify_status() {
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE),
            AttemptError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            AttemptError::Transient(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN),
            AttemptError::Fatal(_)
        ));
    }

    #[tokio::test]
    async fn test_fetch_range_writes_at_offset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=5-9"))
            .respond_with(ResponseTemplate::new(206).set_body_string("World"))
            .mount(&server)
            .await;

        let file = presized_file(10);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(10),
            range_supported: true,
        };
        let range = ByteRange {
            index: 1,
            start: 5,
            end: Some(9),
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 5,
        };

        let result = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &quick_options(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.range_index, 1);
        assert_eq!(result.bytes_written, 5);
        let content = std::fs::read(file.path()).unwrap();
        assert_eq!(&content[5..], b"World");
        assert_eq!(&content[..5], &[0u8; 5]);
    }

    #[tokio::test]
    async fn test_fetch_range_retries_transient_status() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(FlakyResponder {
                failures_left: AtomicUsize::new(2),
                body: "Hello",
            })
            .mount(&server)
            .await;

        let file = presized_file(5);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(5),
            range_supported: true,
        };
        let range = ByteRange {
            index: 0,
            start: 0,
            end: Some(4),
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 0,
        };

        let result = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &quick_options(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.bytes_written, 5);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"Hello");
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_range_gives_up_after_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let file = presized_file(5);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(5),
            range_supported: true,
        };
        let range = ByteRange {
            index: 2,
            start: 0,
            end: None,
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 0,
        };
        let options = FetchOptions {
            max_retries: 2,
            ..quick_options()
        };

        let err = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &options,
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::RangeFetch { range_index: 2, .. }));
        // One initial attempt plus two retries.
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_range_rejects_ignored_range() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("HelloWorld"))
            .mount(&server)
            .await;

        let file = presized_file(10);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(10),
            range_supported: true,
        };
        let range = ByteRange {
            index: 1,
            start: 5,
            end: None,
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 5,
        };

        let err = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &quick_options(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::RangeFetch { range_index: 1, .. }));
        // Fatal, so no retries.
        assert_eq!(server.received_requests().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_range_stops_when_cancelled() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let file = presized_file(5);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(5),
            range_supported: true,
        };
        let range = ByteRange {
            index: 0,
            start: 0,
            end: None,
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 0,
        };
        let options = FetchOptions {
            retry_delay: Duration::from_secs(60),
            ..quick_options()
        };

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let observer: Arc<dyn ProgressObserver> = Arc::new(NoopObserver);
        let err = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &options,
            observer.as_ref(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, DownloadError::Cancelled));
    }

    #[tokio::test]
    async fn test_fetch_range_resumes_unwritten_suffix() {
        let server = MockServer::start().await;
        // The first response ends after three of the five bytes.
        Mock::given(method("GET"))
            .and(header("Range", "bytes=10-14"))
            .respond_with(ResponseTemplate::new(206).set_body_string("Hel"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(header("Range", "bytes=13-14"))
            .respond_with(ResponseTemplate::new(206).set_body_string("lo"))
            .mount(&server)
            .await;

        let file = presized_file(15);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(15),
            range_supported: true,
        };
        let range = ByteRange {
            index: 1,
            start: 10,
            end: Some(14),
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 10,
        };

        let result = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &quick_options(),
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.bytes_written, 5);

        let ranges: Vec<String> = server
            .received_requests()
            .await
            .unwrap()
            .iter()
            .filter_map(|r| r.headers.get("range"))
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(ranges, ["bytes=10-14", "bytes=13-14"]);

        let content = std::fs::read(file.path()).unwrap();
        assert_eq!(&content[10..], b"Hello");
        assert_eq!(&content[..10], &[0u8; 10]);
    }

    #[tokio::test]
    async fn test_fetch_range_retries_stalled_response() {
        let server = MockServer::start().await;
        let calls = Arc::new(AtomicUsize::new(0));
        Mock::given(method("GET"))
            .respond_with(SlowFirstResponder {
                calls: calls.clone(),
                first_delay: Duration::from_secs(3),
                body: "Hello",
            })
            .mount(&server)
            .await;

        let file = presized_file(5);
        let target = DownloadTarget {
            url: server.uri(),
            total_length: Some(5),
            range_supported: true,
        };
        let range = ByteRange {
            index: 0,
            start: 0,
            end: None,
        };
        let sink = RangeSink {
            path: file.path().to_path_buf(),
            base_offset: 0,
        };
        let options = FetchOptions {
            read_timeout: Duration::from_millis(200),
            ..quick_options()
        };

        let result = fetch_range(
            &Client::new(),
            &target,
            range,
            &sink,
            &options,
            &NoopObserver,
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.bytes_written, 5);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(std::fs::read(file.path()).unwrap(), b"Hello");
    }
}
