//! Utility helpers used across the crate.
//!
//! HTTP client construction, the capability probe, and filename extraction.
use crate::error::{DownloadError, Result};
use crate::range::DownloadTarget;
use percent_encoding::percent_decode_str;
use reqwest::Client;
use reqwest::header::{ACCEPT_RANGES, CONTENT_LENGTH, HeaderMap};
use sanitize_filename::sanitize;
use std::time::Duration;
use tracing::{debug, info};
use url::Url;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

const USER_AGENT: &str = concat!("splitfetch/", env!("CARGO_PKG_VERSION"));

/// Builds the HTTP client shared by the probe and every worker.
///
/// Only connection setup is bounded here. Reads are bounded per chunk by the
/// callers, since a whole-request timeout would cap the size of a range.
pub fn build_client(connect_timeout: Duration) -> Result<Client> {
    let client = Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(connect_timeout)
        .build()?;
    Ok(client)
}

/// Issues a HEAD request to learn the length of the file and whether the
/// server serves byte ranges.
///
/// # Errors
///
/// Returns [`DownloadError::UnreachableTarget`] if the request fails, times
/// out, or the server answers with a non-success status.
pub async fn probe_target(url: &str, client: &Client, timeout: Duration) -> Result<DownloadTarget> {
    let unreachable = |reason: String| DownloadError::UnreachableTarget {
        url: url.to_string(),
        reason,
    };

    let response = client
        .head(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| unreachable(e.to_string()))?;

    if !response.status().is_success() {
        return Err(unreachable(format!("status code {}", response.status())));
    }

    let headers = response.headers();
    log_headers(headers);

    let target = target_from_headers(url, headers);
    info!(
        length = ?target.total_length,
        range_supported = target.range_supported,
        "probed {}",
        url
    );
    Ok(target)
}

/// Interprets probe headers. An unparseable `Content-Length` counts as
/// missing.
fn target_from_headers(url: &str, headers: &HeaderMap) -> DownloadTarget {
    let total_length = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());

    let accepts_bytes = headers
        .get(ACCEPT_RANGES)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(',').any(|unit| unit.trim().eq_ignore_ascii_case("bytes")));

    DownloadTarget {
        url: url.to_string(),
        total_length,
        range_supported: accepts_bytes,
    }
}

fn log_headers(headers: &HeaderMap) {
    for (name, value) in headers {
        debug!("{}: {}", name, value.to_str().unwrap_or("<binary>"));
    }
}

/// Extracts a clean filename from a URL.
///
/// The last path segment is percent-decoded and sanitized for the local OS.
/// Falls back to "output.bin" if no valid filename is found.
pub fn get_filename_from_url(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|mut s| s.next_back().unwrap_or("").to_string())
        })
        .map(|s| percent_decode_str(&s).decode_utf8_lossy().to_string())
        .map(sanitize)
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "output.bin".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_target_from_headers() {
        let url = "http://example.com/a.bin";

        let target = target_from_headers(
            url,
            &headers(&[("content-length", "1234"), ("accept-ranges", "bytes")]),
        );
        assert_eq!(target.total_length, Some(1234));
        assert!(target.range_supported);

        let target = target_from_headers(
            url,
            &headers(&[("content-length", "1234"), ("accept-ranges", "none")]),
        );
        assert!(!target.range_supported);

        let target = target_from_headers(url, &headers(&[("content-length", "1234")]));
        assert!(!target.range_supported);

        // Without a length we cannot partition, even if ranges are advertised.
        let target = target_from_headers(url, &headers(&[("accept-ranges", "bytes")]));
        assert_eq!(target.total_length, None);
        assert!(target.range_supported);
        assert_eq!(target.parallel_workers(4), None);

        let target = target_from_headers(
            url,
            &headers(&[("content-length", "12x"), ("accept-ranges", "Bytes")]),
        );
        assert_eq!(target.total_length, None);
        assert!(target.range_supported);
    }

    #[tokio::test]
    async fn test_probe_rejects_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = build_client(DEFAULT_CONNECT_TIMEOUT).unwrap();
        let url = format!("{}/missing.bin", server.uri());
        let err = probe_target(&url, &client, DEFAULT_READ_TIMEOUT)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::UnreachableTarget { .. }));
        assert_eq!(err.stage(), "probe");
    }

    #[tokio::test]
    async fn test_probe_reads_length_and_range_support() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Accept-Ranges", "bytes")
                    .set_body_bytes(vec![0u8; 42]),
            )
            .mount(&server)
            .await;

        let client = build_client(DEFAULT_CONNECT_TIMEOUT).unwrap();
        let url = format!("{}/file.bin", server.uri());
        let target = probe_target(&url, &client, DEFAULT_READ_TIMEOUT)
            .await
            .unwrap();

        assert_eq!(target.url, url);
        assert_eq!(target.total_length, Some(42));
        assert!(target.range_supported);
    }

    #[test]
    fn test_filename_extraction() {
        // Simple case
        assert_eq!(
            get_filename_from_url("https://example.com/archive.zip"),
            "archive.zip"
        );

        // With query parameters (should ignore ?id=123)
        assert_eq!(
            get_filename_from_url("https://example.com/image.png?id=123&quality=high"),
            "image.png"
        );

        // With URL encoding (%20)
        assert_eq!(
            get_filename_from_url("https://example.com/my%20vacation%20photo.jpg"),
            "my vacation photo.jpg"
        );

        // Edge case: No filename (ends in slash)
        assert_eq!(get_filename_from_url("https://example.com/"), "output.bin");
    }
}
