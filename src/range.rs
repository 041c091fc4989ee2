//! Byte ranges and the partitioning of a target into them.
//!
//! A [`DownloadTarget`] is what the probe learned about the remote file. It is
//! split by [`partition`] into one [`ByteRange`] per worker. The ranges are
//! disjoint and gap-free, which is what lets every worker write into the same
//! output file without coordinating with the others.
use std::fmt;

/// Hard ceiling on concurrent range fetches, regardless of what was requested.
pub const MAX_WORKERS: usize = 8;

/// What the capability probe learned about the remote file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    /// The source URL of the file.
    pub url: String,
    /// `None` when the server did not send a `Content-Length`.
    pub total_length: Option<u64>,
    /// Whether the server advertised `Accept-Ranges: bytes`.
    pub range_supported: bool,
}

impl DownloadTarget {
    /// Number of parallel workers to use, or `None` if the target must be
    /// fetched as a single stream.
    ///
    /// Parallel mode needs range support, a known non-zero length, and more
    /// than one effective worker.
    pub fn parallel_workers(&self, requested: usize) -> Option<usize> {
        if !self.range_supported {
            return None;
        }
        let length = self.total_length.filter(|&len| len > 0)?;
        let workers = effective_workers(requested, length);
        (workers > 1).then_some(workers)
    }
}

/// Clamps a requested worker count to `[1, MAX_WORKERS]` and to the number of
/// bytes available, so no worker is ever handed an empty range.
pub fn effective_workers(requested: usize, length: u64) -> usize {
    let by_length = usize::try_from(length).unwrap_or(usize::MAX);
    requested.min(MAX_WORKERS).min(by_length).max(1)
}

/// An inclusive span of bytes assigned to one worker.
///
/// `end == None` means "through the end of the file"; only the last range of a
/// partition is open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// Position of the range within its partition (0-based).
    pub index: usize,
    /// The first byte of the range.
    pub start: u64,
    /// The last byte of the range, inclusive.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Number of bytes this range covers in a file of `total_length` bytes.
    pub fn len_within(&self, total_length: u64) -> u64 {
        let stop = match self.end {
            Some(end) => end + 1,
            None => total_length,
        };
        stop.saturating_sub(self.start)
    }

    /// `Range` header value for the part of this range not yet written.
    pub fn header_value(&self, written: u64) -> String {
        let from = self.start + written;
        match self.end {
            Some(end) => format!("bytes={}-{}", from, end),
            None => format!("bytes={}-", from),
        }
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}-{}", self.start, end),
            None => write!(f, "{}-", self.start),
        }
    }
}

/// Outcome of one successful range fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchResult {
    pub range_index: usize,
    pub bytes_written: u64,
}

/// Splits `length` bytes into `workers` contiguous ranges.
///
/// Each range gets `length / workers` bytes and the last one is left open so it
/// absorbs the remainder. `workers` is clamped to `[1, length]` first, so a
/// request for more workers than bytes yields one single-byte range per byte
/// rather than empty ranges.
pub fn partition(length: u64, workers: usize) -> Vec<ByteRange> {
    let workers = (workers as u64).clamp(1, length.max(1));
    let size = length / workers;

    let mut ranges: Vec<ByteRange> = (0..workers - 1)
        .map(|i| ByteRange {
            index: i as usize,
            start: i * size,
            end: Some((i + 1) * size - 1),
        })
        .collect();

    ranges.push(ByteRange {
        index: (workers - 1) as usize,
        start: (workers - 1) * size,
        end: None,
    });

    ranges
}
