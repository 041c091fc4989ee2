//! # splitfetch
//!
//! `splitfetch` downloads a single file over HTTP by splitting it into
//! contiguous byte ranges and fetching them concurrently.
//!
//! - The server is probed with a HEAD request for its length and for
//!   `Accept-Ranges: bytes`.
//! - Ranges are streamed straight into their offsets of one pre-sized file
//!   (or into separate part files that are concatenated in range order).
//! - Transient failures retry only the unwritten suffix of a range.
//! - Without range support the file is fetched as a single stream.
//!
//! Either the whole file ends up at the destination with the advertised size,
//! or the download fails and nothing is left there.

pub mod args;
pub mod config;
pub mod downloader;
pub mod error;
pub mod finalize;
pub mod observer;
pub mod range;
pub mod utils;
pub mod worker;

pub use args::Args;
pub use downloader::{DownloadMode, DownloadOptions, DownloadReport, OutputLayout, download};
pub use error::DownloadError;
pub use range::{ByteRange, DownloadTarget, FetchResult, MAX_WORKERS, partition};
pub use worker::{FetchOptions, fetch_range};
