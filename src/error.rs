//! Error taxonomy for the download engine.
//!
//! Every fatal outcome of a download maps onto one variant here. Transient
//! network faults never escape the fetch layer on their own; they surface only
//! once a range has used up its retry budget, wrapped in [`DownloadError::RangeFetch`].
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DownloadError {
    /// The capability probe failed or returned a non-success status.
    #[error("target {url} is unreachable: {reason}")]
    UnreachableTarget { url: String, reason: String },

    /// A range could not be fetched within its retry budget.
    #[error("range #{range_index} failed: {cause}")]
    RangeFetch { range_index: usize, cause: String },

    /// The single-stream body could not be fetched within the retry budget.
    #[error("single-stream download failed: {0}")]
    SingleStream(String),

    /// The bytes on disk do not add up to the advertised length.
    #[error("incomplete download: expected {expected} bytes, found {actual}")]
    IncompleteDownload { expected: u64, actual: u64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Name of the pipeline stage that produced this error, for diagnostics.
    pub fn stage(&self) -> &'static str {
        match self {
            DownloadError::UnreachableTarget { .. } => "probe",
            DownloadError::Client(_) => "setup",
            DownloadError::RangeFetch { .. } => "range fetch",
            DownloadError::SingleStream(_) => "single-stream fetch",
            DownloadError::IncompleteDownload { .. } => "finalize",
            DownloadError::Io(_) => "file I/O",
            DownloadError::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, DownloadError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_names_the_failing_step() {
        let err = DownloadError::RangeFetch {
            range_index: 3,
            cause: "connection reset".into(),
        };
        assert_eq!(err.stage(), "range fetch");
        assert_eq!(err.to_string(), "range #3 failed: connection reset");

        let err = DownloadError::IncompleteDownload {
            expected: 10,
            actual: 7,
        };
        assert_eq!(err.stage(), "finalize");
    }

    #[tokio::test]
    async fn client_errors_report_setup_stage() {
        let cause = reqwest::get("not a url").await.unwrap_err();
        let err = DownloadError::from(cause);
        assert!(matches!(err, DownloadError::Client(_)));
        assert_eq!(err.stage(), "setup");
    }
}
