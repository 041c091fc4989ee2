//! Progress reporting hooks.
//!
//! Workers report through [`ProgressObserver`] so the engine does not care
//! whether progress ends up on a terminal bar or nowhere at all.
use crate::range::ByteRange;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::sync::Arc;

pub trait ProgressObserver: Send + Sync {
    /// `n` more bytes landed on disk.
    fn inc(&self, n: u64);
    /// Short status update (retries, failures).
    fn message(&self, msg: String);
    /// The unit of work this observer tracks is done.
    fn finish(&self);
    /// Progress already reported must be discarded, e.g. when a single-stream
    /// download restarts from the first byte.
    fn reset(&self) {}
}

/// Renders progress on an indicatif bar.
pub struct ConsoleObserver {
    pub pb: ProgressBar,
}

impl ProgressObserver for ConsoleObserver {
    fn inc(&self, n: u64) {
        self.pb.inc(n);
    }

    fn message(&self, msg: String) {
        self.pb.set_message(msg);
    }

    fn finish(&self) {
        self.pb.finish();
    }

    fn reset(&self) {
        self.pb.set_position(0);
    }
}

/// Discards all progress.
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn inc(&self, _n: u64) {}
    fn message(&self, _msg: String) {}
    fn finish(&self) {}
}

/// Hands out one observer per unit of work: a range in parallel mode, or the
/// whole body in single-stream mode.
pub trait ObserverFactory: Send + Sync {
    fn for_range(&self, range: &ByteRange, len: u64) -> Arc<dyn ProgressObserver>;
    fn for_stream(&self, len: Option<u64>) -> Arc<dyn ProgressObserver>;
}

impl ObserverFactory for NoopObserver {
    fn for_range(&self, _range: &ByteRange, _len: u64) -> Arc<dyn ProgressObserver> {
        Arc::new(NoopObserver)
    }

    fn for_stream(&self, _len: Option<u64>) -> Arc<dyn ProgressObserver> {
        Arc::new(NoopObserver)
    }
}

/// One indicatif bar per range, stacked in a [`MultiProgress`].
pub struct ConsoleProgress {
    multi: MultiProgress,
    style: ProgressStyle,
}

impl ConsoleProgress {
    pub fn new(multi: MultiProgress) -> Self {
        let style = ProgressStyle::with_template(
            "{msg} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=>-");
        Self { multi, style }
    }

    fn add_bar(&self, len: Option<u64>, msg: String) -> Arc<dyn ProgressObserver> {
        let pb = match len {
            Some(len) => self.multi.add(ProgressBar::new(len)),
            None => self.multi.add(ProgressBar::no_length()),
        };
        pb.set_style(self.style.clone());
        pb.set_message(msg);
        Arc::new(ConsoleObserver { pb })
    }
}

impl ObserverFactory for ConsoleProgress {
    fn for_range(&self, range: &ByteRange, len: u64) -> Arc<dyn ProgressObserver> {
        self.add_bar(Some(len), format!("Part {}", range.index + 1))
    }

    fn for_stream(&self, len: Option<u64>) -> Arc<dyn ProgressObserver> {
        self.add_bar(len, "Download".to_string())
    }
}
