//! Progress reporting for long-running maintenance operations
//! (integrity checks, full-text reindexing, bulk loads).
//!
//! `cubicweb-ctl` uses [`IndicatifReporter`]; library callers and tests use
//! [`NoopReporter`].

use std::sync::atomic::{AtomicU64, Ordering};

use indicatif::{ProgressBar, ProgressStyle};

pub trait ProgressReporter: Send + Sync {
    /// Begin a new task with an optional total count.
    fn start(&self, task: &str, total: Option<u64>);

    fn advance(&self, amount: u64);

    fn finish(&self);

    /// Print a line without breaking the bar.
    fn message(&self, msg: &str);
}

#[derive(Debug, Default)]
pub struct NoopReporter;

impl ProgressReporter for NoopReporter {
    fn start(&self, _task: &str, _total: Option<u64>) {}
    fn advance(&self, _amount: u64) {}
    fn finish(&self) {}
    fn message(&self, _msg: &str) {}
}

/// Reporter drawing an `indicatif` bar on stderr.
#[derive(Debug)]
pub struct IndicatifReporter {
    bar: ProgressBar,
    done: AtomicU64,
}

impl Default for IndicatifReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl IndicatifReporter {
    pub fn new() -> Self {
        Self {
            bar: ProgressBar::new(0),
            done: AtomicU64::new(0),
        }
    }

    /// Number of items advanced since the last `start`.
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}

impl ProgressReporter for IndicatifReporter {
    fn start(&self, task: &str, total: Option<u64>) {
        self.done.store(0, Ordering::Relaxed);
        let template = if total.is_some() {
            "{msg} [{bar:30.cyan/blue}] {pos}/{len} ({eta})"
        } else {
            "{spinner:.green} {msg} {pos}"
        };
        if let Ok(style) = ProgressStyle::with_template(template) {
            self.bar.set_style(style.progress_chars("=> "));
        }
        self.bar.set_length(total.unwrap_or(0));
        self.bar.set_message(task.to_string());
        self.bar.reset();
    }

    fn advance(&self, amount: u64) {
        self.done.fetch_add(amount, Ordering::Relaxed);
        self.bar.inc(amount);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }

    fn message(&self, msg: &str) {
        self.bar.println(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_reporter_accepts_everything() {
        let reporter = NoopReporter;
        reporter.start("reindex", Some(3));
        reporter.advance(3);
        reporter.message("done");
        reporter.finish();
    }

    #[test]
    fn indicatif_reporter_counts_per_task() {
        let reporter = IndicatifReporter::new();
        reporter.start("checking entities", Some(10));
        reporter.advance(4);
        reporter.advance(1);
        assert_eq!(reporter.done(), 5);
        reporter.start("checking relations", None);
        assert_eq!(reporter.done(), 0);
        reporter.finish();
    }
}
