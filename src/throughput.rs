use std::fmt;
use std::time::{Duration, Instant};

use rusb::Direction;

use crate::error::FailureKind;

/// Running byte count and failure latch for one benchmark run.
#[derive(Debug)]
pub struct Throughput {
    target: u64,
    bytes_total: u64,
    completions: u64,
    started: Option<Instant>,
    finished: Option<Instant>,
    failure: Option<FailureKind>,
}

impl Throughput {
    /// Creates an accumulator that terminates once more than `target` bytes
    /// have been exchanged.
    pub fn new(target: u64) -> Throughput {
        Throughput {
            target,
            bytes_total: 0,
            completions: 0,
            started: None,
            finished: None,
            failure: None,
        }
    }

    /// Starts the clock. Only the first call has an effect.
    pub fn start(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    /// Adds a completed transfer to the total.
    ///
    /// Ignored once a failure has been latched.
    pub fn record(&mut self, n_bytes: usize) {
        if self.failure.is_some() {
            return;
        }

        self.bytes_total += n_bytes as u64;
        self.completions += 1;

        if self.finished.is_none() && self.bytes_total > self.target {
            self.finished = Some(Instant::now());
        }
    }

    /// Latches the first failure of the run. Later failures are ignored.
    pub fn record_failure(&mut self, kind: FailureKind) {
        if self.failure.is_some() {
            return;
        }

        self.failure = Some(kind);
        if self.finished.is_none() {
            self.finished = Some(Instant::now());
        }
    }

    pub fn should_terminate(&self) -> bool {
        self.bytes_total > self.target || self.failure.is_some()
    }

    pub fn failure(&self) -> Option<FailureKind> {
        self.failure
    }

    pub fn bytes_total(&self) -> u64 {
        self.bytes_total
    }

    pub fn completions(&self) -> u64 {
        self.completions
    }

    pub fn target(&self) -> u64 {
        self.target
    }

    /// Time from the first submission to the termination decision, or to now
    /// if the run has not terminated yet.
    pub fn elapsed(&self) -> Duration {
        match (self.started, self.finished) {
            (Some(started), Some(finished)) => finished.saturating_duration_since(started),
            (Some(started), None) => started.elapsed(),
            (None, _) => Duration::ZERO,
        }
    }

    /// Builds the report for a finished run, or returns the latched failure.
    pub fn finish(&self, direction: Direction) -> Result<Report, FailureKind> {
        if let Some(kind) = self.failure {
            return Err(kind);
        }

        Ok(Report {
            direction,
            bytes_total: self.bytes_total,
            completions: self.completions,
            elapsed: self.elapsed(),
        })
    }
}

/// The result of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    pub direction: Direction,
    pub bytes_total: u64,
    pub completions: u64,
    pub elapsed: Duration,
}

impl Report {
    pub fn bytes_per_second(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.bytes_total as f64 / secs
        } else {
            0.0
        }
    }
}

impl fmt::Display for Report {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            fmt,
            "Exchanged {}MB total at {}MB/s.",
            self.bytes_total as f64 / 1_000_000.0,
            self.bytes_per_second() / 1_000_000.0
        )
    }
}
