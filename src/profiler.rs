// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Request latency statistics.
//!
//! The profiler observes the proxy from the outside; the subtree and the stash never call it.

use crate::OramError;
use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::{
    fs::File,
    hash::Hash,
    io::{BufWriter, Write},
    path::PathBuf,
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

/// The name of the report written by [`LatencyProfiler::write_statistics`].
pub const READ_STATISTICS_FILE: &str = "clientReadStats.txt";

/// The number of initial requests left out of the statistics by default.
pub const DEFAULT_EXCLUDED_REQUESTS: u64 = 100;

// Latencies below 2048 ms are recorded exactly.
const SIGNIFICANT_FIGURES: u8 = 3;

/// Records how long requests take, keyed by request.
pub trait Profiler<K> {
    /// Notes that `request` was sent.
    fn on_send_read(&self, request: &K);
    /// Notes that `request` completed.
    fn on_send_read_complete(&self, request: &K);
    /// Persists a summary of the recorded latencies.
    fn write_statistics(&self) -> Result<(), OramError>;
}

/// A [`Profiler`] that folds latency samples, in milliseconds, into a histogram.
#[derive(Debug)]
pub struct LatencyProfiler<K: Hash + Eq> {
    output_directory: PathBuf,
    excluded_requests: u64,
    sent: AtomicU64,
    start_times: DashMap<K, Instant>,
    latencies: Mutex<Histogram<u64>>,
}

impl<K: Hash + Eq + Clone> LatencyProfiler<K> {
    /// A profiler writing to `output_directory` and skipping the first
    /// [`DEFAULT_EXCLUDED_REQUESTS`] requests.
    pub fn new<P: Into<PathBuf>>(output_directory: P) -> Result<Self, OramError> {
        Self::with_excluded_requests(output_directory, DEFAULT_EXCLUDED_REQUESTS)
    }

    /// A profiler writing to `output_directory` and skipping the first `excluded_requests`
    /// requests.
    pub fn with_excluded_requests<P: Into<PathBuf>>(
        output_directory: P,
        excluded_requests: u64,
    ) -> Result<Self, OramError> {
        Ok(Self {
            output_directory: output_directory.into(),
            excluded_requests,
            sent: AtomicU64::new(0),
            start_times: DashMap::new(),
            latencies: Mutex::new(
                Histogram::new(SIGNIFICANT_FIGURES).map_err(OramError::HistogramCreationError)?,
            ),
        })
    }

    fn record(&self, millis: u64) {
        self.latencies.lock().saturating_record(millis);
    }

    /// The number of recorded samples.
    pub fn sample_count(&self) -> u64 {
        self.latencies.lock().len()
    }

    /// A textual summary of the recorded latencies followed by a histogram.
    pub fn report(&self) -> String {
        let latencies = self.latencies.lock();
        let mut report = summary(&latencies);
        report.push('\n');
        report.push_str(&histogram(&latencies));
        report
    }
}

impl<K: Hash + Eq + Clone> Profiler<K> for LatencyProfiler<K> {
    fn on_send_read(&self, request: &K) {
        if self.sent.fetch_add(1, Ordering::Relaxed) >= self.excluded_requests {
            self.start_times.insert(request.clone(), Instant::now());
        }
    }

    fn on_send_read_complete(&self, request: &K) {
        if let Some((_, start)) = self.start_times.remove(request) {
            let elapsed = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.record(elapsed);
        }
    }

    fn write_statistics(&self) -> Result<(), OramError> {
        let file_name = self.output_directory.join(READ_STATISTICS_FILE);
        log::info!("Writing read statistics to {}", file_name.display());
        let mut writer = BufWriter::new(File::create(file_name)?);
        writeln!(writer, "{}", self.report())?;
        writer.flush()?;
        Ok(())
    }
}

fn summary(latencies: &Histogram<u64>) -> String {
    let mut result = format!("DescriptiveStatistics:\nn: {}\n", latencies.len());
    if latencies.is_empty() {
        return result;
    }
    result.push_str(&format!(
        "min: {:.2}\nmax: {:.2}\nmean: {:.2}\nstd dev: {:.2}\nmedian: {:.2}\n",
        latencies.min() as f64,
        latencies.max() as f64,
        latencies.mean(),
        latencies.stdev(),
        latencies.value_at_quantile(0.5) as f64,
    ));
    result
}

fn histogram(latencies: &Histogram<u64>) -> String {
    latencies
        .iter_recorded()
        .fold(String::from("Histogram:\n"), |mut result, value| {
            result.push_str(&format!(
                "{:.2} {}\n",
                value.value_iterated_to() as f64,
                value.count_at_value()
            ));
            result
        })
}
