//! Metric declarations for the DOQ tile cache.
//!
//! Every counter the cache records is declared here once as a [`Metric`]
//! constant, so call sites never spell a metric name by hand. The crate
//! re-exports the `metrics` facade; installing a recorder (Prometheus, a
//! debugging recorder, ...) is left to the embedding application.
//!
//! ```rust
//! use doq_metrics::metric_defs;
//!
//! doq_metrics::describe_metrics();
//! metrics::counter!(metric_defs::CACHE_HITS.name).increment(1);
//! ```

pub use metrics;

use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

/// The kind of metric (counter, gauge, or histogram).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// A monotonically increasing counter.
    Counter,
    /// A gauge that can go up and down.
    Gauge,
    /// A histogram for recording distributions.
    Histogram,
}

/// A metric declaration with its metadata.
#[derive(Debug, Clone)]
pub struct Metric {
    /// The metric name (e.g., "doq.cache.hits").
    pub name: &'static str,
    /// The kind of metric.
    pub kind: MetricKind,
    /// Human-readable description.
    pub description: &'static str,
    /// The unit of measurement, if any.
    pub unit: Option<Unit>,
    /// Expected label keys.
    pub labels: &'static [&'static str],
}

impl Metric {
    const fn new(name: &'static str, kind: MetricKind) -> Self {
        Self {
            name,
            kind,
            description: "",
            unit: None,
            labels: &[],
        }
    }

    /// Declares a counter.
    pub const fn counter(name: &'static str) -> Self {
        Self::new(name, MetricKind::Counter)
    }

    /// Declares a gauge.
    pub const fn gauge(name: &'static str) -> Self {
        Self::new(name, MetricKind::Gauge)
    }

    /// Declares a histogram.
    pub const fn histogram(name: &'static str) -> Self {
        Self::new(name, MetricKind::Histogram)
    }

    /// Sets the description.
    pub const fn with_description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the unit.
    pub const fn with_unit(mut self, unit: Unit) -> Self {
        self.unit = Some(unit);
        self
    }

    /// Sets the expected label keys.
    pub const fn with_labels(mut self, labels: &'static [&'static str]) -> Self {
        self.labels = labels;
        self
    }

    /// Registers this metric's description with the installed recorder.
    pub fn describe(&self) {
        match (self.kind, self.unit) {
            (MetricKind::Counter, Some(unit)) => describe_counter!(self.name, unit, self.description),
            (MetricKind::Counter, None) => describe_counter!(self.name, self.description),
            (MetricKind::Gauge, Some(unit)) => describe_gauge!(self.name, unit, self.description),
            (MetricKind::Gauge, None) => describe_gauge!(self.name, self.description),
            (MetricKind::Histogram, Some(unit)) => {
                describe_histogram!(self.name, unit, self.description)
            }
            (MetricKind::Histogram, None) => describe_histogram!(self.name, self.description),
        }
    }
}

/// All metric definitions for the tile cache.
pub mod metric_defs {
    use super::{Metric, Unit};

    // ========================================================================
    // Cache Facade
    // ========================================================================

    /// Tiles served from the on-disk store.
    pub const CACHE_HITS: Metric = Metric::counter("doq.cache.hits")
        .with_description("Tiles served from the on-disk store")
        .with_unit(Unit::Count);

    /// Tiles that had to be fetched from the network.
    pub const CACHE_MISSES: Metric = Metric::counter("doq.cache.misses")
        .with_description("Tiles not present (or corrupt) in the on-disk store")
        .with_unit(Unit::Count);

    /// Stored or downloaded buffers that failed to decode.
    ///
    /// Labels: source (`store` or `network`)
    pub const DECODE_FAILURES: Metric = Metric::counter("doq.cache.decode_failures")
        .with_description("Tile buffers that failed to decode")
        .with_unit(Unit::Count)
        .with_labels(&["source"]);

    /// Index entries tombstoned.
    pub const INVALIDATIONS: Metric = Metric::counter("doq.cache.invalidations")
        .with_description("Index entries logically deleted")
        .with_unit(Unit::Count);

    // ========================================================================
    // Store
    // ========================================================================

    /// Tiles appended to the store.
    pub const STORE_APPENDS: Metric = Metric::counter("doq.store.appends")
        .with_description("Tiles appended to the shard store")
        .with_unit(Unit::Count);

    /// Bytes appended to shards, headers included.
    pub const STORE_BYTES_WRITTEN: Metric = Metric::counter("doq.store.bytes_written")
        .with_description("Bytes appended to shard files")
        .with_unit(Unit::Bytes);

    /// New shard files created because the last one was full.
    pub const SHARD_ROLLOVERS: Metric = Metric::counter("doq.store.shard_rollovers")
        .with_description("Shard files created by rollover")
        .with_unit(Unit::Count);

    pub const STORE_SHARDS: Metric = Metric::gauge("doq.store.shards")
        .with_description("Shard files in the open store")
        .with_unit(Unit::Count);

    // ========================================================================
    // Network
    // ========================================================================

    /// Fetch attempts against a backend.
    ///
    /// Labels: backend (`primary` or `alternate`)
    pub const FETCH_ATTEMPTS: Metric = Metric::counter("doq.fetch.attempts")
        .with_description("Tile download attempts")
        .with_unit(Unit::Count)
        .with_labels(&["backend"]);

    /// Failed fetch attempts.
    ///
    /// Labels: backend, reason
    pub const FETCH_FAILURES: Metric = Metric::counter("doq.fetch.failures")
        .with_description("Failed tile download attempts")
        .with_unit(Unit::Count)
        .with_labels(&["backend", "reason"]);

    /// Response bytes received for successful fetches.
    pub const FETCH_BYTES: Metric = Metric::counter("doq.fetch.bytes")
        .with_description("Response bytes received for successful downloads")
        .with_unit(Unit::Bytes);

    /// Seconds spent sleeping between retries.
    pub const RETRY_SLEEP: Metric = Metric::histogram("doq.fetch.retry_sleep_seconds")
        .with_description("Backoff sleeps between download attempts")
        .with_unit(Unit::Seconds);

    // ========================================================================
    // Composer
    // ========================================================================

    /// Raster fills that touched the cache.
    pub const COMPOSER_FILLS: Metric = Metric::counter("doq.composer.fills")
        .with_description("Raster fills that assembled tiles")
        .with_unit(Unit::Count);

    /// Raster fills answered by the already-filled window.
    pub const COMPOSER_MEMO_HITS: Metric = Metric::counter("doq.composer.memo_hits")
        .with_description("Raster fills skipped because the window was unchanged")
        .with_unit(Unit::Count);

    /// Every declared metric.
    pub const ALL: &[&Metric] = &[
        &CACHE_HITS,
        &CACHE_MISSES,
        &DECODE_FAILURES,
        &INVALIDATIONS,
        &STORE_APPENDS,
        &STORE_BYTES_WRITTEN,
        &SHARD_ROLLOVERS,
        &STORE_SHARDS,
        &FETCH_ATTEMPTS,
        &FETCH_FAILURES,
        &FETCH_BYTES,
        &RETRY_SLEEP,
        &COMPOSER_FILLS,
        &COMPOSER_MEMO_HITS,
    ];
}

/// Registers descriptions for every metric in [`metric_defs::ALL`].
pub fn describe_metrics() {
    for metric in metric_defs::ALL {
        metric.describe();
    }
}
