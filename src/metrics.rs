//! Metrics helpers for the key-set cache and the exchange pipeline.

// std
use std::sync::atomic::{AtomicU64, Ordering};
#[cfg(feature = "prometheus")] use std::sync::OnceLock;
// crates.io
use metrics::Label;
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use smallvec::SmallVec;
// self
use crate::_prelude::*;

type LabelSet = SmallVec<[Label; 2]>;

const METRIC_REQUESTS_TOTAL: &str = "labid_keyset_requests_total";
const METRIC_HITS_TOTAL: &str = "labid_keyset_hits_total";
const METRIC_STALE_TOTAL: &str = "labid_keyset_stale_total";
const METRIC_MISSES_TOTAL: &str = "labid_keyset_misses_total";
const METRIC_REFRESH_TOTAL: &str = "labid_keyset_refresh_total";
const METRIC_REFRESH_DURATION: &str = "labid_keyset_refresh_duration_seconds";
const METRIC_REFRESH_ERRORS: &str = "labid_keyset_refresh_errors_total";
const METRIC_EXCHANGE_TOTAL: &str = "labid_exchange_total";
const METRIC_EXCHANGE_DURATION: &str = "labid_exchange_duration_seconds";

#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Thread-safe counters kept alongside the key-set cache for status reporting.
#[derive(Debug, Default)]
pub struct CacheMetrics {
	total_requests: AtomicU64,
	cache_hits: AtomicU64,
	stale_serves: AtomicU64,
	refresh_successes: AtomicU64,
	refresh_errors: AtomicU64,
	last_refresh_micros: AtomicU64,
}
impl CacheMetrics {
	/// Create a new accumulator.
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// Record a lookup served from the cache.
	pub fn record_hit(&self, stale: bool) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
		self.cache_hits.fetch_add(1, Ordering::Relaxed);

		if stale {
			self.stale_serves.fetch_add(1, Ordering::Relaxed);
		}
	}

	/// Record a lookup that required an upstream fetch.
	pub fn record_miss(&self) {
		self.total_requests.fetch_add(1, Ordering::Relaxed);
	}

	/// Record a successful refresh and its latency.
	pub fn record_refresh_success(&self, duration: Duration) {
		self.refresh_successes.fetch_add(1, Ordering::Relaxed);
		self.last_refresh_micros.store(duration.as_micros() as u64, Ordering::Relaxed);
	}

	/// Record a failed refresh.
	pub fn record_refresh_error(&self) {
		self.refresh_errors.fetch_add(1, Ordering::Relaxed);
	}

	/// Take a point-in-time snapshot.
	pub fn snapshot(&self) -> CacheMetricsSnapshot {
		CacheMetricsSnapshot {
			total_requests: self.total_requests.load(Ordering::Relaxed),
			cache_hits: self.cache_hits.load(Ordering::Relaxed),
			stale_serves: self.stale_serves.load(Ordering::Relaxed),
			refresh_successes: self.refresh_successes.load(Ordering::Relaxed),
			refresh_errors: self.refresh_errors.load(Ordering::Relaxed),
			last_refresh_micros: match self.last_refresh_micros.load(Ordering::Relaxed) {
				0 => None,
				value => Some(value),
			},
		}
	}
}

/// Read-only snapshot of [`CacheMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheMetricsSnapshot {
	/// Total number of lookups observed.
	pub total_requests: u64,
	/// Lookups served from the cache.
	pub cache_hits: u64,
	/// Lookups served from an expired payload.
	pub stale_serves: u64,
	/// Successful refreshes.
	pub refresh_successes: u64,
	/// Failed refreshes.
	pub refresh_errors: u64,
	/// Microsecond latency of the most recent refresh.
	pub last_refresh_micros: Option<u64>,
}
impl CacheMetricsSnapshot {
	/// Fraction of lookups served from the cache.
	pub fn hit_rate(&self) -> f64 {
		if self.total_requests == 0 {
			0.0
		} else {
			self.cache_hits as f64 / self.total_requests as f64
		}
	}
}

/// Install the Prometheus recorder backed by `metrics`.
///
/// Subsequent calls are no-ops once the recorder is installed.
#[cfg(feature = "prometheus")]
pub fn install_default_exporter() -> Result<()> {
	if PROMETHEUS_HANDLE.get().is_some() {
		return Ok(());
	}

	let handle = PrometheusBuilder::new()
		.install_recorder()
		.map_err(|err| Error::Metrics(err.to_string()))?;
	let _ = PROMETHEUS_HANDLE.set(handle);

	Ok(())
}

/// Access the global Prometheus handle when installed.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
	PROMETHEUS_HANDLE.get()
}

/// Record a cache hit, tagging whether it was served stale.
pub fn record_lookup_hit(source: &str, stale: bool) {
	let labels = source_labels(source);

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::counter!(METRIC_HITS_TOTAL, labels.iter()).increment(1);

	if stale {
		metrics::counter!(METRIC_STALE_TOTAL, labels.iter()).increment(1);
	}
}

/// Record a cache miss that required an upstream fetch.
pub fn record_lookup_miss(source: &str) {
	let labels = source_labels(source);

	metrics::counter!(METRIC_REQUESTS_TOTAL, labels.iter()).increment(1);
	metrics::counter!(METRIC_MISSES_TOTAL, labels.iter()).increment(1);
}

/// Record a successful refresh along with its latency.
pub fn record_refresh_success(source: &str, duration: Duration) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(source, "success").iter()).increment(1);
	metrics::histogram!(METRIC_REFRESH_DURATION, source_labels(source).iter())
		.record(duration.as_secs_f64());
}

/// Record a failed refresh.
pub fn record_refresh_error(source: &str) {
	metrics::counter!(METRIC_REFRESH_TOTAL, status_labels(source, "error").iter()).increment(1);
	metrics::counter!(METRIC_REFRESH_ERRORS, source_labels(source).iter()).increment(1);
}

/// Record a finished exchange; `outcome` is `success` or an OAuth error code.
pub fn record_exchange(outcome: &'static str, duration: Duration) {
	let labels = [Label::new("outcome", outcome)];

	metrics::counter!(METRIC_EXCHANGE_TOTAL, labels.iter()).increment(1);
	metrics::histogram!(METRIC_EXCHANGE_DURATION, labels.iter()).record(duration.as_secs_f64());
}

fn source_labels(source: &str) -> LabelSet {
	let mut labels = LabelSet::new();

	labels.push(Label::new("source", source.to_owned()));

	labels
}

fn status_labels(source: &str, status: &'static str) -> LabelSet {
	let mut labels = source_labels(source);

	labels.push(Label::new("status", status));

	labels
}
