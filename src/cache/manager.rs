//! Key-set cache handling retrieval, single-flight fetching, and stale serving.

// std
use std::sync::atomic::{AtomicBool, Ordering};
// crates.io
use http::{
	HeaderValue, Request, Response,
	header::{ETAG, IF_NONE_MATCH, LAST_MODIFIED},
};
use http_cache_semantics::BeforeRequest;
use jsonwebtoken::jwk::JwkSet;
use rand::Rng;
use reqwest::Client;
use serde::Serialize;
use tokio::{
	sync::{Mutex, RwLock},
	time,
};
// self
use crate::{
	_prelude::*,
	cache::{
		entry::CacheEntry,
		refresher::{self, RefresherHandle},
		state::CachePayload,
	},
	config::KeySource,
	http::{
		client::{self, HttpFetch, cache_control_header, fetch_jwks},
		retry::{AttemptBudget, RetryExecutor},
		semantics::{Freshness, base_request, evaluate_freshness, evaluate_revalidation},
	},
	metrics::{self, CacheMetrics, CacheMetricsSnapshot},
};

/// Process-wide cache of the platform's token verification keys.
///
/// Clones share the same underlying entry. Readers always observe a complete key set; a refresh
/// swaps the whole set at once.
#[derive(Clone, Debug)]
pub struct KeySetCache {
	source: Arc<KeySource>,
	client: Client,
	entry: Arc<RwLock<CacheEntry>>,
	single_flight: Arc<Mutex<()>>,
	background_pending: Arc<AtomicBool>,
	metrics: Arc<CacheMetrics>,
}
impl KeySetCache {
	/// Build a cache for the given source with a client honouring its transport rules.
	pub fn new(source: KeySource) -> Result<Self> {
		source.validate()?;

		let client = client::build_client(&source)?;

		Ok(Self::with_parts(source, client))
	}

	/// Build a cache using the supplied HTTP client.
	pub fn with_client(source: KeySource, client: Client) -> Result<Self> {
		source.validate()?;

		Ok(Self::with_parts(source, client))
	}

	fn with_parts(source: KeySource, client: Client) -> Self {
		Self {
			source: Arc::new(source),
			client,
			entry: Arc::new(RwLock::new(CacheEntry::new())),
			single_flight: Arc::new(Mutex::new(())),
			background_pending: Arc::new(AtomicBool::new(false)),
			metrics: CacheMetrics::new(),
		}
	}

	/// The configured key source.
	pub fn source(&self) -> &KeySource {
		&self.source
	}

	/// In-process counters for this cache.
	pub fn metrics(&self) -> Arc<CacheMetrics> {
		self.metrics.clone()
	}

	/// Current key set.
	///
	/// Fresh and stale-but-servable sets are returned immediately; a due refresh is pushed to a
	/// background task. Without a usable set the call fetches inline, bounded by the retry
	/// policy's deadline, and fails with [`Error::KeySourceUnavailable`] if that fetch fails.
	#[tracing::instrument(skip(self), fields(source = %self.source.name))]
	pub async fn lookup(&self) -> Result<Arc<JwkSet>> {
		let now = Instant::now();
		let snapshot = { self.entry.read().await.snapshot() };

		if let Some(payload) = snapshot {
			if !payload.is_expired(now) {
				self.observe_hit(false);

				if payload.is_refresh_due(now) {
					self.schedule_background_refresh();
				}

				return Ok(payload.jwks);
			}
			if payload.can_serve_stale(now) {
				tracing::warn!(
					error_count = payload.error_count,
					last_refresh_at = %payload.last_refresh_at,
					"key set expired; serving last-known-good copy"
				);

				self.observe_hit(true);

				if payload.is_refresh_due(now) {
					self.schedule_background_refresh();
				}

				return Ok(payload.jwks);
			}
		}

		tracing::debug!("no usable key set; fetching inline");

		let outcome = self
			.refresh_blocking(Trigger::Lookup)
			.await
			.map_err(|err| Error::KeySourceUnavailable(Box::new(err)))?;

		if outcome.from_cache {
			self.observe_hit(false);
		} else {
			self.observe_miss();
		}

		Ok(outcome.jwks)
	}

	/// Fetch the key set now unless a usable one is already cached.
	pub async fn prime(&self) -> Result<()> {
		self.lookup().await.map(|_| ())
	}

	/// Revalidate the key set with the source right away.
	pub async fn refresh(&self) -> Result<()> {
		self.refresh_blocking(Trigger::Forced).await.map(|_| ())
	}

	/// Start a background task that keeps the key set fresh until the handle is shut down.
	pub fn spawn_refresher(&self) -> RefresherHandle {
		refresher::spawn(self.clone())
	}

	/// Point-in-time status of the cache.
	pub async fn status(&self) -> KeySetStatus {
		let captured_at = Instant::now();
		let captured_at_wallclock = Utc::now();
		let state = { self.entry.read().await.state().clone() };
		let payload = state.payload();
		let to_datetime =
			|instant: Instant| instant_to_datetime(captured_at, captured_at_wallclock, instant);

		KeySetStatus {
			source: self.source.name.clone(),
			state: state.label(),
			key_ids: payload
				.map(|payload| {
					payload.jwks.keys.iter().filter_map(|key| key.common.key_id.clone()).collect()
				})
				.unwrap_or_default(),
			etag: payload.and_then(|payload| payload.etag.clone()),
			last_refresh_at: payload.map(|payload| payload.last_refresh_at),
			expires_at: payload.and_then(|payload| to_datetime(payload.expires_at)),
			next_refresh_at: payload.and_then(|payload| to_datetime(payload.next_refresh_at)),
			stale: payload.is_some_and(|payload| payload.is_expired(captured_at)),
			error_count: payload.map_or(0, |payload| payload.error_count),
			metrics: self.metrics.snapshot(),
		}
	}

	/// Time until the refresher should wake next.
	pub(crate) async fn next_refresh_in(&self) -> Duration {
		let now = Instant::now();

		match self.entry.read().await.snapshot() {
			Some(payload) => payload.next_refresh_at.saturating_duration_since(now),
			None => self.source.retry_policy.max_backoff,
		}
	}

	/// Refresh only when the schedule says so; used by the refresher and background triggers.
	pub(crate) async fn refresh_due(&self) -> Result<()> {
		self.refresh_blocking(Trigger::Due).await.map(|_| ())
	}

	fn schedule_background_refresh(&self) {
		if self.background_pending.swap(true, Ordering::AcqRel) {
			return;
		}

		let cache = self.clone();

		tokio::spawn(async move {
			if let Err(err) = cache.refresh_due().await {
				tracing::debug!(error = %err, "background refresh failed");
			}

			cache.background_pending.store(false, Ordering::Release);
		});
	}

	#[tracing::instrument(skip(self), fields(source = %self.source.name))]
	async fn refresh_blocking(&self, trigger: Trigger) -> Result<RefreshOutcome> {
		let _guard = self.single_flight.lock().await;
		let now = Instant::now();
		let existing = { self.entry.read().await.snapshot() };

		if let Some(payload) = &existing {
			let satisfied = match trigger {
				Trigger::Lookup => !payload.is_expired(now),
				Trigger::Due => !payload.is_refresh_due(now),
				Trigger::Forced => false,
			};

			if satisfied {
				tracing::debug!("key set already refreshed by a concurrent caller");

				return Ok(RefreshOutcome { jwks: payload.jwks.clone(), from_cache: true });
			}
		}

		let request = self.prepare_request(existing.as_ref())?;

		{
			self.entry.write().await.begin_fetch();
		}

		self.perform_fetch_with_retry(request, existing).await
	}

	fn prepare_request(&self, existing: Option<&CachePayload>) -> Result<Request<()>> {
		let mut request = base_request(&self.source)?;

		if let Some(payload) = existing {
			if let BeforeRequest::Stale { request: parts, matches: true } =
				payload.policy.before_request(&request, SystemTime::now())
			{
				request = Request::from_parts(parts, ());
			}
			if let Some(etag) = &payload.etag
				&& let Ok(value) = HeaderValue::from_str(etag)
			{
				request.headers_mut().insert(IF_NONE_MATCH, value);
			}
		}

		Ok(request)
	}

	async fn perform_fetch_with_retry(
		&self,
		request: Request<()>,
		existing: Option<CachePayload>,
	) -> Result<RefreshOutcome> {
		let started = Instant::now();
		let mut executor = RetryExecutor::new(&self.source.retry_policy);
		let mut last_error = None;

		while let AttemptBudget::Granted { timeout } = executor.attempt_budget() {
			let attempt = fetch_jwks(&self.client, &self.source, &request, timeout)
				.await
				.and_then(|fetch| self.payload_from_fetch(fetch, existing.as_ref()));

			match attempt {
				Ok(payload) => {
					let jwks = payload.jwks.clone();

					{
						self.entry.write().await.fetch_success(payload);
					}

					self.observe_refresh_success(started.elapsed());

					return Ok(RefreshOutcome { jwks, from_cache: false });
				},
				Err(err) => {
					tracing::debug!(
						error = %err,
						attempt = executor.attempts_used() + 1,
						"key set fetch attempt failed"
					);

					last_error = Some(err);

					match executor.next_backoff() {
						Some(delay) if !delay.is_zero() => time::sleep(delay).await,
						Some(_) => {},
						None => break,
					}
				},
			}
		}

		let now = Instant::now();
		let error_count = existing.as_ref().map_or(0, |payload| payload.error_count);
		let backoff = self.source.retry_policy.compute_backoff(error_count);

		{
			self.entry.write().await.fetch_failure(now, backoff);
		}

		self.observe_refresh_error();

		let err = last_error.unwrap_or_else(|| Error::Cache("Refresh deadline exhausted.".into()));

		tracing::warn!(error = %err, ?backoff, "key set refresh failed");

		Err(err)
	}

	fn payload_from_fetch(
		&self,
		fetch: HttpFetch,
		existing: Option<&CachePayload>,
	) -> Result<CachePayload> {
		let now = Instant::now();

		tracing::debug!(
			status = %fetch.exchange.status(),
			cache_control = ?cache_control_header(fetch.exchange.headers()),
			"key set response received"
		);

		match (fetch.jwks, existing) {
			(Some(jwks), _) => {
				let freshness = evaluate_freshness(&self.source, &fetch.exchange);

				Ok(self.build_payload(jwks, freshness, fetch.etag, fetch.last_modified, now))
			},
			(None, Some(previous)) => {
				let revalidation = evaluate_revalidation(
					&self.source,
					&previous.policy,
					&fetch.exchange.request,
					&fetch.exchange.response,
				);

				tracing::debug!(modified = revalidation.modified, "key set revalidated");

				let etag = header_value(&revalidation.response, ETAG).or_else(|| previous.etag.clone());
				let last_modified = header_value(&revalidation.response, LAST_MODIFIED)
					.and_then(|raw| httpdate::parse_http_date(&raw).ok())
					.map(DateTime::<Utc>::from)
					.or(previous.last_modified);

				Ok(self.build_payload(
					previous.jwks.clone(),
					revalidation.freshness,
					etag,
					last_modified,
					now,
				))
			},
			(None, None) => Err(Error::Cache("Received 304 without a cached key set.".into())),
		}
	}

	fn build_payload(
		&self,
		jwks: Arc<JwkSet>,
		freshness: Freshness,
		etag: Option<String>,
		last_modified: Option<DateTime<Utc>>,
		now: Instant,
	) -> CachePayload {
		let ttl = freshness.ttl;
		let expires_at = now + ttl;
		let mut refresh_at = if self.source.refresh_early >= ttl {
			now + ttl / 2
		} else {
			expires_at - self.source.refresh_early
		};
		let jitter = random_jitter(self.source.prefetch_jitter);

		if refresh_at > now + jitter {
			refresh_at -= jitter;
		}

		let stale_deadline = (!self.source.stale_while_error.is_zero())
			.then(|| expires_at + self.source.stale_while_error);

		CachePayload {
			jwks,
			policy: freshness.policy,
			etag,
			last_modified,
			last_refresh_at: Utc::now(),
			expires_at,
			next_refresh_at: refresh_at,
			stale_deadline,
			retry_backoff: None,
			error_count: 0,
		}
	}

	fn observe_hit(&self, stale: bool) {
		metrics::record_lookup_hit(&self.source.name, stale);

		self.metrics.record_hit(stale);
	}

	fn observe_miss(&self) {
		metrics::record_lookup_miss(&self.source.name);

		self.metrics.record_miss();
	}

	fn observe_refresh_success(&self, duration: Duration) {
		metrics::record_refresh_success(&self.source.name, duration);

		self.metrics.record_refresh_success(duration);
	}

	fn observe_refresh_error(&self) {
		metrics::record_refresh_error(&self.source.name);

		self.metrics.record_refresh_error();
	}
}

/// Status report for the key-set cache.
#[derive(Clone, Debug, Serialize)]
pub struct KeySetStatus {
	/// Key source label.
	pub source: String,
	/// Lifecycle state (`empty`, `loading`, `ready`, `refreshing`).
	pub state: &'static str,
	/// Key ids present in the cached set.
	pub key_ids: Vec<String>,
	/// Entity tag of the cached set.
	pub etag: Option<String>,
	/// Last successful fetch or revalidation.
	pub last_refresh_at: Option<DateTime<Utc>>,
	/// When the cached set expires.
	pub expires_at: Option<DateTime<Utc>>,
	/// When the next proactive refresh is due.
	pub next_refresh_at: Option<DateTime<Utc>>,
	/// Whether the cached set is past expiry and served from the stale window.
	pub stale: bool,
	/// Consecutive refresh failures.
	pub error_count: u32,
	/// Lookup and refresh counters.
	#[serde(skip)]
	pub metrics: CacheMetricsSnapshot,
}

#[derive(Clone, Copy, Debug)]
enum Trigger {
	Lookup,
	Due,
	Forced,
}

#[derive(Debug)]
struct RefreshOutcome {
	jwks: Arc<JwkSet>,
	from_cache: bool,
}

fn instant_to_datetime(
	captured_at: Instant,
	captured_at_wallclock: DateTime<Utc>,
	instant: Instant,
) -> Option<DateTime<Utc>> {
	if let Some(delta) = instant.checked_duration_since(captured_at) {
		captured_at_wallclock.checked_add_signed(TimeDelta::from_std(delta).ok()?)
	} else {
		let delta = captured_at.checked_duration_since(instant)?;

		captured_at_wallclock.checked_sub_signed(TimeDelta::from_std(delta).ok()?)
	}
}

fn random_jitter(max: Duration) -> Duration {
	if max.is_zero() {
		return Duration::ZERO;
	}

	Duration::from_secs_f64(rand::rng().random_range(0.0..=max.as_secs_f64()))
}

fn header_value(response: &Response<()>, name: http::HeaderName) -> Option<String> {
	response.headers().get(name).and_then(|value| value.to_str().ok()).map(ToOwned::to_owned)
}
