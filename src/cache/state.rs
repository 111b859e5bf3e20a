//! Key-set lifecycle states and the payload carried by usable states.

// crates.io
use http_cache_semantics::CachePolicy;
use jsonwebtoken::jwk::JwkSet;
// self
use crate::_prelude::*;

/// A fetched key set plus the scheduling metadata derived from its response.
#[derive(Clone, Debug)]
pub struct CachePayload {
	/// Key set as last received from the source.
	pub jwks: Arc<JwkSet>,
	/// HTTP cache policy derived from the last response.
	pub policy: CachePolicy,
	/// Validator supplied by the origin, replayed as `If-None-Match`.
	pub etag: Option<String>,
	/// Last-Modified timestamp advertised by the origin.
	pub last_modified: Option<DateTime<Utc>>,
	/// Wall-clock time of the last successful fetch or revalidation.
	pub last_refresh_at: DateTime<Utc>,
	/// Instant after which the payload is expired.
	pub expires_at: Instant,
	/// Instant at which the next proactive refresh is due.
	///
	/// After a failed refresh this is pushed forward by the retry backoff.
	pub next_refresh_at: Instant,
	/// Last instant an expired payload may still be served.
	pub stale_deadline: Option<Instant>,
	/// Backoff applied after the most recent failed refresh.
	pub retry_backoff: Option<Duration>,
	/// Consecutive refresh failures.
	pub error_count: u32,
}
impl CachePayload {
	/// Whether the payload has exceeded its freshness window.
	pub fn is_expired(&self, now: Instant) -> bool {
		now >= self.expires_at
	}

	/// Whether an expired payload may still be served at `now`.
	pub fn can_serve_stale(&self, now: Instant) -> bool {
		self.stale_deadline.is_some_and(|deadline| now <= deadline)
	}

	/// Whether the payload can answer a lookup at `now`, fresh or stale.
	pub fn is_usable(&self, now: Instant) -> bool {
		!self.is_expired(now) || self.can_serve_stale(now)
	}

	/// Whether a proactive refresh is due.
	pub fn is_refresh_due(&self, now: Instant) -> bool {
		now >= self.next_refresh_at
	}

	/// Record a failed refresh and defer the next attempt by `backoff`.
	pub fn bump_error(&mut self, now: Instant, backoff: Duration) {
		self.error_count = self.error_count.saturating_add(1);
		self.retry_backoff = Some(backoff);
		self.next_refresh_at = now + backoff;
	}

	/// Clear failure bookkeeping after a successful refresh.
	pub fn reset_failures(&mut self) {
		self.error_count = 0;
		self.retry_backoff = None;
	}
}

/// Cache lifecycle states.
#[derive(Clone, Debug)]
pub enum CacheState {
	/// No payload and no work in progress.
	Empty,
	/// Initial fetch underway; nothing to serve yet.
	Loading,
	/// Payload available.
	Ready(CachePayload),
	/// Payload available while a refresh runs.
	Refreshing(CachePayload),
}
impl CacheState {
	/// Current payload, if the state carries one.
	pub fn payload(&self) -> Option<&CachePayload> {
		match self {
			Self::Ready(payload) | Self::Refreshing(payload) => Some(payload),
			Self::Empty | Self::Loading => None,
		}
	}

	/// Short name used in logs and status reports.
	pub fn label(&self) -> &'static str {
		match self {
			Self::Empty => "empty",
			Self::Loading => "loading",
			Self::Ready(_) => "ready",
			Self::Refreshing(_) => "refreshing",
		}
	}
}
