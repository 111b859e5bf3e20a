//! State transitions for the single cached key set.

// self
use crate::{
	_prelude::*,
	cache::state::{CachePayload, CacheState},
};

/// The cached key set together with its lifecycle state.
#[derive(Clone, Debug)]
pub struct CacheEntry {
	state: CacheState,
}
impl CacheEntry {
	/// Create an empty entry.
	pub fn new() -> Self {
		Self { state: CacheState::Empty }
	}

	/// Inspect the current state.
	pub fn state(&self) -> &CacheState {
		&self.state
	}

	/// Move into `Loading` (no payload) or `Refreshing` (payload present).
	///
	/// A fetch already marked as running leaves the state untouched.
	pub fn begin_fetch(&mut self) {
		self.state = match std::mem::replace(&mut self.state, CacheState::Empty) {
			CacheState::Empty => CacheState::Loading,
			CacheState::Ready(payload) => CacheState::Refreshing(payload),
			running => running,
		};
	}

	/// Install a freshly fetched or revalidated payload.
	pub fn fetch_success(&mut self, mut payload: CachePayload) {
		payload.reset_failures();

		self.state = CacheState::Ready(payload);
	}

	/// Record a failed fetch.
	///
	/// A payload that is still fresh or inside its stale window is kept and its next refresh
	/// deferred by `backoff`; otherwise the entry falls back to `Empty`.
	pub fn fetch_failure(&mut self, now: Instant, backoff: Duration) {
		self.state = match std::mem::replace(&mut self.state, CacheState::Empty) {
			CacheState::Refreshing(mut payload) | CacheState::Ready(mut payload)
				if payload.is_usable(now) =>
			{
				payload.bump_error(now, backoff);

				CacheState::Ready(payload)
			},
			_ => CacheState::Empty,
		};
	}

	/// Clone of the current payload, if any.
	pub fn snapshot(&self) -> Option<CachePayload> {
		self.state.payload().cloned()
	}
}
impl Default for CacheEntry {
	fn default() -> Self {
		Self::new()
	}
}
