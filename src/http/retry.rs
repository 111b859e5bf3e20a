//! Attempt budgeting and backoff for key-set fetches.

// self
use crate::{_prelude::*, config::RetryPolicy};

/// Result of budgeting a retry attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AttemptBudget {
	/// Another attempt may run within the given timeout.
	Granted {
		/// Timeout window allocated for the upcoming attempt.
		timeout: Duration,
	},
	/// Deadline reached; no further attempts allowed.
	Exhausted,
}

/// Tracks retries consumed and the overall deadline of one fetch sequence.
#[derive(Debug)]
pub struct RetryExecutor<'a> {
	policy: &'a RetryPolicy,
	deadline: Instant,
	retries_used: u32,
}
impl<'a> RetryExecutor<'a> {
	/// Start a new sequence; the deadline is measured from now.
	pub fn new(policy: &'a RetryPolicy) -> Self {
		let deadline = Instant::now() + policy.deadline;

		Self { policy, deadline, retries_used: 0 }
	}

	/// Budget the next attempt, returning either the permitted timeout or exhaustion.
	pub fn attempt_budget(&self) -> AttemptBudget {
		let timeout = self.remaining_budget().min(self.policy.attempt_timeout);

		if timeout.is_zero() { AttemptBudget::Exhausted } else { AttemptBudget::Granted { timeout } }
	}

	/// Whether another retry is permitted under the policy.
	pub fn can_retry(&self) -> bool {
		self.retries_used < self.policy.max_retries
	}

	/// Remaining wall-clock budget for the sequence.
	pub fn remaining_budget(&self) -> Duration {
		self.deadline.saturating_duration_since(Instant::now())
	}

	/// Number of retries already consumed.
	pub fn attempts_used(&self) -> u32 {
		self.retries_used
	}

	/// Consume a retry and compute its backoff, capped by the remaining budget.
	pub fn next_backoff(&mut self) -> Option<Duration> {
		if !self.can_retry() {
			tracing::debug!(attempt = self.retries_used, "retry budget exhausted");

			return None;
		}

		let attempt = self.retries_used;

		self.retries_used = self.retries_used.saturating_add(1);

		let remaining = self.remaining_budget();
		let delay = self.policy.compute_backoff(attempt).min(remaining);

		tracing::debug!(attempt = attempt + 1, ?delay, ?remaining, "retry backoff computed");

		Some(delay)
	}
}
