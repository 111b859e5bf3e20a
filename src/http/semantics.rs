//! HTTP cache semantics for key-set documents.

// crates.io
use http::{Method, Request, Response, Uri, header::ACCEPT};
use http_cache_semantics::{AfterResponse, CachePolicy};
// self
use crate::{_prelude::*, config::KeySource, http::client::HttpExchange};

/// Freshness derived from response headers and the source's TTL bounds.
#[derive(Clone, Debug)]
pub struct Freshness {
	/// TTL clamped to `[min_ttl, max_ttl]`.
	pub ttl: Duration,
	/// HTTP cache policy describing future request handling.
	pub policy: CachePolicy,
}

/// Result of applying conditional revalidation.
#[derive(Debug)]
pub struct Revalidation {
	/// Freshness resulting from the revalidation exchange.
	pub freshness: Freshness,
	/// Response synthesized from the revalidation outcome.
	pub response: Response<()>,
	/// Whether the upstream representation changed.
	pub modified: bool,
}

/// Build the baseline GET request for the key-set document.
pub fn base_request(source: &KeySource) -> Result<Request<()>> {
	let uri = source.jwks_url.as_str().parse::<Uri>().map_err(|err| Error::Validation {
		field: "jwks_url",
		reason: format!("Failed to convert URL to http::Uri: {err}."),
	})?;

	Request::builder()
		.method(Method::GET)
		.uri(uri)
		.header(ACCEPT, "application/json")
		.body(())
		.map_err(Error::from)
}

/// Evaluate cache headers of a fresh response to derive its TTL.
///
/// Non-storable responses fall back to `min_ttl`.
pub fn evaluate_freshness(source: &KeySource, exchange: &HttpExchange) -> Freshness {
	let policy = CachePolicy::new(&exchange.request, &exchange.response);
	let storable = policy.is_storable();
	let ttl = if storable {
		clamp_ttl(policy.time_to_live(SystemTime::now()), source.min_ttl, source.max_ttl)
	} else {
		source.min_ttl
	};

	tracing::debug!(?ttl, storable, "evaluated freshness");

	Freshness { ttl, policy }
}

/// Evaluate cache semantics after a conditional revalidation.
pub fn evaluate_revalidation(
	source: &KeySource,
	policy: &CachePolicy,
	request: &Request<()>,
	response: &Response<()>,
) -> Revalidation {
	let now = SystemTime::now();
	let (policy, parts, modified) = match policy.after_response(request, response, now) {
		AfterResponse::NotModified(policy, parts) => (policy, parts, false),
		AfterResponse::Modified(policy, parts) => (policy, parts, true),
	};
	let ttl = clamp_ttl(policy.time_to_live(now), source.min_ttl, source.max_ttl);

	Revalidation {
		freshness: Freshness { ttl, policy },
		response: Response::from_parts(parts, ()),
		modified,
	}
}

fn clamp_ttl(ttl: Duration, min: Duration, max: Duration) -> Duration {
	ttl.clamp(min, max)
}
