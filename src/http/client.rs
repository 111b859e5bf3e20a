//! HTTP client integration for key-set retrieval.

// crates.io
use http::{
	HeaderMap, Request, Response, StatusCode,
	header::{CACHE_CONTROL, ETAG, LAST_MODIFIED},
};
use jsonwebtoken::jwk::JwkSet;
use reqwest::{Client, redirect::Policy};
// self
use crate::{_prelude::*, config::KeySource, security};

/// Header-only view of a request/response pair, fed into cache semantics evaluation.
#[derive(Clone, Debug)]
pub struct HttpExchange {
	/// Request issued to the key source.
	pub request: Request<()>,
	/// Response metadata returned from the key source.
	pub response: Response<()>,
	/// Round-trip duration of the exchange.
	pub elapsed: Duration,
}
impl HttpExchange {
	/// Construct a new header-only exchange instance.
	pub fn new(request: Request<()>, response: Response<()>, elapsed: Duration) -> Self {
		Self { request, response, elapsed }
	}

	/// Response headers helper.
	pub fn headers(&self) -> &HeaderMap {
		self.response.headers()
	}

	/// Response status helper.
	pub fn status(&self) -> StatusCode {
		self.response.status()
	}
}

/// Outcome of a key-set fetch (200 or 304).
#[derive(Clone, Debug)]
pub struct HttpFetch {
	/// Captured exchange for cache evaluation.
	pub exchange: HttpExchange,
	/// Parsed key set when the origin returned content.
	pub jwks: Option<Arc<JwkSet>>,
	/// Entity tag advertised by the origin.
	pub etag: Option<String>,
	/// Last-Modified timestamp advertised by the origin.
	pub last_modified: Option<DateTime<Utc>>,
}

/// Build the reqwest client used for key-set retrieval.
///
/// Redirects are followed only while they satisfy the source's HTTPS and allowlist rules.
pub fn build_client(source: &KeySource) -> Result<Client> {
	let max_redirects = usize::from(source.max_redirects);
	let require_https = source.require_https;
	let allowed_domains = source.allowed_domains.clone();
	let redirect = Policy::custom(move |attempt| {
		if attempt.previous().len() >= max_redirects {
			return attempt.error(Error::Security("Too many redirects.".into()));
		}

		match security::check_redirect(attempt.url(), require_https, &allowed_domains) {
			Ok(()) => attempt.follow(),
			Err(err) => attempt.error(err),
		}
	});

	Ok(Client::builder()
		.redirect(redirect)
		.user_agent(format!("labid/{}", env!("CARGO_PKG_VERSION")))
		.connect_timeout(Duration::from_secs(5))
		.build()?)
}

/// Execute a single key-set request against the source.
pub async fn fetch_jwks(
	client: &Client,
	source: &KeySource,
	request: &Request<()>,
	attempt_timeout: Duration,
) -> Result<HttpFetch> {
	if source.require_https {
		security::enforce_https(&source.jwks_url)?;
	}

	let mut builder =
		client.request(request.method().clone(), source.jwks_url.clone()).timeout(attempt_timeout);

	for (name, value) in request.headers() {
		builder = builder.header(name, value);
	}

	let start = Instant::now();
	let mut response = builder.send().await?;
	let status = response.status();
	let mut response_builder = Response::builder().status(status);

	if let Some(headers) = response_builder.headers_mut() {
		headers.extend(response.headers().iter().map(|(name, value)| (name.clone(), value.clone())));
	}

	let response_template = response_builder.body(()).map_err(Error::from)?;
	let etag = header_string(response_template.headers(), ETAG);
	let last_modified = header_string(response_template.headers(), LAST_MODIFIED)
		.and_then(|raw| httpdate::parse_http_date(&raw).ok())
		.map(DateTime::<Utc>::from);

	if status == StatusCode::NOT_MODIFIED {
		let exchange = HttpExchange::new(request.clone(), response_template, start.elapsed());

		return Ok(HttpFetch { exchange, jwks: None, etag, last_modified });
	}
	if !status.is_success() {
		let body = response.text().await.ok();

		return Err(Error::HttpStatus { status, url: source.jwks_url.clone(), body });
	}
	if let Some(length) = response.content_length() {
		ensure_within_limit(length, source.max_response_bytes)?;
	}

	let mut body = Vec::new();

	while let Some(chunk) = response.chunk().await? {
		body.extend_from_slice(&chunk);
		ensure_within_limit(body.len() as u64, source.max_response_bytes)?;
	}

	let jwks: JwkSet = serde_json::from_slice(&body)?;
	let elapsed = start.elapsed();
	let exchange = HttpExchange::new(request.clone(), response_template, elapsed);

	tracing::debug!(
		source = %source.name,
		status = %status,
		keys = jwks.keys.len(),
		elapsed = ?elapsed,
		"key set fetch complete"
	);

	Ok(HttpFetch { exchange, jwks: Some(Arc::new(jwks)), etag, last_modified })
}

/// Extract the cache-control header as a string for diagnostics.
pub fn cache_control_header(headers: &HeaderMap) -> Option<String> {
	header_string(headers, CACHE_CONTROL)
}

fn header_string(headers: &HeaderMap, name: http::HeaderName) -> Option<String> {
	headers.get(name).and_then(|value| value.to_str().ok()).map(ToOwned::to_owned)
}

fn ensure_within_limit(size: u64, limit: u64) -> Result<()> {
	if size > limit {
		return Err(Error::Validation {
			field: "max_response_bytes",
			reason: format!(
				"Response size {size} bytes exceeds the configured guard of {limit} bytes."
			),
		});
	}

	Ok(())
}
