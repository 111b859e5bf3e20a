//! Configuration types and validation.
//!
//! Every struct deserializes with sensible defaults and exposes a `validate` method that is
//! expected to run once at startup, before any request is served.

// std
use std::{cell::RefCell, fmt, mem, path::PathBuf};
// crates.io
use rand::{Rng, SeedableRng, rngs::SmallRng};
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{_prelude::*, security};

thread_local! {
	static SMALL_RNG: RefCell<SmallRng> = RefCell::new(SmallRng::from_rng(&mut rand::rng()));
}

/// Default refresh lead time before TTL expiry.
pub const DEFAULT_REFRESH_EARLY: Duration = Duration::from_secs(30);
/// Default window for serving the last-known-good key set after it expired.
pub const DEFAULT_STALE_WHILE_ERROR: Duration = Duration::from_secs(60 * 60 * 24);
/// Minimum accepted TTL for upstream responses.
pub const MIN_TTL_FLOOR: Duration = Duration::from_secs(30);
/// Default maximum TTL clamp.
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(60 * 60);
/// Default size guard (1 MiB).
pub const DEFAULT_MAX_RESPONSE_BYTES: u64 = 1_048_576;
/// Default prefetch jitter.
pub const DEFAULT_PREFETCH_JITTER: Duration = Duration::from_secs(5);
/// Maximum redirect depth.
pub const MAX_REDIRECTS: u8 = 10;
/// Default clock skew tolerated when validating subject tokens.
pub const DEFAULT_LEEWAY: Duration = Duration::from_secs(60);
/// Default lifetime of issued credentials.
pub const DEFAULT_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(60 * 60);
/// Longest credential lifetime accepted by validation.
pub const MAX_CREDENTIAL_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24);
/// Default namespace prefix carried by user workloads.
pub const DEFAULT_NAMESPACE_PREFIX: &str = "user-ssb-";
/// Default annotation holding a workload's current group.
pub const DEFAULT_GROUP_ANNOTATION: &str = "dapla.ssb.no/impersonate-group";
/// Default domain appended to usernames for directory lookups.
pub const DEFAULT_PRINCIPAL_DOMAIN: &str = "ssb.no";
/// Default deadline for a whole exchange.
pub const DEFAULT_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);
/// Default timeout for calls to the workload-metadata and directory services.
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Supported jitter strategies for retry policies.
#[derive(Clone, Debug, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
	/// No jitter; deterministic backoff schedule.
	None,
	/// Full jitter; randomize delay between 0 and current backoff.
	#[default]
	Full,
	/// Decorrelated jitter per AWS architecture guidance.
	Decorrelated,
}

/// Retry configuration for key-set fetch operations.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryPolicy {
	/// Maximum number of retry attempts to perform after the initial request.
	pub max_retries: u32,
	/// Timeout applied to each individual HTTP attempt.
	pub attempt_timeout: Duration,
	/// Initial delay before retrying after a failure.
	pub initial_backoff: Duration,
	/// Upper bound applied to exponential backoff growth.
	pub max_backoff: Duration,
	/// Overall deadline that bounds the entire retry sequence.
	pub deadline: Duration,
	/// Strategy used to randomize the computed backoff.
	#[serde(default)]
	pub jitter: JitterStrategy,
}
impl RetryPolicy {
	/// Validate invariants for retry configuration.
	pub fn validate(&self) -> Result<()> {
		if self.attempt_timeout < Duration::from_millis(100) {
			return Err(Error::Validation {
				field: "retry_policy.attempt_timeout",
				reason: "Must be at least 100 ms.".into(),
			});
		}
		if self.initial_backoff.is_zero() {
			return Err(Error::Validation {
				field: "retry_policy.initial_backoff",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_backoff < self.initial_backoff {
			return Err(Error::Validation {
				field: "retry_policy.max_backoff",
				reason: "Must be greater than or equal to initial_backoff.".into(),
			});
		}
		if self.deadline < self.attempt_timeout {
			return Err(Error::Validation {
				field: "retry_policy.deadline",
				reason: "Must be greater than or equal to attempt_timeout.".into(),
			});
		}

		Ok(())
	}

	/// Exponential backoff for the given retry attempt, randomized by the jitter strategy.
	pub fn compute_backoff(&self, attempt: u32) -> Duration {
		let exponent = attempt.min(32);
		let base = self.initial_backoff.mul_f64(2f64.powi(exponent as i32));
		let bounded = base.min(self.max_backoff).max(self.initial_backoff);

		match self.jitter {
			JitterStrategy::None => bounded,
			JitterStrategy::Full => {
				let lower = bounded.mul_f64(0.8).max(self.initial_backoff);
				let upper = bounded.min(self.max_backoff);

				random_within(lower, upper)
			},
			JitterStrategy::Decorrelated => {
				let prev = if attempt == 0 { self.initial_backoff } else { bounded };
				let ceiling = self.max_backoff.min(prev.mul_f64(3.0));

				random_within(self.initial_backoff, ceiling.max(self.initial_backoff))
			},
		}
	}
}
impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_retries: 2,
			attempt_timeout: Duration::from_secs(3),
			initial_backoff: Duration::from_millis(250),
			max_backoff: Duration::from_secs(2),
			deadline: Duration::from_secs(8),
			jitter: JitterStrategy::Full,
		}
	}
}

/// Where and how to fetch the platform's token verification keys.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KeySource {
	/// Short label used in logs and metrics.
	#[serde(default = "default_source_name")]
	pub name: String,
	/// URL of the key-set document.
	pub jwks_url: Url,
	/// Whether HTTPS is required for key-set retrieval.
	#[serde(default = "default_true")]
	pub require_https: bool,
	/// Optional allowlist of domains the key-set URL may point at.
	#[serde(default, deserialize_with = "crate::security::deserialize_allowed_domains")]
	pub allowed_domains: Vec<String>,
	/// Lead time before expiry to trigger proactive refresh.
	#[serde(default = "default_refresh_early")]
	pub refresh_early: Duration,
	/// How long an expired key set keeps being served while refreshes fail.
	#[serde(default = "default_stale_while_error")]
	pub stale_while_error: Duration,
	/// Minimum TTL applied to upstream responses.
	#[serde(default = "default_min_ttl")]
	pub min_ttl: Duration,
	/// Maximum TTL applied to upstream responses.
	#[serde(default = "default_max_ttl")]
	pub max_ttl: Duration,
	/// Maximum size allowed for key-set payloads in bytes.
	#[serde(default = "default_max_response_bytes")]
	pub max_response_bytes: u64,
	/// Maximum number of redirects to follow during fetch.
	#[serde(default = "default_max_redirects")]
	pub max_redirects: u8,
	/// Random jitter applied when scheduling proactive refreshes.
	#[serde(default = "default_prefetch_jitter")]
	pub prefetch_jitter: Duration,
	/// Retry policy for fetch attempts.
	#[serde(default)]
	pub retry_policy: RetryPolicy,
}
impl KeySource {
	/// Construct a key source with default cache settings.
	pub fn new(jwks_url: impl AsRef<str>) -> Result<Self> {
		let jwks_url = Url::parse(jwks_url.as_ref())?;

		Ok(Self {
			name: default_source_name(),
			jwks_url,
			require_https: true,
			allowed_domains: Vec::new(),
			refresh_early: DEFAULT_REFRESH_EARLY,
			stale_while_error: DEFAULT_STALE_WHILE_ERROR,
			min_ttl: MIN_TTL_FLOOR,
			max_ttl: DEFAULT_MAX_TTL,
			max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
			max_redirects: default_max_redirects(),
			prefetch_jitter: DEFAULT_PREFETCH_JITTER,
			retry_policy: RetryPolicy::default(),
		})
	}

	/// Set HTTPS requirement to the desired value.
	pub fn with_require_https(mut self, require_https: bool) -> Self {
		self.require_https = require_https;

		self
	}

	/// Canonicalise the domain allowlist in-place.
	pub fn normalize_allowed_domains(&mut self) {
		let domains = mem::take(&mut self.allowed_domains);

		self.allowed_domains = security::normalize_allowlist(domains);
	}

	/// Validate the key source against the documented constraints.
	pub fn validate(&self) -> Result<()> {
		validate_source_name(&self.name)?;

		if self.require_https {
			security::enforce_https(&self.jwks_url)?;
		}

		if let Some(host) = self.jwks_url.host_str() {
			if !security::host_is_allowed(host, &self.allowed_domains) {
				return Err(Error::Validation {
					field: "jwks_url",
					reason: "Host is not within the allowed_domains allowlist.".into(),
				});
			}
		} else {
			return Err(Error::Validation {
				field: "jwks_url",
				reason: "Must include a host component.".into(),
			});
		}

		if self.refresh_early < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "refresh_early",
				reason: "Must be at least 1 second.".into(),
			});
		}
		if self.min_ttl < MIN_TTL_FLOOR {
			return Err(Error::Validation {
				field: "min_ttl",
				reason: format!("Must be at least {:?}.", MIN_TTL_FLOOR),
			});
		}
		if self.max_ttl < self.min_ttl {
			return Err(Error::Validation {
				field: "max_ttl",
				reason: "Must be greater than or equal to min_ttl.".into(),
			});
		}
		if self.refresh_early >= self.max_ttl {
			return Err(Error::Validation {
				field: "refresh_early",
				reason: "Must be less than max_ttl.".into(),
			});
		}
		if self.max_response_bytes == 0 {
			return Err(Error::Validation {
				field: "max_response_bytes",
				reason: "Must be greater than zero.".into(),
			});
		}
		if self.max_redirects > MAX_REDIRECTS {
			return Err(Error::Validation {
				field: "max_redirects",
				reason: format!("Must be less than or equal to {}.", MAX_REDIRECTS),
			});
		}

		self.retry_policy.validate()?;

		for domain in &self.allowed_domains {
			match security::canonicalize_dns_name(domain) {
				Some(canonical) if canonical == *domain => {},
				Some(_) => {
					return Err(Error::Validation {
						field: "allowed_domains",
						reason: "Entries must be canonical hostnames (lowercase, no trailing dot)."
							.into(),
					});
				},
				None => {
					return Err(Error::Validation {
						field: "allowed_domains",
						reason: "Entries must be non-empty hostnames.".into(),
					});
				},
			}
		}

		Ok(())
	}
}

/// Subject token validation settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ValidatorConfig {
	/// Clock skew tolerated for `exp` and `nbf`.
	#[serde(default = "default_leeway")]
	pub leeway: Duration,
	/// Accepted `iss` values; empty accepts any issuer.
	#[serde(default)]
	pub issuers: Vec<String>,
	/// Accepted `aud` values; empty skips the audience check.
	#[serde(default)]
	pub audiences: Vec<String>,
}
impl ValidatorConfig {
	/// Validate invariants for subject token validation.
	pub fn validate(&self) -> Result<()> {
		if self.leeway > Duration::from_secs(300) {
			return Err(Error::Validation {
				field: "validator.leeway",
				reason: "Must be at most 5 minutes.".into(),
			});
		}
		if self.issuers.iter().any(|issuer| issuer.trim().is_empty()) {
			return Err(Error::Validation {
				field: "validator.issuers",
				reason: "Entries must not be empty.".into(),
			});
		}

		Ok(())
	}
}
impl Default for ValidatorConfig {
	fn default() -> Self {
		Self { leeway: DEFAULT_LEEWAY, issuers: Vec::new(), audiences: Vec::new() }
	}
}

/// Settings for credentials minted by this service.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IssuerConfig {
	/// Public identity of this service, used as `iss` and as the discovery base.
	pub issuer: Url,
	/// Lifetime of issued credentials.
	#[serde(default = "default_credential_lifetime")]
	pub lifetime: Duration,
}
impl IssuerConfig {
	/// Construct an issuer configuration with the default lifetime.
	pub fn new(issuer: impl AsRef<str>) -> Result<Self> {
		Ok(Self { issuer: Url::parse(issuer.as_ref())?, lifetime: DEFAULT_CREDENTIAL_LIFETIME })
	}

	/// Issuer identity as it appears in the `iss` claim (no trailing slash).
	pub fn issuer_id(&self) -> &str {
		self.issuer.as_str().trim_end_matches('/')
	}

	/// Validate invariants for credential issuance.
	pub fn validate(&self) -> Result<()> {
		if self.issuer.host_str().is_none() {
			return Err(Error::Validation {
				field: "issuer.issuer",
				reason: "Must include a host component.".into(),
			});
		}
		if self.lifetime < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "issuer.lifetime",
				reason: "Must be at least 1 second.".into(),
			});
		}
		if self.lifetime > MAX_CREDENTIAL_LIFETIME {
			return Err(Error::Validation {
				field: "issuer.lifetime",
				reason: format!("Must be at most {:?}.", MAX_CREDENTIAL_LIFETIME),
			});
		}

		Ok(())
	}
}

/// Settings for the current-group resolver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CurrentGroupConfig {
	/// Service-account annotation holding the group name.
	#[serde(default = "default_group_annotation")]
	pub annotation: String,
}
impl Default for CurrentGroupConfig {
	fn default() -> Self {
		Self { annotation: default_group_annotation() }
	}
}

/// Settings for the all-groups resolver.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AllGroupsConfig {
	/// Domain appended to usernames to form principal emails.
	#[serde(default = "default_principal_domain")]
	pub principal_domain: String,
}
impl AllGroupsConfig {
	/// Validate the principal domain.
	pub fn validate(&self) -> Result<()> {
		if security::canonicalize_dns_name(&self.principal_domain).is_none()
			|| self.principal_domain.contains('@')
		{
			return Err(Error::Validation {
				field: "all_groups.principal_domain",
				reason: "Must be a non-empty DNS name.".into(),
			});
		}

		Ok(())
	}
}
impl Default for AllGroupsConfig {
	fn default() -> Self {
		Self { principal_domain: default_principal_domain() }
	}
}

/// Orchestrator settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExchangeConfig {
	/// Credential issuance settings.
	pub issuer: IssuerConfig,
	/// Subject token validation settings.
	#[serde(default)]
	pub validator: ValidatorConfig,
	/// Namespace prefix stripped to derive usernames.
	#[serde(default = "default_namespace_prefix")]
	pub namespace_prefix: String,
	/// Deadline for a whole exchange, upstream calls included.
	#[serde(default = "default_exchange_timeout")]
	pub exchange_timeout: Duration,
	/// Enables the `current_group` scope.
	#[serde(default)]
	pub current_group: Option<CurrentGroupConfig>,
	/// Enables the `all_groups` scope.
	#[serde(default)]
	pub all_groups: Option<AllGroupsConfig>,
}
impl ExchangeConfig {
	/// Construct a configuration with defaults and no resolvers enabled.
	pub fn new(issuer: IssuerConfig) -> Self {
		Self {
			issuer,
			validator: ValidatorConfig::default(),
			namespace_prefix: default_namespace_prefix(),
			exchange_timeout: DEFAULT_EXCHANGE_TIMEOUT,
			current_group: None,
			all_groups: None,
		}
	}

	/// Validate the whole orchestrator configuration.
	pub fn validate(&self) -> Result<()> {
		self.issuer.validate()?;
		self.validator.validate()?;

		if self.namespace_prefix.is_empty() {
			return Err(Error::Validation {
				field: "namespace_prefix",
				reason: "Must not be empty.".into(),
			});
		}
		if self.exchange_timeout < Duration::from_secs(1) {
			return Err(Error::Validation {
				field: "exchange_timeout",
				reason: "Must be at least 1 second.".into(),
			});
		}
		if let Some(current_group) = &self.current_group
			&& current_group.annotation.trim().is_empty()
		{
			return Err(Error::Validation {
				field: "current_group.annotation",
				reason: "Must not be empty.".into(),
			});
		}
		if let Some(all_groups) = &self.all_groups {
			all_groups.validate()?;
		}

		Ok(())
	}
}

/// Connection settings for the Kubernetes API.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KubernetesConfig {
	/// API server base URL.
	pub api_url: Url,
	/// File holding the bearer token used against the API server.
	#[serde(default = "default_kubernetes_token_path")]
	pub token_path: PathBuf,
	/// PEM bundle trusted for the API server certificate.
	#[serde(default)]
	pub ca_path: Option<PathBuf>,
	/// Timeout for a single API call.
	#[serde(default = "default_upstream_timeout")]
	pub timeout: Duration,
}
impl KubernetesConfig {
	/// Settings for a process running inside the cluster with a mounted service account.
	pub fn in_cluster() -> Result<Self> {
		Ok(Self {
			api_url: Url::parse(IN_CLUSTER_API_URL)?,
			token_path: default_kubernetes_token_path(),
			ca_path: Some(PathBuf::from(IN_CLUSTER_CA_PATH)),
			timeout: DEFAULT_UPSTREAM_TIMEOUT,
		})
	}

	/// Validate the API connection settings.
	pub fn validate(&self) -> Result<()> {
		if self.api_url.host_str().is_none() {
			return Err(Error::Validation {
				field: "kubernetes.api_url",
				reason: "Must include a host component.".into(),
			});
		}
		if self.timeout.is_zero() {
			return Err(Error::Validation {
				field: "kubernetes.timeout",
				reason: "Must be greater than zero.".into(),
			});
		}

		Ok(())
	}
}

/// Connection settings for the team directory API.
#[derive(Clone, Serialize, Deserialize)]
pub struct TeamApiConfig {
	/// Base URL of the team API.
	pub base_url: Url,
	/// OAuth2 token endpoint used for client credentials.
	pub token_url: Url,
	/// OAuth2 client id.
	pub client_id: String,
	/// OAuth2 client secret.
	pub client_secret: String,
	/// Timeout for a single API call.
	#[serde(default = "default_upstream_timeout")]
	pub timeout: Duration,
}
impl TeamApiConfig {
	/// Validate the directory connection settings.
	pub fn validate(&self) -> Result<()> {
		if self.client_id.is_empty() {
			return Err(Error::Validation {
				field: "team_api.client_id",
				reason: "Must not be empty.".into(),
			});
		}
		if self.timeout.is_zero() {
			return Err(Error::Validation {
				field: "team_api.timeout",
				reason: "Must be greater than zero.".into(),
			});
		}

		Ok(())
	}
}
impl fmt::Debug for TeamApiConfig {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TeamApiConfig")
			.field("base_url", &self.base_url.as_str())
			.field("token_url", &self.token_url.as_str())
			.field("client_id", &self.client_id)
			.field("client_secret", &"<redacted>")
			.field("timeout", &self.timeout)
			.finish()
	}
}

const IN_CLUSTER_API_URL: &str = "https://kubernetes.default.svc";
const IN_CLUSTER_CA_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/ca.crt";

fn random_within(min: Duration, max: Duration) -> Duration {
	if max <= min {
		return max;
	}
	SMALL_RNG.with(|cell| {
		let mut rng = cell.borrow_mut();
		let nanos = max.as_nanos() - min.as_nanos();
		let jitter = rng.random_range(0..=nanos.min(u64::MAX as u128));

		min + Duration::from_nanos(jitter as u64)
	})
}

fn default_true() -> bool {
	true
}

fn default_source_name() -> String {
	"kubernetes".into()
}

fn default_refresh_early() -> Duration {
	DEFAULT_REFRESH_EARLY
}

fn default_stale_while_error() -> Duration {
	DEFAULT_STALE_WHILE_ERROR
}

fn default_min_ttl() -> Duration {
	MIN_TTL_FLOOR
}

fn default_max_ttl() -> Duration {
	DEFAULT_MAX_TTL
}

fn default_max_response_bytes() -> u64 {
	DEFAULT_MAX_RESPONSE_BYTES
}

fn default_max_redirects() -> u8 {
	3
}

fn default_prefetch_jitter() -> Duration {
	DEFAULT_PREFETCH_JITTER
}

fn default_leeway() -> Duration {
	DEFAULT_LEEWAY
}

fn default_credential_lifetime() -> Duration {
	DEFAULT_CREDENTIAL_LIFETIME
}

fn default_namespace_prefix() -> String {
	DEFAULT_NAMESPACE_PREFIX.into()
}

fn default_group_annotation() -> String {
	DEFAULT_GROUP_ANNOTATION.into()
}

fn default_principal_domain() -> String {
	DEFAULT_PRINCIPAL_DOMAIN.into()
}

fn default_exchange_timeout() -> Duration {
	DEFAULT_EXCHANGE_TIMEOUT
}

fn default_upstream_timeout() -> Duration {
	DEFAULT_UPSTREAM_TIMEOUT
}

fn default_kubernetes_token_path() -> PathBuf {
	PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

fn validate_source_name(value: &str) -> Result<()> {
	if value.is_empty() {
		return Err(Error::Validation { field: "name", reason: "Must not be empty.".into() });
	}
	if value.len() > 64 {
		return Err(Error::Validation {
			field: "name",
			reason: "Must be 64 characters or fewer.".into(),
		});
	}
	if !value.as_bytes().iter().all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_')) {
		return Err(Error::Validation {
			field: "name",
			reason: "May only contain ASCII letters, numbers, '-', or '_'.".into(),
		});
	}

	Ok(())
}
