//! Crate-wide error types, `Result` alias, and the caller-facing error taxonomy.

// crates.io
use http::StatusCode;
use serde::{Deserialize, Serialize};

/// Library-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the token exchange crate.
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum Error {
	#[error(transparent)]
	Io(#[from] std::io::Error),

	#[error(transparent)]
	Http(#[from] http::Error),
	#[error(transparent)]
	Jsonwebtoken(#[from] jsonwebtoken::errors::Error),
	#[error(transparent)]
	Reqwest(#[from] reqwest::Error),
	#[error(transparent)]
	Serde(#[from] serde_json::Error),
	#[error(transparent)]
	Url(#[from] url::ParseError),

	#[error("Cache error: {0}")]
	Cache(String),
	#[error("Upstream HTTP status {status} from {url}: {body:?}")]
	HttpStatus { status: StatusCode, url: url::Url, body: Option<String> },
	#[error("Metrics error: {0}")]
	Metrics(String),
	#[error("Security violation: {0}")]
	Security(String),
	#[error("Validation failed for {field}: {reason}")]
	Validation { field: &'static str, reason: String },

	#[error("Invalid exchange request: {0}")]
	InvalidRequest(String),
	#[error("Invalid subject token: {0}")]
	InvalidToken(String),
	#[error("Namespace {namespace:?} does not carry the prefix {prefix:?}.")]
	InvalidNamespace { namespace: String, prefix: String },
	#[error("Service account {service_account:?} in {namespace:?} has no associated group.")]
	GroupNotAssigned { service_account: String, namespace: String },
	#[error("Directory has no principal {principal:?}.")]
	PrincipalNotFound { principal: String },
	#[error("Upstream {service} unavailable: {reason}")]
	UpstreamUnavailable { service: &'static str, reason: String },
	#[error("Key source unavailable: {0}")]
	KeySourceUnavailable(#[source] Box<Error>),
	#[error("Token validation could not complete: {0}")]
	ValidationInfrastructure(#[source] Box<Error>),
	#[error("Credential issuance failed: {context}")]
	Issuance {
		context: String,
		#[source]
		source: Option<Box<Error>>,
	},
	#[error("Invalid key material: {0}")]
	InvalidKeyMaterial(String),
}
impl Error {
	/// Wrap an error raised while building or signing a credential.
	pub fn issuance(context: impl Into<String>, source: Error) -> Self {
		Self::Issuance { context: context.into(), source: Some(Box::new(source)) }
	}

	/// Classify the error into the caller-visible taxonomy.
	pub fn kind(&self) -> ErrorKind {
		match self {
			Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
			Self::InvalidToken(_) => ErrorKind::InvalidToken,
			Self::InvalidNamespace { .. } => ErrorKind::InvalidNamespace,
			Self::GroupNotAssigned { .. } => ErrorKind::GroupNotAssigned,
			Self::PrincipalNotFound { .. } => ErrorKind::PrincipalNotFound,
			Self::UpstreamUnavailable { .. } => ErrorKind::UpstreamUnavailable,
			Self::KeySourceUnavailable(_) => ErrorKind::KeySourceUnavailable,
			Self::ValidationInfrastructure(_) => ErrorKind::ValidationInfrastructure,
			Self::Issuance { .. } => ErrorKind::Issuance,
			Self::InvalidKeyMaterial(_) => ErrorKind::InvalidKeyMaterial,
			_ => ErrorKind::Internal,
		}
	}

	/// Whether the variant (or the key-source failure it wraps) means no key set is available.
	pub fn is_key_source_unavailable(&self) -> bool {
		match self {
			Self::KeySourceUnavailable(_) => true,
			Self::ValidationInfrastructure(inner) => inner.is_key_source_unavailable(),
			_ => false,
		}
	}

	/// Render the error as an HTTP status and response body.
	///
	/// Caller errors carry a description; infrastructure errors only carry the code and are
	/// logged here with full context instead.
	pub fn to_response(&self) -> (StatusCode, ErrorResponse) {
		let kind = self.kind();
		let status = kind.status();

		if kind.is_client_error() {
			return (
				status,
				ErrorResponse {
					error: kind.error_code().into(),
					error_description: Some(self.to_string()),
				},
			);
		}

		tracing::error!(kind = ?kind, error = %self, "token exchange failed");

		(status, ErrorResponse { error: kind.error_code().into(), error_description: None })
	}
}

/// Caller-visible error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
	/// Malformed exchange parameters.
	InvalidRequest,
	/// Subject token failed cryptographic or structural validation.
	InvalidToken,
	/// Valid token carrying an unexpected identity shape.
	InvalidNamespace,
	/// Workload has no group annotation.
	GroupNotAssigned,
	/// Directory has no such principal.
	PrincipalNotFound,
	/// Workload-metadata or directory service failed.
	UpstreamUnavailable,
	/// Token validation could not run to completion.
	ValidationInfrastructure,
	/// No key set has ever been obtained from the key source.
	KeySourceUnavailable,
	/// Signing or claim mapping failed after all data was gathered.
	Issuance,
	/// Signing key material could not be loaded.
	InvalidKeyMaterial,
	/// Any other internal failure.
	Internal,
}
impl ErrorKind {
	/// HTTP status the kind maps to.
	pub fn status(self) -> StatusCode {
		match self {
			Self::InvalidRequest
			| Self::InvalidToken
			| Self::InvalidNamespace
			| Self::GroupNotAssigned
			| Self::PrincipalNotFound => StatusCode::BAD_REQUEST,
			Self::UpstreamUnavailable
			| Self::ValidationInfrastructure
			| Self::KeySourceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
			Self::Issuance | Self::InvalidKeyMaterial | Self::Internal =>
				StatusCode::INTERNAL_SERVER_ERROR,
		}
	}

	/// Whether the caller caused the failure.
	pub fn is_client_error(self) -> bool {
		self.status().is_client_error()
	}

	/// Whether a caller may reasonably retry the same request later.
	pub fn is_retryable(self) -> bool {
		matches!(
			self,
			Self::UpstreamUnavailable | Self::ValidationInfrastructure | Self::KeySourceUnavailable
		)
	}

	/// Machine-readable OAuth-style error code.
	pub fn error_code(self) -> &'static str {
		match self {
			Self::InvalidRequest | Self::InvalidToken => "invalid_request",
			Self::InvalidNamespace => "invalid_grant",
			Self::GroupNotAssigned | Self::PrincipalNotFound => "invalid_scope",
			Self::UpstreamUnavailable
			| Self::ValidationInfrastructure
			| Self::KeySourceUnavailable => "temporarily_unavailable",
			Self::Issuance | Self::InvalidKeyMaterial | Self::Internal => "server_error",
		}
	}
}

/// Error body returned to exchange callers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
	/// OAuth-style error code.
	pub error: String,
	/// Human-readable description, present for caller errors only.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub error_description: Option<String>,
}
