//! Subject token validation against the platform's key set.

// std
use std::collections::HashSet;
// crates.io
use async_trait::async_trait;
use jsonwebtoken::{
	Algorithm, DecodingKey, Validation,
	jwk::{Jwk, JwkSet},
};
use serde::Deserialize;
// self
use crate::{
	_prelude::*,
	cache::manager::KeySetCache,
	config::ValidatorConfig,
	identity::{PLATFORM_IDENTITY_CLAIM, PlatformIdentityClaim},
};

/// Turns a raw subject token into a validated platform identity.
#[async_trait]
pub trait SubjectTokenValidator: Send + Sync {
	/// Validate `raw` and return its identity claim.
	///
	/// Token problems yield [`Error::InvalidToken`]; failures to obtain verification keys yield
	/// [`Error::ValidationInfrastructure`].
	async fn validate(&self, raw: &str) -> Result<PlatformIdentityClaim>;
}

/// Validates Kubernetes service-account tokens.
#[derive(Clone, Debug)]
pub struct KubernetesTokenValidator {
	keys: KeySetCache,
	config: ValidatorConfig,
}
impl KubernetesTokenValidator {
	/// Create a validator reading keys from `keys`.
	pub fn new(keys: KeySetCache, config: ValidatorConfig) -> Self {
		Self { keys, config }
	}

	fn validation(&self, alg: Algorithm) -> Validation {
		let mut validation = Validation::new(alg);

		validation.leeway = self.config.leeway.as_secs();
		validation.validate_exp = true;
		validation.validate_nbf = true;
		validation.required_spec_claims = HashSet::from(["exp".to_owned()]);

		if !self.config.issuers.is_empty() {
			validation.set_issuer(&self.config.issuers);
		}
		if self.config.audiences.is_empty() {
			validation.validate_aud = false;
		} else {
			validation.set_audience(&self.config.audiences);
		}

		validation
	}
}
#[async_trait]
impl SubjectTokenValidator for KubernetesTokenValidator {
	#[tracing::instrument(skip_all)]
	async fn validate(&self, raw: &str) -> Result<PlatformIdentityClaim> {
		let header = jsonwebtoken::decode_header(raw)
			.map_err(|err| Error::InvalidToken(format!("Malformed token header: {err}.")))?;

		if is_symmetric(header.alg) {
			return Err(Error::InvalidToken(format!(
				"Algorithm {:?} is not accepted for subject tokens.",
				header.alg
			)));
		}

		let jwks = self
			.keys
			.lookup()
			.await
			.map_err(|err| Error::ValidationInfrastructure(Box::new(err)))?;
		let jwk = select_key(&jwks, header.kid.as_deref())?;
		let key = DecodingKey::from_jwk(jwk)
			.map_err(|err| Error::InvalidToken(format!("Unusable verification key: {err}.")))?;
		let data = jsonwebtoken::decode::<SubjectClaims>(raw, &key, &self.validation(header.alg))
			.map_err(|err| Error::InvalidToken(format!("Token rejected: {err}.")))?;
		let identity = data.claims.identity.ok_or_else(|| {
			Error::InvalidToken(format!("Missing {PLATFORM_IDENTITY_CLAIM} claim."))
		})?;
		let identity: PlatformIdentityClaim = serde_json::from_value(identity).map_err(|err| {
			Error::InvalidToken(format!("Malformed {PLATFORM_IDENTITY_CLAIM} claim: {err}."))
		})?;

		tracing::debug!(
			namespace = %identity.namespace,
			service_account = %identity.service_account.name,
			"subject token validated"
		);

		Ok(identity)
	}
}

#[derive(Debug, Deserialize)]
struct SubjectClaims {
	#[serde(rename = "kubernetes.io", default)]
	identity: Option<serde_json::Value>,
}

fn is_symmetric(alg: Algorithm) -> bool {
	matches!(alg, Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512)
}

// Without a `kid` the token can only be checked against a single-key set.
fn select_key<'a>(jwks: &'a JwkSet, kid: Option<&str>) -> Result<&'a Jwk> {
	match kid {
		Some(kid) => jwks.find(kid).ok_or_else(|| {
			tracing::debug!(kid, "subject token signed by unknown key");

			Error::InvalidToken(format!("No verification key with id {kid:?}."))
		}),
		None => match jwks.keys.as_slice() {
			[only] => Ok(only),
			_ => Err(Error::InvalidToken("Token header carries no key id.".into())),
		},
	}
}
