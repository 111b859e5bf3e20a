//! Credential minting: claim mapping, registered claims, and signing.

// std
use std::collections::HashSet;
// crates.io
use jsonwebtoken::Validation;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
// self
use crate::{
	_prelude::*,
	config::IssuerConfig,
	signing::{SIGNING_ALGORITHM, SigningKeyHolder},
};

/// Claims owned by the issuer; mappers may never write them.
pub const REGISTERED_CLAIMS: [&str; 7] = ["iss", "sub", "aud", "exp", "iat", "nbf", "scope"];

/// Extra claims contributed by mappers.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimSet(Map<String, Value>);
impl ClaimSet {
	/// Create an empty set.
	pub fn new() -> Self {
		Self::default()
	}

	/// Add a claim. Registered claims and claims already present are refused.
	pub fn insert<T>(&mut self, name: &str, value: T) -> Result<()>
	where
		T: Serialize,
	{
		if REGISTERED_CLAIMS.contains(&name) {
			return Err(Error::Validation {
				field: "claims",
				reason: format!("{name:?} is a registered claim and cannot be mapped."),
			});
		}
		if self.0.contains_key(name) {
			return Err(Error::Validation {
				field: "claims",
				reason: format!("{name:?} was already set by another mapper."),
			});
		}

		self.0.insert(name.to_owned(), serde_json::to_value(value)?);

		Ok(())
	}

	/// Look up a claim.
	pub fn get(&self, name: &str) -> Option<&Value> {
		self.0.get(name)
	}

	/// Number of claims.
	pub fn len(&self) -> usize {
		self.0.len()
	}

	/// Whether no claim was added.
	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}
}

/// Adds claims to a credential under construction.
///
/// Mappers cannot overwrite each other's claims, so their order does not matter.
pub trait ClaimMapper: Send + Sync {
	/// Write this mapper's claims into `claims`.
	fn apply(&self, claims: &mut ClaimSet) -> Result<()>;
}
impl<F> ClaimMapper for F
where
	F: Fn(&mut ClaimSet) -> Result<()> + Send + Sync,
{
	fn apply(&self, claims: &mut ClaimSet) -> Result<()> {
		self(claims)
	}
}

/// Payload of an issued credential.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CredentialClaims {
	/// Issuer identity.
	pub iss: String,
	/// Username of the caller.
	pub sub: String,
	/// Requested audiences, verbatim.
	#[serde(default, skip_serializing_if = "Vec::is_empty", deserialize_with = "one_or_many")]
	pub aud: Vec<String>,
	/// Issued-at, seconds since the epoch.
	pub iat: i64,
	/// Expiry, seconds since the epoch.
	pub exp: i64,
	/// Requested scopes, serialized comma-joined.
	///
	/// The exchange trims entries and drops blanks and repeats before issuing; unknown scope
	/// names are kept.
	#[serde(
		default,
		skip_serializing_if = "Vec::is_empty",
		serialize_with = "join_scopes",
		deserialize_with = "split_scopes"
	)]
	pub scope: Vec<String>,
	/// Claims contributed by mappers.
	#[serde(flatten)]
	pub extra: ClaimSet,
}

/// A signed credential and the claims it carries.
#[derive(Clone, Debug, PartialEq)]
pub struct SignedCredential {
	/// Compact JWS.
	pub token: String,
	/// Claims inside `token`.
	pub claims: CredentialClaims,
	/// Lifetime of the credential.
	pub expires_in: Duration,
}

/// Mints and verifies credentials signed with the service's own key.
#[derive(Clone, Debug)]
pub struct CredentialIssuer {
	config: IssuerConfig,
	key: Arc<SigningKeyHolder>,
}
impl CredentialIssuer {
	/// Create an issuer.
	pub fn new(config: IssuerConfig, key: Arc<SigningKeyHolder>) -> Self {
		Self { config, key }
	}

	/// Issuer settings.
	pub fn config(&self) -> &IssuerConfig {
		&self.config
	}

	/// Signing key used for issued credentials.
	pub fn signing_key(&self) -> &SigningKeyHolder {
		&self.key
	}

	/// Issue a credential valid from now.
	pub fn issue(
		&self,
		username: &str,
		audience: &[String],
		scopes: &[String],
		mappers: &[&dyn ClaimMapper],
	) -> Result<SignedCredential> {
		self.issue_at(Utc::now(), username, audience, scopes, mappers)
	}

	/// Issue a credential with an explicit issued-at time.
	///
	/// Identical inputs produce identical claims.
	pub fn issue_at(
		&self,
		now: DateTime<Utc>,
		username: &str,
		audience: &[String],
		scopes: &[String],
		mappers: &[&dyn ClaimMapper],
	) -> Result<SignedCredential> {
		let mut extra = ClaimSet::new();

		for mapper in mappers {
			mapper.apply(&mut extra).map_err(|err| Error::issuance("apply claim mapper", err))?;
		}

		let iat = now.timestamp();
		let lifetime = i64::try_from(self.config.lifetime.as_secs()).map_err(|_| {
			Error::issuance(
				"compute expiry",
				Error::Validation { field: "issuer.lifetime", reason: "Out of range.".into() },
			)
		})?;
		let claims = CredentialClaims {
			iss: self.config.issuer_id().to_owned(),
			sub: username.to_owned(),
			aud: audience.to_vec(),
			iat,
			exp: iat + lifetime,
			scope: scopes.to_vec(),
			extra,
		};
		let token = self.key.sign(&claims).map_err(|err| Error::issuance("sign credential", err))?;

		tracing::debug!(
			sub = %claims.sub,
			kid = %self.key.kid(),
			mapped_claims = claims.extra.len(),
			"credential issued"
		);

		Ok(SignedCredential { token, claims, expires_in: self.config.lifetime })
	}

	/// Verify a credential issued by this service and return its claims.
	pub fn verify(&self, token: &str) -> Result<CredentialClaims> {
		let mut validation = Validation::new(SIGNING_ALGORITHM);

		validation.set_issuer(&[self.config.issuer_id()]);
		validation.validate_aud = false;
		validation.required_spec_claims = HashSet::from(["exp".to_owned(), "iss".to_owned()]);

		let data = jsonwebtoken::decode::<CredentialClaims>(
			token,
			&self.key.decoding_key()?,
			&validation,
		)
		.map_err(|err| Error::InvalidToken(format!("Credential rejected: {err}.")))?;

		Ok(data.claims)
	}
}

fn join_scopes<S>(scopes: &[String], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
	S: Serializer,
{
	serializer.serialize_str(&scopes.join(","))
}

fn split_scopes<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = String::deserialize(deserializer)?;

	Ok(raw.split(',').filter(|scope| !scope.is_empty()).map(ToOwned::to_owned).collect())
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
	D: Deserializer<'de>,
{
	#[derive(Deserialize)]
	#[serde(untagged)]
	enum OneOrMany {
		One(String),
		Many(Vec<String>),
	}

	Ok(match OneOrMany::deserialize(deserializer)? {
		OneOrMany::One(value) => vec![value],
		OneOrMany::Many(values) => values,
	})
}
