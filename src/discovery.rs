//! Publication of the service's public key and discovery metadata.

// crates.io
use jsonwebtoken::jwk::JwkSet;
use serde::{Deserialize, Serialize};
use url::Url;
// self
use crate::{
	_prelude::*,
	config::ExchangeConfig,
	exchange::TOKEN_EXCHANGE_GRANT_TYPE,
	resolver::{ALL_GROUPS_CLAIM, CURRENT_GROUP_CLAIM, Scope},
	signing::{SIGNING_ALGORITHM, SigningKeyHolder},
};

/// Path of the discovery document, relative to the issuer.
pub const DISCOVERY_PATH: &str = ".well-known/openid-configuration";
/// Path of the published key set, relative to the issuer.
pub const JWKS_PATH: &str = "jwks";
/// Path of the token endpoint, relative to the issuer.
pub const TOKEN_PATH: &str = "token";

/// Key set holding only the service's public key.
pub fn public_jwks(key: &SigningKeyHolder) -> JwkSet {
	key.jwk_set()
}

/// OpenID-style metadata describing where keys and the token endpoint live.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
	/// Issuer identity, identical to the `iss` of issued credentials.
	pub issuer: String,
	/// Location of [`public_jwks`].
	pub jwks_uri: Url,
	/// Location of the exchange endpoint.
	pub token_endpoint: Url,
	/// Accepted grant types.
	pub grant_types_supported: Vec<String>,
	/// Scopes with an enabled resolver.
	pub scopes_supported: Vec<String>,
	/// Claims issued credentials may carry.
	pub claims_supported: Vec<String>,
	/// Algorithms used to sign credentials.
	pub id_token_signing_alg_values_supported: Vec<String>,
}
impl DiscoveryDocument {
	/// Describe the service configured by `config`.
	pub fn new(config: &ExchangeConfig) -> Result<Self> {
		let base = issuer_base(&config.issuer.issuer);
		let mut scopes_supported = Vec::new();
		let mut claims_supported = ["iss", "sub", "aud", "iat", "exp", "scope"]
			.into_iter()
			.map(ToOwned::to_owned)
			.collect::<Vec<_>>();

		if config.current_group.is_some() {
			scopes_supported.push(Scope::CurrentGroup.to_string());
			claims_supported.push(CURRENT_GROUP_CLAIM.into());
		}
		if config.all_groups.is_some() {
			scopes_supported.push(Scope::AllGroups.to_string());
			claims_supported.push(ALL_GROUPS_CLAIM.into());
		}

		Ok(Self {
			issuer: config.issuer.issuer_id().to_owned(),
			jwks_uri: base.join(JWKS_PATH)?,
			token_endpoint: base.join(TOKEN_PATH)?,
			grant_types_supported: vec![TOKEN_EXCHANGE_GRANT_TYPE.into()],
			scopes_supported,
			claims_supported,
			id_token_signing_alg_values_supported: vec![format!("{SIGNING_ALGORITHM:?}")],
		})
	}
}

/// Location of the discovery document for the configured issuer.
pub fn discovery_url(config: &ExchangeConfig) -> Result<Url> {
	Ok(issuer_base(&config.issuer.issuer).join(DISCOVERY_PATH)?)
}

// `Url::join` replaces the last segment unless the path ends with a slash.
fn issuer_base(issuer: &Url) -> Url {
	let mut base = issuer.clone();

	if !base.path().ends_with('/') {
		base.set_path(&format!("{}/", base.path()));
	}

	base
}
