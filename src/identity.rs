//! Typed workload identity extracted from a validated subject token.

// crates.io
use serde::{Deserialize, Serialize};
// self
use crate::_prelude::*;

/// Name of the private claim carrying workload identity in platform tokens.
pub const PLATFORM_IDENTITY_CLAIM: &str = "kubernetes.io";

/// The `kubernetes.io` claim of a service-account token.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformIdentityClaim {
	/// Namespace the workload runs in.
	pub namespace: String,
	/// Service account the token was issued to.
	#[serde(rename = "serviceaccount")]
	pub service_account: ServiceAccountRef,
	/// Pod the token is bound to, for projected tokens.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub pod: Option<PodRef>,
}
impl PlatformIdentityClaim {
	/// Derive the username by stripping `prefix` from the namespace.
	///
	/// Fails with [`Error::InvalidNamespace`] when the namespace does not start with the prefix or
	/// nothing is left after stripping it.
	pub fn resolve(&self, prefix: &str) -> Result<ResolvedIdentity> {
		match self.namespace.strip_prefix(prefix) {
			Some(username) if !prefix.is_empty() && !username.is_empty() =>
				Ok(ResolvedIdentity { username: username.to_owned() }),
			_ => Err(Error::InvalidNamespace {
				namespace: self.namespace.clone(),
				prefix: prefix.to_owned(),
			}),
		}
	}
}

/// Service account reference inside [`PlatformIdentityClaim`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAccountRef {
	/// Service account name.
	pub name: String,
	/// Service account UID.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uid: Option<String>,
}

/// Pod reference inside [`PlatformIdentityClaim`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodRef {
	/// Pod name.
	pub name: String,
	/// Pod UID.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub uid: Option<String>,
}

/// Identity after namespace prefix stripping.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ResolvedIdentity {
	/// Username; becomes the `sub` of the issued credential.
	pub username: String,
}

/// Everything a claim contributor may need about the caller, passed explicitly per exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityContext {
	/// Validated platform identity.
	pub platform: PlatformIdentityClaim,
	/// Derived username.
	pub resolved: ResolvedIdentity,
}
impl IdentityContext {
	/// Validate the namespace shape and bundle both views of the caller.
	pub fn new(platform: PlatformIdentityClaim, prefix: &str) -> Result<Self> {
		let resolved = platform.resolve(prefix)?;

		Ok(Self { platform, resolved })
	}

	/// Username derived from the namespace.
	pub fn username(&self) -> &str {
		&self.resolved.username
	}

	/// Namespace of the workload.
	pub fn namespace(&self) -> &str {
		&self.platform.namespace
	}

	/// Service account name of the workload.
	pub fn service_account(&self) -> &str {
		&self.platform.service_account.name
	}
}
