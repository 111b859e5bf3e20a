//! Group resolution: the collaborator interfaces, the contributor capability, and its scopes.

pub mod all_groups;
pub mod current_group;
pub mod kubernetes;
pub mod team_api;

pub use all_groups::AllGroupsResolver;
pub use current_group::CurrentGroupResolver;
pub use kubernetes::KubernetesServiceAccounts;
pub use team_api::TeamApiClient;

// std
use std::{collections::BTreeMap, fmt, str::FromStr};
// crates.io
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
// self
use crate::{
	_prelude::*,
	identity::IdentityContext,
	issuer::{ClaimMapper, ClaimSet},
};

/// Claim carrying the workload's current group.
pub const CURRENT_GROUP_CLAIM: &str = "dapla.group";
/// Claim carrying every group of the principal.
pub const ALL_GROUPS_CLAIM: &str = "dapla.groups";

/// Scope values a caller may request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
	/// Add the workload's current group.
	CurrentGroup,
	/// Add all groups of the principal.
	AllGroups,
}
impl Scope {
	/// Every supported scope.
	pub const ALL: [Scope; 2] = [Scope::CurrentGroup, Scope::AllGroups];

	/// Wire name of the scope.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::CurrentGroup => "current_group",
			Self::AllGroups => "all_groups",
		}
	}
}
impl fmt::Display for Scope {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}
impl FromStr for Scope {
	type Err = Error;

	fn from_str(value: &str) -> Result<Self> {
		Self::ALL.into_iter().find(|scope| scope.as_str() == value).ok_or_else(|| {
			Error::Validation { field: "scope", reason: format!("Unknown scope {value:?}.") }
		})
	}
}

/// Reads service-account metadata from the workload platform.
#[async_trait]
pub trait WorkloadMetadata: Send + Sync {
	/// Annotations of `service_account` in `namespace`.
	async fn annotations(
		&self,
		service_account: &str,
		namespace: &str,
	) -> Result<BTreeMap<String, String>>;
}

/// Looks up group membership in the organisation's directory.
#[async_trait]
pub trait Directory: Send + Sync {
	/// Groups of the principal identified by `email`.
	///
	/// Implementations report unknown principals as [`Error::PrincipalNotFound`].
	async fn list_groups(&self, email: &str) -> Result<Vec<String>>;
}

/// Resolves extra claims for one scope.
#[async_trait]
pub trait ClaimContributor: Send + Sync {
	/// Scope that enables this contributor.
	fn scope(&self) -> Scope;

	/// Gather this contributor's claims for the caller.
	async fn contribute(&self, identity: &IdentityContext) -> Result<ContributedClaims>;
}

/// Claims gathered by a contributor, applied to the credential as a [`ClaimMapper`].
#[derive(Clone, Debug, PartialEq)]
pub struct ContributedClaims {
	scope: Scope,
	claims: Vec<(String, Value)>,
}
impl ContributedClaims {
	/// Empty contribution for `scope`.
	pub fn new(scope: Scope) -> Self {
		Self { scope, claims: Vec::new() }
	}

	/// Add a claim.
	pub fn with<T>(mut self, name: &str, value: T) -> Result<Self>
	where
		T: Serialize,
	{
		self.claims.push((name.to_owned(), serde_json::to_value(value)?));

		Ok(self)
	}

	/// Scope that produced these claims.
	pub fn scope(&self) -> Scope {
		self.scope
	}

	/// Value of a contributed claim.
	pub fn get(&self, name: &str) -> Option<&Value> {
		self.claims.iter().find(|(claim, _)| claim == name).map(|(_, value)| value)
	}
}
impl ClaimMapper for ContributedClaims {
	fn apply(&self, claims: &mut ClaimSet) -> Result<()> {
		self.claims.iter().try_for_each(|(name, value)| claims.insert(name, value))
	}
}

/// Normalise a collaborator failure into the caller-visible taxonomy.
///
/// Domain outcomes pass through; anything else becomes [`Error::UpstreamUnavailable`].
pub(crate) fn upstream_failure(service: &'static str, err: Error) -> Error {
	match err {
		Error::UpstreamUnavailable { .. }
		| Error::PrincipalNotFound { .. }
		| Error::GroupNotAssigned { .. } => err,
		other => Error::UpstreamUnavailable { service, reason: other.to_string() },
	}
}
