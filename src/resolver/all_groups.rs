//! `all_groups`: every directory group of the calling user.

// crates.io
use async_trait::async_trait;
// self
use crate::{
	_prelude::*,
	config::AllGroupsConfig,
	identity::IdentityContext,
	resolver::{
		ALL_GROUPS_CLAIM, ClaimContributor, ContributedClaims, Directory, Scope, upstream_failure,
	},
};

/// Looks up the user's groups in the directory by principal email.
#[derive(Clone)]
pub struct AllGroupsResolver {
	directory: Arc<dyn Directory>,
	config: AllGroupsConfig,
}
impl AllGroupsResolver {
	/// Create a resolver backed by `directory`.
	pub fn new(directory: Arc<dyn Directory>, config: AllGroupsConfig) -> Self {
		Self { directory, config }
	}

	/// Principal email for a username.
	pub fn principal(&self, username: &str) -> String {
		format!("{username}@{}", self.config.principal_domain)
	}
}
impl std::fmt::Debug for AllGroupsResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("AllGroupsResolver").field("config", &self.config).finish()
	}
}
#[async_trait]
impl ClaimContributor for AllGroupsResolver {
	fn scope(&self) -> Scope {
		Scope::AllGroups
	}

	#[tracing::instrument(skip_all, fields(username = %identity.username()))]
	async fn contribute(&self, identity: &IdentityContext) -> Result<ContributedClaims> {
		let principal = self.principal(identity.username());
		let groups = self
			.directory
			.list_groups(&principal)
			.await
			.map_err(|err| upstream_failure("directory", err))?;

		tracing::debug!(count = groups.len(), "directory groups resolved");

		ContributedClaims::new(Scope::AllGroups).with(ALL_GROUPS_CLAIM, groups)
	}
}
