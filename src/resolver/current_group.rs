//! `current_group`: the group a workload's service account is annotated with.

// crates.io
use async_trait::async_trait;
// self
use crate::{
	_prelude::*,
	config::CurrentGroupConfig,
	identity::IdentityContext,
	resolver::{
		CURRENT_GROUP_CLAIM, ClaimContributor, ContributedClaims, Scope, WorkloadMetadata,
		upstream_failure,
	},
};

/// Reads the current group from a service-account annotation.
#[derive(Clone)]
pub struct CurrentGroupResolver {
	metadata: Arc<dyn WorkloadMetadata>,
	config: CurrentGroupConfig,
}
impl CurrentGroupResolver {
	/// Create a resolver backed by `metadata`.
	pub fn new(metadata: Arc<dyn WorkloadMetadata>, config: CurrentGroupConfig) -> Self {
		Self { metadata, config }
	}
}
impl std::fmt::Debug for CurrentGroupResolver {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("CurrentGroupResolver").field("config", &self.config).finish()
	}
}
#[async_trait]
impl ClaimContributor for CurrentGroupResolver {
	fn scope(&self) -> Scope {
		Scope::CurrentGroup
	}

	#[tracing::instrument(
		skip_all,
		fields(namespace = %identity.namespace(), service_account = %identity.service_account())
	)]
	async fn contribute(&self, identity: &IdentityContext) -> Result<ContributedClaims> {
		let annotations = self
			.metadata
			.annotations(identity.service_account(), identity.namespace())
			.await
			.map_err(|err| upstream_failure("workload-metadata", err))?;
		let group = annotations
			.get(&self.config.annotation)
			.map(|group| group.trim())
			.filter(|group| !group.is_empty())
			.ok_or_else(|| Error::GroupNotAssigned {
				service_account: identity.service_account().to_owned(),
				namespace: identity.namespace().to_owned(),
			})?;

		tracing::debug!(group, "current group resolved");

		ContributedClaims::new(Scope::CurrentGroup).with(CURRENT_GROUP_CLAIM, group)
	}
}
