//! Token exchange core: trades platform service-account tokens for short-lived, centrally
//! signed credentials carrying authorization-group claims.

#![deny(clippy::all, missing_docs, unused_crate_dependencies)]

pub mod cache;
pub mod config;
pub mod discovery;
pub mod exchange;
pub mod http;
pub mod identity;
pub mod issuer;
pub mod metrics;
pub mod resolver;
pub mod security;
pub mod signing;
pub mod validator;

mod error;
mod _prelude {
	pub use std::{
		sync::Arc,
		time::{Duration, SystemTime},
	};

	pub use chrono::{DateTime, TimeDelta, Utc};
	pub use tokio::time::Instant;

	pub use crate::{Error, Result};
}

pub use crate::{
	cache::{KeySetCache, KeySetStatus, RefresherHandle},
	config::{
		AllGroupsConfig, CurrentGroupConfig, ExchangeConfig, IssuerConfig, JitterStrategy,
		KeySource, KubernetesConfig, RetryPolicy, TeamApiConfig, ValidatorConfig,
	},
	discovery::{DiscoveryDocument, public_jwks},
	error::{Error, ErrorKind, ErrorResponse, Result},
	exchange::{ExchangeRequest, ExchangeResponse, TokenExchange},
	identity::{IdentityContext, PlatformIdentityClaim, ResolvedIdentity},
	issuer::{ClaimMapper, ClaimSet, CredentialClaims, CredentialIssuer, SignedCredential},
	resolver::{ClaimContributor, Directory, Scope, WorkloadMetadata},
	signing::SigningKeyHolder,
	validator::{KubernetesTokenValidator, SubjectTokenValidator},
};
#[cfg(feature = "prometheus")] pub use crate::metrics::install_default_exporter;
