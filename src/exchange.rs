//! RFC 8693 token exchange: validate, resolve groups, issue.

// std
use std::{collections::BTreeSet, fmt};
// crates.io
use futures::future;
use serde::{Deserialize, Serialize};
// self
use crate::{
	_prelude::*,
	config::ExchangeConfig,
	identity::IdentityContext,
	issuer::{ClaimMapper, CredentialIssuer},
	metrics,
	resolver::{
		AllGroupsResolver, ClaimContributor, CurrentGroupResolver, Directory, Scope,
		WorkloadMetadata,
	},
	signing::SigningKeyHolder,
	validator::SubjectTokenValidator,
};

/// Grant type accepted by the exchange.
pub const TOKEN_EXCHANGE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:token-exchange";
/// Subject token type accepted by the exchange.
pub const ID_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:id_token";
/// Token type of issued credentials.
pub const JWT_TOKEN_TYPE: &str = "urn:ietf:params:oauth:token-type:jwt";
/// `token_type` of exchange responses.
pub const BEARER_TOKEN_TYPE: &str = "Bearer";

/// Parameters of a token exchange request.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeRequest {
	/// Must equal [`TOKEN_EXCHANGE_GRANT_TYPE`].
	pub grant_type: String,
	/// Platform-issued token to exchange.
	pub subject_token: String,
	/// Must equal [`ID_TOKEN_TYPE`].
	pub subject_token_type: String,
	/// Audiences copied into the credential.
	#[serde(default)]
	pub audience: Vec<String>,
	/// Comma-separated scopes.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub scope: Option<String>,
}
impl ExchangeRequest {
	/// Request exchanging `subject_token` with the standard grant and token types.
	pub fn new(subject_token: impl Into<String>) -> Self {
		Self {
			grant_type: TOKEN_EXCHANGE_GRANT_TYPE.into(),
			subject_token: subject_token.into(),
			subject_token_type: ID_TOKEN_TYPE.into(),
			audience: Vec::new(),
			scope: None,
		}
	}

	/// Add an audience.
	pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
		self.audience.push(audience.into());

		self
	}

	/// Set the comma-separated scope parameter.
	pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
		self.scope = Some(scope.into());

		self
	}

	/// Parse an `application/x-www-form-urlencoded` body.
	///
	/// `audience` may repeat; any other known parameter given twice is an
	/// [`Error::InvalidRequest`]. Unknown parameters are ignored.
	pub fn from_form(body: &[u8]) -> Result<Self> {
		let mut request = Self::default();
		let mut seen = BTreeSet::new();

		for (name, value) in url::form_urlencoded::parse(body) {
			let slot = match name.as_ref() {
				"audience" => {
					request.audience.push(value.into_owned());

					continue;
				},
				"grant_type" => &mut request.grant_type,
				"subject_token" => &mut request.subject_token,
				"subject_token_type" => &mut request.subject_token_type,
				"scope" => request.scope.get_or_insert_default(),
				_ => continue,
			};

			if !seen.insert(name.clone()) {
				return Err(Error::InvalidRequest(format!("Parameter {name} was repeated.")));
			}

			*slot = value.into_owned();
		}

		Ok(request)
	}

	/// Requested scopes in order, trimmed, blanks and repeats dropped.
	pub fn requested_scopes(&self) -> Vec<String> {
		let mut seen = BTreeSet::new();

		self.scope
			.as_deref()
			.unwrap_or_default()
			.split(',')
			.map(str::trim)
			.filter(|scope| !scope.is_empty() && seen.insert(*scope))
			.map(ToOwned::to_owned)
			.collect()
	}

	fn check(&self) -> Result<()> {
		if self.grant_type != TOKEN_EXCHANGE_GRANT_TYPE {
			return Err(Error::InvalidRequest(format!(
				"Unsupported grant_type {:?}.",
				self.grant_type
			)));
		}
		if self.subject_token_type != ID_TOKEN_TYPE {
			return Err(Error::InvalidRequest(format!(
				"Unsupported subject_token_type {:?}.",
				self.subject_token_type
			)));
		}
		if self.subject_token.trim().is_empty() {
			return Err(Error::InvalidRequest("Missing subject_token.".into()));
		}

		Ok(())
	}
}
impl fmt::Debug for ExchangeRequest {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("ExchangeRequest")
			.field("grant_type", &self.grant_type)
			.field("subject_token", &"<redacted>")
			.field("subject_token_type", &self.subject_token_type)
			.field("audience", &self.audience)
			.field("scope", &self.scope)
			.finish()
	}
}

/// Successful exchange response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExchangeResponse {
	/// Signed credential.
	pub access_token: String,
	/// Always [`JWT_TOKEN_TYPE`].
	pub issued_token_type: String,
	/// Always [`BEARER_TOKEN_TYPE`].
	pub token_type: String,
	/// Credential lifetime in seconds.
	pub expires_in: u64,
}

/// Pipeline position of an exchange, reported when it fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExchangeStage {
	/// Request received, parameters not yet checked.
	ReceivedRequest,
	/// Subject token validated.
	Validated,
	/// Username derived from the namespace.
	IdentityResolved,
	/// Requested group claims gathered.
	GroupsPopulated,
	/// Credential signed.
	Issued,
	/// Response assembled.
	Responded,
}
impl ExchangeStage {
	/// Stable name for logs.
	pub fn as_str(self) -> &'static str {
		match self {
			Self::ReceivedRequest => "received_request",
			Self::Validated => "validated",
			Self::IdentityResolved => "identity_resolved",
			Self::GroupsPopulated => "groups_populated",
			Self::Issued => "issued",
			Self::Responded => "responded",
		}
	}
}
impl fmt::Display for ExchangeStage {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Exchanges platform tokens for signed credentials.
pub struct TokenExchange {
	config: ExchangeConfig,
	validator: Arc<dyn SubjectTokenValidator>,
	issuer: CredentialIssuer,
	contributors: Vec<Arc<dyn ClaimContributor>>,
}
impl TokenExchange {
	/// Start building an exchange.
	pub fn builder(
		config: ExchangeConfig,
		validator: Arc<dyn SubjectTokenValidator>,
		signing_key: Arc<SigningKeyHolder>,
	) -> TokenExchangeBuilder {
		TokenExchangeBuilder {
			config,
			validator,
			signing_key,
			workload_metadata: None,
			directory: None,
			contributors: Vec::new(),
		}
	}

	/// Exchange settings.
	pub fn config(&self) -> &ExchangeConfig {
		&self.config
	}

	/// Issuer minting the credentials.
	pub fn issuer(&self) -> &CredentialIssuer {
		&self.issuer
	}

	/// Scopes that have a contributor.
	pub fn supported_scopes(&self) -> Vec<Scope> {
		self.contributors.iter().map(|contributor| contributor.scope()).collect()
	}

	/// Run one exchange within the configured deadline.
	///
	/// Dropping the returned future cancels every in-flight upstream call.
	#[tracing::instrument(
		skip_all,
		fields(audience = ?request.audience, scope = request.scope.as_deref().unwrap_or_default())
	)]
	pub async fn exchange(&self, request: ExchangeRequest) -> Result<ExchangeResponse> {
		let started = Instant::now();
		let mut stage = ExchangeStage::ReceivedRequest;
		let result =
			match tokio::time::timeout(self.config.exchange_timeout, self.run(request, &mut stage))
				.await
			{
				Ok(result) => result,
				Err(_) => Err(Error::UpstreamUnavailable {
					service: "exchange",
					reason: format!(
						"Exchange did not finish within {:?}.",
						self.config.exchange_timeout
					),
				}),
			};
		let outcome = match &result {
			Ok(_) => "success",
			Err(err) => {
				tracing::warn!(%stage, kind = ?err.kind(), error = %err, "token exchange failed");

				err.kind().error_code()
			},
		};

		metrics::record_exchange(outcome, started.elapsed());

		result
	}

	async fn run(
		&self,
		request: ExchangeRequest,
		stage: &mut ExchangeStage,
	) -> Result<ExchangeResponse> {
		request.check()?;

		let platform = self.validator.validate(&request.subject_token).await?;

		advance(stage, ExchangeStage::Validated);

		let identity = IdentityContext::new(platform, &self.config.namespace_prefix)?;

		advance(stage, ExchangeStage::IdentityResolved);

		let scopes = request.requested_scopes();
		let requested = scopes
			.iter()
			.filter_map(|scope| match scope.parse::<Scope>() {
				Ok(scope) => Some(scope),
				Err(_) => {
					tracing::debug!(scope = %scope, "ignoring unknown scope");

					None
				},
			})
			.collect::<BTreeSet<_>>();
		let contributed = future::try_join_all(
			self.contributors
				.iter()
				.filter(|contributor| requested.contains(&contributor.scope()))
				.map(|contributor| contributor.contribute(&identity)),
		)
		.await?;

		advance(stage, ExchangeStage::GroupsPopulated);

		let mappers = contributed.iter().map(|claims| claims as &dyn ClaimMapper).collect::<Vec<_>>();
		let credential =
			self.issuer.issue(identity.username(), &request.audience, &scopes, &mappers)?;

		advance(stage, ExchangeStage::Issued);

		let response = ExchangeResponse {
			access_token: credential.token,
			issued_token_type: JWT_TOKEN_TYPE.into(),
			token_type: BEARER_TOKEN_TYPE.into(),
			expires_in: credential.expires_in.as_secs(),
		};

		advance(stage, ExchangeStage::Responded);

		Ok(response)
	}
}
impl fmt::Debug for TokenExchange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("TokenExchange")
			.field("config", &self.config)
			.field("issuer", &self.issuer)
			.field("scopes", &self.supported_scopes())
			.finish()
	}
}

/// Builder wiring collaborators into a [`TokenExchange`].
pub struct TokenExchangeBuilder {
	config: ExchangeConfig,
	validator: Arc<dyn SubjectTokenValidator>,
	signing_key: Arc<SigningKeyHolder>,
	workload_metadata: Option<Arc<dyn WorkloadMetadata>>,
	directory: Option<Arc<dyn Directory>>,
	contributors: Vec<Arc<dyn ClaimContributor>>,
}
impl TokenExchangeBuilder {
	/// Workload metadata backing the `current_group` scope.
	pub fn workload_metadata(mut self, metadata: Arc<dyn WorkloadMetadata>) -> Self {
		self.workload_metadata = Some(metadata);

		self
	}

	/// Directory backing the `all_groups` scope.
	pub fn directory(mut self, directory: Arc<dyn Directory>) -> Self {
		self.directory = Some(directory);

		self
	}

	/// Register a custom contributor.
	pub fn contributor(mut self, contributor: Arc<dyn ClaimContributor>) -> Self {
		self.contributors.push(contributor);

		self
	}

	/// Validate the configuration and assemble the exchange.
	pub fn build(self) -> Result<TokenExchange> {
		let Self { config, validator, signing_key, workload_metadata, directory, mut contributors } =
			self;

		config.validate()?;

		if let Some(current_group) = &config.current_group {
			let metadata = workload_metadata.ok_or_else(|| Error::Validation {
				field: "current_group",
				reason: "Enabled without workload metadata.".into(),
			})?;

			contributors.push(Arc::new(CurrentGroupResolver::new(metadata, current_group.clone())));
		}
		if let Some(all_groups) = &config.all_groups {
			let directory = directory.ok_or_else(|| Error::Validation {
				field: "all_groups",
				reason: "Enabled without a directory.".into(),
			})?;

			contributors.push(Arc::new(AllGroupsResolver::new(directory, all_groups.clone())));
		}

		let mut scopes = BTreeSet::new();

		for contributor in &contributors {
			if !scopes.insert(contributor.scope()) {
				return Err(Error::Validation {
					field: "contributors",
					reason: format!("Scope {} has more than one contributor.", contributor.scope()),
				});
			}
		}

		let issuer = CredentialIssuer::new(config.issuer.clone(), signing_key);

		Ok(TokenExchange { config, validator, issuer, contributors })
	}
}

fn advance(stage: &mut ExchangeStage, next: ExchangeStage) {
	tracing::debug!(from = %stage, to = %next, "exchange advanced");

	*stage = next;
}
