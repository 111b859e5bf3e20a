//! [`Directory`] over the team API, authenticated with OAuth2 client credentials.

// crates.io
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use url::Url;
// self
use crate::{_prelude::*, config::TeamApiConfig, resolver::Directory};

const SERVICE: &str = "team-api";
const TOKEN_EXPIRY_MARGIN: Duration = Duration::from_secs(30);
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(300);
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(60 * 60 * 24);

/// Team API client caching its access token until shortly before expiry.
#[derive(Debug)]
pub struct TeamApiClient {
	client: Client,
	config: TeamApiConfig,
	token: Mutex<Option<AccessToken>>,
}
impl TeamApiClient {
	/// Build a client with the configured timeout.
	pub fn new(config: TeamApiConfig) -> Result<Self> {
		let client = Client::builder()
			.timeout(config.timeout)
			.user_agent(format!("labid/{}", env!("CARGO_PKG_VERSION")))
			.build()?;

		Self::with_client(config, client)
	}

	/// Build from an existing client.
	pub fn with_client(config: TeamApiConfig, client: Client) -> Result<Self> {
		config.validate()?;

		Ok(Self { client, config, token: Mutex::new(None) })
	}

	async fn access_token(&self) -> Result<String> {
		let mut cached = self.token.lock().await;

		if let Some(token) = cached.as_ref()
			&& Instant::now() + TOKEN_EXPIRY_MARGIN < token.expires_at
		{
			return Ok(token.value.clone());
		}

		let response = self
			.client
			.post(self.config.token_url.clone())
			.basic_auth(&self.config.client_id, Some(&self.config.client_secret))
			.form(&[("grant_type", "client_credentials")])
			.send()
			.await
			.map_err(unavailable)?;
		let status = response.status();

		if !status.is_success() {
			return Err(Error::UpstreamUnavailable {
				service: SERVICE,
				reason: format!("Token endpoint returned {status}."),
			});
		}

		let grant: TokenResponse = response.json().await.map_err(unavailable)?;
		let lifetime = grant
			.expires_in
			.map_or(DEFAULT_TOKEN_LIFETIME, Duration::from_secs)
			.min(MAX_TOKEN_LIFETIME);
		let now = Instant::now();

		tracing::debug!(?lifetime, "team api access token obtained");

		*cached = Some(AccessToken {
			value: grant.access_token.clone(),
			expires_at: now.checked_add(lifetime).unwrap_or(now + DEFAULT_TOKEN_LIFETIME),
		});

		Ok(grant.access_token)
	}

	async fn forget_token(&self) {
		self.token.lock().await.take();
	}

	fn groups_url(&self, email: &str) -> Result<Url> {
		let mut url = self.config.base_url.clone();

		url.path_segments_mut()
			.map_err(|_| Error::Validation {
				field: "team_api.base_url",
				reason: "Cannot be used as a base URL.".into(),
			})?
			.pop_if_empty()
			.extend(["users", email, "groups"]);

		Ok(url)
	}
}
#[async_trait]
impl Directory for TeamApiClient {
	#[tracing::instrument(skip(self))]
	async fn list_groups(&self, email: &str) -> Result<Vec<String>> {
		let url = self.groups_url(email)?;
		let token = self.access_token().await?;
		let response =
			self.client.get(url).bearer_auth(token).send().await.map_err(unavailable)?;

		match response.status() {
			StatusCode::OK => {
				let body: Embedded<GroupsResponse> = response.json().await.map_err(unavailable)?;

				Ok(body.embedded.groups.into_iter().map(|group| group.uniform_name).collect())
			},
			StatusCode::NOT_FOUND => Err(Error::PrincipalNotFound { principal: email.to_owned() }),
			status @ (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN) => {
				self.forget_token().await;

				Err(Error::UpstreamUnavailable {
					service: SERVICE,
					reason: format!("Team API rejected our credentials with {status}."),
				})
			},
			status => Err(Error::UpstreamUnavailable {
				service: SERVICE,
				reason: format!("Team API returned {status}."),
			}),
		}
	}
}

#[derive(Debug)]
struct AccessToken {
	value: String,
	expires_at: Instant,
}

#[derive(Deserialize)]
struct TokenResponse {
	access_token: String,
	#[serde(default)]
	expires_in: Option<u64>,
}

#[derive(Deserialize)]
struct Embedded<T> {
	#[serde(rename = "_embedded")]
	embedded: T,
}

#[derive(Deserialize)]
struct GroupsResponse {
	#[serde(default)]
	groups: Vec<Group>,
}

#[derive(Deserialize)]
struct Group {
	uniform_name: String,
}

fn unavailable(err: reqwest::Error) -> Error {
	Error::UpstreamUnavailable { service: SERVICE, reason: err.to_string() }
}
