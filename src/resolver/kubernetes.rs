//! [`WorkloadMetadata`] over the Kubernetes REST API.

// std
use std::collections::BTreeMap;
// crates.io
use async_trait::async_trait;
use reqwest::{Certificate, Client, StatusCode};
use serde::Deserialize;
use url::Url;
// self
use crate::{_prelude::*, config::KubernetesConfig, resolver::WorkloadMetadata};

const SERVICE: &str = "kubernetes";

/// Reads service accounts from the API server with the pod's own credentials.
#[derive(Clone, Debug)]
pub struct KubernetesServiceAccounts {
	client: Client,
	config: KubernetesConfig,
}
impl KubernetesServiceAccounts {
	/// Build a client, trusting the configured CA bundle if any.
	pub fn new(config: KubernetesConfig) -> Result<Self> {
		config.validate()?;

		let mut builder = Client::builder()
			.timeout(config.timeout)
			.user_agent(format!("labid/{}", env!("CARGO_PKG_VERSION")));

		if let Some(ca_path) = &config.ca_path {
			let pem = std::fs::read(ca_path)?;

			builder = builder.add_root_certificate(Certificate::from_pem(&pem)?);
		}

		Ok(Self { client: builder.build()?, config })
	}

	/// Build from an existing client; the CA setting is ignored.
	pub fn with_client(config: KubernetesConfig, client: Client) -> Result<Self> {
		config.validate()?;

		Ok(Self { client, config })
	}

	fn service_account_url(&self, service_account: &str, namespace: &str) -> Result<Url> {
		let mut url = self.config.api_url.clone();

		url.path_segments_mut()
			.map_err(|_| Error::Validation {
				field: "kubernetes.api_url",
				reason: "Cannot be used as a base URL.".into(),
			})?
			.pop_if_empty()
			.extend(["api", "v1", "namespaces", namespace, "serviceaccounts", service_account]);

		Ok(url)
	}

	// Projected tokens rotate, so the file is read on every call.
	async fn bearer_token(&self) -> Result<String> {
		let token = tokio::fs::read_to_string(&self.config.token_path).await.map_err(|err| {
			Error::UpstreamUnavailable {
				service: SERVICE,
				reason: format!("Cannot read API token {}: {err}.", self.config.token_path.display()),
			}
		})?;

		Ok(token.trim().to_owned())
	}
}
#[async_trait]
impl WorkloadMetadata for KubernetesServiceAccounts {
	#[tracing::instrument(skip(self))]
	async fn annotations(
		&self,
		service_account: &str,
		namespace: &str,
	) -> Result<BTreeMap<String, String>> {
		let url = self.service_account_url(service_account, namespace)?;
		let token = self.bearer_token().await?;
		let response = self.client.get(url.clone()).bearer_auth(token).send().await.map_err(|err| {
			Error::UpstreamUnavailable { service: SERVICE, reason: err.to_string() }
		})?;
		let status = response.status();

		match status {
			StatusCode::OK => {
				let account: ServiceAccount = response.json().await.map_err(|err| {
					Error::UpstreamUnavailable {
						service: SERVICE,
						reason: format!("Malformed service account: {err}."),
					}
				})?;

				Ok(account.metadata.annotations.unwrap_or_default())
			},
			StatusCode::NOT_FOUND => Err(Error::UpstreamUnavailable {
				service: SERVICE,
				reason: format!("Service account {namespace}/{service_account} not found."),
			}),
			_ => {
				let body = response.text().await.ok();

				tracing::warn!(%status, ?body, "service account lookup failed");

				Err(Error::UpstreamUnavailable {
					service: SERVICE,
					reason: format!("API server returned {status} for {url}."),
				})
			},
		}
	}
}

#[derive(Debug, Deserialize)]
struct ServiceAccount {
	metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
	#[serde(default)]
	annotations: Option<BTreeMap<String, String>>,
}
