//! Default workload-metadata and directory clients against mocked APIs.

// std
use std::time::Duration;
// crates.io
use labid::{
	Directory, Error, KubernetesConfig, Result, TeamApiConfig, WorkloadMetadata,
	resolver::{KubernetesServiceAccounts, TeamApiClient},
};
use serde_json::json;
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{body_string_contains, header, header_exists, method, path},
};

fn team_api(server: &MockServer) -> Result<TeamApiClient> {
	let base = Url::parse(&server.uri())?;

	TeamApiClient::new(TeamApiConfig {
		base_url: base.clone(),
		token_url: base.join("oauth/token")?,
		client_id: "labid".into(),
		client_secret: "hunter2".into(),
		timeout: Duration::from_secs(2),
	})
}

async fn grant_tokens(server: &MockServer) {
	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.and(header_exists("authorization"))
		.and(body_string_contains("grant_type=client_credentials"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({ "access_token": "t0k3n", "expires_in": 3600 })),
		)
		.mount(server)
		.await;
}

async fn token_requests(server: &MockServer) -> usize {
	server
		.received_requests()
		.await
		.unwrap_or_default()
		.iter()
		.filter(|request| request.url.path() == "/oauth/token")
		.count()
}

#[tokio::test]
async fn team_api_lists_uniform_names() -> Result<()> {
	let server = MockServer::start().await;

	grant_tokens(&server).await;
	Mock::given(method("GET"))
		.and(path("/users/kari@ssb.no/groups"))
		.and(header("authorization", "Bearer t0k3n"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"_embedded": {
				"groups": [
					{ "uniform_name": "dapla-felles-developers", "display_name": "Dapla Felles" },
					{ "uniform_name": "dapla-felles-data-admins" }
				]
			}
		})))
		.mount(&server)
		.await;

	let groups = team_api(&server)?.list_groups("kari@ssb.no").await?;

	assert_eq!(groups, vec!["dapla-felles-developers", "dapla-felles-data-admins"]);

	Ok(())
}

#[tokio::test]
async fn team_api_maps_missing_principal_and_failures() -> Result<()> {
	let server = MockServer::start().await;

	grant_tokens(&server).await;
	Mock::given(method("GET"))
		.and(path("/users/ghost@ssb.no/groups"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/users/kari@ssb.no/groups"))
		.respond_with(ResponseTemplate::new(500))
		.mount(&server)
		.await;

	let client = team_api(&server)?;
	let err = client.list_groups("ghost@ssb.no").await.unwrap_err();

	assert!(matches!(err, Error::PrincipalNotFound { ref principal } if principal == "ghost@ssb.no"));

	let err = client.list_groups("kari@ssb.no").await.unwrap_err();

	assert!(matches!(err, Error::UpstreamUnavailable { service: "team-api", .. }), "{err:?}");

	Ok(())
}

#[tokio::test]
async fn team_api_drops_rejected_credentials() -> Result<()> {
	let server = MockServer::start().await;

	grant_tokens(&server).await;
	Mock::given(method("GET"))
		.and(path("/users/kari@ssb.no/groups"))
		.respond_with(ResponseTemplate::new(401))
		.mount(&server)
		.await;

	let client = team_api(&server)?;

	for _ in 0..2 {
		let err = client.list_groups("kari@ssb.no").await.unwrap_err();

		assert!(matches!(err, Error::UpstreamUnavailable { .. }), "{err:?}");
	}

	assert_eq!(token_requests(&server).await, 2);

	Ok(())
}

#[tokio::test]
async fn team_api_bounds_oversized_token_lifetimes() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(
			ResponseTemplate::new(200)
				.set_body_json(json!({ "access_token": "t0k3n", "expires_in": u64::MAX })),
		)
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/users/kari@ssb.no/groups"))
		.and(header("authorization", "Bearer t0k3n"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"_embedded": { "groups": [{ "uniform_name": "dapla-felles-developers" }] }
		})))
		.mount(&server)
		.await;

	let client = team_api(&server)?;

	for _ in 0..2 {
		assert_eq!(client.list_groups("kari@ssb.no").await?, vec!["dapla-felles-developers"]);
	}

	assert_eq!(token_requests(&server).await, 1);

	Ok(())
}

#[tokio::test]
async fn team_api_token_endpoint_failure_is_unavailable() -> Result<()> {
	let server = MockServer::start().await;

	Mock::given(method("POST"))
		.and(path("/oauth/token"))
		.respond_with(ResponseTemplate::new(400).set_body_json(json!({ "error": "invalid_client" })))
		.mount(&server)
		.await;

	let err = team_api(&server)?.list_groups("kari@ssb.no").await.unwrap_err();

	assert!(matches!(err, Error::UpstreamUnavailable { service: "team-api", .. }), "{err:?}");

	Ok(())
}

#[tokio::test]
async fn kubernetes_reads_annotations_with_current_token() -> Result<()> {
	let server = MockServer::start().await;
	let token_path = std::env::temp_dir().join(format!("labid-k8s-token-{}", std::process::id()));

	std::fs::write(&token_path, "first\n")?;

	Mock::given(method("GET"))
		.and(path("/api/v1/namespaces/user-ssb-kari/serviceaccounts/default"))
		.respond_with(ResponseTemplate::new(200).set_body_json(json!({
			"metadata": {
				"name": "default",
				"annotations": { "dapla.ssb.no/impersonate-group": "dapla-felles-developers" }
			}
		})))
		.mount(&server)
		.await;
	Mock::given(method("GET"))
		.and(path("/api/v1/namespaces/user-ssb-ola/serviceaccounts/default"))
		.respond_with(ResponseTemplate::new(404))
		.mount(&server)
		.await;

	let accounts = KubernetesServiceAccounts::new(KubernetesConfig {
		api_url: Url::parse(&server.uri())?,
		token_path: token_path.clone(),
		ca_path: None,
		timeout: Duration::from_secs(2),
	})?;
	let annotations = accounts.annotations("default", "user-ssb-kari").await?;

	assert_eq!(
		annotations.get("dapla.ssb.no/impersonate-group").map(String::as_str),
		Some("dapla-felles-developers")
	);

	// Rotated tokens are picked up on the next call.
	std::fs::write(&token_path, "second\n")?;

	accounts.annotations("default", "user-ssb-kari").await?;

	let bearers = server
		.received_requests()
		.await
		.unwrap_or_default()
		.iter()
		.filter_map(|request| {
			let value = request.headers.get("authorization")?;

			value.to_str().ok().map(ToOwned::to_owned)
		})
		.collect::<Vec<_>>();

	assert_eq!(bearers, vec!["Bearer first", "Bearer second"]);

	let err = accounts.annotations("default", "user-ssb-ola").await.unwrap_err();

	assert!(matches!(err, Error::UpstreamUnavailable { service: "kubernetes", .. }), "{err:?}");

	std::fs::remove_file(&token_path)?;

	Ok(())
}
