//! Exchange scenarios against mocked key-set, Kubernetes, and team APIs.

// std
use std::{
	path::PathBuf,
	sync::{
		Arc,
		atomic::{AtomicUsize, Ordering},
	},
	time::Duration,
};
// crates.io
use http::StatusCode;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use labid::{
	AllGroupsConfig, CurrentGroupConfig, Error, ExchangeConfig, ExchangeRequest, IssuerConfig,
	KeySetCache, KubernetesConfig, KubernetesTokenValidator, Result, SigningKeyHolder,
	TeamApiConfig, TokenExchange, ValidatorConfig,
	discovery::public_jwks,
	exchange::JWT_TOKEN_TYPE,
	resolver::{KubernetesServiceAccounts, TeamApiClient},
};
use serde_json::{Value, json};
use url::Url;
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{header, method, path},
};
// self
use crate::common::{self, Platform};

const K8S_TOKEN: &str = "in-cluster-token";
const TEAM_API_TOKEN: &str = "team-api-token";

struct Harness {
	server: MockServer,
	platform: Platform,
	exchange: TokenExchange,
	keys: KeySetCache,
}
impl Harness {
	async fn start() -> Result<Self> {
		let _ = tracing_subscriber::fmt::try_init();
		let server = MockServer::start().await;
		let platform = Platform::new(7);

		common::serve_jwks(&server, &platform).await;

		Self::with_server(server, platform).await
	}

	async fn with_server(server: MockServer, platform: Platform) -> Result<Self> {
		let keys = KeySetCache::new(common::key_source(&server))?;
		let validator = KubernetesTokenValidator::new(keys.clone(), ValidatorConfig::default());
		let base = Url::parse(&server.uri())?;
		let mut config = ExchangeConfig::new(IssuerConfig::new("https://labid.example.com")?);

		config.current_group = Some(CurrentGroupConfig::default());
		config.all_groups = Some(AllGroupsConfig::default());

		let metadata = KubernetesServiceAccounts::new(KubernetesConfig {
			api_url: base.clone(),
			token_path: token_file(),
			ca_path: None,
			timeout: Duration::from_secs(2),
		})?;
		let directory = TeamApiClient::new(TeamApiConfig {
			base_url: base.clone(),
			token_url: base.join("oauth/token")?,
			client_id: "labid".into(),
			client_secret: "hunter2".into(),
			timeout: Duration::from_secs(2),
		})?;
		let exchange = TokenExchange::builder(
			config,
			Arc::new(validator),
			Arc::new(SigningKeyHolder::generate()?),
		)
		.workload_metadata(Arc::new(metadata))
		.directory(Arc::new(directory))
		.build()?;

		Ok(Self { server, platform, exchange, keys })
	}

	async fn annotate(&self, namespace: &str, group: Option<&str>) {
		let annotations = group
			.map(|group| json!({ "dapla.ssb.no/impersonate-group": group }))
			.unwrap_or_else(|| json!({}));

		Mock::given(method("GET"))
			.and(path(format!("/api/v1/namespaces/{namespace}/serviceaccounts/default")))
			.and(header("authorization", format!("Bearer {K8S_TOKEN}").as_str()))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"apiVersion": "v1",
				"kind": "ServiceAccount",
				"metadata": { "name": "default", "namespace": namespace, "annotations": annotations }
			})))
			.mount(&self.server)
			.await;
	}

	async fn directory_groups(&self, email: &str, groups: &[&str]) {
		Mock::given(method("POST"))
			.and(path("/oauth/token"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({
				"access_token": TEAM_API_TOKEN,
				"token_type": "Bearer",
				"expires_in": 300
			})))
			.mount(&self.server)
			.await;

		let groups = groups.iter().map(|name| json!({ "uniform_name": name })).collect::<Vec<_>>();

		Mock::given(method("GET"))
			.and(path(format!("/users/{email}/groups")))
			.and(header("authorization", format!("Bearer {TEAM_API_TOKEN}").as_str()))
			.respond_with(
				ResponseTemplate::new(200).set_body_json(json!({ "_embedded": { "groups": groups } })),
			)
			.mount(&self.server)
			.await;
	}

	fn claims(&self, token: &str) -> Value {
		serde_json::to_value(self.exchange.issuer().verify(token).expect("own credential"))
			.expect("claims")
	}

	async fn requests_to(&self, prefix: &str) -> usize {
		self.server
			.received_requests()
			.await
			.unwrap_or_default()
			.iter()
			.filter(|request| request.url.path().starts_with(prefix))
			.count()
	}
}

fn token_file() -> PathBuf {
	static NEXT: AtomicUsize = AtomicUsize::new(0);

	let path = std::env::temp_dir().join(format!(
		"labid-sa-token-{}-{}",
		std::process::id(),
		NEXT.fetch_add(1, Ordering::SeqCst)
	));

	std::fs::write(&path, format!("{K8S_TOKEN}\n")).expect("token file");

	path
}

#[tokio::test]
async fn current_group_scope_adds_annotated_group() -> Result<()> {
	let harness = Harness::start().await?;

	harness.annotate("user-ssb-kari", Some("dapla-felles-developers")).await;

	let request = ExchangeRequest::new(harness.platform.token("user-ssb-kari"))
		.with_scope("current_group");
	let response = harness.exchange.exchange(request).await?;
	let claims = harness.claims(&response.access_token);

	assert_eq!(response.expires_in, 3600);
	assert_eq!(response.issued_token_type, JWT_TOKEN_TYPE);
	assert_eq!(response.token_type, "Bearer");
	assert_eq!(claims["sub"], "kari");
	assert_eq!(claims["iss"], "https://labid.example.com");
	assert_eq!(claims["dapla.group"], "dapla-felles-developers");
	assert_eq!(claims["exp"].as_i64().unwrap() - claims["iat"].as_i64().unwrap(), 3600);
	assert!(claims.get("dapla.groups").is_none());

	Ok(())
}

#[tokio::test]
async fn missing_annotation_fails_without_issuing() -> Result<()> {
	let harness = Harness::start().await?;

	harness.annotate("user-ssb-kari", None).await;

	let request = ExchangeRequest::new(harness.platform.token("user-ssb-kari"))
		.with_scope("current_group");
	let err = harness.exchange.exchange(request).await.unwrap_err();

	assert!(matches!(err, Error::GroupNotAssigned { .. }), "{err:?}");

	let (status, body) = err.to_response();

	assert_eq!(status, StatusCode::BAD_REQUEST);
	assert_eq!(body.error, "invalid_scope");

	Ok(())
}

#[tokio::test]
async fn all_groups_scope_lists_directory_groups() -> Result<()> {
	let harness = Harness::start().await?;

	harness.directory_groups("kari@ssb.no", &["g1", "g2"]).await;

	let request = ExchangeRequest::new(harness.platform.token("user-ssb-kari"))
		.with_audience("storage")
		.with_audience("notebooks")
		.with_scope("all_groups");
	let response = harness.exchange.exchange(request).await?;
	let claims = harness.claims(&response.access_token);

	assert_eq!(claims["dapla.groups"], json!(["g1", "g2"]));
	assert_eq!(claims["aud"], json!(["storage", "notebooks"]));
	assert_eq!(claims["scope"], "all_groups");

	// The client-credentials token is reused across exchanges.
	let request = ExchangeRequest::new(harness.platform.token("user-ssb-kari"))
		.with_scope("all_groups");

	harness.exchange.exchange(request).await?;

	assert_eq!(harness.requests_to("/oauth/token").await, 1);
	assert_eq!(harness.requests_to("/users/").await, 2);

	Ok(())
}

#[tokio::test]
async fn both_scopes_resolve_together() -> Result<()> {
	let harness = Harness::start().await?;

	harness.annotate("user-ssb-kari", Some("dapla-felles-developers")).await;
	harness.directory_groups("kari@ssb.no", &["dapla-felles-developers", "g2"]).await;

	let request = ExchangeRequest::new(harness.platform.token("user-ssb-kari"))
		.with_scope("current_group, all_groups");
	let response = harness.exchange.exchange(request).await?;
	let claims = harness.claims(&response.access_token);

	assert_eq!(claims["dapla.group"], "dapla-felles-developers");
	assert_eq!(claims["dapla.groups"], json!(["dapla-felles-developers", "g2"]));

	Ok(())
}

#[tokio::test]
async fn malformed_grant_type_touches_no_upstream() -> Result<()> {
	let harness = Harness::start().await?;
	let request = ExchangeRequest {
		grant_type: "client_credentials".into(),
		..ExchangeRequest::new(harness.platform.token("user-ssb-kari")).with_scope("all_groups")
	};
	let err = harness.exchange.exchange(request).await.unwrap_err();

	assert!(matches!(err, Error::InvalidRequest(_)), "{err:?}");
	assert_eq!(harness.requests_to("/").await, 0);

	Ok(())
}

#[tokio::test]
async fn key_source_outage_then_stale_keys_keep_exchanges_working() -> Result<()> {
	let _ = tracing_subscriber::fmt::try_init();
	let down = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(ResponseTemplate::new(503))
		.mount(&down)
		.await;

	let harness = Harness::with_server(down, Platform::new(7)).await?;
	let err = harness
		.exchange
		.exchange(ExchangeRequest::new(harness.platform.token("user-ssb-kari")))
		.await
		.unwrap_err();

	assert!(matches!(err, Error::ValidationInfrastructure(_)), "{err:?}");
	assert!(err.is_key_source_unavailable());
	assert_eq!(err.to_response().0, StatusCode::SERVICE_UNAVAILABLE);

	let flaky = MockServer::start().await;

	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(common::jwks_response(&Platform::new(7)))
		.up_to_n_times(1)
		.with_priority(1)
		.mount(&flaky)
		.await;
	Mock::given(method("GET"))
		.and(path(common::JWKS_PATH))
		.respond_with(ResponseTemplate::new(500))
		.mount(&flaky)
		.await;

	let harness = Harness::with_server(flaky, Platform::new(7)).await?;

	harness.keys.prime().await?;

	assert!(harness.keys.refresh().await.is_err());

	harness.exchange.exchange(ExchangeRequest::new(harness.platform.token("user-ssb-kari"))).await?;

	// Past expiry the last-known-good set is still served.
	tokio::time::pause();
	tokio::time::advance(Duration::from_secs(301)).await;
	tokio::time::resume();

	let response = harness
		.exchange
		.exchange(ExchangeRequest::new(harness.platform.token("user-ssb-kari")))
		.await?;

	assert_eq!(harness.claims(&response.access_token)["sub"], "kari");
	assert!(harness.keys.status().await.stale);

	Ok(())
}

#[tokio::test]
async fn token_from_unknown_key_is_invalid() -> Result<()> {
	let harness = Harness::start().await?;
	let stranger = Platform::new(42);
	let err = harness
		.exchange
		.exchange(ExchangeRequest::new(stranger.token("user-ssb-kari")))
		.await
		.unwrap_err();

	assert!(matches!(err, Error::InvalidToken(_)), "{err:?}");
	assert_eq!(err.to_response().0, StatusCode::BAD_REQUEST);

	Ok(())
}

#[tokio::test]
async fn expired_or_malformed_identity_is_invalid() -> Result<()> {
	let harness = Harness::start().await?;
	let now = chrono::Utc::now().timestamp();
	let expired = harness.platform.sign(&json!({
		"exp": now - 3600,
		"kubernetes.io": { "namespace": "user-ssb-kari", "serviceaccount": { "name": "default" } }
	}));
	let malformed = harness.platform.sign(&json!({
		"exp": now + 600,
		"kubernetes.io": { "namespace": 17 }
	}));
	let missing = harness.platform.sign(&json!({ "exp": now + 600 }));

	for token in [expired, malformed, missing, "not.a.jwt".to_owned()] {
		let err = harness.exchange.exchange(ExchangeRequest::new(token)).await.unwrap_err();

		assert!(matches!(err, Error::InvalidToken(_)), "{err:?}");
	}

	Ok(())
}

#[tokio::test]
async fn foreign_namespace_never_reaches_resolvers() -> Result<()> {
	let harness = Harness::start().await?;

	harness.annotate("kube-system", Some("cluster-admins")).await;

	let request =
		ExchangeRequest::new(harness.platform.token("kube-system")).with_scope("current_group");
	let err = harness.exchange.exchange(request).await.unwrap_err();

	assert!(matches!(err, Error::InvalidNamespace { .. }), "{err:?}");
	assert_eq!(harness.requests_to("/api/").await, 0);

	let err = harness
		.exchange
		.exchange(ExchangeRequest::new(harness.platform.token("user-ssb-")))
		.await
		.unwrap_err();

	assert!(matches!(err, Error::InvalidNamespace { .. }), "{err:?}");

	Ok(())
}

#[tokio::test]
async fn issued_credentials_verify_against_published_key() -> Result<()> {
	let harness = Harness::start().await?;
	let response = harness
		.exchange
		.exchange(ExchangeRequest::new(harness.platform.token("user-ssb-kari")))
		.await?;
	let header = jsonwebtoken::decode_header(&response.access_token)?;
	let jwks = public_jwks(harness.exchange.issuer().signing_key());
	let jwk = jwks.find(header.kid.as_deref().expect("kid")).expect("published key");
	let mut validation = Validation::new(Algorithm::EdDSA);

	validation.set_issuer(&["https://labid.example.com"]);
	validation.validate_aud = false;

	let decoded =
		jsonwebtoken::decode::<Value>(&response.access_token, &DecodingKey::from_jwk(jwk)?, &validation)?;

	assert_eq!(header.alg, Algorithm::EdDSA);
	assert_eq!(decoded.claims["sub"], "kari");

	Ok(())
}

#[tokio::test]
async fn form_encoded_requests_exchange() -> Result<()> {
	let harness = Harness::start().await?;
	let body = serde_urlencoded::to_string([
		("grant_type", "urn:ietf:params:oauth:grant-type:token-exchange"),
		("subject_token", harness.platform.token("user-ssb-kari").as_str()),
		("subject_token_type", "urn:ietf:params:oauth:token-type:id_token"),
		("audience", "storage"),
		("audience", "notebooks"),
	])
	.expect("form body");
	let response = harness.exchange.exchange(ExchangeRequest::from_form(body.as_bytes())?).await?;

	assert_eq!(harness.claims(&response.access_token)["aud"], json!(["storage", "notebooks"]));

	Ok(())
}
