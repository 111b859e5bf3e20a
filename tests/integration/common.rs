//! Shared fixtures: a fake platform signing subject tokens and a key-set server.

// std
use std::time::Duration;
// crates.io
use ed25519_dalek::{
	SigningKey,
	pkcs8::{EncodePrivateKey, spki::der::pem::LineEnding},
};
use jsonwebtoken::EncodingKey;
use labid::{JitterStrategy, KeySource, RetryPolicy, SigningKeyHolder};
use serde_json::{Value, json};
use wiremock::{
	Mock, MockServer, ResponseTemplate,
	matchers::{method, path},
};

pub const JWKS_PATH: &str = "/openid/v1/jwks";

/// Stands in for the cluster's service-account token issuer.
pub struct Platform {
	pub keys: SigningKeyHolder,
	encoding_key: EncodingKey,
}
impl Platform {
	pub fn new(seed: u8) -> Self {
		let signing_key = SigningKey::from_bytes(&[seed; 32]);
		let der = signing_key.to_pkcs8_der().expect("der");
		let pem = signing_key.to_pkcs8_pem(LineEnding::LF).expect("pem");

		Self {
			keys: SigningKeyHolder::from_pkcs8_pem(&pem).expect("holder"),
			encoding_key: EncodingKey::from_ed_der(der.as_bytes()),
		}
	}

	/// Service-account token for `default` in `namespace`.
	pub fn token(&self, namespace: &str) -> String {
		let now = chrono::Utc::now().timestamp();

		self.sign(&json!({
			"iss": "https://kubernetes.default.svc.cluster.local",
			"sub": format!("system:serviceaccount:{namespace}:default"),
			"aud": ["https://kubernetes.default.svc.cluster.local"],
			"iat": now,
			"nbf": now,
			"exp": now + 600,
			"kubernetes.io": {
				"namespace": namespace,
				"serviceaccount": { "name": "default", "uid": "5a3b0c1e-1111-4e2f-9d55-0f6b7c8d9e00" },
				"pod": { "name": "jupyter-kari-0", "uid": "9c2d4e6f-2222-4a1b-8c3d-1e2f3a4b5c6d" }
			}
		}))
	}

	pub fn sign(&self, claims: &Value) -> String {
		jsonwebtoken::encode(&self.keys.header(), claims, &self.encoding_key).expect("token")
	}
}

pub fn jwks_response(platform: &Platform) -> ResponseTemplate {
	ResponseTemplate::new(200)
		.set_body_json(platform.keys.jwk_set())
		.insert_header("cache-control", "public, max-age=300")
		.insert_header("etag", "\"v1\"")
}

pub async fn serve_jwks(server: &MockServer, platform: &Platform) {
	Mock::given(method("GET"))
		.and(path(JWKS_PATH))
		.respond_with(jwks_response(platform))
		.mount(server)
		.await;
}

/// Key source pointing at `server` with a short, deterministic retry budget.
pub fn key_source(server: &MockServer) -> KeySource {
	let mut source = KeySource::new(format!("{}{JWKS_PATH}", server.uri()))
		.expect("key source")
		.with_require_https(false);

	source.prefetch_jitter = Duration::ZERO;
	source.retry_policy = RetryPolicy {
		max_retries: 1,
		attempt_timeout: Duration::from_millis(500),
		initial_backoff: Duration::from_millis(10),
		max_backoff: Duration::from_millis(20),
		deadline: Duration::from_secs(1),
		jitter: JitterStrategy::None,
	};

	source
}
