//! The service's own Ed25519 signing key and its public JWK.

// std
use std::fmt::{Debug, Formatter, Result as FmtResult};
// crates.io
use base64::prelude::*;
use ed25519_dalek::{
	SigningKey, VerifyingKey,
	pkcs8::{DecodePrivateKey, EncodePrivateKey},
};
use jsonwebtoken::{
	Algorithm, DecodingKey, EncodingKey, Header,
	jwk::{
		AlgorithmParameters, CommonParameters, EllipticCurve, Jwk, JwkSet, KeyAlgorithm,
		OctetKeyPairParameters, OctetKeyPairType, PublicKeyUse,
	},
};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
// self
use crate::_prelude::*;

/// Signing algorithm of every credential this service issues.
pub const SIGNING_ALGORITHM: Algorithm = Algorithm::EdDSA;

/// Holds the private key used to sign issued credentials.
///
/// The private half never leaves this type; only [`SigningKeyHolder::public_jwk`] is published.
#[derive(Clone)]
pub struct SigningKeyHolder {
	kid: String,
	encoding_key: EncodingKey,
	public_jwk: Jwk,
}
impl SigningKeyHolder {
	/// Generate a fresh key pair from the thread-local CSPRNG.
	pub fn generate() -> Result<Self> {
		let mut seed = [0u8; 32];

		rand::rng().fill_bytes(&mut seed);

		Self::from_signing_key(SigningKey::from_bytes(&seed))
	}

	/// Load an Ed25519 private key from PKCS#8 PEM.
	pub fn from_pkcs8_pem(pem: &str) -> Result<Self> {
		let signing_key = SigningKey::from_pkcs8_pem(pem).map_err(|err| {
			Error::InvalidKeyMaterial(format!("Expected an Ed25519 PKCS#8 private key: {err}."))
		})?;

		Self::from_signing_key(signing_key)
	}

	fn from_signing_key(signing_key: SigningKey) -> Result<Self> {
		let der = signing_key
			.to_pkcs8_der()
			.map_err(|err| Error::InvalidKeyMaterial(format!("Failed to encode key: {err}.")))?;
		let encoding_key = EncodingKey::from_ed_der(der.as_bytes());
		let x = BASE64_URL_SAFE_NO_PAD.encode(signing_key.verifying_key().as_bytes());
		let kid = thumbprint(&x);
		let public_jwk = public_jwk(&signing_key.verifying_key(), &kid);

		tracing::debug!(kid = %kid, "signing key loaded");

		Ok(Self { kid, encoding_key, public_jwk })
	}

	/// Key id advertised in issued headers and the published JWK.
	pub fn kid(&self) -> &str {
		&self.kid
	}

	/// Public half of the key as a JWK.
	pub fn public_jwk(&self) -> &Jwk {
		&self.public_jwk
	}

	/// Key set containing only the public key, ready for publication.
	pub fn jwk_set(&self) -> JwkSet {
		JwkSet { keys: vec![self.public_jwk.clone()] }
	}

	/// Decoding key matching the public half, for verifying issued credentials.
	pub fn decoding_key(&self) -> Result<DecodingKey> {
		Ok(DecodingKey::from_jwk(&self.public_jwk)?)
	}

	/// Header every issued credential carries.
	pub fn header(&self) -> Header {
		let mut header = Header::new(SIGNING_ALGORITHM);

		header.typ = Some("JWT".into());
		header.kid = Some(self.kid.clone());

		header
	}

	/// Sign `claims` into a compact JWS.
	pub(crate) fn sign<T>(&self, claims: &T) -> Result<String>
	where
		T: Serialize,
	{
		Ok(jsonwebtoken::encode(&self.header(), claims, &self.encoding_key)?)
	}
}
impl Debug for SigningKeyHolder {
	fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
		f.debug_struct("SigningKeyHolder").field("kid", &self.kid).finish_non_exhaustive()
	}
}

fn public_jwk(verifying_key: &VerifyingKey, kid: &str) -> Jwk {
	Jwk {
		common: CommonParameters {
			public_key_use: Some(PublicKeyUse::Signature),
			key_algorithm: Some(KeyAlgorithm::EdDSA),
			key_id: Some(kid.to_owned()),
			..Default::default()
		},
		algorithm: AlgorithmParameters::OctetKeyPair(OctetKeyPairParameters {
			key_type: OctetKeyPairType::OctetKeyPair,
			curve: EllipticCurve::Ed25519,
			x: BASE64_URL_SAFE_NO_PAD.encode(verifying_key.as_bytes()),
		}),
	}
}

// RFC 7638: SHA-256 over the required members in lexicographic order.
fn thumbprint(x: &str) -> String {
	let canonical = format!(r#"{{"crv":"Ed25519","kty":"OKP","x":"{x}"}}"#);

	BASE64_URL_SAFE_NO_PAD.encode(Sha256::digest(canonical.as_bytes()))
}
