//! Transport guards for outbound key-set retrieval: HTTPS enforcement and domain allowlists.

// std
use std::collections::HashSet;
// crates.io
use serde::{Deserialize, de::Deserializer};
use url::Url;
// self
use crate::_prelude::*;

/// Canonicalise a DNS name by trimming whitespace, removing any trailing dot, and lowercasing.
pub fn canonicalize_dns_name(value: &str) -> Option<String> {
	let trimmed = value.trim();
	if trimmed.is_empty() {
		return None;
	}

	let without_trailing_dot = trimmed.trim_end_matches('.');
	if without_trailing_dot.is_empty() {
		return None;
	}

	Some(without_trailing_dot.to_ascii_lowercase())
}

/// Normalise an allowlist by canonicalising entries and removing duplicates/empties.
pub fn normalize_allowlist(domains: Vec<String>) -> Vec<String> {
	let mut seen = HashSet::new();

	domains
		.into_iter()
		.filter_map(|domain| canonicalize_dns_name(&domain))
		.filter(|canonical| seen.insert(canonical.clone()))
		.collect()
}

/// `serde` helper to normalise allowlist domains during deserialisation.
pub fn deserialize_allowed_domains<'de, D>(
	deserializer: D,
) -> std::result::Result<Vec<String>, D::Error>
where
	D: Deserializer<'de>,
{
	let raw = Vec::<String>::deserialize(deserializer)?;

	Ok(normalize_allowlist(raw))
}

/// Ensure the provided URL uses HTTPS.
pub fn enforce_https(url: &Url) -> Result<()> {
	if url.scheme() == "https" {
		Ok(())
	} else {
		Err(Error::Security(format!("Upstream URL {url} must use HTTPS.")))
	}
}

/// Evaluate whether the given hostname is allowed by the provided suffix allowlist.
///
/// An empty list allows every host.
pub fn host_is_allowed(host: &str, allowed_domains: &[String]) -> bool {
	if allowed_domains.is_empty() {
		return true;
	}

	let Some(host) = canonicalize_dns_name(host) else {
		return false;
	};

	allowed_domains
		.iter()
		.filter_map(|domain| canonicalize_dns_name(domain))
		.any(|domain| matches_allowlist(&host, &domain))
}

/// Check a redirect target against the HTTPS requirement and allowlist of the key source.
pub fn check_redirect(target: &Url, require_https: bool, allowed_domains: &[String]) -> Result<()> {
	if require_https {
		enforce_https(target)?;
	}

	match target.host_str() {
		Some(host) if host_is_allowed(host, allowed_domains) => Ok(()),
		Some(host) => Err(Error::Security(format!("Redirect to {host} leaves the allowlist."))),
		None => Err(Error::Security(format!("Redirect target {target} has no host."))),
	}
}

#[inline]
fn matches_allowlist(host: &str, domain: &str) -> bool {
	if host == domain {
		return true;
	}

	host.strip_suffix(domain).and_then(|prefix| prefix.strip_suffix('.')).is_some()
}
