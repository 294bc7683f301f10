use anyhow::{Context, Result};
use serde_json::Value;
use std::time::Duration;

use crate::constants::METADATA_FETCH_TIMEOUT;

const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Client for the content-addressed artifact service. Artifacts are
/// identified by IPFS CIDv0 hashes and fetched over the service's HTTP
/// API.
#[derive(Clone)]
pub struct ArtifactClient {
	base_uri: String,
	client: reqwest::Client,
}

impl ArtifactClient {
	pub fn new(base_uri: &str) -> Self {
		Self {
			base_uri: base_uri.trim_end_matches('/').to_string(),
			client: reqwest::Client::new(),
		}
	}

	/// Whether `uri` is a well-formed artifact identifier (CIDv0: 46
	/// base58 characters starting `Qm`).
	pub fn is_valid_uri(uri: &str) -> bool {
		uri.len() == 46 &&
			uri.starts_with("Qm") &&
			uri.chars().all(|c| BASE58_ALPHABET.contains(c))
	}

	/// Fetch an artifact's bytes and parse them as JSON, bounded by the
	/// short metadata timeout.
	pub async fn fetch_json(&self, uri: &str) -> Result<Value> {
		let response = self
			.client
			.get(format!("{}/api/v0/cat", self.base_uri))
			.query(&[("arg", uri)])
			.timeout(METADATA_FETCH_TIMEOUT)
			.send()
			.await
			.with_context(|| format!("artifact service fetch failed for {uri}"))?
			.error_for_status()
			.with_context(|| format!("artifact service rejected fetch of {uri}"))?;

		response.json().await.with_context(|| format!("artifact {uri} is not JSON"))
	}

	pub async fn reachable(&self) -> bool {
		self.client
			.get(format!("{}/api/v0/bootstrap", self.base_uri))
			.timeout(Duration::from_secs(10))
			.send()
			.await
			.map(|response| response.status().is_success())
			.unwrap_or(false)
	}
}
