//! API-key authentication against the external auth service.

use ethers::types::H160;
use lru::LruCache;
use serde_json::Value;
use std::{
	num::NonZeroUsize,
	sync::{Arc, Mutex},
	time::{Duration, Instant},
};

use crate::{
	constants::{AUTH_CACHE_SIZE, AUTH_CACHE_TTL},
	settings,
};

/// Routes reachable without an API key even when the deployment
/// requires one.
pub const AUTH_WHITELIST: &[&str] = &["/status", "/relay/withdrawal", "/transactions"];

pub fn whitelisted(path: &str) -> bool {
	AUTH_WHITELIST.contains(&path)
}

#[derive(Clone, Debug)]
pub struct User {
	pub authorized: bool,
	pub user_id: Option<String>,
	pub eth_address: Option<H160>,
	pub max_artifact_size: u64,
}

impl User {
	fn anonymous(max_artifact_size: u64) -> Self {
		Self { authorized: false, user_id: None, eth_address: None, max_artifact_size }
	}
}

#[derive(Clone)]
pub struct AuthClient {
	uri: Option<String>,
	community: String,
	fallback_max_size: u64,
	client: reqwest::Client,
	cache: Arc<Mutex<LruCache<String, (User, Instant)>>>,
}

impl AuthClient {
	pub fn new(settings: &settings::Settings) -> Self {
		Self {
			uri: settings.auth.uri.clone(),
			community: settings.community.clone(),
			fallback_max_size: settings.artifact.fallback_max_size,
			client: reqwest::Client::new(),
			cache: Arc::new(Mutex::new(LruCache::new(
				NonZeroUsize::new(AUTH_CACHE_SIZE).expect("cache size is non-zero"),
			))),
		}
	}

	pub fn require_api_key(&self) -> bool {
		self.uri.is_some()
	}

	/// Look an API key up with the auth service. Lookups are memoized
	/// briefly; failures authenticate nobody rather than erroring, since
	/// some routes are open to anonymous callers.
	pub async fn authenticate(&self, api_key: Option<&str>) -> User {
		let anonymous = User::anonymous(self.fallback_max_size);

		let (Some(uri), Some(api_key)) = (&self.uri, api_key) else { return anonymous };

		if let Some(user) = self.cached(api_key) {
			return user
		}

		let auth_uri = format!("{}/communities/{}/auth", uri, self.community);
		let response = self
			.client
			.get(&auth_uri)
			.header("Authorization", api_key)
			.timeout(Duration::from_secs(10))
			.send()
			.await;

		let body: Value = match response {
			Ok(response) if response.status().is_success() =>
				match response.json().await {
					Ok(body) => body,
					Err(e) => {
						tracing::error!("invalid response from the auth service: {e}");
						return anonymous
					},
				},
			Ok(_) | Err(_) => return anonymous,
		};

		let is_anonymous = body.get("anonymous").and_then(Value::as_bool).unwrap_or(true);
		let user = User {
			authorized: true,
			user_id: (!is_anonymous)
				.then(|| body.get("user_id").and_then(Value::as_str).map(str::to_string))
				.flatten(),
			eth_address: body
				.get("eth_address")
				.and_then(Value::as_str)
				.and_then(|address| crate::eth::contracts::parse_address(address).ok()),
			max_artifact_size: body
				.get("max_artifact_size")
				.and_then(Value::as_u64)
				.unwrap_or(self.fallback_max_size),
		};

		self.cache
			.lock()
			.expect("auth cache lock poisoned")
			.put(api_key.to_string(), (user.clone(), Instant::now()));
		user
	}

	pub async fn reachable(&self) -> Option<bool> {
		let uri = self.uri.as_ref()?;
		Some(
			self.client
				.get(uri)
				.timeout(Duration::from_secs(10))
				.send()
				.await
				.is_ok(),
		)
	}

	fn cached(&self, api_key: &str) -> Option<User> {
		let mut cache = self.cache.lock().expect("auth cache lock poisoned");
		match cache.get(api_key) {
			Some((user, fetched_at)) if fetched_at.elapsed() < AUTH_CACHE_TTL =>
				Some(user.clone()),
			Some(_) => {
				cache.pop(api_key);
				None
			},
			None => None,
		}
	}
}

/// Pull the API key out of an `Authorization` header, ignoring any
/// scheme prefix.
pub fn api_key_from_header(header: Option<&str>) -> Option<&str> {
	header.and_then(|value| value.split_whitespace().last())
}
