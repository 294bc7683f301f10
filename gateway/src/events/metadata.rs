//! Resolution of artifact URIs referenced by event payloads into their
//! parsed JSON metadata.

use lru::LruCache;
use serde_json::Value;
use std::{
	num::NonZeroUsize,
	sync::{Arc, Mutex},
	time::Instant,
};

use crate::{
	artifacts::ArtifactClient,
	constants::{METADATA_CACHE_SIZE, METADATA_CACHE_TTL},
};

/// Schema check applied to fetched metadata before it is substituted
/// into an outgoing message.
pub type Validator = fn(&Value) -> bool;

/// Bounty metadata is a non-empty list of artifact descriptors, each
/// carrying at least a mimetype.
pub fn validate_bounty_metadata(value: &Value) -> bool {
	value.as_array().is_some_and(|artifacts| {
		!artifacts.is_empty() &&
			artifacts
				.iter()
				.all(|artifact| artifact.get("mimetype").is_some_and(Value::is_string))
	})
}

struct CacheEntry {
	value: Value,
	fetched_at: Instant,
}

/// Fetches and memoizes artifact metadata. Failures never propagate: a
/// URI that cannot be fetched, parsed or validated resolves to itself,
/// so subscribers always receive *something* in the metadata slot.
#[derive(Clone)]
pub struct MetadataResolver {
	artifacts: ArtifactClient,
	cache: Arc<Mutex<LruCache<String, CacheEntry>>>,
}

impl MetadataResolver {
	pub fn new(artifacts: ArtifactClient) -> Self {
		Self {
			artifacts,
			cache: Arc::new(Mutex::new(LruCache::new(
				NonZeroUsize::new(METADATA_CACHE_SIZE).expect("cache size is non-zero"),
			))),
		}
	}

	/// Resolve `uri` to its parsed metadata, or to the URI itself when it
	/// is not a fetchable artifact. Two concurrent callers may both miss
	/// the cache and fetch; the cache is memoization, not a lock.
	pub async fn resolve(&self, uri: &str, validate: Validator) -> Value {
		if !ArtifactClient::is_valid_uri(uri) {
			return Value::String(uri.to_string())
		}

		if let Some(cached) = self.cached(uri) {
			return cached
		}

		let value = match self.artifacts.fetch_json(uri).await {
			Ok(value) if validate(&value) => value,
			Ok(_) => {
				tracing::warn!("metadata at {uri} failed schema validation");
				Value::String(uri.to_string())
			},
			Err(e) => {
				tracing::debug!("could not resolve metadata at {uri}: {e:#}");
				Value::String(uri.to_string())
			},
		};

		self.insert(uri, value.clone());
		value
	}

	fn cached(&self, uri: &str) -> Option<Value> {
		let mut cache = self.cache.lock().expect("metadata cache lock poisoned");
		match cache.get(uri) {
			Some(entry) if entry.fetched_at.elapsed() < METADATA_CACHE_TTL =>
				Some(entry.value.clone()),
			Some(_) => {
				cache.pop(uri);
				None
			},
			None => None,
		}
	}

	fn insert(&self, uri: &str, value: Value) {
		let mut cache = self.cache.lock().expect("metadata cache lock poisoned");
		cache.put(uri.to_string(), CacheEntry { value, fetched_at: Instant::now() });
	}
}
