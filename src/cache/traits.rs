//! Core types for the resource cache.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::fmt;
use url::Url;

use crate::transport::{Request, Response};

/// Canonical request identity: upper-cased method plus the target URL
/// with its fragment stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  method: String,
  target: Url,
}

impl CacheKey {
  pub fn new(method: &str, target: &Url) -> Self {
    let mut target = target.clone();
    target.set_fragment(None);
    Self {
      method: method.to_ascii_uppercase(),
      target,
    }
  }

  pub fn from_parts(method: &str, target: &str) -> Result<Self, url::ParseError> {
    Ok(Self::new(method, &Url::parse(target)?))
  }

  /// Key for a GET of `target`.
  pub fn get(target: &str) -> Result<Self, url::ParseError> {
    Self::from_parts("GET", target)
  }

  pub fn from_request(request: &Request) -> Self {
    Self::new(request.method(), request.url())
  }

  pub fn method(&self) -> &str {
    &self.method
  }

  pub fn target(&self) -> &str {
    self.target.as_str()
  }

  /// Stable, fixed-length storage identity.
  pub fn hash(&self) -> String {
    let mut hasher = Sha256::new();
    hasher.update(self.method.as_bytes());
    hasher.update(b" ");
    hasher.update(self.target.as_str().as_bytes());
    hex::encode(hasher.finalize())
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.target)
  }
}

/// A stored response. Always written and replaced as a whole.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub key: CacheKey,
  pub response: Response,
  /// When the response was stored
  pub stored_at: DateTime<Utc>,
}

/// How a lookup trades freshness against availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
  /// Serve from cache; only go to the network on a miss.
  CacheFirst,
  /// Go to the network; fall back to cache when it fails.
  NetworkFirst,
  /// Serve from cache immediately and refresh it in the background.
  StaleWhileRevalidate,
}

/// A resolved request: the response plus where it was answered from.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  pub data: T,
  pub source: CacheSource,
  /// Storage time of the served entry; `None` unless it came from storage
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Answered by the network.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Answered by a stored entry without touching the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Cached data served because the network failed.
  pub fn fallback(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFallback,
      cached_at: Some(cached_at),
    }
  }

  /// Synthetic data: neither network nor cache could answer.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }
}

/// Which path answered a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Live fetch
  Network,
  /// Stored entry, network untouched
  Cache,
  /// Network failed, serving the last cached copy
  CacheFallback,
  /// Network failed with nothing cached; synthetic response
  Offline,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_key_strips_fragment_and_normalizes_method() {
    let a = CacheKey::from_parts("get", "https://app.test/books.json#top").unwrap();
    let b = CacheKey::get("https://app.test/books.json").unwrap();
    assert_eq!(a, b);
    assert_eq!(a.hash(), b.hash());
    assert_eq!(a.to_string(), "GET https://app.test/books.json");
  }

  #[test]
  fn test_method_is_part_of_identity() {
    let get = CacheKey::get("https://app.test/api/x").unwrap();
    let post = CacheKey::from_parts("POST", "https://app.test/api/x").unwrap();
    assert_ne!(get.hash(), post.hash());
  }

  #[test]
  fn test_query_is_part_of_identity() {
    let a = CacheKey::get("https://app.test/api/books?page=1").unwrap();
    let b = CacheKey::get("https://app.test/api/books?page=2").unwrap();
    assert_ne!(a.hash(), b.hash());
  }
}
