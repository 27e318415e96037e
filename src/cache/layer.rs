//! Policy-driven response cache over [`CacheStorage`] and a [`ResourceFetcher`].

use futures::future::try_join_all;
use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::db::CacheStorage;
use crate::error::{PersistenceError, PrecacheFailure};
use crate::transport::{with_timeout, Request, ResourceFetcher, Response};

use super::traits::{CacheEntry, CacheKey, CachePolicy, CacheResult};

/// Answers requests from the active generation or the network, depending
/// on the policy, and keeps the active generation up to date.
///
/// Clones share storage, the active generation and revalidation bookkeeping.
#[derive(Clone)]
pub struct ResourceCache {
  storage: Arc<dyn CacheStorage>,
  fetcher: Arc<dyn ResourceFetcher>,
  clock: Arc<dyn Clock>,
  /// Generation that reads and writes go to
  active: Arc<RwLock<String>>,
  /// Deadline for every network fetch
  timeout: Duration,
  /// Key hashes with a background revalidation in flight
  revalidating: Arc<Mutex<HashSet<String>>>,
  revalidations: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl ResourceCache {
  pub fn new(
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn ResourceFetcher>,
    clock: Arc<dyn Clock>,
    generation: &str,
    timeout: Duration,
  ) -> Self {
    Self {
      storage,
      fetcher,
      clock,
      active: Arc::new(RwLock::new(generation.to_string())),
      timeout,
      revalidating: Arc::new(Mutex::new(HashSet::new())),
      revalidations: Arc::new(Mutex::new(Vec::new())),
    }
  }

  /// Generation currently serving reads.
  pub fn active_generation(&self) -> String {
    self
      .active
      .read()
      .map(|g| g.clone())
      .unwrap_or_else(|e| e.into_inner().clone())
  }

  /// Fetch and store a fixed manifest into `generation`.
  ///
  /// All-or-nothing: every fetch must succeed with a success status before
  /// anything is written, and the batch is written in one transaction.
  pub async fn precache(
    &self,
    generation: &str,
    requests: &[Request],
  ) -> Result<usize, PrecacheFailure> {
    info!(generation, count = requests.len(), "Precaching resources");

    let fetches = requests.iter().map(|request| async move {
      let key = CacheKey::from_request(request);
      let response = with_timeout(self.timeout, self.fetcher.fetch(request))
        .await
        .map_err(|source| PrecacheFailure::Fetch {
          key: key.to_string(),
          source,
        })?;

      if !response.is_success() {
        return Err(PrecacheFailure::BadStatus {
          key: key.to_string(),
          status: response.status,
        });
      }

      Ok(CacheEntry {
        key,
        response,
        stored_at: self.clock.now(),
      })
    });

    let entries = try_join_all(fetches).await?;
    self.storage.put_entries(generation, &entries)?;

    info!(generation, count = entries.len(), "Precaching complete");
    Ok(entries.len())
  }

  /// Make `generation` the active one and purge every other generation.
  pub fn activate(&self, generation: &str) -> Result<usize, PersistenceError> {
    {
      let mut active = self.active.write().map_err(PersistenceError::from)?;
      *active = generation.to_string();
    }
    self.purge_stale(generation)
  }

  /// Delete every stored generation except `current`.
  pub fn purge_stale(&self, current: &str) -> Result<usize, PersistenceError> {
    let mut purged = 0;
    for generation in self.storage.generations()? {
      if generation == current {
        continue;
      }
      let removed = self.storage.delete_generation(&generation)?;
      info!(generation = %generation, removed, "Deleted old cache generation");
      purged += 1;
    }
    Ok(purged)
  }

  /// Explicitly drop one entry from the active generation.
  pub fn purge(&self, key: &CacheKey) -> Result<bool, PersistenceError> {
    self.storage.delete_entry(&self.active_generation(), key)
  }

  /// Look up the active generation's entry for `key`.
  ///
  /// Storage failures are logged and treated as a miss.
  pub fn lookup(&self, key: &CacheKey) -> Option<CacheEntry> {
    match self.storage.get_entry(&self.active_generation(), key) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key = %key, error = %e, "Cache read failed, treating as miss");
        None
      }
    }
  }

  /// Resolve `request` under `policy`.
  pub async fn get(&self, request: &Request, policy: CachePolicy) -> CacheResult<Response> {
    if !request.is_get() {
      // Only GETs are cacheable
      return match self.fetch(request).await {
        Ok(response) => CacheResult::from_network(response),
        Err(_) => CacheResult::offline(Response::offline_json()),
      };
    }

    match policy {
      CachePolicy::CacheFirst => self.cache_first(request).await,
      CachePolicy::NetworkFirst => self.network_first(request).await,
      CachePolicy::StaleWhileRevalidate => self.stale_while_revalidate(request).await,
    }
  }

  /// Wait for every background revalidation started so far.
  pub async fn settle(&self) {
    loop {
      let pending: Vec<JoinHandle<()>> = match self.revalidations.lock() {
        Ok(mut handles) => handles.drain(..).collect(),
        Err(e) => e.into_inner().drain(..).collect(),
      };
      if pending.is_empty() {
        return;
      }
      for handle in pending {
        if let Err(e) = handle.await {
          warn!(error = %e, "Revalidation task ended abnormally");
        }
      }
    }
  }

  /// 1. Return the cached entry if present (network untouched)
  /// 2. Otherwise fetch, store a success, and return it
  /// 3. On network failure, synthetic offline response
  async fn cache_first(&self, request: &Request) -> CacheResult<Response> {
    let key = CacheKey::from_request(request);
    if let Some(entry) = self.lookup(&key) {
      return CacheResult::from_cache(entry.response, entry.stored_at);
    }

    match self.fetch(request).await {
      Ok(response) => {
        self.store(key, &response);
        CacheResult::from_network(response)
      }
      Err(_) => CacheResult::offline(Response::offline_text()),
    }
  }

  /// 1. Fetch from network, store a success, and return it
  /// 2. On network failure, return the cached entry
  /// 3. With nothing cached, synthetic offline response
  async fn network_first(&self, request: &Request) -> CacheResult<Response> {
    let key = CacheKey::from_request(request);
    match self.fetch(request).await {
      Ok(response) => {
        self.store(key, &response);
        CacheResult::from_network(response)
      }
      Err(e) => {
        debug!(key = %key, error = %e, "Network failed, falling back to cache");
        match self.lookup(&key) {
          Some(entry) => CacheResult::fallback(entry.response, entry.stored_at),
          None => CacheResult::offline(Response::offline_json()),
        }
      }
    }
  }

  /// Serve the cached entry immediately and refresh it in the background.
  /// Without an entry this behaves like network-first for this call.
  async fn stale_while_revalidate(&self, request: &Request) -> CacheResult<Response> {
    let key = CacheKey::from_request(request);
    match self.lookup(&key) {
      Some(entry) => {
        self.spawn_revalidation(request.clone(), key);
        CacheResult::from_cache(entry.response, entry.stored_at)
      }
      None => self.network_first(request).await,
    }
  }

  fn spawn_revalidation(&self, request: Request, key: CacheKey) {
    let hash = key.hash();
    {
      let mut in_flight = self.revalidating.lock().unwrap_or_else(|e| e.into_inner());
      if !in_flight.insert(hash.clone()) {
        debug!(key = %key, "Revalidation already in flight");
        return;
      }
    }

    let cache = self.clone();
    let handle = tokio::spawn(async move {
      match cache.fetch(&request).await {
        Ok(response) => cache.store(key, &response),
        Err(e) => debug!(key = %key, error = %e, "Background revalidation failed"),
      }
      cache
        .revalidating
        .lock()
        .unwrap_or_else(|e| e.into_inner())
        .remove(&hash);
    });

    let mut handles = self.revalidations.lock().unwrap_or_else(|e| e.into_inner());
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
  }

  async fn fetch(&self, request: &Request) -> Result<Response, crate::error::NetworkError> {
    with_timeout(self.timeout, self.fetcher.fetch(request)).await
  }

  /// Store a network response if it is worth keeping.
  fn store(&self, key: CacheKey, response: &Response) {
    if !response.is_success() {
      return;
    }

    let entry = CacheEntry {
      key,
      response: response.clone(),
      stored_at: self.clock.now(),
    };
    if let Err(e) = self.storage.put_entry(&self.active_generation(), &entry) {
      warn!(key = %entry.key, error = %e, "Failed to store cache entry");
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::clock::SystemClock;
  use crate::db::{Database, MemoryStorage};
  use crate::testing::{GatedFetcher, ScriptedFetcher};
  use tempfile::tempdir;
  use url::Url;

  const GEN: &str = "reader-v1";

  fn request(path: &str) -> Request {
    Request::get(Url::parse("https://reader.test/").unwrap().join(path).unwrap())
  }

  fn cache_with(fetcher: Arc<dyn ResourceFetcher>) -> (ResourceCache, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let cache = ResourceCache::new(
      storage.clone(),
      fetcher,
      Arc::new(SystemClock),
      GEN,
      Duration::from_secs(5),
    );
    (cache, storage)
  }

  fn seed(cache: &ResourceCache, path: &str, body: &str) {
    cache.store(CacheKey::from_request(&request(path)), &Response::ok("text/plain", body));
  }

  #[tokio::test]
  async fn test_cache_first_hit_never_touches_network() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    let (cache, _) = cache_with(fetcher.clone());
    seed(&cache, "/styles.css", "cached");

    let result = cache.get(&request("/styles.css"), CachePolicy::CacheFirst).await;

    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"cached");
    assert_eq!(fetcher.calls(), 0);
  }

  #[tokio::test]
  async fn test_cache_first_miss_fetches_and_stores() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/app.js", Response::ok("text/javascript", "fresh"));
    let (cache, _) = cache_with(fetcher.clone());

    let first = cache.get(&request("/app.js"), CachePolicy::CacheFirst).await;
    let second = cache.get(&request("/app.js"), CachePolicy::CacheFirst).await;

    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.data.body, b"fresh");
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_cache_first_offline_miss_is_synthetic_503() {
    let (cache, _) = cache_with(Arc::new(ScriptedFetcher::new()));

    let result = cache.get(&request("/missing.png"), CachePolicy::CacheFirst).await;

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, Response::offline_text());
  }

  #[tokio::test]
  async fn test_network_first_success_updates_cache() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/api/books", Response::ok("application/json", "[2]"));
    let (cache, _) = cache_with(fetcher.clone());
    seed(&cache, "/api/books", "[1]");

    let result = cache.get(&request("/api/books"), CachePolicy::NetworkFirst).await;

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.body, b"[2]");
    let stored = cache.lookup(&CacheKey::from_request(&request("/api/books"))).unwrap();
    assert_eq!(stored.response.body, b"[2]");
  }

  #[tokio::test]
  async fn test_network_first_failure_serves_stale_entry() {
    let (cache, _) = cache_with(Arc::new(ScriptedFetcher::new()));
    seed(&cache, "/api/books", "[1]");

    let result = cache.get(&request("/api/books"), CachePolicy::NetworkFirst).await;

    assert_eq!(result.source, CacheSource::CacheFallback);
    assert_eq!(result.data.body, b"[1]");
  }

  #[tokio::test]
  async fn test_network_first_failure_without_entry_is_offline_json() {
    let (cache, _) = cache_with(Arc::new(ScriptedFetcher::new()));

    let result = cache.get(&request("/api/books"), CachePolicy::NetworkFirst).await;

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, Response::offline_json());
  }

  #[tokio::test]
  async fn test_error_statuses_are_returned_but_not_stored() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/api/books", Response::new(500, None, "boom"));
    let (cache, _) = cache_with(fetcher);

    let result = cache.get(&request("/api/books"), CachePolicy::NetworkFirst).await;

    assert_eq!(result.data.status, 500);
    assert!(cache.lookup(&CacheKey::from_request(&request("/api/books"))).is_none());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_returns_cached_without_waiting() {
    let fetcher = Arc::new(GatedFetcher::new(Response::ok("text/html", "new")));
    let (cache, _) = cache_with(fetcher.clone());
    seed(&cache, "/", "old");

    // The fetcher is blocked until released, so this only returns if it doesn't wait
    let result = cache.get(&request("/"), CachePolicy::StaleWhileRevalidate).await;
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(result.data.body, b"old");

    fetcher.release();
    cache.settle().await;

    let stored = cache.lookup(&CacheKey::from_request(&request("/"))).unwrap();
    assert_eq!(stored.response.body, b"new");
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_coalesces_same_key() {
    let fetcher = Arc::new(GatedFetcher::new(Response::ok("text/html", "new")));
    let (cache, _) = cache_with(fetcher.clone());
    seed(&cache, "/", "old");

    cache.get(&request("/"), CachePolicy::StaleWhileRevalidate).await;
    cache.get(&request("/"), CachePolicy::StaleWhileRevalidate).await;

    fetcher.release();
    cache.settle().await;
    assert_eq!(fetcher.calls(), 1);
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_miss_acts_like_network_first() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/reader", Response::ok("text/html", "page"));
    let (cache, _) = cache_with(fetcher);

    let result = cache.get(&request("/reader"), CachePolicy::StaleWhileRevalidate).await;
    assert_eq!(result.source, CacheSource::Network);

    let offline = cache.get(&request("/other"), CachePolicy::StaleWhileRevalidate).await;
    assert_eq!(offline.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_non_get_bypasses_cache() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/api/notes", Response::ok("application/json", "{}"));
    let (cache, _) = cache_with(fetcher);
    let post = Request::new(
      "POST",
      Url::parse("https://reader.test/api/notes").unwrap(),
    );

    let result = cache.get(&post, CachePolicy::NetworkFirst).await;

    assert_eq!(result.source, CacheSource::Network);
    assert!(cache.lookup(&CacheKey::from_request(&post)).is_none());
  }

  #[tokio::test]
  async fn test_precache_is_all_or_nothing() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/", Response::ok("text/html", "index"));
    fetcher.respond("/app.js", Response::ok("text/javascript", "app"));
    let (cache, storage) = cache_with(fetcher.clone());

    let manifest = [request("/"), request("/app.js"), request("/missing.css")];
    let result = cache.precache("reader-v2", &manifest).await;

    assert!(matches!(result, Err(PrecacheFailure::Fetch { .. })));
    assert_eq!(storage.entry_count("reader-v2").unwrap(), 0);

    fetcher.respond("/missing.css", Response::ok("text/css", "body{}"));
    assert_eq!(cache.precache("reader-v2", &manifest).await.unwrap(), 3);
    assert_eq!(storage.entry_count("reader-v2").unwrap(), 3);
  }

  #[tokio::test]
  async fn test_precache_rejects_error_status() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/", Response::new(404, None, ""));
    let (cache, storage) = cache_with(fetcher);

    let result = cache.precache("reader-v2", &[request("/")]).await;

    assert!(matches!(result, Err(PrecacheFailure::BadStatus { status: 404, .. })));
    assert_eq!(storage.entry_count("reader-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_activation_purges_previous_generation() {
    let fetcher = Arc::new(ScriptedFetcher::new());
    fetcher.respond("/app.js", Response::ok("text/javascript", "v2"));
    let (cache, storage) = cache_with(fetcher);
    seed(&cache, "/app.js", "v1");

    cache.precache("reader-v2", &[request("/app.js")]).await.unwrap();
    assert_eq!(cache.activate("reader-v2").unwrap(), 1);

    assert_eq!(cache.active_generation(), "reader-v2");
    assert_eq!(storage.generations().unwrap(), vec!["reader-v2".to_string()]);
    let entry = cache.lookup(&CacheKey::from_request(&request("/app.js"))).unwrap();
    assert_eq!(entry.response.body, b"v2");
  }

  #[tokio::test]
  async fn test_entries_survive_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    let key = CacheKey::from_request(&request("/styles.css"));

    let before = {
      let db = Arc::new(Database::open(&path).unwrap());
      let cache = ResourceCache::new(
        db,
        Arc::new(ScriptedFetcher::new()),
        Arc::new(SystemClock),
        GEN,
        Duration::from_secs(5),
      );
      seed(&cache, "/styles.css", "body{}");
      cache.lookup(&key).unwrap()
    };

    let db = Arc::new(Database::open(&path).unwrap());
    let cache = ResourceCache::new(
      db,
      Arc::new(ScriptedFetcher::new()),
      Arc::new(SystemClock),
      GEN,
      Duration::from_secs(5),
    );
    assert_eq!(cache.lookup(&key).unwrap(), before);
  }

  #[tokio::test(start_paused = true)]
  async fn test_hung_fetch_times_out() {
    let fetcher = Arc::new(GatedFetcher::new(Response::ok("text/html", "never")));
    let (cache, _) = cache_with(fetcher);

    let result = cache.get(&request("/api/slow"), CachePolicy::NetworkFirst).await;

    assert_eq!(result.source, CacheSource::Offline);
  }

  #[tokio::test]
  async fn test_explicit_purge_removes_entry() {
    let (cache, _) = cache_with(Arc::new(ScriptedFetcher::new()));
    seed(&cache, "/styles.css", "body{}");
    let key = CacheKey::from_request(&request("/styles.css"));

    assert!(cache.purge(&key).unwrap());
    assert!(cache.lookup(&key).is_none());
  }
}
