//! Persisted resource cache with per-class freshness policies.
//!
//! This module provides the request cache that keeps the client usable offline:
//! - Stores whole responses keyed by method + normalized URL, bucketed by generation
//! - Serves them under cache-first, network-first or stale-while-revalidate
//! - Precaches a fixed manifest all-or-nothing when a generation is installed
//! - Purges every other generation when a new one is activated

mod layer;
mod policy;
mod traits;

pub use layer::ResourceCache;
pub use policy::{Classifier, ResourceClass, DEFAULT_STATIC_EXTENSIONS};
pub use traits::{CacheEntry, CacheKey, CachePolicy, CacheResult, CacheSource};
