//! Query cache for visual queries.
//!
//! A visual query is stored under a content hash of its canonical JSON form
//! with the current base key injected. The base key embeds the data epoch, so
//! reloading data yields new hashes without explicit invalidation; entries of
//! an older epoch are reported as absent.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::query::Query;
use crate::Result;

/// Field injected into the canonical query form before hashing
pub const BASE_HASH_FIELD: &str = "baseHashKey";

/// Hash a query together with a base key.
///
/// The query is serialized with object keys in sorted order, so the hash only
/// depends on content.
pub fn query_hash(query: &Query, base_key: &str) -> Result<String> {
    let mut canonical = serde_json::to_value(query)?;
    if let Value::Object(map) = &mut canonical {
        map.insert(BASE_HASH_FIELD.to_string(), Value::from(base_key));
    }
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(format!("{:016x}", xxhash_rust::xxh3::xxh3_64(&bytes)))
}

/// A stored visual query
#[derive(Debug, Clone, PartialEq)]
pub struct CachedQuery {
    /// Data epoch the hash was computed for
    pub data_key: u64,
    pub query: Query,
}

/// Shared map from query hash to query snapshot
#[derive(Debug, Default)]
pub struct QueryCache {
    entries: RwLock<HashMap<String, Arc<CachedQuery>>>,
}

impl QueryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a query snapshot and return its hash.
    ///
    /// # Arguments
    ///
    /// * `query` - Query to snapshot
    /// * `base_key` - Server revision key combined with the data epoch
    /// * `data_key` - Data epoch the query is registered against
    pub fn insert(&self, query: &Query, base_key: &str, data_key: u64) -> Result<String> {
        let hash = query_hash(query, base_key)?;
        let entry = Arc::new(CachedQuery {
            data_key,
            query: query.clone(),
        });
        self.entries.write().entry(hash.clone()).or_insert(entry);
        log::debug!("Registered visual query {}", hash);
        Ok(hash)
    }

    /// Look up a query registered for the given data epoch.
    pub fn get(&self, hash: &str, data_key: u64) -> Option<Arc<CachedQuery>> {
        self.entries
            .read()
            .get(hash)
            .filter(|entry| entry.data_key == data_key)
            .cloned()
    }

    /// Drop entries from other data epochs.
    pub fn retain_epoch(&self, data_key: u64) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, entry| entry.data_key == data_key);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
