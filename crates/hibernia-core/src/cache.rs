//! Second-level cache contract.
//!
//! Regions are named after hierarchy roots. Entries hold an entity's
//! disassembled state: no live objects, only values and referenced
//! identifiers, so they can be shared between sessions and threads.

use crate::identity::Identifier;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// One cached property value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachedValue {
    Basic(Value),
    Reference(Option<Identifier>),
    /// Collections are not cached with their owner
    Collection,
}

/// Disassembled state of one entity row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Concrete entity name
    pub entity: String,
    pub version: Option<Value>,
    /// One value per property slot of `entity`
    pub state: Vec<CachedValue>,
}

/// A cache provider. Implementations must be safe to share across threads.
pub trait RegionCache: Send + Sync {
    fn get(&self, region: &str, id: &Identifier) -> Option<CacheEntry>;

    fn put(&self, region: &str, id: Identifier, entry: CacheEntry);

    fn evict(&self, region: &str, id: &Identifier);

    fn evict_all(&self, region: &str);
}

/// Process-local cache backed by a mutex-guarded map.
#[derive(Debug, Default)]
pub struct InMemoryRegionCache {
    regions: Mutex<HashMap<String, HashMap<Identifier, CacheEntry>>>,
}

impl InMemoryRegionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries in a region.
    pub fn len(&self, region: &str) -> usize {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(region)
            .map_or(0, HashMap::len)
    }

    pub fn is_empty(&self, region: &str) -> bool {
        self.len(region) == 0
    }
}

impl RegionCache for InMemoryRegionCache {
    fn get(&self, region: &str, id: &Identifier) -> Option<CacheEntry> {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(region)
            .and_then(|r| r.get(id))
            .cloned()
    }

    fn put(&self, region: &str, id: Identifier, entry: CacheEntry) {
        tracing::trace!(region = region, id = %id, "Cache put");
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(region.to_string())
            .or_default()
            .insert(id, entry);
    }

    fn evict(&self, region: &str, id: &Identifier) {
        if let Some(r) = self
            .regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(region)
        {
            r.remove(id);
        }
    }

    fn evict_all(&self, region: &str) {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(region);
    }
}
