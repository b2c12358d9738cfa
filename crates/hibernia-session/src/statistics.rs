//! Session statistics and N+1 lazy-load detection.
//!
//! Every session counts what it did: entities loaded, statements executed,
//! lazy initializations, flush work and second-level cache traffic. The
//! [`LazyLoadTracker`] additionally watches for the N+1 pattern: the same
//! association of many owners being initialized one at a time.
//!
//! # Example
//!
//! ```ignore
//! for item in &items {
//!     item.collection("bids")?.size()?;   // one select per item
//! }
//! // WARN hibernia::n1: N+1 lazy loading detected ... Item.bids
//!
//! // The fix: join the collection up front.
//! let items = session.query("Item").fetch_profile(FetchProfile::new("bids").join("bids")).list()?;
//! ```

use std::collections::HashMap;
use std::time::Instant;

/// Counters of one session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStatistics {
    /// Entity instances created from result rows
    pub entity_loads: u64,
    /// Select-fetch and lazy-initialization selects
    pub fetches: u64,
    pub proxy_initializations: u64,
    pub collection_initializations: u64,
    /// Statements sent to the connection
    pub statements: u64,
    pub flushes: u64,
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_puts: u64,
}

impl SessionStatistics {
    /// Sum of written rows.
    pub fn writes(&self) -> u64 {
        self.inserts + self.updates + self.deletes
    }
}

/// Where a lazy initialization was triggered.
#[derive(Debug, Clone)]
pub struct CallSite {
    pub owner: String,
    pub property: String,
    pub file: &'static str,
    pub line: u32,
    pub timestamp: Instant,
}

/// Counts lazy initializations per (owner entity, property).
#[derive(Debug)]
pub struct LazyLoadTracker {
    counts: HashMap<(String, String), usize>,
    threshold: usize,
    call_sites: Vec<CallSite>,
}

impl LazyLoadTracker {
    /// A threshold of 0 disables warnings.
    pub fn new(threshold: usize) -> Self {
        Self {
            counts: HashMap::new(),
            threshold,
            call_sites: Vec::new(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Record one lazy initialization of `owner.property`.
    ///
    /// Warns once, when the count reaches the threshold.
    #[track_caller]
    pub fn record(&mut self, owner: &str, property: &str) {
        let count = self
            .counts
            .entry((owner.to_string(), property.to_string()))
            .or_insert(0);
        *count += 1;
        let count = *count;

        let caller = std::panic::Location::caller();
        self.call_sites.push(CallSite {
            owner: owner.to_string(),
            property: property.to_string(),
            file: caller.file(),
            line: caller.line(),
            timestamp: Instant::now(),
        });

        if self.threshold > 0 && count == self.threshold {
            self.emit_warning(owner, property, count);
        }
    }

    fn emit_warning(&self, owner: &str, property: &str, count: usize) {
        tracing::warn!(
            target: "hibernia::n1",
            owner = owner,
            property = property,
            loads = count,
            threshold = self.threshold,
            "N+1 lazy loading detected; consider a fetch profile joining {}.{}",
            owner,
            property
        );

        let sites = self
            .call_sites
            .iter()
            .filter(|s| s.owner == owner && s.property == property)
            .take(5);
        for (i, site) in sites.enumerate() {
            tracing::debug!(
                target: "hibernia::n1",
                index = i,
                file = site.file,
                line = site.line,
                "  [{}] {}:{}",
                i,
                site.file,
                site.line
            );
        }
    }

    pub fn count_for(&self, owner: &str, property: &str) -> usize {
        self.counts
            .get(&(owner.to_string(), property.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Associations at or above the threshold.
    pub fn suspects(&self) -> Vec<(String, String, usize)> {
        let mut out: Vec<_> = self
            .counts
            .iter()
            .filter(|&(_, &n)| self.threshold > 0 && n >= self.threshold)
            .map(|((o, p), &n)| (o.clone(), p.clone(), n))
            .collect();
        out.sort();
        out
    }

    pub fn call_sites(&self) -> &[CallSite] {
        &self.call_sites
    }

    pub fn reset(&mut self) {
        self.counts.clear();
        self.call_sites.clear();
    }
}
