//! Per-query fetch overrides.
//!
//! A [`FetchProfile`] overrides the mapping-declared fetch strategy of
//! associations addressed by dotted property paths relative to the query's
//! return, e.g. `"bids"` or `"team.headquarters"`.
//!
//! # Example
//!
//! ```ignore
//! let profile = FetchProfile::new("item-with-bids")
//!     .join("bids")
//!     .join("seller.address")
//!     .lazy("category");
//! ```

use crate::plan::FetchMode;
use hibernia_core::{Error, Metamodel, PropertyKind, Result};
use regex::Regex;
use std::collections::HashMap;

const PATH_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)*$";

#[derive(Debug, Clone, Default)]
pub struct FetchProfile {
    name: String,
    overrides: HashMap<String, FetchMode>,
}

impl FetchProfile {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Join-fetch `path`. Intermediate associations are joined too unless
    /// they carry their own override.
    pub fn join(mut self, path: &str) -> Self {
        let path = path.trim();
        if path.is_empty() {
            return self;
        }
        let parts: Vec<&str> = path.split('.').collect();
        for end in 1..parts.len() {
            let prefix = parts[..end].join(".");
            self.overrides.entry(prefix).or_insert(FetchMode::Join);
        }
        self.overrides.insert(path.to_string(), FetchMode::Join);
        self
    }

    /// Load `path` by a follow-up select.
    pub fn select(mut self, path: &str) -> Self {
        self.overrides.insert(path.trim().to_string(), FetchMode::Select);
        self
    }

    /// Leave `path` as a proxy or uninitialized collection.
    pub fn lazy(mut self, path: &str) -> Self {
        self.overrides.insert(path.trim().to_string(), FetchMode::NoFetch);
        self
    }

    pub fn override_for(&self, path: &str) -> Option<FetchMode> {
        self.overrides.get(path).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Check every path's syntax and that it names associations reachable
    /// from `entity`.
    pub fn validate(&self, metamodel: &Metamodel, entity: &str) -> Result<()> {
        let pattern = Regex::new(PATH_PATTERN).map_err(|e| Error::Custom(e.to_string()))?;
        for path in self.overrides.keys() {
            if !pattern.is_match(path) {
                return Err(Error::config(
                    format!("fetch profile {}", self.name),
                    format!("'{}' is not a property path", path),
                ));
            }
            let mut current = metamodel.entity(entity)?.clone();
            for segment in path.split('.') {
                let prop = metamodel
                    .hierarchy(&current)
                    .into_iter()
                    .find_map(|m| m.find_property(segment).cloned())
                    .ok_or_else(|| Error::unknown_property(current.name(), segment))?;
                let next = match &prop.kind {
                    PropertyKind::ToOne(t) => &t.target,
                    PropertyKind::Collection(c) => &c.element,
                    PropertyKind::Basic(_) => {
                        return Err(Error::config(
                            format!("fetch profile {}", self.name),
                            format!("'{}' is not an association", path),
                        ));
                    }
                };
                current = metamodel.entity(next)?.clone();
            }
        }
        Ok(())
    }
}
