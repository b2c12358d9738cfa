//! Session factories.
//!
//! A [`SessionFactory`] is built once per persistence unit and shared by
//! every thread; it owns everything sessions have in common: the metamodel,
//! the settings, the connection provider, the optional second-level cache
//! and identifier generator state.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel)
//!     .settings(Settings::new().max_fetch_depth(2))
//!     .connection_provider(Arc::new(provider))
//!     .region_cache(Arc::new(InMemoryRegionCache::new()))
//!     .build()?;
//!
//! let session = factory.open_session();
//! ```

use crate::session::Session;
use hibernia_core::{
    ConnectionProvider, Error, Identifier, Metamodel, RegionCache, Result, Settings,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

/// State shared by a factory and all of its sessions.
pub(crate) struct FactoryInner {
    pub(crate) metamodel: Arc<Metamodel>,
    pub(crate) settings: Settings,
    pub(crate) provider: Arc<dyn ConnectionProvider>,
    pub(crate) cache: Option<Arc<dyn RegionCache>>,
    /// Last identifier handed out per root entity
    generators: Mutex<HashMap<String, i64>>,
}

impl FactoryInner {
    /// The second-level cache, if configured and enabled.
    pub(crate) fn region_cache(&self) -> Option<&Arc<dyn RegionCache>> {
        if self.settings.use_second_level_cache {
            self.cache.as_ref()
        } else {
            None
        }
    }

    /// Next value of the increment generator of `root`.
    ///
    /// `seed` reports the highest identifier in the database; it runs once
    /// per root, the first time an identifier is requested.
    pub(crate) fn next_increment(
        &self,
        root: &str,
        seed: impl FnOnce() -> Result<i64>,
    ) -> Result<i64> {
        let mut generators = self.generators.lock().unwrap_or_else(PoisonError::into_inner);
        let current = match generators.get(root) {
            Some(&current) => current,
            None => {
                let max = seed()?;
                tracing::debug!(root = root, max, "Seeded increment generator");
                max
            }
        };
        let next = current
            .checked_add(1)
            .ok_or_else(|| Error::Custom(format!("identifier space of {} exhausted", root)))?;
        generators.insert(root.to_string(), next);
        Ok(next)
    }
}

/// Factory for sessions; cheap to clone and safe to share across threads.
#[derive(Clone)]
pub struct SessionFactory {
    inner: Arc<FactoryInner>,
}

impl fmt::Debug for SessionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionFactory")
            .field("entities", &self.inner.metamodel.entities().count())
            .field("settings", &self.inner.settings)
            .field("second_level_cache", &self.inner.cache.is_some())
            .finish()
    }
}

impl SessionFactory {
    pub fn builder(metamodel: impl Into<Arc<Metamodel>>) -> SessionFactoryBuilder {
        SessionFactoryBuilder {
            metamodel: metamodel.into(),
            settings: Settings::default(),
            provider: None,
            cache: None,
        }
    }

    /// Open a new session. Sessions connect lazily, on the first statement.
    pub fn open_session(&self) -> Session {
        Session::new(Arc::clone(&self.inner))
    }

    pub fn metamodel(&self) -> &Arc<Metamodel> {
        &self.inner.metamodel
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    /// Drop one entity from the second-level cache.
    pub fn evict_cache(&self, entity: &str, id: impl Into<Identifier>) -> Result<()> {
        let meta = self.inner.metamodel.entity(entity)?;
        let id = meta.identifier().coerce(meta.name(), id.into())?;
        if let Some(cache) = &self.inner.cache {
            cache.evict(meta.root_name(), &id);
        }
        Ok(())
    }

    /// Drop every cached entity of a hierarchy.
    pub fn evict_cache_region(&self, entity: &str) -> Result<()> {
        let meta = self.inner.metamodel.entity(entity)?;
        if let Some(cache) = &self.inner.cache {
            cache.evict_all(meta.root_name());
        }
        Ok(())
    }
}

/// Builder for [`SessionFactory`].
pub struct SessionFactoryBuilder {
    metamodel: Arc<Metamodel>,
    settings: Settings,
    provider: Option<Arc<dyn ConnectionProvider>>,
    cache: Option<Arc<dyn RegionCache>>,
}

impl SessionFactoryBuilder {
    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn connection_provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn region_cache(mut self, cache: Arc<dyn RegionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<SessionFactory> {
        let provider = self
            .provider
            .ok_or_else(|| Error::config("connection_provider", "a connection provider is required"))?;
        tracing::info!(
            entities = self.metamodel.entities().count(),
            second_level_cache = self.cache.is_some() && self.settings.use_second_level_cache,
            "Session factory built"
        );
        Ok(SessionFactory {
            inner: Arc::new(FactoryInner {
                metamodel: self.metamodel,
                settings: self.settings,
                provider,
                cache: self.cache,
                generators: Mutex::new(HashMap::new()),
            }),
        })
    }
}
