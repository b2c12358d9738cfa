//! Factory-wide settings.
//!
//! Settings are plain data with a `Default` and builder-style setters. They
//! can also be read from `hibernia.*` string properties, the form in which
//! deployment descriptors and environment files usually carry them.
//!
//! # Example
//!
//! ```ignore
//! let settings = Settings::from_properties([
//!     ("hibernia.max_fetch_depth", "2"),
//!     ("hibernia.transaction_timeout_secs", "30"),
//! ])?;
//! ```

use crate::error::{Error, Result};
use std::time::Duration;

const PREFIX: &str = "hibernia.";

/// Which managed entities are examined at flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirtyCheckMode {
    /// Compare every managed, writable entity against its snapshot.
    #[default]
    Full,
    /// Compare only entities marked as candidates or modified through setters.
    Tracked,
}

/// Configuration shared by every session of a factory.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Maximum depth of joined fetches in one load plan.
    pub max_fetch_depth: usize,
    /// Consult and populate the second-level cache for cacheable entities.
    pub use_second_level_cache: bool,
    /// Load entities read-only unless told otherwise.
    pub default_read_only: bool,
    /// Begin a transaction on the first statement if none is active.
    pub auto_begin: bool,
    /// Flush before committing.
    pub flush_on_commit: bool,
    pub dirty_checking: DirtyCheckMode,
    /// Upper bound on a transaction's lifetime, checked at flush and commit.
    pub transaction_timeout: Option<Duration>,
    /// Lazy initializations of one association before an N+1 warning.
    pub n1_warn_threshold: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            max_fetch_depth: 3,
            use_second_level_cache: true,
            default_read_only: false,
            auto_begin: true,
            flush_on_commit: true,
            dirty_checking: DirtyCheckMode::Full,
            transaction_timeout: None,
            n1_warn_threshold: 3,
        }
    }
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.max_fetch_depth = depth;
        self
    }

    pub fn use_second_level_cache(mut self, value: bool) -> Self {
        self.use_second_level_cache = value;
        self
    }

    pub fn default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    pub fn auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    pub fn flush_on_commit(mut self, value: bool) -> Self {
        self.flush_on_commit = value;
        self
    }

    pub fn dirty_checking(mut self, mode: DirtyCheckMode) -> Self {
        self.dirty_checking = mode;
        self
    }

    pub fn transaction_timeout(mut self, timeout: Duration) -> Self {
        self.transaction_timeout = Some(timeout);
        self
    }

    pub fn n1_warn_threshold(mut self, threshold: usize) -> Self {
        self.n1_warn_threshold = threshold;
        self
    }

    /// Read settings from `hibernia.*` properties on top of the defaults.
    ///
    /// Keys without the prefix are ignored; unknown prefixed keys are logged
    /// and ignored; malformed values fail with [`Error::Config`].
    pub fn from_properties<K, V, I>(properties: I) -> Result<Self>
    where
        K: AsRef<str>,
        V: AsRef<str>,
        I: IntoIterator<Item = (K, V)>,
    {
        let mut settings = Self::default();
        for (key, value) in properties {
            let key = key.as_ref();
            let value = value.as_ref().trim();
            let Some(name) = key.strip_prefix(PREFIX) else {
                continue;
            };
            match name {
                "max_fetch_depth" => settings.max_fetch_depth = parse_usize(key, value)?,
                "use_second_level_cache" => {
                    settings.use_second_level_cache = parse_bool(key, value)?;
                }
                "default_read_only" => settings.default_read_only = parse_bool(key, value)?,
                "auto_begin" => settings.auto_begin = parse_bool(key, value)?,
                "flush_on_commit" => settings.flush_on_commit = parse_bool(key, value)?,
                "dirty_checking" => {
                    settings.dirty_checking = match value.to_ascii_lowercase().as_str() {
                        "full" => DirtyCheckMode::Full,
                        "tracked" => DirtyCheckMode::Tracked,
                        _ => {
                            return Err(Error::config(key, format!(
                                "expected 'full' or 'tracked', got '{}'",
                                value
                            )));
                        }
                    };
                }
                "transaction_timeout_secs" => {
                    let secs = parse_usize(key, value)?;
                    settings.transaction_timeout =
                        (secs > 0).then(|| Duration::from_secs(secs as u64));
                }
                "n1_warn_threshold" => settings.n1_warn_threshold = parse_usize(key, value)?,
                _ => tracing::warn!(key = key, "Ignoring unknown setting"),
            }
        }
        Ok(settings)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" | "on" => Ok(true),
        "false" | "no" | "0" | "off" => Ok(false),
        _ => Err(Error::config(key, format!("expected a boolean, got '{}'", value))),
    }
}

fn parse_usize(key: &str, value: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| Error::config(key, format!("expected a non-negative integer, got '{}'", value)))
}
