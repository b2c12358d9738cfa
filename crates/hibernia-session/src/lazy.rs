//! The lazy-initialization state machine shared by proxies and collections.
//!
//! ```text
//! Uninitialized -> Initializing -> Initialized(T)
//!                              \-> Failed (terminal)
//! ```
//!
//! Nothing ever returns to `Uninitialized`.

/// State of a lazily initialized placeholder.
#[derive(Debug, Clone)]
pub enum LazyState<T> {
    Uninitialized,
    /// A load is in progress further up the call stack.
    Initializing,
    Initialized(T),
    /// The load failed; the placeholder stays unusable.
    Failed(String),
}

impl<T> LazyState<T> {
    pub fn is_initialized(&self) -> bool {
        matches!(self, LazyState::Initialized(_))
    }

    pub fn is_uninitialized(&self) -> bool {
        matches!(self, LazyState::Uninitialized)
    }

    pub fn get(&self) -> Option<&T> {
        match self {
            LazyState::Initialized(value) => Some(value),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LazyState::Uninitialized => "uninitialized",
            LazyState::Initializing => "initializing",
            LazyState::Initialized(_) => "initialized",
            LazyState::Failed(_) => "failed",
        }
    }
}
