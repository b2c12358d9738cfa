//! Transaction state of one session.
//!
//! The coordinator tracks whether a transaction is active, enforces its
//! timeout, and holds second-level cache updates until the transaction
//! commits. It never talks to the connection itself; the session drives the
//! connection and reports each transition here.
//!
//! ```text
//! NotActive ──begin──► Active ──commit──► Committed
//!                        │  ▲
//!      failure/timeout   ▼  │
//!                 MarkedRollback ──rollback──► RolledBack
//! ```

use hibernia_core::{CacheEntry, Error, Identifier, Result, TransactionErrorKind};
use std::time::{Duration, Instant};

/// Where the session's transaction stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    NotActive,
    Active,
    /// Active, but the only way out is rollback
    MarkedRollback,
    Committed,
    RolledBack,
}

/// A second-level cache change that waits for commit.
#[derive(Debug, Clone)]
pub(crate) enum CacheAction {
    Put {
        region: String,
        id: Identifier,
        entry: CacheEntry,
    },
    Evict {
        region: String,
        id: Identifier,
    },
}

#[derive(Debug)]
pub struct TransactionCoordinator {
    status: TransactionStatus,
    started: Option<Instant>,
    default_timeout: Option<Duration>,
    timeout: Option<Duration>,
    pending_cache: Vec<CacheAction>,
}

impl TransactionCoordinator {
    pub fn new(default_timeout: Option<Duration>) -> Self {
        Self {
            status: TransactionStatus::NotActive,
            started: None,
            default_timeout,
            timeout: default_timeout,
            pending_cache: Vec::new(),
        }
    }

    pub fn status(&self) -> TransactionStatus {
        self.status
    }

    /// Active or marked rollback-only.
    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            TransactionStatus::Active | TransactionStatus::MarkedRollback
        )
    }

    pub fn is_rollback_only(&self) -> bool {
        self.status == TransactionStatus::MarkedRollback
    }

    /// Timeout for the current (or next) transaction.
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.started.map(|s| s.elapsed())
    }

    pub fn begin(&mut self) -> Result<()> {
        if self.is_active() {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "a transaction is already active",
            ));
        }
        self.status = TransactionStatus::Active;
        self.started = Some(Instant::now());
        tracing::debug!(timeout_ms = ?self.timeout.map(|t| t.as_millis()), "Transaction begun");
        Ok(())
    }

    /// Fail if no transaction is active.
    pub fn require_active(&self) -> Result<()> {
        if !self.is_active() {
            return Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "no transaction is active",
            ));
        }
        Ok(())
    }

    /// Fail if the transaction may not do more work.
    ///
    /// An expired transaction is marked rollback-only and reported as
    /// [`Error::TransactionTimeout`].
    pub fn check_writable(&mut self) -> Result<()> {
        self.require_active()?;
        if let (Some(timeout), Some(started)) = (self.timeout, self.started) {
            let elapsed = started.elapsed();
            if elapsed > timeout {
                self.mark_rollback_only();
                tracing::warn!(
                    elapsed_ms = elapsed.as_millis(),
                    timeout_ms = timeout.as_millis(),
                    "Transaction timed out"
                );
                return Err(Error::TransactionTimeout {
                    elapsed_ms: elapsed.as_millis(),
                    timeout_ms: timeout.as_millis(),
                });
            }
        }
        if self.is_rollback_only() {
            return Err(Error::transaction(
                TransactionErrorKind::RollbackOnly,
                "transaction is marked rollback-only",
            ));
        }
        Ok(())
    }

    pub fn mark_rollback_only(&mut self) {
        if self.is_active() {
            self.status = TransactionStatus::MarkedRollback;
        }
    }

    pub(crate) fn queue_cache(&mut self, action: CacheAction) {
        self.pending_cache.push(action);
    }

    /// Record a commit; returns the cache changes to apply.
    pub(crate) fn committed(&mut self) -> Vec<CacheAction> {
        self.finish(TransactionStatus::Committed);
        std::mem::take(&mut self.pending_cache)
    }

    /// Record a rollback; queued cache changes are dropped.
    pub fn rolled_back(&mut self) {
        self.finish(TransactionStatus::RolledBack);
        self.pending_cache.clear();
    }

    fn finish(&mut self, status: TransactionStatus) {
        self.status = status;
        self.started = None;
        self.timeout = self.default_timeout;
    }
}
