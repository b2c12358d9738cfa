//! Session lifecycle callbacks.

use hibernia_core::Error;

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments. Returning `Err` aborts the operation
/// that fired the event (a failing `BeforeCommit` prevents the commit).
type SessionEventFn = Box<dyn FnMut() -> Result<(), Error>>;

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush computes its actions.
    BeforeFlush,
    /// Fired after flush executed every statement.
    AfterFlush,
    /// Fired before commit, after the commit-time flush.
    BeforeCommit,
    /// Fired after the connection committed.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

/// Registered callbacks, fired in registration order.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    pub fn register(&mut self, event: SessionEvent, callback: impl FnMut() -> Result<(), Error> + 'static) {
        self.slot(event).push(Box::new(callback));
    }

    pub fn fire(&mut self, event: SessionEvent) -> Result<(), Error> {
        for cb in self.slot(event).iter_mut() {
            cb()?;
        }
        Ok(())
    }

    pub fn count(&self, event: SessionEvent) -> usize {
        match event {
            SessionEvent::BeforeFlush => self.before_flush.len(),
            SessionEvent::AfterFlush => self.after_flush.len(),
            SessionEvent::BeforeCommit => self.before_commit.len(),
            SessionEvent::AfterCommit => self.after_commit.len(),
            SessionEvent::AfterRollback => self.after_rollback.len(),
        }
    }

    /// Append the callbacks of `other` after this set's own.
    pub fn absorb(&mut self, other: SessionEventCallbacks) {
        self.before_flush.extend(other.before_flush);
        self.after_flush.extend(other.after_flush);
        self.before_commit.extend(other.before_commit);
        self.after_commit.extend(other.after_commit);
        self.after_rollback.extend(other.after_rollback);
    }

    fn slot(&mut self, event: SessionEvent) -> &mut Vec<SessionEventFn> {
        match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[test]
    fn callbacks_fire_in_order_and_stop_on_error() {
        let mut callbacks = SessionEventCallbacks::default();
        let hits = Rc::new(Cell::new(0));
        let first = Rc::clone(&hits);
        callbacks.register(SessionEvent::BeforeCommit, move || {
            first.set(first.get() + 1);
            Ok(())
        });
        callbacks.register(SessionEvent::BeforeCommit, || Err(Error::Custom("veto".into())));
        let last = Rc::clone(&hits);
        callbacks.register(SessionEvent::BeforeCommit, move || {
            last.set(last.get() + 10);
            Ok(())
        });

        assert!(callbacks.fire(SessionEvent::BeforeCommit).is_err());
        assert_eq!(hits.get(), 1);
        assert_eq!(callbacks.count(SessionEvent::BeforeCommit), 3);
        assert!(callbacks.fire(SessionEvent::AfterCommit).is_ok());
    }
}
