//! Persistent collections.
//!
//! A [`PersistentCollection`] holds the elements of one one-to-many role for
//! one owner. Collections loaded from the database start uninitialized and
//! load their elements on first use (`size`, `elements`, `contains`, `add`,
//! `remove`); [`PersistentCollection::is_initialized`] never loads. New
//! collections of transient owners start initialized and empty.

use crate::entity::EntityRef;
use crate::lazy::LazyState;
use crate::session::SessionCore;
use hibernia_core::{CollectionKey, Error, Identifier, Result};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

struct CollectionInner {
    role: String,
    owner: RefCell<Option<Identifier>>,
    state: RefCell<LazyState<Vec<EntityRef>>>,
    session: RefCell<Weak<SessionCore>>,
    dirty: Cell<bool>,
}

/// The elements of one collection role for one owner.
#[derive(Clone)]
pub struct PersistentCollection(Rc<CollectionInner>);

impl PersistentCollection {
    pub(crate) fn transient(role: &str) -> Self {
        Self::with_state(role, None, LazyState::Initialized(Vec::new()), Weak::new())
    }

    pub(crate) fn uninitialized(role: &str, owner: Identifier, session: Weak<SessionCore>) -> Self {
        Self::with_state(role, Some(owner), LazyState::Uninitialized, session)
    }

    fn with_state(
        role: &str,
        owner: Option<Identifier>,
        state: LazyState<Vec<EntityRef>>,
        session: Weak<SessionCore>,
    ) -> Self {
        Self(Rc::new(CollectionInner {
            role: role.to_string(),
            owner: RefCell::new(owner),
            state: RefCell::new(state),
            session: RefCell::new(session),
            dirty: Cell::new(false),
        }))
    }

    /// `Owner.property`
    pub fn role(&self) -> &str {
        &self.0.role
    }

    /// Property name part of the role.
    pub fn property(&self) -> &str {
        self.0
            .role
            .rsplit_once('.')
            .map_or(self.0.role.as_str(), |(_, property)| property)
    }

    pub fn owner(&self) -> Option<Identifier> {
        self.0.owner.borrow().clone()
    }

    pub fn key(&self) -> Option<CollectionKey> {
        self.owner().map(|owner| CollectionKey::new(&self.0.role, owner))
    }

    pub fn is_initialized(&self) -> bool {
        self.0.state.borrow().is_initialized()
    }

    /// Whether elements were added or removed since the last flush.
    pub fn is_dirty(&self) -> bool {
        self.0.dirty.get()
    }

    pub fn has_session(&self) -> bool {
        self.0.session.borrow().strong_count() > 0
    }

    /// Load the elements if not loaded yet.
    #[track_caller]
    pub fn initialize(&self) -> Result<()> {
        {
            let state = self
                .0
                .state
                .try_borrow()
                .map_err(|_| Error::ReentrantAccess("collection state"))?;
            match &*state {
                LazyState::Initialized(_) => return Ok(()),
                LazyState::Initializing => return Err(self.lazy_error("re-entrant initialization")),
                LazyState::Failed(reason) => {
                    return Err(self.lazy_error(format!("initialization failed earlier: {}", reason)));
                }
                LazyState::Uninitialized => {}
            }
        }

        let Some(session) = self.0.session.borrow().upgrade() else {
            return Err(self.lazy_error("no session"));
        };
        self.set_state(LazyState::Initializing)?;
        match session.load_collection(self) {
            Ok(elements) => {
                tracing::trace!(role = %self.0.role, size = elements.len(), "Collection initialized");
                self.set_state(LazyState::Initialized(elements))
            }
            Err(e) => {
                self.set_state(LazyState::Failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    #[track_caller]
    pub fn size(&self) -> Result<usize> {
        self.initialize()?;
        Ok(self.0.state.borrow().get().map_or(0, Vec::len))
    }

    #[track_caller]
    pub fn is_empty(&self) -> Result<bool> {
        self.size().map(|n| n == 0)
    }

    /// Snapshot of the elements, in load/insertion order.
    #[track_caller]
    pub fn elements(&self) -> Result<Vec<EntityRef>> {
        self.initialize()?;
        Ok(self.0.state.borrow().get().cloned().unwrap_or_default())
    }

    #[track_caller]
    pub fn contains(&self, entity: &EntityRef) -> Result<bool> {
        self.initialize()?;
        Ok(self
            .0
            .state
            .borrow()
            .get()
            .is_some_and(|elements| elements.iter().any(|e| EntityRef::ptr_eq(e, entity))))
    }

    /// Add `entity`; returns false if it already is an element.
    #[track_caller]
    pub fn add(&self, entity: EntityRef) -> Result<bool> {
        self.initialize()?;
        let mut state = self.state_mut()?;
        let LazyState::Initialized(elements) = &mut *state else {
            return Err(self.lazy_error("not initialized"));
        };
        if elements.iter().any(|e| EntityRef::ptr_eq(e, &entity)) {
            return Ok(false);
        }
        elements.push(entity);
        self.0.dirty.set(true);
        Ok(true)
    }

    /// Remove `entity`; returns false if it was not an element.
    #[track_caller]
    pub fn remove(&self, entity: &EntityRef) -> Result<bool> {
        self.initialize()?;
        let mut state = self.state_mut()?;
        let LazyState::Initialized(elements) = &mut *state else {
            return Err(self.lazy_error("not initialized"));
        };
        let before = elements.len();
        elements.retain(|e| !EntityRef::ptr_eq(e, entity));
        let removed = elements.len() != before;
        if removed {
            self.0.dirty.set(true);
        }
        Ok(removed)
    }

    /// Remove every element.
    #[track_caller]
    pub fn clear(&self) -> Result<()> {
        self.initialize()?;
        let mut state = self.state_mut()?;
        let LazyState::Initialized(elements) = &mut *state else {
            return Err(self.lazy_error("not initialized"));
        };
        if !elements.is_empty() {
            elements.clear();
            self.0.dirty.set(true);
        }
        Ok(())
    }

    /// Do both handles denote the same collection?
    pub fn ptr_eq(a: &PersistentCollection, b: &PersistentCollection) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    /// Elements if initialized, without loading.
    pub(crate) fn loaded_elements(&self) -> Option<Vec<EntityRef>> {
        self.0.state.borrow().get().cloned()
    }

    /// Mark initialized with `elements` loaded by the session.
    pub(crate) fn set_elements(&self, elements: Vec<EntityRef>) {
        if let Ok(mut state) = self.0.state.try_borrow_mut() {
            if !state.is_initialized() {
                *state = LazyState::Initialized(elements);
            }
        }
    }

    pub(crate) fn bind(&self, session: Weak<SessionCore>, owner: Identifier) {
        *self.0.session.borrow_mut() = session;
        *self.0.owner.borrow_mut() = Some(owner);
    }

    pub(crate) fn unbind(&self) {
        *self.0.session.borrow_mut() = Weak::new();
    }

    pub(crate) fn clear_dirty(&self) {
        self.0.dirty.set(false);
    }

    fn state_mut(&self) -> Result<std::cell::RefMut<'_, LazyState<Vec<EntityRef>>>> {
        self.0
            .state
            .try_borrow_mut()
            .map_err(|_| Error::ReentrantAccess("collection state"))
    }

    fn set_state(&self, state: LazyState<Vec<EntityRef>>) -> Result<()> {
        *self.state_mut()? = state;
        Ok(())
    }

    fn lazy_error(&self, reason: impl Into<String>) -> Error {
        let owner_entity = self
            .0
            .role
            .rsplit_once('.')
            .map_or(self.0.role.as_str(), |(owner, _)| owner);
        Error::LazyInitialization {
            entity: owner_entity.to_string(),
            id: self.owner(),
            property: Some(self.property().to_string()),
            reason: reason.into(),
        }
    }
}

impl fmt::Debug for PersistentCollection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.0.state.borrow();
        match (&*state, self.owner()) {
            (LazyState::Initialized(elements), Some(owner)) => {
                write!(f, "{}#{} ({} elements)", self.0.role, owner, elements.len())
            }
            (LazyState::Initialized(elements), None) => {
                write!(f, "{} ({} elements)", self.0.role, elements.len())
            }
            (other, owner) => write!(
                f,
                "{}#{} ({})",
                self.0.role,
                owner.map(|o| o.to_string()).unwrap_or_default(),
                other.name()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::auction_model;
    use std::sync::Arc;

    #[test]
    fn transient_collections_are_initialized_and_track_changes() {
        let model = auction_model();
        let bids = PersistentCollection::transient("Item.bids");
        let bid = EntityRef::new(Arc::clone(model.entity("Bid").unwrap()));

        assert!(bids.is_initialized());
        assert!(bids.add(bid.clone()).unwrap());
        assert!(!bids.add(bid.clone()).unwrap());
        assert!(bids.is_dirty());
        assert_eq!(bids.size().unwrap(), 1);
        assert!(bids.contains(&bid).unwrap());
        assert!(bids.remove(&bid).unwrap());
        assert!(!bids.remove(&bid).unwrap());
        assert_eq!(bids.property(), "bids");

        bids.add(bid).unwrap();
        bids.clear_dirty();
        bids.clear().unwrap();
        assert!(bids.is_empty().unwrap());
        assert!(bids.is_dirty());
    }

    #[test]
    fn uninitialized_collection_without_session_fails_lazily() {
        let bids = PersistentCollection::uninitialized("Item.bids", Identifier::from(1_i64), Weak::new());
        assert!(!bids.is_initialized());
        let err = bids.size().unwrap_err();
        match err {
            Error::LazyInitialization { entity, property, .. } => {
                assert_eq!(entity, "Item");
                assert_eq!(property.as_deref(), Some("bids"));
            }
            other => std::panic::panic_any(format!("unexpected error: {other:?}")),
        }
        assert!(!bids.is_initialized());
    }

    #[test]
    fn set_elements_initializes_once() {
        let model = auction_model();
        let bids = PersistentCollection::uninitialized("Item.bids", Identifier::from(1_i64), Weak::new());
        let bid = EntityRef::new(Arc::clone(model.entity("Bid").unwrap()));
        bids.set_elements(vec![bid]);
        assert!(bids.is_initialized());
        bids.set_elements(Vec::new());
        assert_eq!(bids.size().unwrap(), 1);
        assert!(!bids.is_dirty());
    }
}
