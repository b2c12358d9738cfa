//! Entity proxies.
//!
//! A [`LazyRef`] stands in for an entity that has not been loaded. It knows
//! its identity from the start, so [`LazyRef::identifier`] never touches the
//! database; anything else initializes it through the owning session.
//!
//! Proxies serialize as a [`SerializableProxy`] placeholder and deserialize
//! into a detached proxy with no session. [`Session::reattach`] binds a
//! detached proxy to another session.
//!
//! [`Session::reattach`]: crate::Session::reattach

use crate::entity::EntityRef;
use crate::lazy::LazyState;
use crate::session::SessionCore;
use hibernia_core::{EntityKey, EntityMetadata, Error, Identifier, Result, Value};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

struct ProxyInner {
    entity_name: String,
    class_name: String,
    interfaces: Vec<String>,
    key: EntityKey,
    state: RefCell<LazyState<EntityRef>>,
    session: RefCell<Weak<SessionCore>>,
    read_only: Cell<bool>,
    /// (owner entity, property) the proxy was created for
    origin: RefCell<Option<(String, String)>>,
}

/// A lazy placeholder for one entity.
#[derive(Clone)]
pub struct LazyRef(Rc<ProxyInner>);

impl LazyRef {
    pub(crate) fn new(meta: &EntityMetadata, id: Identifier, session: Weak<SessionCore>) -> Self {
        Self(Rc::new(ProxyInner {
            entity_name: meta.name().to_string(),
            class_name: meta.class_name().to_string(),
            interfaces: meta.interfaces().to_vec(),
            key: meta.key(id),
            state: RefCell::new(LazyState::Uninitialized),
            session: RefCell::new(session),
            read_only: Cell::new(false),
            origin: RefCell::new(None),
        }))
    }

    /// Declared entity name of the target.
    pub fn entity_name(&self) -> &str {
        &self.0.entity_name
    }

    /// Identifier of the target. Never initializes.
    pub fn identifier(&self) -> &Identifier {
        &self.0.key.id
    }

    pub fn key(&self) -> &EntityKey {
        &self.0.key
    }

    pub fn is_initialized(&self) -> bool {
        self.0.state.borrow().is_initialized()
    }

    /// Name of the current lazy state.
    pub fn state_name(&self) -> &'static str {
        self.0.state.borrow().name()
    }

    /// Whether a live session is attached.
    pub fn has_session(&self) -> bool {
        self.0.session.borrow().strong_count() > 0
    }

    pub fn is_read_only(&self) -> bool {
        self.0.read_only.get()
    }

    pub fn set_read_only(&self, read_only: bool) {
        self.0.read_only.set(read_only);
    }

    /// Load the target if not loaded yet.
    ///
    /// Fails with [`Error::LazyInitialization`] when no open session is
    /// attached. A failed load leaves the proxy permanently failed.
    #[track_caller]
    pub fn initialize(&self) -> Result<()> {
        {
            let state = self
                .0
                .state
                .try_borrow()
                .map_err(|_| Error::ReentrantAccess("proxy state"))?;
            match &*state {
                LazyState::Initialized(_) => return Ok(()),
                LazyState::Initializing => {
                    return Err(self.lazy_error("re-entrant initialization"));
                }
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

        match session.load_proxy_target(self) {
            Ok(target) => {
                tracing::trace!(key = %self.0.key, "Proxy initialized");
                self.set_state(LazyState::Initialized(target))
            }
            Err(e) => {
                tracing::debug!(key = %self.0.key, error = %e, "Proxy initialization failed");
                self.set_state(LazyState::Failed(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// The target instance, initializing on first use.
    #[track_caller]
    pub fn get(&self) -> Result<EntityRef> {
        self.initialize()?;
        self.0
            .state
            .borrow()
            .get()
            .cloned()
            .ok_or_else(|| self.lazy_error("not initialized"))
    }

    /// Read a basic property of the target, initializing on first use.
    #[track_caller]
    pub fn get_value(&self, property: &str) -> Result<Value> {
        self.get()?.get(property)
    }

    /// Do both handles denote the same proxy?
    pub fn ptr_eq(a: &LazyRef, b: &LazyRef) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn bind(&self, session: Weak<SessionCore>) {
        *self.0.session.borrow_mut() = session;
    }

    pub(crate) fn unbind(&self) {
        *self.0.session.borrow_mut() = Weak::new();
    }

    /// Attach an instance loaded by other means, if still uninitialized.
    pub(crate) fn complete(&self, target: &EntityRef) {
        if let Ok(mut state) = self.0.state.try_borrow_mut() {
            if state.is_uninitialized() {
                *state = LazyState::Initialized(target.clone());
            }
        }
    }

    pub(crate) fn set_origin(&self, owner: &str, property: &str) {
        let mut origin = self.0.origin.borrow_mut();
        if origin.is_none() {
            *origin = Some((owner.to_string(), property.to_string()));
        }
    }

    pub(crate) fn origin(&self) -> Option<(String, String)> {
        self.0.origin.borrow().clone()
    }

    fn set_state(&self, state: LazyState<EntityRef>) -> Result<()> {
        let mut current = self
            .0
            .state
            .try_borrow_mut()
            .map_err(|_| Error::ReentrantAccess("proxy state"))?;
        *current = state;
        Ok(())
    }

    fn lazy_error(&self, reason: impl Into<String>) -> Error {
        Error::LazyInitialization {
            entity: self.0.entity_name.clone(),
            id: Some(self.0.key.id.clone()),
            property: self.origin().map(|(_, property)| property),
            reason: reason.into(),
        }
    }

    /// The serializable placeholder for this proxy.
    pub fn to_serializable(&self) -> SerializableProxy {
        SerializableProxy {
            entity_name: self.0.entity_name.clone(),
            root_entity: self.0.key.entity.clone(),
            identifier: self.0.key.id.clone(),
            identifier_type: self.0.key.id.type_name(),
            persistent_class: self.0.class_name.clone(),
            interfaces: self.0.interfaces.clone(),
            read_only: self.0.read_only.get(),
        }
    }

    /// A detached proxy rebuilt from its placeholder.
    pub fn from_serializable(placeholder: SerializableProxy) -> Self {
        Self(Rc::new(ProxyInner {
            entity_name: placeholder.entity_name,
            class_name: placeholder.persistent_class,
            interfaces: placeholder.interfaces,
            key: EntityKey::new(placeholder.root_entity, placeholder.identifier),
            state: RefCell::new(LazyState::Uninitialized),
            session: RefCell::new(Weak::new()),
            read_only: Cell::new(placeholder.read_only),
            origin: RefCell::new(None),
        }))
    }
}

impl fmt::Debug for LazyRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{} ({})", self.0.entity_name, self.0.key.id, self.state_name())
    }
}

/// What a proxy writes when serialized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializableProxy {
    pub entity_name: String,
    /// Hierarchy root the identity is keyed by
    pub root_entity: String,
    pub identifier: Identifier,
    pub identifier_type: String,
    pub persistent_class: String,
    pub interfaces: Vec<String>,
    pub read_only: bool,
}

impl Serialize for LazyRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        self.to_serializable().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for LazyRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        SerializableProxy::deserialize(deserializer).map(LazyRef::from_serializable)
    }
}
