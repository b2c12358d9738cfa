//! Entity instances.
//!
//! Entities are metadata-driven values: an [`EntityRef`] is a shared handle
//! to one instance whose state is a vector of [`PropertyValue`]s indexed by
//! the property slots of its [`EntityMetadata`]. Two handles denote the same
//! entity exactly when [`EntityRef::ptr_eq`] holds; the persistence context
//! guarantees one instance per identity per session.
//!
//! # Example
//!
//! ```ignore
//! let item = session.instantiate("Item")?;
//! item.set("name", "Lamp")?;
//! item.set_reference("seller", Some(&user))?;
//! session.persist(&item)?;
//!
//! let seller = item.related("seller")?;   // may initialize a proxy
//! let bids = item.collection("bids")?;    // never initializes by itself
//! ```

use crate::collection::PersistentCollection;
use crate::proxy::LazyRef;
use hibernia_core::{
    EntityKey, EntityMetadata, Error, Identifier, PropertyKind, Result, TypeError, Value,
};
use std::cell::{Ref, RefCell, RefMut};
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

/// The target of a to-one association.
#[derive(Clone)]
pub enum Reference {
    /// A loaded (or new) instance
    Entity(EntityRef),
    /// A lazy placeholder
    Proxy(LazyRef),
}

impl Reference {
    /// Entity name: concrete for instances, declared for proxies.
    pub fn entity_name(&self) -> String {
        match self {
            Reference::Entity(e) => e.entity_name(),
            Reference::Proxy(p) => p.entity_name().to_string(),
        }
    }

    /// Identifier of the target. Never initializes a proxy.
    pub fn identifier(&self) -> Option<Identifier> {
        match self {
            Reference::Entity(e) => e.id(),
            Reference::Proxy(p) => Some(p.identifier().clone()),
        }
    }

    pub fn key(&self) -> Option<EntityKey> {
        match self {
            Reference::Entity(e) => e.key(),
            Reference::Proxy(p) => Some(p.key().clone()),
        }
    }

    pub fn is_initialized(&self) -> bool {
        match self {
            Reference::Entity(_) => true,
            Reference::Proxy(p) => p.is_initialized(),
        }
    }

    /// The target instance, initializing a proxy if needed.
    #[track_caller]
    pub fn get(&self) -> Result<EntityRef> {
        match self {
            Reference::Entity(e) => Ok(e.clone()),
            Reference::Proxy(p) => p.get(),
        }
    }

    /// Whether this reference denotes `entity` (by handle or identity).
    pub fn refers_to(&self, entity: &EntityRef) -> bool {
        match self {
            Reference::Entity(e) => EntityRef::ptr_eq(e, entity),
            Reference::Proxy(p) => entity.key().as_ref() == Some(p.key()),
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Entity(e) => write!(f, "Entity({:?})", e),
            Reference::Proxy(p) => write!(f, "Proxy({:?})", p),
        }
    }
}

/// The value stored in one property slot.
#[derive(Clone, Debug)]
pub enum PropertyValue {
    Basic(Value),
    Reference(Option<Reference>),
    Collection(PersistentCollection),
}

/// State of one entity instance.
pub struct EntityData {
    pub(crate) metadata: Arc<EntityMetadata>,
    pub(crate) id: Option<Identifier>,
    pub(crate) values: Vec<PropertyValue>,
    /// Set by setters, cleared when a flush writes the instance
    pub(crate) modified: bool,
    /// A row was read into or written from this instance
    pub(crate) persisted: bool,
}

impl EntityData {
    pub(crate) fn value(&self, slot: usize) -> Option<&PropertyValue> {
        self.values.get(slot)
    }
}

/// Shared handle to an entity instance.
#[derive(Clone)]
pub struct EntityRef(Rc<RefCell<EntityData>>);

impl EntityRef {
    /// A transient instance with every property unset.
    pub(crate) fn new(metadata: Arc<EntityMetadata>) -> Self {
        let values = metadata
            .properties()
            .iter()
            .map(|p| match &p.kind {
                PropertyKind::Basic(_) => PropertyValue::Basic(Value::Null),
                PropertyKind::ToOne(_) => PropertyValue::Reference(None),
                PropertyKind::Collection(c) => {
                    PropertyValue::Collection(PersistentCollection::transient(&c.role))
                }
            })
            .collect();
        Self(Rc::new(RefCell::new(EntityData {
            metadata,
            id: None,
            values,
            modified: false,
            persisted: false,
        })))
    }

    pub(crate) fn with_id(metadata: Arc<EntityMetadata>, id: Identifier) -> Self {
        let entity = Self::new(metadata);
        entity.0.borrow_mut().id = Some(id);
        entity
    }

    /// Do both handles denote the same instance?
    pub fn ptr_eq(a: &EntityRef, b: &EntityRef) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }

    pub(crate) fn data(&self) -> Result<Ref<'_, EntityData>> {
        self.0
            .try_borrow()
            .map_err(|_| Error::ReentrantAccess("entity instance"))
    }

    pub(crate) fn data_mut(&self) -> Result<RefMut<'_, EntityData>> {
        self.0
            .try_borrow_mut()
            .map_err(|_| Error::ReentrantAccess("entity instance"))
    }

    /// Concrete entity name.
    pub fn entity_name(&self) -> String {
        self.0.borrow().metadata.name().to_string()
    }

    pub fn metadata(&self) -> Arc<EntityMetadata> {
        Arc::clone(&self.0.borrow().metadata)
    }

    pub fn id(&self) -> Option<Identifier> {
        self.0.borrow().id.clone()
    }

    /// Session identity, once the instance has an identifier.
    pub fn key(&self) -> Option<EntityKey> {
        let data = self.0.borrow();
        data.id.clone().map(|id| data.metadata.key(id))
    }

    /// Assign the identifier of a transient instance.
    ///
    /// Identifiers are immutable once set; assigning a different one fails.
    pub fn set_id(&self, id: impl Into<Identifier>) -> Result<()> {
        let mut data = self.data_mut()?;
        let id = data
            .metadata
            .identifier()
            .coerce(data.metadata.name(), id.into())?;
        if let Some(current) = &data.id {
            if current != &id {
                return Err(Error::Custom(format!(
                    "identifier of {}#{} cannot change to {}",
                    data.metadata.name(),
                    current,
                    id
                )));
            }
        }
        data.id = Some(id);
        Ok(())
    }

    /// Value of a basic property.
    pub fn get(&self, property: &str) -> Result<Value> {
        let data = self.data()?;
        let slot = data.metadata.slot_of(property)?;
        match data.value(slot) {
            Some(PropertyValue::Basic(v)) => Ok(v.clone()),
            _ => Err(wrong_kind(&data.metadata, property, "basic property")),
        }
    }

    /// Assign a basic property; the value is checked against its type.
    pub fn set(&self, property: &str, value: impl Into<Value>) -> Result<()> {
        let mut data = self.data_mut()?;
        let prop = data.metadata.property(property)?;
        let slot = prop.slot;
        let value = prop.check_value(data.metadata.name(), value.into())?;
        data.values[slot] = PropertyValue::Basic(value);
        data.modified = true;
        Ok(())
    }

    /// The to-one reference in `property`, without initializing it.
    pub fn reference(&self, property: &str) -> Result<Option<Reference>> {
        let data = self.data()?;
        let slot = data.metadata.slot_of(property)?;
        match data.value(slot) {
            Some(PropertyValue::Reference(r)) => Ok(r.clone()),
            _ => Err(wrong_kind(&data.metadata, property, "to-one association")),
        }
    }

    /// The instance referenced by `property`, initializing a proxy if needed.
    #[track_caller]
    pub fn related(&self, property: &str) -> Result<Option<EntityRef>> {
        match self.reference(property)? {
            Some(reference) => reference.get().map(Some),
            None => Ok(None),
        }
    }

    /// Point a to-one association at `target` (or clear it).
    pub fn set_reference(&self, property: &str, target: Option<&EntityRef>) -> Result<()> {
        self.assign(property, target.map(|t| Reference::Entity(t.clone())))
    }

    /// Point a to-one association at an instance or a proxy.
    pub fn assign(&self, property: &str, target: Option<Reference>) -> Result<()> {
        let mut data = self.data_mut()?;
        let prop = data.metadata.property(property)?;
        let slot = prop.slot;
        let declared = match &prop.kind {
            PropertyKind::ToOne(t) => t.target.clone(),
            _ => return Err(wrong_kind(&data.metadata, property, "to-one association")),
        };
        if let Some(reference) = &target {
            let compatible = match reference {
                Reference::Entity(e) if Rc::ptr_eq(&e.0, &self.0) => {
                    conforms(&data.metadata, &declared)
                }
                Reference::Entity(e) => conforms(&e.data()?.metadata, &declared),
                Reference::Proxy(p) => p.entity_name() == declared || p.key().entity == declared,
            };
            if !compatible {
                return Err(Error::TypeMismatch(TypeError {
                    expected: "reference to the declared target entity",
                    actual: reference.entity_name(),
                    entity: Some(data.metadata.name().to_string()),
                    property: Some(property.to_string()),
                }));
            }
        }
        data.values[slot] = PropertyValue::Reference(target);
        data.modified = true;
        Ok(())
    }

    /// The collection in `property`. Never initializes it.
    pub fn collection(&self, property: &str) -> Result<PersistentCollection> {
        let data = self.data()?;
        let slot = data.metadata.slot_of(property)?;
        match data.value(slot) {
            Some(PropertyValue::Collection(c)) => Ok(c.clone()),
            _ => Err(wrong_kind(&data.metadata, property, "collection")),
        }
    }

    /// Whether a setter ran since the instance was last written or loaded.
    pub fn is_modified(&self) -> bool {
        self.0.borrow().modified
    }

    pub(crate) fn slot_value(&self, slot: usize) -> Option<PropertyValue> {
        self.0.borrow().values.get(slot).cloned()
    }

    pub(crate) fn set_slot(&self, slot: usize, value: PropertyValue) -> Result<()> {
        let mut data = self.data_mut()?;
        if let Some(current) = data.values.get_mut(slot) {
            *current = value;
        }
        Ok(())
    }

    /// Whether this instance was ever loaded or written. Detached copies
    /// keep the flag; instances built by hand never have it.
    pub fn is_persisted(&self) -> bool {
        self.0.borrow().persisted
    }

    pub(crate) fn mark_persisted(&self) {
        if let Ok(mut data) = self.0.try_borrow_mut() {
            data.persisted = true;
        }
    }

    pub(crate) fn clear_modified(&self) {
        if let Ok(mut data) = self.0.try_borrow_mut() {
            data.modified = false;
        }
    }
}

/// Whether an instance of `meta` may stand in for the entity `declared`.
fn conforms(meta: &EntityMetadata, declared: &str) -> bool {
    meta.is_subtype_of(declared)
}

fn wrong_kind(meta: &EntityMetadata, property: &str, expected: &'static str) -> Error {
    Error::TypeMismatch(TypeError {
        expected,
        actual: "a different property kind".to_string(),
        entity: Some(meta.name().to_string()),
        property: Some(property.to_string()),
    })
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.try_borrow() {
            Ok(data) => match &data.id {
                Some(id) => write!(f, "{}#{}", data.metadata.name(), id),
                None => write!(f, "{}#<transient>", data.metadata.name()),
            },
            Err(_) => write!(f, "<borrowed entity>"),
        }
    }
}
