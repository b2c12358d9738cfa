//! The persistence context: one managed instance per identity.
//!
//! The context maps every [`EntityKey`] the session knows about to exactly
//! one [`EntityEntry`]. Entries carry the loaded-state snapshot used for
//! dirty checking, the version read from the database, and the lifecycle
//! status of the instance. Proxies and collections handed out by the session
//! are registered here too, so identity holds for placeholders as well.
//!
//! # Lifecycle
//!
//! ```text
//!   register ──► Loading ──► Managed ──remove──► Removed ──flush──► (evicted)
//!                               │
//!                 evict/clear ──┴──► detached (no entry)
//! ```
//!
//! Entries without a snapshot are pending inserts: they become persistent
//! when the next flush writes them.

use crate::collection::PersistentCollection;
use crate::entity::{EntityRef, PropertyValue};
use crate::proxy::LazyRef;
use hibernia_core::{CollectionKey, EntityKey, Error, Identifier, PropertyKind, Result, Value};
use std::collections::{HashMap, HashSet};

// ============================================================================
// Entries
// ============================================================================

/// Lifecycle status of an instance with respect to one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityStatus {
    /// Never persisted, not known to the session
    Transient,
    /// Registered while its result row is still being assembled
    Loading,
    Managed,
    /// Scheduled for deletion at the next flush
    Removed,
    /// Has an identity, but the session no longer manages it
    Detached,
}

/// One property of a loaded-state snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum StateValue {
    Basic(Value),
    /// Identity of the referenced row, if any
    Reference(Option<EntityKey>),
    /// A reference to an instance that has no identifier yet
    Unsaved,
    /// Collections are tracked by their own snapshots
    Collection,
}

/// Bookkeeping for one managed instance.
#[derive(Debug, Clone)]
pub struct EntityEntry {
    pub instance: EntityRef,
    pub key: EntityKey,
    pub status: EntityStatus,
    /// State as last read from or written to the database
    pub loaded_state: Option<Vec<StateValue>>,
    pub version: Option<Value>,
    pub read_only: bool,
    /// Whether a row for this identity exists (or will, once flushed)
    pub exists_in_db: bool,
    /// Registration order, used to keep flush order deterministic
    pub(crate) seq: u64,
}

impl EntityEntry {
    /// Scheduled for insertion at the next flush.
    pub fn is_pending_insert(&self) -> bool {
        self.status == EntityStatus::Managed && !self.exists_in_db
    }
}

/// A collection handed out by the session, with its last flushed content.
#[derive(Debug, Clone)]
pub struct CollectionEntry {
    pub collection: PersistentCollection,
    pub owner: EntityKey,
    /// Element identities at load or last flush; `None` for new collections
    pub snapshot: Option<Vec<EntityKey>>,
}

/// Result of looking up an identity.
#[derive(Debug, Clone)]
pub enum Lookup {
    /// A managed instance (or an initialized proxy's target)
    Initialized(EntityRef),
    /// Only an uninitialized proxy is registered
    Uninitialized(LazyRef),
    Absent,
}

// ============================================================================
// Context
// ============================================================================

/// Identity map and snapshot store of one session.
#[derive(Debug, Default)]
pub struct PersistenceContext {
    entries: HashMap<EntityKey, EntityEntry>,
    proxies: HashMap<EntityKey, LazyRef>,
    collections: HashMap<CollectionKey, CollectionEntry>,
    natural_ids: HashMap<(String, Vec<Value>), Identifier>,
    candidates: HashSet<EntityKey>,
    next_seq: u64,
    closed: bool,
}

impl PersistenceContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Number of managed entries (any status).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `instance` under `key`.
    ///
    /// Registering the same instance twice returns its existing entry; a
    /// different instance under a taken key fails with
    /// [`Error::DuplicateIdentity`]. A snapshot marks the instance as read
    /// from the database, no snapshot as a pending insert.
    pub fn register(
        &mut self,
        key: EntityKey,
        instance: &EntityRef,
        loaded_state: Option<Vec<StateValue>>,
    ) -> Result<&mut EntityEntry> {
        self.check_open()?;
        if let Some(existing) = self.entries.get(&key) {
            if !EntityRef::ptr_eq(&existing.instance, instance) {
                return Err(Error::DuplicateIdentity {
                    entity: key.entity.clone(),
                    id: key.id.clone(),
                });
            }
        } else {
            let version = version_of(instance);
            let seq = self.next_seq;
            self.next_seq += 1;
            let exists_in_db = loaded_state.is_some();
            tracing::trace!(key = %key, exists_in_db, "Registering entity");
            self.entries.insert(
                key.clone(),
                EntityEntry {
                    instance: instance.clone(),
                    key: key.clone(),
                    status: EntityStatus::Managed,
                    loaded_state,
                    version,
                    read_only: false,
                    exists_in_db,
                    seq,
                },
            );
        }
        self.entries
            .get_mut(&key)
            .ok_or_else(|| Error::Custom(format!("entry for {} vanished", key)))
    }

    /// The managed instance for `key`, if any. Never touches the database.
    pub fn resolve(&self, key: &EntityKey) -> Result<Option<EntityRef>> {
        self.check_open()?;
        Ok(self.entries.get(key).map(|e| e.instance.clone()))
    }

    /// Whether `key` has an entry, removed entries included.
    pub fn contains(&self, key: &EntityKey) -> Result<bool> {
        self.check_open()?;
        Ok(self.entries.contains_key(key))
    }

    /// Instance, proxy, or nothing.
    pub fn lookup(&self, key: &EntityKey) -> Result<Lookup> {
        self.check_open()?;
        if let Some(entry) = self.entries.get(key) {
            return Ok(Lookup::Initialized(entry.instance.clone()));
        }
        Ok(match self.proxies.get(key) {
            Some(proxy) => match proxy.is_initialized().then(|| proxy.get().ok()).flatten() {
                Some(target) => Lookup::Initialized(target),
                None => Lookup::Uninitialized(proxy.clone()),
            },
            None => Lookup::Absent,
        })
    }

    pub fn entry(&self, key: &EntityKey) -> Option<&EntityEntry> {
        self.entries.get(key)
    }

    pub fn entry_mut(&mut self, key: &EntityKey) -> Option<&mut EntityEntry> {
        self.entries.get_mut(key)
    }

    /// Key of `instance` if this exact instance is managed here.
    pub fn key_of(&self, instance: &EntityRef) -> Option<EntityKey> {
        let key = instance.key()?;
        let entry = self.entries.get(&key)?;
        EntityRef::ptr_eq(&entry.instance, instance).then_some(key)
    }

    pub fn status_of(&self, key: &EntityKey) -> Option<EntityStatus> {
        self.entries.get(key).map(|e| e.status)
    }

    /// Loaded state of `key`; `None` for unknown identities and pending inserts.
    pub fn snapshot_for(&self, key: &EntityKey) -> Result<Option<&[StateValue]>> {
        self.check_open()?;
        Ok(self.entries.get(key).and_then(|e| e.loaded_state.as_deref()))
    }

    /// Entries in registration order.
    pub fn entries(&self) -> Vec<&EntityEntry> {
        let mut entries: Vec<_> = self.entries.values().collect();
        entries.sort_by_key(|e| e.seq);
        entries
    }

    /// Flag `key` for dirty checking under tracked dirty-check mode.
    pub fn mark_candidate(&mut self, key: EntityKey) -> Result<()> {
        self.check_open()?;
        self.candidates.insert(key);
        Ok(())
    }

    pub fn is_candidate(&self, key: &EntityKey) -> bool {
        self.candidates.contains(key)
    }

    /// Names of properties whose current value differs from the snapshot.
    ///
    /// Versions and collections are never reported. Pending inserts and
    /// unknown keys have nothing to compare and report nothing.
    pub fn compute_dirty_properties(&self, key: &EntityKey) -> Result<Vec<String>> {
        self.check_open()?;
        let Some(entry) = self.entries.get(key) else {
            return Ok(Vec::new());
        };
        match &entry.loaded_state {
            Some(snapshot) => dirty_properties(&entry.instance, snapshot),
            None => Ok(Vec::new()),
        }
    }

    /// Schedule `key` for deletion. Returns false for unknown keys.
    pub fn remove(&mut self, key: &EntityKey) -> Result<bool> {
        self.check_open()?;
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.status = EntityStatus::Removed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Take the snapshot again from the instance's current state.
    pub fn refresh_snapshot(&mut self, key: &EntityKey) -> Result<()> {
        self.check_open()?;
        let Some(entry) = self.entries.get_mut(key) else {
            return Ok(());
        };
        entry.loaded_state = Some(disassemble(&entry.instance)?);
        entry.version = version_of(&entry.instance);
        entry.exists_in_db = true;
        Ok(())
    }

    /// Overwrite one slot of an existing snapshot.
    pub(crate) fn patch_snapshot(&mut self, key: &EntityKey, slot: usize, value: StateValue) {
        if let Some(state) = self
            .entries
            .get_mut(key)
            .and_then(|e| e.loaded_state.as_mut())
        {
            if let Some(current) = state.get_mut(slot) {
                *current = value;
            }
        }
    }

    /// Toggle read-only mode.
    ///
    /// Leaving read-only mode retakes the snapshot, so changes made while
    /// read-only are never written.
    pub fn set_read_only(&mut self, key: &EntityKey, read_only: bool) -> Result<()> {
        self.check_open()?;
        let entry = self.entries.get_mut(key).ok_or_else(|| {
            Error::Custom(format!("{} is not managed by this session", key))
        })?;
        let was_read_only = entry.read_only;
        entry.read_only = read_only;
        if was_read_only && !read_only && entry.exists_in_db {
            self.refresh_snapshot(key)?;
        }
        Ok(())
    }

    /// Stop managing `key`: its entry, proxy, collections and natural-id
    /// mapping are dropped and the placeholders lose their session.
    pub fn evict(&mut self, key: &EntityKey) -> Result<Option<EntityEntry>> {
        self.check_open()?;
        let entry = self.entries.remove(key);
        if let Some(proxy) = self.proxies.remove(key) {
            proxy.unbind();
        }
        self.candidates.remove(key);
        self.collections.retain(|_, c| {
            if &c.owner == key {
                c.collection.unbind();
                false
            } else {
                true
            }
        });
        if let Some(entry) = &entry {
            unbind_collections(&entry.instance);
        }
        self.natural_ids
            .retain(|(root, _), id| !(*root == key.entity && *id == key.id));
        tracing::trace!(key = %key, found = entry.is_some(), "Evicted entity");
        Ok(entry)
    }

    /// Detach everything. Proxies and collections handed out earlier fail
    /// lazily from now on.
    pub fn clear(&mut self) -> Result<()> {
        self.check_open()?;
        self.detach_all();
        Ok(())
    }

    fn detach_all(&mut self) {
        for entry in self.entries.values() {
            unbind_collections(&entry.instance);
        }
        for proxy in self.proxies.values() {
            proxy.unbind();
        }
        for entry in self.collections.values() {
            entry.collection.unbind();
        }
        self.entries.clear();
        self.proxies.clear();
        self.collections.clear();
        self.natural_ids.clear();
        self.candidates.clear();
    }

    /// Forget flush bookkeeping once every change is written.
    pub(crate) fn flushed(&mut self) {
        self.candidates.clear();
        for entry in self.entries.values() {
            entry.instance.clear_modified();
        }
    }

    /// Clear and refuse further use.
    pub fn close(&mut self) {
        self.detach_all();
        self.closed = true;
    }

    // ------------------------------------------------------------------------
    // Proxies
    // ------------------------------------------------------------------------

    pub fn proxy_for(&self, key: &EntityKey) -> Option<&LazyRef> {
        self.proxies.get(key)
    }

    /// Register a proxy. Fails if another proxy already holds the identity.
    pub fn register_proxy(&mut self, proxy: LazyRef) -> Result<()> {
        self.check_open()?;
        let key = proxy.key().clone();
        if let Some(existing) = self.proxies.get(&key) {
            if !LazyRef::ptr_eq(existing, &proxy) {
                return Err(Error::DuplicateIdentity {
                    entity: key.entity,
                    id: key.id,
                });
            }
            return Ok(());
        }
        self.proxies.insert(key, proxy);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Collections
    // ------------------------------------------------------------------------

    /// Track `collection` of the instance `owner`.
    pub fn register_collection(
        &mut self,
        collection: &PersistentCollection,
        owner: EntityKey,
        snapshot: Option<Vec<EntityKey>>,
    ) -> Result<()> {
        self.check_open()?;
        let key = collection.key().ok_or_else(|| {
            Error::Custom(format!("collection {} has no owner identifier", collection.role()))
        })?;
        self.collections.insert(
            key,
            CollectionEntry {
                collection: collection.clone(),
                owner,
                snapshot,
            },
        );
        Ok(())
    }

    pub fn collection_entry(&self, key: &CollectionKey) -> Option<&CollectionEntry> {
        self.collections.get(key)
    }

    pub fn collection_entries(&self) -> impl Iterator<Item = &CollectionEntry> {
        self.collections.values()
    }

    /// Snapshot the current elements of an initialized collection.
    pub fn refresh_collection_snapshot(&mut self, key: &CollectionKey) {
        if let Some(entry) = self.collections.get_mut(key) {
            if let Some(elements) = entry.collection.loaded_elements() {
                entry.snapshot = Some(elements.iter().filter_map(EntityRef::key).collect());
                entry.collection.clear_dirty();
            }
        }
    }

    // ------------------------------------------------------------------------
    // Natural ids
    // ------------------------------------------------------------------------

    pub fn cache_natural_id(&mut self, root: &str, values: Vec<Value>, id: Identifier) {
        self.natural_ids.insert((root.to_string(), values), id);
    }

    pub fn natural_id(&self, root: &str, values: &[Value]) -> Option<&Identifier> {
        self.natural_ids.get(&(root.to_string(), values.to_vec()))
    }
}

fn unbind_collections(instance: &EntityRef) {
    if let Ok(data) = instance.data() {
        for value in &data.values {
            if let PropertyValue::Collection(c) = value {
                c.unbind();
            }
        }
    }
}

// ============================================================================
// Snapshots
// ============================================================================

/// Current state of `instance` in snapshot form.
pub(crate) fn disassemble(instance: &EntityRef) -> Result<Vec<StateValue>> {
    let data = instance.data()?;
    Ok(data
        .values
        .iter()
        .map(|value| match value {
            PropertyValue::Basic(v) => StateValue::Basic(v.clone()),
            PropertyValue::Reference(None) => StateValue::Reference(None),
            PropertyValue::Reference(Some(r)) => match r.key() {
                Some(key) => StateValue::Reference(Some(key)),
                None => StateValue::Unsaved,
            },
            PropertyValue::Collection(_) => StateValue::Collection,
        })
        .collect())
}

/// Value of the version property, if the entity is versioned.
pub(crate) fn version_of(instance: &EntityRef) -> Option<Value> {
    let data = instance.data().ok()?;
    let slot = data.metadata.version_property()?.slot;
    match data.value(slot) {
        Some(PropertyValue::Basic(v)) => Some(v.clone()),
        _ => None,
    }
}

/// Natural-id values of `instance`, if the entity declares one.
pub(crate) fn natural_id_of(instance: &EntityRef) -> Option<Vec<Value>> {
    let data = instance.data().ok()?;
    let slots = data.metadata.natural_id_slots();
    if slots.is_empty() {
        return None;
    }
    slots
        .iter()
        .map(|&slot| match data.value(slot) {
            Some(PropertyValue::Basic(v)) => Some(v.clone()),
            Some(PropertyValue::Reference(Some(r))) => {
                r.identifier().and_then(|id| id.values().first().cloned())
            }
            _ => None,
        })
        .collect()
}

pub(crate) fn dirty_properties(instance: &EntityRef, snapshot: &[StateValue]) -> Result<Vec<String>> {
    let current = disassemble(instance)?;
    let meta = instance.metadata();
    let mut dirty = Vec::new();
    for prop in meta.properties() {
        if prop.version {
            continue;
        }
        let (Some(now), Some(then)) = (current.get(prop.slot), snapshot.get(prop.slot)) else {
            continue;
        };
        let changed = match (&prop.kind, now, then) {
            (PropertyKind::Collection(_), ..) => false,
            (PropertyKind::Basic(b), StateValue::Basic(a), StateValue::Basic(c)) => !b.ty.is_equal(a, c),
            (_, a, c) => a != c,
        };
        if changed {
            dirty.push(prop.name.clone());
        }
    }
    Ok(dirty)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{auction_model, billing_model};
    use std::rc::Weak;
    use std::sync::Arc;

    fn user(model: &hibernia_core::Metamodel, id: i64) -> EntityRef {
        let u = EntityRef::with_id(Arc::clone(model.entity("User").unwrap()), Identifier::from(id));
        u.set("username", format!("user{}", id)).unwrap();
        u
    }

    fn loaded(ctx: &mut PersistenceContext, instance: &EntityRef) -> EntityKey {
        let key = instance.key().unwrap();
        ctx.register(key.clone(), instance, Some(disassemble(instance).unwrap()))
            .unwrap();
        key
    }

    #[test]
    fn one_instance_per_identity() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let a = user(&model, 1);
        let key = loaded(&mut ctx, &a);

        ctx.register(key.clone(), &a, None).unwrap();
        assert_eq!(ctx.len(), 1);
        assert!(EntityRef::ptr_eq(&ctx.resolve(&key).unwrap().unwrap(), &a));

        let b = user(&model, 1);
        match ctx.register(key.clone(), &b, None) {
            Err(Error::DuplicateIdentity { entity, id }) => {
                assert_eq!(entity, "User");
                assert_eq!(id, Identifier::from(1_i64));
            }
            other => std::panic::panic_any(format!("unexpected result: {other:?}")),
        }
        assert_eq!(ctx.key_of(&a), Some(key));
        assert_eq!(ctx.key_of(&b), None);
    }

    #[test]
    fn subclass_instances_share_the_root_identity() {
        let model = billing_model();
        let mut ctx = PersistenceContext::new();
        let card = EntityRef::with_id(Arc::clone(model.entity("CreditCard").unwrap()), Identifier::from(4_i64));
        loaded(&mut ctx, &card);
        let key = EntityKey::new("BillingDetails", Identifier::from(4_i64));
        assert!(matches!(ctx.lookup(&key).unwrap(), Lookup::Initialized(e) if EntityRef::ptr_eq(&e, &card)));
    }

    #[test]
    fn dirty_properties_compare_against_the_snapshot() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let bid = EntityRef::with_id(Arc::clone(model.entity("Bid").unwrap()), Identifier::from(9_i64));
        bid.set("amount", 10_i64).unwrap();
        let key = loaded(&mut ctx, &bid);
        assert!(ctx.compute_dirty_properties(&key).unwrap().is_empty());

        bid.set("amount", 10_i32).unwrap();
        assert!(ctx.compute_dirty_properties(&key).unwrap().is_empty());

        bid.set("amount", 11_i64).unwrap();
        let bidder = user(&model, 2);
        bid.set_reference("bidder", Some(&bidder)).unwrap();
        assert_eq!(ctx.compute_dirty_properties(&key).unwrap(), vec!["amount", "bidder"]);

        ctx.refresh_snapshot(&key).unwrap();
        assert!(ctx.compute_dirty_properties(&key).unwrap().is_empty());
    }

    #[test]
    fn pending_inserts_have_no_snapshot() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let u = user(&model, 3);
        let key = u.key().unwrap();
        let entry = ctx.register(key.clone(), &u, None).unwrap();
        assert!(entry.is_pending_insert());
        assert!(ctx.snapshot_for(&key).unwrap().is_none());
        assert!(ctx.compute_dirty_properties(&key).unwrap().is_empty());
    }

    #[test]
    fn remove_then_evict() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let u = user(&model, 1);
        let key = loaded(&mut ctx, &u);
        assert!(ctx.remove(&key).unwrap());
        assert_eq!(ctx.status_of(&key), Some(EntityStatus::Removed));
        assert!(ctx.resolve(&key).unwrap().is_some());
        assert!(ctx.contains(&key).unwrap());

        assert!(ctx.evict(&key).unwrap().is_some());
        assert!(!ctx.contains(&key).unwrap());
        assert!(matches!(ctx.lookup(&key).unwrap(), Lookup::Absent));
        assert!(!ctx.remove(&key).unwrap());
    }

    #[test]
    fn proxies_resolve_until_cleared() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let meta = model.entity("User").unwrap();
        let proxy = LazyRef::new(meta, Identifier::from(5_i64), Weak::new());
        ctx.register_proxy(proxy.clone()).unwrap();
        ctx.register_proxy(proxy.clone()).unwrap();

        let other = LazyRef::new(meta, Identifier::from(5_i64), Weak::new());
        assert!(matches!(ctx.register_proxy(other), Err(Error::DuplicateIdentity { .. })));
        assert!(matches!(ctx.lookup(proxy.key()).unwrap(), Lookup::Uninitialized(p) if LazyRef::ptr_eq(&p, &proxy)));

        ctx.clear().unwrap();
        assert!(matches!(ctx.lookup(proxy.key()).unwrap(), Lookup::Absent));
    }

    #[test]
    fn leaving_read_only_retakes_the_snapshot() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let u = user(&model, 1);
        let key = loaded(&mut ctx, &u);
        ctx.set_read_only(&key, true).unwrap();
        u.set("username", "changed").unwrap();
        ctx.set_read_only(&key, false).unwrap();
        assert!(ctx.compute_dirty_properties(&key).unwrap().is_empty());
    }

    #[test]
    fn natural_ids_follow_eviction() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let u = user(&model, 1);
        let key = loaded(&mut ctx, &u);
        ctx.cache_natural_id("User", vec!["user1".into()], Identifier::from(1_i64));
        assert_eq!(ctx.natural_id("User", &["user1".into()]), Some(&Identifier::from(1_i64)));
        ctx.evict(&key).unwrap();
        assert!(ctx.natural_id("User", &["user1".into()]).is_none());
    }

    #[test]
    fn closed_context_refuses_work() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        ctx.close();
        let u = user(&model, 1);
        assert!(matches!(ctx.register(u.key().unwrap(), &u, None), Err(Error::SessionClosed)));
        assert!(ctx.is_closed());
    }

    #[test]
    fn closed_context_reads_fail() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let u = user(&model, 1);
        let key = loaded(&mut ctx, &u);
        ctx.close();
        // closing twice is harmless
        ctx.close();

        assert!(matches!(ctx.resolve(&key), Err(Error::SessionClosed)));
        assert!(matches!(ctx.contains(&key), Err(Error::SessionClosed)));
        assert!(matches!(ctx.lookup(&key), Err(Error::SessionClosed)));
        assert!(matches!(ctx.snapshot_for(&key), Err(Error::SessionClosed)));
        assert!(matches!(ctx.evict(&key), Err(Error::SessionClosed)));
        assert!(matches!(ctx.refresh_snapshot(&key), Err(Error::SessionClosed)));
        assert!(matches!(ctx.mark_candidate(key.clone()), Err(Error::SessionClosed)));
        assert!(matches!(ctx.clear(), Err(Error::SessionClosed)));
    }
}
