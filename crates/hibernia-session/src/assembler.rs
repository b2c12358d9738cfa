//! Result-set assembly: rows to a managed object graph.
//!
//! The assembler walks every row along the load plan, resolving each entity
//! node against the persistence context before creating anything:
//!
//! 1. an identity already created from an earlier row is reused as is;
//! 2. an identity already managed by the session is reused, never
//!    overwritten with database state;
//! 3. anything else is instantiated as the subtype named by the row's
//!    discriminator, registered as `Loading`, and hydrated.
//!
//! Joined collections accumulate elements across rows and are marked
//! initialized when the result is finished. Select fetches are not run
//! here; they are returned to the session, which loads them with further
//! selects.

use crate::collection::PersistentCollection;
use crate::context::{
    EntityStatus, Lookup, PersistenceContext, disassemble, natural_id_of, version_of,
};
use crate::entity::{EntityRef, PropertyValue, Reference};
use crate::proxy::LazyRef;
use crate::session::SessionCore;
use hibernia_core::{
    CollectionKey, EntityKey, EntityMetadata, Error, Identifier, Metamodel, PropertyDescriptor,
    PropertyKind, Result, Row, Value,
};
use hibernia_loader::{CollectionReturn, EntityNode, Fetch, FetchMode, ResultMapping};
use std::collections::{HashMap, HashSet};
use std::rc::Weak;
use std::sync::Arc;

/// An association to be loaded by a further select once the result is done.
#[derive(Debug)]
pub(crate) enum SelectFetch {
    ToOne {
        owner: EntityKey,
        slot: usize,
        target: String,
        id: Identifier,
    },
    Collection {
        collection: PersistentCollection,
    },
}

#[derive(Debug, Clone, Default)]
pub(crate) struct AssemblyOptions {
    /// Load new instances read-only
    pub read_only: bool,
    /// Re-hydrate this managed identity from its row instead of reusing it
    pub refresh: Option<EntityKey>,
}

/// What one result set produced.
#[derive(Debug, Default)]
pub(crate) struct Assembled {
    /// Instances created (or refreshed) from rows, in row order
    pub created: Vec<EntityRef>,
    pub select_fetches: Vec<SelectFetch>,
}

struct JoinedCollection {
    key: CollectionKey,
    collection: PersistentCollection,
    elements: Vec<EntityRef>,
}

pub(crate) struct ResultAssembler<'a> {
    metamodel: &'a Metamodel,
    context: &'a mut PersistenceContext,
    session: Weak<SessionCore>,
    options: AssemblyOptions,
    created: Vec<EntityKey>,
    created_set: HashSet<EntityKey>,
    joined: Vec<JoinedCollection>,
    joined_index: HashMap<CollectionKey, usize>,
    select_fetches: Vec<SelectFetch>,
}

fn value_at(row: &Row, index: usize) -> Value {
    row.get(index).cloned().unwrap_or(Value::Null)
}

impl<'a> ResultAssembler<'a> {
    pub(crate) fn new(
        metamodel: &'a Metamodel,
        context: &'a mut PersistenceContext,
        session: Weak<SessionCore>,
        options: AssemblyOptions,
    ) -> Self {
        Self {
            metamodel,
            context,
            session,
            options,
            created: Vec::new(),
            created_set: HashSet::new(),
            joined: Vec::new(),
            joined_index: HashMap::new(),
            select_fetches: Vec::new(),
        }
    }

    /// Assemble the entity return of every row; distinct roots in row order.
    pub(crate) fn entity_rows(
        &mut self,
        root: &EntityNode,
        mapping: &ResultMapping,
        rows: &[Row],
    ) -> Result<Vec<EntityRef>> {
        let mut roots: Vec<EntityRef> = Vec::new();
        let mut seen = HashSet::new();
        for row in rows {
            if let Some(entity) = self.process_node(root, mapping, row)? {
                if let Some(key) = entity.key() {
                    if seen.insert(key) {
                        roots.push(entity);
                    }
                }
            }
        }
        Ok(roots)
    }

    /// Assemble collection elements; one (owner, element) pair per row.
    pub(crate) fn collection_rows(
        &mut self,
        collection: &CollectionReturn,
        mapping: &ResultMapping,
        rows: &[Row],
    ) -> Result<Vec<(Identifier, EntityRef)>> {
        let metamodel = self.metamodel;
        let owner_meta = metamodel.entity(&collection.owner)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let raw = mapping.owner_key().iter().map(|&i| value_at(row, i)).collect();
            let Some(owner) = Identifier::from_values(raw) else {
                continue;
            };
            let owner = owner_meta.identifier().coerce(owner_meta.name(), owner)?;
            if let Some(element) = self.process_node(&collection.element, mapping, row)? {
                out.push((owner, element));
            }
        }
        Ok(out)
    }

    fn process_node(
        &mut self,
        node: &EntityNode,
        mapping: &ResultMapping,
        row: &Row,
    ) -> Result<Option<EntityRef>> {
        let columns = mapping.node(node.id).ok_or_else(|| {
            Error::Custom(format!("result has no columns for {} ({})", node.path, node.alias))
        })?;
        let raw = columns.id.iter().map(|&i| value_at(row, i)).collect();
        let Some(id) = Identifier::from_values(raw) else {
            return Ok(None);
        };
        let metamodel = self.metamodel;
        let declared = metamodel.entity(&node.entity)?;
        let id = declared.identifier().coerce(declared.name(), id)?;
        let key = declared.key(id.clone());

        let (instance, populate) = if self.created_set.contains(&key) {
            (self.managed(&key)?, false)
        } else if self.options.refresh.as_ref() == Some(&key) {
            let instance = self.managed(&key)?;
            if let Some(entry) = self.context.entry_mut(&key) {
                entry.status = EntityStatus::Loading;
            }
            self.created.push(key.clone());
            self.created_set.insert(key.clone());
            (instance, true)
        } else if let Some(existing) = self.context.resolve(&key)? {
            (existing, false)
        } else {
            let concrete = match columns.discriminator {
                Some(pos) => metamodel.resolve_subtype(declared, &value_at(row, pos))?,
                None => Arc::clone(declared),
            };
            let instance = EntityRef::with_id(concrete, id.clone());
            instance.mark_persisted();
            let entry = self.context.register(key.clone(), &instance, None)?;
            entry.status = EntityStatus::Loading;
            entry.exists_in_db = true;
            entry.read_only = self.options.read_only;
            self.created.push(key.clone());
            self.created_set.insert(key.clone());
            (instance, true)
        };

        if populate {
            self.hydrate(node, mapping, row, &instance, &key)?;
        }
        self.walk_joined(node, mapping, row, &instance, populate)?;
        Ok(Some(instance))
    }

    fn managed(&self, key: &EntityKey) -> Result<EntityRef> {
        self.context
            .resolve(key)?
            .ok_or_else(|| Error::Custom(format!("{} left the persistence context during assembly", key)))
    }

    fn hydrate(
        &mut self,
        node: &EntityNode,
        mapping: &ResultMapping,
        row: &Row,
        instance: &EntityRef,
        key: &EntityKey,
    ) -> Result<()> {
        let columns = mapping
            .node(node.id)
            .ok_or_else(|| Error::Custom(format!("result has no columns for {}", node.path)))?;
        let metamodel = self.metamodel;
        let meta = instance.metadata();
        let mut values = Vec::with_capacity(meta.property_count());
        for prop in meta.properties() {
            let value = match &prop.kind {
                PropertyKind::Basic(basic) => {
                    let raw = columns
                        .property(&prop.name)
                        .and_then(|positions| positions.first())
                        .map_or(Value::Null, |&i| value_at(row, i));
                    let value = basic.ty.coerce(raw).map_err(|mut e| {
                        e.entity = Some(meta.name().to_string());
                        e.property = Some(prop.name.clone());
                        Error::TypeMismatch(e)
                    })?;
                    PropertyValue::Basic(value)
                }
                PropertyKind::ToOne(to_one) => {
                    let raw: Vec<Value> = columns
                        .property(&prop.name)
                        .map(|positions| positions.iter().map(|&i| value_at(row, i)).collect())
                        .unwrap_or_default();
                    let reference = match Identifier::from_values(raw) {
                        None => None,
                        Some(target_id) => {
                            let target = metamodel.entity(&to_one.target)?;
                            let target_id = target.identifier().coerce(target.name(), target_id)?;
                            self.resolve_to_one(node, mapping, row, &meta, key, prop, target, target_id)?
                        }
                    };
                    PropertyValue::Reference(reference)
                }
                PropertyKind::Collection(coll) => {
                    let collection =
                        PersistentCollection::uninitialized(&coll.role, key.id.clone(), self.session.clone());
                    self.context.register_collection(&collection, key.clone(), None)?;
                    PropertyValue::Collection(collection)
                }
            };
            values.push(value);
        }
        for (slot, value) in values.into_iter().enumerate() {
            instance.set_slot(slot, value)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn resolve_to_one(
        &mut self,
        node: &EntityNode,
        mapping: &ResultMapping,
        row: &Row,
        owner: &EntityMetadata,
        owner_key: &EntityKey,
        prop: &PropertyDescriptor,
        target: &Arc<EntityMetadata>,
        target_id: Identifier,
    ) -> Result<Option<Reference>> {
        let eager = match node.fetch(&prop.name) {
            Some(Fetch::Entity(fetch)) if fetch.mode == FetchMode::Join => {
                if let Some(child) = &fetch.node {
                    if let Some(entity) = self.process_node(child, mapping, row)? {
                        return Ok(Some(Reference::Entity(entity)));
                    }
                }
                true
            }
            Some(Fetch::Entity(fetch)) => fetch.mode == FetchMode::Select,
            _ => false,
        };

        let target_key = target.key(target_id.clone());
        let fetch_later = || SelectFetch::ToOne {
            owner: owner_key.clone(),
            slot: prop.slot,
            target: target.name().to_string(),
            id: target_id.clone(),
        };
        match self.context.lookup(&target_key)? {
            Lookup::Initialized(entity) => Ok(Some(Reference::Entity(entity))),
            Lookup::Uninitialized(proxy) => {
                if eager {
                    self.select_fetches.push(fetch_later());
                }
                Ok(Some(Reference::Proxy(proxy)))
            }
            Lookup::Absent if target.is_proxyable() => {
                let proxy = LazyRef::new(target, target_id.clone(), self.session.clone());
                proxy.set_origin(owner.name(), &prop.name);
                if self.options.read_only {
                    proxy.set_read_only(true);
                }
                self.context.register_proxy(proxy.clone())?;
                if eager {
                    self.select_fetches.push(fetch_later());
                }
                Ok(Some(Reference::Proxy(proxy)))
            }
            Lookup::Absent => {
                self.select_fetches.push(fetch_later());
                Ok(None)
            }
        }
    }

    fn walk_joined(
        &mut self,
        node: &EntityNode,
        mapping: &ResultMapping,
        row: &Row,
        instance: &EntityRef,
        populate: bool,
    ) -> Result<()> {
        for fetch in &node.fetches {
            match fetch {
                Fetch::Entity(f) if !populate && f.mode == FetchMode::Join => {
                    if let Some(child) = &f.node {
                        self.process_node(child, mapping, row)?;
                    }
                }
                Fetch::Collection(f) => {
                    // subtype-only collections of other subtypes
                    let Ok(collection) = instance.collection(&f.property) else {
                        continue;
                    };
                    match (f.mode, &f.node) {
                        (FetchMode::Join, Some(child)) => {
                            let Some(key) = collection.key() else {
                                continue;
                            };
                            let index = match self.joined_index.get(&key) {
                                Some(&index) => index,
                                None if collection.is_initialized() => continue,
                                None => {
                                    self.joined.push(JoinedCollection {
                                        key: key.clone(),
                                        collection: collection.clone(),
                                        elements: Vec::new(),
                                    });
                                    self.joined_index.insert(key, self.joined.len() - 1);
                                    self.joined.len() - 1
                                }
                            };
                            if let Some(element) = self.process_node(child, mapping, row)? {
                                let elements = &mut self.joined[index].elements;
                                if !elements.iter().any(|e| EntityRef::ptr_eq(e, &element)) {
                                    elements.push(element);
                                }
                            }
                        }
                        (FetchMode::Select, _) if populate => {
                            self.select_fetches.push(SelectFetch::Collection { collection });
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Initialize joined collections, snapshot every created instance and
    /// mark it managed.
    pub(crate) fn finish(mut self) -> Result<Assembled> {
        for joined in std::mem::take(&mut self.joined) {
            joined.collection.set_elements(joined.elements);
            self.context.refresh_collection_snapshot(&joined.key);
        }

        let mut created = Vec::with_capacity(self.created.len());
        for key in &self.created {
            let Some(entry) = self.context.entry_mut(key) else {
                continue;
            };
            entry.loaded_state = Some(disassemble(&entry.instance)?);
            entry.version = version_of(&entry.instance);
            entry.status = EntityStatus::Managed;
            entry.exists_in_db = true;
            entry.instance.clear_modified();
            let instance = entry.instance.clone();
            if let Some(proxy) = self.context.proxy_for(key) {
                proxy.complete(&instance);
            }
            if let Some(values) = natural_id_of(&instance) {
                self.context.cache_natural_id(&key.entity, values, key.id.clone());
            }
            created.push(instance);
        }

        tracing::debug!(
            entities = created.len(),
            select_fetches = self.select_fetches.len(),
            "Assembled result"
        );
        Ok(Assembled {
            created,
            select_fetches: self.select_fetches,
        })
    }

    /// Undo a failed assembly: nothing created from this result stays managed.
    pub(crate) fn abort(mut self) {
        for key in &self.created {
            if self.options.refresh.as_ref() == Some(key) {
                if let Some(entry) = self.context.entry_mut(key) {
                    entry.status = EntityStatus::Managed;
                }
                continue;
            }
            // a closed context has nothing left to undo
            if self.context.evict(key).is_err() {
                break;
            }
        }
        tracing::debug!(evicted = self.created.len(), "Discarded partially assembled result");
    }
}
