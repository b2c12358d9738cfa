//! The session: unit of work and identity scope.
//!
//! A [`Session`] owns one persistence context, at most one connection and
//! one transaction. Everything it hands out (instances, proxies, lazy
//! collections) belongs to it; proxies and collections keep a weak handle
//! so they can load themselves later, and fail lazily once the session is
//! closed, cleared or dropped.
//!
//! Sessions are confined to one thread: the shared core is held by an
//! `Rc`, so `Session` is `!Send`. Internal state lives in a `RefCell`; a
//! callback that re-enters the session while it is busy gets
//! [`Error::ReentrantAccess`] instead of a panic. No user code (event
//! callbacks, lazy loads triggered by cascades) runs while that cell is
//! borrowed.
//!
//! # Example
//!
//! ```ignore
//! let session = factory.open_session();
//! session.begin_transaction()?;
//!
//! let invoice = session.find("Invoice", 1)?.expect("seeded");
//! invoice.set("number", "INV-1b")?;
//! for line in invoice.collection("lines")?.elements()? {
//!     line.set("amount", "13.00")?;
//! }
//!
//! session.commit()?;   // flushes two updates, then commits
//! ```

use crate::assembler::{AssemblyOptions, ResultAssembler, SelectFetch};
use crate::cascade::{CascadeAction, cascade_targets};
use crate::collection::PersistentCollection;
use crate::context::{
    EntityEntry, EntityStatus, Lookup, PersistenceContext, StateValue, disassemble, natural_id_of,
    version_of,
};
use crate::entity::{EntityRef, PropertyValue, Reference};
use crate::events::{SessionEvent, SessionEventCallbacks};
use crate::factory::FactoryInner;
use crate::flush::{FlushResult, plan_flush};
use crate::persister;
use crate::proxy::LazyRef;
use crate::query::{NativeQuery, Query};
use crate::statistics::{LazyLoadTracker, SessionStatistics};
use crate::transaction::{CacheAction, TransactionCoordinator, TransactionStatus};
use hibernia_core::{
    CachedValue, CacheEntry, ColumnInfo, ColumnRef, Connection, ConnectionProvider, EntityKey,
    EntityMetadata, Error, IdGenerator, Identifier, Metamodel, PropertyKind, QueryError,
    QueryErrorKind, Result, Row, SelectStatement, Settings, Statement, TableRef, Value,
};
use hibernia_loader::{
    CollectionReturn, EntityNode, FetchProfile, LoadPlan, LoadPlanBuilder, Restriction,
    ResultMapping, render_select,
};
use std::cell::{RefCell, RefMut};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Session core
// ============================================================================

pub(crate) struct SessionState {
    open: bool,
    context: PersistenceContext,
    connection: Option<Box<dyn Connection>>,
    transaction: TransactionCoordinator,
    stats: SessionStatistics,
    tracker: LazyLoadTracker,
    events: SessionEventCallbacks,
}

/// Shared by a [`Session`] and, weakly, by everything it hands out.
pub(crate) struct SessionCore {
    factory: Arc<FactoryInner>,
    state: RefCell<SessionState>,
    this: Weak<SessionCore>,
}

impl fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.state.try_borrow() {
            Ok(state) => f
                .debug_struct("SessionCore")
                .field("open", &state.open)
                .field("managed", &state.context.len())
                .field("transaction", &state.transaction.status())
                .finish(),
            Err(_) => f.write_str("SessionCore { <busy> }"),
        }
    }
}

/// The session's connection, connecting on first use.
fn connection<'a>(
    slot: &'a mut Option<Box<dyn Connection>>,
    provider: &dyn ConnectionProvider,
) -> Result<&'a mut (dyn Connection + 'static)> {
    if slot.is_none() {
        *slot = Some(provider.connect()?);
        tracing::debug!("Connection acquired");
    }
    slot.as_deref_mut()
        .ok_or_else(|| Error::Custom("connection unavailable".to_string()))
}

fn collections_of(entity: &EntityRef) -> Result<Vec<PersistentCollection>> {
    Ok(entity
        .data()?
        .values
        .iter()
        .filter_map(|value| match value {
            PropertyValue::Collection(c) => Some(c.clone()),
            _ => None,
        })
        .collect())
}

fn not_managed(entity: &EntityRef) -> Error {
    Error::Custom(format!("{:?} is not managed by this session", entity))
}

fn no_entity_return() -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::Unsupported,
        "load plan has no entity return",
    ))
}

/// `instance` if it is an instance of `meta` or one of its subtypes.
fn conforming(meta: &EntityMetadata, instance: EntityRef) -> Option<EntityRef> {
    meta.is_same_or_supertype_of(&instance.entity_name())
        .then_some(instance)
}

impl SessionCore {
    fn new(factory: Arc<FactoryInner>) -> Rc<Self> {
        let settings = &factory.settings;
        let state = SessionState {
            open: true,
            context: PersistenceContext::new(),
            connection: None,
            transaction: TransactionCoordinator::new(settings.transaction_timeout),
            stats: SessionStatistics::default(),
            tracker: LazyLoadTracker::new(settings.n1_warn_threshold),
            events: SessionEventCallbacks::default(),
        };
        Rc::new_cyclic(|this| SessionCore {
            factory,
            state: RefCell::new(state),
            this: this.clone(),
        })
    }

    fn state(&self) -> Result<RefMut<'_, SessionState>> {
        self.state
            .try_borrow_mut()
            .map_err(|_| Error::ReentrantAccess("session"))
    }

    fn open_state(&self) -> Result<RefMut<'_, SessionState>> {
        let state = self.state()?;
        if !state.open {
            return Err(Error::SessionClosed);
        }
        Ok(state)
    }

    fn metamodel(&self) -> &Metamodel {
        &self.factory.metamodel
    }

    fn settings(&self) -> &Settings {
        &self.factory.settings
    }

    fn entity_meta(&self, name: &str) -> Result<Arc<EntityMetadata>> {
        self.metamodel().entity(name).map(Arc::clone)
    }

    fn plan_builder(&self) -> LoadPlanBuilder<'_> {
        LoadPlanBuilder::new(self.metamodel(), self.settings().max_fetch_depth)
    }

    fn managed_key(&self, entity: &EntityRef) -> Result<EntityKey> {
        self.open_state()?
            .context
            .key_of(entity)
            .ok_or_else(|| not_managed(entity))
    }

    // ------------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------------

    fn query_rows(&self, statement: &Statement) -> Result<Vec<Row>> {
        let mut guard = self.open_state()?;
        let state = &mut *guard;
        state.stats.statements += 1;
        tracing::debug!(sql = %statement, params = ?statement.params(), "Executing query");
        let conn = connection(&mut state.connection, self.factory.provider.as_ref())?;
        conn.query_all(statement)
    }

    fn fire(&self, event: SessionEvent) -> Result<()> {
        let mut callbacks = {
            let mut state = self.state()?;
            if state.events.count(event) == 0 {
                return Ok(());
            }
            std::mem::take(&mut state.events)
        };
        let result = callbacks.fire(event);
        let mut state = self.state()?;
        let registered_meanwhile = std::mem::replace(&mut state.events, callbacks);
        state.events.absorb(registered_meanwhile);
        result
    }

    // ------------------------------------------------------------------------
    // Assembly
    // ------------------------------------------------------------------------

    fn assemble_entities(
        &self,
        root: &EntityNode,
        mapping: &ResultMapping,
        rows: &[Row],
        options: AssemblyOptions,
    ) -> Result<Vec<EntityRef>> {
        let (roots, assembled) = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            let mut assembler =
                ResultAssembler::new(self.metamodel(), &mut state.context, self.this.clone(), options);
            let roots = match assembler.entity_rows(root, mapping, rows) {
                Ok(roots) => roots,
                Err(e) => {
                    assembler.abort();
                    return Err(e);
                }
            };
            let assembled = assembler.finish()?;
            state.stats.entity_loads += assembled.created.len() as u64;
            (roots, assembled)
        };
        self.cache_loaded(&assembled.created)?;
        self.run_select_fetches(assembled.select_fetches)?;
        Ok(roots)
    }

    fn assemble_collection(
        &self,
        collection: &CollectionReturn,
        mapping: &ResultMapping,
        rows: &[Row],
    ) -> Result<Vec<(Identifier, EntityRef)>> {
        let (pairs, assembled) = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            let mut assembler = ResultAssembler::new(
                self.metamodel(),
                &mut state.context,
                self.this.clone(),
                AssemblyOptions {
                    read_only: self.settings().default_read_only,
                    refresh: None,
                },
            );
            let pairs = match assembler.collection_rows(collection, mapping, rows) {
                Ok(pairs) => pairs,
                Err(e) => {
                    assembler.abort();
                    return Err(e);
                }
            };
            let assembled = assembler.finish()?;
            state.stats.entity_loads += assembled.created.len() as u64;
            (pairs, assembled)
        };
        self.cache_loaded(&assembled.created)?;
        self.run_select_fetches(assembled.select_fetches)?;
        Ok(pairs)
    }

    /// Put freshly loaded cacheable instances into the second-level cache.
    fn cache_loaded(&self, created: &[EntityRef]) -> Result<()> {
        let Some(cache) = self.factory.region_cache() else {
            return Ok(());
        };
        let mut puts = 0;
        for instance in created {
            let meta = instance.metadata();
            if !meta.is_cacheable() {
                continue;
            }
            let Some(id) = instance.id() else {
                continue;
            };
            let entry = persister::cache_entry(&*instance.data()?, version_of(instance));
            cache.put(meta.root_name(), id, entry);
            puts += 1;
        }
        if puts > 0 {
            self.state()?.stats.cache_puts += puts;
        }
        Ok(())
    }

    fn run_select_fetches(&self, fetches: Vec<SelectFetch>) -> Result<()> {
        if fetches.is_empty() {
            return Ok(());
        }
        let mut to_one: BTreeMap<String, Vec<(EntityKey, usize, Identifier)>> = BTreeMap::new();
        let mut collections: BTreeMap<String, Vec<PersistentCollection>> = BTreeMap::new();
        for fetch in fetches {
            match fetch {
                SelectFetch::ToOne {
                    owner,
                    slot,
                    target,
                    id,
                } => to_one.entry(target).or_default().push((owner, slot, id)),
                SelectFetch::Collection { collection } => collections
                    .entry(collection.role().to_string())
                    .or_default()
                    .push(collection),
            }
        }

        for (target, links) in to_one {
            let meta = self.entity_meta(&target)?;
            let mut ids: Vec<Identifier> = Vec::new();
            for (_, _, id) in &links {
                if !ids.contains(id) {
                    ids.push(id.clone());
                }
            }
            self.load_batch(&meta, ids)?;

            let mut state = self.open_state()?;
            for (owner, slot, id) in links {
                let target_key = meta.key(id);
                let (Some(instance), Some(owner_instance)) =
                    (state.context.resolve(&target_key)?, state.context.resolve(&owner)?)
                else {
                    continue;
                };
                owner_instance.set_slot(slot, PropertyValue::Reference(Some(Reference::Entity(instance))))?;
                state
                    .context
                    .patch_snapshot(&owner, slot, StateValue::Reference(Some(target_key)));
            }
        }

        for (role, collections) in collections {
            self.load_collections(&role, &collections)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------------

    /// Context, then second-level cache, then database.
    fn load(&self, meta: &Arc<EntityMetadata>, id: Identifier, read_only: bool) -> Result<Option<EntityRef>> {
        let key = meta.key(id.clone());
        {
            let state = self.open_state()?;
            if let Lookup::Initialized(instance) = state.context.lookup(&key)? {
                if state.context.status_of(&key) == Some(EntityStatus::Removed) {
                    return Ok(None);
                }
                return Ok(conforming(meta, instance));
            }
        }

        if let Some(instance) = self.load_from_cache(meta, &id, read_only)? {
            return Ok(conforming(meta, instance));
        }

        let plan = self.plan_builder().entity_plan(meta.name())?;
        let (select, mapping) = render_select(self.metamodel(), &plan, &[Restriction::Id(id)])?;
        let rows = self.query_rows(&Statement::Select(select))?;
        let root = plan.entity_return().ok_or_else(no_entity_return)?;
        let roots = self.assemble_entities(
            root,
            &mapping,
            &rows,
            AssemblyOptions {
                read_only,
                refresh: None,
            },
        )?;
        Ok(roots.into_iter().next().and_then(|i| conforming(meta, i)))
    }

    /// Load every identity of `ids` not yet managed, in one select.
    fn load_batch(&self, meta: &Arc<EntityMetadata>, ids: Vec<Identifier>) -> Result<()> {
        let read_only = self.settings().default_read_only;
        let mut missing = Vec::new();
        for id in ids {
            let managed = {
                let state = self.open_state()?;
                matches!(state.context.lookup(&meta.key(id.clone()))?, Lookup::Initialized(_))
            };
            if !managed && self.load_from_cache(meta, &id, read_only)?.is_none() {
                missing.push(id);
            }
        }
        if missing.is_empty() {
            return Ok(());
        }

        let restriction = if missing.len() == 1 {
            Restriction::Id(missing.remove(0))
        } else {
            Restriction::Ids(missing)
        };
        let plan = self.plan_builder().entity_plan(meta.name())?;
        let (select, mapping) = render_select(self.metamodel(), &plan, &[restriction])?;
        let rows = self.query_rows(&Statement::Select(select))?;
        self.state()?.stats.fetches += 1;
        let root = plan.entity_return().ok_or_else(no_entity_return)?;
        self.assemble_entities(
            root,
            &mapping,
            &rows,
            AssemblyOptions {
                read_only,
                refresh: None,
            },
        )?;
        Ok(())
    }

    fn load_from_cache(
        &self,
        meta: &Arc<EntityMetadata>,
        id: &Identifier,
        read_only: bool,
    ) -> Result<Option<EntityRef>> {
        let Some(cache) = self.factory.region_cache() else {
            return Ok(None);
        };
        if !meta.is_cacheable() {
            return Ok(None);
        }
        let Some(cached) = cache.get(meta.root_name(), id) else {
            self.state()?.stats.cache_misses += 1;
            tracing::trace!(entity = meta.name(), id = %id, "Second-level cache miss");
            return Ok(None);
        };
        let concrete = self.entity_meta(&cached.entity)?;
        if !meta.is_same_or_supertype_of(concrete.name()) {
            return Ok(None);
        }
        self.state()?.stats.cache_hits += 1;
        tracing::trace!(entity = meta.name(), id = %id, "Second-level cache hit");
        self.assemble_cached(&concrete, id.clone(), cached, read_only)
            .map(Some)
    }

    /// Build a managed instance from disassembled cache state.
    fn assemble_cached(
        &self,
        concrete: &Arc<EntityMetadata>,
        id: Identifier,
        cached: CacheEntry,
        read_only: bool,
    ) -> Result<EntityRef> {
        let key = concrete.key(id.clone());
        let instance = EntityRef::with_id(Arc::clone(concrete), id.clone());
        instance.mark_persisted();
        let mut unresolved = Vec::new();
        {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            let mut values = Vec::with_capacity(concrete.property_count());
            for (prop, value) in concrete.properties().iter().zip(cached.state) {
                let value = match (&prop.kind, value) {
                    (PropertyKind::Collection(coll), _) => {
                        let collection =
                            PersistentCollection::uninitialized(&coll.role, id.clone(), self.this.clone());
                        state.context.register_collection(&collection, key.clone(), None)?;
                        PropertyValue::Collection(collection)
                    }
                    (_, CachedValue::Basic(v)) => PropertyValue::Basic(v),
                    (PropertyKind::ToOne(to_one), CachedValue::Reference(Some(target_id))) => {
                        let target = self.metamodel().entity(&to_one.target)?;
                        let reference = match state.context.lookup(&target.key(target_id.clone()))? {
                            Lookup::Initialized(e) => Some(Reference::Entity(e)),
                            Lookup::Uninitialized(p) => Some(Reference::Proxy(p)),
                            Lookup::Absent if target.is_proxyable() => {
                                let proxy = LazyRef::new(target, target_id, self.this.clone());
                                proxy.set_origin(concrete.name(), &prop.name);
                                proxy.set_read_only(read_only);
                                state.context.register_proxy(proxy.clone())?;
                                Some(Reference::Proxy(proxy))
                            }
                            Lookup::Absent => {
                                unresolved.push((prop.slot, Arc::clone(target), target_id));
                                None
                            }
                        };
                        PropertyValue::Reference(reference)
                    }
                    _ => PropertyValue::Reference(None),
                };
                values.push(value);
            }
            for (slot, value) in values.into_iter().enumerate() {
                instance.set_slot(slot, value)?;
            }

            let snapshot = disassemble(&instance)?;
            let entry = state.context.register(key.clone(), &instance, Some(snapshot))?;
            entry.read_only = read_only;
            if let Some(proxy) = state.context.proxy_for(&key) {
                proxy.complete(&instance);
            }
            if let Some(values) = natural_id_of(&instance) {
                state.context.cache_natural_id(&key.entity, values, id);
            }
            state.stats.entity_loads += 1;
        }

        for (slot, target, target_id) in unresolved {
            if let Some(loaded) = self.load(&target, target_id, read_only)? {
                let target_key = loaded.key();
                instance.set_slot(slot, PropertyValue::Reference(Some(Reference::Entity(loaded))))?;
                self.open_state()?
                    .context
                    .patch_snapshot(&key, slot, StateValue::Reference(target_key));
            }
        }
        Ok(instance)
    }

    /// Elements of collection `role` for each owner, one select for all.
    fn fetch_collection_elements(
        &self,
        role: &str,
        owners: &[Identifier],
    ) -> Result<HashMap<Identifier, Vec<EntityRef>>> {
        let plan = self.plan_builder().collection_plan(role)?;
        let collection = plan.collection_return().ok_or_else(no_entity_return)?;
        let restriction = match owners {
            [owner] => Restriction::Owner(owner.clone()),
            _ => Restriction::Owners(owners.to_vec()),
        };
        let (select, mapping) = render_select(self.metamodel(), &plan, &[restriction])?;
        let rows = self.query_rows(&Statement::Select(select))?;
        let pairs = self.assemble_collection(collection, &mapping, &rows)?;

        let mut out: HashMap<Identifier, Vec<EntityRef>> = HashMap::new();
        for (owner, element) in pairs {
            let elements = out.entry(owner).or_default();
            if !elements.iter().any(|e| EntityRef::ptr_eq(e, &element)) {
                elements.push(element);
            }
        }
        Ok(out)
    }

    /// Initialize uninitialized collections of one role together.
    fn load_collections(&self, role: &str, collections: &[PersistentCollection]) -> Result<()> {
        let owners: Vec<Identifier> = collections
            .iter()
            .filter(|c| !c.is_initialized())
            .filter_map(PersistentCollection::owner)
            .collect();
        if owners.is_empty() {
            return Ok(());
        }
        self.state()?.stats.fetches += 1;
        let mut loaded = self.fetch_collection_elements(role, &owners)?;

        let mut state = self.open_state()?;
        for collection in collections {
            if collection.is_initialized() {
                continue;
            }
            let Some(owner) = collection.owner() else {
                continue;
            };
            collection.set_elements(loaded.remove(&owner).unwrap_or_default());
            if let Some(key) = collection.key() {
                state.context.refresh_collection_snapshot(&key);
            }
        }
        Ok(())
    }

    /// Load the target of an uninitialized proxy.
    #[track_caller]
    pub(crate) fn load_proxy_target(&self, proxy: &LazyRef) -> Result<EntityRef> {
        let meta = self.entity_meta(proxy.entity_name())?;
        let id = proxy.identifier().clone();
        {
            let mut state = self.state()?;
            if !state.open {
                return Err(Error::lazy(meta.name(), Some(id), "session is closed"));
            }
            if let Some((owner, property)) = proxy.origin() {
                state.tracker.record(&owner, &property);
            }
            state.stats.proxy_initializations += 1;
            state.stats.fetches += 1;
        }
        tracing::debug!(key = %proxy.key(), "Initializing proxy");
        self.load(&meta, id.clone(), proxy.is_read_only())?
            .ok_or_else(|| Error::EntityNotFound {
                entity: meta.name().to_string(),
                id,
            })
    }

    /// Load the elements of an uninitialized collection.
    #[track_caller]
    pub(crate) fn load_collection(&self, collection: &PersistentCollection) -> Result<Vec<EntityRef>> {
        let (owner_meta, _) = self.metamodel().collection(collection.role())?;
        let owner_meta = Arc::clone(owner_meta);
        let lazy_error = |id: Option<Identifier>, reason: &str| Error::LazyInitialization {
            entity: owner_meta.name().to_string(),
            id,
            property: Some(collection.property().to_string()),
            reason: reason.to_string(),
        };
        let Some(owner) = collection.owner() else {
            return Err(lazy_error(None, "collection has no owner"));
        };
        {
            let mut state = self.state()?;
            if !state.open {
                return Err(lazy_error(Some(owner), "session is closed"));
            }
            state.tracker.record(owner_meta.name(), collection.property());
            state.stats.collection_initializations += 1;
            state.stats.fetches += 1;
        }
        tracing::debug!(role = collection.role(), owner = %owner, "Initializing collection");

        let mut loaded = self.fetch_collection_elements(collection.role(), std::slice::from_ref(&owner))?;
        let elements = loaded.remove(&owner).unwrap_or_default();
        let snapshot = elements.iter().filter_map(EntityRef::key).collect();
        self.open_state()?.context.register_collection(
            collection,
            owner_meta.key(owner),
            Some(snapshot),
        )?;
        Ok(elements)
    }

    fn reference_for(&self, meta: &Arc<EntityMetadata>, id: Identifier) -> Result<Reference> {
        let key = meta.key(id.clone());
        {
            let mut state = self.open_state()?;
            match state.context.lookup(&key)? {
                Lookup::Initialized(e) => return Ok(Reference::Entity(e)),
                Lookup::Uninitialized(p) => return Ok(Reference::Proxy(p)),
                Lookup::Absent if meta.is_proxyable() => {
                    let proxy = LazyRef::new(meta, id, self.this.clone());
                    proxy.set_read_only(self.settings().default_read_only);
                    state.context.register_proxy(proxy.clone())?;
                    return Ok(Reference::Proxy(proxy));
                }
                Lookup::Absent => {}
            }
        }
        self.load(meta, id.clone(), self.settings().default_read_only)?
            .map(Reference::Entity)
            .ok_or_else(|| Error::EntityNotFound {
                entity: meta.name().to_string(),
                id,
            })
    }

    // ------------------------------------------------------------------------
    // Persist / remove / merge
    // ------------------------------------------------------------------------

    fn persist(&self, entity: &EntityRef, revive: bool) -> Result<()> {
        let mut pending = VecDeque::from([entity.clone()]);
        while let Some(next) = pending.pop_front() {
            if self.persist_one(&next, revive)? {
                pending.extend(cascade_targets(&next, CascadeAction::Persist, false)?);
            }
        }
        Ok(())
    }

    /// Register one instance as a pending insert. Returns whether anything
    /// changed, i.e. whether persist should cascade further.
    fn persist_one(&self, entity: &EntityRef, revive: bool) -> Result<bool> {
        let meta = entity.metadata();
        if entity.id().is_none() {
            match meta.identifier().generator {
                IdGenerator::Assigned => {
                    return Err(Error::Custom(format!(
                        "identifier of {} must be assigned before persist",
                        meta.name()
                    )));
                }
                IdGenerator::Increment => entity.set_id(self.generate_id(&meta)?)?,
            }
        }
        let key = entity.key().ok_or_else(|| not_managed(entity))?;

        let mut guard = self.open_state()?;
        let state = &mut *guard;
        if state.context.key_of(entity).is_some() {
            return match state.context.entry_mut(&key) {
                Some(entry) if entry.status == EntityStatus::Removed && revive => {
                    entry.status = EntityStatus::Managed;
                    Ok(true)
                }
                _ => Ok(false),
            };
        }

        state.context.register(key.clone(), entity, None)?;
        for collection in collections_of(entity)? {
            collection.bind(self.this.clone(), key.id.clone());
            state.context.register_collection(&collection, key.clone(), None)?;
        }
        tracing::debug!(key = %key, "Scheduled insert");
        Ok(true)
    }

    fn generate_id(&self, meta: &EntityMetadata) -> Result<Identifier> {
        let identifier = meta.identifier();
        if identifier.is_composite() {
            return Err(Error::mapping(
                meta.name(),
                "increment generation requires a single-column identifier",
            ));
        }
        let root = self.entity_meta(meta.root_name())?;
        let next = self
            .factory
            .next_increment(root.name(), || self.max_identifier(&root))?;
        identifier.coerce(meta.name(), Identifier::Simple(Value::BigInt(next)))
    }

    fn max_identifier(&self, root: &EntityMetadata) -> Result<i64> {
        let column = root
            .identifier()
            .columns
            .first()
            .ok_or_else(|| Error::mapping(root.name(), "identifier has no column"))?;
        let mut select = SelectStatement::new(TableRef::new(root.table(), "t0"));
        select.push_column(ColumnRef::new("t0", column));
        let rows = self.query_rows(&Statement::Select(select))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.get(0).and_then(Value::as_i64))
            .max()
            .unwrap_or(0))
    }

    fn status(&self, entity: &EntityRef) -> Result<EntityStatus> {
        let state = self.open_state()?;
        Ok(match state.context.key_of(entity) {
            Some(key) => state
                .context
                .status_of(&key)
                .unwrap_or(EntityStatus::Detached),
            None if entity.id().is_some() => EntityStatus::Detached,
            None => EntityStatus::Transient,
        })
    }

    fn remove(&self, entity: &EntityRef) -> Result<()> {
        if self.status(entity)? == EntityStatus::Detached {
            return Err(Error::Custom(format!(
                "cannot remove detached instance {:?}",
                entity
            )));
        }
        let mut pending = VecDeque::from([entity.clone()]);
        while let Some(next) = pending.pop_front() {
            if self.status(&next)? != EntityStatus::Managed {
                continue;
            }
            let targets = cascade_targets(&next, CascadeAction::Remove, true)?;
            self.mark_removed(&next)?;
            pending.extend(targets);
        }
        Ok(())
    }

    fn mark_removed(&self, entity: &EntityRef) -> Result<()> {
        let mut state = self.open_state()?;
        let key = state.context.key_of(entity).ok_or_else(|| not_managed(entity))?;
        if state.context.entry(&key).is_some_and(EntityEntry::is_pending_insert) {
            state.context.evict(&key)?;
            tracing::debug!(key = %key, "Removed before insert; evicted");
        } else {
            state.context.remove(&key)?;
            tracing::debug!(key = %key, "Scheduled delete");
        }
        Ok(())
    }

    fn merge(&self, source: &EntityRef, seen: &mut Vec<(EntityRef, EntityRef)>) -> Result<EntityRef> {
        if let Some((_, target)) = seen.iter().find(|(s, _)| EntityRef::ptr_eq(s, source)) {
            return Ok(target.clone());
        }
        if self.open_state()?.context.key_of(source).is_some() {
            seen.push((source.clone(), source.clone()));
            for target in cascade_targets(source, CascadeAction::Merge, false)? {
                self.merge(&target, seen)?;
            }
            return Ok(source.clone());
        }

        let meta = source.metadata();
        let existing = match source.id() {
            Some(id) => self.load(&meta, id, false)?,
            None => None,
        };
        let target = match &existing {
            Some(managed) => {
                if managed.entity_name() != source.entity_name() {
                    return Err(Error::Custom(format!(
                        "cannot merge {:?} onto an instance of {}",
                        source,
                        managed.entity_name()
                    )));
                }
                if let (Some(detached), Some(current)) = (version_of(source), version_of(managed)) {
                    if !detached.is_null() && detached.as_i64() != current.as_i64() {
                        tracing::warn!(entity = %source.entity_name(), "Merging stale detached state");
                        return Err(Error::StaleObjectState {
                            entity: source.entity_name(),
                            id: managed.id().unwrap_or_else(|| Identifier::Simple(Value::Null)),
                        });
                    }
                }
                managed.clone()
            }
            None => {
                let fresh = EntityRef::new(Arc::clone(&meta));
                if let Some(id) = source.id() {
                    fresh.set_id(id)?;
                }
                fresh
            }
        };

        seen.push((source.clone(), target.clone()));
        self.copy_state(source, &target, seen)?;
        match existing {
            Some(_) => {
                let key = self.managed_key(&target)?;
                self.open_state()?.context.mark_candidate(key)?;
            }
            None => self.persist(&target, true)?,
        }
        Ok(target)
    }

    fn copy_state(
        &self,
        source: &EntityRef,
        target: &EntityRef,
        seen: &mut Vec<(EntityRef, EntityRef)>,
    ) -> Result<()> {
        let meta = target.metadata();
        let values = source.data()?.values.clone();
        for prop in meta.properties() {
            if prop.version {
                continue;
            }
            let Some(value) = values.get(prop.slot).cloned() else {
                continue;
            };
            match (&prop.kind, value) {
                (PropertyKind::Basic(_), PropertyValue::Basic(v)) => target.set(&prop.name, v)?,
                (PropertyKind::ToOne(to_one), PropertyValue::Reference(reference)) => {
                    let resolved = match reference {
                        None => None,
                        Some(Reference::Entity(e)) if CascadeAction::Merge.applies(&to_one.cascade) => {
                            Some(Reference::Entity(self.merge(&e, seen)?))
                        }
                        Some(Reference::Entity(e)) if e.id().is_none() => Some(Reference::Entity(e)),
                        Some(reference) => {
                            let target_meta = self.entity_meta(&reference.entity_name())?;
                            let id = reference.identifier().ok_or_else(|| not_managed(target))?;
                            Some(self.reference_for(&target_meta, id)?)
                        }
                    };
                    target.assign(&prop.name, resolved)?;
                }
                (PropertyKind::Collection(coll), PropertyValue::Collection(elements))
                    if CascadeAction::Merge.applies(&coll.cascade) =>
                {
                    let Some(elements) = elements.loaded_elements() else {
                        continue;
                    };
                    let merged = elements
                        .iter()
                        .map(|element| self.merge(element, seen))
                        .collect::<Result<Vec<_>>>()?;
                    // the detached elements replace the managed ones
                    let destination = target.collection(&prop.name)?;
                    destination.clear()?;
                    for element in merged {
                        destination.add(element)?;
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn refresh(&self, entity: &EntityRef, seen: &mut HashSet<EntityKey>) -> Result<()> {
        let (key, read_only) = {
            let state = self.open_state()?;
            let key = state.context.key_of(entity).ok_or_else(|| not_managed(entity))?;
            let entry = state.context.entry(&key).ok_or_else(|| not_managed(entity))?;
            if !entry.exists_in_db {
                return Err(Error::Custom(format!("{} has not been flushed yet", key)));
            }
            (key, entry.read_only)
        };
        if !seen.insert(key.clone()) {
            return Ok(());
        }

        let meta = entity.metadata();
        let plan = self.plan_builder().entity_plan(meta.name())?;
        let (select, mapping) =
            render_select(self.metamodel(), &plan, &[Restriction::Id(key.id.clone())])?;
        let rows = self.query_rows(&Statement::Select(select))?;
        if rows.is_empty() {
            return Err(Error::EntityNotFound {
                entity: meta.name().to_string(),
                id: key.id,
            });
        }
        let root = plan.entity_return().ok_or_else(no_entity_return)?;
        self.assemble_entities(
            root,
            &mapping,
            &rows,
            AssemblyOptions {
                read_only,
                refresh: Some(key),
            },
        )?;

        for target in cascade_targets(entity, CascadeAction::Refresh, false)? {
            if self.status(&target)? == EntityStatus::Managed {
                self.refresh(&target, seen)?;
            }
        }
        Ok(())
    }

    fn evict(&self, entity: &EntityRef) -> Result<()> {
        let mut pending = VecDeque::from([entity.clone()]);
        while let Some(next) = pending.pop_front() {
            if self.open_state()?.context.key_of(&next).is_none() {
                continue;
            }
            let targets = cascade_targets(&next, CascadeAction::Evict, false)?;
            let mut state = self.open_state()?;
            if let Some(key) = state.context.key_of(&next) {
                state.context.evict(&key)?;
            }
            pending.extend(targets);
        }
        Ok(())
    }

    /// Persist whatever managed instances reach through persist cascades.
    fn cascade_persist_all(&self) -> Result<()> {
        let managed: Vec<EntityRef> = self
            .open_state()?
            .context
            .entries()
            .into_iter()
            .filter(|e| e.status == EntityStatus::Managed)
            .map(|e| e.instance.clone())
            .collect();
        for instance in managed {
            for target in cascade_targets(&instance, CascadeAction::Persist, false)? {
                self.persist(&target, false)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Flush and transactions
    // ------------------------------------------------------------------------

    fn begin(&self) -> Result<()> {
        let mut guard = self.open_state()?;
        let state = &mut *guard;
        state.transaction.begin()?;
        let conn = connection(&mut state.connection, self.factory.provider.as_ref())?;
        if let Err(e) = conn.begin() {
            state.transaction.rolled_back();
            return Err(e);
        }
        Ok(())
    }

    fn flush(&self) -> Result<FlushResult> {
        let active = self.open_state()?.transaction.is_active();
        if active {
            self.open_state()?.transaction.check_writable()?;
        } else {
            if !self.settings().auto_begin {
                return Err(Error::transaction(
                    hibernia_core::TransactionErrorKind::NotActive,
                    "flush requires an active transaction",
                ));
            }
            self.begin()?;
        }
        self.fire(SessionEvent::BeforeFlush)?;
        self.cascade_persist_all()?;

        let result = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            state.transaction.check_writable()?;
            let plan = plan_flush(self.metamodel(), &state.context, self.settings().dirty_checking)?;
            let result = if plan.is_empty() {
                FlushResult::default()
            } else {
                let conn = connection(&mut state.connection, self.factory.provider.as_ref())?;
                match plan.execute(conn, &mut state.stats) {
                    Ok(result) => result,
                    Err(e) => {
                        state.transaction.mark_rollback_only();
                        return Err(e);
                    }
                }
            };
            plan.complete(
                &mut state.context,
                &mut state.transaction,
                self.factory.region_cache().is_some(),
            )?;
            state.stats.flushes += 1;
            state.stats.inserts += result.inserted as u64;
            state.stats.updates += result.updated as u64;
            state.stats.deletes += result.deleted as u64;
            result
        };

        self.fire(SessionEvent::AfterFlush)?;
        Ok(result)
    }

    fn commit(&self) -> Result<()> {
        {
            let mut state = self.open_state()?;
            state.transaction.check_writable()?;
        }
        if self.settings().flush_on_commit {
            if let Err(e) = self.flush() {
                self.state()?.transaction.mark_rollback_only();
                return Err(e);
            }
        }
        self.fire(SessionEvent::BeforeCommit)?;

        let actions = {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            state.transaction.check_writable()?;
            let conn = connection(&mut state.connection, self.factory.provider.as_ref())?;
            if let Err(e) = conn.commit() {
                state.transaction.mark_rollback_only();
                return Err(e);
            }
            state.transaction.committed()
        };

        if let Some(cache) = self.factory.region_cache() {
            let mut puts = 0;
            for action in actions {
                match action {
                    CacheAction::Put { region, id, entry } => {
                        cache.put(&region, id, entry);
                        puts += 1;
                    }
                    CacheAction::Evict { region, id } => cache.evict(&region, &id),
                }
            }
            self.state()?.stats.cache_puts += puts;
        }
        tracing::debug!("Transaction committed");
        self.fire(SessionEvent::AfterCommit)
    }

    fn rollback(&self) -> Result<()> {
        {
            let mut guard = self.open_state()?;
            let state = &mut *guard;
            state.transaction.require_active()?;
            let result = match state.connection.as_deref_mut() {
                Some(conn) => conn.rollback(),
                None => Ok(()),
            };
            state.transaction.rolled_back();
            state.context.clear()?;
            result?;
        }
        tracing::debug!("Transaction rolled back");
        self.fire(SessionEvent::AfterRollback)
    }

    fn close(&self) -> Result<()> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        if !state.open {
            return Ok(());
        }
        if state.transaction.is_active() {
            if let Some(conn) = state.connection.as_deref_mut() {
                if let Err(e) = conn.rollback() {
                    tracing::warn!(error = %e, "Rollback on close failed");
                }
            }
            state.transaction.rolled_back();
            tracing::debug!("Open transaction rolled back on close");
        }
        state.context.close();
        state.connection = None;
        state.open = false;
        tracing::debug!(stats = ?state.stats, "Session closed");
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    pub(crate) fn query_entities(
        &self,
        entity: &str,
        profile: Option<&FetchProfile>,
        restrictions: &[Restriction],
        read_only: Option<bool>,
    ) -> Result<Vec<EntityRef>> {
        let mut builder = self.plan_builder();
        if let Some(profile) = profile {
            builder = builder.profile(profile);
        }
        let plan = builder.entity_plan(entity)?;
        self.run_entity_plan(&plan, restrictions, read_only)
    }

    fn run_entity_plan(
        &self,
        plan: &LoadPlan,
        restrictions: &[Restriction],
        read_only: Option<bool>,
    ) -> Result<Vec<EntityRef>> {
        let (select, mapping) = render_select(self.metamodel(), plan, restrictions)?;
        let rows = self.query_rows(&Statement::Select(select))?;
        let root = plan.entity_return().ok_or_else(no_entity_return)?;
        let roots = self.assemble_entities(
            root,
            &mapping,
            &rows,
            AssemblyOptions {
                read_only: read_only.unwrap_or(self.settings().default_read_only),
                refresh: None,
            },
        )?;
        self.without_removed(roots)
    }

    fn without_removed(&self, instances: Vec<EntityRef>) -> Result<Vec<EntityRef>> {
        let state = self.open_state()?;
        Ok(instances
            .into_iter()
            .filter(|instance| {
                instance.key().is_none_or(|key| {
                    state.context.status_of(&key) != Some(EntityStatus::Removed)
                })
            })
            .collect())
    }

    pub(crate) fn query_scalars(
        &self,
        entity: &str,
        properties: &[&str],
        restrictions: &[Restriction],
    ) -> Result<Vec<Vec<Value>>> {
        let plan = self.plan_builder().scalar_plan(entity, properties)?;
        let (select, mapping) = render_select(self.metamodel(), &plan, restrictions)?;
        let rows = self.query_rows(&Statement::Select(select))?;
        Ok(rows
            .iter()
            .map(|row| {
                mapping
                    .scalars()
                    .iter()
                    .map(|(_, pos)| row.get(*pos).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    fn query_collection(&self, role: &str, owner: Identifier) -> Result<Vec<EntityRef>> {
        let (owner_meta, _) = self.metamodel().collection(role)?;
        let owner = owner_meta.identifier().coerce(owner_meta.name(), owner)?;
        let mut loaded = self.fetch_collection_elements(role, std::slice::from_ref(&owner))?;
        self.without_removed(loaded.remove(&owner).unwrap_or_default())
    }

    fn native_entities(&self, query: &NativeQuery) -> Result<Vec<EntityRef>> {
        let entity = query.returns().ok_or_else(|| {
            Error::Query(
                QueryError::new(QueryErrorKind::Unsupported, "native query declares no entity return")
                    .with_sql(query.sql()),
            )
        })?;
        // depth 0: a native result carries the return entity's columns only
        let plan = LoadPlanBuilder::new(self.metamodel(), 0).entity_plan(entity)?;
        let rows = self.query_rows(&query.statement())?;
        let Some(first) = rows.first() else {
            return Ok(Vec::new());
        };
        let labels = first.column_info();
        let columns = ColumnInfo::new(
            labels
                .names()
                .iter()
                .map(|label| query.mapped_column(label).to_string())
                .collect(),
        );
        let mapping = ResultMapping::from_columns(self.metamodel(), &plan, &columns)?;
        let root = plan.entity_return().ok_or_else(no_entity_return)?;
        let roots = self.assemble_entities(
            root,
            &mapping,
            &rows,
            AssemblyOptions {
                read_only: query.read_only.unwrap_or(self.settings().default_read_only),
                refresh: None,
            },
        )?;
        self.without_removed(roots)
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit of work against one database connection.
///
/// Obtained from [`SessionFactory::open_session`](crate::SessionFactory::open_session).
/// Dropping a session closes it, rolling back an open transaction.
pub struct Session {
    core: Rc<SessionCore>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.core, f)
    }
}

impl Session {
    pub(crate) fn new(factory: Arc<FactoryInner>) -> Self {
        Self {
            core: SessionCore::new(factory),
        }
    }

    pub(crate) fn core(&self) -> &SessionCore {
        &self.core
    }

    pub fn metamodel(&self) -> &Metamodel {
        self.core.metamodel()
    }

    /// A new transient instance of `entity`.
    pub fn instantiate(&self, entity: &str) -> Result<EntityRef> {
        Ok(EntityRef::new(self.core.entity_meta(entity)?))
    }

    // ========================================================================
    // Events
    // ========================================================================

    /// Register a lifecycle callback. A callback returning `Err` aborts the
    /// operation that fired it.
    pub fn on(&self, event: SessionEvent, callback: impl FnMut() -> Result<()> + 'static) -> Result<()> {
        self.core.state()?.events.register(event, callback);
        Ok(())
    }

    // ========================================================================
    // Loading
    // ========================================================================

    /// The instance of `entity` with this identifier, or `None`.
    ///
    /// Looks in the persistence context first, then the second-level cache,
    /// then the database. Instances scheduled for removal are not found.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn find(&self, entity: &str, id: impl Into<Identifier>) -> Result<Option<EntityRef>> {
        let meta = self.core.entity_meta(entity)?;
        let id = meta.identifier().coerce(meta.name(), id.into())?;
        self.core.load(&meta, id, self.core.settings().default_read_only)
    }

    /// Like [`find`](Self::find), but a missing row is an error.
    pub fn get(&self, entity: &str, id: impl Into<Identifier>) -> Result<EntityRef> {
        let meta = self.core.entity_meta(entity)?;
        let id = meta.identifier().coerce(meta.name(), id.into())?;
        self.core
            .load(&meta, id.clone(), self.core.settings().default_read_only)?
            .ok_or_else(|| Error::EntityNotFound {
                entity: meta.name().to_string(),
                id,
            })
    }

    /// A reference to `entity` by identifier.
    ///
    /// Proxyable entities that are not managed yet get an uninitialized
    /// proxy and no statement is executed.
    #[tracing::instrument(level = "debug", skip(self, id))]
    pub fn get_reference(&self, entity: &str, id: impl Into<Identifier>) -> Result<Reference> {
        let meta = self.core.entity_meta(entity)?;
        let id = meta.identifier().coerce(meta.name(), id.into())?;
        self.core.reference_for(&meta, id)
    }

    /// Look up an instance by the values of its natural-id properties, in
    /// declaration order.
    #[tracing::instrument(level = "debug", skip(self, values))]
    pub fn find_by_natural_id(&self, entity: &str, values: &[Value]) -> Result<Option<EntityRef>> {
        let meta = self.core.entity_meta(entity)?;
        let slots = meta.natural_id_slots();
        if slots.is_empty() {
            return Err(Error::mapping(meta.name(), "no natural id is declared"));
        }
        if slots.len() != values.len() {
            return Err(Error::Custom(format!(
                "natural id of {} has {} properties, {} values given",
                meta.name(),
                slots.len(),
                values.len()
            )));
        }

        let mut normalized = Vec::with_capacity(values.len());
        let mut restrictions = Vec::with_capacity(values.len());
        for (&slot, value) in slots.iter().zip(values) {
            let prop = meta
                .properties()
                .get(slot)
                .ok_or_else(|| Error::mapping(meta.name(), "natural id slot out of range"))?;
            let value = match prop.kind {
                PropertyKind::Basic(_) => prop.check_value(meta.name(), value.clone())?,
                _ => value.clone(),
            };
            normalized.push(value.clone());
            restrictions.push(Restriction::Property(prop.name.clone(), value));
        }

        let read_only = self.core.settings().default_read_only;
        let known = self
            .core
            .open_state()?
            .context
            .natural_id(meta.root_name(), &normalized)
            .cloned();
        if let Some(id) = known {
            tracing::trace!(id = %id, "Natural id resolved from the persistence context");
            return self.core.load(&meta, id, read_only);
        }
        let found = self
            .core
            .query_entities(meta.name(), None, &restrictions, Some(read_only))?;
        Ok(found.into_iter().next())
    }

    /// Load an uninitialized reference now.
    #[track_caller]
    pub fn initialize(&self, reference: &Reference) -> Result<EntityRef> {
        reference.get()
    }

    /// Load an uninitialized collection now.
    #[track_caller]
    pub fn initialize_collection(&self, collection: &PersistentCollection) -> Result<()> {
        collection.initialize()
    }

    /// Start a query for instances of `entity`.
    pub fn query(&self, entity: &str) -> Query<'_> {
        Query::new(self, entity)
    }

    /// The elements of collection `role` of the owner with this identifier.
    pub fn query_collection(&self, role: &str, owner: impl Into<Identifier>) -> Result<Vec<EntityRef>> {
        self.core.query_collection(role, owner.into())
    }

    /// Run externally translated SQL and assemble its entity return.
    #[tracing::instrument(level = "debug", skip(self, query), fields(sql = query.sql()))]
    pub fn native_query(&self, query: &NativeQuery) -> Result<Vec<EntityRef>> {
        self.core.native_entities(query)
    }

    /// Run externally translated SQL and return its raw rows.
    pub fn native_rows(&self, query: &NativeQuery) -> Result<Vec<Row>> {
        self.core.query_rows(&query.statement())
    }

    // ========================================================================
    // Unit of work
    // ========================================================================

    /// Make a transient instance managed; it is inserted at the next flush.
    ///
    /// Persist cascades along associations that declare it. Identifiers
    /// must be assigned unless the entity uses a generator.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = %entity.entity_name()))]
    pub fn persist(&self, entity: &EntityRef) -> Result<()> {
        self.core.persist(entity, true)
    }

    /// Schedule a managed instance for deletion at the next flush.
    ///
    /// Remove cascades now, initializing lazy associations it has to walk.
    /// A pending insert is simply forgotten.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = ?entity))]
    pub fn remove(&self, entity: &EntityRef) -> Result<()> {
        self.core.remove(entity)
    }

    /// Copy the state of a detached instance onto the managed instance of
    /// the same identity, loading or persisting it as needed.
    ///
    /// Fails with [`Error::StaleObjectState`] when the detached version is
    /// older than the managed one.
    #[tracing::instrument(level = "debug", skip(self, detached), fields(entity = ?detached))]
    pub fn merge(&self, detached: &EntityRef) -> Result<EntityRef> {
        self.core.merge(detached, &mut Vec::new())
    }

    /// Re-read a managed instance from the database, discarding changes.
    #[tracing::instrument(level = "debug", skip(self, entity), fields(entity = ?entity))]
    pub fn refresh(&self, entity: &EntityRef) -> Result<()> {
        self.core.refresh(entity, &mut HashSet::new())
    }

    /// Stop managing an instance (and what evict cascades to).
    pub fn evict(&self, entity: &EntityRef) -> Result<()> {
        self.core.evict(entity)
    }

    /// Whether this exact instance is managed and not scheduled for removal.
    pub fn contains(&self, entity: &EntityRef) -> Result<bool> {
        Ok(self.core.status(entity)? == EntityStatus::Managed)
    }

    /// Lifecycle status of `entity` with respect to this session.
    pub fn status(&self, entity: &EntityRef) -> Result<EntityStatus> {
        self.core.status(entity)
    }

    /// Bind a detached proxy (for instance a deserialized one) to this
    /// session.
    #[tracing::instrument(level = "debug", skip(self, proxy), fields(key = %proxy.key()))]
    pub fn reattach(&self, proxy: &LazyRef) -> Result<()> {
        self.core.entity_meta(proxy.entity_name())?;
        let mut state = self.core.open_state()?;
        let key = proxy.key().clone();
        match state.context.lookup(&key)? {
            Lookup::Initialized(_) => {
                return Err(Error::DuplicateIdentity {
                    entity: key.entity,
                    id: key.id,
                });
            }
            Lookup::Uninitialized(existing) if !LazyRef::ptr_eq(&existing, proxy) => {
                return Err(Error::DuplicateIdentity {
                    entity: key.entity,
                    id: key.id,
                });
            }
            _ => {}
        }
        state.context.register_proxy(proxy.clone())?;
        proxy.bind(Rc::downgrade(&self.core));
        Ok(())
    }

    /// Exclude (or re-include) a managed instance from dirty checking.
    pub fn set_read_only(&self, entity: &EntityRef, read_only: bool) -> Result<()> {
        let key = self.core.managed_key(entity)?;
        self.core.open_state()?.context.set_read_only(&key, read_only)
    }

    pub fn is_read_only(&self, entity: &EntityRef) -> Result<bool> {
        let key = self.core.managed_key(entity)?;
        Ok(self
            .core
            .open_state()?
            .context
            .entry(&key)
            .is_some_and(|e| e.read_only))
    }

    /// Flag a managed instance for dirty checking under tracked mode.
    pub fn mark_dirty(&self, entity: &EntityRef) -> Result<()> {
        let key = self.core.managed_key(entity)?;
        self.core.open_state()?.context.mark_candidate(key)
    }

    /// Whether a flush would execute any statement.
    pub fn is_dirty(&self) -> Result<bool> {
        let state = self.core.open_state()?;
        let plan = plan_flush(
            self.core.metamodel(),
            &state.context,
            self.core.settings().dirty_checking,
        )?;
        Ok(!plan.is_empty())
    }

    /// Properties of a managed instance changed since it was loaded.
    pub fn dirty_properties(&self, entity: &EntityRef) -> Result<Vec<String>> {
        let key = self.core.managed_key(entity)?;
        self.core.open_state()?.context.compute_dirty_properties(&key)
    }

    /// Write every pending change.
    ///
    /// Begins a transaction first when none is active and the settings allow
    /// it. A failing statement leaves the transaction rollback-only.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn flush(&self) -> Result<FlushResult> {
        self.core.flush()
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn begin_transaction(&self) -> Result<()> {
        self.core.begin()
    }

    /// Flush (unless disabled in the settings), then commit.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&self) -> Result<()> {
        self.core.commit()
    }

    /// Roll back and clear the persistence context.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&self) -> Result<()> {
        self.core.rollback()
    }

    pub fn transaction_status(&self) -> Result<TransactionStatus> {
        Ok(self.core.state()?.transaction.status())
    }

    /// Timeout for the current transaction, or the next one if none is
    /// active.
    pub fn set_transaction_timeout(&self, timeout: Duration) -> Result<()> {
        self.core.open_state()?.transaction.set_timeout(Some(timeout));
        Ok(())
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Detach every managed instance. Proxies and collections handed out so
    /// far fail lazily from now on.
    pub fn clear(&self) -> Result<()> {
        self.core.open_state()?.context.clear()?;
        tracing::debug!("Persistence context cleared");
        Ok(())
    }

    /// Close the session. Closing twice is a no-op.
    pub fn close(&self) -> Result<()> {
        self.core.close()
    }

    pub fn is_open(&self) -> bool {
        self.core.state.try_borrow().is_ok_and(|s| s.open)
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn statistics(&self) -> SessionStatistics {
        self.core
            .state
            .try_borrow()
            .map(|s| s.stats)
            .unwrap_or_default()
    }

    /// Associations lazily initialized at least `n1_warn_threshold` times,
    /// as (owner entity, property, count).
    pub fn n1_suspects(&self) -> Vec<(String, String, usize)> {
        self.core
            .state
            .try_borrow()
            .map(|s| s.tracker.suspects())
            .unwrap_or_default()
    }

    /// Number of managed instances.
    pub fn managed_count(&self) -> usize {
        self.core.state.try_borrow().map_or(0, |s| s.context.len())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.core.close() {
            tracing::warn!(error = %e, "Failed to close session on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{
        auction_model, billing_model, catalog_model, factory, invoice_model, seed_auction,
        seed_invoices,
    };
    use crate::factory::SessionFactory;
    use hibernia_core::InMemoryRegionCache;
    use hibernia_memdb::Database;
    use std::cell::Cell;

    fn invoice_session() -> (Database, Session) {
        let model = invoice_model();
        let db = Database::new();
        db.create_schema(&model).unwrap();
        seed_invoices(&db);
        let session = factory(model, &db, Settings::default()).open_session();
        (db, session)
    }

    #[test]
    fn find_returns_the_same_instance_for_one_identity() {
        let (db, session) = invoice_session();
        let a = session.find("Invoice", 1_i64).unwrap().unwrap();
        let b = session.find("Invoice", 1_i32).unwrap().unwrap();
        assert!(EntityRef::ptr_eq(&a, &b));
        assert_eq!(db.statements_starting_with("SELECT").len(), 1);
        assert!(session.find("Invoice", 99_i64).unwrap().is_none());
    }

    #[test]
    fn lazy_customer_is_a_proxy_until_touched() {
        let (db, session) = invoice_session();
        let invoice = session.find("Invoice", 1_i64).unwrap().unwrap();
        let Some(Reference::Proxy(customer)) = invoice.reference("customer").unwrap() else {
            panic!("expected a proxy");
        };
        assert!(!customer.is_initialized());
        assert_eq!(customer.identifier(), &Identifier::from(7_i64));
        let before = db.statement_count();

        assert_eq!(customer.get_value("name").unwrap(), Value::Text("Acme".into()));
        assert!(customer.is_initialized());
        assert_eq!(db.statement_count(), before + 1);
        assert_eq!(session.statistics().proxy_initializations, 1);
    }

    #[test]
    fn get_reference_executes_nothing_for_proxyable_entities() {
        let (db, session) = invoice_session();
        let reference = session.get_reference("Customer", 7_i64).unwrap();
        assert!(!reference.is_initialized());
        assert_eq!(db.statement_count(), 0);
        let customer = session.initialize(&reference).unwrap();
        assert!(EntityRef::ptr_eq(&customer, &session.find("Customer", 7_i64).unwrap().unwrap()));
    }

    #[test]
    fn cleared_sessions_fail_lazily() {
        let (_db, session) = invoice_session();
        let invoice = session.find("Invoice", 1_i64).unwrap().unwrap();
        let lines = invoice.collection("lines").unwrap();
        session.clear().unwrap();
        let err = lines.size().unwrap_err();
        assert!(err.is_lazy_initialization());
        assert_eq!(session.managed_count(), 0);
    }

    #[test]
    fn closed_sessions_refuse_work() {
        let (_db, session) = invoice_session();
        session.close().unwrap();
        session.close().unwrap();
        assert!(!session.is_open());
        assert!(matches!(session.find("Invoice", 1_i64), Err(Error::SessionClosed)));
    }

    #[test]
    fn commit_flushes_dirty_instances() {
        let (db, session) = invoice_session();
        session.begin_transaction().unwrap();
        let invoice = session.find("Invoice", 1_i64).unwrap().unwrap();
        invoice.set("number", "INV-1b").unwrap();
        assert!(session.is_dirty().unwrap());
        assert_eq!(session.dirty_properties(&invoice).unwrap(), vec!["number"]);
        session.commit().unwrap();

        let rows = db.rows("invoice").unwrap();
        assert_eq!(rows[0].get_by_name("number"), Some(&Value::Text("INV-1b".into())));
        assert_eq!(db.commits(), 1);
        assert_eq!(session.transaction_status().unwrap(), TransactionStatus::Committed);
        assert!(!session.is_dirty().unwrap());
    }

    #[test]
    fn rollback_clears_the_context() {
        let (db, session) = invoice_session();
        session.begin_transaction().unwrap();
        let invoice = session.find("Invoice", 1_i64).unwrap().unwrap();
        invoice.set("number", "changed").unwrap();
        session.flush().unwrap();
        session.rollback().unwrap();

        assert!(!session.contains(&invoice).unwrap());
        let rows = db.rows("invoice").unwrap();
        assert_eq!(rows[0].get_by_name("number"), Some(&Value::Text("INV-1".into())));
        assert!(session.rollback().is_err());
    }

    #[test]
    fn removing_a_pending_insert_forgets_it() {
        let (db, session) = invoice_session();
        let customer = session.instantiate("Customer").unwrap();
        customer.set_id(8_i64).unwrap();
        customer.set("name", "Globex").unwrap();
        session.persist(&customer).unwrap();
        assert_eq!(session.status(&customer).unwrap(), EntityStatus::Managed);
        session.remove(&customer).unwrap();
        assert_eq!(session.status(&customer).unwrap(), EntityStatus::Detached);
        session.flush().unwrap();
        assert_eq!(db.count("customer"), 1);
    }

    #[test]
    fn persist_requires_assigned_identifiers() {
        let (_db, session) = invoice_session();
        let customer = session.instantiate("Customer").unwrap();
        assert!(session.persist(&customer).is_err());
        assert_eq!(session.status(&customer).unwrap(), EntityStatus::Transient);
    }

    #[test]
    fn increment_identifiers_continue_after_the_highest_row() {
        let model = catalog_model();
        let db = Database::new();
        db.create_schema(&model).unwrap();
        db.insert(
            "product",
            &[
                ("id", Value::BigInt(40)),
                ("sku", "A-1".into()),
                ("name", "Lamp".into()),
                ("version", Value::Int(0)),
            ],
        )
        .unwrap();
        let session = factory(model, &db, Settings::default()).open_session();
        let product = session.instantiate("Product").unwrap();
        product.set("sku", "B-2").unwrap();
        product.set("name", "Desk").unwrap();
        session.persist(&product).unwrap();
        assert_eq!(product.id(), Some(Identifier::from(41_i64)));
        session.flush().unwrap();
        session.commit().unwrap();
        assert_eq!(db.count("product"), 2);
        assert_eq!(db.commits(), 1);
    }

    #[test]
    fn events_fire_around_flush_and_commit() {
        let (_db, session) = invoice_session();
        let fired = Rc::new(Cell::new(0));
        for event in [SessionEvent::BeforeFlush, SessionEvent::AfterFlush, SessionEvent::AfterCommit] {
            let fired = Rc::clone(&fired);
            session
                .on(event, move || {
                    fired.set(fired.get() + 1);
                    Ok(())
                })
                .unwrap();
        }
        session.begin_transaction().unwrap();
        session.commit().unwrap();
        assert_eq!(fired.get(), 3);
    }

    #[test]
    fn failing_before_commit_prevents_the_commit() {
        let (db, session) = invoice_session();
        session
            .on(SessionEvent::BeforeCommit, || Err(Error::Custom("veto".into())))
            .unwrap();
        session.begin_transaction().unwrap();
        assert!(session.commit().is_err());
        assert_eq!(db.commits(), 0);
        session.rollback().unwrap();
    }

    #[test]
    fn removed_instances_are_not_found() {
        let (db, session) = invoice_session();
        let customer = session.find("Customer", 7_i64).unwrap().unwrap();
        let invoice = session.find("Invoice", 1_i64).unwrap().unwrap();
        invoice.set_reference("customer", None).unwrap();
        session.remove(&customer).unwrap();
        assert!(session.find("Customer", 7_i64).unwrap().is_none());
        assert!(!session.contains(&customer).unwrap());
        session.flush().unwrap();
        assert_eq!(db.count("customer"), 0);
    }

    #[test]
    fn queries_filter_and_join() {
        let model = auction_model();
        let db = Database::new();
        db.create_schema(&model).unwrap();
        seed_auction(&db);
        let session = factory(model, &db, Settings::default()).open_session();

        let items = session
            .query("Item")
            .join("bids")
            .filter("name", "Lamp")
            .list()
            .unwrap();
        assert_eq!(items.len(), 1);
        let bids = items[0].collection("bids").unwrap();
        assert!(bids.is_initialized());
        assert_eq!(bids.size().unwrap(), 2);

        let names = session.query("User").scalars(&["username"]).unwrap();
        assert_eq!(names.len(), 2);
    }

    #[test]
    fn subtypes_come_back_concrete() {
        let model = billing_model();
        let db = Database::new();
        db.create_schema(&model).unwrap();
        db.insert("users", &[("id", Value::BigInt(1)), ("username", "ann".into())]).unwrap();
        db.insert(
            "billing_details",
            &[
                ("id", Value::BigInt(5)),
                ("kind", "CC".into()),
                ("owner_name", "ann".into()),
                ("owner_id", Value::BigInt(1)),
                ("number", "4111".into()),
            ],
        )
        .unwrap();
        let session = factory(model, &db, Settings::default()).open_session();
        let details = session.find("BillingDetails", 5_i64).unwrap().unwrap();
        assert_eq!(details.entity_name(), "CreditCard");
        assert!(session.find("BankAccount", 5_i64).unwrap().is_none());
    }

    #[test]
    fn cached_entities_skip_the_database() {
        let model = catalog_model();
        let db = Database::new();
        db.create_schema(&model).unwrap();
        db.insert(
            "category",
            &[("id", Value::BigInt(1)), ("code", "LAMPS".into()), ("title", "Lamps".into())],
        )
        .unwrap();
        let factory = SessionFactory::builder(model)
            .connection_provider(Arc::new(db.clone()))
            .region_cache(Arc::new(InMemoryRegionCache::new()))
            .build()
            .unwrap();

        let first = factory.open_session();
        first.find("Category", 1_i64).unwrap().unwrap();
        assert_eq!(first.statistics().cache_misses, 1);
        assert_eq!(first.statistics().cache_puts, 1);

        let second = factory.open_session();
        let before = db.statement_count();
        let category = second.find("Category", 1_i64).unwrap().unwrap();
        assert_eq!(category.get("title").unwrap(), Value::Text("Lamps".into()));
        assert_eq!(db.statement_count(), before);
        assert_eq!(second.statistics().cache_hits, 1);
    }

    #[test]
    fn natural_ids_resolve_once() {
        let model = catalog_model();
        let db = Database::new();
        db.create_schema(&model).unwrap();
        db.insert(
            "category",
            &[("id", Value::BigInt(3)), ("code", "DESKS".into()), ("title", "Desks".into())],
        )
        .unwrap();
        let session = factory(model, &db, Settings::default().use_second_level_cache(false)).open_session();
        let a = session.find_by_natural_id("Category", &["DESKS".into()]).unwrap().unwrap();
        let statements = db.statement_count();
        let b = session.find_by_natural_id("Category", &["DESKS".into()]).unwrap().unwrap();
        assert!(EntityRef::ptr_eq(&a, &b));
        assert_eq!(db.statement_count(), statements);
        assert!(session.find_by_natural_id("Category", &[]).is_err());
        assert!(session.find_by_natural_id("Category", &["NONE".into()]).unwrap().is_none());
    }

    #[test]
    fn type_checked_setters_reject_wrong_values() {
        let (_db, session) = invoice_session();
        let invoice = session.find("Invoice", 1_i64).unwrap().unwrap();
        assert!(invoice.set("number", Value::Bool(true)).is_err());
        assert!(!session.is_dirty().unwrap());
    }
}
