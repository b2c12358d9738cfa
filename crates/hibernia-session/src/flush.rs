//! Flush planning and execution.
//!
//! A flush turns the difference between the persistence context and the
//! database into statements, in an order foreign keys can live with:
//!
//! 1. INSERT pending entities, referenced rows first
//! 2. UPDATE nullable references that had to be inserted as NULL
//! 3. UPDATE dirty entities (version-checked where versioned)
//! 4. UPDATE foreign keys of non-inverse collections
//! 5. DELETE removed entities, referencing rows first
//!
//! Planning is complete before the first statement runs: a reference to an
//! unsaved instance or an unbreakable insert cycle fails the flush with
//! [`Error::TransientPropertyValue`] and nothing is written. An instance
//! counts as unsaved when it has no identifier, or when it is neither
//! managed here nor was ever loaded or written.

use crate::cascade::{ActionGraph, Cycle};
use crate::context::{EntityEntry, EntityStatus, PersistenceContext, StateValue, dirty_properties, natural_id_of, version_of};
use crate::entity::{EntityRef, PropertyValue, Reference};
use crate::persister;
use crate::statistics::SessionStatistics;
use crate::transaction::{CacheAction, TransactionCoordinator};
use hibernia_core::{
    Connection, DirtyCheckMode, EntityKey, EntityMetadata, Error, Metamodel,
    PropertyDescriptor, PropertyKind, Result, Statement, Value,
};
use std::collections::{HashMap, HashSet};

#[derive(Debug)]
pub(crate) struct InsertAction {
    key: EntityKey,
    instance: EntityRef,
    statement: Statement,
    /// Version slot and the value written
    version: Option<(usize, Value)>,
}

#[derive(Debug)]
pub(crate) struct UpdateAction {
    key: EntityKey,
    instance: EntityRef,
    statement: Statement,
    version: Option<(usize, Value)>,
    /// Property names written
    dirty: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct DeleteAction {
    key: EntityKey,
    entity: String,
    statement: Statement,
}

/// Every statement one flush will execute, in execution order.
#[derive(Debug, Default)]
pub struct FlushPlan {
    inserts: Vec<InsertAction>,
    deferred: Vec<Statement>,
    updates: Vec<UpdateAction>,
    collection_updates: Vec<Statement>,
    deletes: Vec<DeleteAction>,
    cacheable: HashSet<String>,
}

/// Rows written by one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    pub inserted: usize,
    pub updated: usize,
    pub deleted: usize,
}

impl FlushResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

// ============================================================================
// Planning
// ============================================================================

/// Compute the actions of a flush without executing anything.
#[tracing::instrument(level = "debug", skip_all)]
pub(crate) fn plan_flush(
    metamodel: &Metamodel,
    context: &PersistenceContext,
    mode: DirtyCheckMode,
) -> Result<FlushPlan> {
    let mut pending_inserts = Vec::new();
    let mut dirty_entries = Vec::new();
    let mut removed = Vec::new();

    for entry in context.entries() {
        match entry.status {
            EntityStatus::Managed if !entry.exists_in_db => pending_inserts.push(entry),
            EntityStatus::Managed => {
                if entry.read_only || !entry.instance.metadata().is_mutable() {
                    continue;
                }
                if mode == DirtyCheckMode::Tracked
                    && !context.is_candidate(&entry.key)
                    && !entry.instance.is_modified()
                {
                    continue;
                }
                let Some(snapshot) = &entry.loaded_state else {
                    continue;
                };
                let dirty = dirty_properties(&entry.instance, snapshot)?;
                if !dirty.is_empty() {
                    dirty_entries.push((entry, dirty));
                }
            }
            EntityStatus::Removed if entry.exists_in_db => removed.push(entry),
            _ => {}
        }
    }

    let mut plan = FlushPlan::default();
    plan.plan_inserts(context, &pending_inserts)?;
    for (entry, dirty) in dirty_entries {
        plan.plan_update(context, entry, dirty)?;
    }
    let deleted: HashSet<&EntityKey> = removed.iter().map(|e| &e.key).collect();
    plan.plan_collections(metamodel, context, &deleted)?;
    plan.plan_deletes(&removed);

    plan.cacheable = metamodel
        .entities()
        .filter(|m| m.is_cacheable())
        .map(|m| m.name().to_string())
        .collect();

    tracing::debug!(
        inserts = plan.inserts.len(),
        deferred = plan.deferred.len(),
        updates = plan.updates.len(),
        collection_updates = plan.collection_updates.len(),
        deletes = plan.deletes.len(),
        "Flush planned"
    );
    Ok(plan)
}

/// Identity of the row a reference points at; unsaved targets are an error.
fn reference_key(
    context: &PersistenceContext,
    owner: &EntityMetadata,
    prop: &PropertyDescriptor,
    reference: &Reference,
) -> Result<EntityKey> {
    let transient = || Error::TransientPropertyValue {
        owner: owner.name().to_string(),
        property: prop.name.clone(),
        referenced: reference.entity_name(),
    };
    match reference {
        Reference::Proxy(proxy) => Ok(proxy.key().clone()),
        Reference::Entity(target) => {
            let key = target.key().ok_or_else(transient)?;
            if context.key_of(target).is_some() || target.is_persisted() {
                Ok(key)
            } else {
                tracing::debug!(key = %key, "Reference to an instance that was never saved");
                Err(transient())
            }
        }
    }
}

fn to_one_references(instance: &EntityRef) -> Vec<(usize, Reference)> {
    let meta = instance.metadata();
    meta.properties()
        .iter()
        .filter(|p| matches!(p.kind, PropertyKind::ToOne(_)))
        .filter_map(|p| match instance.slot_value(p.slot) {
            Some(PropertyValue::Reference(Some(r))) => Some((p.slot, r)),
            _ => None,
        })
        .collect()
}

fn cycle_error(entries: &[&EntityEntry], cycle: &Cycle) -> Error {
    let path: Vec<String> = cycle
        .edges
        .iter()
        .map(|e| format!("{}.{}", entries[e.after].instance.entity_name(), e.label))
        .collect();
    tracing::warn!(cycle = ?path, "Insert order cannot satisfy non-nullable references");
    match cycle.edges.first() {
        Some(edge) => Error::TransientPropertyValue {
            owner: entries[edge.after].instance.entity_name(),
            property: edge.label.clone(),
            referenced: entries[edge.before].instance.entity_name(),
        },
        None => Error::Custom("insert order could not be resolved".to_string()),
    }
}

impl FlushPlan {
    fn plan_inserts(&mut self, context: &PersistenceContext, entries: &[&EntityEntry]) -> Result<()> {
        let index: HashMap<&EntityKey, usize> =
            entries.iter().enumerate().map(|(i, e)| (&e.key, i)).collect();
        let mut graph = ActionGraph::new(entries.len());
        // (owner, slot, target) of nullable references between pending inserts
        let mut nullable_links = Vec::new();

        for (i, entry) in entries.iter().enumerate() {
            let meta = entry.instance.metadata();
            for (slot, reference) in to_one_references(&entry.instance) {
                let prop = &meta.properties()[slot];
                let target = reference_key(context, &meta, prop, &reference)?;
                let Some(&j) = index.get(&target) else {
                    continue;
                };
                if j == i {
                    continue;
                }
                if prop.nullable {
                    nullable_links.push((i, slot, j));
                } else {
                    graph.add_edge(j, i, prop.name.clone());
                }
            }
        }

        let order = graph.order().map_err(|cycle| cycle_error(entries, &cycle))?;
        let position: HashMap<usize, usize> = order.iter().enumerate().map(|(p, &i)| (i, p)).collect();
        let mut deferred: HashMap<usize, Vec<usize>> = HashMap::new();
        for (owner, slot, target) in nullable_links {
            if position[&target] > position[&owner] {
                deferred.entry(owner).or_default().push(slot);
            }
        }

        for i in order {
            let entry = entries[i];
            let meta = entry.instance.metadata();
            let version = meta.version_property().map(|p| {
                let value = version_of(&entry.instance)
                    .filter(|v| !v.is_null())
                    .unwrap_or_else(|| persister::initial_version(p));
                (p.slot, value)
            });
            let slots = deferred.remove(&i).unwrap_or_default();
            let data = entry.instance.data()?;
            let insert = persister::insert_statement(
                &meta,
                &data,
                &entry.key.id,
                version.as_ref().map(|(_, v)| v),
                &slots.iter().copied().collect::<HashSet<_>>(),
            );
            if !slots.is_empty() {
                let fixup = persister::deferred_reference_update(&meta, &data, &entry.key.id, &slots);
                self.deferred.push(Statement::Update(fixup));
            }
            self.inserts.push(InsertAction {
                key: entry.key.clone(),
                instance: entry.instance.clone(),
                statement: Statement::Insert(insert),
                version,
            });
        }
        Ok(())
    }

    fn plan_update(&mut self, context: &PersistenceContext, entry: &EntityEntry, dirty: Vec<String>) -> Result<()> {
        let meta = entry.instance.metadata();
        let mut properties = Vec::new();
        for name in &dirty {
            let prop = meta.property(name)?;
            if prop.natural_id {
                return Err(Error::Custom(format!(
                    "immutable natural id property {}.{} of {} was altered",
                    meta.name(),
                    name,
                    entry.key
                )));
            }
            if let Some(PropertyValue::Reference(Some(reference))) = entry.instance.slot_value(prop.slot) {
                reference_key(context, &meta, prop, &reference)?;
            }
            if prop.updatable && !matches!(prop.kind, PropertyKind::Collection(_)) {
                properties.push(prop);
            }
        }
        if properties.is_empty() {
            return Ok(());
        }

        let version = meta.version_property().map(|p| {
            let next = persister::next_version(p, entry.version.as_ref());
            (p, entry.version.clone().unwrap_or(Value::Null), next)
        });
        let data = entry.instance.data()?;
        let update = persister::update_statement(
            &meta,
            &data,
            &entry.key.id,
            &properties,
            version.as_ref().map(|(p, old, new)| (*p, old, new)),
        );
        self.updates.push(UpdateAction {
            key: entry.key.clone(),
            instance: entry.instance.clone(),
            statement: Statement::Update(update),
            version: version.map(|(p, _, new)| (p.slot, new)),
            dirty,
        });
        Ok(())
    }

    fn plan_collections(
        &mut self,
        metamodel: &Metamodel,
        context: &PersistenceContext,
        deleted: &HashSet<&EntityKey>,
    ) -> Result<()> {
        let mut entries: Vec<_> = context.collection_entries().collect();
        entries.sort_by_key(|c| {
            (
                context.entry(&c.owner).map_or(u64::MAX, |e| e.seq),
                c.collection.role().to_string(),
            )
        });

        for entry in entries {
            let (_, mapping) = metamodel.collection(entry.collection.role())?;
            if mapping.is_inverse() {
                continue;
            }
            let element_meta = metamodel.entity(&mapping.element)?;
            let snapshot = entry.snapshot.clone().unwrap_or_default();
            let unlink = |key: &EntityKey| {
                Statement::Update(persister::collection_key_update(
                    element_meta,
                    &key.id,
                    &mapping.key_columns,
                    None,
                ))
            };

            match context.status_of(&entry.owner) {
                Some(EntityStatus::Removed) => {
                    for key in snapshot.iter().filter(|k| !deleted.contains(k)) {
                        self.collection_updates.push(unlink(key));
                    }
                }
                Some(EntityStatus::Managed) => {
                    let Some(elements) = entry.collection.loaded_elements() else {
                        continue;
                    };
                    let mut current = Vec::with_capacity(elements.len());
                    for element in &elements {
                        let key = element.key().ok_or_else(|| Error::TransientPropertyValue {
                            owner: entry.owner.entity.clone(),
                            property: entry.collection.property().to_string(),
                            referenced: element.entity_name(),
                        })?;
                        current.push(key);
                    }
                    for key in current.iter().filter(|k| !snapshot.contains(k)) {
                        self.collection_updates.push(Statement::Update(persister::collection_key_update(
                            element_meta,
                            &key.id,
                            &mapping.key_columns,
                            Some(&entry.owner.id),
                        )));
                    }
                    for key in snapshot.iter().filter(|k| !current.contains(k) && !deleted.contains(k)) {
                        self.collection_updates.push(unlink(key));
                    }
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn plan_deletes(&mut self, entries: &[&EntityEntry]) {
        let index: HashMap<&EntityKey, usize> =
            entries.iter().enumerate().map(|(i, e)| (&e.key, i)).collect();
        let mut graph = ActionGraph::new(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            let Some(snapshot) = &entry.loaded_state else {
                continue;
            };
            let meta = entry.instance.metadata();
            for prop in meta.properties() {
                if let (PropertyKind::ToOne(_), Some(StateValue::Reference(Some(target)))) =
                    (&prop.kind, snapshot.get(prop.slot))
                {
                    if let Some(&j) = index.get(target) {
                        // the referencing row goes first
                        graph.add_edge(i, j, prop.name.clone());
                    }
                }
            }
        }
        let order = graph.order().unwrap_or_else(|cycle| {
            tracing::warn!(edges = cycle.edges.len(), "Delete order has a cycle; deleting in reverse order");
            (0..entries.len()).rev().collect()
        });

        for i in order {
            let entry = entries[i];
            let meta = entry.instance.metadata();
            let version = meta
                .version_property()
                .zip(entry.version.as_ref())
                .filter(|(_, v)| !v.is_null());
            let delete = persister::delete_statement(&meta, &entry.key.id, version);
            self.deletes.push(DeleteAction {
                key: entry.key.clone(),
                entity: meta.name().to_string(),
                statement: Statement::Delete(delete),
            });
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of statements the plan executes.
    pub fn len(&self) -> usize {
        self.inserts.len()
            + self.deferred.len()
            + self.updates.len()
            + self.collection_updates.len()
            + self.deletes.len()
    }

    /// Statements in execution order.
    pub fn statements(&self) -> Vec<&Statement> {
        self.inserts
            .iter()
            .map(|a| &a.statement)
            .chain(&self.deferred)
            .chain(self.updates.iter().map(|a| &a.statement))
            .chain(&self.collection_updates)
            .chain(self.deletes.iter().map(|a| &a.statement))
            .collect()
    }

    // ========================================================================
    // Execution
    // ========================================================================

    /// Execute every statement. Stops at the first failure.
    #[tracing::instrument(level = "info", skip_all)]
    pub(crate) fn execute(
        &self,
        conn: &mut dyn Connection,
        stats: &mut SessionStatistics,
    ) -> Result<FlushResult> {
        tracing::info!(
            inserts = self.inserts.len(),
            updates = self.updates.len(),
            deletes = self.deletes.len(),
            "Executing flush plan"
        );
        let start = std::time::Instant::now();
        let mut result = FlushResult::default();

        for insert in &self.inserts {
            run(conn, stats, &insert.statement)?;
            result.inserted += 1;
        }
        for fixup in &self.deferred {
            run(conn, stats, fixup)?;
        }
        for update in &self.updates {
            if run(conn, stats, &update.statement)? == 0 {
                return Err(stale(&update.key, &update.instance.entity_name()));
            }
            tracing::trace!(key = %update.key, dirty = ?update.dirty, "Updated");
            result.updated += 1;
        }
        for statement in &self.collection_updates {
            run(conn, stats, statement)?;
        }
        for delete in &self.deletes {
            if run(conn, stats, &delete.statement)? == 0 {
                return Err(stale(&delete.key, &delete.entity));
            }
            result.deleted += 1;
        }

        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Ok(result)
    }

    /// Bring the context in line with what was written.
    ///
    /// Written instances get their new versions and fresh snapshots,
    /// deleted ones are evicted, collection snapshots are retaken, and
    /// cache updates are queued on the transaction.
    pub(crate) fn complete(
        self,
        context: &mut PersistenceContext,
        transaction: &mut TransactionCoordinator,
        use_cache: bool,
    ) -> Result<()> {
        let written = self
            .inserts
            .iter()
            .map(|a| (&a.key, &a.instance, &a.version))
            .chain(self.updates.iter().map(|a| (&a.key, &a.instance, &a.version)));
        for (key, instance, version) in written {
            if let Some((slot, value)) = version {
                instance.set_slot(*slot, PropertyValue::Basic(value.clone()))?;
            }
            instance.mark_persisted();
            context.refresh_snapshot(key)?;
            if let Some(values) = natural_id_of(instance) {
                context.cache_natural_id(&key.entity, values, key.id.clone());
            }
            if use_cache && self.cacheable.contains(&instance.entity_name()) {
                let data = instance.data()?;
                transaction.queue_cache(CacheAction::Put {
                    region: key.entity.clone(),
                    id: key.id.clone(),
                    entry: persister::cache_entry(&data, version_of(instance)),
                });
            }
        }

        for delete in &self.deletes {
            context.evict(&delete.key)?;
            if use_cache && self.cacheable.contains(&delete.entity) {
                transaction.queue_cache(CacheAction::Evict {
                    region: delete.key.entity.clone(),
                    id: delete.key.id.clone(),
                });
            }
        }

        let collections: Vec<_> = context
            .collection_entries()
            .filter(|c| c.collection.is_initialized())
            .filter_map(|c| c.collection.key())
            .collect();
        for key in &collections {
            context.refresh_collection_snapshot(key);
        }
        context.flushed();
        Ok(())
    }
}

fn run(conn: &mut dyn Connection, stats: &mut SessionStatistics, statement: &Statement) -> Result<u64> {
    stats.statements += 1;
    tracing::debug!(sql = %statement, params = ?statement.params(), "Executing flush statement");
    conn.execute(statement)
}

fn stale(key: &EntityKey, entity: &str) -> Error {
    tracing::warn!(key = %key, "Row was updated or deleted by another transaction");
    Error::StaleObjectState {
        entity: entity.to_string(),
        id: key.id.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::disassemble;
    use crate::fixtures::{auction_model, catalog_model, invoice_model};
    use hibernia_core::{EntityMapping, Identifier, IdentifierMapping, PropertyMapping, SemanticType};
    use std::sync::Arc;

    fn new_entity(model: &Metamodel, name: &str, id: i64) -> EntityRef {
        EntityRef::with_id(Arc::clone(model.entity(name).unwrap()), Identifier::from(id))
    }

    fn pending(ctx: &mut PersistenceContext, entity: &EntityRef) {
        ctx.register(entity.key().unwrap(), entity, None).unwrap();
    }

    fn loaded(ctx: &mut PersistenceContext, entity: &EntityRef) {
        let state = disassemble(entity).unwrap();
        ctx.register(entity.key().unwrap(), entity, Some(state)).unwrap();
    }

    fn tables(plan: &FlushPlan) -> Vec<String> {
        plan.statements()
            .iter()
            .map(|s| format!("{} {}", s.to_sql().split(' ').next().unwrap(), s.table().unwrap()))
            .collect()
    }

    #[test]
    fn inserts_parents_first_regardless_of_persist_order() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let bid = new_entity(&model, "Bid", 1);
        let item = new_entity(&model, "Item", 1);
        let seller = new_entity(&model, "User", 1);
        bid.set_reference("item", Some(&item)).unwrap();
        item.set_reference("seller", Some(&seller)).unwrap();
        pending(&mut ctx, &bid);
        pending(&mut ctx, &item);
        pending(&mut ctx, &seller);

        let plan = plan_flush(&model, &ctx, DirtyCheckMode::Full).unwrap();
        // Item.seller is nullable: the item goes first with a NULL seller
        assert_eq!(
            tables(&plan),
            vec!["INSERT item", "INSERT bid", "INSERT users", "UPDATE item"]
        );
    }

    #[test]
    fn non_nullable_cycles_fail_before_any_statement() {
        let model = Metamodel::builder()
            .entity(
                EntityMapping::new("Husband")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .property(PropertyMapping::many_to_one("wife", "Wife").not_null()),
            )
            .entity(
                EntityMapping::new("Wife")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .property(PropertyMapping::many_to_one("husband", "Husband").not_null()),
            )
            .build()
            .unwrap();
        let mut ctx = PersistenceContext::new();
        let h = new_entity(&model, "Husband", 1);
        let w = new_entity(&model, "Wife", 1);
        h.set_reference("wife", Some(&w)).unwrap();
        w.set_reference("husband", Some(&h)).unwrap();
        pending(&mut ctx, &h);
        pending(&mut ctx, &w);

        match plan_flush(&model, &ctx, DirtyCheckMode::Full) {
            Err(Error::TransientPropertyValue { owner, property, referenced }) => {
                assert!(owner == "Husband" || owner == "Wife");
                assert_ne!(owner, referenced);
                assert!(property == "wife" || property == "husband");
            }
            other => std::panic::panic_any(format!("unexpected result: {other:?}")),
        }
    }

    #[test]
    fn unsaved_references_are_transient() {
        let model = invoice_model();
        let mut ctx = PersistenceContext::new();
        let invoice = new_entity(&model, "Invoice", 1);
        let customer = EntityRef::new(Arc::clone(model.entity("Customer").unwrap()));
        invoice.set_reference("customer", Some(&customer)).unwrap();
        pending(&mut ctx, &invoice);

        match plan_flush(&model, &ctx, DirtyCheckMode::Full) {
            Err(Error::TransientPropertyValue { owner, property, referenced }) => {
                assert_eq!((owner.as_str(), property.as_str(), referenced.as_str()), ("Invoice", "customer", "Customer"));
            }
            other => std::panic::panic_any(format!("unexpected result: {other:?}")),
        }
    }

    #[test]
    fn references_to_unmanaged_assigned_ids_are_transient() {
        let model = invoice_model();
        let mut ctx = PersistenceContext::new();
        let invoice = new_entity(&model, "Invoice", 60);
        let line = new_entity(&model, "InvoiceLine", 70);
        line.set_reference("invoice", Some(&invoice)).unwrap();
        pending(&mut ctx, &line);

        match plan_flush(&model, &ctx, DirtyCheckMode::Full) {
            Err(Error::TransientPropertyValue { owner, property, referenced }) => {
                assert_eq!((owner.as_str(), property.as_str(), referenced.as_str()), ("InvoiceLine", "invoice", "Invoice"));
            }
            other => std::panic::panic_any(format!("unexpected result: {other:?}")),
        }

        // a detached instance that was once loaded still has its row
        invoice.mark_persisted();
        let plan = plan_flush(&model, &ctx, DirtyCheckMode::Full).unwrap();
        assert_eq!(tables(&plan), vec!["INSERT invoice_line"]);
    }

    #[test]
    fn versioned_updates_and_deletes() {
        let model = catalog_model();
        let mut ctx = PersistenceContext::new();
        let a = new_entity(&model, "Product", 1);
        a.set("sku", "A").unwrap();
        a.set("version", 3_i32).unwrap();
        let b = new_entity(&model, "Product", 2);
        b.set("sku", "B").unwrap();
        b.set("version", 0_i32).unwrap();
        loaded(&mut ctx, &a);
        loaded(&mut ctx, &b);

        a.set("name", "renamed").unwrap();
        ctx.remove(&b.key().unwrap()).unwrap();
        let plan = plan_flush(&model, &ctx, DirtyCheckMode::Full).unwrap();
        assert_eq!(plan.len(), 2);
        let sql: Vec<String> = plan.statements().iter().map(|s| s.to_sql()).collect();
        assert_eq!(sql[0], "UPDATE product SET name = ?, version = ? WHERE id = ? AND version = ?");
        assert_eq!(sql[1], "DELETE FROM product WHERE id = ? AND version = ?");
        assert_eq!(
            plan.statements()[0].params(),
            vec![Value::Text("renamed".into()), Value::Int(4), Value::BigInt(1), Value::Int(3)]
        );
    }

    #[test]
    fn natural_ids_are_immutable() {
        let model = catalog_model();
        let mut ctx = PersistenceContext::new();
        let p = new_entity(&model, "Product", 1);
        p.set("sku", "A").unwrap();
        p.set("version", 0_i32).unwrap();
        loaded(&mut ctx, &p);
        p.set("sku", "B").unwrap();
        assert!(plan_flush(&model, &ctx, DirtyCheckMode::Full).is_err());
    }

    #[test]
    fn tracked_mode_only_checks_candidates() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let user = new_entity(&model, "User", 1);
        loaded(&mut ctx, &user);
        // change the state behind the setters' back
        user.set("username", "x").unwrap();
        user.clear_modified();

        assert!(plan_flush(&model, &ctx, DirtyCheckMode::Tracked).unwrap().is_empty());
        assert_eq!(plan_flush(&model, &ctx, DirtyCheckMode::Full).unwrap().len(), 1);
        ctx.mark_candidate(user.key().unwrap()).unwrap();
        assert_eq!(plan_flush(&model, &ctx, DirtyCheckMode::Tracked).unwrap().len(), 1);
    }

    #[test]
    fn read_only_entities_are_never_written() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let user = new_entity(&model, "User", 1);
        loaded(&mut ctx, &user);
        ctx.set_read_only(&user.key().unwrap(), true).unwrap();
        user.set("username", "x").unwrap();
        assert!(plan_flush(&model, &ctx, DirtyCheckMode::Full).unwrap().is_empty());
    }

    #[test]
    fn deletes_go_child_first() {
        let model = auction_model();
        let mut ctx = PersistenceContext::new();
        let item = new_entity(&model, "Item", 1);
        let bid = new_entity(&model, "Bid", 1);
        bid.set_reference("item", Some(&item)).unwrap();
        loaded(&mut ctx, &item);
        loaded(&mut ctx, &bid);
        ctx.remove(&item.key().unwrap()).unwrap();
        ctx.remove(&bid.key().unwrap()).unwrap();

        let plan = plan_flush(&model, &ctx, DirtyCheckMode::Full).unwrap();
        assert_eq!(tables(&plan), vec!["DELETE bid", "DELETE item"]);
    }
}
