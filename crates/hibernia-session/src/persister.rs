//! Entity state to DML statements.
//!
//! Single-table inheritance: every entity of a hierarchy writes to the
//! root's table, with the discriminator column set on insert.

use crate::entity::{EntityData, PropertyValue, Reference};
use hibernia_core::{
    CacheEntry, CachedValue, DeleteStatement, EntityMetadata, Identifier, InsertStatement,
    PropertyDescriptor, PropertyKind, Result, SemanticType, UpdateStatement, Value,
};
use std::collections::HashSet;

/// Column values of a to-one reference; NULLs when unset.
pub(crate) fn reference_values(reference: Option<&Reference>, width: usize) -> Vec<Value> {
    match reference.and_then(Reference::identifier) {
        Some(id) => id.values().to_vec(),
        None => vec![Value::Null; width],
    }
}

/// Columns and values a property contributes to an insert or update.
fn property_columns(prop: &PropertyDescriptor, value: Option<&PropertyValue>) -> Vec<(String, Value)> {
    match (&prop.kind, value) {
        (PropertyKind::Basic(b), Some(PropertyValue::Basic(v))) => vec![(b.column.clone(), v.clone())],
        (PropertyKind::Basic(b), _) => vec![(b.column.clone(), Value::Null)],
        (PropertyKind::ToOne(t), Some(PropertyValue::Reference(r))) => t
            .columns
            .iter()
            .cloned()
            .zip(reference_values(r.as_ref(), t.columns.len()))
            .collect(),
        (PropertyKind::ToOne(t), _) => t.columns.iter().map(|c| (c.clone(), Value::Null)).collect(),
        (PropertyKind::Collection(_), _) => Vec::new(),
    }
}

fn id_conditions(meta: &EntityMetadata, id: &Identifier) -> Vec<(String, Value)> {
    meta.identifier()
        .columns
        .iter()
        .cloned()
        .zip(id.values().iter().cloned())
        .collect()
}

/// Initial version value for a new row.
pub(crate) fn initial_version(prop: &PropertyDescriptor) -> Value {
    match prop.as_basic().map(|b| b.ty) {
        Some(SemanticType::Integer) => Value::Int(0),
        _ => Value::BigInt(0),
    }
}

/// The version after `current`.
pub(crate) fn next_version(prop: &PropertyDescriptor, current: Option<&Value>) -> Value {
    let next = current.and_then(Value::as_i64).map_or(0, |v| v + 1);
    match prop.as_basic().map(|b| b.ty) {
        Some(SemanticType::Integer) => i32::try_from(next).map_or(Value::BigInt(next), Value::Int),
        _ => Value::BigInt(next),
    }
}

/// INSERT for one instance.
///
/// References in `deferred` slots are written as NULL; the flush sets them
/// with a follow-up update once their targets exist.
pub(crate) fn insert_statement(
    meta: &EntityMetadata,
    data: &EntityData,
    id: &Identifier,
    version: Option<&Value>,
    deferred: &HashSet<usize>,
) -> InsertStatement {
    let mut columns = Vec::new();
    let mut values = Vec::new();
    for (column, value) in id_conditions(meta, id) {
        columns.push(column);
        values.push(value);
    }
    if let (Some(disc), Some(value)) = (meta.discriminator(), meta.discriminator_value()) {
        columns.push(disc.column.clone());
        values.push(value.clone());
    }
    for prop in meta.properties() {
        if !prop.insertable {
            continue;
        }
        let pairs = if prop.version {
            prop.columns()
                .iter()
                .map(|c| (c.clone(), version.cloned().unwrap_or(Value::Null)))
                .collect()
        } else if deferred.contains(&prop.slot) {
            prop.columns().iter().map(|c| (c.clone(), Value::Null)).collect()
        } else {
            property_columns(prop, data.value(prop.slot))
        };
        for (column, value) in pairs {
            columns.push(column);
            values.push(value);
        }
    }
    InsertStatement {
        table: meta.table().to_string(),
        columns,
        values,
    }
}

/// UPDATE of the given properties, guarded by the old version if any.
pub(crate) fn update_statement(
    meta: &EntityMetadata,
    data: &EntityData,
    id: &Identifier,
    properties: &[&PropertyDescriptor],
    version: Option<(&PropertyDescriptor, &Value, &Value)>,
) -> UpdateStatement {
    let mut assignments: Vec<(String, Value)> = properties
        .iter()
        .flat_map(|p| property_columns(p, data.value(p.slot)))
        .collect();
    let mut conditions = id_conditions(meta, id);
    if let Some((prop, old, new)) = version {
        for column in prop.columns() {
            assignments.push((column.clone(), new.clone()));
            conditions.push((column.clone(), old.clone()));
        }
    }
    UpdateStatement {
        table: meta.table().to_string(),
        assignments,
        conditions,
    }
}

/// UPDATE setting the columns of deferred references.
pub(crate) fn deferred_reference_update(
    meta: &EntityMetadata,
    data: &EntityData,
    id: &Identifier,
    slots: &[usize],
) -> UpdateStatement {
    let assignments = slots
        .iter()
        .filter_map(|&slot| meta.properties().get(slot))
        .flat_map(|p| property_columns(p, data.value(p.slot)))
        .collect();
    UpdateStatement {
        table: meta.table().to_string(),
        assignments,
        conditions: id_conditions(meta, id),
    }
}

/// DELETE guarded by the version, if any.
pub(crate) fn delete_statement(
    meta: &EntityMetadata,
    id: &Identifier,
    version: Option<(&PropertyDescriptor, &Value)>,
) -> DeleteStatement {
    let mut conditions = id_conditions(meta, id);
    if let Some((prop, value)) = version {
        for column in prop.columns() {
            conditions.push((column.clone(), value.clone()));
        }
    }
    DeleteStatement {
        table: meta.table().to_string(),
        conditions,
    }
}

/// UPDATE pointing (or un-pointing) an element row's collection key.
pub(crate) fn collection_key_update(
    element: &EntityMetadata,
    element_id: &Identifier,
    key_columns: &[String],
    owner: Option<&Identifier>,
) -> UpdateStatement {
    let assignments = key_columns
        .iter()
        .enumerate()
        .map(|(i, column)| {
            let value = owner
                .and_then(|o| o.values().get(i).cloned())
                .unwrap_or(Value::Null);
            (column.clone(), value)
        })
        .collect();
    UpdateStatement {
        table: element.table().to_string(),
        assignments,
        conditions: id_conditions(element, element_id),
    }
}

/// Disassembled state for the second-level cache.
pub(crate) fn cache_entry(data: &EntityData, version: Option<Value>) -> CacheEntry {
    CacheEntry {
        entity: data.metadata.name().to_string(),
        version,
        state: data
            .values
            .iter()
            .map(|value| match value {
                PropertyValue::Basic(v) => CachedValue::Basic(v.clone()),
                PropertyValue::Reference(r) => {
                    CachedValue::Reference(r.as_ref().and_then(Reference::identifier))
                }
                PropertyValue::Collection(_) => CachedValue::Collection,
            })
            .collect(),
    }
}

/// The identifier's single value, for natural-id and batch restrictions.
pub(crate) fn single_value(id: &Identifier) -> Result<Value> {
    match id {
        Identifier::Simple(v) => Ok(v.clone()),
        Identifier::Composite(_) => Err(hibernia_core::Error::Custom(format!(
            "composite identifier {} where a single value is required",
            id
        ))),
    }
}
