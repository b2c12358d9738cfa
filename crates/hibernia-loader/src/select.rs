//! Rendering load plans into structured selects.
//!
//! [`render_select`] turns a [`LoadPlan`] plus restrictions into one
//! [`SelectStatement`] and a [`ResultMapping`] that tells the result
//! assembler which result column holds which identifier, discriminator and
//! property of every entity node.

use crate::builder::find_in_hierarchy;
use crate::plan::{EntityNode, Fetch, LoadPlan, NodeId, Return};
use hibernia_core::{
    ColumnInfo, ColumnRef, EntityMetadata, Error, Identifier, Join, Metamodel, Predicate,
    PropertyKind, QueryError, QueryErrorKind, Result, SelectStatement, TableRef, Value,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Restricts the rows of the plan's return.
#[derive(Debug, Clone, PartialEq)]
pub enum Restriction {
    /// The return entity with this identifier
    Id(Identifier),
    /// Return entities with any of these identifiers (batch fetch)
    Ids(Vec<Identifier>),
    /// Equality on a basic or single-column to-one property of the return
    Property(String, Value),
    /// Collection elements of this owner
    Owner(Identifier),
    /// Collection elements of any of these owners (batch fetch)
    Owners(Vec<Identifier>),
}

/// Result positions of one entity node.
#[derive(Debug, Clone, Default)]
pub struct EntityColumns {
    pub entity: String,
    pub alias: String,
    pub id: Vec<usize>,
    pub discriminator: Option<usize>,
    /// Positions of each basic and to-one property, by property name
    pub properties: HashMap<String, Vec<usize>>,
}

impl EntityColumns {
    pub fn property(&self, name: &str) -> Option<&[usize]> {
        self.properties.get(name).map(Vec::as_slice)
    }
}

/// Where every node's columns sit in a result row.
#[derive(Debug, Clone, Default)]
pub struct ResultMapping {
    nodes: HashMap<NodeId, EntityColumns>,
    scalars: Vec<(String, usize)>,
    owner_key: Vec<usize>,
}

impl ResultMapping {
    pub fn node(&self, id: NodeId) -> Option<&EntityColumns> {
        self.nodes.get(&id)
    }

    /// Label and position of each scalar return.
    pub fn scalars(&self) -> &[(String, usize)] {
        &self.scalars
    }

    /// Positions of the owner key of a collection return.
    pub fn owner_key(&self) -> &[usize] {
        &self.owner_key
    }

    /// Map the return entity of `plan` onto the labels of a native result.
    ///
    /// Columns are matched by their mapped (unqualified) column names.
    /// Properties whose columns are absent are left out; a missing
    /// identifier column is an error.
    pub fn from_columns(
        metamodel: &Metamodel,
        plan: &LoadPlan,
        columns: &ColumnInfo,
    ) -> Result<Self> {
        let node = plan.entity_return().ok_or_else(|| {
            Error::Query(QueryError::new(
                QueryErrorKind::Unsupported,
                "native queries must return an entity",
            ))
        })?;
        let meta = metamodel.entity(&node.entity)?;
        let lookup = |column: &str| {
            columns
                .index_of(column)
                .or_else(|| columns.names().iter().position(|n| n.eq_ignore_ascii_case(column)))
        };

        let mut mapped = EntityColumns {
            entity: node.entity.clone(),
            alias: node.alias.clone(),
            ..EntityColumns::default()
        };
        for column in &meta.identifier().columns {
            let index = lookup(column).ok_or_else(|| {
                Error::Query(QueryError::new(
                    QueryErrorKind::Database,
                    format!("native result has no identifier column '{}'", column),
                ))
            })?;
            mapped.id.push(index);
        }
        if let Some(disc) = meta.discriminator() {
            mapped.discriminator = lookup(&disc.column);
        }
        for prop in hierarchy_columns(metamodel, meta) {
            let found: Option<Vec<usize>> = prop.1.iter().map(|c| lookup(c)).collect();
            if let Some(positions) = found {
                mapped.properties.insert(prop.0, positions);
            }
        }

        let mut nodes = HashMap::new();
        nodes.insert(node.id, mapped);
        Ok(Self {
            nodes,
            scalars: Vec::new(),
            owner_key: Vec::new(),
        })
    }
}

/// Basic and to-one properties of `meta` and its subtypes with their
/// columns, each property name once.
fn hierarchy_columns(metamodel: &Metamodel, meta: &Arc<EntityMetadata>) -> Vec<(String, Vec<String>)> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for m in metamodel.hierarchy(meta) {
        for prop in m.properties() {
            if matches!(prop.kind, PropertyKind::Collection(_)) {
                continue;
            }
            if seen.insert(prop.name.clone()) {
                out.push((prop.name.clone(), prop.columns().to_vec()));
            }
        }
    }
    out
}

/// Render `plan` as one select with the given restrictions on its return.
#[tracing::instrument(level = "trace", skip_all)]
pub fn render_select(
    metamodel: &Metamodel,
    plan: &LoadPlan,
    restrictions: &[Restriction],
) -> Result<(SelectStatement, ResultMapping)> {
    let mut mapping = ResultMapping::default();

    let select = match plan.returns().first() {
        Some(Return::Entity(node)) => {
            let meta = metamodel.entity(&node.entity)?;
            let mut select = SelectStatement::new(TableRef::new(meta.table(), &node.alias));
            render_node(metamodel, node, &mut select, &mut mapping)?;
            restrict_subtype(metamodel, meta, &node.alias, &mut select);
            for restriction in restrictions {
                apply_entity_restriction(metamodel, meta, &node.alias, restriction, &mut select)?;
            }
            for column in &meta.identifier().columns {
                select.order_by.push(ColumnRef::new(&node.alias, column));
            }
            select
        }
        Some(Return::Collection(coll)) => {
            let meta = metamodel.entity(&coll.element.entity)?;
            let alias = &coll.element.alias;
            let mut select = SelectStatement::new(TableRef::new(meta.table(), alias));
            for column in &coll.key_columns {
                let pos = select.push_column(ColumnRef::new(alias, column));
                mapping.owner_key.push(pos);
            }
            render_node(metamodel, &coll.element, &mut select, &mut mapping)?;
            restrict_subtype(metamodel, meta, alias, &mut select);
            for restriction in restrictions {
                match restriction {
                    Restriction::Owner(owner) => {
                        for (column, value) in coll.key_columns.iter().zip(owner.values()) {
                            select
                                .filters
                                .push(Predicate::Eq(ColumnRef::new(alias, column), value.clone()));
                        }
                    }
                    Restriction::Owners(owners) => {
                        let column = single_column(&coll.key_columns, "batch collection fetch")?;
                        select.filters.push(Predicate::In(
                            ColumnRef::new(alias, column),
                            owners.iter().flat_map(|o| o.values().iter().cloned()).collect(),
                        ));
                    }
                    other => apply_entity_restriction(metamodel, meta, alias, other, &mut select)?,
                }
            }
            for column in coll.key_columns.iter().chain(&meta.identifier().columns) {
                select.order_by.push(ColumnRef::new(alias, column));
            }
            select
        }
        Some(Return::Scalar(first)) => {
            let meta = metamodel.entity(&first.entity)?;
            let alias = "t0";
            let mut select = SelectStatement::new(TableRef::new(meta.table(), alias));
            for scalar in plan.scalar_returns() {
                let prop = find_in_hierarchy(metamodel, meta, &scalar.property)
                    .ok_or_else(|| Error::unknown_property(&scalar.entity, &scalar.property))?;
                let basic = prop
                    .as_basic()
                    .ok_or_else(|| Error::unknown_property(&scalar.entity, &scalar.property))?;
                let pos = select.push_column(ColumnRef::new(alias, &basic.column));
                mapping.scalars.push((scalar.label.clone(), pos));
            }
            restrict_subtype(metamodel, meta, alias, &mut select);
            for restriction in restrictions {
                apply_entity_restriction(metamodel, meta, alias, restriction, &mut select)?;
            }
            select
        }
        None => {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Unsupported,
                "load plan has no returns",
            )));
        }
    };

    tracing::trace!(
        columns = select.columns.len(),
        joins = select.joins.len(),
        "Rendered load plan select"
    );
    Ok((select, mapping))
}

fn render_node(
    metamodel: &Metamodel,
    node: &EntityNode,
    select: &mut SelectStatement,
    mapping: &mut ResultMapping,
) -> Result<()> {
    let meta = metamodel.entity(&node.entity)?;
    let mut columns = EntityColumns {
        entity: node.entity.clone(),
        alias: node.alias.clone(),
        ..EntityColumns::default()
    };
    for column in &meta.identifier().columns {
        columns
            .id
            .push(select.push_column(ColumnRef::new(&node.alias, column)));
    }
    if let Some(disc) = meta.discriminator() {
        columns.discriminator = Some(select.push_column(ColumnRef::new(&node.alias, &disc.column)));
    }
    for (name, cols) in hierarchy_columns(metamodel, meta) {
        let positions = cols
            .iter()
            .map(|c| select.push_column(ColumnRef::new(&node.alias, c)))
            .collect();
        columns.properties.insert(name, positions);
    }
    mapping.nodes.insert(node.id, columns);

    for fetch in &node.fetches {
        let Some(child) = fetch.node() else {
            continue;
        };
        let child_meta = metamodel.entity(&child.entity)?;
        let on = match fetch {
            Fetch::Entity(f) => {
                let owner_prop = find_in_hierarchy(metamodel, meta, &f.property)
                    .ok_or_else(|| Error::unknown_property(&node.entity, &f.property))?;
                child_meta
                    .identifier()
                    .columns
                    .iter()
                    .zip(owner_prop.columns())
                    .map(|(target, fk)| {
                        (ColumnRef::new(&child.alias, target), ColumnRef::new(&node.alias, fk))
                    })
                    .collect()
            }
            Fetch::Collection(f) => {
                let (_, coll) = metamodel.collection(&f.role)?;
                coll.key_columns
                    .iter()
                    .zip(&meta.identifier().columns)
                    .map(|(key, id)| (ColumnRef::new(&child.alias, key), ColumnRef::new(&node.alias, id)))
                    .collect()
            }
            Fetch::Circular(_) => continue,
        };
        select.joins.push(Join {
            table: TableRef::new(child_meta.table(), &child.alias),
            on,
        });
        render_node(metamodel, child, select, mapping)?;
    }
    Ok(())
}

/// A subclass return only matches rows of its own subtree.
fn restrict_subtype(
    metamodel: &Metamodel,
    meta: &Arc<EntityMetadata>,
    alias: &str,
    select: &mut SelectStatement,
) {
    if meta.is_root() {
        return;
    }
    let Some(disc) = meta.discriminator() else {
        return;
    };
    let values = metamodel
        .hierarchy(meta)
        .iter()
        .filter_map(|m| m.discriminator_value().cloned())
        .collect();
    select
        .filters
        .push(Predicate::In(ColumnRef::new(alias, &disc.column), values));
}

fn apply_entity_restriction(
    metamodel: &Metamodel,
    meta: &Arc<EntityMetadata>,
    alias: &str,
    restriction: &Restriction,
    select: &mut SelectStatement,
) -> Result<()> {
    match restriction {
        Restriction::Id(id) => {
            for (column, value) in meta.identifier().columns.iter().zip(id.values()) {
                select
                    .filters
                    .push(Predicate::Eq(ColumnRef::new(alias, column), value.clone()));
            }
        }
        Restriction::Ids(ids) => {
            let column = single_column(&meta.identifier().columns, "batch fetch")?;
            select.filters.push(Predicate::In(
                ColumnRef::new(alias, column),
                ids.iter().flat_map(|id| id.values().iter().cloned()).collect(),
            ));
        }
        Restriction::Property(name, value) => {
            let prop = find_in_hierarchy(metamodel, meta, name)
                .ok_or_else(|| Error::unknown_property(meta.name(), name))?;
            let column = single_column(prop.columns(), "property restriction")?;
            select
                .filters
                .push(Predicate::Eq(ColumnRef::new(alias, column), value.clone()));
        }
        Restriction::Owner(_) | Restriction::Owners(_) => {
            return Err(Error::Query(QueryError::new(
                QueryErrorKind::Unsupported,
                "owner restrictions apply to collection plans only",
            )));
        }
    }
    Ok(())
}

fn single_column<'a>(columns: &'a [String], what: &str) -> Result<&'a String> {
    match columns {
        [only] => Ok(only),
        _ => Err(Error::Query(QueryError::new(
            QueryErrorKind::Unsupported,
            format!("{} needs a single-column key", what),
        ))),
    }
}
