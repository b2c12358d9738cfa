//! The validated, immutable entity metamodel.
//!
//! A [`Metamodel`] is built once from [`EntityMapping`] declarations and then
//! shared read-only (behind `Arc`) by every session of a factory. Building it
//! resolves single-table inheritance, checks association targets and key
//! arity, validates SQL identifiers, and assigns each property a fixed slot
//! so instances can store their state in a plain vector.

use crate::error::{Error, MappingError, Result, TypeError};
use crate::identity::{EntityKey, Identifier};
use crate::mapping::{
    CascadeStyle, EntityMapping, FetchStrategy, IdGenerator, PropertyMapping, PropertyMappingKind,
};
use crate::types::SemanticType;
use crate::value::Value;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

const IDENTIFIER_PATTERN: &str = r"^[A-Za-z_][A-Za-z0-9_]*$";

// ============================================================================
// Property descriptors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicMapping {
    pub column: String,
    pub ty: SemanticType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToOneMapping {
    pub target: String,
    /// FK columns in the owner's table, in target identifier order.
    pub columns: Vec<String>,
    pub one_to_one: bool,
    pub fetch: FetchStrategy,
    pub cascade: CascadeStyle,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionMapping {
    /// `DeclaringEntity.property`
    pub role: String,
    pub owner: String,
    pub element: String,
    /// FK columns in the element's table referencing the owner.
    pub key_columns: Vec<String>,
    pub mapped_by: Option<String>,
    pub fetch: FetchStrategy,
    pub cascade: CascadeStyle,
}

impl CollectionMapping {
    /// Inverse collections never write the key columns themselves.
    pub fn is_inverse(&self) -> bool {
        self.mapped_by.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKind {
    Basic(BasicMapping),
    ToOne(ToOneMapping),
    Collection(CollectionMapping),
}

/// A validated property.
#[derive(Debug, Clone)]
pub struct PropertyDescriptor {
    pub name: String,
    /// Index into an instance's state vector.
    pub slot: usize,
    pub kind: PropertyKind,
    pub nullable: bool,
    pub version: bool,
    pub natural_id: bool,
    pub insertable: bool,
    pub updatable: bool,
    /// Entity that declared the property (an ancestor for inherited ones).
    pub declared_by: String,
}

impl PropertyDescriptor {
    /// Columns this property occupies in its entity's table.
    pub fn columns(&self) -> &[String] {
        match &self.kind {
            PropertyKind::Basic(b) => std::slice::from_ref(&b.column),
            PropertyKind::ToOne(t) => &t.columns,
            PropertyKind::Collection(_) => &[],
        }
    }

    pub fn as_basic(&self) -> Option<&BasicMapping> {
        match &self.kind {
            PropertyKind::Basic(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_to_one(&self) -> Option<&ToOneMapping> {
        match &self.kind {
            PropertyKind::ToOne(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_collection(&self) -> Option<&CollectionMapping> {
        match &self.kind {
            PropertyKind::Collection(c) => Some(c),
            _ => None,
        }
    }

    pub fn is_association(&self) -> bool {
        !matches!(self.kind, PropertyKind::Basic(_))
    }

    /// Type-check and normalize a value assigned to a basic property.
    pub fn check_value(&self, entity: &str, value: Value) -> Result<Value> {
        match &self.kind {
            PropertyKind::Basic(b) => b.ty.coerce(value).map_err(|mut e: TypeError| {
                e.entity = Some(entity.to_string());
                e.property = Some(self.name.clone());
                Error::TypeMismatch(e)
            }),
            _ => Err(Error::TypeMismatch(TypeError {
                expected: "association",
                actual: value.type_name().to_string(),
                entity: Some(entity.to_string()),
                property: Some(self.name.clone()),
            })),
        }
    }
}

// ============================================================================
// Identifier and discriminator
// ============================================================================

#[derive(Debug, Clone)]
pub struct IdentifierDescriptor {
    pub property: String,
    pub columns: Vec<String>,
    pub types: Vec<SemanticType>,
    pub generator: IdGenerator,
}

impl IdentifierDescriptor {
    pub fn is_composite(&self) -> bool {
        self.columns.len() > 1
    }

    /// Check arity and normalize each component to its column type.
    pub fn coerce(&self, entity: &str, id: Identifier) -> Result<Identifier> {
        let values = match id {
            Identifier::Simple(v) => vec![v],
            Identifier::Composite(vs) => vs,
        };
        if values.len() != self.columns.len() {
            return Err(Error::TypeMismatch(TypeError {
                expected: if self.is_composite() {
                    "composite identifier"
                } else {
                    "simple identifier"
                },
                actual: format!("{} identifier value(s)", values.len()),
                entity: Some(entity.to_string()),
                property: Some(self.property.clone()),
            }));
        }
        let mut coerced = Vec::with_capacity(values.len());
        for (value, ty) in values.into_iter().zip(&self.types) {
            if value.is_null() {
                return Err(Error::TypeMismatch(TypeError {
                    expected: ty.sql_name(),
                    actual: "NULL".to_string(),
                    entity: Some(entity.to_string()),
                    property: Some(self.property.clone()),
                }));
            }
            coerced.push(ty.coerce(value).map_err(|mut e| {
                e.entity = Some(entity.to_string());
                e.property = Some(self.property.clone());
                Error::TypeMismatch(e)
            })?);
        }
        if coerced.len() == 1 {
            Ok(Identifier::Simple(coerced.remove(0)))
        } else {
            Ok(Identifier::Composite(coerced))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Discriminator {
    pub column: String,
    pub ty: SemanticType,
}

// ============================================================================
// Entity metadata
// ============================================================================

/// Immutable metadata of one mapped entity type.
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    name: String,
    class_name: String,
    table: String,
    root: String,
    superclass: Option<String>,
    /// Superclass chain, nearest first
    ancestors: Vec<String>,
    subclasses: Vec<String>,
    identifier: IdentifierDescriptor,
    properties: Vec<PropertyDescriptor>,
    slots: HashMap<String, usize>,
    natural_id: Vec<usize>,
    version: Option<usize>,
    discriminator: Option<Discriminator>,
    discriminator_value: Option<Value>,
    proxyable: bool,
    cacheable: bool,
    mutable: bool,
    interfaces: Vec<String>,
}

impl EntityMetadata {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Root of the inheritance hierarchy; identities are keyed by it.
    pub fn root_name(&self) -> &str {
        &self.root
    }

    pub fn is_root(&self) -> bool {
        self.superclass.is_none()
    }

    pub fn superclass(&self) -> Option<&str> {
        self.superclass.as_deref()
    }

    /// Every superclass up to the root, nearest first.
    pub fn ancestors(&self) -> &[String] {
        &self.ancestors
    }

    /// Whether this entity is `name` or descends from it.
    pub fn is_subtype_of(&self, name: &str) -> bool {
        self.name == name || self.ancestors.iter().any(|a| a == name)
    }

    /// All descendants, nearest first.
    pub fn subclasses(&self) -> &[String] {
        &self.subclasses
    }

    pub fn has_subclasses(&self) -> bool {
        !self.subclasses.is_empty()
    }

    pub fn identifier(&self) -> &IdentifierDescriptor {
        &self.identifier
    }

    pub fn properties(&self) -> &[PropertyDescriptor] {
        &self.properties
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    pub fn find_property(&self, name: &str) -> Option<&PropertyDescriptor> {
        self.slots.get(name).map(|&slot| &self.properties[slot])
    }

    pub fn property(&self, name: &str) -> Result<&PropertyDescriptor> {
        self.find_property(name)
            .ok_or_else(|| Error::unknown_property(&self.name, name))
    }

    pub fn slot_of(&self, name: &str) -> Result<usize> {
        self.property(name).map(|p| p.slot)
    }

    pub fn natural_id_slots(&self) -> &[usize] {
        &self.natural_id
    }

    pub fn version_property(&self) -> Option<&PropertyDescriptor> {
        self.version.map(|slot| &self.properties[slot])
    }

    pub fn discriminator(&self) -> Option<&Discriminator> {
        self.discriminator.as_ref()
    }

    pub fn discriminator_value(&self) -> Option<&Value> {
        self.discriminator_value.as_ref()
    }

    pub fn is_proxyable(&self) -> bool {
        self.proxyable
    }

    pub fn is_cacheable(&self) -> bool {
        self.cacheable
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable
    }

    pub fn interfaces(&self) -> &[String] {
        &self.interfaces
    }

    /// Session identity of the row with this identifier.
    pub fn key(&self, id: Identifier) -> EntityKey {
        EntityKey::new(&self.root, id)
    }

    /// Whether `name` is this entity or one of its descendants.
    pub fn is_same_or_supertype_of(&self, name: &str) -> bool {
        self.name == name || self.subclasses.iter().any(|s| s == name)
    }
}

// ============================================================================
// Metamodel
// ============================================================================

/// Every entity of a persistence unit, validated and cross-linked.
#[derive(Debug, Default)]
pub struct Metamodel {
    entities: HashMap<String, Arc<EntityMetadata>>,
    collections: HashMap<String, (String, usize)>,
    discriminators: HashMap<(String, Value), String>,
}

impl Metamodel {
    pub fn builder() -> MetamodelBuilder {
        MetamodelBuilder::default()
    }

    pub fn entity(&self, name: &str) -> Result<&Arc<EntityMetadata>> {
        self.entities
            .get(name)
            .ok_or_else(|| Error::UnknownEntity(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMetadata>> {
        self.entities.values()
    }

    /// Owner metadata and mapping of a collection role.
    pub fn collection(&self, role: &str) -> Result<(&Arc<EntityMetadata>, &CollectionMapping)> {
        let (owner, slot) = self
            .collections
            .get(role)
            .ok_or_else(|| Error::UnknownEntity(role.to_string()))?;
        let meta = self.entity(owner)?;
        let mapping = meta.properties[*slot]
            .as_collection()
            .ok_or_else(|| Error::mapping(owner, format!("{} is not a collection", role)))?;
        Ok((meta, mapping))
    }

    /// `meta` and all of its descendants.
    pub fn hierarchy(&self, meta: &Arc<EntityMetadata>) -> Vec<Arc<EntityMetadata>> {
        let mut out = vec![Arc::clone(meta)];
        out.extend(
            meta.subclasses
                .iter()
                .filter_map(|name| self.entities.get(name).cloned()),
        );
        out
    }

    /// Concrete subtype of `meta` identified by a discriminator value.
    pub fn resolve_subtype(
        &self,
        meta: &Arc<EntityMetadata>,
        value: &Value,
    ) -> Result<Arc<EntityMetadata>> {
        let Some(disc) = meta.discriminator() else {
            return Ok(Arc::clone(meta));
        };
        let unknown = || Error::UnknownEntityType {
            entity: meta.name.clone(),
            discriminator: value.to_string(),
        };
        let normalized = disc.ty.coerce(value.clone()).map_err(|_| unknown())?;
        let name = self
            .discriminators
            .get(&(meta.root.clone(), normalized))
            .ok_or_else(unknown)?;
        if !meta.is_same_or_supertype_of(name) {
            return Err(unknown());
        }
        self.entity(name).cloned()
    }
}

/// Collects mappings and builds a [`Metamodel`].
#[derive(Debug, Default)]
pub struct MetamodelBuilder {
    mappings: Vec<EntityMapping>,
}

impl MetamodelBuilder {
    pub fn entity(mut self, mapping: EntityMapping) -> Self {
        self.mappings.push(mapping);
        self
    }

    pub fn build(self) -> Result<Metamodel> {
        let ident = Regex::new(IDENTIFIER_PATTERN).map_err(|e| Error::Custom(e.to_string()))?;

        let mut by_name: HashMap<&str, &EntityMapping> = HashMap::new();
        for mapping in &self.mappings {
            check_ident(&ident, &mapping.name, &mapping.name, None)?;
            if by_name.insert(mapping.name.as_str(), mapping).is_some() {
                return Err(Error::mapping(&mapping.name, "entity mapped twice"));
            }
        }

        let order = inheritance_order(&self.mappings, &by_name)?;
        let mut built: HashMap<String, EntityMetadata> = HashMap::new();
        for name in &order {
            let mapping = by_name[name.as_str()];
            let meta = match &mapping.extends {
                None => build_root(mapping, &ident)?,
                Some(parent) => {
                    let parent = built
                        .get(parent)
                        .ok_or_else(|| Error::mapping(&mapping.name, "superclass not mapped"))?;
                    build_subclass(mapping, parent, &ident)?
                }
            };
            built.insert(name.clone(), meta);
        }

        for name in &order {
            let mut ancestor = built.get(name).and_then(|m| m.superclass.clone());
            while let Some(parent) = ancestor {
                let entry = built
                    .get_mut(&parent)
                    .ok_or_else(|| Error::UnknownEntity(parent.clone()))?;
                entry.subclasses.push(name.clone());
                ancestor = entry.superclass.clone();
            }
        }

        resolve_associations(&mut built, &ident)?;

        let mut discriminators = HashMap::new();
        let mut collections = HashMap::new();
        for meta in built.values() {
            if let (Some(disc), Some(value)) = (&meta.discriminator, &meta.discriminator_value) {
                let value = disc
                    .ty
                    .coerce(value.clone())
                    .map_err(|e| Error::mapping(&meta.name, format!("discriminator value: {}", e)))?;
                let previous = discriminators.insert((meta.root.clone(), value), meta.name.clone());
                if let Some(previous) = previous {
                    return Err(Error::mapping(
                        &meta.name,
                        format!("discriminator value already used by {}", previous),
                    ));
                }
            }
            for prop in &meta.properties {
                if let PropertyKind::Collection(c) = &prop.kind {
                    if prop.declared_by == meta.name {
                        collections.insert(c.role.clone(), (meta.name.clone(), prop.slot));
                    }
                }
            }
        }

        tracing::debug!(
            entities = built.len(),
            collections = collections.len(),
            "Metamodel built"
        );

        Ok(Metamodel {
            entities: built
                .into_iter()
                .map(|(name, meta)| (name, Arc::new(meta)))
                .collect(),
            collections,
            discriminators,
        })
    }
}

// ============================================================================
// Build helpers
// ============================================================================

fn check_ident(ident: &Regex, name: &str, entity: &str, property: Option<&str>) -> Result<()> {
    if ident.is_match(name) {
        Ok(())
    } else {
        Err(Error::Mapping(MappingError {
            entity: Some(entity.to_string()),
            property: property.map(str::to_string),
            message: format!("'{}' is not a valid identifier", name),
        }))
    }
}

/// `InvoiceLine` -> `invoice_line`
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                out.push('_');
            }
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}

/// Mapping names ordered so superclasses precede subclasses.
fn inheritance_order(
    mappings: &[EntityMapping],
    by_name: &HashMap<&str, &EntityMapping>,
) -> Result<Vec<String>> {
    let mut order = Vec::with_capacity(mappings.len());
    let mut done: HashSet<&str> = HashSet::new();
    for mapping in mappings {
        let mut chain = Vec::new();
        let mut on_chain: HashSet<&str> = HashSet::new();
        let mut current = Some(mapping);
        while let Some(m) = current {
            if done.contains(m.name.as_str()) {
                break;
            }
            if !on_chain.insert(m.name.as_str()) {
                return Err(Error::mapping(&m.name, "inheritance cycle"));
            }
            chain.push(m.name.as_str());
            current = match &m.extends {
                Some(parent) => Some(
                    *by_name
                        .get(parent.as_str())
                        .ok_or_else(|| Error::mapping(&m.name, format!("unknown superclass {}", parent)))?,
                ),
                None => None,
            };
        }
        for name in chain.into_iter().rev() {
            done.insert(name);
            order.push(name.to_string());
        }
    }
    Ok(order)
}

fn build_root(mapping: &EntityMapping, ident: &Regex) -> Result<EntityMetadata> {
    let table = mapping
        .table
        .clone()
        .unwrap_or_else(|| snake_case(&mapping.name));
    check_ident(ident, &table, &mapping.name, None)?;

    let id = mapping
        .id
        .as_ref()
        .ok_or_else(|| Error::mapping(&mapping.name, "no identifier mapped"))?;
    if id.columns.is_empty() {
        return Err(Error::mapping(&mapping.name, "identifier has no columns"));
    }
    for (column, _) in &id.columns {
        check_ident(ident, column, &mapping.name, Some(&id.property))?;
    }
    if id.columns.len() > 1 && id.generator != IdGenerator::Assigned {
        return Err(Error::mapping(
            &mapping.name,
            "composite identifiers must be assigned",
        ));
    }
    let identifier = IdentifierDescriptor {
        property: id.property.clone(),
        columns: id.columns.iter().map(|(c, _)| c.clone()).collect(),
        types: id.columns.iter().map(|(_, t)| *t).collect(),
        generator: id.generator,
    };

    let discriminator = match &mapping.discriminator_column {
        Some((column, ty)) => {
            check_ident(ident, column, &mapping.name, None)?;
            Some(Discriminator {
                column: column.clone(),
                ty: *ty,
            })
        }
        None => None,
    };
    let discriminator_value = discriminator.as_ref().map(|_| {
        mapping
            .discriminator_value
            .clone()
            .unwrap_or_else(|| Value::Text(mapping.name.clone()))
    });

    let mut meta = EntityMetadata {
        name: mapping.name.clone(),
        class_name: mapping
            .class_name
            .clone()
            .unwrap_or_else(|| mapping.name.clone()),
        table,
        root: mapping.name.clone(),
        superclass: None,
        ancestors: Vec::new(),
        subclasses: Vec::new(),
        identifier,
        properties: Vec::new(),
        slots: HashMap::new(),
        natural_id: Vec::new(),
        version: None,
        discriminator,
        discriminator_value,
        proxyable: mapping.proxyable,
        cacheable: mapping.cacheable,
        mutable: mapping.mutable,
        interfaces: mapping.interfaces.clone(),
    };
    add_properties(&mut meta, mapping, ident)?;
    Ok(meta)
}

fn build_subclass(
    mapping: &EntityMapping,
    parent: &EntityMetadata,
    ident: &Regex,
) -> Result<EntityMetadata> {
    if mapping.id.is_some() {
        return Err(Error::mapping(
            &mapping.name,
            "subclasses inherit the root identifier",
        ));
    }
    if let Some(table) = &mapping.table {
        if table != &parent.table {
            return Err(Error::mapping(
                &mapping.name,
                "subclasses share the hierarchy table",
            ));
        }
    }
    let discriminator = parent.discriminator.clone().ok_or_else(|| {
        Error::mapping(
            &mapping.name,
            format!("superclass {} declares no discriminator", parent.name),
        )
    })?;

    let mut interfaces = parent.interfaces.clone();
    interfaces.extend(mapping.interfaces.iter().cloned());

    let mut meta = EntityMetadata {
        name: mapping.name.clone(),
        class_name: mapping
            .class_name
            .clone()
            .unwrap_or_else(|| mapping.name.clone()),
        table: parent.table.clone(),
        root: parent.root.clone(),
        superclass: Some(parent.name.clone()),
        ancestors: std::iter::once(parent.name.clone())
            .chain(parent.ancestors.iter().cloned())
            .collect(),
        subclasses: Vec::new(),
        identifier: parent.identifier.clone(),
        properties: parent.properties.clone(),
        slots: parent.slots.clone(),
        natural_id: parent.natural_id.clone(),
        version: parent.version,
        discriminator: Some(discriminator),
        discriminator_value: Some(
            mapping
                .discriminator_value
                .clone()
                .unwrap_or_else(|| Value::Text(mapping.name.clone())),
        ),
        proxyable: mapping.proxyable,
        cacheable: parent.cacheable,
        mutable: mapping.mutable,
        interfaces,
    };
    add_properties(&mut meta, mapping, ident)?;
    Ok(meta)
}

fn add_properties(meta: &mut EntityMetadata, mapping: &EntityMapping, ident: &Regex) -> Result<()> {
    for prop in &mapping.properties {
        if meta.slots.contains_key(&prop.name) || prop.name == meta.identifier.property {
            return Err(Error::Mapping(MappingError {
                entity: Some(meta.name.clone()),
                property: Some(prop.name.clone()),
                message: "property mapped twice in hierarchy".to_string(),
            }));
        }
        let slot = meta.properties.len();
        let descriptor = describe_property(&meta.name, prop, slot, ident)?;
        if descriptor.version {
            if meta.version.is_some() {
                return Err(Error::mapping(&meta.name, "more than one version property"));
            }
            meta.version = Some(slot);
        }
        if descriptor.natural_id {
            meta.natural_id.push(slot);
        }
        meta.slots.insert(prop.name.clone(), slot);
        meta.properties.push(descriptor);
    }
    Ok(())
}

fn describe_property(
    entity: &str,
    prop: &PropertyMapping,
    slot: usize,
    ident: &Regex,
) -> Result<PropertyDescriptor> {
    let fail = |message: &str| {
        Error::Mapping(MappingError {
            entity: Some(entity.to_string()),
            property: Some(prop.name.clone()),
            message: message.to_string(),
        })
    };
    check_ident(ident, &prop.name, entity, Some(&prop.name))?;
    let cascade = match &prop.cascade {
        Some(list) => CascadeStyle::parse(list).map_err(|e| match e {
            Error::Mapping(mut m) => {
                m.entity = Some(entity.to_string());
                m.property = Some(prop.name.clone());
                Error::Mapping(m)
            }
            other => other,
        })?,
        None => CascadeStyle::NONE,
    };

    let kind = match &prop.kind {
        PropertyMappingKind::Basic { column, ty } => {
            check_ident(ident, column, entity, Some(&prop.name))?;
            if prop.version && !matches!(ty, SemanticType::Integer | SemanticType::Long) {
                return Err(fail("version property must be an integer"));
            }
            PropertyKind::Basic(BasicMapping {
                column: column.clone(),
                ty: *ty,
            })
        }
        PropertyMappingKind::ToOne {
            target,
            columns,
            one_to_one,
        } => {
            if columns.is_empty() {
                return Err(fail("association has no foreign key columns"));
            }
            for column in columns {
                check_ident(ident, column, entity, Some(&prop.name))?;
            }
            PropertyKind::ToOne(ToOneMapping {
                target: target.clone(),
                columns: columns.clone(),
                one_to_one: *one_to_one,
                fetch: prop.fetch.unwrap_or(FetchStrategy::JOIN),
                cascade,
            })
        }
        PropertyMappingKind::OneToMany {
            element,
            key_columns,
            mapped_by,
        } => {
            if prop.natural_id {
                return Err(fail("collections cannot be part of a natural id"));
            }
            for column in key_columns {
                check_ident(ident, column, entity, Some(&prop.name))?;
            }
            PropertyKind::Collection(CollectionMapping {
                role: format!("{}.{}", entity, prop.name),
                owner: entity.to_string(),
                element: element.clone(),
                key_columns: key_columns.clone(),
                mapped_by: mapped_by.clone(),
                fetch: prop.fetch.unwrap_or(FetchStrategy::LAZY),
                cascade,
            })
        }
    };
    if prop.version && !matches!(kind, PropertyKind::Basic(_)) {
        return Err(fail("version property must be basic"));
    }

    Ok(PropertyDescriptor {
        name: prop.name.clone(),
        slot,
        kind,
        nullable: prop.nullable,
        version: prop.version,
        natural_id: prop.natural_id,
        insertable: prop.insertable,
        updatable: prop.updatable && !prop.natural_id,
        declared_by: entity.to_string(),
    })
}

/// Check association targets and fill in inverse collection key columns.
fn resolve_associations(built: &mut HashMap<String, EntityMetadata>, ident: &Regex) -> Result<()> {
    let mut updates: Vec<(String, usize, Vec<String>)> = Vec::new();

    for meta in built.values() {
        for prop in &meta.properties {
            let fail = |message: String| {
                Error::Mapping(MappingError {
                    entity: Some(meta.name.clone()),
                    property: Some(prop.name.clone()),
                    message,
                })
            };
            match &prop.kind {
                PropertyKind::Basic(_) => {}
                PropertyKind::ToOne(to_one) => {
                    let target = built
                        .get(&to_one.target)
                        .ok_or_else(|| fail(format!("unknown target entity {}", to_one.target)))?;
                    if target.identifier.columns.len() != to_one.columns.len() {
                        return Err(fail(format!(
                            "{} foreign key column(s) for a {}-column identifier",
                            to_one.columns.len(),
                            target.identifier.columns.len()
                        )));
                    }
                }
                PropertyKind::Collection(coll) => {
                    let element = built
                        .get(&coll.element)
                        .ok_or_else(|| fail(format!("unknown element entity {}", coll.element)))?;
                    let owner_id_len = meta.identifier.columns.len();
                    let key_columns = if let Some(mapped_by) = &coll.mapped_by {
                        let back = element
                            .find_property(mapped_by)
                            .and_then(PropertyDescriptor::as_to_one)
                            .ok_or_else(|| {
                                fail(format!("{}.{} is not a to-one association", element.name, mapped_by))
                            })?;
                        let back_target = built
                            .get(&back.target)
                            .ok_or_else(|| fail(format!("unknown target entity {}", back.target)))?;
                        if back_target.root != meta.root {
                            return Err(fail(format!(
                                "{}.{} does not reference {}",
                                element.name, mapped_by, meta.name
                            )));
                        }
                        if !coll.key_columns.is_empty() && coll.key_columns != back.columns {
                            return Err(fail("key columns differ from the owning side".to_string()));
                        }
                        back.columns.clone()
                    } else if coll.key_columns.is_empty() {
                        if owner_id_len != 1 {
                            return Err(fail("composite owners need explicit key columns".to_string()));
                        }
                        vec![format!("{}_id", snake_case(&coll.owner))]
                    } else {
                        coll.key_columns.clone()
                    };
                    if key_columns.len() != owner_id_len {
                        return Err(fail(format!(
                            "{} key column(s) for a {}-column owner identifier",
                            key_columns.len(),
                            owner_id_len
                        )));
                    }
                    for column in &key_columns {
                        check_ident(ident, column, &meta.name, Some(&prop.name))?;
                    }
                    updates.push((meta.name.clone(), prop.slot, key_columns));
                }
            }
        }
    }

    for (entity, slot, key_columns) in updates {
        if let Some(meta) = built.get_mut(&entity) {
            if let PropertyKind::Collection(coll) = &mut meta.properties[slot].kind {
                coll.key_columns = key_columns;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::IdentifierMapping;

    fn billing_model() -> Metamodel {
        Metamodel::builder()
            .entity(
                EntityMapping::new("User")
                    .table("users")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .property(PropertyMapping::basic("username", SemanticType::Text).natural_id())
                    .property(
                        PropertyMapping::one_to_many("billingDetails", "BillingDetails")
                            .mapped_by("owner"),
                    ),
            )
            .entity(
                EntityMapping::new("BillingDetails")
                    .table("billing_details")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .discriminator("kind", SemanticType::Text)
                    .discriminator_value("BD")
                    .property(PropertyMapping::basic("owner_name", SemanticType::Text))
                    .property(PropertyMapping::many_to_one("owner", "User").not_null()),
            )
            .entity(
                EntityMapping::new("CreditCard")
                    .extends("BillingDetails")
                    .discriminator_value("CC")
                    .property(PropertyMapping::basic("number", SemanticType::Text)),
            )
            .entity(
                EntityMapping::new("BankAccount")
                    .extends("BillingDetails")
                    .discriminator_value("BA")
                    .property(PropertyMapping::basic("iban", SemanticType::Text)),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn subclasses_inherit_table_identifier_and_slots() {
        let model = billing_model();
        let card = model.entity("CreditCard").unwrap();
        assert_eq!(card.table(), "billing_details");
        assert_eq!(card.root_name(), "BillingDetails");
        assert_eq!(card.slot_of("owner_name").unwrap(), 0);
        assert_eq!(card.slot_of("owner").unwrap(), 1);
        assert_eq!(card.slot_of("number").unwrap(), 2);
        assert!(card.find_property("iban").is_none());
        assert!(card.is_subtype_of("BillingDetails"));
        assert!(!card.is_subtype_of("BankAccount"));

        let root = model.entity("BillingDetails").unwrap();
        assert_eq!(root.subclasses().len(), 2);
        assert_eq!(model.hierarchy(root).len(), 3);
    }

    #[test]
    fn discriminator_resolution() {
        let model = billing_model();
        let root = model.entity("BillingDetails").unwrap();
        let card = model
            .resolve_subtype(root, &Value::Text("CC".into()))
            .unwrap();
        assert_eq!(card.name(), "CreditCard");

        let err = model
            .resolve_subtype(root, &Value::Text("XX".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::UnknownEntityType { ref entity, ref discriminator }
                if entity == "BillingDetails" && discriminator == "'XX'"
        ));

        let account = model.entity("BankAccount").unwrap();
        assert!(model
            .resolve_subtype(account, &Value::Text("CC".into()))
            .is_err());
    }

    #[test]
    fn inverse_collection_takes_owning_side_columns() {
        let model = billing_model();
        let (owner, coll) = model.collection("User.billingDetails").unwrap();
        assert_eq!(owner.name(), "User");
        assert!(coll.is_inverse());
        assert_eq!(coll.key_columns, vec!["owner_id".to_string()]);
    }

    #[test]
    fn natural_id_is_not_updatable() {
        let model = billing_model();
        let user = model.entity("User").unwrap();
        assert_eq!(user.natural_id_slots(), &[0]);
        assert!(!user.property("username").unwrap().updatable);
    }

    #[test]
    fn unknown_target_is_rejected() {
        let result = Metamodel::builder()
            .entity(
                EntityMapping::new("Bid")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .property(PropertyMapping::many_to_one("item", "Item")),
            )
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn invalid_column_name_is_rejected() {
        let result = Metamodel::builder()
            .entity(
                EntityMapping::new("Item")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .property(PropertyMapping::basic("name", SemanticType::Text).column("name; drop")),
            )
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn inheritance_cycle_is_rejected() {
        let result = Metamodel::builder()
            .entity(EntityMapping::new("A").extends("B"))
            .entity(EntityMapping::new("B").extends("A"))
            .build();
        assert!(matches!(result, Err(Error::Mapping(_))));
    }

    #[test]
    fn default_table_and_key_names() {
        let model = Metamodel::builder()
            .entity(
                EntityMapping::new("InvoiceLine")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long)),
            )
            .entity(
                EntityMapping::new("Invoice")
                    .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
                    .property(PropertyMapping::one_to_many("lines", "InvoiceLine")),
            )
            .build()
            .unwrap();
        assert_eq!(model.entity("InvoiceLine").unwrap().table(), "invoice_line");
        let (_, coll) = model.collection("Invoice.lines").unwrap();
        assert_eq!(coll.key_columns, vec!["invoice_id".to_string()]);
        assert!(!coll.is_inverse());
    }

    #[test]
    fn identifier_coercion_checks_arity() {
        let model = billing_model();
        let user = model.entity("User").unwrap();
        let id = user
            .identifier()
            .coerce("User", Identifier::from(5_i32))
            .unwrap();
        assert_eq!(id, Identifier::from(5_i64));
        assert!(user
            .identifier()
            .coerce("User", Identifier::Composite(vec![Value::BigInt(1), Value::BigInt(2)]))
            .is_err());
        assert!(user
            .identifier()
            .coerce("User", Identifier::Simple(Value::Null))
            .is_err());
    }
}
