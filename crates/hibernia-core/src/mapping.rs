//! Mapping declarations consumed by the metamodel builder.
//!
//! These types are the interface to whatever loads mapping metadata
//! (annotations, XML, code). They are deliberately loose: names are
//! resolved and validated only when the [`Metamodel`](crate::Metamodel) is
//! built.
//!
//! # Example
//!
//! ```ignore
//! let invoice = EntityMapping::new("Invoice")
//!     .table("invoices")
//!     .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
//!     .property(PropertyMapping::basic("number", SemanticType::Text).not_null())
//!     .property(PropertyMapping::many_to_one("customer", "Customer").lazy())
//!     .property(
//!         PropertyMapping::one_to_many("lines", "InvoiceLine")
//!             .mapped_by("invoice")
//!             .cascade("all"),
//!     );
//! ```

use crate::error::{Error, Result};
use crate::types::SemanticType;
use crate::value::Value;
use serde::{Deserialize, Serialize};

// ============================================================================
// Fetch strategy
// ============================================================================

/// When an association is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchTiming {
    /// Loaded together with its owner
    Immediate,
    /// Loaded on first access
    Delayed,
}

/// How an association is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FetchStyle {
    /// Outer join in the owner's select
    Join,
    /// Separate select
    Select,
}

/// Mapping-declared fetch strategy of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FetchStrategy {
    pub timing: FetchTiming,
    pub style: FetchStyle,
}

impl FetchStrategy {
    /// Eager, joined.
    pub const JOIN: Self = Self {
        timing: FetchTiming::Immediate,
        style: FetchStyle::Join,
    };
    /// Eager, by subsequent select.
    pub const SELECT: Self = Self {
        timing: FetchTiming::Immediate,
        style: FetchStyle::Select,
    };
    /// Lazy: proxy or uninitialized collection.
    pub const LAZY: Self = Self {
        timing: FetchTiming::Delayed,
        style: FetchStyle::Select,
    };

    pub const fn is_lazy(&self) -> bool {
        matches!(self.timing, FetchTiming::Delayed)
    }
}

// ============================================================================
// Cascade style
// ============================================================================

/// Which entity operations propagate across an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CascadeStyle {
    pub persist: bool,
    pub merge: bool,
    pub remove: bool,
    pub refresh: bool,
    pub evict: bool,
}

impl CascadeStyle {
    pub const NONE: Self = Self {
        persist: false,
        merge: false,
        remove: false,
        refresh: false,
        evict: false,
    };

    pub const ALL: Self = Self {
        persist: true,
        merge: true,
        remove: true,
        refresh: true,
        evict: true,
    };

    /// Parse a comma separated cascade list such as `"persist,merge"`.
    ///
    /// Accepts `all`, `none`, `persist` (alias `save-update`), `merge`,
    /// `remove` (alias `delete`), `refresh`, and `evict` (alias `detach`).
    pub fn parse(list: &str) -> Result<Self> {
        let mut style = Self::NONE;
        for token in list.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token.to_ascii_lowercase().as_str() {
                "all" => style = Self::ALL,
                "none" => {}
                "persist" | "save-update" => style.persist = true,
                "merge" => style.merge = true,
                "remove" | "delete" => style.remove = true,
                "refresh" => style.refresh = true,
                "evict" | "detach" => style.evict = true,
                other => {
                    return Err(Error::Mapping(crate::error::MappingError {
                        entity: None,
                        property: None,
                        message: format!("unknown cascade style '{}'", other),
                    }));
                }
            }
        }
        Ok(style)
    }

    pub const fn is_none(&self) -> bool {
        !(self.persist || self.merge || self.remove || self.refresh || self.evict)
    }
}

// ============================================================================
// Identifier mapping
// ============================================================================

/// How identifiers are assigned to new entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdGenerator {
    /// The application sets the identifier before `persist`
    #[default]
    Assigned,
    /// Process-wide counter per root entity, seeded from the highest
    /// identifier the factory has observed
    Increment,
}

/// Identifier declaration.
#[derive(Debug, Clone)]
pub struct IdentifierMapping {
    pub property: String,
    pub columns: Vec<(String, SemanticType)>,
    pub generator: IdGenerator,
}

impl IdentifierMapping {
    /// Single-column identifier.
    pub fn simple(property: impl Into<String>, column: impl Into<String>, ty: SemanticType) -> Self {
        Self {
            property: property.into(),
            columns: vec![(column.into(), ty)],
            generator: IdGenerator::Assigned,
        }
    }

    /// Multi-column identifier.
    pub fn composite<C: Into<String>>(
        property: impl Into<String>,
        columns: impl IntoIterator<Item = (C, SemanticType)>,
    ) -> Self {
        Self {
            property: property.into(),
            columns: columns.into_iter().map(|(c, t)| (c.into(), t)).collect(),
            generator: IdGenerator::Assigned,
        }
    }

    pub fn generator(mut self, generator: IdGenerator) -> Self {
        self.generator = generator;
        self
    }
}

// ============================================================================
// Property mapping
// ============================================================================

/// The shape of a mapped property.
#[derive(Debug, Clone)]
pub enum PropertyMappingKind {
    Basic {
        column: String,
        ty: SemanticType,
    },
    ToOne {
        target: String,
        columns: Vec<String>,
        one_to_one: bool,
    },
    OneToMany {
        element: String,
        key_columns: Vec<String>,
        mapped_by: Option<String>,
    },
}

/// One property declaration.
#[derive(Debug, Clone)]
pub struct PropertyMapping {
    pub name: String,
    pub kind: PropertyMappingKind,
    pub nullable: bool,
    pub version: bool,
    pub natural_id: bool,
    pub insertable: bool,
    pub updatable: bool,
    pub fetch: Option<FetchStrategy>,
    pub cascade: Option<String>,
}

impl PropertyMapping {
    fn with_kind(name: String, kind: PropertyMappingKind) -> Self {
        Self {
            name,
            kind,
            nullable: true,
            version: false,
            natural_id: false,
            insertable: true,
            updatable: true,
            fetch: None,
            cascade: None,
        }
    }

    /// A basic property stored in a column of the same name.
    pub fn basic(name: impl Into<String>, ty: SemanticType) -> Self {
        let name = name.into();
        let column = name.clone();
        Self::with_kind(name, PropertyMappingKind::Basic { column, ty })
    }

    /// A many-to-one association with foreign key column `<name>_id`.
    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let name = name.into();
        let columns = vec![format!("{}_id", name)];
        Self::with_kind(
            name,
            PropertyMappingKind::ToOne {
                target: target.into(),
                columns,
                one_to_one: false,
            },
        )
    }

    /// A one-to-one association owning its foreign key column `<name>_id`.
    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        let mut mapping = Self::many_to_one(name, target);
        if let PropertyMappingKind::ToOne { one_to_one, .. } = &mut mapping.kind {
            *one_to_one = true;
        }
        mapping
    }

    /// A one-to-many collection keyed by a foreign key in the element table.
    pub fn one_to_many(name: impl Into<String>, element: impl Into<String>) -> Self {
        Self::with_kind(
            name.into(),
            PropertyMappingKind::OneToMany {
                element: element.into(),
                key_columns: Vec::new(),
                mapped_by: None,
            },
        )
    }

    /// Set the column of a basic property or the single FK column of a to-one.
    pub fn column(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        match &mut self.kind {
            PropertyMappingKind::Basic { column, .. } => *column = name,
            PropertyMappingKind::ToOne { columns, .. } => *columns = vec![name],
            PropertyMappingKind::OneToMany { key_columns, .. } => *key_columns = vec![name],
        }
        self
    }

    /// Set the FK columns of a to-one or the key columns of a collection.
    pub fn columns<C: Into<String>>(mut self, names: impl IntoIterator<Item = C>) -> Self {
        let names: Vec<String> = names.into_iter().map(Into::into).collect();
        match &mut self.kind {
            PropertyMappingKind::Basic { column, .. } => {
                if let Some(first) = names.into_iter().next() {
                    *column = first;
                }
            }
            PropertyMappingKind::ToOne { columns, .. } => *columns = names,
            PropertyMappingKind::OneToMany { key_columns, .. } => *key_columns = names,
        }
        self
    }

    /// Set the element-table key column of a collection.
    pub fn key_column(self, name: impl Into<String>) -> Self {
        self.column(name)
    }

    /// Make a collection the inverse side of `property` on the element.
    pub fn mapped_by(mut self, property: impl Into<String>) -> Self {
        if let PropertyMappingKind::OneToMany { mapped_by, .. } = &mut self.kind {
            *mapped_by = Some(property.into());
        }
        self
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    /// Mark as the optimistic-lock version property.
    pub fn version(mut self) -> Self {
        self.version = true;
        self.nullable = false;
        self
    }

    pub fn natural_id(mut self) -> Self {
        self.natural_id = true;
        self
    }

    pub fn insertable(mut self, value: bool) -> Self {
        self.insertable = value;
        self
    }

    pub fn updatable(mut self, value: bool) -> Self {
        self.updatable = value;
        self
    }

    pub fn fetch(mut self, strategy: FetchStrategy) -> Self {
        self.fetch = Some(strategy);
        self
    }

    pub fn lazy(self) -> Self {
        self.fetch(FetchStrategy::LAZY)
    }

    pub fn eager(self) -> Self {
        self.fetch(FetchStrategy::JOIN)
    }

    /// Cascade list, parsed when the metamodel is built.
    pub fn cascade(mut self, list: impl Into<String>) -> Self {
        self.cascade = Some(list.into());
        self
    }
}

// ============================================================================
// Entity mapping
// ============================================================================

/// One entity declaration.
#[derive(Debug, Clone)]
pub struct EntityMapping {
    pub name: String,
    pub class_name: Option<String>,
    pub table: Option<String>,
    pub id: Option<IdentifierMapping>,
    pub properties: Vec<PropertyMapping>,
    pub extends: Option<String>,
    pub discriminator_column: Option<(String, SemanticType)>,
    pub discriminator_value: Option<Value>,
    pub proxyable: bool,
    pub cacheable: bool,
    pub mutable: bool,
    pub interfaces: Vec<String>,
}

impl EntityMapping {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            class_name: None,
            table: None,
            id: None,
            properties: Vec::new(),
            extends: None,
            discriminator_column: None,
            discriminator_value: None,
            proxyable: true,
            cacheable: false,
            mutable: true,
            interfaces: Vec::new(),
        }
    }

    /// Declaring class token recorded on proxies; defaults to the entity name.
    pub fn class_name(mut self, name: impl Into<String>) -> Self {
        self.class_name = Some(name.into());
        self
    }

    pub fn table(mut self, name: impl Into<String>) -> Self {
        self.table = Some(name.into());
        self
    }

    pub fn id(mut self, id: IdentifierMapping) -> Self {
        self.id = Some(id);
        self
    }

    pub fn property(mut self, property: PropertyMapping) -> Self {
        self.properties.push(property);
        self
    }

    /// Single-table subclass of `superclass`.
    pub fn extends(mut self, superclass: impl Into<String>) -> Self {
        self.extends = Some(superclass.into());
        self
    }

    /// Discriminator column of a hierarchy root.
    pub fn discriminator(mut self, column: impl Into<String>, ty: SemanticType) -> Self {
        self.discriminator_column = Some((column.into(), ty));
        self
    }

    pub fn discriminator_value(mut self, value: impl Into<Value>) -> Self {
        self.discriminator_value = Some(value.into());
        self
    }

    pub fn proxyable(mut self, value: bool) -> Self {
        self.proxyable = value;
        self
    }

    pub fn cacheable(mut self, value: bool) -> Self {
        self.cacheable = value;
        self
    }

    pub fn mutable(mut self, value: bool) -> Self {
        self.mutable = value;
        self
    }

    /// Interface names a proxy of this entity reports.
    pub fn implements(mut self, interface: impl Into<String>) -> Self {
        self.interfaces.push(interface.into());
        self
    }
}
