//! Core types and contracts for Hibernia.
//!
//! This crate provides the foundations every other Hibernia crate builds on:
//!
//! - `Value`, `Identifier`, `EntityKey` for dynamic data and identity
//! - `EntityMapping` / `Metamodel` for mapping declarations and their
//!   validated, immutable form
//! - `Statement` and the `Connection` / `RowCursor` contracts
//! - `RegionCache` for second-level caching
//! - `Settings` and the `Error` taxonomy

pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod identity;
pub mod mapping;
pub mod metamodel;
pub mod row;
pub mod statement;
pub mod types;
pub mod value;

pub use cache::{CacheEntry, CachedValue, InMemoryRegionCache, RegionCache};
pub use config::{DirtyCheckMode, Settings};
pub use connection::{Connection, ConnectionProvider, RowCursor, VecCursor};
pub use error::{
    ConfigError, Error, MappingError, QueryError, QueryErrorKind, Result, TransactionError,
    TransactionErrorKind, TypeError,
};
pub use identity::{CollectionKey, EntityKey, Identifier};
pub use mapping::{
    CascadeStyle, EntityMapping, FetchStrategy, FetchStyle, FetchTiming, IdGenerator,
    IdentifierMapping, PropertyMapping, PropertyMappingKind,
};
pub use metamodel::{
    BasicMapping, CollectionMapping, Discriminator, EntityMetadata, IdentifierDescriptor,
    Metamodel, MetamodelBuilder, PropertyDescriptor, PropertyKind, ToOneMapping,
};
pub use row::{ColumnInfo, FromValue, Row};
pub use statement::{
    ColumnRef, DeleteStatement, InsertStatement, Join, NativeSql, Predicate, SelectStatement,
    Statement, TableRef, UpdateStatement,
};
pub use types::SemanticType;
pub use value::Value;
