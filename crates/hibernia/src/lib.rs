//! Hibernia - an object-relational mapping core.
//!
//! Hibernia maps a metadata-described domain model onto relational tables
//! and keeps an in-memory object graph in step with the database:
//!
//! - One managed instance per identity per session
//! - Lazy proxies and collections that load on first real use
//! - Load plans that join, select or defer each association per query
//! - Dirty checking against loaded snapshots
//! - Flushes ordered by foreign-key dependencies, with optimistic locking
//! - An optional second-level cache shared by all sessions of a factory
//!
//! # Quick Start
//!
//! ```ignore
//! use hibernia::prelude::*;
//!
//! let metamodel = Metamodel::builder()
//!     .entity(
//!         EntityMapping::new("Customer")
//!             .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
//!             .property(PropertyMapping::basic("name", SemanticType::Text)),
//!     )
//!     .entity(
//!         EntityMapping::new("Invoice")
//!             .id(IdentifierMapping::simple("id", "id", SemanticType::Long))
//!             .property(PropertyMapping::basic("number", SemanticType::Text))
//!             .property(PropertyMapping::many_to_one("customer", "Customer").lazy()),
//!     )
//!     .build()?;
//!
//! let db = Database::new();
//! db.create_schema(&metamodel)?;
//!
//! let factory = SessionFactory::builder(metamodel)
//!     .connection_provider(Arc::new(db))
//!     .build()?;
//!
//! let session = factory.open_session();
//! session.begin_transaction()?;
//!
//! let acme = session.instantiate("Customer")?;
//! acme.set_id(7)?;
//! acme.set("name", "Acme")?;
//! session.persist(&acme)?;
//!
//! let invoice = session.instantiate("Invoice")?;
//! invoice.set_id(1)?;
//! invoice.set("number", "INV-1")?;
//! invoice.set_reference("customer", Some(&acme))?;
//! session.persist(&invoice)?;
//!
//! session.commit()?; // inserts Customer, then Invoice
//! ```
//!
//! # Crates
//!
//! - [`hibernia_core`]: values, metadata, statements, connection contracts
//! - [`hibernia_loader`]: load plans and fetch profiles
//! - [`hibernia_session`]: sessions, proxies, flush and transactions
//! - [`hibernia_memdb`]: an in-process database for tests and examples

pub use hibernia_core as core;
pub use hibernia_loader as loader;
pub use hibernia_memdb as memdb;
pub use hibernia_session as session;

// Core
pub use hibernia_core::{
    CacheEntry, CachedValue, CascadeStyle, CollectionKey, ColumnInfo, Connection,
    ConnectionProvider, DirtyCheckMode, EntityKey, EntityMapping, EntityMetadata, Error,
    FetchStrategy, FetchStyle, FetchTiming, IdGenerator, Identifier, IdentifierMapping,
    InMemoryRegionCache, Metamodel, MetamodelBuilder, PropertyMapping, RegionCache, Result, Row,
    RowCursor, SemanticType, Settings, Statement, Value,
};

// Load plans
pub use hibernia_loader::{FetchMode, FetchProfile, LoadPlan, LoadPlanBuilder};

// Sessions
pub use hibernia_session::{
    CascadeAction, EntityRef, EntityStatus, FlushResult, LazyRef, LazyState, NativeQuery,
    PersistentCollection, PropertyValue, Query, Reference, SerializableProxy, Session,
    SessionEvent, SessionFactory, SessionFactoryBuilder, SessionStatistics, TransactionStatus,
};

// In-memory database
pub use hibernia_memdb::Database;

/// Prelude module for convenient imports.
///
/// ```ignore
/// use hibernia::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        // Mapping
        CascadeStyle,
        // In-memory database
        Database,
        EntityMapping,
        // Sessions
        EntityRef,
        EntityStatus,
        // Core
        Error,
        FetchProfile,
        FetchStrategy,
        Identifier,
        IdentifierMapping,
        LazyRef,
        Metamodel,
        NativeQuery,
        PersistentCollection,
        PropertyMapping,
        Reference,
        Result,
        SemanticType,
        Session,
        SessionEvent,
        SessionFactory,
        Settings,
        Value,
    };
    pub use std::sync::Arc;
}
