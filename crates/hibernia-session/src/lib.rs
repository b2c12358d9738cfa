//! Sessions and the unit of work for Hibernia.
//!
//! `hibernia-session` is the **runtime layer**. It turns the metadata of
//! `hibernia-core` and the load plans of `hibernia-loader` into managed
//! object graphs, and writes their changes back in a safe order.
//!
//! # Role In The Architecture
//!
//! - **Persistence context**: one managed instance per identity, with the
//!   state it was loaded with for dirty checking.
//! - **Lazy loading**: proxies and persistent collections that load
//!   themselves through the session that created them.
//! - **Result assembly**: rows of a load plan's select become instances,
//!   associations and collections, reusing managed identities.
//! - **Flush**: inserts, updates and deletes ordered by foreign-key
//!   dependencies, with optimistic version checks.
//! - **Transactions**: begin/commit/rollback with timeouts and
//!   rollback-only marking, plus second-level cache updates on commit.
//!
//! # Threading
//!
//! A [`SessionFactory`] is `Send + Sync` and meant to be shared. A
//! [`Session`] and everything it hands out is confined to the thread that
//! opened it.
//!
//! # Example
//!
//! ```ignore
//! let factory = SessionFactory::builder(metamodel)
//!     .connection_provider(Arc::new(database))
//!     .build()?;
//!
//! let session = factory.open_session();
//! session.begin_transaction()?;
//!
//! let customer = session.instantiate("Customer")?;
//! customer.set_id(7)?;
//! customer.set("name", "Acme")?;
//! session.persist(&customer)?;
//!
//! session.commit()?;
//! ```

mod assembler;
pub mod cascade;
pub mod collection;
pub mod context;
pub mod entity;
pub mod events;
pub mod factory;
pub mod flush;
pub mod lazy;
mod persister;
pub mod proxy;
pub mod query;
pub mod session;
pub mod statistics;
pub mod transaction;

#[cfg(test)]
mod fixtures;

pub use cascade::{ActionGraph, CascadeAction, Cycle};
pub use collection::PersistentCollection;
pub use context::{EntityEntry, EntityStatus, Lookup, PersistenceContext, StateValue};
pub use entity::{EntityRef, PropertyValue, Reference};
pub use events::{SessionEvent, SessionEventCallbacks};
pub use factory::{SessionFactory, SessionFactoryBuilder};
pub use flush::{FlushPlan, FlushResult};
pub use lazy::LazyState;
pub use proxy::{LazyRef, SerializableProxy};
pub use query::{NativeQuery, Query};
pub use session::Session;
pub use statistics::{CallSite, LazyLoadTracker, SessionStatistics};
pub use transaction::{TransactionCoordinator, TransactionStatus};
