//! Load plans for Hibernia.
//!
//! A load plan decides, per query, how much of the entity graph one select
//! brings back:
//!
//! - [`LoadPlanBuilder`] walks the metamodel and classifies every
//!   association as joined, selected later, or left unfetched
//! - [`FetchProfile`] overrides mapping-declared strategies per query
//! - [`render_select`] turns a plan into a [`SelectStatement`] plus the
//!   [`ResultMapping`] the result assembler reads rows with
//!
//! # Example
//!
//! ```ignore
//! let profile = FetchProfile::new("item-with-bids").join("bids");
//! let plan = LoadPlanBuilder::new(&metamodel, settings.max_fetch_depth)
//!     .profile(&profile)
//!     .entity_plan("Item")?;
//! let (select, mapping) = render_select(&metamodel, &plan, &[Restriction::Id(id)])?;
//! ```
//!
//! [`SelectStatement`]: hibernia_core::SelectStatement

pub mod builder;
pub mod plan;
pub mod profile;
pub mod select;

#[cfg(test)]
mod fixtures;

pub use builder::LoadPlanBuilder;
pub use plan::{
    AssociationKey, CircularFetch, CollectionFetch, CollectionReturn, EntityFetch, EntityNode,
    Fetch, FetchMode, LoadPlan, NodeId, Return, ScalarReturn,
};
pub use profile::FetchProfile;
pub use select::{EntityColumns, Restriction, ResultMapping, render_select};
