//! Builds load plans by walking associations in the metamodel.
//!
//! Classification precedence for every association is: per-query profile
//! override, then the mapping's declared strategy (to-one associations
//! default to joined, collections to lazy).
//!
//! The walk keeps the association keys of the current path. Meeting a key
//! that is already on the path yields a circular fetch instead of
//! descending again, so building always terminates. Joins deeper than
//! `max_depth`, and collection joins after the first one, are downgraded to
//! select fetches.

use crate::plan::{
    AssociationKey, CircularFetch, CollectionFetch, CollectionReturn, EntityFetch, EntityNode,
    Fetch, FetchMode, LoadPlan, NodeId, Return, ScalarReturn,
};
use crate::profile::FetchProfile;
use hibernia_core::{
    CollectionMapping, EntityMetadata, Error, FetchStyle, Metamodel, PropertyDescriptor,
    PropertyKind, Result, ToOneMapping,
};
use std::collections::HashSet;
use std::sync::Arc;

/// Builds one [`LoadPlan`]. A builder is consumed by the plan it builds.
pub struct LoadPlanBuilder<'a> {
    metamodel: &'a Metamodel,
    max_depth: usize,
    profile: Option<&'a FetchProfile>,
    active: Vec<AssociationKey>,
    next_node: usize,
    collection_joined: bool,
}

impl<'a> LoadPlanBuilder<'a> {
    pub fn new(metamodel: &'a Metamodel, max_depth: usize) -> Self {
        Self {
            metamodel,
            max_depth,
            profile: None,
            active: Vec::new(),
            next_node: 0,
            collection_joined: false,
        }
    }

    pub fn profile(mut self, profile: &'a FetchProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Plan loading instances of `entity` (and its subtypes).
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn entity_plan(mut self, entity: &str) -> Result<LoadPlan> {
        let meta = Arc::clone(self.metamodel.entity(entity)?);
        if let Some(profile) = self.profile {
            profile.validate(self.metamodel, entity)?;
        }
        let root = self.visit_entity(&meta, "", 0)?;
        let plan = LoadPlan::new(vec![Return::Entity(root)]);
        tracing::debug!(
            entity = entity,
            joins = plan.nodes().len() - 1,
            depth = plan.max_join_depth(),
            "Built entity load plan"
        );
        Ok(plan)
    }

    /// Plan loading the elements of collection `role` for given owners.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn collection_plan(mut self, role: &str) -> Result<LoadPlan> {
        let (owner, mapping) = self.metamodel.collection(role)?;
        let owner_name = owner.name().to_string();
        let mapping = mapping.clone();
        let element = Arc::clone(self.metamodel.entity(&mapping.element)?);
        if let Some(profile) = self.profile {
            profile.validate(self.metamodel, &mapping.element)?;
        }
        self.active
            .push(AssociationKey::new(element.table(), &mapping.key_columns));
        let node = self.visit_entity(&element, "", 0)?;
        self.active.pop();
        Ok(LoadPlan::new(vec![Return::Collection(CollectionReturn {
            role: mapping.role.clone(),
            owner: owner_name,
            key_columns: mapping.key_columns.clone(),
            element: node,
        })]))
    }

    /// Plan projecting basic properties of `entity`; no entity is returned.
    pub fn scalar_plan(self, entity: &str, properties: &[&str]) -> Result<LoadPlan> {
        let meta = self.metamodel.entity(entity)?;
        let mut returns = Vec::with_capacity(properties.len());
        for name in properties {
            let prop = find_in_hierarchy(self.metamodel, meta, name)
                .ok_or_else(|| Error::unknown_property(entity, *name))?;
            if prop.as_basic().is_none() {
                return Err(Error::config(
                    format!("{}.{}", entity, name),
                    "only basic properties can be projected",
                ));
            }
            returns.push(Return::Scalar(ScalarReturn {
                label: (*name).to_string(),
                entity: entity.to_string(),
                property: (*name).to_string(),
            }));
        }
        Ok(LoadPlan::new(returns))
    }

    fn next_id(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }

    fn visit_entity(
        &mut self,
        meta: &Arc<EntityMetadata>,
        path: &str,
        depth: usize,
    ) -> Result<EntityNode> {
        let id = self.next_id();
        let mut fetches = Vec::new();

        for prop in association_properties(self.metamodel, meta) {
            let prop_path = if path.is_empty() {
                prop.name.clone()
            } else {
                format!("{}.{}", path, prop.name)
            };
            let fetch = match &prop.kind {
                PropertyKind::ToOne(to_one) => {
                    self.visit_to_one(meta, &prop, to_one, prop_path, depth)?
                }
                PropertyKind::Collection(coll) => {
                    self.visit_collection(&prop, coll, prop_path, depth)?
                }
                PropertyKind::Basic(_) => continue,
            };
            fetches.push(fetch);
        }

        Ok(EntityNode {
            id,
            entity: meta.name().to_string(),
            alias: format!("t{}", id.0),
            path: path.to_string(),
            fetches,
        })
    }

    fn visit_to_one(
        &mut self,
        owner: &EntityMetadata,
        prop: &PropertyDescriptor,
        mapping: &ToOneMapping,
        path: String,
        depth: usize,
    ) -> Result<Fetch> {
        let key = AssociationKey::new(owner.table(), &mapping.columns);
        if self.active.contains(&key) {
            tracing::trace!(path = %path, key = %key, "Circular to-one fetch");
            return Ok(Fetch::Circular(CircularFetch {
                property: prop.name.clone(),
                path,
                key,
                target: mapping.target.clone(),
                role: None,
            }));
        }

        let target = Arc::clone(self.metamodel.entity(&mapping.target)?);
        let declared = self.profile_override(&path).unwrap_or(if mapping.fetch.is_lazy() {
            FetchMode::NoFetch
        } else {
            match mapping.fetch.style {
                FetchStyle::Join => FetchMode::Join,
                FetchStyle::Select => FetchMode::Select,
            }
        });
        let mode = match declared {
            FetchMode::NoFetch if !target.is_proxyable() => {
                tracing::trace!(path = %path, "Target not proxyable, fetching by select");
                FetchMode::Select
            }
            FetchMode::Join if depth >= self.max_depth => {
                tracing::debug!(path = %path, depth = depth + 1, "Join depth exceeded, fetching by select");
                FetchMode::Select
            }
            other => other,
        };

        let node = if mode == FetchMode::Join {
            self.active.push(key.clone());
            let child = self.visit_entity(&target, &path, depth + 1);
            self.active.pop();
            Some(child?)
        } else {
            None
        };

        Ok(Fetch::Entity(EntityFetch {
            property: prop.name.clone(),
            path,
            target: mapping.target.clone(),
            mode,
            key,
            node,
        }))
    }

    fn visit_collection(
        &mut self,
        prop: &PropertyDescriptor,
        mapping: &CollectionMapping,
        path: String,
        depth: usize,
    ) -> Result<Fetch> {
        let element = Arc::clone(self.metamodel.entity(&mapping.element)?);
        let key = AssociationKey::new(element.table(), &mapping.key_columns);
        if self.active.contains(&key) {
            tracing::trace!(path = %path, key = %key, "Circular collection fetch");
            return Ok(Fetch::Circular(CircularFetch {
                property: prop.name.clone(),
                path,
                key,
                target: mapping.element.clone(),
                role: Some(mapping.role.clone()),
            }));
        }

        let declared = self.profile_override(&path).unwrap_or(if mapping.fetch.is_lazy() {
            FetchMode::NoFetch
        } else {
            match mapping.fetch.style {
                FetchStyle::Join => FetchMode::Join,
                FetchStyle::Select => FetchMode::Select,
            }
        });
        let mode = match declared {
            FetchMode::Join if self.collection_joined => {
                tracing::debug!(path = %path, "A collection is already joined, fetching by select");
                FetchMode::Select
            }
            FetchMode::Join if depth >= self.max_depth => {
                tracing::debug!(path = %path, depth = depth + 1, "Join depth exceeded, fetching by select");
                FetchMode::Select
            }
            other => other,
        };

        let node = if mode == FetchMode::Join {
            self.collection_joined = true;
            self.active.push(key.clone());
            let child = self.visit_entity(&element, &path, depth + 1);
            self.active.pop();
            Some(child?)
        } else {
            None
        };

        Ok(Fetch::Collection(CollectionFetch {
            property: prop.name.clone(),
            path,
            role: mapping.role.clone(),
            element: mapping.element.clone(),
            mode,
            key,
            node,
        }))
    }

    fn profile_override(&self, path: &str) -> Option<FetchMode> {
        self.profile.and_then(|p| p.override_for(path))
    }
}

/// Associations of `meta` and its subtypes, each name once, supertype first.
pub(crate) fn association_properties(
    metamodel: &Metamodel,
    meta: &Arc<EntityMetadata>,
) -> Vec<PropertyDescriptor> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for m in metamodel.hierarchy(meta) {
        for prop in m.properties() {
            if prop.is_association() && seen.insert(prop.name.clone()) {
                out.push(prop.clone());
            }
        }
    }
    out
}

pub(crate) fn find_in_hierarchy(
    metamodel: &Metamodel,
    meta: &Arc<EntityMetadata>,
    name: &str,
) -> Option<PropertyDescriptor> {
    metamodel
        .hierarchy(meta)
        .into_iter()
        .find_map(|m| m.find_property(name).cloned())
}
