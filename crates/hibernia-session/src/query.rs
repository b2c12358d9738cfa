//! Query builders.
//!
//! [`Query`] selects instances of one entity by identifier or property
//! equality, optionally overriding fetch strategies for this query only.
//! [`NativeQuery`] runs SQL translated elsewhere and maps its columns back
//! onto an entity.
//!
//! # Example
//!
//! ```ignore
//! let items = session
//!     .query("Item")
//!     .join("bids")
//!     .filter("name", "Lamp")
//!     .list()?;
//!
//! let native = NativeQuery::new("SELECT id, name FROM item WHERE price > ?")
//!     .param(100)
//!     .returning("Item");
//! let expensive = session.native_query(&native)?;
//! ```

use crate::entity::EntityRef;
use crate::session::Session;
use hibernia_core::{Error, Identifier, NativeSql, Result, Statement, Value};
use hibernia_loader::{FetchProfile, Restriction};

/// A query for instances of one entity.
///
/// Restrictions are combined with AND. Instances are returned in row order
/// with duplicates from joined collections removed, and every instance
/// already managed by the session is returned as that same instance.
#[must_use = "queries do nothing until listed"]
pub struct Query<'s> {
    session: &'s Session,
    entity: String,
    profile: Option<FetchProfile>,
    ids: Vec<Identifier>,
    filters: Vec<(String, Value)>,
    read_only: Option<bool>,
}

impl<'s> Query<'s> {
    pub(crate) fn new(session: &'s Session, entity: &str) -> Self {
        Self {
            session,
            entity: entity.to_string(),
            profile: None,
            ids: Vec::new(),
            filters: Vec::new(),
            read_only: None,
        }
    }

    fn profile_mut(&mut self) -> &mut FetchProfile {
        let entity = &self.entity;
        self.profile
            .get_or_insert_with(|| FetchProfile::new(format!("query:{}", entity)))
    }

    /// Use a named fetch profile. Later `join`/`select` calls add to it.
    pub fn fetch_profile(mut self, profile: FetchProfile) -> Self {
        self.profile = Some(profile);
        self
    }

    /// Fetch the association at `path` in the same statement.
    pub fn join(mut self, path: &str) -> Self {
        let profile = std::mem::take(self.profile_mut());
        self.profile = Some(profile.join(path));
        self
    }

    /// Fetch the association at `path` by a follow-up select.
    pub fn select(mut self, path: &str) -> Self {
        let profile = std::mem::take(self.profile_mut());
        self.profile = Some(profile.select(path));
        self
    }

    /// Leave the association at `path` unloaded.
    pub fn lazy(mut self, path: &str) -> Self {
        let profile = std::mem::take(self.profile_mut());
        self.profile = Some(profile.lazy(path));
        self
    }

    /// Require `property` to equal `value`. A NULL value matches NULL.
    pub fn filter(mut self, property: &str, value: impl Into<Value>) -> Self {
        self.filters.push((property.to_string(), value.into()));
        self
    }

    /// Restrict to one identifier. Repeated calls widen to any of them.
    pub fn id(mut self, id: impl Into<Identifier>) -> Self {
        self.ids.push(id.into());
        self
    }

    /// Load instances this query creates read-only.
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    fn restrictions(&self) -> Result<Vec<Restriction>> {
        let meta = self.session.metamodel().entity(&self.entity)?;
        let mut restrictions = Vec::with_capacity(self.filters.len() + 1);
        match self.ids.as_slice() {
            [] => {}
            [id] => restrictions.push(Restriction::Id(
                meta.identifier().coerce(meta.name(), id.clone())?,
            )),
            ids => restrictions.push(Restriction::Ids(
                ids.iter()
                    .map(|id| meta.identifier().coerce(meta.name(), id.clone()))
                    .collect::<Result<_>>()?,
            )),
        }
        for (property, value) in &self.filters {
            restrictions.push(Restriction::Property(property.clone(), value.clone()));
        }
        Ok(restrictions)
    }

    /// Every matching instance.
    #[tracing::instrument(level = "debug", skip(self), fields(entity = %self.entity))]
    pub fn list(self) -> Result<Vec<EntityRef>> {
        let restrictions = self.restrictions()?;
        self.session.core().query_entities(
            &self.entity,
            self.profile.as_ref(),
            &restrictions,
            self.read_only,
        )
    }

    /// The single matching instance, `None` if nothing matches.
    ///
    /// More than one match is an error.
    pub fn unique(self) -> Result<Option<EntityRef>> {
        let entity = self.entity.clone();
        let mut found = self.list()?;
        match found.len() {
            0 | 1 => Ok(found.pop()),
            n => Err(Error::Custom(format!(
                "query for {} returned {} instances where one was expected",
                entity, n
            ))),
        }
    }

    /// Values of `properties` for every matching row, without creating or
    /// touching managed instances.
    pub fn scalars(self, properties: &[&str]) -> Result<Vec<Vec<Value>>> {
        let restrictions = self.restrictions()?;
        self.session
            .core()
            .query_scalars(&self.entity, properties, &restrictions)
    }
}

/// SQL translated by an external query language, run as-is.
#[derive(Debug, Clone)]
pub struct NativeQuery {
    sql: String,
    params: Vec<Value>,
    returns: Option<String>,
    /// Result label -> mapped column name
    columns: Vec<(String, String)>,
    pub(crate) read_only: Option<bool>,
}

impl NativeQuery {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
            returns: None,
            columns: Vec::new(),
            read_only: None,
        }
    }

    /// Bind the next positional parameter.
    pub fn param(mut self, value: impl Into<Value>) -> Self {
        self.params.push(value.into());
        self
    }

    /// Map the result onto instances of `entity`.
    pub fn returning(mut self, entity: &str) -> Self {
        self.returns = Some(entity.to_string());
        self
    }

    /// Read result column `label` as the mapped column `column`.
    ///
    /// Labels not declared here must equal a mapped column name (case is
    /// ignored).
    pub fn column(mut self, label: &str, column: &str) -> Self {
        self.columns.push((label.to_string(), column.to_string()));
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = Some(read_only);
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    pub fn returns(&self) -> Option<&str> {
        self.returns.as_deref()
    }

    /// The mapped column a result label stands for.
    pub fn mapped_column<'a>(&'a self, label: &'a str) -> &'a str {
        self.columns
            .iter()
            .find(|(l, _)| l.eq_ignore_ascii_case(label))
            .map_or(label, |(_, column)| column.as_str())
    }

    pub(crate) fn statement(&self) -> Statement {
        Statement::Native(NativeSql {
            sql: self.sql.clone(),
            params: self.params.clone(),
        })
    }
}
