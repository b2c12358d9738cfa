//! The load plan: an immutable tree of returns and fetches.
//!
//! A plan says, for one query, which entities come back, which of their
//! associations are joined into the same select, which are loaded by a
//! follow-up select, and which are left as proxies or uninitialized
//! collections. Plans are built by [`LoadPlanBuilder`](crate::LoadPlanBuilder)
//! and consumed by value when executed.

use std::fmt;

/// Identifies an entity node within one plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// How an association is loaded by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchMode {
    /// Outer-joined into the plan's select
    Join,
    /// Loaded by a follow-up select after the main result is read
    Select,
    /// Left as a proxy or an uninitialized collection
    NoFetch,
}

/// Identity of an association edge: the table owning the foreign key plus
/// the key columns. Both sides of a bidirectional mapping share one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AssociationKey {
    pub table: String,
    pub columns: Vec<String>,
}

impl AssociationKey {
    pub fn new(table: impl Into<String>, columns: &[String]) -> Self {
        Self {
            table: table.into(),
            columns: columns.to_vec(),
        }
    }
}

impl fmt::Display for AssociationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.table, self.columns.join(", "))
    }
}

/// An entity appearing in the plan, either as a return or as a joined fetch.
#[derive(Debug)]
pub struct EntityNode {
    pub id: NodeId,
    pub entity: String,
    /// Table alias in the rendered select
    pub alias: String,
    /// Dotted property path from the return, empty for the return itself
    pub path: String,
    pub fetches: Vec<Fetch>,
}

impl EntityNode {
    /// The fetch for `property`, if the plan has one.
    pub fn fetch(&self, property: &str) -> Option<&Fetch> {
        self.fetches.iter().find(|f| f.property() == property)
    }
}

#[derive(Debug)]
pub struct EntityFetch {
    pub property: String,
    pub path: String,
    pub target: String,
    pub mode: FetchMode,
    pub key: AssociationKey,
    /// Present when `mode` is `Join`
    pub node: Option<EntityNode>,
}

#[derive(Debug)]
pub struct CollectionFetch {
    pub property: String,
    pub path: String,
    pub role: String,
    pub element: String,
    pub mode: FetchMode,
    pub key: AssociationKey,
    /// Element node, present when `mode` is `Join`
    pub node: Option<EntityNode>,
}

/// An association whose key is already on the active path. The assembler
/// resolves it through the persistence context, or with a proxy.
#[derive(Debug)]
pub struct CircularFetch {
    pub property: String,
    pub path: String,
    pub key: AssociationKey,
    pub target: String,
    /// Set when the circular association is a collection
    pub role: Option<String>,
}

#[derive(Debug)]
pub enum Fetch {
    Entity(EntityFetch),
    Collection(CollectionFetch),
    Circular(CircularFetch),
}

impl Fetch {
    pub fn property(&self) -> &str {
        match self {
            Fetch::Entity(f) => &f.property,
            Fetch::Collection(f) => &f.property,
            Fetch::Circular(f) => &f.property,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Fetch::Entity(f) => &f.path,
            Fetch::Collection(f) => &f.path,
            Fetch::Circular(f) => &f.path,
        }
    }

    pub fn mode(&self) -> FetchMode {
        match self {
            Fetch::Entity(f) => f.mode,
            Fetch::Collection(f) => f.mode,
            Fetch::Circular(_) => FetchMode::NoFetch,
        }
    }

    pub fn is_circular(&self) -> bool {
        matches!(self, Fetch::Circular(_))
    }

    /// The joined child node, if any.
    pub fn node(&self) -> Option<&EntityNode> {
        match self {
            Fetch::Entity(f) => f.node.as_ref(),
            Fetch::Collection(f) => f.node.as_ref(),
            Fetch::Circular(_) => None,
        }
    }
}

/// The elements of one collection role, keyed by owner.
#[derive(Debug)]
pub struct CollectionReturn {
    pub role: String,
    pub owner: String,
    pub key_columns: Vec<String>,
    pub element: EntityNode,
}

/// A projected basic property of the plan's entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScalarReturn {
    pub label: String,
    pub entity: String,
    pub property: String,
}

#[derive(Debug)]
pub enum Return {
    Entity(EntityNode),
    Collection(CollectionReturn),
    Scalar(ScalarReturn),
}

/// A complete, immutable load plan.
#[derive(Debug)]
pub struct LoadPlan {
    returns: Vec<Return>,
}

impl LoadPlan {
    pub(crate) fn new(returns: Vec<Return>) -> Self {
        Self { returns }
    }

    pub fn returns(&self) -> &[Return] {
        &self.returns
    }

    /// The first entity return.
    pub fn entity_return(&self) -> Option<&EntityNode> {
        self.returns.iter().find_map(|r| match r {
            Return::Entity(node) => Some(node),
            _ => None,
        })
    }

    pub fn collection_return(&self) -> Option<&CollectionReturn> {
        self.returns.iter().find_map(|r| match r {
            Return::Collection(c) => Some(c),
            _ => None,
        })
    }

    pub fn scalar_returns(&self) -> impl Iterator<Item = &ScalarReturn> {
        self.returns.iter().filter_map(|r| match r {
            Return::Scalar(s) => Some(s),
            _ => None,
        })
    }

    pub fn is_scalar_only(&self) -> bool {
        self.returns.iter().all(|r| matches!(r, Return::Scalar(_)))
    }

    /// Every entity node, depth first.
    pub fn nodes(&self) -> Vec<&EntityNode> {
        let mut out = Vec::new();
        for r in &self.returns {
            match r {
                Return::Entity(node) => collect_nodes(node, &mut out),
                Return::Collection(c) => collect_nodes(&c.element, &mut out),
                Return::Scalar(_) => {}
            }
        }
        out
    }

    /// Every fetch, depth first.
    pub fn fetches(&self) -> Vec<&Fetch> {
        self.nodes()
            .into_iter()
            .flat_map(|n| n.fetches.iter())
            .collect()
    }

    /// Number of collection roles joined into the select.
    pub fn joined_collection_count(&self) -> usize {
        self.fetches()
            .into_iter()
            .filter(|f| matches!(f, Fetch::Collection(c) if c.mode == FetchMode::Join))
            .count()
    }

    /// Deepest join nesting below any return.
    pub fn max_join_depth(&self) -> usize {
        fn depth(node: &EntityNode) -> usize {
            node.fetches
                .iter()
                .filter_map(Fetch::node)
                .map(|child| 1 + depth(child))
                .max()
                .unwrap_or(0)
        }
        self.returns
            .iter()
            .map(|r| match r {
                Return::Entity(node) => depth(node),
                Return::Collection(c) => depth(&c.element),
                Return::Scalar(_) => 0,
            })
            .max()
            .unwrap_or(0)
    }
}

fn collect_nodes<'a>(node: &'a EntityNode, out: &mut Vec<&'a EntityNode>) {
    out.push(node);
    for fetch in &node.fetches {
        if let Some(child) = fetch.node() {
            collect_nodes(child, out);
        }
    }
}

impl fmt::Display for LoadPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn write_node(f: &mut fmt::Formatter<'_>, node: &EntityNode, indent: usize) -> fmt::Result {
            writeln!(f, "{:indent$}{} as {} [{}]", "", node.entity, node.alias, node.id)?;
            for fetch in &node.fetches {
                let label = match fetch {
                    Fetch::Entity(e) => format!("{} -> {} ({:?})", e.property, e.target, e.mode),
                    Fetch::Collection(c) => format!("{} -> {} ({:?})", c.property, c.role, c.mode),
                    Fetch::Circular(c) => format!("{} -> {} (circular on {})", c.property, c.target, c.key),
                };
                writeln!(f, "{:width$}{}", "", label, width = indent + 2)?;
                if let Some(child) = fetch.node() {
                    write_node(f, child, indent + 4)?;
                }
            }
            Ok(())
        }
        for r in &self.returns {
            match r {
                Return::Entity(node) => write_node(f, node, 0)?,
                Return::Collection(c) => {
                    writeln!(f, "collection {}", c.role)?;
                    write_node(f, &c.element, 2)?;
                }
                Return::Scalar(s) => writeln!(f, "scalar {} = {}.{}", s.label, s.entity, s.property)?,
            }
        }
        Ok(())
    }
}
