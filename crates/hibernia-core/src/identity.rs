//! Entity and collection identities.
//!
//! An entity's identity inside a session is its root entity name plus its
//! identifier. Subclasses share the root name, so a `CreditCard#4` and a
//! `BillingDetails#4` are the same row and the same managed instance.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The identifier of an entity row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Identifier {
    /// Single-column identifier
    Simple(Value),
    /// Multi-column identifier, in mapping order
    Composite(Vec<Value>),
}

impl Identifier {
    /// The identifier's column values, in mapping order.
    pub fn values(&self) -> &[Value] {
        match self {
            Identifier::Simple(v) => std::slice::from_ref(v),
            Identifier::Composite(vs) => vs,
        }
    }

    /// Build an identifier from column values.
    ///
    /// Returns `None` when every column is NULL (outer-join miss).
    pub fn from_values(values: Vec<Value>) -> Option<Self> {
        if values.iter().all(Value::is_null) {
            return None;
        }
        if values.len() == 1 {
            values.into_iter().next().map(Identifier::Simple)
        } else {
            Some(Identifier::Composite(values))
        }
    }

    /// Short description of the identifier's value types.
    pub fn type_name(&self) -> String {
        match self {
            Identifier::Simple(v) => v.type_name().to_string(),
            Identifier::Composite(vs) => {
                let names: Vec<&str> = vs.iter().map(Value::type_name).collect();
                format!("({})", names.join(", "))
            }
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identifier::Simple(Value::Text(s)) => write!(f, "{}", s),
            Identifier::Simple(v) => write!(f, "{}", v),
            Identifier::Composite(vs) => {
                write!(f, "(")?;
                for (i, v) in vs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<Value> for Identifier {
    fn from(v: Value) -> Self {
        Identifier::Simple(v)
    }
}

impl From<i64> for Identifier {
    fn from(v: i64) -> Self {
        Identifier::Simple(Value::BigInt(v))
    }
}

impl From<i32> for Identifier {
    fn from(v: i32) -> Self {
        Identifier::Simple(Value::Int(v))
    }
}

impl From<&str> for Identifier {
    fn from(v: &str) -> Self {
        Identifier::Simple(Value::Text(v.to_string()))
    }
}

/// Identity of a managed entity: root entity name plus identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity: String,
    pub id: Identifier,
}

impl EntityKey {
    pub fn new(root_entity: impl Into<String>, id: Identifier) -> Self {
        Self {
            entity: root_entity.into(),
            id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.entity, self.id)
    }
}

/// Identity of a persistent collection: role plus owner identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionKey {
    /// `Owner.property`
    pub role: String,
    pub owner: Identifier,
}

impl CollectionKey {
    pub fn new(role: impl Into<String>, owner: Identifier) -> Self {
        Self {
            role: role.into(),
            owner,
        }
    }
}

impl fmt::Display for CollectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.role, self.owner)
    }
}
