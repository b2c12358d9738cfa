//! Error types for Hibernia operations.
//!
//! Every failure the core can raise is a variant of [`Error`]. Variants that
//! concern a particular entity carry its entity name, identifier (when known)
//! and the property involved, so callers never have to parse messages.

use crate::identity::Identifier;
use std::fmt;

/// The primary error type for all Hibernia operations.
#[derive(Debug)]
pub enum Error {
    /// A different instance is already registered for this identity.
    DuplicateIdentity {
        entity: String,
        id: Identifier,
    },
    /// A proxy or lazy collection could not be initialized.
    LazyInitialization {
        entity: String,
        id: Option<Identifier>,
        property: Option<String>,
        reason: String,
    },
    /// The session was used after `close()`.
    SessionClosed,
    /// A reference to a transient entity could not be ordered or saved.
    TransientPropertyValue {
        owner: String,
        property: String,
        referenced: String,
    },
    /// A discriminator value did not match any known subtype.
    UnknownEntityType {
        entity: String,
        discriminator: String,
    },
    /// The active transaction exceeded its timeout.
    TransactionTimeout {
        elapsed_ms: u128,
        timeout_ms: u128,
    },
    /// A versioned update or delete matched no row.
    StaleObjectState {
        entity: String,
        id: Identifier,
    },
    /// No row exists for the requested identity.
    EntityNotFound {
        entity: String,
        id: Identifier,
    },
    /// The entity name is not part of the metamodel.
    UnknownEntity(String),
    /// The entity has no property with this name.
    UnknownProperty {
        entity: String,
        property: String,
    },
    /// The session is already borrowed further up the call stack.
    ReentrantAccess(&'static str),
    /// A value did not match the property's semantic type.
    TypeMismatch(TypeError),
    /// Transaction state errors.
    Transaction(TransactionError),
    /// Statement execution errors reported by the connection.
    Query(QueryError),
    /// Configuration errors.
    Config(ConfigError),
    /// Mapping errors raised while building the metamodel.
    Mapping(MappingError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub entity: Option<String>,
    pub property: Option<String>,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// No transaction is active
    NotActive,
    /// A transaction is already active
    AlreadyActive,
    /// The transaction was marked rollback-only
    RollbackOnly,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Statement shape not supported by the connection
    Unsupported,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct ConfigError {
    pub key: Option<String>,
    pub message: String,
}

#[derive(Debug)]
pub struct MappingError {
    pub entity: Option<String>,
    pub property: Option<String>,
    pub message: String,
}

impl Error {
    /// Is this a lazy initialization failure?
    pub fn is_lazy_initialization(&self) -> bool {
        matches!(self, Error::LazyInitialization { .. })
    }

    /// Errors after which the session must be discarded.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Query(_)
                | Error::StaleObjectState { .. }
                | Error::TransactionTimeout { .. }
                | Error::SessionClosed
        )
    }

    /// The entity name this error refers to, when it refers to one.
    pub fn entity(&self) -> Option<&str> {
        match self {
            Error::DuplicateIdentity { entity, .. }
            | Error::LazyInitialization { entity, .. }
            | Error::UnknownEntityType { entity, .. }
            | Error::StaleObjectState { entity, .. }
            | Error::EntityNotFound { entity, .. }
            | Error::UnknownProperty { entity, .. } => Some(entity),
            Error::TransientPropertyValue { owner, .. } => Some(owner),
            Error::UnknownEntity(name) => Some(name),
            Error::Mapping(m) => m.entity.as_deref(),
            _ => None,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    pub fn lazy(entity: impl Into<String>, id: Option<Identifier>, reason: impl Into<String>) -> Self {
        Error::LazyInitialization {
            entity: entity.into(),
            id,
            property: None,
            reason: reason.into(),
        }
    }

    pub fn mapping(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Mapping(MappingError {
            entity: Some(entity.into()),
            property: None,
            message: message.into(),
        })
    }

    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Config(ConfigError {
            key: Some(key.into()),
            message: message.into(),
        })
    }

    pub fn unknown_property(entity: impl Into<String>, property: impl Into<String>) -> Self {
        Error::UnknownProperty {
            entity: entity.into(),
            property: property.into(),
        }
    }

    pub fn transaction(kind: TransactionErrorKind, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind,
            message: message.into(),
        })
    }
}

impl QueryError {
    pub fn new(kind: QueryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            sql: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_sql(mut self, sql: impl Into<String>) -> Self {
        self.sql = Some(sql.into());
        self
    }

    /// Is this a constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        self.kind == QueryErrorKind::Constraint
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity { entity, id } => write!(
                f,
                "a different object with the same identifier is already associated with the session: [{}#{}]",
                entity, id
            ),
            Error::LazyInitialization {
                entity,
                id,
                property,
                reason,
            } => {
                write!(f, "could not initialize ")?;
                match (property, id) {
                    (Some(p), Some(id)) => write!(f, "collection {}.{}#{}", entity, p, id)?,
                    (Some(p), None) => write!(f, "collection {}.{}", entity, p)?,
                    (None, Some(id)) => write!(f, "proxy [{}#{}]", entity, id)?,
                    (None, None) => write!(f, "proxy [{}]", entity)?,
                }
                write!(f, ": {}", reason)
            }
            Error::SessionClosed => write!(f, "Session is closed"),
            Error::TransientPropertyValue {
                owner,
                property,
                referenced,
            } => write!(
                f,
                "object references an unsaved transient instance: {}.{} -> {}",
                owner, property, referenced
            ),
            Error::UnknownEntityType {
                entity,
                discriminator,
            } => write!(
                f,
                "discriminator value '{}' does not identify a subtype of {}",
                discriminator, entity
            ),
            Error::TransactionTimeout {
                elapsed_ms,
                timeout_ms,
            } => write!(
                f,
                "transaction timed out after {}ms (timeout {}ms)",
                elapsed_ms, timeout_ms
            ),
            Error::StaleObjectState { entity, id } => write!(
                f,
                "row was updated or deleted by another transaction: [{}#{}]",
                entity, id
            ),
            Error::EntityNotFound { entity, id } => {
                write!(f, "no row with the given identifier exists: [{}#{}]", entity, id)
            }
            Error::UnknownEntity(name) => write!(f, "unknown entity: {}", name),
            Error::UnknownProperty { entity, property } => {
                write!(f, "unknown property {}.{}", entity, property)
            }
            Error::ReentrantAccess(op) => {
                write!(f, "session is already in use while calling {}", op)
            }
            Error::TypeMismatch(e) => write!(f, "Type error: {}", e),
            Error::Transaction(e) => write!(f, "Transaction error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e),
            Error::Config(e) => write!(f, "Configuration error: {}", e),
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity, &self.property) {
            (Some(entity), Some(prop)) => write!(
                f,
                "expected {} for {}.{}, found {}",
                self.expected, entity, prop, self.actual
            ),
            (_, Some(prop)) => write!(
                f,
                "expected {} for '{}', found {}",
                self.expected, prop, self.actual
            ),
            _ => write!(f, "expected {}, found {}", self.expected, self.actual),
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sql) = &self.sql {
            write!(f, "{} [{}]", self.message, sql)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(key) = &self.key {
            write!(f, "{}: {}", key, self.message)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entity, &self.property) {
            (Some(entity), Some(prop)) => write!(f, "{}.{}: {}", entity, prop, self.message),
            (Some(entity), None) => write!(f, "{}: {}", entity, self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::TypeMismatch(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for Hibernia operations.
pub type Result<T> = std::result::Result<T, Error>;
