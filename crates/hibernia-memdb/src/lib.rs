//! In-process relational store for Hibernia.
//!
//! `hibernia-memdb` interprets the structured [`Statement`]s produced by the
//! Hibernia core directly, without SQL parsing:
//!
//! - selects with left outer joins, equality/`IN` filters and ordering
//! - inserts, updates and deletes with NOT NULL, primary key and foreign key
//!   checks (deletes are restricted while rows still reference the target)
//! - transactions by snapshot and restore
//!
//! The [`Database`] handle is cheap to clone and implements
//! [`ConnectionProvider`], so one database can back a session factory while
//! tests seed and inspect it from the outside.
//!
//! Native SQL is never interpreted. Register a handler for the exact text
//! with [`Database::on_native`].
//!
//! # Example
//!
//! ```ignore
//! let db = Database::new();
//! db.create_schema(&metamodel)?;
//! db.insert("customer", &[("id", Value::BigInt(7)), ("name", "Acme".into())])?;
//! let factory = SessionFactory::builder(metamodel)
//!     .connection_provider(Arc::new(db.clone()))
//!     .build()?;
//! ```

pub mod connection;
pub mod select;
pub mod table;

pub use connection::MemConnection;
pub use table::{ColumnDef, ForeignKey, Table};

use hibernia_core::{
    Connection, ConnectionProvider, DeleteStatement, Error, InsertStatement, Metamodel,
    PropertyKind, QueryError, QueryErrorKind, Result, Row, Statement, UpdateStatement, Value,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use table::constraint;

/// Produces the rows of a native query from its parameters.
pub type NativeHandler = Arc<dyn Fn(&[Value]) -> Vec<Vec<Value>> + Send + Sync>;

#[derive(Clone)]
pub(crate) struct NativeQuery {
    pub(crate) columns: Vec<String>,
    pub(crate) handler: NativeHandler,
}

#[derive(Default)]
pub(crate) struct Store {
    pub(crate) tables: HashMap<String, Table>,
    pub(crate) log: Vec<String>,
    pub(crate) native: HashMap<String, NativeQuery>,
    /// SQL fragments whose next matching statement fails
    pub(crate) failures: Vec<String>,
    pub(crate) commits: usize,
    pub(crate) rollbacks: usize,
}

/// A shared in-memory database.
#[derive(Clone, Default)]
pub struct Database {
    inner: Arc<Mutex<Store>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.lock();
        f.debug_struct("Database")
            .field("tables", &store.tables.len())
            .field("statements", &store.log.len())
            .finish()
    }
}

impl Database {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Store> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create one table per hierarchy root of `metamodel`.
    ///
    /// Subclass columns are nullable, since rows of sibling types leave them
    /// empty. Foreign keys are declared for every to-one association and
    /// every owning collection.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn create_schema(&self, metamodel: &Metamodel) -> Result<()> {
        let mut tables: HashMap<String, Table> = HashMap::new();
        let mut collection_keys = Vec::new();

        for root in metamodel.entities().filter(|m| m.is_root()) {
            let mut table = Table::new(root.table(), root.identifier().columns.clone());
            if let Some(disc) = root.discriminator() {
                table.add_column(&disc.column, false);
            }
            for meta in metamodel.hierarchy(root) {
                let subclass = !meta.is_root();
                for prop in meta.properties().iter().filter(|p| p.declared_by == meta.name()) {
                    match &prop.kind {
                        PropertyKind::Basic(b) => table.add_column(&b.column, prop.nullable || subclass),
                        PropertyKind::ToOne(t) => {
                            for column in &t.columns {
                                table.add_column(column, prop.nullable || subclass);
                            }
                            let target = metamodel.entity(&t.target)?;
                            table.add_foreign_key(ForeignKey {
                                columns: t.columns.clone(),
                                table: target.table().to_string(),
                            });
                        }
                        PropertyKind::Collection(c) if !c.is_inverse() => {
                            let element = metamodel.entity(&c.element)?;
                            collection_keys.push((
                                element.table().to_string(),
                                c.key_columns.clone(),
                                meta.table().to_string(),
                            ));
                        }
                        PropertyKind::Collection(_) => {}
                    }
                }
            }
            tables.insert(table.name.clone(), table);
        }

        for (element_table, key_columns, owner_table) in collection_keys {
            let table = tables.get_mut(&element_table).ok_or_else(|| no_table(&element_table))?;
            for column in &key_columns {
                table.add_column(column, true);
            }
            table.add_foreign_key(ForeignKey {
                columns: key_columns,
                table: owner_table,
            });
        }

        tracing::debug!(tables = tables.len(), "Schema created");
        self.lock().tables.extend(tables);
        Ok(())
    }

    /// Add a table directly.
    pub fn create_table(&self, table: Table) {
        self.lock().tables.insert(table.name.clone(), table);
    }

    /// Insert one row outside any transaction, with every check applied.
    pub fn insert(&self, table: &str, values: &[(&str, Value)]) -> Result<()> {
        let insert = InsertStatement {
            table: table.to_string(),
            columns: values.iter().map(|(c, _)| (*c).to_string()).collect(),
            values: values.iter().map(|(_, v)| v.clone()).collect(),
        };
        self.lock().insert(&insert).map(|_| ())
    }

    /// Rows of `table` labelled with its column names.
    pub fn rows(&self, table: &str) -> Result<Vec<Row>> {
        let store = self.lock();
        let table = store.tables.get(table).ok_or_else(|| no_table(table))?;
        let names: Vec<String> = table.columns.iter().map(|c| c.name.clone()).collect();
        Ok(table
            .rows
            .iter()
            .map(|r| Row::new(names.clone(), r.clone()))
            .collect())
    }

    /// Number of rows in `table`; zero for unknown tables.
    pub fn count(&self, table: &str) -> usize {
        self.lock().tables.get(table).map_or(0, Table::len)
    }

    /// Every statement executed so far, rendered as SQL.
    pub fn statements(&self) -> Vec<String> {
        self.lock().log.clone()
    }

    pub fn statement_count(&self) -> usize {
        self.lock().log.len()
    }

    /// Statements whose SQL starts with `prefix` (e.g. `"INSERT"`).
    pub fn statements_starting_with(&self, prefix: &str) -> Vec<String> {
        self.lock()
            .log
            .iter()
            .filter(|s| s.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn reset_log(&self) {
        self.lock().log.clear();
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn rollbacks(&self) -> usize {
        self.lock().rollbacks
    }

    /// Fail the next statement whose SQL contains `fragment`.
    pub fn fail_next(&self, fragment: impl Into<String>) {
        self.lock().failures.push(fragment.into());
    }

    /// Answer the native query `sql` with rows computed from its parameters.
    pub fn on_native(
        &self,
        sql: impl Into<String>,
        columns: &[&str],
        handler: impl Fn(&[Value]) -> Vec<Vec<Value>> + Send + Sync + 'static,
    ) {
        self.lock().native.insert(
            sql.into(),
            NativeQuery {
                columns: columns.iter().map(|c| (*c).to_string()).collect(),
                handler: Arc::new(handler),
            },
        );
    }
}

impl ConnectionProvider for Database {
    fn connect(&self) -> Result<Box<dyn Connection>> {
        tracing::trace!("Opening in-memory connection");
        Ok(Box::new(MemConnection::new(self.clone())))
    }
}

pub(crate) fn no_table(name: &str) -> Error {
    Error::Query(QueryError::new(
        QueryErrorKind::NotFound,
        format!("no such table: {}", name),
    ))
}

fn unsupported(message: impl Into<String>) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Unsupported, message))
}

impl Store {
    pub(crate) fn take_failure(&mut self, sql: &str) -> Option<Error> {
        let position = self.failures.iter().position(|f| sql.contains(f.as_str()))?;
        let fragment = self.failures.remove(position);
        Some(Error::Query(
            QueryError::new(
                QueryErrorKind::Database,
                format!("injected failure for '{}'", fragment),
            )
            .with_sql(sql),
        ))
    }

    pub(crate) fn execute(&mut self, statement: &Statement) -> Result<u64> {
        match statement {
            Statement::Insert(s) => self.insert(s),
            Statement::Update(s) => self.update(s),
            Statement::Delete(s) => self.delete(s),
            Statement::Select(_) | Statement::Native(_) => {
                Err(unsupported("row-returning statement passed to execute"))
            }
        }
    }

    fn table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| no_table(name))
    }

    fn insert(&mut self, s: &InsertStatement) -> Result<u64> {
        let table = self.table(&s.table)?;
        let mut row = vec![Value::Null; table.columns.len()];
        for (column, value) in s.columns.iter().zip(&s.values) {
            row[table.column_index(column)?] = value.clone();
        }
        table.check_row(&row, None)?;
        self.check_references(table, &row)?;
        if let Some(table) = self.tables.get_mut(&s.table) {
            table.rows.push(row);
        }
        Ok(1)
    }

    fn update(&mut self, s: &UpdateStatement) -> Result<u64> {
        let table = self.table(&s.table)?;
        let targets = table.matching(&s.conditions)?;
        let mut updated = Vec::with_capacity(targets.len());
        for &index in &targets {
            let mut row = table.rows[index].clone();
            for (column, value) in &s.assignments {
                row[table.column_index(column)?] = value.clone();
            }
            table.check_row(&row, Some(index))?;
            self.check_references(table, &row)?;
            updated.push((index, row));
        }
        let count = updated.len() as u64;
        if let Some(table) = self.tables.get_mut(&s.table) {
            for (index, row) in updated {
                table.rows[index] = row;
            }
        }
        Ok(count)
    }

    fn delete(&mut self, s: &DeleteStatement) -> Result<u64> {
        let table = self.table(&s.table)?;
        let targets = table.matching(&s.conditions)?;
        for &index in &targets {
            let key = table.key_of(&table.rows[index])?;
            self.check_not_referenced(&s.table, &key, &targets)?;
        }
        let count = targets.len() as u64;
        if let Some(table) = self.tables.get_mut(&s.table) {
            let mut index = 0;
            table.rows.retain(|_| {
                let keep = !targets.contains(&index);
                index += 1;
                keep
            });
        }
        Ok(count)
    }

    /// Every non-null foreign key of `row` must point at an existing row (or
    /// at `row` itself).
    fn check_references(&self, table: &Table, row: &[Value]) -> Result<()> {
        for fk in &table.foreign_keys {
            let values = fk
                .columns
                .iter()
                .map(|c| table.value(row, c).cloned())
                .collect::<Result<Vec<_>>>()?;
            if values.iter().any(Value::is_null) {
                continue;
            }
            let target = self.table(&fk.table)?;
            if target.find_key(&values)?.is_some() {
                continue;
            }
            let self_reference = fk.table == table.name
                && table
                    .key_of(row)?
                    .iter()
                    .zip(&values)
                    .all(|(a, b)| table::loosely_equal(a, b));
            if !self_reference {
                return Err(constraint(format!(
                    "FOREIGN KEY constraint failed: {}({}) references {}",
                    table.name,
                    fk.columns.join(", "),
                    fk.table
                )));
            }
        }
        Ok(())
    }

    /// Deleting `key` from `table` must not orphan rows of other tables.
    /// Rows deleted by the same statement do not count.
    fn check_not_referenced(&self, table: &str, key: &[Value], deleting: &[usize]) -> Result<()> {
        for other in self.tables.values() {
            for fk in other.foreign_keys.iter().filter(|fk| fk.table == table) {
                let conditions: Vec<(String, Value)> =
                    fk.columns.iter().cloned().zip(key.iter().cloned()).collect();
                let referencing = other.matching(&conditions)?;
                let blocking = referencing
                    .iter()
                    .any(|i| !(other.name == table && deleting.contains(i)));
                if blocking {
                    return Err(constraint(format!(
                        "FOREIGN KEY constraint failed: {} is still referenced by {}({})",
                        table,
                        other.name,
                        fk.columns.join(", ")
                    )));
                }
            }
        }
        Ok(())
    }
}
