//! Connections to a [`Database`].

use crate::{Database, Table, select};
use hibernia_core::{
    ColumnInfo, Connection, Error, QueryError, QueryErrorKind, Result, Row, RowCursor, Statement,
    TransactionErrorKind, VecCursor,
};
use std::collections::HashMap;
use std::sync::Arc;

/// One connection. Transactions copy the tables on `begin` and put the copy
/// back on `rollback`; dropping a connection mid-transaction rolls back.
pub struct MemConnection {
    db: Database,
    snapshot: Option<HashMap<String, Table>>,
}

impl MemConnection {
    pub fn new(db: Database) -> Self {
        Self { db, snapshot: None }
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    fn restore(&mut self) -> bool {
        match self.snapshot.take() {
            Some(tables) => {
                let mut store = self.db.lock();
                store.tables = tables;
                store.rollbacks += 1;
                true
            }
            None => false,
        }
    }
}

fn with_sql(err: Error, sql: &str) -> Error {
    match err {
        Error::Query(mut q) => {
            if q.sql.is_none() {
                q.sql = Some(sql.to_string());
            }
            Error::Query(q)
        }
        other => other,
    }
}

impl Connection for MemConnection {
    fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowCursor>> {
        let sql = statement.to_sql();
        let mut store = self.db.lock();
        store.log.push(sql.clone());
        if let Some(err) = store.take_failure(&sql) {
            return Err(err);
        }
        let (labels, rows) = match statement {
            Statement::Select(select) => select::evaluate(&store.tables, select).map_err(|e| with_sql(e, &sql))?,
            Statement::Native(native) => {
                let query = store.native.get(&native.sql).cloned().ok_or_else(|| {
                    Error::Query(
                        QueryError::new(QueryErrorKind::Unsupported, "no handler registered for native query")
                            .with_sql(&sql),
                    )
                })?;
                // handlers may inspect the database themselves
                drop(store);
                (query.columns, (query.handler)(&native.params))
            }
            _ => {
                return Err(Error::Query(
                    QueryError::new(QueryErrorKind::Unsupported, "statement does not return rows")
                        .with_sql(&sql),
                ));
            }
        };
        tracing::trace!(sql = %sql, rows = rows.len(), "Query evaluated");
        let columns = Arc::new(ColumnInfo::new(labels));
        let rows = rows
            .into_iter()
            .map(|values| Row::with_columns(Arc::clone(&columns), values))
            .collect();
        Ok(Box::new(VecCursor::new(columns, rows)))
    }

    fn execute(&mut self, statement: &Statement) -> Result<u64> {
        let sql = statement.to_sql();
        let mut store = self.db.lock();
        store.log.push(sql.clone());
        if let Some(err) = store.take_failure(&sql) {
            return Err(err);
        }
        let affected = store.execute(statement).map_err(|e| with_sql(e, &sql))?;
        tracing::trace!(sql = %sql, affected, "Statement executed");
        Ok(affected)
    }

    fn begin(&mut self) -> Result<()> {
        if self.snapshot.is_some() {
            return Err(Error::transaction(
                TransactionErrorKind::AlreadyActive,
                "connection is already in a transaction",
            ));
        }
        self.snapshot = Some(self.db.lock().tables.clone());
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        if self.snapshot.take().is_none() {
            return Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "commit without a transaction",
            ));
        }
        self.db.lock().commits += 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if !self.restore() {
            return Err(Error::transaction(
                TransactionErrorKind::NotActive,
                "rollback without a transaction",
            ));
        }
        Ok(())
    }
}

impl Drop for MemConnection {
    fn drop(&mut self) {
        if self.restore() {
            tracing::debug!("Connection dropped inside a transaction; rolled back");
        }
    }
}
