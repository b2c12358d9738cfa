//! Database connection contracts.
//!
//! This module defines what the core needs from the connection layer:
//!
//! - [`Connection`] - executes statements and demarcates transactions
//! - [`RowCursor`] - forward-only iteration over a query result
//! - [`ConnectionProvider`] - hands out connections to sessions
//!
//! All calls block the calling thread until the database answers.

use crate::error::Result;
use crate::row::{ColumnInfo, Row};
use crate::statement::Statement;
use std::collections::VecDeque;
use std::sync::Arc;

/// Forward-only cursor over the rows of one query.
pub trait RowCursor {
    /// Column labels of every row in this result.
    fn columns(&self) -> Arc<ColumnInfo>;

    /// Next row, or `None` once exhausted.
    fn next_row(&mut self) -> Result<Option<Row>>;

    /// Release the cursor early.
    fn close(&mut self) -> Result<()>;
}

/// A single database connection.
pub trait Connection {
    /// Execute a row-returning statement.
    fn query(&mut self, statement: &Statement) -> Result<Box<dyn RowCursor>>;

    /// Execute a DML statement and return the number of affected rows.
    fn execute(&mut self, statement: &Statement) -> Result<u64>;

    fn begin(&mut self) -> Result<()>;

    fn commit(&mut self) -> Result<()>;

    fn rollback(&mut self) -> Result<()>;

    /// Execute a query and drain its cursor.
    fn query_all(&mut self, statement: &Statement) -> Result<Vec<Row>> {
        let mut cursor = self.query(statement)?;
        let mut rows = Vec::new();
        while let Some(row) = cursor.next_row()? {
            rows.push(row);
        }
        cursor.close()?;
        Ok(rows)
    }
}

/// Source of connections, shared by every session of a factory.
pub trait ConnectionProvider: Send + Sync {
    fn connect(&self) -> Result<Box<dyn Connection>>;
}

/// A cursor over rows that are already in memory.
#[derive(Debug)]
pub struct VecCursor {
    columns: Arc<ColumnInfo>,
    rows: VecDeque<Row>,
    closed: bool,
}

impl VecCursor {
    pub fn new(columns: Arc<ColumnInfo>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into(),
            closed: false,
        }
    }
}

impl RowCursor for VecCursor {
    fn columns(&self) -> Arc<ColumnInfo> {
        Arc::clone(&self.columns)
    }

    fn next_row(&mut self) -> Result<Option<Row>> {
        if self.closed {
            return Ok(None);
        }
        Ok(self.rows.pop_front())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }
}
