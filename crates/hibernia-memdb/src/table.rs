//! Tables, rows and constraint checks.

use hibernia_core::{Error, QueryError, QueryErrorKind, Result, Value};
use std::cmp::Ordering;
use std::collections::HashMap;

/// A foreign key from `columns` to the primary key of `table`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub table: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub nullable: bool,
}

#[derive(Debug, Clone)]
pub struct Table {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
    pub(crate) rows: Vec<Vec<Value>>,
    index: HashMap<String, usize>,
}

impl Table {
    pub fn new(name: impl Into<String>, primary_key: Vec<String>) -> Self {
        let mut table = Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: primary_key.clone(),
            foreign_keys: Vec::new(),
            rows: Vec::new(),
            index: HashMap::new(),
        };
        for column in primary_key {
            table.add_column(column, false);
        }
        table
    }

    /// Add a column unless one with this name exists. A column added twice
    /// is nullable if either declaration is.
    pub fn add_column(&mut self, name: impl Into<String>, nullable: bool) {
        let name = name.into();
        if let Some(&i) = self.index.get(&name) {
            self.columns[i].nullable |= nullable;
            return;
        }
        self.index.insert(name.clone(), self.columns.len());
        self.columns.push(ColumnDef { name, nullable });
        for row in &mut self.rows {
            row.push(Value::Null);
        }
    }

    pub fn add_foreign_key(&mut self, fk: ForeignKey) {
        if !self.foreign_keys.contains(&fk) {
            self.foreign_keys.push(fk);
        }
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.index.get(name).copied().ok_or_else(|| {
            Error::Query(QueryError::new(
                QueryErrorKind::NotFound,
                format!("no column '{}' in table '{}'", name, self.name),
            ))
        })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub(crate) fn value<'a>(&self, row: &'a [Value], column: &str) -> Result<&'a Value> {
        let index = self.column_index(column)?;
        Ok(row.get(index).unwrap_or(&Value::Null))
    }

    pub(crate) fn key_of(&self, row: &[Value]) -> Result<Vec<Value>> {
        self.primary_key
            .iter()
            .map(|c| self.value(row, c).cloned())
            .collect()
    }

    /// Rows whose columns equal `conditions`; a NULL condition means IS NULL.
    pub(crate) fn matching(&self, conditions: &[(String, Value)]) -> Result<Vec<usize>> {
        let columns: Vec<(usize, &Value)> = conditions
            .iter()
            .map(|(c, v)| Ok((self.column_index(c)?, v)))
            .collect::<Result<_>>()?;
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| {
                columns.iter().all(|(i, expected)| match expected {
                    Value::Null => row[*i].is_null(),
                    v => loosely_equal(&row[*i], v),
                })
            })
            .map(|(i, _)| i)
            .collect())
    }

    pub(crate) fn find_key(&self, key: &[Value]) -> Result<Option<usize>> {
        let conditions: Vec<(String, Value)> = self
            .primary_key
            .iter()
            .cloned()
            .zip(key.iter().cloned())
            .collect();
        Ok(self.matching(&conditions)?.first().copied())
    }

    /// Check NOT NULL and primary key uniqueness of a candidate row.
    pub(crate) fn check_row(&self, row: &[Value], replacing: Option<usize>) -> Result<()> {
        for (def, value) in self.columns.iter().zip(row) {
            if !def.nullable && value.is_null() {
                return Err(constraint(format!(
                    "NOT NULL constraint failed: {}.{}",
                    self.name, def.name
                )));
            }
        }
        let key = self.key_of(row)?;
        if let Some(existing) = self.find_key(&key)? {
            if Some(existing) != replacing {
                return Err(constraint(format!(
                    "UNIQUE constraint failed: {}.{}",
                    self.name,
                    self.primary_key.join(", ")
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn constraint(message: String) -> Error {
    Error::Query(QueryError::new(QueryErrorKind::Constraint, message))
}

/// Equality that treats INTEGER and BIGINT as one type.
pub fn loosely_equal(a: &Value, b: &Value) -> bool {
    if a.is_null() || b.is_null() {
        return false;
    }
    match (integer(a), integer(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn integer(v: &Value) -> Option<i64> {
    match v {
        Value::Int(i) => Some(i64::from(*i)),
        Value::BigInt(i) => Some(*i),
        _ => None,
    }
}

/// Ordering for ORDER BY: NULLs first, numbers numerically, the rest by text.
pub fn compare(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        _ => match (integer(a), integer(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.to_string().cmp(&b.to_string()),
            },
        },
    }
}
