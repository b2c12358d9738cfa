//! Structured SQL statements.
//!
//! The core never concatenates SQL itself; it produces [`Statement`] values
//! that a connection either interprets directly or renders with
//! [`Statement::to_sql`] and binds with [`Statement::params`].

use crate::value::Value;
use std::fmt;

/// A column qualified by its table alias.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnRef {
    pub alias: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(alias: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            column: column.into(),
        }
    }
}

impl fmt::Display for ColumnRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.alias, self.column)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    pub table: String,
    pub alias: String,
}

impl TableRef {
    pub fn new(table: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            alias: alias.into(),
        }
    }
}

/// A LEFT OUTER JOIN; `on` pairs a joined column with an already-visible one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Join {
    pub table: TableRef,
    pub on: Vec<(ColumnRef, ColumnRef)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    Eq(ColumnRef, Value),
    In(ColumnRef, Vec<Value>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectStatement {
    pub from: TableRef,
    pub joins: Vec<Join>,
    pub columns: Vec<ColumnRef>,
    pub filters: Vec<Predicate>,
    pub order_by: Vec<ColumnRef>,
}

impl SelectStatement {
    pub fn new(from: TableRef) -> Self {
        Self {
            from,
            joins: Vec::new(),
            columns: Vec::new(),
            filters: Vec::new(),
            order_by: Vec::new(),
        }
    }

    /// Append a selected column and return its position.
    pub fn push_column(&mut self, column: ColumnRef) -> usize {
        self.columns.push(column);
        self.columns.len() - 1
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertStatement {
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateStatement {
    pub table: String,
    pub assignments: Vec<(String, Value)>,
    /// Equality conditions (identifier, optionally version).
    pub conditions: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteStatement {
    pub table: String,
    pub conditions: Vec<(String, Value)>,
}

/// SQL text produced outside the core (query translator, user SQL).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeSql {
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Select(SelectStatement),
    Insert(InsertStatement),
    Update(UpdateStatement),
    Delete(DeleteStatement),
    Native(NativeSql),
}

impl Statement {
    /// Does this statement return rows?
    pub fn is_query(&self) -> bool {
        matches!(self, Statement::Select(_) | Statement::Native(_))
    }

    /// Target table of a DML statement.
    pub fn table(&self) -> Option<&str> {
        match self {
            Statement::Select(s) => Some(&s.from.table),
            Statement::Insert(s) => Some(&s.table),
            Statement::Update(s) => Some(&s.table),
            Statement::Delete(s) => Some(&s.table),
            Statement::Native(_) => None,
        }
    }

    /// Render with `?` placeholders.
    pub fn to_sql(&self) -> String {
        match self {
            Statement::Select(s) => render_select(s),
            Statement::Insert(s) => format!(
                "INSERT INTO {} ({}) VALUES ({})",
                s.table,
                s.columns.join(", "),
                vec!["?"; s.values.len()].join(", ")
            ),
            Statement::Update(s) => {
                let sets: Vec<String> = s
                    .assignments
                    .iter()
                    .map(|(c, _)| format!("{} = ?", c))
                    .collect();
                format!(
                    "UPDATE {} SET {}{}",
                    s.table,
                    sets.join(", "),
                    render_conditions(&s.conditions)
                )
            }
            Statement::Delete(s) => {
                format!("DELETE FROM {}{}", s.table, render_conditions(&s.conditions))
            }
            Statement::Native(n) => n.sql.clone(),
        }
    }

    /// Parameters in placeholder order.
    pub fn params(&self) -> Vec<Value> {
        match self {
            Statement::Select(s) => {
                let mut params = Vec::new();
                for filter in &s.filters {
                    match filter {
                        Predicate::Eq(_, v) if !v.is_null() => params.push(v.clone()),
                        Predicate::Eq(..) => {}
                        Predicate::In(_, vs) => params.extend(vs.iter().cloned()),
                    }
                }
                params
            }
            Statement::Insert(s) => s.values.clone(),
            Statement::Update(s) => s
                .assignments
                .iter()
                .map(|(_, v)| v.clone())
                .chain(condition_params(&s.conditions))
                .collect(),
            Statement::Delete(s) => condition_params(&s.conditions).collect(),
            Statement::Native(n) => n.params.clone(),
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_sql())
    }
}

fn render_select(s: &SelectStatement) -> String {
    let columns: Vec<String> = s.columns.iter().map(ToString::to_string).collect();
    let mut sql = format!(
        "SELECT {} FROM {} {}",
        columns.join(", "),
        s.from.table,
        s.from.alias
    );
    for join in &s.joins {
        let on: Vec<String> = join
            .on
            .iter()
            .map(|(l, r)| format!("{} = {}", l, r))
            .collect();
        sql.push_str(&format!(
            " LEFT OUTER JOIN {} {} ON {}",
            join.table.table,
            join.table.alias,
            on.join(" AND ")
        ));
    }
    if !s.filters.is_empty() {
        let filters: Vec<String> = s
            .filters
            .iter()
            .map(|p| match p {
                Predicate::Eq(c, v) if v.is_null() => format!("{} IS NULL", c),
                Predicate::Eq(c, _) => format!("{} = ?", c),
                Predicate::In(c, vs) => format!("{} IN ({})", c, vec!["?"; vs.len()].join(", ")),
            })
            .collect();
        sql.push_str(" WHERE ");
        sql.push_str(&filters.join(" AND "));
    }
    if !s.order_by.is_empty() {
        let order: Vec<String> = s.order_by.iter().map(ToString::to_string).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    sql
}

fn render_conditions(conditions: &[(String, Value)]) -> String {
    if conditions.is_empty() {
        return String::new();
    }
    let parts: Vec<String> = conditions
        .iter()
        .map(|(c, v)| {
            if v.is_null() {
                format!("{} IS NULL", c)
            } else {
                format!("{} = ?", c)
            }
        })
        .collect();
    format!(" WHERE {}", parts.join(" AND "))
}

fn condition_params(conditions: &[(String, Value)]) -> impl Iterator<Item = Value> + '_ {
    conditions
        .iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(_, v)| v.clone())
}
