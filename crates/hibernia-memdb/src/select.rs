//! Evaluation of structured selects over in-memory tables.

use crate::table::{Table, compare, loosely_equal};
use hibernia_core::{
    ColumnRef, Error, Predicate, QueryError, QueryErrorKind, Result, SelectStatement, Value,
};
use std::collections::HashMap;

/// One joined result tuple: the row index bound to each alias, `None` for
/// the NULL side of an outer join.
type Tuple = Vec<Option<usize>>;

struct Scope<'a> {
    aliases: Vec<(&'a str, &'a Table)>,
}

impl<'a> Scope<'a> {
    fn position(&self, alias: &str) -> Result<usize> {
        self.aliases
            .iter()
            .position(|(a, _)| *a == alias)
            .ok_or_else(|| {
                Error::Query(QueryError::new(
                    QueryErrorKind::NotFound,
                    format!("unknown table alias '{}'", alias),
                ))
            })
    }

    fn value(&self, tuple: &Tuple, column: &ColumnRef) -> Result<Value> {
        let position = self.position(&column.alias)?;
        let table = self.aliases[position].1;
        match tuple.get(position).copied().flatten() {
            Some(row) => table.value(&table.rows[row], &column.column).cloned(),
            None => {
                table.column_index(&column.column)?;
                Ok(Value::Null)
            }
        }
    }
}

/// Run `select` and return its column labels and rows.
pub(crate) fn evaluate(
    tables: &HashMap<String, Table>,
    select: &SelectStatement,
) -> Result<(Vec<String>, Vec<Vec<Value>>)> {
    let lookup = |name: &str| {
        tables.get(name).ok_or_else(|| {
            Error::Query(QueryError::new(
                QueryErrorKind::NotFound,
                format!("no such table: {}", name),
            ))
        })
    };

    let mut scope = Scope {
        aliases: vec![(select.from.alias.as_str(), lookup(&select.from.table)?)],
    };
    let mut tuples: Vec<Tuple> = (0..scope.aliases[0].1.len()).map(|i| vec![Some(i)]).collect();

    for join in &select.joins {
        let table = lookup(&join.table.table)?;
        scope.aliases.push((join.table.alias.as_str(), table));
        let mut joined = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let mut matched = false;
            for candidate in 0..table.len() {
                let mut extended = tuple.clone();
                extended.push(Some(candidate));
                let mut all = true;
                for (left, right) in &join.on {
                    if !loosely_equal(&scope.value(&extended, left)?, &scope.value(&extended, right)?) {
                        all = false;
                        break;
                    }
                }
                if all {
                    matched = true;
                    joined.push(extended);
                }
            }
            if !matched {
                let mut extended = tuple;
                extended.push(None);
                joined.push(extended);
            }
        }
        tuples = joined;
    }

    let mut filtered = Vec::with_capacity(tuples.len());
    for tuple in tuples {
        if passes(&scope, &tuple, &select.filters)? {
            filtered.push(tuple);
        }
    }

    let mut keyed = Vec::with_capacity(filtered.len());
    for tuple in filtered {
        let key = select
            .order_by
            .iter()
            .map(|c| scope.value(&tuple, c))
            .collect::<Result<Vec<_>>>()?;
        keyed.push((key, tuple));
    }
    keyed.sort_by(|(a, _), (b, _)| {
        a.iter()
            .zip(b)
            .map(|(x, y)| compare(x, y))
            .find(|o| o.is_ne())
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let labels = select.columns.iter().map(ToString::to_string).collect();
    let mut rows = Vec::with_capacity(keyed.len());
    for (_, tuple) in keyed {
        rows.push(
            select
                .columns
                .iter()
                .map(|c| scope.value(&tuple, c))
                .collect::<Result<Vec<_>>>()?,
        );
    }
    Ok((labels, rows))
}

fn passes(scope: &Scope<'_>, tuple: &Tuple, filters: &[Predicate]) -> Result<bool> {
    for filter in filters {
        let ok = match filter {
            Predicate::Eq(column, Value::Null) => scope.value(tuple, column)?.is_null(),
            Predicate::Eq(column, expected) => loosely_equal(&scope.value(tuple, column)?, expected),
            Predicate::In(column, values) => {
                let actual = scope.value(tuple, column)?;
                values.iter().any(|v| loosely_equal(&actual, v))
            }
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}
