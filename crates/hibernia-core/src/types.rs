//! Semantic property types.
//!
//! A [`SemanticType`] decides how a property value is checked on assignment,
//! coerced when read from a row, and compared during dirty checking.

use crate::error::TypeError;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Semantic types of basic properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SemanticType {
    Boolean,
    Integer,
    Long,
    Double,
    Decimal,
    Text,
    Binary,
    Date,
    Timestamp,
    Uuid,
    Json,
}

impl SemanticType {
    /// Get the SQL type name for this type.
    pub const fn sql_name(self) -> &'static str {
        match self {
            SemanticType::Boolean => "BOOLEAN",
            SemanticType::Integer => "INTEGER",
            SemanticType::Long => "BIGINT",
            SemanticType::Double => "DOUBLE PRECISION",
            SemanticType::Decimal => "DECIMAL",
            SemanticType::Text => "TEXT",
            SemanticType::Binary => "BLOB",
            SemanticType::Date => "DATE",
            SemanticType::Timestamp => "TIMESTAMP",
            SemanticType::Uuid => "UUID",
            SemanticType::Json => "JSON",
        }
    }

    /// Check if this type is numeric.
    pub const fn is_numeric(self) -> bool {
        matches!(
            self,
            SemanticType::Integer | SemanticType::Long | SemanticType::Double | SemanticType::Decimal
        )
    }

    /// Whether a value may be assigned to a property of this type.
    ///
    /// NULL is always accepted here; nullability is checked separately.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (SemanticType::Boolean, Value::Bool(_)) => true,
            (SemanticType::Integer, Value::Int(_)) => true,
            (SemanticType::Integer, Value::BigInt(v)) => i32::try_from(*v).is_ok(),
            (SemanticType::Long, Value::Int(_) | Value::BigInt(_)) => true,
            (SemanticType::Double, Value::Double(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (SemanticType::Decimal, Value::Decimal(_) | Value::Int(_) | Value::BigInt(_)) => true,
            (SemanticType::Text, Value::Text(_)) => true,
            (SemanticType::Binary, Value::Bytes(_)) => true,
            (SemanticType::Date, Value::Date(_)) => true,
            (SemanticType::Timestamp, Value::Timestamp(_)) => true,
            (SemanticType::Uuid, Value::Uuid(_)) => true,
            (SemanticType::Json, Value::Json(_)) => true,
            _ => false,
        }
    }

    /// Normalize a value into this type's canonical representation.
    pub fn coerce(self, value: Value) -> Result<Value, TypeError> {
        if !self.accepts(&value) {
            return Err(TypeError {
                expected: self.sql_name(),
                actual: value.type_name().to_string(),
                entity: None,
                property: None,
            });
        }
        Ok(match (self, value) {
            (_, Value::Null) => Value::Null,
            (SemanticType::Integer, Value::BigInt(v)) => {
                i32::try_from(v).map_or(Value::BigInt(v), Value::Int)
            }
            (SemanticType::Long, Value::Int(v)) => Value::BigInt(i64::from(v)),
            (SemanticType::Double, Value::Int(v)) => Value::Double(f64::from(v)),
            (SemanticType::Double, Value::BigInt(v)) => Value::Double(v as f64),
            (SemanticType::Decimal, Value::Int(v)) => Value::Decimal(v.to_string()),
            (SemanticType::Decimal, Value::BigInt(v)) => Value::Decimal(v.to_string()),
            (_, other) => other,
        })
    }

    /// Semantic equality used by dirty checking.
    ///
    /// Integers compare by numeric value across widths, decimals compare
    /// ignoring insignificant zeros, everything else compares structurally.
    pub fn is_equal(self, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Null, _) | (_, Value::Null) => false,
            _ => match self {
                SemanticType::Integer | SemanticType::Long => match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => a == b,
                },
                SemanticType::Double => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x.to_bits() == y.to_bits(),
                    _ => a == b,
                },
                SemanticType::Decimal => match (decimal_text(a), decimal_text(b)) {
                    (Some(x), Some(y)) => normalize_decimal(&x) == normalize_decimal(&y),
                    _ => a == b,
                },
                _ => a == b,
            },
        }
    }
}

fn decimal_text(v: &Value) -> Option<String> {
    match v {
        Value::Decimal(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::BigInt(i) => Some(i.to_string()),
        _ => None,
    }
}

/// Strip a leading `+`, leading zeros and trailing fractional zeros.
pub fn normalize_decimal(s: &str) -> String {
    let s = s.trim();
    let (negative, digits) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s.strip_prefix('+').unwrap_or(s)),
    };
    let (int_part, frac_part) = digits.split_once('.').unwrap_or((digits, ""));
    let int_part = int_part.trim_start_matches('0');
    let frac_part = frac_part.trim_end_matches('0');
    let int_part = if int_part.is_empty() { "0" } else { int_part };
    let mut out = String::new();
    if negative && !(int_part == "0" && frac_part.is_empty()) {
        out.push('-');
    }
    out.push_str(int_part);
    if !frac_part.is_empty() {
        out.push('.');
        out.push_str(frac_part);
    }
    out
}
