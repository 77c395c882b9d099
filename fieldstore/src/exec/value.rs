use std::{cmp::Ordering, fmt};

use crate::types::location::Location;

/// A column value.
///
/// Absence of a value is represented by `Option::<Value>::None`, never by a
/// variant of this enum.
#[derive(Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    Float(f64),
    String(String),
    /// Milliseconds since the Unix epoch, in UTC.
    DateTime(i64),
    Location(Location),
    /// The key of a referenced record, one slot per key column.
    Composite(Vec<Option<Value>>),
}

impl Value {
    /// Returns the canonical kind name.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "boolean",
            Value::Integer(_) => "integer",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::DateTime(_) => "datetime",
            Value::Location(_) => "location",
            Value::Composite(_) => "composite",
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Value::Integer(inner) => Some(*inner),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(inner) => Some(inner),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<i64> {
        match self {
            Value::DateTime(inner) => Some(*inner),
            _ => None,
        }
    }

    pub fn as_location(&self) -> Option<&Location> {
        match self {
            Value::Location(inner) => Some(inner),
            _ => None,
        }
    }

    /// Position of the kind in the sort order of mixed kinds.
    fn kind_rank(&self) -> u8 {
        match self {
            Value::Boolean(_) => 0,
            Value::Integer(_) => 1,
            Value::Float(_) => 2,
            Value::String(_) => 3,
            Value::DateTime(_) => 4,
            Value::Location(_) => 5,
            Value::Composite(_) => 6,
        }
    }

    /// Compares two values of the same kind.
    ///
    /// Returns `None` for values of different kinds and for locations, which
    /// have no natural order.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => Some(a.cmp(b)),
            (Value::Integer(a), Value::Integer(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => Some(a.total_cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            (Value::Composite(a), Value::Composite(b)) => {
                for (a, b) in a.iter().zip(b) {
                    match cmp_nullable(a.as_ref(), b.as_ref()) {
                        Ordering::Equal => continue,
                        other => return Some(other),
                    }
                }
                Some(a.len().cmp(&b.len()))
            }
            _ => None,
        }
    }
}

/// Total order over optional values used for sorting: absent values come
/// first, values of different kinds are ordered by kind, and locations are
/// all equal.
pub fn cmp_nullable(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a
            .compare(b)
            .unwrap_or_else(|| a.kind_rank().cmp(&b.kind_rank())),
    }
}

macro_rules! impl_from {
    ($($type:ty => $variant:ident),+ $(,)?) => {
        $(
            impl From<$type> for Value {
                fn from(value: $type) -> Self {
                    Value::$variant(value.into())
                }
            }
        )+
    };
}

impl_from! {
    bool => Boolean,
    i64 => Integer,
    i32 => Integer,
    u32 => Integer,
    f64 => Float,
    f32 => Float,
    String => String,
    &str => String,
    Location => Location,
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(inner) => inner.fmt(f),
            Value::Integer(inner) => inner.fmt(f),
            Value::Float(inner) => inner.fmt(f),
            Value::String(inner) => inner.fmt(f),
            Value::DateTime(inner) => write!(f, "@{inner}"),
            Value::Location(inner) => inner.fmt(f),
            Value::Composite(parts) => {
                f.write_str("(")?;
                for (i, part) in parts.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    match part {
                        Some(part) => part.fmt(f)?,
                        None => f.write_str("null")?,
                    }
                }
                f.write_str(")")
            }
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(inner) => inner.fmt(f),
            other => fmt::Display::fmt(other, f),
        }
    }
}
