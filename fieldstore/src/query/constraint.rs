use std::{cmp::Ordering, fmt};

use crate::{
    catalog::record::Record,
    error::DbResult,
    exec::value::Value,
    query::visitor::ConstraintVisitor,
};

/// Comparison operator of a [`Constraint::Rule`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Comparison {
    Smaller,
    SmallerOrEqual,
    Equal,
    NotEqual,
    GreaterOrEqual,
    Greater,
}

impl Comparison {
    pub fn symbol(self) -> &'static str {
        match self {
            Comparison::Smaller => "<",
            Comparison::SmallerOrEqual => "<=",
            Comparison::Equal => "=",
            Comparison::NotEqual => "!=",
            Comparison::GreaterOrEqual => ">=",
            Comparison::Greater => ">",
        }
    }

    fn holds(self, ordering: Ordering) -> bool {
        match self {
            Comparison::Smaller => ordering.is_lt(),
            Comparison::SmallerOrEqual => ordering.is_le(),
            Comparison::Equal => ordering.is_eq(),
            Comparison::NotEqual => ordering.is_ne(),
            Comparison::GreaterOrEqual => ordering.is_ge(),
            Comparison::Greater => ordering.is_gt(),
        }
    }
}

/// Right-hand side of a [`Constraint::Rule`].
#[derive(Clone, Debug, PartialEq)]
pub enum Operand {
    Value(Value),
    /// Another column of the same record.
    Column(String),
}

/// A predicate over records.
///
/// Leaves referencing a column the record's schema doesn't have never hold.
#[derive(Clone, Debug, PartialEq)]
pub enum Constraint {
    /// Holds if every part holds (or there are no parts).
    And(Vec<Constraint>),
    /// Holds if any part holds.
    Or(Vec<Constraint>),
    Not(Box<Constraint>),
    /// Holds if the column value equals the given one; a `None` value checks
    /// that the column has no value.
    Equality {
        column: String,
        value: Option<Value>,
    },
    /// Compares the column value with an operand. Never holds if either side
    /// is absent or the values aren't comparable.
    Rule {
        column: String,
        comparison: Comparison,
        operand: Operand,
    },
    /// Holds if the column value is one of the given values.
    In { column: String, values: Vec<Value> },
}

impl Constraint {
    pub fn equal(column: impl Into<String>, value: impl Into<Option<Value>>) -> Constraint {
        Constraint::Equality {
            column: column.into(),
            value: value.into(),
        }
    }

    pub fn is_null(column: impl Into<String>) -> Constraint {
        Constraint::equal(column, None::<Value>)
    }

    pub fn is_not_null(column: impl Into<String>) -> Constraint {
        Constraint::not(Constraint::is_null(column))
    }

    pub fn rule(
        column: impl Into<String>,
        comparison: Comparison,
        value: impl Into<Value>,
    ) -> Constraint {
        Constraint::Rule {
            column: column.into(),
            comparison,
            operand: Operand::Value(value.into()),
        }
    }

    /// Compares two columns of the same record.
    pub fn compare_columns(
        column: impl Into<String>,
        comparison: Comparison,
        other: impl Into<String>,
    ) -> Constraint {
        Constraint::Rule {
            column: column.into(),
            comparison,
            operand: Operand::Column(other.into()),
        }
    }

    pub fn one_of(column: impl Into<String>, values: Vec<Value>) -> Constraint {
        Constraint::In {
            column: column.into(),
            values,
        }
    }

    pub fn not(constraint: Constraint) -> Constraint {
        Constraint::Not(Box::new(constraint))
    }

    /// Checks whether the record satisfies the constraint.
    pub fn is_valid(&self, record: &Record) -> DbResult<bool> {
        match self {
            Constraint::And(parts) => {
                for part in parts {
                    if !part.is_valid(record)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Constraint::Or(parts) => {
                for part in parts {
                    if part.is_valid(record)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Constraint::Not(inner) => Ok(!inner.is_valid(record)?),
            Constraint::Equality { column, value } => {
                let Some(actual) = lookup(record, column)? else {
                    return Ok(false);
                };
                Ok(actual.as_ref() == value.as_ref())
            }
            Constraint::Rule {
                column,
                comparison,
                operand,
            } => {
                let Some(Some(actual)) = lookup(record, column)? else {
                    return Ok(false);
                };
                let other = match operand {
                    Operand::Value(value) => Some(value.clone()),
                    Operand::Column(name) => lookup(record, name)?.flatten(),
                };
                Ok(other
                    .and_then(|other| actual.compare(&other))
                    .map_or(false, |ordering| comparison.holds(ordering)))
            }
            Constraint::In { column, values } => {
                let Some(Some(actual)) = lookup(record, column)? else {
                    return Ok(false);
                };
                Ok(values.contains(&actual))
            }
        }
    }

    /// Walks the constraint tree, depth first.
    pub fn accept(&self, visitor: &mut dyn ConstraintVisitor) {
        match self {
            Constraint::And(parts) => {
                visitor.enter_and(parts.len());
                parts.iter().for_each(|part| part.accept(visitor));
                visitor.leave_and();
            }
            Constraint::Or(parts) => {
                visitor.enter_or(parts.len());
                parts.iter().for_each(|part| part.accept(visitor));
                visitor.leave_or();
            }
            Constraint::Not(inner) => {
                visitor.enter_not();
                inner.accept(visitor);
                visitor.leave_not();
            }
            Constraint::Equality { column, value } => {
                visitor.visit_equality(column, value.as_ref())
            }
            Constraint::Rule {
                column,
                comparison,
                operand,
            } => visitor.visit_rule(column, *comparison, operand),
            Constraint::In { column, values } => visitor.visit_in(column, values),
        }
    }

    /// Names of the columns the constraint refers to.
    pub fn columns(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_columns(&mut out);
        out
    }

    fn collect_columns<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Constraint::And(parts) | Constraint::Or(parts) => {
                parts.iter().for_each(|part| part.collect_columns(out))
            }
            Constraint::Not(inner) => inner.collect_columns(out),
            Constraint::Equality { column, .. } | Constraint::In { column, .. } => {
                out.push(column)
            }
            Constraint::Rule {
                column, operand, ..
            } => {
                out.push(column);
                if let Operand::Column(other) = operand {
                    out.push(other);
                }
            }
        }
    }
}

impl fmt::Display for Constraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&crate::query::visitor::Describe::describe(self))
    }
}

/// Returns `None` if the schema has no such column, otherwise the (possibly
/// absent) value.
fn lookup(record: &Record, name: &str) -> DbResult<Option<Option<Value>>> {
    let Some(column) = record.schema().column(name) else {
        return Ok(None);
    };
    Ok(Some(column.retrieve_value(record)?.map(|v| v.into_owned())))
}
