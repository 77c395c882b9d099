use std::sync::Arc;

use crate::{
    catalog::{
        record::ValueSet,
        schema::{ColumnSet, Schema},
    },
    exec::value::Value,
    query::constraint::{Comparison, Constraint, Operand},
    util::names,
};

/// Walks a [`Constraint`] tree (see [`Constraint::accept`]).
///
/// Composite nodes are reported through `enter_*`/`leave_*` pairs around
/// their children, leaves through `visit_*`.
pub trait ConstraintVisitor {
    fn enter_and(&mut self, _len: usize) {}
    fn leave_and(&mut self) {}
    fn enter_or(&mut self, _len: usize) {}
    fn leave_or(&mut self) {}
    fn enter_not(&mut self) {}
    fn leave_not(&mut self) {}

    fn visit_equality(&mut self, column: &str, value: Option<&Value>);
    fn visit_rule(&mut self, column: &str, comparison: Comparison, operand: &Operand);
    fn visit_in(&mut self, column: &str, values: &[Value]);
}

/// Collects the equalities every matching record must satisfy, to find out
/// whether a query pins down a primary key.
///
/// Only equalities reachable from the root through `AND` nodes count, since
/// those under `OR` or `NOT` don't constrain every match.
#[derive(Debug, Default)]
pub struct KeyLookup {
    branching: usize,
    equalities: Vec<(String, Value)>,
}

impl KeyLookup {
    pub fn new() -> KeyLookup {
        KeyLookup::default()
    }

    /// Collects the equalities of all the given constraints, which are
    /// implicitly AND-ed.
    pub fn collect<'c>(constraints: impl IntoIterator<Item = &'c Constraint>) -> KeyLookup {
        let mut lookup = KeyLookup::new();
        for constraint in constraints {
            constraint.accept(&mut lookup);
        }
        lookup
    }

    /// The mandatory `column = value` pairs found so far.
    pub fn equalities(&self) -> &[(String, Value)] {
        &self.equalities
    }

    /// Builds the primary key of the given schema from the collected
    /// equalities. Returns `None` if the schema has no primary key, some key
    /// column isn't pinned down, or a value doesn't fit its column.
    pub fn key_for(&self, schema: &Arc<Schema>) -> Option<ValueSet<ColumnSet>> {
        let pk = schema.primary_key()?;
        let mut key = ValueSet::new(Arc::clone(pk.columns())).ok()?;
        let columns: Vec<_> = pk.columns().columns(false).cloned().collect();
        for column in columns {
            let (_, value) = self
                .equalities
                .iter()
                .find(|(name, _)| names::same(name, &column.name))?;
            column.store_value(&mut key, value.clone()).ok()?;
            // Normalisation may have dropped the value (e.g. empty strings).
            if !column.is_value_set(&key).ok()? {
                return None;
            }
        }
        Some(key)
    }
}

impl ConstraintVisitor for KeyLookup {
    fn enter_or(&mut self, _len: usize) {
        self.branching += 1;
    }

    fn leave_or(&mut self) {
        self.branching -= 1;
    }

    fn enter_not(&mut self) {
        self.branching += 1;
    }

    fn leave_not(&mut self) {
        self.branching -= 1;
    }

    fn visit_equality(&mut self, column: &str, value: Option<&Value>) {
        if let (0, Some(value)) = (self.branching, value) {
            self.equalities.push((column.to_owned(), value.clone()));
        }
    }

    fn visit_rule(&mut self, column: &str, comparison: Comparison, operand: &Operand) {
        if let (0, Comparison::Equal, Operand::Value(value)) = (self.branching, comparison, operand)
        {
            self.equalities.push((column.to_owned(), value.clone()));
        }
    }

    fn visit_in(&mut self, column: &str, values: &[Value]) {
        if let (0, [value]) = (self.branching, values) {
            self.equalities.push((column.to_owned(), value.clone()));
        }
    }
}

/// Renders a constraint tree as text, e.g. for logging.
#[derive(Debug)]
pub struct Describe {
    frames: Vec<Vec<String>>,
}

impl Describe {
    pub fn describe(constraint: &Constraint) -> String {
        let mut describe = Describe {
            frames: vec![Vec::new()],
        };
        constraint.accept(&mut describe);
        describe.frames.pop().unwrap_or_default().join(" ")
    }

    fn push(&mut self, text: String) {
        if let Some(frame) = self.frames.last_mut() {
            frame.push(text);
        }
    }

    fn close(&mut self, joiner: &str, empty: &str) {
        let parts = self.frames.pop().unwrap_or_default();
        let text = match parts.len() {
            0 => empty.to_owned(),
            1 => parts.into_iter().collect(),
            _ => format!("({})", parts.join(joiner)),
        };
        self.push(text);
    }
}

impl ConstraintVisitor for Describe {
    fn enter_and(&mut self, _len: usize) {
        self.frames.push(Vec::new());
    }

    fn leave_and(&mut self) {
        self.close(" AND ", "TRUE");
    }

    fn enter_or(&mut self, _len: usize) {
        self.frames.push(Vec::new());
    }

    fn leave_or(&mut self) {
        self.close(" OR ", "FALSE");
    }

    fn enter_not(&mut self) {
        self.frames.push(Vec::new());
    }

    fn leave_not(&mut self) {
        let inner = self.frames.pop().unwrap_or_default().join(" ");
        self.push(format!("NOT {inner}"));
    }

    fn visit_equality(&mut self, column: &str, value: Option<&Value>) {
        let text = match value {
            Some(value) => format!("{column} = {value}"),
            None => format!("{column} IS NULL"),
        };
        self.push(text);
    }

    fn visit_rule(&mut self, column: &str, comparison: Comparison, operand: &Operand) {
        let operand = match operand {
            Operand::Value(value) => value.to_string(),
            Operand::Column(other) => other.clone(),
        };
        self.push(format!("{column} {} {operand}", comparison.symbol()));
    }

    fn visit_in(&mut self, column: &str, values: &[Value]) {
        let values: Vec<String> = values.iter().map(ToString::to_string).collect();
        self.push(format!("{column} IN ({})", values.join(", ")));
    }
}
