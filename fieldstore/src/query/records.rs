use std::{cmp::Ordering, fmt, sync::Arc};

use crate::{
    catalog::{
        record::{Record, ValueSet},
        schema::{ColumnSet, Schema, SchemaId},
    },
    error::{DbResult, Error},
    exec::value::{cmp_nullable, Value},
    query::{constraint::Constraint, visitor::KeyLookup},
};

/// The schemas whose records a query considers.
#[derive(Clone, Debug)]
pub enum Source {
    /// Records of any schema.
    Any,
    Schemas(Vec<Arc<Schema>>),
}

impl Source {
    pub fn schema(schema: Arc<Schema>) -> Source {
        Source::Schemas(vec![schema])
    }

    pub fn schemas(schemas: impl IntoIterator<Item = Arc<Schema>>) -> Source {
        Source::Schemas(schemas.into_iter().collect())
    }

    /// Checks whether records of the schema are part of the source.
    pub fn accepts(&self, schema: &Schema) -> bool {
        match self {
            Source::Any => true,
            Source::Schemas(schemas) => schemas.iter().any(|s| s.id() == schema.id()),
        }
    }

    /// Ids of the source schemas (`None` for any schema).
    pub fn schema_ids(&self) -> Option<Vec<SchemaId>> {
        match self {
            Source::Any => None,
            Source::Schemas(schemas) => Some(schemas.iter().map(|s| s.id()).collect()),
        }
    }
}

/// Order by direction.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum OrderByDirection {
    #[default]
    Asc,
    Desc,
}

/// Sort order of a query result: by the value of a single column.
///
/// Absent values come first in ascending order (so last in descending
/// order). The sort is stable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub direction: OrderByDirection,
}

impl Order {
    pub fn asc(column: impl Into<String>) -> Order {
        Order {
            column: column.into(),
            direction: OrderByDirection::Asc,
        }
    }

    pub fn desc(column: impl Into<String>) -> Order {
        Order {
            column: column.into(),
            direction: OrderByDirection::Desc,
        }
    }

    fn cmp(&self, a: Option<&Value>, b: Option<&Value>) -> Ordering {
        let ordering = cmp_nullable(a, b);
        match self.direction {
            OrderByDirection::Asc => ordering,
            OrderByDirection::Desc => ordering.reverse(),
        }
    }
}

/// A filter, sort and limit pipeline over records.
#[derive(Clone, Debug)]
pub struct RecordsQuery {
    source: Source,
    constraints: Vec<Constraint>,
    order: Option<Order>,
    limit: Option<usize>,
}

/// Builds a [`RecordsQuery`].
#[derive(Clone, Debug)]
pub struct RecordsQueryBuilder {
    query: RecordsQuery,
}

impl RecordsQueryBuilder {
    /// Adds a constraint. All constraints must hold.
    pub fn constraint(mut self, constraint: Constraint) -> Self {
        self.query.constraints.push(constraint);
        self
    }

    pub fn order_by(mut self, order: Order) -> Self {
        self.query.order = Some(order);
        self
    }

    /// Limits the number of results, which must be positive.
    pub fn limit(mut self, limit: usize) -> Self {
        self.query.limit = Some(limit);
        self
    }

    pub fn build(self) -> DbResult<RecordsQuery> {
        let query = self.query;
        if query.limit == Some(0) {
            return Err(Error::InvalidQuery("the limit must be positive".into()));
        }
        if let (Some(order), Source::Schemas(schemas)) = (&query.order, &query.source) {
            if let Some(schema) = schemas.iter().find(|s| s.column(&order.column).is_none()) {
                return Err(Error::InvalidQuery(
                    format!(
                        "can't order by `{}`: no such column in `{}`",
                        order.column,
                        schema.name()
                    )
                    .into(),
                ));
            }
        }
        Ok(query)
    }
}

impl RecordsQuery {
    pub fn builder(source: Source) -> RecordsQueryBuilder {
        RecordsQueryBuilder {
            query: RecordsQuery {
                source,
                constraints: Vec::new(),
                order: None,
                limit: None,
            },
        }
    }

    /// All records of the source, in store order.
    pub fn all(source: Source) -> RecordsQuery {
        RecordsQuery {
            source,
            constraints: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn source(&self) -> &Source {
        &self.source
    }

    pub fn constraints(&self) -> &[Constraint] {
        &self.constraints
    }

    pub fn order(&self) -> Option<&Order> {
        self.order.as_ref()
    }

    /// The maximum number of results, `None` meaning unbounded.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Checks whether the record is part of the source and satisfies every
    /// constraint.
    pub fn matches(&self, record: &Record) -> DbResult<bool> {
        if !self.source.accepts(record.schema()) {
            return Ok(false);
        }
        for constraint in &self.constraints {
            if !constraint.is_valid(record)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// If the query targets a single schema and pins down all of its primary
    /// key columns, returns that schema and the key.
    pub fn key_lookup(&self) -> Option<(Arc<Schema>, ValueSet<ColumnSet>)> {
        let Source::Schemas(schemas) = &self.source else {
            return None;
        };
        let [schema] = schemas.as_slice() else {
            return None;
        };
        let key = KeyLookup::collect(&self.constraints).key_for(schema)?;
        Some((Arc::clone(schema), key))
    }

    /// Runs the filter, sort and limit pipeline over the records.
    pub fn execute(&self, records: impl IntoIterator<Item = Record>) -> DbResult<Vec<Record>> {
        let mut matching = Vec::new();
        for record in records {
            if self.matches(&record)? {
                matching.push(record);
            }
        }

        if let Some(order) = &self.order {
            let mut keyed = matching
                .into_iter()
                .map(|record| Ok((sort_key(&record, &order.column)?, record)))
                .collect::<DbResult<Vec<_>>>()?;
            keyed.sort_by(|(a, _), (b, _)| order.cmp(a.as_ref(), b.as_ref()));
            matching = keyed.into_iter().map(|(_, record)| record).collect();
        }

        if let Some(limit) = self.limit {
            matching.truncate(limit);
        }
        Ok(matching)
    }
}

fn sort_key(record: &Record, column: &str) -> DbResult<Option<Value>> {
    match record.schema().column(column) {
        Some(column) => Ok(column.retrieve_value(record)?.map(|v| v.into_owned())),
        None => Ok(None),
    }
}

impl fmt::Display for RecordsQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Source::Any => f.write_str("FROM *")?,
            Source::Schemas(schemas) => {
                let names: Vec<&str> = schemas.iter().map(|s| s.name()).collect();
                write!(f, "FROM {}", names.join(", "))?;
            }
        }
        if !self.constraints.is_empty() {
            write!(f, " WHERE {}", Constraint::And(self.constraints.clone()))?;
        }
        if let Some(order) = &self.order {
            let direction = match order.direction {
                OrderByDirection::Asc => "ASC",
                OrderByDirection::Desc => "DESC",
            };
            write!(f, " ORDER BY {} {direction}", order.column)?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}
