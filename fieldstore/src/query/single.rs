use std::cmp::Ordering;

use crate::{
    catalog::record::Record,
    error::{DbResult, Error},
    exec::value::cmp_nullable,
    query::records::RecordsQuery,
};

/// How a [`SingleRecordQuery`] picks its record among the results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    First,
    Last,
    /// The only result. More than one result is an error.
    Unique,
    /// The result with the largest (or smallest) value of the column.
    /// Records without a value are ignored; ties go to the earliest result.
    Extreme { column: String, largest: bool },
}

/// Reduces the results of a [`RecordsQuery`] to at most one record.
#[derive(Clone, Debug)]
pub struct SingleRecordQuery {
    query: RecordsQuery,
    selection: Selection,
}

impl SingleRecordQuery {
    pub fn new(query: RecordsQuery, selection: Selection) -> SingleRecordQuery {
        SingleRecordQuery { query, selection }
    }

    pub fn first(query: RecordsQuery) -> SingleRecordQuery {
        SingleRecordQuery::new(query, Selection::First)
    }

    pub fn last(query: RecordsQuery) -> SingleRecordQuery {
        SingleRecordQuery::new(query, Selection::Last)
    }

    pub fn unique(query: RecordsQuery) -> SingleRecordQuery {
        SingleRecordQuery::new(query, Selection::Unique)
    }

    pub fn extreme(query: RecordsQuery, column: impl Into<String>, largest: bool) -> SingleRecordQuery {
        let column = column.into();
        SingleRecordQuery::new(query, Selection::Extreme { column, largest })
    }

    pub fn query(&self) -> &RecordsQuery {
        &self.query
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Runs the underlying query and selects the record.
    pub fn execute(&self, records: impl IntoIterator<Item = Record>) -> DbResult<Option<Record>> {
        let results = self.query.execute(records)?;
        self.select(results)
    }

    /// Selects the record among already computed query results.
    pub fn select(&self, results: Vec<Record>) -> DbResult<Option<Record>> {
        match &self.selection {
            Selection::First => Ok(results.into_iter().next()),
            Selection::Last => Ok(results.into_iter().last()),
            Selection::Unique => {
                if results.len() > 1 {
                    return Err(Error::NotUnique(results.len()));
                }
                Ok(results.into_iter().next())
            }
            Selection::Extreme { column, largest } => {
                let mut best = None;
                for record in results {
                    let Some(column) = record.schema().column(column) else {
                        continue;
                    };
                    let Some(value) = column.retrieve_value(&record)?.map(|v| v.into_owned())
                    else {
                        continue;
                    };
                    let better = match &best {
                        None => true,
                        Some((current, _)) => {
                            let ordering = cmp_nullable(Some(&value), Some(current));
                            if *largest {
                                ordering == Ordering::Greater
                            } else {
                                ordering == Ordering::Less
                            }
                        }
                    };
                    if better {
                        best = Some((value, record));
                    }
                }
                Ok(best.map(|(_, record)| record))
            }
        }
    }
}
