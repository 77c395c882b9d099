//! Record export.
//!
//! Exports track what they wrote through the `LastExportedAt` column of
//! change tracking schemas, so that later exports can skip records that
//! didn't change since.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use tokio::fs;
use tracing::{debug, info, instrument};

use crate::{
    catalog::{column::Column, record::Record, schema::Schema},
    config::{LAST_EXPORTED_AT, LAST_STORED_AT},
    error::DbResult,
    query::{Comparison, Constraint, Order, RecordsQuery, Source},
    store::{RecordStore, StoreAction},
};

/// File suffix of CSV exports.
pub const CSV_FILE_SUFFIX: &str = "csv";

/// Builds the query selecting the records to export.
///
/// With `exclude_exported`, records exported after their last store are
/// left out.
pub fn exporter_query(
    source: Source,
    order: Option<Order>,
    limit: Option<usize>,
    constraints: Vec<Constraint>,
    exclude_exported: bool,
) -> DbResult<RecordsQuery> {
    let mut builder = RecordsQuery::builder(source);
    for constraint in constraints {
        builder = builder.constraint(constraint);
    }
    if exclude_exported {
        builder = builder.constraint(Constraint::Or(vec![
            Constraint::is_null(LAST_EXPORTED_AT),
            Constraint::compare_columns(LAST_EXPORTED_AT, Comparison::Smaller, LAST_STORED_AT),
        ]));
    }
    if let Some(order) = order {
        builder = builder.order_by(order);
    }
    if let Some(limit) = limit {
        builder = builder.limit(limit);
    }
    builder.build()
}

/// Stamps the records as exported at `export_time`, without touching their
/// `LastStoredAt`.
///
/// All records are updated in a single transaction.
#[instrument(name = "mark_as_exported", level = "debug", skip_all, fields(count = records.len()))]
pub async fn mark_as_exported<S>(
    store: &mut S,
    records: &mut [Record],
    export_time: DateTime<Utc>,
) -> DbResult<()>
where
    S: RecordStore + ?Sized,
{
    store.start_transaction().await?;
    let mut result = Ok(());
    for record in records.iter_mut() {
        result = mark(store, record, export_time).await;
        if result.is_err() {
            break;
        }
    }
    match result {
        Ok(()) => store.commit_transaction().await,
        Err(error) => {
            store.rollback_transaction().await?;
            Err(error)
        }
    }
}

async fn mark<S>(store: &mut S, record: &mut Record, export_time: DateTime<Utc>) -> DbResult<()>
where
    S: RecordStore + ?Sized,
{
    record.set_last_exported_at(Some(export_time.timestamp_millis()))?;
    store
        .store(record, StoreAction::UpdateOnlyExceptLsa)
        .await?;
    Ok(())
}

/// Walks the columns of a schema, in order.
pub trait SchemaTraverser {
    /// Whether virtual columns are visited.
    fn include_virtual_columns(&self) -> bool {
        true
    }

    fn enter_schema(&mut self, _schema: &Schema) {}

    fn visit_column(&mut self, column: &Column);

    fn leave_schema(&mut self, _schema: &Schema) {}

    fn traverse(&mut self, schema: &Schema) {
        self.enter_schema(schema);
        for column in schema.columns(self.include_virtual_columns()) {
            self.visit_column(column);
        }
        self.leave_schema(schema);
    }
}

/// Collects the columns a [`CsvExporter`] writes.
struct CsvColumns {
    columns: Vec<Column>,
}

impl SchemaTraverser for CsvColumns {
    fn visit_column(&mut self, column: &Column) {
        self.columns.push(column.clone());
    }
}

/// Exports records as CSV, one file per schema.
///
/// Each file starts with a header row of column names, followed by a row per
/// record with the text form of each value. Virtual columns are included.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    folder: PathBuf,
    separator: char,
}

impl CsvExporter {
    pub fn new(folder: impl Into<PathBuf>) -> CsvExporter {
        CsvExporter {
            folder: folder.into(),
            separator: ',',
        }
    }

    pub fn with_separator(mut self, separator: char) -> CsvExporter {
        self.separator = separator;
        self
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Writes the records, returning the paths of the written files.
    #[instrument(name = "csv_export", level = "debug", skip_all, fields(count = records.len()))]
    pub async fn export(&self, records: &[Record], export_time: DateTime<Utc>) -> DbResult<Vec<PathBuf>> {
        let mut by_schema: BTreeMap<_, Vec<&Record>> = BTreeMap::new();
        for record in records {
            by_schema.entry(record.schema().id()).or_default().push(record);
        }

        fs::create_dir_all(&self.folder).await?;
        let mut paths = Vec::with_capacity(by_schema.len());
        for records in by_schema.values() {
            let schema = records[0].schema();
            let text = self.render(schema, records)?;
            let path = self.folder.join(format!(
                "{}_{}.{CSV_FILE_SUFFIX}",
                file_name(schema.name()),
                export_time.format("%Y-%m-%dT%H-%M-%S")
            ));
            fs::write(&path, text).await?;
            debug!(path = %path.display(), rows = records.len(), "wrote csv file");
            paths.push(path);
        }
        Ok(paths)
    }

    /// Exports the records the query selects, then marks them as exported.
    pub async fn export_from<S>(
        &self,
        store: &mut S,
        query: &RecordsQuery,
        mark_exported: bool,
    ) -> DbResult<Vec<PathBuf>>
    where
        S: RecordStore + ?Sized,
    {
        let export_time = Utc::now();
        let mut records = store.retrieve_records(query).await?;
        let paths = self.export(&records, export_time).await?;
        if mark_exported {
            // Only change tracking schemas remember exports.
            let mut tracked: Vec<Record> = records
                .drain(..)
                .filter(|record| record.schema().last_exported_at_column().is_some())
                .collect();
            mark_as_exported(store, &mut tracked, export_time).await?;
        }
        info!(files = paths.len(), "exported records");
        Ok(paths)
    }

    fn render(&self, schema: &Schema, records: &[&Record]) -> DbResult<String> {
        let mut traverser = CsvColumns {
            columns: Vec::new(),
        };
        traverser.traverse(schema);
        let columns = traverser.columns;

        let mut out = String::new();
        let header: Vec<String> = columns
            .iter()
            .map(|column| self.escape(&column.name))
            .collect();
        out.push_str(&header.join(&self.separator.to_string()));
        out.push('\n');

        for record in records {
            let mut cells = Vec::with_capacity(columns.len());
            for column in &columns {
                let text = column.retrieve_value_as_string(*record)?.unwrap_or_default();
                cells.push(self.escape(&text));
            }
            out.push_str(&cells.join(&self.separator.to_string()));
            out.push('\n');
        }
        Ok(out)
    }

    fn escape(&self, text: &str) -> String {
        let needs_quotes = text
            .chars()
            .any(|c| c == self.separator || c == '"' || c == '\n' || c == '\r');
        if needs_quotes {
            format!("\"{}\"", text.replace('"', "\"\""))
        } else {
            text.to_owned()
        }
    }
}

/// Replaces characters that aren't safe in file names.
fn file_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
