use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use chrono::Utc;
use tracing::{debug, info, instrument, trace};

use crate::{
    catalog::record::{Record, RecordReference, RowRef},
    config::{BACKUP_SUFFIX, BACKUP_TIMESTAMP_FORMAT, DATA_FILE_SUFFIX},
    error::{DbResult, Error},
    exec::value::Value,
    query::{RecordsQuery, SingleRecordQuery},
    store::{
        counter::CounterStore,
        disk_manager::{self, DiskManager},
        format,
        table::{RecordTable, Row},
        StoreAction, StoreOutcome,
    },
};

/// Everything a transaction may change.
#[derive(Debug, Default)]
struct State {
    table: RecordTable,
    counters: CounterStore,
}

/// What it takes to undo the open transaction: the counters at its start and
/// the previous contents of every row it changed, in order.
#[derive(Debug)]
struct UndoLog {
    counters: CounterStore,
    changes: Vec<(u64, Option<Row>)>,
}

/// The record store machinery shared by every backend.
///
/// Backends only differ in whether committed state is written to a data file.
#[derive(Debug)]
pub(crate) struct Engine {
    id: u64,
    name: String,
    label_backups: bool,
    disk: Option<DiskManager>,
    state: State,
    /// Undoes the outermost open transaction.
    undo: Option<UndoLog>,
    depth: u32,
    open: bool,
    /// Rows are never reused, not even after a rollback.
    next_row: u64,
}

impl Engine {
    pub fn new(name: impl Into<String>, label_backups: bool, disk: Option<DiskManager>) -> Engine {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);

        Engine {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            label_backups,
            disk,
            state: State::default(),
            undo: None,
            depth: 0,
            open: true,
            next_row: 0,
        }
    }

    /// Loads previously persisted records and counters.
    pub fn load(&mut self, records: Vec<Record>, counters: CounterStore) -> DbResult<()> {
        for record in records {
            self.state.table.insert(self.next_row, record)?;
            self.next_row += 1;
        }
        self.state.counters = counters;
        debug!(store = %self.name, records = self.state.table.len(), "loaded store");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn counters(&self) -> &CounterStore {
        &self.state.counters
    }

    fn check_open(&self) -> DbResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::Closed)
        }
    }

    fn row_ref(&self, row: u64) -> RowRef {
        RowRef {
            store: self.id,
            row,
        }
    }

    /// Copies the stored record out of the store, tagged with its row.
    fn handle(&self, row: u64, record: &Record) -> Record {
        let mut record = record.clone();
        record.set_row(Some(self.row_ref(row)));
        record
    }

    //
    // Transactions
    //

    pub fn is_in_transaction(&self) -> bool {
        self.depth > 0
    }

    #[instrument(name = "start_transaction", level = "debug", skip_all)]
    pub fn start_transaction(&mut self) -> DbResult<()> {
        self.check_open()?;
        if self.depth == 0 {
            self.open_undo_log();
        }
        self.depth += 1;
        trace!(depth = self.depth, "started transaction");
        Ok(())
    }

    #[instrument(name = "commit_transaction", level = "debug", skip_all)]
    pub async fn commit_transaction(&mut self) -> DbResult<()> {
        self.check_open()?;
        self.commit()
            .await
            .map_err(|error| error.in_operation("commit", None))
    }

    #[instrument(name = "rollback_transaction", level = "debug", skip_all)]
    pub fn rollback_transaction(&mut self) -> DbResult<()> {
        self.check_open()?;
        self.rollback();
        Ok(())
    }

    async fn commit(&mut self) -> DbResult<()> {
        match self.depth {
            0 => trace!("no transaction to commit"),
            1 => {
                if let Err(error) = self.persist().await {
                    self.rollback();
                    return Err(error);
                }
                self.undo = None;
                self.depth = 0;
                trace!("committed transaction");
            }
            _ => self.depth -= 1,
        }
        Ok(())
    }

    fn open_undo_log(&mut self) {
        self.undo = Some(UndoLog {
            counters: self.state.counters.clone(),
            changes: Vec::new(),
        });
    }

    /// Remembers the contents of `row` before a change.
    fn log_change(&mut self, row: u64, previous: Option<Row>) {
        if let Some(undo) = &mut self.undo {
            undo.changes.push((row, previous));
        }
    }

    fn rollback(&mut self) {
        if let Some(undo) = self.undo.take() {
            let changes = undo.changes.len();
            for (row, previous) in undo.changes.into_iter().rev() {
                self.state.table.restore(row, previous);
            }
            self.state.counters = undo.counters;
            debug!(store = %self.name, changes, "rolled back transaction");
        }
        self.depth = 0;
    }

    /// Commits any pending work, whatever the nesting depth.
    async fn commit_pending(&mut self) -> DbResult<()> {
        if self.depth > 0 {
            self.depth = 1;
            self.commit().await?;
        }
        Ok(())
    }

    async fn persist(&self) -> DbResult<()> {
        if let Some(disk) = &self.disk {
            let bytes = format::encode(&self.state.table, &self.state.counters)?;
            disk.write(&bytes).await?;
        }
        Ok(())
    }

    /// Opens an implicit transaction unless one is already open.
    fn begin(&mut self) -> bool {
        let implicit = self.depth == 0;
        if implicit {
            self.open_undo_log();
            self.depth = 1;
        }
        implicit
    }

    /// Closes the implicit transaction opened by [`Engine::begin`], if any.
    async fn end<T>(&mut self, implicit: bool, result: DbResult<T>) -> DbResult<T> {
        if !implicit {
            return result;
        }
        match result {
            Ok(value) => {
                self.commit().await?;
                Ok(value)
            }
            Err(error) => {
                self.rollback();
                Err(error)
            }
        }
    }

    //
    // Store
    //

    #[instrument(name = "store", level = "debug", skip_all, fields(schema = record.schema().name()))]
    pub async fn store(&mut self, record: &mut Record, action: StoreAction) -> DbResult<StoreOutcome> {
        self.check_open()?;
        let implicit = self.begin();
        let result = self.do_store(record, action);
        self.end(implicit, result)
            .await
            .map_err(|error| error.in_operation("store", Some(&*record)))
    }

    fn do_store(&mut self, record: &mut Record, action: StoreAction) -> DbResult<StoreOutcome> {
        let schema = Arc::clone(record.schema());
        if schema.is_columnless() {
            trace!("columnless record, nothing to store");
            return Ok(StoreOutcome::NoActionNeeded);
        }

        let auto_column = schema.auto_increment_column();
        let auto_unset = match auto_column {
            Some(column) => !column.is_value_set(record)?,
            None => false,
        };
        if let Some(column) = record
            .unfilled_columns()
            .find(|column| !(auto_unset && Some(*column) == auto_column))
        {
            return Err(Error::Validation {
                column: column.name.clone(),
                reason: "a value is required".into(),
            });
        }

        let previous = self.find_previous(record, auto_unset)?;
        let mut stored_lsa = None;
        if let Some(row) = previous {
            if let Some(stored) = self.state.table.get(row) {
                let skip: Vec<&str> = schema
                    .last_stored_at_column()
                    .map(|column| column.name.as_str())
                    .into_iter()
                    .collect();
                if stored.has_equal_values(record, &skip, true)? {
                    trace!(row, "record unchanged");
                    record.set_row(Some(self.row_ref(row)));
                    return Ok(StoreOutcome::NoActionNeeded);
                }
                stored_lsa = stored.last_stored_at();
            }
        }

        let inserting = previous.is_none();
        let allowed = match action {
            StoreAction::InsertOnly => inserting,
            StoreAction::UpdateOnlyExceptLsa => !inserting,
            StoreAction::InsertOrUpdate => true,
        };
        if !allowed {
            return Err(Error::ActionNotAllowed {
                action,
                record: Box::new(record.clone()),
            });
        }

        let mut working = record.clone();
        if let (Some(column), true) = (auto_column, auto_unset) {
            let id = self.state.counters.peek_next(&schema)?;
            column.store_value(&mut working, Value::Integer(id))?;
        }

        if schema.flags().track_changes {
            let lsa = match action {
                StoreAction::UpdateOnlyExceptLsa => stored_lsa,
                _ => match (working.last_stored_at(), stored_lsa) {
                    (None, _) => Some(now()),
                    (Some(incoming), Some(stored)) if incoming == stored => Some(now()),
                    // A newer version from elsewhere keeps its time.
                    (Some(incoming), Some(stored)) if incoming > stored => Some(incoming),
                    // Older than the stored version, or claims to have been
                    // stored before while nothing is.
                    (Some(incoming), stored) => {
                        debug!(incoming, ?stored, "rejected out-dated record");
                        return Err(Error::StorageConflict(Box::new(record.clone())));
                    }
                },
            };
            working.set_last_stored_at(lsa);
        }

        let row = match previous {
            Some(row) => {
                let replaced = self.state.table.replace(row, working.clone())?;
                self.log_change(row, replaced);
                row
            }
            None => {
                let row = self.next_row;
                self.state.table.insert(row, working.clone())?;
                self.log_change(row, None);
                self.next_row += 1;
                row
            }
        };
        if let Some(column) = auto_column {
            if let Some(id) = column.retrieve_value(&working)?.and_then(|v| v.as_integer()) {
                self.state.counters.observe(schema.id(), id);
            }
        }

        working.set_row(Some(self.row_ref(row)));
        *record = working;
        if inserting {
            debug!(row, "inserted record");
            Ok(StoreOutcome::Inserted)
        } else {
            debug!(row, "updated record");
            Ok(StoreOutcome::Updated)
        }
    }

    /// Finds the row of the stored version of the record: by the row it was
    /// loaded from, or else by primary key.
    fn find_previous(&self, record: &Record, auto_unset: bool) -> DbResult<Option<u64>> {
        if let Some(row) = record.row().filter(|row| row.store == self.id) {
            let same_schema = self
                .state
                .table
                .get(row.row)
                .is_some_and(|stored| stored.schema().id() == record.schema().id());
            if same_schema {
                return Ok(Some(row.row));
            }
        }
        if auto_unset || record.schema().primary_key().is_none() {
            return Ok(None);
        }
        self.state.table.find_by_primary_key(record)
    }

    //
    // Retrieval
    //

    #[instrument(name = "retrieve_records", level = "debug", skip_all, fields(query = %query))]
    pub fn retrieve_records(&self, query: &RecordsQuery) -> DbResult<Vec<Record>> {
        self.check_open()?;
        self.query(query)
            .map_err(|error| error.in_operation("retrieve records", None))
    }

    fn query(&self, query: &RecordsQuery) -> DbResult<Vec<Record>> {
        let table = &self.state.table;
        if let Some((schema, key)) = query.key_lookup() {
            if let Some(pk) = schema.primary_key() {
                trace!("answering by primary key");
                let candidates = table
                    .find(&schema, pk, key.to_bytes()?)
                    .and_then(|row| table.get(row).map(|record| self.handle(row, record)));
                return query.execute(candidates);
            }
        }
        let candidates = table
            .iter()
            .filter(|(_, record)| query.source().accepts(record.schema()))
            .map(|(row, record)| self.handle(row, record));
        query.execute(candidates)
    }

    pub fn retrieve_record(&self, query: &SingleRecordQuery) -> DbResult<Option<Record>> {
        self.check_open()?;
        self.query(query.query())
            .and_then(|results| query.select(results))
            .map_err(|error| error.in_operation("retrieve record", None))
    }

    pub fn retrieve_record_references(&self, query: &RecordsQuery) -> DbResult<Vec<RecordReference>> {
        self.check_open()?;
        self.query(query)
            .and_then(|records| records.iter().map(Record::reference).collect())
            .map_err(|error| error.in_operation("retrieve record references", None))
    }

    //
    // Deletion
    //

    #[instrument(name = "delete", level = "debug", skip_all, fields(schema = record.schema().name()))]
    pub async fn delete(&mut self, record: &Record) -> DbResult<bool> {
        self.check_open()?;
        let implicit = self.begin();
        let result = self.do_delete(record);
        self.end(implicit, result)
            .await
            .map_err(|error| error.in_operation("delete", Some(record)))
    }

    #[instrument(name = "delete_records", level = "debug", skip_all, fields(count = records.len()))]
    pub async fn delete_records(&mut self, records: &[Record]) -> DbResult<usize> {
        self.check_open()?;
        let implicit = self.begin();
        let mut result = Ok(0);
        for record in records {
            match self.do_delete(record) {
                Ok(deleted) => {
                    if let Ok(count) = &mut result {
                        *count += usize::from(deleted);
                    }
                }
                Err(error) => {
                    result = Err(error.in_operation("delete records", Some(record)));
                    break;
                }
            }
        }
        self.end(implicit, result)
            .await
            .map_err(|error| error.in_operation("delete records", None))
    }

    fn do_delete(&mut self, record: &Record) -> DbResult<bool> {
        let row = match self.find_previous(record, false) {
            Ok(row) => row,
            // Without a complete key the record was never stored.
            Err(Error::IncompleteKey(_)) => None,
            Err(error) => return Err(error),
        };
        match row.and_then(|row| self.state.table.remove(row).map(|removed| (row, removed))) {
            Some((row, removed)) => {
                self.log_change(row, Some(removed));
                debug!(row, "deleted record");
                Ok(true)
            }
            None => {
                trace!("record not stored, nothing to delete");
                Ok(false)
            }
        }
    }

    //
    // Lifecycle
    //

    /// Writes a copy of the committed state to a data file in `folder`.
    #[instrument(name = "backup", level = "debug", skip_all)]
    pub async fn backup(&mut self, folder: &Path) -> DbResult<PathBuf> {
        self.check_open()?;
        let result = self.do_backup(folder).await;
        result.map_err(|error| error.in_operation("backup", None))
    }

    async fn do_backup(&mut self, folder: &Path) -> DbResult<PathBuf> {
        self.commit_pending().await?;
        let file_name = if self.label_backups {
            let label = Utc::now().format(BACKUP_TIMESTAMP_FORMAT);
            format!("{}{BACKUP_SUFFIX}{label}.{DATA_FILE_SUFFIX}", self.name)
        } else {
            format!("{}.{DATA_FILE_SUFFIX}", self.name)
        };
        let path = folder.join(file_name);
        let bytes = format::encode(&self.state.table, &self.state.counters)?;
        disk_manager::write_atomic(&path, &bytes).await?;
        info!(path = %path.display(), "backed up store");
        Ok(path)
    }

    /// Commits pending work and closes the store. Closing a closed store does
    /// nothing.
    #[instrument(name = "close", level = "debug", skip_all)]
    pub async fn close(&mut self) -> DbResult<()> {
        if !self.open {
            return Ok(());
        }
        self.commit_pending()
            .await
            .map_err(|error| error.in_operation("close", None))?;
        self.open = false;
        info!(store = %self.name, "closed store");
        Ok(())
    }
}

fn now() -> i64 {
    Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{
            column::Column,
            schema::{Schema, SchemaFlags, SchemaId},
            ty::ColumnType,
        },
        query::{Constraint, Source},
    };

    fn notes() -> Arc<Schema> {
        let flags = SchemaFlags {
            track_changes: true,
            ..SchemaFlags::default()
        };
        let mut schema = Schema::with_flags(SchemaId::new(18, 0), "Notes", flags);
        schema.add_column(Column::new("id", ColumnType::ID, false)).unwrap();
        schema.add_column(Column::string("text", true, 32)).unwrap();
        schema.set_auto_increment_key("pk", "id").unwrap();
        schema.seal().unwrap();
        Arc::new(schema)
    }

    fn note(schema: &Arc<Schema>, text: &str) -> Record {
        let mut record = schema.create_record().unwrap();
        record.set("text", Value::from(text)).unwrap();
        record
    }

    #[tokio::test]
    async fn test_store_cycle() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);

        let mut record = note(&schema, "a");
        let outcome = engine.store(&mut record, StoreAction::InsertOrUpdate).await?;
        assert_eq!(outcome, StoreOutcome::Inserted);
        assert_eq!(record.get("id")?.and_then(|v| v.as_integer()), Some(0));
        assert!(record.row().is_some());
        let lsa = record.last_stored_at();
        assert!(lsa.is_some());

        let outcome = engine.store(&mut record, StoreAction::InsertOrUpdate).await?;
        assert_eq!(outcome, StoreOutcome::NoActionNeeded);
        assert_eq!(record.last_stored_at(), lsa);

        record.set("text", Value::from("b"))?;
        let outcome = engine.store(&mut record, StoreAction::InsertOrUpdate).await?;
        assert_eq!(outcome, StoreOutcome::Updated);
        assert!(record.last_stored_at() >= lsa);

        let all = engine.retrieve_records(&RecordsQuery::all(Source::Any))?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0], record);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_by_key_after_handle_loss() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);
        let mut record = note(&schema, "a");
        engine.store(&mut record, StoreAction::InsertOnly).await?;

        // A copy without row handle is still matched through its key.
        let mut copy = record.clone();
        copy.set_row(None);
        copy.set("text", Value::from("c"))?;
        let outcome = engine.store(&mut copy, StoreAction::UpdateOnlyExceptLsa).await?;
        assert_eq!(outcome, StoreOutcome::Updated);
        assert_eq!(copy.last_stored_at(), record.last_stored_at());

        let query = RecordsQuery::builder(Source::schema(Arc::clone(&schema)))
            .constraint(Constraint::equal("id", Value::Integer(0)))
            .build()?;
        let found = engine.retrieve_record(&SingleRecordQuery::unique(query))?;
        assert_eq!(
            found.and_then(|r| r.get("text").ok().flatten().map(|v| v.into_owned())),
            Some(Value::from("c"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_transactions() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);

        engine.start_transaction()?;
        engine.start_transaction()?;
        engine.store(&mut note(&schema, "a"), StoreAction::InsertOnly).await?;
        engine.commit_transaction().await?;
        assert!(engine.is_in_transaction());
        engine.store(&mut note(&schema, "b"), StoreAction::InsertOnly).await?;
        engine.rollback_transaction()?;
        assert!(!engine.is_in_transaction());

        assert!(engine.retrieve_records(&RecordsQuery::all(Source::Any))?.is_empty());
        assert_eq!(engine.counters().last(schema.id()), None);

        let mut record = note(&schema, "c");
        engine.store(&mut record, StoreAction::InsertOnly).await?;
        assert_eq!(record.get("id")?.and_then(|v| v.as_integer()), Some(0));
        Ok(())
    }

    #[tokio::test]
    async fn test_rollback_undoes_updates_and_deletes() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);
        let mut kept = note(&schema, "kept");
        let mut gone = note(&schema, "gone");
        engine.store(&mut kept, StoreAction::InsertOnly).await?;
        engine.store(&mut gone, StoreAction::InsertOnly).await?;

        engine.start_transaction()?;
        kept.set("text", Value::from("edited"))?;
        engine.store(&mut kept, StoreAction::InsertOrUpdate).await?;
        kept.set("text", Value::from("edited twice"))?;
        engine.store(&mut kept, StoreAction::InsertOrUpdate).await?;
        assert!(engine.delete(&gone).await?);
        engine.store(&mut note(&schema, "new"), StoreAction::InsertOnly).await?;
        engine.rollback_transaction()?;

        let texts: Vec<_> = engine
            .retrieve_records(&RecordsQuery::all(Source::Any))?
            .iter()
            .filter_map(|r| r.get("text").ok().flatten().map(|v| v.into_owned()))
            .collect();
        assert_eq!(texts, [Value::from("kept"), Value::from("gone")]);
        assert_eq!(engine.counters().last(schema.id()), Some(1));

        // Rows aren't reused; the stored records are found by key again.
        assert!(engine.delete(&gone).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_store_keeps_transaction() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);

        engine.start_transaction()?;
        let mut record = note(&schema, "a");
        engine.store(&mut record, StoreAction::InsertOnly).await?;
        record.set("text", Value::from("b"))?;
        let error = engine
            .store(&mut record, StoreAction::InsertOnly)
            .await
            .unwrap_err();
        assert!(matches!(error.root(), Error::ActionNotAllowed { .. }));
        assert!(engine.is_in_transaction());
        engine.commit_transaction().await?;
        assert_eq!(engine.retrieve_records(&RecordsQuery::all(Source::Any))?.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_insert_with_stored_time_conflicts() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);

        // Stored elsewhere, so it can't be new here.
        let mut record = note(&schema, "remote");
        record.set("id", Value::Integer(5))?;
        record.set(crate::config::LAST_STORED_AT, Value::DateTime(1_000_000))?;
        for action in [StoreAction::InsertOnly, StoreAction::InsertOrUpdate] {
            let error = engine.store(&mut record, action).await.unwrap_err();
            assert!(matches!(error.root(), Error::StorageConflict(_)));
        }
        assert!(engine.retrieve_records(&RecordsQuery::all(Source::Any))?.is_empty());
        assert_eq!(engine.counters().last(schema.id()), None);

        record.set(crate::config::LAST_STORED_AT, None::<Value>)?;
        let outcome = engine.store(&mut record, StoreAction::InsertOnly).await?;
        assert_eq!(outcome, StoreOutcome::Inserted);
        assert!(record.last_stored_at() > Some(1_000_000));
        Ok(())
    }

    #[tokio::test]
    async fn test_delete() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);
        let mut record = note(&schema, "a");

        // Never stored.
        assert!(!engine.delete(&record).await?);
        engine.store(&mut record, StoreAction::InsertOnly).await?;
        assert!(engine.delete(&record).await?);
        assert!(!engine.delete(&record).await?);
        Ok(())
    }

    #[tokio::test]
    async fn test_closed() -> DbResult<()> {
        let schema = notes();
        let mut engine = Engine::new("notes", false, None);
        engine.close().await?;
        engine.close().await?;
        assert!(matches!(
            engine.store(&mut note(&schema, "a"), StoreAction::InsertOnly).await,
            Err(Error::Closed)
        ));
        assert!(matches!(
            engine.retrieve_records(&RecordsQuery::all(Source::Any)),
            Err(Error::Closed)
        ));
        assert!(matches!(engine.start_transaction(), Err(Error::Closed)));
        Ok(())
    }
}
