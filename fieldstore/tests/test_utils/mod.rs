use std::{
    ops::{Deref, DerefMut},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use fieldstore::{
    catalog::{
        column::Column,
        model::Model,
        record::Record,
        registry::SchemaRegistry,
        schema::{Schema, SchemaFlags},
        ty::ColumnType,
    },
    config::FileStoreOpts,
    error::DbResult,
    exec::value::Value,
    store::FileRecordStore,
};
use tempfile::TempDir;

/// Sets up tracing subscriber.
#[allow(dead_code)]
pub fn setup_tracing(level: Option<&str>) {
    use tracing_subscriber::{
        fmt::{format::FmtSpan, layer},
        layer::SubscriberExt,
        util::SubscriberInitExt,
        EnvFilter,
    };

    let filter_layer = level
        .map(EnvFilter::new)
        .unwrap_or_else(|| EnvFilter::try_from_default_env().unwrap_or("warn".into()));
    let fmt_layer = layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// A file store in a temporary folder, with its own schema registry.
pub struct TestStore {
    store: FileRecordStore,
    opts: FileStoreOpts,
    registry: SchemaRegistry,
    schemas: TestSchemas,
    dir: TempDir,
}

impl TestStore {
    /// Creates a new, empty, test store with the test schemas registered.
    pub async fn new_temp() -> DbResult<Self> {
        let dir = tempfile::tempdir()?;
        let opts = FileStoreOpts::new(dir.path(), "test");
        let registry = SchemaRegistry::new();
        let schemas = test_schemas()?;
        registry.register_model(Arc::clone(&schemas.model))?;

        let (store, is_new) = FileRecordStore::open_with(opts.clone(), &registry).await?;
        assert!(is_new, "store file must be new");

        Ok(TestStore {
            store,
            opts,
            registry,
            schemas,
            dir,
        })
    }

    /// Closes the store and opens it again from its data file.
    #[allow(dead_code)]
    pub async fn reopen(&mut self) -> DbResult<()> {
        use fieldstore::store::RecordStore;

        self.store.close().await?;
        let (store, is_new) = FileRecordStore::open_with(self.opts.clone(), &self.registry).await?;
        assert!(!is_new, "store file must exist");
        self.store = store;
        Ok(())
    }

    /// Opens another store instance over the same data file.
    #[allow(dead_code)]
    pub async fn open_again(&self) -> DbResult<FileRecordStore> {
        let (store, _) = FileRecordStore::open_with(self.opts.clone(), &self.registry).await?;
        Ok(store)
    }

    #[allow(dead_code)]
    pub fn opts(&self) -> &FileStoreOpts {
        &self.opts
    }

    #[allow(dead_code)]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    pub fn schemas(&self) -> &TestSchemas {
        &self.schemas
    }

    #[allow(dead_code)]
    pub fn folder(&self) -> &Path {
        self.dir.path()
    }
}

impl Deref for TestStore {
    type Target = FileRecordStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

impl DerefMut for TestStore {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.store
    }
}

/// The schemas of the test model.
pub struct TestSchemas {
    pub model: Arc<Model>,
    /// `id` (auto-increment key), `text`, `code` (unique); tracks changes.
    pub notes: Arc<Schema>,
    /// `code` (key), `name`.
    pub sites: Arc<Schema>,
    /// `id` (auto-increment key), `site` (references `sites`), `count`;
    /// tracks changes.
    pub visits: Arc<Schema>,
}

#[allow(dead_code)]
impl TestSchemas {
    pub fn note(&self, text: &str) -> DbResult<Record> {
        let mut record = self.notes.create_record()?;
        record.set("text", Value::from(text))?;
        Ok(record)
    }

    pub fn site(&self, code: &str, name: &str) -> DbResult<Record> {
        let mut record = self.sites.create_record()?;
        record.set("code", Value::from(code))?;
        record.set("name", Value::from(name))?;
        Ok(record)
    }

    pub fn visit(&self, site: &Record, count: i64) -> DbResult<Record> {
        let mut record = self.visits.create_record()?;
        record.set("site", site.reference()?.to_value())?;
        record.set("count", Value::Integer(count))?;
        Ok(record)
    }
}

/// Builds the test model. Every call uses a new model id.
pub fn test_schemas() -> DbResult<TestSchemas> {
    static COUNTER: AtomicU64 = AtomicU64::new(1);

    let mut model = Model::new(COUNTER.fetch_add(1, Ordering::AcqRel), "test", 1);
    let tracked = SchemaFlags {
        track_changes: true,
        ..SchemaFlags::default()
    };

    let mut notes = model.new_schema("Notes", tracked);
    notes.add_column(Column::new("id", ColumnType::ID, false))?;
    notes.add_column(Column::string("text", true, 64))?;
    notes.add_column(Column::string("code", true, 8))?;
    notes.set_auto_increment_key("pk", "id")?;
    notes.add_index("by_code", &["code"], true)?;
    notes.seal()?;
    let notes = model.add_schema(notes)?;

    let mut sites = model.new_schema("Sites", SchemaFlags::default());
    sites.add_column(Column::string("code", false, 8))?;
    sites.add_column(Column::string("name", true, 32))?;
    sites.set_primary_key("pk", &["code"])?;
    sites.seal()?;
    let sites = model.add_schema(sites)?;

    let mut visits = model.new_schema("Visits", tracked);
    visits.add_column(Column::new("id", ColumnType::ID, false))?;
    visits.add_column(Column::foreign_key("site", Arc::clone(&sites), false))?;
    visits.add_column(Column::integer("count", true))?;
    visits.set_auto_increment_key("pk", "id")?;
    visits.seal()?;
    let visits = model.add_schema(visits)?;

    Ok(TestSchemas {
        model: Arc::new(model),
        notes,
        sites,
        visits,
    })
}

/// Reads an integer column of the record.
#[allow(dead_code)]
pub fn int(record: &Record, column: &str) -> Option<i64> {
    record.get(column).ok().flatten().and_then(|v| v.as_integer())
}

/// Reads a string column of the record.
#[allow(dead_code)]
pub fn text(record: &Record, column: &str) -> Option<String> {
    record
        .get(column)
        .ok()
        .flatten()
        .and_then(|v| v.as_str().map(str::to_owned))
}
