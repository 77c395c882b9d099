use tracing::{info, instrument};

use crate::{
    catalog::registry::SchemaRegistry,
    config::FileStoreOpts,
    error::DbResult,
    store::{counter::CounterStore, disk_manager::DiskManager, engine::Engine, format},
};

/// A record store persisted to a single data file.
///
/// The whole store is rewritten on every commit, through a temporary file
/// renamed over the previous version.
#[derive(Debug)]
pub struct FileRecordStore {
    engine: Engine,
}

impl FileRecordStore {
    /// Opens the store, binding stored records to the schemas of the global
    /// registry.
    ///
    /// On first access the data file doesn't exist and the store is empty;
    /// `true` is returned as the second tuple element.
    pub async fn open(opts: FileStoreOpts) -> DbResult<(Self, bool)> {
        FileRecordStore::open_with(opts, SchemaRegistry::global()).await
    }

    /// Opens the store, binding stored records to the schemas of `registry`.
    ///
    /// Schemas found in the data file but missing from the registry are
    /// registered. A registered schema with the id of a stored one must be
    /// equivalent to it.
    #[instrument(name = "open", level = "debug", skip_all, fields(name = opts.base_name.as_str()))]
    pub async fn open_with(opts: FileStoreOpts, registry: &SchemaRegistry) -> DbResult<(Self, bool)> {
        let disk = DiskManager::new(opts.data_path());
        let contents = disk.read().await?;
        let is_new = contents.is_none();

        let (records, counters) = match contents {
            Some(bytes) => {
                let file = format::decode(&bytes, registry)
                    .map_err(|error| error.in_operation("open", None))?;
                (file.records, file.counters)
            }
            None => (Vec::new(), CounterStore::new()),
        };

        info!(path = %disk.path().display(), is_new, "opened store");
        let mut engine = Engine::new(opts.base_name, opts.label_backups, Some(disk));
        engine.load(records, counters)?;
        Ok((FileRecordStore { engine }, is_new))
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }

    /// The auto-increment counters, as of the last operation.
    pub fn counters(&self) -> &CounterStore {
        self.engine.counters()
    }
}

impl_record_store!(FileRecordStore);
