use crate::store::engine::Engine;

/// A volatile record store. Its contents are lost when it's dropped, but
/// backups still produce regular data files.
#[derive(Debug)]
pub struct MemoryRecordStore {
    engine: Engine,
}

impl MemoryRecordStore {
    /// Creates an empty store. `name` is the base name of backup files,
    /// which are labelled with a timestamp.
    pub fn new(name: impl Into<String>) -> MemoryRecordStore {
        MemoryRecordStore {
            engine: Engine::new(name, true, None),
        }
    }

    pub fn name(&self) -> &str {
        self.engine.name()
    }
}

impl_record_store!(MemoryRecordStore);
