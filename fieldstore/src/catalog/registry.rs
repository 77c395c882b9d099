use std::sync::{Arc, OnceLock};

use dashmap::{mapref::entry::Entry, DashMap};
use tracing::{debug, warn};

use crate::{
    catalog::{
        model::Model,
        schema::{Schema, SchemaEquality, SchemaId},
        ty::KnownSchemas,
    },
    error::{DbResult, Error},
};

/// Maps schema ids to the schemas (and model ids to the models) known to the
/// process.
///
/// Stores use it to bind the records they load to the schema instances the
/// application works with, so that column accessors of the application's
/// schemas apply to loaded records.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    schemas: DashMap<SchemaId, Arc<Schema>>,
    models: DashMap<u64, Arc<Model>>,
}

impl SchemaRegistry {
    pub fn new() -> SchemaRegistry {
        SchemaRegistry::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static SchemaRegistry {
        static GLOBAL: OnceLock<SchemaRegistry> = OnceLock::new();
        GLOBAL.get_or_init(SchemaRegistry::new)
    }

    /// Registers the schema, returning the registered instance.
    ///
    /// If a schema with the same id is already registered, it is kept
    /// provided both are equivalent. Otherwise registration fails.
    pub fn register_schema(&self, schema: Arc<Schema>) -> DbResult<Arc<Schema>> {
        if !schema.is_sealed() {
            return Err(Error::SchemaViolation(
                format!("`{}` must be sealed to be registered", schema.name()).into(),
            ));
        }
        match self.schemas.entry(schema.id()) {
            Entry::Occupied(entry) => {
                let known = entry.get();
                if !Arc::ptr_eq(known, &schema)
                    && !known.equals(&schema, SchemaEquality::Equivalent)
                {
                    warn!(id = %schema.id(), name = schema.name(), "schema id clash");
                    return Err(Error::SchemaViolation(
                        format!(
                            "schema {} is registered as `{}` with a different structure",
                            schema.id(),
                            known.name()
                        )
                        .into(),
                    ));
                }
                Ok(Arc::clone(known))
            }
            Entry::Vacant(entry) => {
                debug!(id = %schema.id(), name = schema.name(), "registered schema");
                entry.insert(Arc::clone(&schema));
                Ok(schema)
            }
        }
    }

    /// Registers the model and every schema of it.
    pub fn register_model(&self, model: Arc<Model>) -> DbResult<()> {
        for schema in model.schemas() {
            self.register_schema(Arc::clone(schema))?;
        }
        self.models.insert(model.id(), model);
        Ok(())
    }

    pub fn schema(&self, id: SchemaId) -> Option<Arc<Schema>> {
        self.schemas.get(&id).map(|entry| Arc::clone(&entry))
    }

    pub fn model(&self, id: u64) -> Option<Arc<Model>> {
        self.models.get(&id).map(|entry| Arc::clone(&entry))
    }

    /// Copies the given schemas (if registered) into a [`KnownSchemas`] map.
    pub fn known(&self, ids: impl IntoIterator<Item = SchemaId>) -> KnownSchemas {
        ids.into_iter()
            .filter_map(|id| self.schema(id).map(|schema| (id, schema)))
            .collect()
    }
}
