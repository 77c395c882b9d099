use std::sync::Arc;

use crate::{
    catalog::schema::{Schema, SchemaFlags, SchemaId},
    error::{DbResult, Error},
    util::names,
};

/// A versioned group of schemas (e.g. the forms of a survey project).
///
/// Schema numbers are assigned in creation order, so a schema id is stable as
/// long as schemas are only ever appended to the model.
#[derive(Debug, Clone)]
pub struct Model {
    id: u64,
    name: String,
    version: u32,
    schemas: Vec<Arc<Schema>>,
}

impl Model {
    pub fn new(id: u64, name: impl Into<String>, version: u32) -> Model {
        Model {
            id,
            name: name.into(),
            version,
            schemas: Vec::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Returns the id the next added schema must have.
    pub fn next_schema_id(&self) -> SchemaId {
        SchemaId::new(self.id, self.schemas.len() as u16)
    }

    /// Creates an unsealed schema carrying the next schema id of this model.
    /// It only becomes part of the model once sealed and added.
    pub fn new_schema(&self, name: impl Into<String>, flags: SchemaFlags) -> Schema {
        Schema::with_flags(self.next_schema_id(), name, flags)
    }

    /// Adds a sealed schema created by [`Model::new_schema`].
    pub fn add_schema(&mut self, schema: Schema) -> DbResult<Arc<Schema>> {
        if !schema.is_sealed() {
            return Err(Error::SchemaViolation(
                format!("`{}` must be sealed before joining a model", schema.name()).into(),
            ));
        }
        if schema.id() != self.next_schema_id() {
            return Err(Error::SchemaViolation(
                format!(
                    "`{}` has id {}, but model `{}` expects {}",
                    schema.name(),
                    schema.id(),
                    self.name,
                    self.next_schema_id()
                )
                .into(),
            ));
        }
        if self.schema_by_name(schema.name()).is_some() {
            return Err(Error::SchemaViolation(
                format!("model `{}` already has a schema named `{}`", self.name, schema.name())
                    .into(),
            ));
        }
        let schema = Arc::new(schema);
        self.schemas.push(Arc::clone(&schema));
        Ok(schema)
    }

    pub fn schemas(&self) -> &[Arc<Schema>] {
        &self.schemas
    }

    pub fn schema(&self, number: u16) -> Option<&Arc<Schema>> {
        self.schemas.get(usize::from(number))
    }

    pub fn schema_by_name(&self, name: &str) -> Option<&Arc<Schema>> {
        self.schemas
            .iter()
            .find(|schema| names::same(schema.name(), name))
    }
}
