use std::collections::BTreeMap;

use bitbuff::{BitReader, BitWriter};

use crate::{
    catalog::schema::{Schema, SchemaId},
    error::{DbResult, Error},
    util::io::Serde,
};

/// Bookkeeping of auto-incrementing primary keys: the last id used for each
/// schema.
///
/// The first id of a schema is `0`. Counters are part of the store state, so
/// they are committed, rolled back and persisted together with the records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CounterStore {
    last: BTreeMap<SchemaId, i64>,
}

impl CounterStore {
    pub fn new() -> CounterStore {
        CounterStore::default()
    }

    /// Returns the id the next record of the schema gets, without using it.
    pub fn peek_next(&self, schema: &Schema) -> DbResult<i64> {
        if schema.auto_increment_column().is_none() {
            return Err(Error::SchemaViolation(
                format!("`{}` has no auto-incrementing key", schema.name()).into(),
            ));
        }
        match self.last.get(&schema.id()) {
            None => Ok(0),
            Some(&last) => last.checked_add(1).ok_or_else(|| {
                Error::SchemaViolation(
                    format!("no more ids for records of `{}`", schema.name()).into(),
                )
            }),
        }
    }

    /// Takes the next id of the schema.
    pub fn next_id(&mut self, schema: &Schema) -> DbResult<i64> {
        let id = self.peek_next(schema)?;
        self.observe(schema.id(), id);
        Ok(id)
    }

    /// Records that `id` is in use, so that it's never handed out again.
    pub fn observe(&mut self, schema: SchemaId, id: i64) {
        let last = self.last.entry(schema).or_insert(id);
        *last = (*last).max(id);
    }

    /// The last id used for the schema, if any.
    pub fn last(&self, schema: SchemaId) -> Option<i64> {
        self.last.get(&schema).copied()
    }

    pub fn schema_ids(&self) -> impl Iterator<Item = SchemaId> + '_ {
        self.last.keys().copied()
    }
}

impl Serde for CounterStore {
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        buf.write(self.last.len() as u32);
        for (schema, last) in &self.last {
            schema.serialize(buf)?;
            buf.write(*last);
        }
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self> {
        let len: u32 = buf.read()?;
        let mut last = BTreeMap::new();
        for _ in 0..len {
            let schema = SchemaId::deserialize(buf)?;
            last.insert(schema, buf.read()?);
        }
        Ok(CounterStore { last })
    }
}
