use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::{
    catalog::{
        index::Index,
        record::Record,
        schema::{Schema, SchemaId},
    },
    error::{DbResult, Error},
    util::names,
};

/// Key of an unique index entry: schema, lowercase index name and the binary
/// form of the indexed values.
type IndexKey = (SchemaId, String, Vec<u8>);

/// A stored record with the index entries pointing at it.
#[derive(Clone, Debug)]
pub(crate) struct Row {
    record: Record,
    keys: Vec<IndexKey>,
}

impl Row {
    pub fn record(&self) -> &Record {
        &self.record
    }
}

/// The stored records, by row, with the entries of every unique index.
///
/// Records are kept without row handles; those are attached when records
/// leave the store.
#[derive(Debug, Default)]
pub(crate) struct RecordTable {
    rows: BTreeMap<u64, Row>,
    keys: HashMap<IndexKey, u64>,
}

fn index_key(schema: &Schema, index: &Index, bytes: Vec<u8>) -> IndexKey {
    (schema.id(), names::fold(index.name()), bytes)
}

impl RecordTable {
    pub fn new() -> RecordTable {
        RecordTable::default()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, row: u64) -> Option<&Record> {
        self.rows.get(&row).map(Row::record)
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &Record)> + '_ {
        self.rows.iter().map(|(row, entry)| (*row, &entry.record))
    }

    /// Ids of the schemas with stored records.
    pub fn schema_ids(&self) -> BTreeSet<SchemaId> {
        self.rows.values().map(|entry| entry.record.schema().id()).collect()
    }

    /// Finds the row of the record of the schema with the given index key.
    pub fn find(&self, schema: &Schema, index: &Index, key: Vec<u8>) -> Option<u64> {
        self.keys.get(&index_key(schema, index, key)).copied()
    }

    /// Finds the row of the stored record with the same primary key.
    pub fn find_by_primary_key(&self, record: &Record) -> DbResult<Option<u64>> {
        let schema = record.schema();
        let Some(pk) = schema.primary_key() else {
            return Ok(None);
        };
        let key = pk
            .key_bytes(record)?
            .ok_or_else(|| Error::IncompleteKey(schema.name().to_owned()))?;
        Ok(self.find(schema, pk, key))
    }

    /// Checks that storing the record (at `row`, if replacing) doesn't clash
    /// with another record in any unique index.
    fn check_unique(&self, record: &Record, row: Option<u64>) -> DbResult<Vec<IndexKey>> {
        let schema = record.schema();
        let mut keys = Vec::new();
        for index in schema.unique_indexes() {
            let Some(bytes) = index.key_bytes(record)? else {
                continue;
            };
            let key = index_key(schema, index, bytes);
            if let Some(&other) = self.keys.get(&key) {
                if Some(other) != row {
                    return Err(Error::UniqueViolation {
                        schema: schema.name().to_owned(),
                        index: index.name().to_owned(),
                    });
                }
            }
            keys.push(key);
        }
        Ok(keys)
    }

    fn put(&mut self, row: u64, entry: Row) -> Option<Row> {
        let previous = self.take(row);
        for key in &entry.keys {
            self.keys.insert(key.clone(), row);
        }
        self.rows.insert(row, entry);
        previous
    }

    fn take(&mut self, row: u64) -> Option<Row> {
        let entry = self.rows.remove(&row)?;
        for key in &entry.keys {
            self.keys.remove(key);
        }
        Some(entry)
    }

    /// Inserts the record at the given (unused) row.
    pub fn insert(&mut self, row: u64, mut record: Record) -> DbResult<()> {
        let keys = self.check_unique(&record, None)?;
        record.set_row(None);
        self.put(row, Row { record, keys });
        Ok(())
    }

    /// Replaces the record at the given row, returning the previous one.
    pub fn replace(&mut self, row: u64, mut record: Record) -> DbResult<Option<Row>> {
        let keys = self.check_unique(&record, Some(row))?;
        record.set_row(None);
        Ok(self.put(row, Row { record, keys }))
    }

    pub fn remove(&mut self, row: u64) -> Option<Row> {
        self.take(row)
    }

    /// Puts the row back the way it was before a later change: `None` for a
    /// row that didn't exist.
    pub fn restore(&mut self, row: u64, previous: Option<Row>) {
        match previous {
            Some(entry) => {
                self.put(row, entry);
            }
            None => {
                self.take(row);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        catalog::{column::Column, schema::SchemaFlags},
        exec::value::Value,
    };

    fn schema() -> Arc<Schema> {
        let mut schema = Schema::with_flags(SchemaId::new(16, 0), "Tags", SchemaFlags::default());
        schema.add_column(Column::integer("n", false)).unwrap();
        schema.add_column(Column::string("tag", true, 8)).unwrap();
        schema.set_primary_key("pk", &["n"]).unwrap();
        schema.add_index("by_tag", &["tag"], true).unwrap();
        schema.seal().unwrap();
        Arc::new(schema)
    }

    fn record(schema: &Arc<Schema>, n: i64, tag: Option<&str>) -> Record {
        let mut record = schema.create_record().unwrap();
        record.set("n", Value::Integer(n)).unwrap();
        record.set("tag", tag.map(Value::from)).unwrap();
        record
    }

    #[test]
    fn test_unique_indexes() {
        let schema = schema();
        let mut table = RecordTable::new();
        table.insert(0, record(&schema, 1, Some("a"))).unwrap();
        // Absent values aren't indexed.
        table.insert(1, record(&schema, 2, None)).unwrap();
        table.insert(2, record(&schema, 3, None)).unwrap();

        assert!(matches!(
            table.insert(3, record(&schema, 1, Some("b"))),
            Err(Error::UniqueViolation { index, .. }) if index == "pk"
        ));
        assert!(matches!(
            table.insert(3, record(&schema, 4, Some("a"))),
            Err(Error::UniqueViolation { index, .. }) if index == "by_tag"
        ));
        assert_eq!(table.len(), 3);

        // Replacing a row may keep its own keys.
        table.replace(0, record(&schema, 1, Some("a"))).unwrap();
        assert!(table.replace(1, record(&schema, 2, Some("a"))).is_err());
        table.replace(0, record(&schema, 1, Some("c"))).unwrap();
        table.replace(1, record(&schema, 2, Some("a"))).unwrap();
    }

    #[test]
    fn test_lookup_and_remove() {
        let schema = schema();
        let mut table = RecordTable::new();
        table.insert(7, record(&schema, 1, Some("a"))).unwrap();

        let key = record(&schema, 1, None);
        assert_eq!(table.find_by_primary_key(&key).unwrap(), Some(7));
        assert!(table.remove(7).is_some());
        assert_eq!(table.find_by_primary_key(&key).unwrap(), None);
        assert!(table.remove(7).is_none());
        table.insert(8, record(&schema, 5, Some("a"))).unwrap();
    }

    #[test]
    fn test_restore() {
        let schema = schema();
        let mut table = RecordTable::new();
        table.insert(0, record(&schema, 1, Some("a"))).unwrap();
        table.insert(1, record(&schema, 2, Some("b"))).unwrap();

        // Change a few rows, remembering what they held.
        let mut undo = Vec::new();
        let replaced = table.replace(0, record(&schema, 1, Some("z"))).unwrap();
        undo.push((0, replaced));
        undo.push((1, table.remove(1)));
        table.insert(2, record(&schema, 3, Some("b"))).unwrap();
        undo.push((2, None));

        for (row, previous) in undo.into_iter().rev() {
            table.restore(row, previous);
        }
        assert_eq!(table.len(), 2);
        assert!(table.get(2).is_none());
        let tag = |row| table.get(row).unwrap().get("tag").unwrap().map(|v| v.into_owned());
        assert_eq!(tag(0), Some(Value::from("a")));
        assert_eq!(tag(1), Some(Value::from("b")));

        // The index entries are back too.
        assert!(table.insert(3, record(&schema, 4, Some("a"))).is_err());
        assert!(table.insert(3, record(&schema, 4, Some("b"))).is_err());
        table.insert(3, record(&schema, 4, Some("z"))).unwrap();
        assert_eq!(table.find_by_primary_key(&record(&schema, 3, None)).unwrap(), None);
    }
}
