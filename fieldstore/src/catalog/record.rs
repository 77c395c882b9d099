use std::{borrow::Cow, fmt, sync::Arc};

use bitbuff::{BitReader, BitWriter};

use crate::{
    catalog::{
        column::Column,
        schema::{ColumnSet, Schema, SchemaEquality},
    },
    config::{ESCAPE_PREFIX, ESCAPE_SEPARATOR, SEPARATOR},
    error::{DbResult, Error},
    exec::value::Value,
    query::{Constraint, RecordsQuery, Source},
    util::names,
};

/// Anything that owns a sealed [`ColumnSet`] value sets may be bound to.
pub trait AsColumnSet: fmt::Debug + Send + Sync {
    fn column_set(&self) -> &ColumnSet;
}

impl AsColumnSet for ColumnSet {
    fn column_set(&self) -> &ColumnSet {
        self
    }
}

impl AsColumnSet for Schema {
    fn column_set(&self) -> &ColumnSet {
        Schema::column_set(self)
    }
}

/// Identifies the store row a record was loaded from or stored to.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub(crate) struct RowRef {
    pub store: u64,
    pub row: u64,
}

/// Values bound to a sealed column set: one slot per real column.
///
/// Values are only read and written through [`Column`] accessors, which
/// resolve and type-check the slot.
pub struct ValueSet<S: AsColumnSet> {
    owner: Arc<S>,
    values: Vec<Option<Value>>,
    row: Option<RowRef>,
}

/// A value set of a [`Schema`].
pub type Record = ValueSet<Schema>;

impl<S: AsColumnSet> ValueSet<S> {
    /// Creates a blank value set. The column set must be sealed.
    pub fn new(owner: Arc<S>) -> DbResult<Self> {
        let set = owner.column_set();
        if !set.is_sealed() {
            return Err(Error::SchemaViolation(
                format!("`{}` is not sealed", set.name()).into(),
            ));
        }
        let values = vec![None; set.len(false)];
        Ok(ValueSet {
            owner,
            values,
            row: None,
        })
    }

    /// Creates a value set from its text form (see [`ValueSet::parse`]).
    pub fn parsed(owner: Arc<S>, text: &str) -> DbResult<Self> {
        let mut vs = ValueSet::new(owner)?;
        vs.parse(text)?;
        Ok(vs)
    }

    /// Creates a value set from its binary form (see [`ValueSet::to_bytes`]).
    pub fn from_bytes(owner: Arc<S>, bytes: &[u8]) -> DbResult<Self> {
        let mut vs = ValueSet::new(owner)?;
        vs.read_from(&mut BitReader::new(bytes), false, &[])?;
        Ok(vs)
    }

    pub fn owner(&self) -> &Arc<S> {
        &self.owner
    }

    pub fn column_set(&self) -> &ColumnSet {
        self.owner.column_set()
    }

    pub(crate) fn slot_value(&self, slot: usize) -> Option<&Value> {
        self.values.get(slot).and_then(Option::as_ref)
    }

    pub(crate) fn set_slot(&mut self, slot: usize, value: Option<Value>) {
        self.values[slot] = value;
    }

    pub(crate) fn values(&self) -> &[Option<Value>] {
        &self.values
    }

    pub(crate) fn into_values(self) -> Vec<Option<Value>> {
        self.values
    }

    /// Returns the value of the named column.
    pub fn get(&self, name: &str) -> DbResult<Option<Cow<'_, Value>>> {
        self.resolve(name)?.retrieve_value(self)
    }

    /// Stores the value of the named column.
    pub fn set(&mut self, name: &str, value: impl Into<Option<Value>>) -> DbResult<()> {
        let owner = Arc::clone(&self.owner);
        let column = owner.column_set().column(name).ok_or_else(|| unknown(name))?;
        column.store_value(self, value)
    }

    fn resolve(&self, name: &str) -> DbResult<&Column> {
        self.column_set().column(name).ok_or_else(|| unknown(name))
    }

    /// Whether every non-optional column has a value.
    pub fn is_filled(&self) -> bool {
        self.unfilled_columns().next().is_none()
    }

    /// The non-optional columns without a value.
    pub fn unfilled_columns(&self) -> impl Iterator<Item = &Column> + '_ {
        self.column_set()
            .columns(false)
            .zip(&self.values)
            .filter(|(column, value)| !column.optional && value.is_none())
            .map(|(column, _)| column)
    }

    /// Renders the text form with the default separator.
    pub fn serialise(&self) -> DbResult<String> {
        self.serialise_with(SEPARATOR, &[])
    }

    /// Renders the text form: one escaped field per real column, in order.
    /// Skipped columns and absent values produce empty fields.
    pub fn serialise_with(&self, separator: char, skip: &[&str]) -> DbResult<String> {
        let mut out = String::new();
        for (i, column) in self.column_set().columns(false).enumerate() {
            if i > 0 {
                out.push(separator);
            }
            if is_skipped(column, skip) {
                continue;
            }
            if let Some(text) = column.retrieve_value_as_string(self)? {
                escape_into(&mut out, &text, separator);
            }
        }
        Ok(out)
    }

    /// Parses the text form produced by [`ValueSet::serialise`].
    pub fn parse(&mut self, text: &str) -> DbResult<()> {
        self.parse_with(text, SEPARATOR, &[])
    }

    /// Parses the text form. The number of fields must match the number of
    /// real columns; fields of skipped columns are ignored and empty fields
    /// clear the value.
    pub fn parse_with(&mut self, text: &str, separator: char, skip: &[&str]) -> DbResult<()> {
        let owner = Arc::clone(&self.owner);
        let set = owner.column_set();
        let parts: Vec<&str> = text.split(separator).collect();
        if parts.len() != set.len(false) {
            return Err(Error::Parse {
                column: set.name().to_owned(),
                reason: format!(
                    "expected {} fields, found {}",
                    set.len(false),
                    parts.len()
                )
                .into(),
            });
        }
        for (column, part) in set.columns(false).zip(parts) {
            if is_skipped(column, skip) {
                continue;
            }
            if part.is_empty() {
                column.clear_value(self)?;
            } else {
                let part = unescape(part, separator).map_err(|reason| Error::Parse {
                    column: column.name.clone(),
                    reason,
                })?;
                column.parse_and_store_value(self, &part)?;
            }
        }
        Ok(())
    }

    /// Returns the binary form of the real columns.
    pub fn to_bytes(&self) -> DbResult<Vec<u8>> {
        let mut buf = BitWriter::new();
        self.write_to(&mut buf, false, &[])?;
        Ok(buf.into_bytes())
    }

    /// Writes the values of the (non-skipped) columns, in order.
    pub fn write_to(&self, buf: &mut BitWriter, include_virtual: bool, skip: &[&str]) -> DbResult<()> {
        for column in self.column_set().columns(include_virtual) {
            if is_skipped(column, skip) {
                continue;
            }
            let value = column.retrieve_value(self)?;
            column.write_value(value.as_deref(), buf)?;
        }
        Ok(())
    }

    /// Reads values written by [`ValueSet::write_to`] with the same arguments.
    /// Values of virtual columns are consumed and discarded.
    pub fn read_from(
        &mut self,
        buf: &mut BitReader<'_>,
        include_virtual: bool,
        skip: &[&str],
    ) -> DbResult<()> {
        let owner = Arc::clone(&self.owner);
        let set = owner.column_set();
        for column in set.columns(include_virtual) {
            if is_skipped(column, skip) {
                continue;
            }
            let value = column.read_value(buf)?;
            if let Some(slot) = set.position(&column.name) {
                self.values[slot] = value;
            }
        }
        Ok(())
    }

    /// Returns the exact number of bits of the binary form.
    pub fn size(&self, include_virtual: bool, skip: &[&str]) -> DbResult<usize> {
        let mut buf = BitWriter::new();
        self.write_to(&mut buf, include_virtual, skip)?;
        Ok(buf.bits_written())
    }

    /// Compares the values of both sets, column by column. Column sets that
    /// aren't equivalent never have equal values.
    ///
    /// With `as_stored_binary`, values are compared as they would be after a
    /// binary round trip, so precision lost by the codec is ignored.
    pub fn has_equal_values<T: AsColumnSet>(
        &self,
        other: &ValueSet<T>,
        skip: &[&str],
        as_stored_binary: bool,
    ) -> DbResult<bool> {
        if !self
            .column_set()
            .equals(other.column_set(), SchemaEquality::Equivalent)
        {
            return Ok(false);
        }
        for (slot, column) in self.column_set().columns(false).enumerate() {
            if is_skipped(column, skip) {
                continue;
            }
            let mine = self.values[slot].as_ref();
            let theirs = other.values[slot].as_ref();
            let equal = if as_stored_binary {
                column.as_stored_binary(mine)? == column.as_stored_binary(theirs)?
            } else {
                mine == theirs
            };
            if !equal {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<S: AsColumnSet> Clone for ValueSet<S> {
    fn clone(&self) -> Self {
        ValueSet {
            owner: Arc::clone(&self.owner),
            values: self.values.clone(),
            row: self.row,
        }
    }
}

impl<S: AsColumnSet> fmt::Debug for ValueSet<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (column, value) in self.column_set().columns(false).zip(&self.values) {
            map.entry(&column.name, value);
        }
        map.finish()
    }
}

/// Value sets are equal if their column sets are equivalent and their values
/// equal.
impl<S: AsColumnSet, T: AsColumnSet> PartialEq<ValueSet<T>> for ValueSet<S> {
    fn eq(&self, other: &ValueSet<T>) -> bool {
        self.has_equal_values(other, &[], false).unwrap_or(false)
    }
}

fn unknown(name: &str) -> Error {
    Error::SchemaViolation(format!("unknown column `{name}`").into())
}

fn is_skipped(column: &Column, skip: &[&str]) -> bool {
    skip.iter().any(|name| names::same(&column.name, name))
}

fn escape_into(out: &mut String, text: &str, separator: char) {
    for c in text.chars() {
        if c == ESCAPE_PREFIX {
            out.push(ESCAPE_PREFIX);
            out.push(ESCAPE_PREFIX);
        } else if c == separator {
            out.push(ESCAPE_PREFIX);
            out.push(ESCAPE_SEPARATOR);
        } else {
            out.push(c);
        }
    }
}

fn unescape(text: &str, separator: char) -> Result<String, Cow<'static, str>> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != ESCAPE_PREFIX {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some(ESCAPE_PREFIX) => out.push(ESCAPE_PREFIX),
            Some(ESCAPE_SEPARATOR) => out.push(separator),
            Some(other) => return Err(format!("invalid escape sequence `/{other}`").into()),
            None => return Err("dangling escape character".into()),
        }
    }
    Ok(out)
}

impl ValueSet<Schema> {
    pub fn schema(&self) -> &Arc<Schema> {
        &self.owner
    }

    pub(crate) fn row(&self) -> Option<RowRef> {
        self.row
    }

    pub(crate) fn set_row(&mut self, row: Option<RowRef>) {
        self.row = row;
    }

    fn tracking_value(&self, column: Option<&Column>) -> Option<i64> {
        let slot = self.owner.position(&column?.name)?;
        self.values[slot].as_ref().and_then(Value::as_datetime)
    }

    /// The time (ms since the epoch) the record was last stored, if changes
    /// are tracked.
    pub fn last_stored_at(&self) -> Option<i64> {
        self.tracking_value(self.owner.last_stored_at_column())
    }

    pub(crate) fn set_last_stored_at(&mut self, ms: Option<i64>) {
        if let Some(slot) = self
            .owner
            .last_stored_at_column()
            .and_then(|column| self.owner.position(&column.name))
        {
            self.values[slot] = ms.map(Value::DateTime);
        }
    }

    /// The time (ms since the epoch) the record was last exported, if changes
    /// are tracked.
    pub fn last_exported_at(&self) -> Option<i64> {
        self.tracking_value(self.owner.last_exported_at_column())
    }

    pub fn set_last_exported_at(&mut self, ms: Option<i64>) -> DbResult<()> {
        let owner = Arc::clone(&self.owner);
        let column = owner.last_exported_at_column().ok_or_else(|| {
            Error::SchemaViolation(
                format!("`{}` doesn't track changes", owner.name()).into(),
            )
        })?;
        column.store_value(self, ms.map(Value::DateTime))
    }

    /// Returns a reference to this record (its primary key values).
    pub fn reference(&self) -> DbResult<RecordReference> {
        let pk = self.owner.primary_key().ok_or_else(|| {
            Error::SchemaViolation(
                format!("`{}` has no primary key", self.owner.name()).into(),
            )
        })?;
        Ok(RecordReference {
            schema: Arc::clone(&self.owner),
            key: pk.key_values(self)?,
        })
    }

    /// Returns a query matching this record by primary key.
    pub fn record_query(&self) -> DbResult<RecordsQuery> {
        self.reference()?.record_query()
    }
}

/// A reference to a record: its schema and its primary key values.
#[derive(Clone, Debug)]
pub struct RecordReference {
    schema: Arc<Schema>,
    key: ValueSet<ColumnSet>,
}

impl RecordReference {
    /// Creates a blank reference to a record of the given schema.
    pub fn new(schema: Arc<Schema>) -> DbResult<RecordReference> {
        let pk = schema.primary_key().ok_or_else(|| {
            Error::SchemaViolation(format!("`{}` has no primary key", schema.name()).into())
        })?;
        let key = ValueSet::new(Arc::clone(pk.columns()))?;
        Ok(RecordReference { schema, key })
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn key(&self) -> &ValueSet<ColumnSet> {
        &self.key
    }

    pub fn key_mut(&mut self) -> &mut ValueSet<ColumnSet> {
        &mut self.key
    }

    /// The key as a foreign key value.
    pub fn to_value(&self) -> Value {
        Value::Composite(self.key.values().to_vec())
    }

    /// Returns a query matching the referenced record.
    pub fn record_query(&self) -> DbResult<RecordsQuery> {
        if !self.key.is_filled() {
            return Err(Error::IncompleteKey(self.schema.name().to_owned()));
        }
        let constraints = self
            .key
            .column_set()
            .columns(false)
            .zip(self.key.values())
            .map(|(column, value)| Constraint::equal(&column.name, value.clone()))
            .collect();
        RecordsQuery::builder(Source::schema(Arc::clone(&self.schema)))
            .constraint(Constraint::And(constraints))
            .build()
    }
}

impl PartialEq for RecordReference {
    fn eq(&self, other: &Self) -> bool {
        self.schema.id() == other.schema.id() && self.key == other.key
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        catalog::{
            schema::{SchemaFlags, SchemaId},
            ty::ColumnType,
        },
        types::location::{Location, LocationOpts},
    };

    fn schema() -> Arc<Schema> {
        let flags = SchemaFlags {
            track_changes: true,
            ..SchemaFlags::default()
        };
        let mut schema = Schema::with_flags(SchemaId::new(7, 0), "Obs", flags);
        schema
            .add_column(Column::new("id", ColumnType::ID, false))
            .unwrap();
        schema.add_column(Column::string("note", true, 64)).unwrap();
        schema
            .add_column(Column::new("ratio", ColumnType::Float { double: false }, true))
            .unwrap();
        schema
            .add_column(Column::location("where", true, LocationOpts::full()))
            .unwrap();
        schema.set_auto_increment_key("pk", "id").unwrap();
        schema.seal().unwrap();
        Arc::new(schema)
    }

    fn sample(schema: &Arc<Schema>) -> Record {
        let mut record = schema.create_record().unwrap();
        record.set("id", Value::Integer(12)).unwrap();
        record.set("note", Value::from("a,b/c")).unwrap();
        record.set("ratio", Value::Float(0.5)).unwrap();
        let mut location = Location::new(1.5, -2.0);
        location.altitude = Some(30.0);
        record.set("where", Value::Location(location)).unwrap();
        record
    }

    #[test]
    fn test_blank_record() {
        let schema = schema();
        let record = schema.create_record().unwrap();
        assert_eq!(record.values().len(), 6);
        assert!(!record.is_filled());
        let missing: Vec<&str> = record.unfilled_columns().map(|c| c.name.as_str()).collect();
        assert_eq!(missing, ["id"]);
    }

    #[test]
    fn test_unsealed_column_set() {
        let set = Arc::new(ColumnSet::new("open"));
        assert!(matches!(
            ValueSet::new(set),
            Err(Error::SchemaViolation(_))
        ));
    }

    #[test]
    fn test_text_roundtrip() {
        let schema = schema();
        let record = sample(&schema);
        let text = record.serialise().unwrap();
        assert!(text.starts_with("12,a/.b//c,0.5,"));
        // The implicit columns are empty.
        assert!(text.ends_with(",,"));

        let parsed = Record::parsed(Arc::clone(&schema), &text).unwrap();
        assert_eq!(parsed, record);

        // Date times without a text form are rejected up front.
        let mut record = record;
        assert!(record.set("LastStoredAt", Value::DateTime(i64::MAX / 2)).is_err());
        record.set("LastStoredAt", Value::DateTime(1_677_662_430_456)).unwrap();
        let parsed = Record::parsed(Arc::clone(&schema), &record.serialise().unwrap()).unwrap();
        assert_eq!(parsed, record);
    }

    #[test]
    fn test_text_skip_and_field_count() {
        let schema = schema();
        let record = sample(&schema);
        let text = record.serialise_with(';', &["NOTE"]).unwrap();
        assert!(text.starts_with("12;;0.5;0/.1.5/.-2/.30/./././.;"));

        let mut parsed = schema.create_record().unwrap();
        parsed.parse_with(&text, ';', &["note"]).unwrap();
        assert_eq!(parsed.get("note").unwrap(), None);
        assert!(parsed.has_equal_values(&record, &["note"], false).unwrap());

        assert!(matches!(
            Record::parsed(Arc::clone(&schema), "1,2"),
            Err(Error::Parse { .. })
        ));
        assert!(matches!(
            Record::parsed(Arc::clone(&schema), "1,/x,,,,"),
            Err(Error::Parse { .. })
        ));
    }

    #[test]
    fn test_binary_roundtrip() {
        let schema = schema();
        let mut record = sample(&schema);
        record.set("ratio", Value::Float(0.1)).unwrap();

        let bytes = record.to_bytes().unwrap();
        let read = Record::from_bytes(Arc::clone(&schema), &bytes).unwrap();
        // Single precision loses digits.
        assert!(!read.has_equal_values(&record, &[], false).unwrap());
        assert!(read.has_equal_values(&record, &[], true).unwrap());
        assert!(read.has_equal_values(&record, &["ratio"], false).unwrap());
    }

    #[test]
    fn test_size() {
        let schema = schema();
        let mut record = schema.create_record().unwrap();
        // A required column without a value can't be written.
        assert!(matches!(
            record.size(false, &[]),
            Err(Error::Validation { .. })
        ));
        record.set("id", Value::Integer(1)).unwrap();
        // 64-bit id plus one presence bit per optional column.
        assert_eq!(record.size(false, &[]).unwrap(), 64 + 5);
        assert_eq!(record.size(false, &["id"]).unwrap(), 5);

        let record = sample(&schema);
        let bytes = record.to_bytes().unwrap();
        let bits = record.size(false, &[]).unwrap();
        assert_eq!(bytes.len(), (bits + 7) / 8);
    }

    #[test]
    fn test_reference() {
        let schema = schema();
        let record = sample(&schema);
        let reference = record.reference().unwrap();
        assert_eq!(reference.to_value(), Value::Composite(vec![Some(Value::Integer(12))]));
        assert_eq!(reference.key().serialise().unwrap(), "12");

        let blank = schema.create_record().unwrap().reference().unwrap();
        assert!(matches!(
            blank.record_query(),
            Err(Error::IncompleteKey(_))
        ));
    }

    #[test]
    fn test_tracking_columns() {
        let schema = schema();
        let mut record = sample(&schema);
        assert_eq!(record.last_stored_at(), None);
        record.set_last_stored_at(Some(1_000));
        record.set_last_exported_at(Some(2_000)).unwrap();
        assert_eq!(record.last_stored_at(), Some(1_000));
        assert_eq!(record.last_exported_at(), Some(2_000));
    }
}
