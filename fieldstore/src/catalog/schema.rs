use std::{collections::HashMap, fmt, sync::Arc};

use bitbuff::{BitReader, BitWriter};
use tracing::trace;

use crate::{
    catalog::{
        column::Column,
        index::{Index, IndexDescriptor},
        record::Record,
        ty::KnownSchemas,
    },
    config::{IDENTIFIER_SIZE, LAST_EXPORTED_AT, LAST_STORED_AT},
    error::{DbResult, Error},
    util::{
        io::{Serde, SerdeCtx, VarList, VarString},
        names,
    },
};

/// How two column sets (or schemas) are compared.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SchemaEquality {
    /// Every column attribute must be equal.
    Strict,
    /// Columns must only be equivalent (see [`Column::is_equivalent`]). Used
    /// when comparing a schema with one reconstructed from stored data.
    Equivalent,
}

/// An ordered, named set of columns.
///
/// A column set is built incrementally and then sealed. Once sealed, its
/// structure is frozen and value sets may be created against it. Virtual
/// columns are listed right after their source column but take no value
/// slot.
#[derive(Debug, Clone)]
pub struct ColumnSet {
    name: String,
    columns: Vec<Column>,
    /// Column index for each value slot.
    slots: Vec<usize>,
    /// Value slot for each column index (`None` for virtual columns).
    slot_of: Vec<Option<usize>>,
    /// Lowercase column name to column index.
    lookup: HashMap<String, usize>,
    sealed: bool,
}

impl ColumnSet {
    pub fn new(name: impl Into<String>) -> ColumnSet {
        ColumnSet {
            name: name.into(),
            columns: Vec::new(),
            slots: Vec::new(),
            slot_of: Vec::new(),
            lookup: HashMap::new(),
            sealed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    fn check_unsealed(&self) -> DbResult<()> {
        if self.sealed {
            return Err(Error::SchemaViolation(
                format!("`{}` is sealed", self.name).into(),
            ));
        }
        Ok(())
    }

    fn check_new_name(&self, name: &str) -> DbResult<()> {
        if name.is_empty() || name.len() > IDENTIFIER_SIZE {
            return Err(Error::SchemaViolation(
                format!("invalid column name `{name}`").into(),
            ));
        }
        if self.lookup.contains_key(&names::fold(name)) {
            return Err(Error::SchemaViolation(
                format!("`{}` already has a column named `{name}`", self.name).into(),
            ));
        }
        Ok(())
    }

    /// Appends a (real) column.
    pub fn add_column(&mut self, column: Column) -> DbResult<()> {
        self.check_unsealed()?;
        if column.is_virtual() {
            return Err(Error::SchemaViolation(
                format!("`{}` is virtual; use `add_virtual_column`", column.name).into(),
            ));
        }
        self.check_new_name(&column.name)?;
        column
            .ty
            .check()
            .map_err(|reason| Error::SchemaViolation(reason.into()))?;

        self.columns.push(column);
        self.reindex();
        Ok(())
    }

    /// Adds a virtual column right after its source column (and the virtual
    /// columns previously added for it).
    pub fn add_virtual_column(&mut self, column: Column) -> DbResult<()> {
        self.check_unsealed()?;
        let Some(source) = &column.source else {
            return Err(Error::SchemaViolation(
                format!("`{}` is not virtual", column.name).into(),
            ));
        };
        self.check_new_name(&column.name)?;

        let source_idx = *self
            .lookup
            .get(&names::fold(&source.column))
            .ok_or_else(|| {
                Error::SchemaViolation(format!("unknown source column `{}`", source.column).into())
            })?;
        let source_column = &self.columns[source_idx];
        if source_column.is_virtual() || source_column.ty.kind() != source.mapper.source_kind() {
            return Err(Error::SchemaViolation(
                format!(
                    "`{}` can't be the source of a {:?} virtual column",
                    source_column.name, source.mapper
                )
                .into(),
            ));
        }

        let mut at = source_idx + 1;
        while at < self.columns.len() && self.columns[at].is_virtual() {
            at += 1;
        }
        self.columns.insert(at, column);
        self.reindex();
        Ok(())
    }

    fn reindex(&mut self) {
        self.slots.clear();
        self.slot_of.clear();
        self.lookup.clear();
        for (i, column) in self.columns.iter().enumerate() {
            self.lookup.insert(names::fold(&column.name), i);
            if column.is_virtual() {
                self.slot_of.push(None);
            } else {
                self.slot_of.push(Some(self.slots.len()));
                self.slots.push(i);
            }
        }
    }

    /// Seals the column set. Fails if it was already sealed.
    pub fn seal(&mut self) -> DbResult<()> {
        self.check_unsealed()?;
        self.sealed = true;
        Ok(())
    }

    /// Returns the column with the given (case-insensitive) name.
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.lookup
            .get(&names::fold(name))
            .map(|&i| &self.columns[i])
    }

    /// Returns the real column stored at the given value slot.
    pub fn column_at(&self, slot: usize) -> Option<&Column> {
        self.slots.get(slot).map(|&i| &self.columns[i])
    }

    /// Returns the value slot of the column with the given name. Virtual
    /// columns have no slot.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.lookup
            .get(&names::fold(name))
            .and_then(|&i| self.slot_of[i])
    }

    pub fn columns(&self, include_virtual: bool) -> impl Iterator<Item = &Column> + '_ {
        self.columns
            .iter()
            .filter(move |column| include_virtual || !column.is_virtual())
    }

    pub fn len(&self, include_virtual: bool) -> usize {
        if include_virtual {
            self.columns.len()
        } else {
            self.slots.len()
        }
    }

    pub fn equals(&self, other: &ColumnSet, mode: SchemaEquality) -> bool {
        if self.columns.len() != other.columns.len() {
            return false;
        }
        let mut pairs = self.columns.iter().zip(&other.columns);
        match mode {
            SchemaEquality::Strict => self.name == other.name && pairs.all(|(a, b)| a == b),
            SchemaEquality::Equivalent => pairs.all(|(a, b)| a.is_equivalent(b)),
        }
    }
}

/// Identifies a schema within its model.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaId {
    pub model_id: u64,
    pub number: u16,
}

impl SchemaId {
    pub const fn new(model_id: u64, number: u16) -> SchemaId {
        SchemaId { model_id, number }
    }
}

impl fmt::Display for SchemaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.model_id, self.number)
    }
}

impl Serde for SchemaId {
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        buf.write(self.model_id);
        buf.write(self.number);
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self> {
        Ok(SchemaId {
            model_id: buf.read()?,
            number: buf.read()?,
        })
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SchemaFlags {
    /// Adds the implicit `LastStoredAt` and `LastExportedAt` columns.
    pub track_changes: bool,
    /// Allows sealing a schema without columns. Records of such schemas are
    /// never stored.
    pub allow_columnless: bool,
}

/// A record type: a column set with indexes, an optional primary key and
/// flags, identified by a [`SchemaId`].
#[derive(Debug, Clone)]
pub struct Schema {
    id: SchemaId,
    columns: ColumnSet,
    indexes: Vec<Index>,
    primary_key: Option<Index>,
    flags: SchemaFlags,
}

impl Schema {
    pub fn new(id: SchemaId, name: impl Into<String>) -> Schema {
        Schema::with_flags(id, name, SchemaFlags::default())
    }

    pub fn with_flags(id: SchemaId, name: impl Into<String>, flags: SchemaFlags) -> Schema {
        Schema {
            id,
            columns: ColumnSet::new(name),
            indexes: Vec::new(),
            primary_key: None,
            flags,
        }
    }

    pub fn id(&self) -> SchemaId {
        self.id
    }

    pub fn name(&self) -> &str {
        self.columns.name()
    }

    pub fn flags(&self) -> SchemaFlags {
        self.flags
    }

    pub fn is_sealed(&self) -> bool {
        self.columns.is_sealed()
    }

    pub fn column_set(&self) -> &ColumnSet {
        &self.columns
    }

    /// Checks whether the column is one of the implicit change tracking
    /// columns of this schema.
    pub fn is_implicit(&self, column: &Column) -> bool {
        self.flags.track_changes
            && (names::same(&column.name, LAST_STORED_AT)
                || names::same(&column.name, LAST_EXPORTED_AT))
    }

    fn check_reserved(&self, column: &Column) -> DbResult<()> {
        if self.is_implicit(column) {
            return Err(Error::SchemaViolation(
                format!("`{}` is a reserved column name", column.name).into(),
            ));
        }
        Ok(())
    }

    pub fn add_column(&mut self, column: Column) -> DbResult<()> {
        self.check_reserved(&column)?;
        self.columns.add_column(column)
    }

    pub fn add_virtual_column(&mut self, column: Column) -> DbResult<()> {
        self.check_reserved(&column)?;
        self.columns.add_virtual_column(column)
    }

    /// Resolves the given names to (clones of) real columns of this schema.
    fn index_columns(&self, names: &[&str]) -> DbResult<Vec<Column>> {
        if names.is_empty() {
            return Err(Error::SchemaViolation("an index needs columns".into()));
        }
        names
            .iter()
            .map(|name| match self.columns.column(name) {
                Some(column) if !column.is_virtual() => Ok(column.clone()),
                Some(_) => Err(Error::SchemaViolation(
                    format!("virtual column `{name}` can't be indexed").into(),
                )),
                None => Err(Error::SchemaViolation(
                    format!("unknown column `{name}` in `{}`", self.name()).into(),
                )),
            })
            .collect()
    }

    fn check_index_name(&self, name: &str) -> DbResult<()> {
        let taken = self
            .indexes
            .iter()
            .chain(&self.primary_key)
            .any(|index| names::same(index.name(), name));
        if taken {
            return Err(Error::SchemaViolation(
                format!("`{}` already has an index named `{name}`", self.name()).into(),
            ));
        }
        Ok(())
    }

    /// Adds a secondary index over the named columns.
    pub fn add_index(&mut self, name: &str, columns: &[&str], unique: bool) -> DbResult<()> {
        self.columns.check_unsealed()?;
        self.check_index_name(name)?;
        let columns = self.index_columns(columns)?;
        self.indexes.push(Index::new(name, columns, unique, false)?);
        Ok(())
    }

    /// Sets the primary key over the named (non-optional) columns.
    pub fn set_primary_key(&mut self, name: &str, columns: &[&str]) -> DbResult<()> {
        self.set_key(name, columns, false)
    }

    /// Sets an auto-incrementing primary key over a single signed 64-bit
    /// integer column.
    pub fn set_auto_increment_key(&mut self, name: &str, column: &str) -> DbResult<()> {
        self.set_key(name, &[column], true)
    }

    fn set_key(&mut self, name: &str, columns: &[&str], auto_increment: bool) -> DbResult<()> {
        self.columns.check_unsealed()?;
        if self.primary_key.is_some() {
            return Err(Error::SchemaViolation(
                format!("`{}` already has a primary key", self.name()).into(),
            ));
        }
        self.check_index_name(name)?;
        let columns = self.index_columns(columns)?;
        if let Some(column) = columns.iter().find(|c| c.optional) {
            return Err(Error::SchemaViolation(
                format!("primary key column `{}` can't be optional", column.name).into(),
            ));
        }
        self.primary_key = Some(Index::new(name, columns, true, auto_increment)?);
        Ok(())
    }

    /// Seals the schema, appending the implicit columns if changes are
    /// tracked.
    pub fn seal(&mut self) -> DbResult<()> {
        self.columns.check_unsealed()?;
        if self.columns.len(true) == 0 && !self.flags.allow_columnless {
            return Err(Error::SchemaViolation(
                format!("`{}` has no columns", self.name()).into(),
            ));
        }
        if self.flags.track_changes {
            self.columns.add_column(Column::datetime(LAST_STORED_AT, true))?;
            self.columns
                .add_column(Column::datetime(LAST_EXPORTED_AT, true))?;
        }
        for index in self.indexes.iter().chain(&self.primary_key) {
            for column in index.columns().columns(false) {
                if self.columns.column(&column.name) != Some(column) {
                    return Err(Error::SchemaViolation(
                        format!("index `{}` column `{}` is missing", index.name(), column.name)
                            .into(),
                    ));
                }
            }
        }
        self.columns.seal()?;
        trace!(id = %self.id, name = self.name(), "sealed schema");
        Ok(())
    }

    /// Whether the schema has no columns other than the implicit ones.
    pub fn is_columnless(&self) -> bool {
        self.user_columns(true).next().is_none()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.column(name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.columns.position(name)
    }

    pub fn columns(&self, include_virtual: bool) -> impl Iterator<Item = &Column> + '_ {
        self.columns.columns(include_virtual)
    }

    /// Columns excluding the implicit change tracking ones.
    pub fn user_columns(&self, include_virtual: bool) -> impl Iterator<Item = &Column> + '_ {
        self.columns
            .columns(include_virtual)
            .filter(|column| !self.is_implicit(column))
    }

    pub fn len(&self, include_virtual: bool) -> usize {
        self.columns.len(include_virtual)
    }

    pub fn indexes(&self) -> &[Index] {
        &self.indexes
    }

    pub fn primary_key(&self) -> Option<&Index> {
        self.primary_key.as_ref()
    }

    /// The primary key (first, if any) and the unique secondary indexes.
    pub fn unique_indexes(&self) -> impl Iterator<Item = &Index> + '_ {
        self.primary_key
            .iter()
            .chain(self.indexes.iter().filter(|index| index.is_unique()))
    }

    pub fn auto_increment_column(&self) -> Option<&Column> {
        self.primary_key
            .as_ref()
            .filter(|pk| pk.is_auto_increment())
            .and_then(|pk| pk.columns().column_at(0))
    }

    pub fn last_stored_at_column(&self) -> Option<&Column> {
        self.tracking_column(LAST_STORED_AT)
    }

    pub fn last_exported_at_column(&self) -> Option<&Column> {
        self.tracking_column(LAST_EXPORTED_AT)
    }

    fn tracking_column(&self, name: &str) -> Option<&Column> {
        if self.flags.track_changes && self.is_sealed() {
            self.columns.column(name)
        } else {
            None
        }
    }

    pub fn equals(&self, other: &Schema, mode: SchemaEquality) -> bool {
        let same_key = match (&self.primary_key, &other.primary_key) {
            (None, None) => true,
            (Some(a), Some(b)) => a.equals(b, mode),
            _ => false,
        };
        let same_indexes = match mode {
            SchemaEquality::Strict => {
                self.indexes.len() == other.indexes.len()
                    && self
                        .indexes
                        .iter()
                        .zip(&other.indexes)
                        .all(|(a, b)| a.equals(b, mode))
            }
            SchemaEquality::Equivalent => true,
        };
        self.id == other.id
            && self.flags == other.flags
            && self.columns.equals(&other.columns, mode)
            && same_key
            && same_indexes
    }

    /// Creates a new, blank, record of this (sealed) schema.
    pub fn create_record(self: &Arc<Self>) -> DbResult<Record> {
        Record::new(Arc::clone(self))
    }
}

/// Schema descriptors, as persisted in data files. Implicit columns aren't
/// written since sealing adds them back.
impl SerdeCtx for Schema {
    type DeCtx<'de> = &'de KnownSchemas;

    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        self.id.serialize(buf)?;
        VarString::from(self.name()).serialize(buf)?;
        buf.write(self.flags.track_changes);
        buf.write(self.flags.allow_columnless);

        let columns: Vec<&Column> = self.user_columns(true).collect();
        buf.write(columns.len() as u16);
        for column in columns {
            column.serialize(buf)?;
        }

        buf.write(self.primary_key.is_some());
        if let Some(pk) = &self.primary_key {
            IndexDescriptor::from(pk).serialize(buf)?;
        }
        let indexes: Vec<IndexDescriptor> = self.indexes.iter().map(Into::into).collect();
        VarList::from(indexes).serialize(buf)?;
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>, known: Self::DeCtx<'_>) -> DbResult<Self> {
        let id = SchemaId::deserialize(buf)?;
        let name: String = VarString::deserialize(buf)?.into();
        let flags = SchemaFlags {
            track_changes: buf.read()?,
            allow_columnless: buf.read()?,
        };
        let mut schema = Schema::with_flags(id, name, flags);

        let len: u16 = buf.read()?;
        for _ in 0..len {
            let column = Column::deserialize(buf, known)?;
            if column.is_virtual() {
                schema.add_virtual_column(column)?;
            } else {
                schema.add_column(column)?;
            }
        }

        if buf.read::<bool>()? {
            let pk = IndexDescriptor::deserialize(buf)?;
            let columns: Vec<&str> = pk.columns.iter().map(String::as_str).collect();
            schema.set_key(&pk.name, &columns, pk.auto_increment)?;
        }
        let indexes: Vec<IndexDescriptor> = VarList::<IndexDescriptor>::deserialize(buf)?.into();
        for index in indexes {
            let columns: Vec<&str> = index.columns.iter().map(String::as_str).collect();
            schema.add_index(&index.name, &columns, index.unique)?;
        }

        schema.seal()?;
        Ok(schema)
    }
}
