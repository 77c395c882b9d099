use std::sync::Arc;

use bitbuff::{BitReader, BitWriter};

use crate::{
    catalog::{
        column::Column,
        record::{Record, ValueSet},
        schema::{ColumnSet, SchemaEquality},
        ty::ColumnType,
    },
    error::{DbResult, Error},
    util::io::{Serde, VarString},
};

/// An index over some columns of a schema.
///
/// The indexed columns are kept as their own sealed column set, which is also
/// the column set of the key value sets (e.g. record references) built from
/// it.
#[derive(Debug, Clone)]
pub struct Index {
    name: String,
    columns: Arc<ColumnSet>,
    unique: bool,
    auto_increment: bool,
}

impl Index {
    pub(crate) fn new(
        name: &str,
        columns: Vec<Column>,
        unique: bool,
        auto_increment: bool,
    ) -> DbResult<Index> {
        let mut set = ColumnSet::new(name);
        if auto_increment {
            let [column] = columns.as_slice() else {
                return Err(Error::SchemaViolation(
                    "an auto-incrementing key has exactly one column".into(),
                ));
            };
            if column.ty != ColumnType::ID {
                return Err(Error::SchemaViolation(
                    format!(
                        "auto-incrementing key column `{}` must be a signed 64-bit integer",
                        column.name
                    )
                    .into(),
                ));
            }
        }
        for column in columns {
            set.add_column(column)?;
        }
        set.seal()?;
        Ok(Index {
            name: name.to_owned(),
            columns: Arc::new(set),
            unique,
            auto_increment,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn columns(&self) -> &Arc<ColumnSet> {
        &self.columns
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_auto_increment(&self) -> bool {
        self.auto_increment
    }

    /// Copies the indexed values of the record into a new value set.
    pub fn key_values(&self, record: &Record) -> DbResult<ValueSet<ColumnSet>> {
        let mut key = ValueSet::new(Arc::clone(&self.columns))?;
        for (slot, column) in self.columns.columns(false).enumerate() {
            let value = column.retrieve_value(record)?.map(|v| v.into_owned());
            key.set_slot(slot, value);
        }
        Ok(key)
    }

    /// Returns the binary form of the indexed values of the record, or `None`
    /// if any of them is absent.
    pub fn key_bytes(&self, record: &Record) -> DbResult<Option<Vec<u8>>> {
        let key = self.key_values(record)?;
        if key.values().iter().any(Option::is_none) {
            return Ok(None);
        }
        key.to_bytes().map(Some)
    }

    pub fn equals(&self, other: &Index, mode: SchemaEquality) -> bool {
        let same_name = match mode {
            SchemaEquality::Strict => self.name == other.name,
            SchemaEquality::Equivalent => true,
        };
        same_name
            && self.unique == other.unique
            && self.auto_increment == other.auto_increment
            && self.columns.equals(&other.columns, mode)
    }
}

/// Persisted form of an index: the indexed columns are referenced by name.
#[derive(Debug, Clone)]
pub(crate) struct IndexDescriptor {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
    pub auto_increment: bool,
}

impl From<&Index> for IndexDescriptor {
    fn from(index: &Index) -> Self {
        IndexDescriptor {
            name: index.name.clone(),
            columns: index
                .columns
                .columns(false)
                .map(|column| column.name.clone())
                .collect(),
            unique: index.unique,
            auto_increment: index.auto_increment,
        }
    }
}

impl Serde for IndexDescriptor {
    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        VarString::from(self.name.as_str()).serialize(buf)?;
        buf.write(self.unique);
        buf.write(self.auto_increment);
        buf.write(self.columns.len() as u16);
        for column in &self.columns {
            VarString::from(column.as_str()).serialize(buf)?;
        }
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>) -> DbResult<Self> {
        let name = VarString::deserialize(buf)?.into();
        let unique = buf.read()?;
        let auto_increment = buf.read()?;
        let len: u16 = buf.read()?;
        let columns = (0..len)
            .map(|_| VarString::deserialize(buf).map(String::from))
            .collect::<DbResult<_>>()?;
        Ok(IndexDescriptor {
            name,
            columns,
            unique,
            auto_increment,
        })
    }
}
