use std::{collections::HashMap, sync::Arc};

use bitbuff::{BitReader, BitWriter};
use tracing::error;

use crate::{
    catalog::schema::{Schema, SchemaId},
    error::{DbResult, Error},
    types::location::LocationOpts,
    util::io::{Serde, SerdeCtx},
};

/// Number of bits of a `DateTime` column that doesn't keep milliseconds
/// (signed seconds since the epoch).
pub const DATETIME_SECONDS_BITS: u32 = 40;

/// A column kind, with its configuration.
///
/// Every column of a schema has exactly one type. The per-kind codecs live in
/// [`Column`](crate::catalog::column::Column).
#[derive(Clone, Debug)]
pub enum ColumnType {
    Boolean,
    /// A `size`-bit integer (1 to 64 bits).
    Integer { size: u8, signed: bool },
    /// A `f64` (`double`) or `f32` float.
    Float { double: bool },
    /// An UTF-8 string of at most `max_bytes` bytes.
    String { max_bytes: u32 },
    /// A point in time, with or without millisecond precision.
    DateTime { keep_ms: bool },
    Location(LocationOpts),
    /// The primary key of a record of another schema.
    ForeignKey(Arc<Schema>),
}

/// The [`ColumnType`] discriminant.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TypeKind {
    Boolean = 0,
    Integer = 1,
    Float = 2,
    String = 3,
    DateTime = 4,
    Location = 5,
    ForeignKey = 6,
}

impl TypeKind {
    /// Returns the canonical type name.
    pub fn name(self) -> &'static str {
        match self {
            TypeKind::Boolean => "boolean",
            TypeKind::Integer => "integer",
            TypeKind::Float => "float",
            TypeKind::String => "string",
            TypeKind::DateTime => "datetime",
            TypeKind::Location => "location",
            TypeKind::ForeignKey => "foreign key",
        }
    }

    fn try_from_u8(serialized: u8) -> DbResult<Self> {
        match serialized {
            0 => Ok(TypeKind::Boolean),
            1 => Ok(TypeKind::Integer),
            2 => Ok(TypeKind::Float),
            3 => Ok(TypeKind::String),
            4 => Ok(TypeKind::DateTime),
            5 => Ok(TypeKind::Location),
            6 => Ok(TypeKind::ForeignKey),
            unexpected => {
                error!(?unexpected, "invalid `TypeKind` discriminant");
                Err(Error::CorruptedTypeTag(unexpected))
            }
        }
    }
}

impl ColumnType {
    /// A signed 64-bit integer, as used by auto-incrementing keys.
    pub const ID: ColumnType = ColumnType::Integer {
        size: 64,
        signed: true,
    };

    pub fn kind(&self) -> TypeKind {
        match self {
            ColumnType::Boolean => TypeKind::Boolean,
            ColumnType::Integer { .. } => TypeKind::Integer,
            ColumnType::Float { .. } => TypeKind::Float,
            ColumnType::String { .. } => TypeKind::String,
            ColumnType::DateTime { .. } => TypeKind::DateTime,
            ColumnType::Location(_) => TypeKind::Location,
            ColumnType::ForeignKey(_) => TypeKind::ForeignKey,
        }
    }

    /// Checks the type configuration itself.
    pub fn check(&self) -> Result<(), String> {
        match self {
            ColumnType::Integer { size, .. } if !(1..=64).contains(size) => {
                Err(format!("integer size must be in 1..=64, got {size}"))
            }
            ColumnType::String { max_bytes: 0 } => Err("string max size must be positive".into()),
            ColumnType::ForeignKey(schema) if schema.primary_key().is_none() => Err(format!(
                "referenced schema `{}` has no primary key",
                schema.name()
            )),
            ColumnType::ForeignKey(schema) if !schema.is_sealed() => Err(format!(
                "referenced schema `{}` is not sealed",
                schema.name()
            )),
            _ => Ok(()),
        }
    }

    /// Returns the minimum number of bits of an encoded value (without the
    /// presence bit of optional columns).
    pub fn minimum_size(&self) -> usize {
        match self {
            ColumnType::Boolean => 1,
            ColumnType::Integer { size, .. } => *size as usize,
            ColumnType::Float { double } => float_bits(*double),
            ColumnType::String { max_bytes } => string_length_bits(*max_bytes) as usize,
            ColumnType::DateTime { keep_ms } => datetime_bits(*keep_ms) as usize,
            ColumnType::Location(opts) => opts.minimum_size(),
            ColumnType::ForeignKey(schema) => key_columns(schema)
                .map(|key| key.columns(false).map(|c| c.minimum_size()).sum())
                .unwrap_or(0),
        }
    }

    /// Returns the maximum number of bits of an encoded value (without the
    /// presence bit of optional columns).
    pub fn maximum_size(&self) -> usize {
        match self {
            ColumnType::String { max_bytes } => {
                string_length_bits(*max_bytes) as usize + 8 * (*max_bytes as usize)
            }
            ColumnType::Location(opts) => opts.maximum_size(),
            ColumnType::ForeignKey(schema) => key_columns(schema)
                .map(|key| key.columns(false).map(|c| c.maximum_size()).sum())
                .unwrap_or(0),
            other => other.minimum_size(),
        }
    }
}

impl PartialEq for ColumnType {
    fn eq(&self, other: &Self) -> bool {
        use ColumnType::*;
        match (self, other) {
            (Boolean, Boolean) => true,
            (Integer { size: a, signed: x }, Integer { size: b, signed: y }) => a == b && x == y,
            (Float { double: a }, Float { double: b }) => a == b,
            (String { max_bytes: a }, String { max_bytes: b }) => a == b,
            (DateTime { keep_ms: a }, DateTime { keep_ms: b }) => a == b,
            (Location(a), Location(b)) => a == b,
            (ForeignKey(a), ForeignKey(b)) => a.id() == b.id(),
            _ => false,
        }
    }
}

fn key_columns(schema: &Schema) -> Option<&crate::catalog::schema::ColumnSet> {
    schema.primary_key().map(|pk| pk.columns().as_ref())
}

pub(crate) fn float_bits(double: bool) -> usize {
    if double {
        64
    } else {
        32
    }
}

pub(crate) fn datetime_bits(keep_ms: bool) -> u32 {
    if keep_ms {
        64
    } else {
        DATETIME_SECONDS_BITS
    }
}

/// Number of bits needed to encode a string length in `0..=max_bytes`.
pub(crate) fn string_length_bits(max_bytes: u32) -> u32 {
    (u32::BITS - max_bytes.leading_zeros()).max(1)
}

/// Context used to resolve foreign key references while decoding schema
/// descriptors.
pub type KnownSchemas = HashMap<SchemaId, Arc<Schema>>;

impl SerdeCtx for ColumnType {
    type DeCtx<'de> = &'de KnownSchemas;

    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        buf.write(self.kind() as u8);
        match self {
            ColumnType::Boolean => (),
            ColumnType::Integer { size, signed } => {
                buf.write(*size);
                buf.write(*signed);
            }
            ColumnType::Float { double } => buf.write(*double),
            ColumnType::String { max_bytes } => buf.write(*max_bytes),
            ColumnType::DateTime { keep_ms } => buf.write(*keep_ms),
            ColumnType::Location(opts) => buf.write(opts.to_flags()),
            ColumnType::ForeignKey(schema) => schema.id().serialize(buf)?,
        }
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>, known: Self::DeCtx<'_>) -> DbResult<Self> {
        let ty = match TypeKind::try_from_u8(buf.read()?)? {
            TypeKind::Boolean => ColumnType::Boolean,
            TypeKind::Integer => ColumnType::Integer {
                size: buf.read()?,
                signed: buf.read()?,
            },
            TypeKind::Float => ColumnType::Float {
                double: buf.read()?,
            },
            TypeKind::String => ColumnType::String {
                max_bytes: buf.read()?,
            },
            TypeKind::DateTime => ColumnType::DateTime {
                keep_ms: buf.read()?,
            },
            TypeKind::Location => ColumnType::Location(LocationOpts::from_flags(buf.read()?)),
            TypeKind::ForeignKey => {
                let id = SchemaId::deserialize(buf)?;
                let schema = known.get(&id).ok_or(Error::UnknownSchema(id))?;
                ColumnType::ForeignKey(Arc::clone(schema))
            }
        };
        ty.check().map_err(|reason| Error::Corrupted(reason.into()))?;
        Ok(ty)
    }
}
