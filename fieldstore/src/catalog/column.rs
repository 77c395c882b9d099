use std::{borrow::Cow, sync::Arc};

use bitbuff::{BitReader, BitWriter};
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use tracing::error;

use crate::{
    catalog::{
        record::{AsColumnSet, ValueSet},
        schema::{ColumnSet, Schema},
        ty::{datetime_bits, string_length_bits, ColumnType, KnownSchemas, TypeKind},
    },
    error::{DbResult, Error},
    exec::value::Value,
    types::location::{self, LocationOpts},
    util::{
        io::{Serde, SerdeCtx, VarString},
        names,
    },
};

/// A column definition.
///
/// Columns never hold values themselves: they are typed accessors into the
/// slots of a [`ValueSet`] whose column set contains them (or an equivalent
/// column).
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    /// The column identifier, compared case-insensitively.
    pub name: String,
    /// The column value type.
    pub ty: ColumnType,
    /// Whether the column accepts absent values. Optional columns spend one
    /// presence bit in the binary form.
    pub optional: bool,
    /// For virtual columns, the column the value is derived from.
    pub source: Option<VirtualSource>,
}

/// Where the value of a virtual column comes from.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualSource {
    /// Name of the (real) source column.
    pub column: String,
    pub mapper: ValueMapper,
}

/// Derives the value of a virtual column from the value of its source.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueMapper {
    Latitude = 0,
    Longitude = 1,
    Altitude = 2,
    /// The `YYYY-MM-DD` (UTC) date of a date time.
    Date = 3,
}

impl ValueMapper {
    /// The kind of column this mapper accepts as a source.
    pub fn source_kind(self) -> TypeKind {
        match self {
            ValueMapper::Latitude | ValueMapper::Longitude | ValueMapper::Altitude => {
                TypeKind::Location
            }
            ValueMapper::Date => TypeKind::DateTime,
        }
    }

    /// The type of the values produced by this mapper.
    pub fn target_type(self) -> ColumnType {
        match self {
            ValueMapper::Latitude | ValueMapper::Longitude | ValueMapper::Altitude => {
                ColumnType::Float { double: true }
            }
            ValueMapper::Date => ColumnType::String { max_bytes: 10 },
        }
    }

    pub fn map(self, value: &Value) -> Option<Value> {
        match (self, value) {
            (ValueMapper::Latitude, Value::Location(loc)) => Some(Value::Float(loc.latitude)),
            (ValueMapper::Longitude, Value::Location(loc)) => Some(Value::Float(loc.longitude)),
            (ValueMapper::Altitude, Value::Location(loc)) => loc.altitude.map(Value::Float),
            (ValueMapper::Date, Value::DateTime(ms)) => Utc
                .timestamp_millis_opt(*ms)
                .single()
                .map(|dt| Value::String(dt.format("%Y-%m-%d").to_string())),
            _ => None,
        }
    }

    fn try_from_u8(serialized: u8) -> DbResult<Self> {
        match serialized {
            0 => Ok(ValueMapper::Latitude),
            1 => Ok(ValueMapper::Longitude),
            2 => Ok(ValueMapper::Altitude),
            3 => Ok(ValueMapper::Date),
            unexpected => {
                error!(?unexpected, "invalid `ValueMapper` discriminant");
                Err(Error::CorruptedTypeTag(unexpected))
            }
        }
    }
}

impl Column {
    pub fn new(name: impl Into<String>, ty: ColumnType, optional: bool) -> Column {
        Column {
            name: name.into(),
            ty,
            optional,
            source: None,
        }
    }

    pub fn boolean(name: impl Into<String>, optional: bool) -> Column {
        Column::new(name, ColumnType::Boolean, optional)
    }

    /// A signed 32-bit integer column.
    pub fn integer(name: impl Into<String>, optional: bool) -> Column {
        let ty = ColumnType::Integer {
            size: 32,
            signed: true,
        };
        Column::new(name, ty, optional)
    }

    /// A double precision float column.
    pub fn float(name: impl Into<String>, optional: bool) -> Column {
        Column::new(name, ColumnType::Float { double: true }, optional)
    }

    pub fn string(name: impl Into<String>, optional: bool, max_bytes: u32) -> Column {
        Column::new(name, ColumnType::String { max_bytes }, optional)
    }

    /// A date time column keeping millisecond precision.
    pub fn datetime(name: impl Into<String>, optional: bool) -> Column {
        Column::new(name, ColumnType::DateTime { keep_ms: true }, optional)
    }

    pub fn location(name: impl Into<String>, optional: bool, opts: LocationOpts) -> Column {
        Column::new(name, ColumnType::Location(opts), optional)
    }

    pub fn foreign_key(name: impl Into<String>, schema: Arc<Schema>, optional: bool) -> Column {
        Column::new(name, ColumnType::ForeignKey(schema), optional)
    }

    /// A virtual column deriving its value from `source` through `mapper`.
    ///
    /// Virtual columns are always optional.
    pub fn virtual_of(name: impl Into<String>, source: &Column, mapper: ValueMapper) -> Column {
        Column {
            name: name.into(),
            ty: mapper.target_type(),
            optional: true,
            source: Some(VirtualSource {
                column: source.name.clone(),
                mapper,
            }),
        }
    }

    pub fn is_virtual(&self) -> bool {
        self.source.is_some()
    }

    /// Checks whether both columns have the same (case-insensitive) name, type
    /// kind, size shape and virtual-ness.
    pub fn is_equivalent(&self, other: &Column) -> bool {
        names::same(&self.name, &other.name)
            && self.ty.kind() == other.ty.kind()
            && self.minimum_size() == other.minimum_size()
            && self.maximum_size() == other.maximum_size()
            && self.is_virtual() == other.is_virtual()
    }

    /// Returns the minimum number of bits a value of this column takes.
    pub fn minimum_size(&self) -> usize {
        self.ty.minimum_size() + usize::from(self.optional)
    }

    /// Returns the maximum number of bits a value of this column takes.
    pub fn maximum_size(&self) -> usize {
        self.ty.maximum_size() + usize::from(self.optional)
    }

    fn invalid(&self, reason: impl Into<Cow<'static, str>>) -> Error {
        Error::Validation {
            column: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn parse_error(&self, reason: impl Into<Cow<'static, str>>) -> Error {
        Error::Parse {
            column: self.name.clone(),
            reason: reason.into(),
        }
    }

    fn mismatch(&self, value: &Value) -> Error {
        self.invalid(format!(
            "expected {}, found {}",
            self.ty.kind().name(),
            value.kind_name()
        ))
    }

    /// Checks the value against the column domain.
    pub fn validate(&self, value: &Value) -> DbResult<()> {
        match (&self.ty, value) {
            (ColumnType::Boolean, Value::Boolean(_)) => Ok(()),
            (ColumnType::Integer { size, signed }, Value::Integer(v)) => {
                let (min, max) = integer_bounds(*size, *signed);
                if (min..=max).contains(&i128::from(*v)) {
                    Ok(())
                } else {
                    Err(self.invalid(format!("{v} doesn't fit in [{min}, {max}]")))
                }
            }
            (ColumnType::Float { double }, Value::Float(v)) => {
                if !double && v.is_finite() && v.abs() > f64::from(f32::MAX) {
                    Err(self.invalid(format!("{v} doesn't fit in a single precision float")))
                } else {
                    Ok(())
                }
            }
            (ColumnType::String { max_bytes }, Value::String(s)) => {
                if s.len() > *max_bytes as usize {
                    Err(self.invalid(format!(
                        "string of {} bytes exceeds the maximum of {max_bytes}",
                        s.len()
                    )))
                } else {
                    Ok(())
                }
            }
            (ColumnType::DateTime { keep_ms }, Value::DateTime(ms)) => {
                let (min, max) = integer_bounds(datetime_bits(*keep_ms) as u8, true);
                let stored = if *keep_ms { *ms } else { ms.div_euclid(1000) };
                // Values must also have a text form.
                let representable = DateTime::<Utc>::MIN_UTC.timestamp_millis()
                    ..=DateTime::<Utc>::MAX_UTC.timestamp_millis();
                if (min..=max).contains(&i128::from(stored)) && representable.contains(ms) {
                    Ok(())
                } else {
                    Err(self.invalid(format!("date time {ms} out of range")))
                }
            }
            (ColumnType::Location(opts), Value::Location(loc)) => {
                opts.validate(loc).map_err(|reason| self.invalid(reason))
            }
            (ColumnType::ForeignKey(schema), Value::Composite(parts)) => {
                let key = key_columns(schema)?;
                if parts.len() != key.len(false) {
                    return Err(self.invalid(format!(
                        "expected {} key parts, found {}",
                        key.len(false),
                        parts.len()
                    )));
                }
                for (column, part) in key.columns(false).zip(parts) {
                    match part {
                        Some(part) => column.validate(part)?,
                        None if !column.optional => {
                            return Err(Error::IncompleteKey(schema.name().to_owned()))
                        }
                        None => (),
                    }
                }
                Ok(())
            }
            (_, value) => Err(self.mismatch(value)),
        }
    }

    /// Applies the canonical form of values: empty strings become absent and
    /// date times of columns without millisecond precision are truncated to
    /// the second.
    pub fn normalise(&self, value: Option<Value>) -> Option<Value> {
        match (value, &self.ty) {
            (Some(Value::String(s)), _) if s.is_empty() => None,
            (Some(Value::DateTime(ms)), ColumnType::DateTime { keep_ms: false }) => {
                Some(Value::DateTime(ms.div_euclid(1000) * 1000))
            }
            (value, _) => value,
        }
    }

    /// Resolves the slot of this column in the given value set.
    fn slot<S: AsColumnSet>(&self, vs: &ValueSet<S>) -> DbResult<usize> {
        let set = vs.column_set();
        let violation = || {
            Error::SchemaViolation(
                format!("column `{}` is not part of `{}`", self.name, set.name()).into(),
            )
        };
        if self.is_virtual() {
            return Err(Error::SchemaViolation(
                format!("virtual column `{}` has no value slot", self.name).into(),
            ));
        }
        let slot = set.position(&self.name).ok_or_else(violation)?;
        let own = set.column_at(slot).ok_or_else(violation)?;
        if own != self && !own.is_equivalent(self) {
            return Err(violation());
        }
        Ok(slot)
    }

    /// Validates and stores the value. Storing `None` in a non-optional column
    /// fails.
    pub fn store_value<S: AsColumnSet>(
        &self,
        vs: &mut ValueSet<S>,
        value: impl Into<Option<Value>>,
    ) -> DbResult<()> {
        let slot = self.slot(vs)?;
        let value = self.normalise(value.into());
        match &value {
            Some(value) => self.validate(value)?,
            None if !self.optional => return Err(self.invalid("a value is required")),
            None => (),
        }
        vs.set_slot(slot, value);
        Ok(())
    }

    /// Clears the value, even for non-optional columns.
    pub(crate) fn clear_value<S: AsColumnSet>(&self, vs: &mut ValueSet<S>) -> DbResult<()> {
        let slot = self.slot(vs)?;
        vs.set_slot(slot, None);
        Ok(())
    }

    /// Returns the value of this column in the value set. Values of virtual
    /// columns are computed from their source column.
    pub fn retrieve_value<'v, S: AsColumnSet>(
        &self,
        vs: &'v ValueSet<S>,
    ) -> DbResult<Option<Cow<'v, Value>>> {
        let Some(source) = &self.source else {
            let slot = self.slot(vs)?;
            return Ok(vs.slot_value(slot).map(Cow::Borrowed));
        };

        let set = vs.column_set();
        match set.column(&self.name) {
            Some(own) if own.is_equivalent(self) => (),
            _ => {
                return Err(Error::SchemaViolation(
                    format!("column `{}` is not part of `{}`", self.name, set.name()).into(),
                ))
            }
        }
        let source_column = set
            .column(&source.column)
            .filter(|c| !c.is_virtual())
            .ok_or_else(|| {
                Error::SchemaViolation(
                    format!("missing source column `{}`", source.column).into(),
                )
            })?;
        let value = source_column.retrieve_value(vs)?;
        Ok(value
            .and_then(|value| source.mapper.map(&value))
            .map(Cow::Owned))
    }

    pub fn is_value_set<S: AsColumnSet>(&self, vs: &ValueSet<S>) -> DbResult<bool> {
        Ok(self.retrieve_value(vs)?.is_some())
    }

    pub fn retrieve_value_as_string<S: AsColumnSet>(
        &self,
        vs: &ValueSet<S>,
    ) -> DbResult<Option<String>> {
        self.retrieve_value(vs)?
            .map(|value| self.format_value(&value))
            .transpose()
    }

    /// Parses the text and stores the result. Empty text clears the value.
    pub fn parse_and_store_value<S: AsColumnSet>(
        &self,
        vs: &mut ValueSet<S>,
        text: &str,
    ) -> DbResult<()> {
        let value = self.parse_value(text)?;
        self.store_value(vs, value)
    }

    /// Returns the value as it would be after a binary write and read.
    pub fn retrieve_value_as_stored_binary<S: AsColumnSet>(
        &self,
        vs: &ValueSet<S>,
    ) -> DbResult<Option<Value>> {
        let value = self.retrieve_value(vs)?;
        self.as_stored_binary(value.as_deref())
    }

    pub(crate) fn as_stored_binary(&self, value: Option<&Value>) -> DbResult<Option<Value>> {
        let Some(value) = value else {
            return Ok(None);
        };
        let mut buf = BitWriter::new();
        // Written as optional so that the round trip doesn't depend on
        // whether the value is required.
        let column = Column {
            optional: true,
            ..self.clone()
        };
        column.write_value(Some(value), &mut buf)?;
        let bytes = buf.into_bytes();
        column.read_value(&mut BitReader::new(&bytes))
    }

    /// Writes the binary form of the value: a presence bit for optional
    /// columns, followed by the payload when the value is present.
    pub fn write_value(&self, value: Option<&Value>, buf: &mut BitWriter) -> DbResult<()> {
        if self.optional {
            buf.write(value.is_some());
        }
        let Some(value) = value else {
            if self.optional {
                return Ok(());
            }
            return Err(self.invalid("a value is required"));
        };
        self.validate(value)?;

        match (&self.ty, value) {
            (ColumnType::Boolean, Value::Boolean(v)) => buf.write(*v),
            (ColumnType::Integer { size, signed: true }, Value::Integer(v)) => {
                buf.write_signed(*v, u32::from(*size))
            }
            (ColumnType::Integer { size, signed: false }, Value::Integer(v)) => {
                buf.write_bits(*v as u64, u32::from(*size))
            }
            (ColumnType::Float { double: true }, Value::Float(v)) => buf.write(*v),
            (ColumnType::Float { double: false }, Value::Float(v)) => buf.write(*v as f32),
            (ColumnType::String { max_bytes }, Value::String(s)) => {
                buf.write_bits(s.len() as u64, string_length_bits(*max_bytes));
                buf.write_slice(s.as_bytes());
            }
            (ColumnType::DateTime { keep_ms: true }, Value::DateTime(ms)) => buf.write(*ms),
            (ColumnType::DateTime { keep_ms: false }, Value::DateTime(ms)) => {
                buf.write_signed(ms.div_euclid(1000), datetime_bits(false))
            }
            (ColumnType::Location(opts), Value::Location(loc)) => opts.write(loc, buf),
            (ColumnType::ForeignKey(schema), Value::Composite(parts)) => {
                for (column, part) in key_columns(schema)?.columns(false).zip(parts) {
                    column.write_value(part.as_ref(), buf)?;
                }
            }
            // Unreachable after validation.
            (_, value) => return Err(self.mismatch(value)),
        }
        Ok(())
    }

    /// Reads a value written by [`Column::write_value`].
    pub fn read_value(&self, buf: &mut BitReader<'_>) -> DbResult<Option<Value>> {
        if self.optional && !buf.read::<bool>()? {
            return Ok(None);
        }

        let value = match &self.ty {
            ColumnType::Boolean => Value::Boolean(buf.read()?),
            ColumnType::Integer { size, signed: true } => {
                Value::Integer(buf.read_signed(u32::from(*size))?)
            }
            ColumnType::Integer {
                size,
                signed: false,
            } => {
                let raw = buf.read_bits(u32::from(*size))?;
                let v = i64::try_from(raw)
                    .map_err(|_| Error::Corrupted(format!("integer {raw} out of range").into()))?;
                Value::Integer(v)
            }
            ColumnType::Float { double: true } => Value::Float(buf.read()?),
            ColumnType::Float { double: false } => Value::Float(f64::from(buf.read::<f32>()?)),
            ColumnType::String { max_bytes } => {
                let len = buf.read_bits(string_length_bits(*max_bytes))? as usize;
                if len > *max_bytes as usize {
                    return Err(Error::Corrupted(
                        format!("string length {len} exceeds `{}` maximum", self.name).into(),
                    ));
                }
                let mut bytes = vec![0; len];
                buf.read_slice(&mut bytes)?;
                Value::String(String::from_utf8(bytes).map_err(|_| Error::CorruptedUtf8)?)
            }
            ColumnType::DateTime { keep_ms: true } => Value::DateTime(buf.read()?),
            ColumnType::DateTime { keep_ms: false } => {
                Value::DateTime(buf.read_signed(datetime_bits(false))? * 1000)
            }
            ColumnType::Location(opts) => Value::Location(opts.read(buf)?),
            ColumnType::ForeignKey(schema) => {
                let parts = key_columns(schema)?
                    .columns(false)
                    .map(|column| column.read_value(buf))
                    .collect::<DbResult<Vec<_>>>()?;
                Value::Composite(parts)
            }
        };
        Ok(Some(value))
    }

    /// Renders the text form of the value.
    pub fn format_value(&self, value: &Value) -> DbResult<String> {
        let text = match (&self.ty, value) {
            (ColumnType::Boolean, Value::Boolean(v)) => v.to_string(),
            (ColumnType::Integer { .. }, Value::Integer(v)) => v.to_string(),
            (ColumnType::Float { .. }, Value::Float(v)) => v.to_string(),
            (ColumnType::String { .. }, Value::String(s)) => s.clone(),
            (ColumnType::DateTime { keep_ms }, Value::DateTime(ms)) => {
                let dt = Utc
                    .timestamp_millis_opt(*ms)
                    .single()
                    .ok_or_else(|| self.invalid(format!("date time {ms} out of range")))?;
                let format = if *keep_ms {
                    SecondsFormat::Millis
                } else {
                    SecondsFormat::Secs
                };
                dt.to_rfc3339_opts(format, true)
            }
            (ColumnType::Location(_), Value::Location(loc)) => location::format(loc),
            (ColumnType::ForeignKey(schema), Value::Composite(parts)) => {
                let key = key_columns(schema)?;
                let mut vs = ValueSet::new(Arc::clone(key))?;
                for (column, part) in key.columns(false).zip(parts) {
                    match part {
                        Some(part) => column.store_value(&mut vs, part.clone())?,
                        None => column.clear_value(&mut vs)?,
                    }
                }
                vs.serialise()?
            }
            (_, value) => return Err(self.mismatch(value)),
        };
        Ok(text)
    }

    /// Parses the text form of a value. Empty text means "no value".
    pub fn parse_value(&self, text: &str) -> DbResult<Option<Value>> {
        if text.is_empty() {
            return Ok(None);
        }
        let value = match &self.ty {
            ColumnType::Boolean => match text.trim().to_ascii_lowercase().as_str() {
                "true" => Value::Boolean(true),
                "false" => Value::Boolean(false),
                _ => return Err(self.parse_error(format!("`{text}` is not a boolean"))),
            },
            ColumnType::Integer { .. } => text
                .trim()
                .parse()
                .map(Value::Integer)
                .map_err(|e| self.parse_error(format!("`{text}`: {e}")))?,
            ColumnType::Float { .. } => text
                .trim()
                .parse()
                .map(Value::Float)
                .map_err(|e| self.parse_error(format!("`{text}`: {e}")))?,
            ColumnType::String { .. } => Value::String(text.to_owned()),
            ColumnType::DateTime { .. } => DateTime::parse_from_rfc3339(text.trim())
                .map(|dt| Value::DateTime(dt.timestamp_millis()))
                .map_err(|e| self.parse_error(format!("`{text}`: {e}")))?,
            ColumnType::Location(_) => {
                Value::Location(location::parse(text).map_err(|reason| self.parse_error(reason))?)
            }
            ColumnType::ForeignKey(schema) => {
                let key = key_columns(schema)?;
                let vs = ValueSet::parsed(Arc::clone(key), text)?;
                Value::Composite(vs.into_values())
            }
        };
        let value = self.normalise(Some(value));
        if let Some(value) = &value {
            self.validate(value)?;
        }
        Ok(value)
    }
}

/// Returns the column set of the primary key of a referenced schema.
fn key_columns(schema: &Schema) -> DbResult<&Arc<ColumnSet>> {
    schema.primary_key().map(|pk| pk.columns()).ok_or_else(|| {
        Error::SchemaViolation(format!("schema `{}` has no primary key", schema.name()).into())
    })
}

/// Returns the inclusive bounds of a `size`-bit integer.
fn integer_bounds(size: u8, signed: bool) -> (i128, i128) {
    let size = u32::from(size);
    if signed {
        (-(1_i128 << (size - 1)), (1_i128 << (size - 1)) - 1)
    } else {
        // Values are `i64`, so 64-bit unsigned columns top at `i64::MAX`.
        (0, ((1_i128 << size) - 1).min(i128::from(i64::MAX)))
    }
}

impl SerdeCtx for Column {
    type DeCtx<'de> = &'de KnownSchemas;

    fn serialize(&self, buf: &mut BitWriter) -> DbResult<()> {
        VarString::from(self.name.as_str()).serialize(buf)?;
        buf.write(self.optional);
        self.ty.serialize(buf)?;
        buf.write(self.source.is_some());
        if let Some(source) = &self.source {
            VarString::from(source.column.as_str()).serialize(buf)?;
            buf.write(source.mapper as u8);
        }
        Ok(())
    }

    fn deserialize(buf: &mut BitReader<'_>, known: Self::DeCtx<'_>) -> DbResult<Self> {
        let name: String = VarString::deserialize(buf)?.into();
        let optional = buf.read()?;
        let ty = ColumnType::deserialize(buf, known)?;
        let source = if buf.read::<bool>()? {
            Some(VirtualSource {
                column: VarString::deserialize(buf)?.into(),
                mapper: ValueMapper::try_from_u8(buf.read()?)?,
            })
        } else {
            None
        };
        Ok(Column {
            name,
            ty,
            optional,
            source,
        })
    }
}
