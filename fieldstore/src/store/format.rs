//! The data file format.
//!
//! A data file is a single bit stream:
//!
//! 1. the magic bytes and the format version;
//! 2. the descriptors of the schemas of the stored records (referenced
//!    schemas first);
//! 3. the auto-increment counters;
//! 4. the record frames: schema id and length-prefixed binary record.
//!
//! The stream is padded to a whole byte and followed by the big-endian CRC32
//! of every preceding byte.

use std::{collections::HashSet, sync::Arc};

use bitbuff::{BitReader, BitWriter};
use tracing::{debug, error};

use crate::{
    catalog::{
        record::Record,
        registry::SchemaRegistry,
        schema::{Schema, SchemaId},
        ty::{ColumnType, KnownSchemas},
    },
    config::{FILE_FORMAT_VERSION, FILE_MAGIC},
    error::{DbResult, Error},
    store::{counter::CounterStore, table::RecordTable},
    util::io::{read_verify_eq, Serde, SerdeCtx, VarBytes},
};

const CHECKSUM_SIZE: usize = 4;

/// The decoded contents of a data file.
#[derive(Debug)]
pub(crate) struct DataFile {
    pub records: Vec<Record>,
    pub counters: CounterStore,
}

/// Encodes the table and counters as a data file.
pub(crate) fn encode(table: &RecordTable, counters: &CounterStore) -> DbResult<Vec<u8>> {
    let mut buf = BitWriter::new();
    buf.write_slice(FILE_MAGIC);
    buf.write(FILE_FORMAT_VERSION);

    let schemas = descriptor_order(table.iter().map(|(_, record)| record.schema()));
    buf.write(schemas.len() as u16);
    for schema in &schemas {
        schema.serialize(&mut buf)?;
    }

    counters.serialize(&mut buf)?;

    buf.write(table.len() as u32);
    for (_, record) in table.iter() {
        record.schema().id().serialize(&mut buf)?;
        VarBytes::from(record.to_bytes()?).serialize(&mut buf)?;
    }

    let mut bytes = buf.into_bytes();
    let checksum = crc32fast::hash(&bytes);
    bytes.extend_from_slice(&checksum.to_be_bytes());
    debug!(size = bytes.len(), records = table.len(), "encoded data file");
    Ok(bytes)
}

/// Decodes a data file, binding its records to the schemas of the registry.
///
/// Schemas missing from the registry are rebuilt from their descriptors and
/// registered. Registered schemas must be equivalent to the stored
/// descriptors.
pub(crate) fn decode(bytes: &[u8], registry: &SchemaRegistry) -> DbResult<DataFile> {
    if bytes.len() < FILE_MAGIC.len() + CHECKSUM_SIZE {
        return Err(Error::Corrupted("data file too short".into()));
    }
    let (body, trailer) = bytes.split_at(bytes.len() - CHECKSUM_SIZE);
    let mut expected = [0; CHECKSUM_SIZE];
    expected.copy_from_slice(trailer);
    let expected = u32::from_be_bytes(expected);
    let actual = crc32fast::hash(body);
    if actual != expected {
        error!(expected, actual, "data file checksum mismatch");
        return Err(Error::Corrupted("data file checksum mismatch".into()));
    }

    let mut buf = BitReader::new(body);
    if !read_verify_eq(&mut buf, FILE_MAGIC)? {
        return Err(Error::Corrupted("not a data file".into()));
    }
    let version: u16 = buf.read()?;
    if version != FILE_FORMAT_VERSION {
        return Err(Error::Corrupted(
            format!("unsupported data file version {version}").into(),
        ));
    }

    let mut known = KnownSchemas::new();
    let len: u16 = buf.read()?;
    for _ in 0..len {
        let schema = Schema::deserialize(&mut buf, &known)?;
        let schema = registry.register_schema(Arc::new(schema))?;
        known.insert(schema.id(), schema);
    }

    let counters = CounterStore::deserialize(&mut buf)?;

    let len: u32 = buf.read()?;
    let mut records = Vec::with_capacity(len as usize);
    for _ in 0..len {
        let id = SchemaId::deserialize(&mut buf)?;
        let schema = known.get(&id).ok_or(Error::UnknownSchema(id))?;
        let bytes: Vec<u8> = VarBytes::deserialize(&mut buf)?.into();
        records.push(Record::from_bytes(Arc::clone(schema), &bytes)?);
    }
    debug!(records = records.len(), schemas = known.len(), "decoded data file");

    Ok(DataFile { records, counters })
}

/// Lists the given schemas and those their foreign keys reference, each
/// after the schemas it references.
fn descriptor_order<'a>(schemas: impl Iterator<Item = &'a Arc<Schema>>) -> Vec<Arc<Schema>> {
    fn visit(schema: &Arc<Schema>, seen: &mut HashSet<SchemaId>, out: &mut Vec<Arc<Schema>>) {
        if !seen.insert(schema.id()) {
            return;
        }
        for column in schema.columns(true) {
            if let ColumnType::ForeignKey(target) = &column.ty {
                visit(target, seen, out);
            }
        }
        out.push(Arc::clone(schema));
    }

    let mut seen = HashSet::new();
    let mut out = Vec::new();
    for schema in schemas {
        visit(schema, &mut seen, &mut out);
    }
    out
}
