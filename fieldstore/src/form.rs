//! Data collection forms.
//!
//! A form collects one record per submission. Its schema holds the user
//! defined columns behind implicit ones identifying the submission: the
//! start time and the id of the collecting device, which together form the
//! primary key, and optionally the end time.

use std::sync::{Arc, OnceLock};

use chrono::Utc;
use tracing::debug;

use crate::{
    catalog::{
        column::Column,
        record::Record,
        schema::{Schema, SchemaFlags, SchemaId},
        ty::ColumnType,
    },
    error::{DbResult, Error},
    exec::value::Value,
};

pub const START_TIME: &str = "StartTime";
pub const END_TIME: &str = "EndTime";
pub const DEVICE_ID: &str = "DeviceID";

/// A form definition.
#[derive(Debug)]
pub struct Form {
    id: SchemaId,
    name: String,
    store_end_time: bool,
    columns: Vec<Column>,
    /// Built on first use; `None` if the form has no user columns.
    schema: OnceLock<Option<Arc<Schema>>>,
}

impl Form {
    /// Creates a form whose schema will get the given id.
    pub fn new(id: SchemaId, name: impl Into<String>) -> Form {
        Form {
            id,
            name: name.into(),
            store_end_time: false,
            columns: Vec::new(),
            schema: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether submissions record the time they are finished.
    pub fn set_store_end_time(&mut self, store: bool) -> DbResult<()> {
        self.check_unbuilt()?;
        self.store_end_time = store;
        Ok(())
    }

    /// Adds the column of a user field. Virtual columns are allowed.
    pub fn add_column(&mut self, column: Column) -> DbResult<()> {
        self.check_unbuilt()?;
        self.columns.push(column);
        Ok(())
    }

    fn check_unbuilt(&self) -> DbResult<()> {
        if self.schema.get().is_some() {
            return Err(Error::SchemaViolation(
                format!("the schema of form `{}` is already built", self.name).into(),
            ));
        }
        Ok(())
    }

    /// Whether the form has any user columns, so that submissions produce
    /// records.
    pub fn produces_records(&self) -> bool {
        !self.columns.is_empty()
    }

    /// The schema of the form records, built on first use. Forms without
    /// user columns have no schema.
    pub fn schema(&self) -> DbResult<Option<&Arc<Schema>>> {
        if let Some(schema) = self.schema.get() {
            return Ok(schema.as_ref());
        }
        let built = self.build_schema()?;
        Ok(self.schema.get_or_init(|| built).as_ref())
    }

    fn build_schema(&self) -> DbResult<Option<Arc<Schema>>> {
        if !self.produces_records() {
            return Ok(None);
        }
        let flags = SchemaFlags {
            track_changes: true,
            ..SchemaFlags::default()
        };
        let mut schema = Schema::with_flags(self.id, &self.name, flags);

        let timestamp = ColumnType::DateTime { keep_ms: false };
        schema.add_column(Column::new(START_TIME, timestamp.clone(), false))?;
        if self.store_end_time {
            schema.add_column(Column::new(END_TIME, timestamp, false))?;
        }
        let device = ColumnType::Integer {
            size: 32,
            signed: false,
        };
        schema.add_column(Column::new(DEVICE_ID, device, false))?;
        schema.set_primary_key(&format!("{START_TIME}{DEVICE_ID}"), &[START_TIME, DEVICE_ID])?;

        // Virtual columns land right after their source, which must exist.
        let (virtuals, reals): (Vec<_>, Vec<_>) =
            self.columns.iter().cloned().partition(Column::is_virtual);
        for column in reals {
            schema.add_column(column)?;
        }
        for column in virtuals {
            schema.add_virtual_column(column)?;
        }
        schema.seal()?;
        debug!(form = %self.name, columns = schema.len(true), "built form schema");
        Ok(Some(Arc::new(schema)))
    }

    fn form_schema(&self) -> DbResult<&Arc<Schema>> {
        self.schema()?.ok_or_else(|| {
            Error::SchemaViolation(format!("form `{}` produces no records", self.name).into())
        })
    }

    /// Starts a submission: a new record stamped with the current time and
    /// the device id.
    pub fn new_record(&self, device_id: u32) -> DbResult<Record> {
        let schema = self.form_schema()?;
        let mut record = schema.create_record()?;
        record.set(START_TIME, Value::DateTime(Utc::now().timestamp_millis()))?;
        record.set(DEVICE_ID, Value::from(device_id))?;
        Ok(record)
    }

    /// Finishes a submission, stamping the end time if the form stores it.
    pub fn finish(&self, record: &mut Record) -> DbResult<()> {
        let schema = self.form_schema()?;
        if record.schema().id() != schema.id() {
            return Err(Error::SchemaViolation(
                format!("record is not a submission of form `{}`", self.name).into(),
            ));
        }
        if self.store_end_time {
            record.set(END_TIME, Value::DateTime(Utc::now().timestamp_millis()))?;
        }
        Ok(())
    }
}
