//! Record stores.
//!
//! A store keeps records of any number of schemas and answers
//! [`RecordsQuery`]s over them. Every mutating operation runs in a
//! transaction: an explicit one opened with
//! [`RecordStore::start_transaction`], or else an implicit one covering just
//! that operation.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    catalog::record::{Record, RecordReference},
    error::DbResult,
    query::{RecordsQuery, SingleRecordQuery, Source},
};

/// Implements [`RecordStore`] for a type with an `engine` field.
macro_rules! impl_record_store {
    ($store:ty) => {
        #[async_trait::async_trait]
        impl $crate::store::RecordStore for $store {
            async fn store(
                &mut self,
                record: &mut $crate::catalog::record::Record,
                action: $crate::store::StoreAction,
            ) -> $crate::error::DbResult<$crate::store::StoreOutcome> {
                self.engine.store(record, action).await
            }

            async fn retrieve_records(
                &self,
                query: &$crate::query::RecordsQuery,
            ) -> $crate::error::DbResult<Vec<$crate::catalog::record::Record>> {
                self.engine.retrieve_records(query)
            }

            async fn retrieve_record(
                &self,
                query: &$crate::query::SingleRecordQuery,
            ) -> $crate::error::DbResult<Option<$crate::catalog::record::Record>> {
                self.engine.retrieve_record(query)
            }

            async fn retrieve_record_references(
                &self,
                query: &$crate::query::RecordsQuery,
            ) -> $crate::error::DbResult<Vec<$crate::catalog::record::RecordReference>> {
                self.engine.retrieve_record_references(query)
            }

            async fn delete(
                &mut self,
                record: &$crate::catalog::record::Record,
            ) -> $crate::error::DbResult<bool> {
                self.engine.delete(record).await
            }

            async fn delete_records(
                &mut self,
                records: &[$crate::catalog::record::Record],
            ) -> $crate::error::DbResult<usize> {
                self.engine.delete_records(records).await
            }

            async fn start_transaction(&mut self) -> $crate::error::DbResult<()> {
                self.engine.start_transaction()
            }

            async fn commit_transaction(&mut self) -> $crate::error::DbResult<()> {
                self.engine.commit_transaction().await
            }

            async fn rollback_transaction(&mut self) -> $crate::error::DbResult<()> {
                self.engine.rollback_transaction()
            }

            fn is_in_transaction(&self) -> bool {
                self.engine.is_in_transaction()
            }

            async fn backup(
                &mut self,
                folder: &std::path::Path,
            ) -> $crate::error::DbResult<std::path::PathBuf> {
                self.engine.backup(folder).await
            }

            async fn close(&mut self) -> $crate::error::DbResult<()> {
                self.engine.close().await
            }
        }
    };
}

mod counter;
pub use counter::*;

mod disk_manager;
mod engine;
mod format;
mod table;

mod file;
pub use file::*;

mod memory;
pub use memory::*;

/// Which kinds of writes a [`RecordStore::store`] call may perform.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreAction {
    /// Only new records may be stored.
    InsertOnly,
    /// Only already stored records may be updated, and their
    /// `LastStoredAt` is left untouched.
    UpdateOnlyExceptLsa,
    InsertOrUpdate,
}

/// What a [`RecordStore::store`] call did.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Updated,
    /// The stored version already had the same values.
    NoActionNeeded,
}

/// A transactional record store.
///
/// Store errors are reported as [`Error::Db`](crate::error::Error::Db),
/// wrapping the underlying cause. Every operation on a closed store fails
/// with [`Error::Closed`](crate::error::Error::Closed).
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Inserts or updates the record, as allowed by `action`.
    ///
    /// On success the record holds what was stored: its assigned
    /// auto-increment id, its `LastStoredAt` time and its row in this store.
    async fn store(&mut self, record: &mut Record, action: StoreAction) -> DbResult<StoreOutcome>;

    async fn insert(&mut self, record: &mut Record) -> DbResult<StoreOutcome> {
        self.store(record, StoreAction::InsertOnly).await
    }

    /// Stores the record, inserting it if it wasn't stored yet.
    async fn update(&mut self, record: &mut Record) -> DbResult<StoreOutcome> {
        self.store(record, StoreAction::InsertOrUpdate).await
    }

    async fn retrieve_records(&self, query: &RecordsQuery) -> DbResult<Vec<Record>>;

    async fn retrieve_record(&self, query: &SingleRecordQuery) -> DbResult<Option<Record>>;

    async fn retrieve_all_records(&self) -> DbResult<Vec<Record>> {
        self.retrieve_records(&RecordsQuery::all(Source::Any)).await
    }

    async fn retrieve_record_references(&self, query: &RecordsQuery) -> DbResult<Vec<RecordReference>>;

    /// Deletes the stored version of the record. Returns `false` if there
    /// was none.
    async fn delete(&mut self, record: &Record) -> DbResult<bool>;

    /// Deletes the records, returning how many were stored.
    async fn delete_records(&mut self, records: &[Record]) -> DbResult<usize>;

    /// Opens a transaction. Starting a transaction while one is open only
    /// nests it: nothing is committed until the outermost commit.
    async fn start_transaction(&mut self) -> DbResult<()>;

    async fn commit_transaction(&mut self) -> DbResult<()>;

    /// Discards everything done since the outermost transaction started.
    async fn rollback_transaction(&mut self) -> DbResult<()>;

    fn is_in_transaction(&self) -> bool;

    /// Commits pending work and writes a copy of the store as a data file in
    /// `folder`, returning its path.
    async fn backup(&mut self, folder: &Path) -> DbResult<PathBuf>;

    /// Commits pending work and closes the store.
    async fn close(&mut self) -> DbResult<()>;

    /// Whether queries that pin down a primary key are answered without a
    /// full scan.
    fn has_full_index_support(&self) -> bool {
        true
    }
}
