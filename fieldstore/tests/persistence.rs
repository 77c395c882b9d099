mod test_utils;

use std::sync::Arc;

use fieldstore::{
    config::{FileStoreOpts, BACKUP_SUFFIX, DATA_FILE_SUFFIX},
    error::{DbResult, Error},
    query::{Order, RecordsQuery, Source},
    store::{FileRecordStore, MemoryRecordStore, RecordStore},
};
use test_utils::*;

#[tokio::test]
async fn test_reopen() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let schemas = store.schemas();
    let (visits_schema, sites_schema) = (Arc::clone(&schemas.visits), Arc::clone(&schemas.sites));

    let mut north = schemas.site("N", "North")?;
    let mut south = schemas.site("S", "South")?;
    let mut first = schemas.visit(&north, 3)?;
    let mut second = schemas.visit(&south, 5)?;
    store.insert(&mut north).await?;
    store.insert(&mut south).await?;
    store.insert(&mut first).await?;
    store.insert(&mut second).await?;
    let before = store.retrieve_all_records().await?;

    store.reopen().await?;
    let after = store.retrieve_all_records().await?;
    assert_eq!(before.len(), after.len());
    for record in &before {
        assert!(
            after
                .iter()
                .any(|other| other.has_equal_values(record, &[], true).unwrap_or(false)),
            "record lost on reopen: {}",
            record.serialise()?
        );
    }

    // Stored records are bound to the registered schemas.
    assert!(after
        .iter()
        .filter(|record| record.schema().id() == sites_schema.id())
        .all(|record| Arc::ptr_eq(record.schema(), &sites_schema)));

    // Counters survive too.
    let mut third = store.schemas().visit(&north, 1)?;
    store.insert(&mut third).await?;
    assert_eq!(int(&third, "id"), Some(2));

    let query = RecordsQuery::builder(Source::schema(visits_schema))
        .order_by(Order::desc("count"))
        .build()?;
    let counts: Vec<_> = store
        .retrieve_records(&query)
        .await?
        .iter()
        .filter_map(|record| int(record, "count"))
        .collect();
    assert_eq!(counts, [5, 3, 1]);
    Ok(())
}

#[tokio::test]
async fn test_update_after_reopen() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut note = store.schemas().note("before")?;
    store.insert(&mut note).await?;

    store.reopen().await?;
    // The handle of the record belongs to the closed store; the key is used.
    note.set("text", fieldstore::exec::value::Value::from("after"))?;
    store.update(&mut note).await?;

    let records = store.retrieve_all_records().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0], "text").as_deref(), Some("after"));
    Ok(())
}

#[tokio::test]
async fn test_backup() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    for text in ["a", "b", "c"] {
        let mut note = store.schemas().note(text)?;
        store.insert(&mut note).await?;
    }

    // Uncommitted work is committed before the backup is taken.
    store.start_transaction().await?;
    let mut site = store.schemas().site("W", "West")?;
    store.insert(&mut site).await?;

    let folder = store.folder().join("backups");
    let path = store.backup(&folder).await?;
    assert!(!store.is_in_transaction());
    assert!(path.starts_with(&folder));
    let file_name = path.file_name().unwrap().to_string_lossy().into_owned();
    assert!(file_name.starts_with(&format!("test{BACKUP_SUFFIX}")));
    assert!(file_name.ends_with(&format!(".{DATA_FILE_SUFFIX}")));

    let opts = FileStoreOpts::new(&folder, path.file_stem().unwrap().to_string_lossy());
    let (backup, is_new) = FileRecordStore::open_with(opts, store.registry()).await?;
    assert!(!is_new);
    assert_eq!(backup.retrieve_all_records().await?.len(), 4);
    assert_eq!(
        backup.counters().last(store.schemas().notes.id()),
        store.counters().last(store.schemas().notes.id())
    );
    Ok(())
}

#[tokio::test]
async fn test_memory_store_backup() -> DbResult<()> {
    let schemas = test_schemas()?;
    let dir = tempfile::tempdir()?;
    let mut store = MemoryRecordStore::new("scratch");
    let mut note = schemas.note("in memory")?;
    store.insert(&mut note).await?;

    let path = store.backup(dir.path()).await?;
    let opts = FileStoreOpts::new(dir.path(), path.file_stem().unwrap().to_string_lossy());
    let registry = fieldstore::catalog::registry::SchemaRegistry::new();
    registry.register_model(Arc::clone(&schemas.model))?;
    let (file_store, _) = FileRecordStore::open_with(opts, &registry).await?;
    let records = file_store.retrieve_all_records().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0], "text").as_deref(), Some("in memory"));
    Ok(())
}

#[tokio::test]
async fn test_corrupted_file() -> DbResult<()> {
    let store = TestStore::new_temp().await?;
    tokio::fs::write(store.opts().data_path(), b"definitely not a store").await?;

    let error = store.open_again().await.unwrap_err();
    assert!(matches!(error.root(), Error::Corrupted(_)));
    Ok(())
}
