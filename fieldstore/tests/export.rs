mod test_utils;

use std::sync::Arc;

use chrono::Utc;
use fieldstore::{
    error::DbResult,
    exec::value::Value,
    export::{exporter_query, mark_as_exported, CsvExporter},
    query::{Order, Source},
    store::RecordStore,
};
use test_utils::*;

#[tokio::test]
async fn test_exclude_exported() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let notes = Source::schema(Arc::clone(&store.schemas().notes));
    for text in ["a", "b", "c"] {
        let mut note = store.schemas().note(text)?;
        store.insert(&mut note).await?;
    }

    let pending = exporter_query(notes.clone(), Some(Order::asc("id")), None, Vec::new(), true)?;
    let mut records = store.retrieve_records(&pending).await?;
    assert_eq!(records.len(), 3);

    // Exported after the last store.
    let export_time = Utc::now() + chrono::Duration::seconds(1);
    mark_as_exported(&mut *store, &mut records, export_time).await?;
    assert!(store.retrieve_records(&pending).await?.is_empty());

    // Everything is still there without the exclusion.
    let all = exporter_query(notes, None, None, Vec::new(), false)?;
    assert_eq!(store.retrieve_records(&all).await?.len(), 3);

    // A later change makes the record pending again. The stored time is set
    // ahead of the export so it doesn't depend on the clock.
    let mut changed = records.remove(1);
    changed.set("text", Value::from("changed"))?;
    changed.set(
        fieldstore::config::LAST_STORED_AT,
        Value::DateTime(export_time.timestamp_millis() + 1000),
    )?;
    store.update(&mut changed).await?;
    let pending = store.retrieve_records(&pending).await?;
    assert_eq!(pending.len(), 1);
    assert_eq!(text(&pending[0], "text").as_deref(), Some("changed"));
    Ok(())
}

#[tokio::test]
async fn test_csv_export() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut note = store.schemas().note("hello, world")?;
    store.insert(&mut note).await?;
    let mut north = store.schemas().site("N", "North")?;
    store.insert(&mut north).await?;

    let folder = store.folder().join("exports");
    let exporter = CsvExporter::new(&folder);
    let query = exporter_query(Source::Any, None, None, Vec::new(), false)?;
    let mut paths = exporter.export_from(&mut *store, &query, true).await?;
    paths.sort();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|path| path.starts_with(&folder)));

    let notes_file = paths
        .iter()
        .find(|path| path.file_name().unwrap().to_string_lossy().starts_with("Notes_"))
        .unwrap();
    let contents = tokio::fs::read_to_string(notes_file).await?;
    let mut lines = contents.lines();
    assert_eq!(lines.next(), Some("id,text,code,LastStoredAt,LastExportedAt"));
    let row = lines.next().unwrap();
    assert!(row.starts_with("0,\"hello, world\",,"));
    assert_eq!(lines.next(), None);

    // Only change tracking schemas are marked.
    let records = store.retrieve_records(&query).await?;
    for record in &records {
        let tracked = record.schema().last_exported_at_column().is_some();
        assert_eq!(record.last_exported_at().is_some(), tracked);
    }
    let pending = exporter_query(Source::Any, None, None, Vec::new(), true)?;
    assert!(store.retrieve_records(&pending).await?.is_empty());
    Ok(())
}
