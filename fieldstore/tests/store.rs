mod test_utils;

use std::sync::Arc;

use fieldstore::{
    config::LAST_STORED_AT,
    error::{DbResult, Error},
    exec::value::Value,
    query::{Order, RecordsQuery, Source},
    store::{RecordStore, StoreAction, StoreOutcome},
};
use test_utils::*;

#[tokio::test]
async fn test_store_twice_is_idempotent() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut note = store.schemas().note("first")?;

    assert_eq!(store.insert(&mut note).await?, StoreOutcome::Inserted);
    let lsa = note.last_stored_at();
    assert!(lsa.is_some());

    assert_eq!(store.update(&mut note).await?, StoreOutcome::NoActionNeeded);
    assert_eq!(note.last_stored_at(), lsa);
    assert_eq!(store.retrieve_all_records().await?.len(), 1);

    // A fresh copy with the same key and values is recognised too.
    let mut copy = store.schemas().note("first")?;
    copy.set("id", Value::Integer(0))?;
    assert_eq!(store.update(&mut copy).await?, StoreOutcome::NoActionNeeded);
    assert_eq!(store.retrieve_all_records().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_auto_increment() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let schema = Arc::clone(&store.schemas().notes);

    for i in 0..5 {
        let mut note = store.schemas().note(&format!("note {i}"))?;
        store.insert(&mut note).await?;
        assert_eq!(int(&note, "id"), Some(i));
    }
    assert_eq!(store.counters().last(schema.id()), Some(4));

    // Explicit ids move the counter forward.
    let mut note = store.schemas().note("explicit")?;
    note.set("id", Value::Integer(10))?;
    store.insert(&mut note).await?;
    let mut note = store.schemas().note("after")?;
    store.insert(&mut note).await?;
    assert_eq!(int(&note, "id"), Some(11));

    let query = RecordsQuery::builder(Source::schema(schema))
        .order_by(Order::asc("id"))
        .build()?;
    let ids: Vec<_> = store
        .retrieve_records(&query)
        .await?
        .iter()
        .filter_map(|record| int(record, "id"))
        .collect();
    assert_eq!(ids, [0, 1, 2, 3, 4, 10, 11]);
    Ok(())
}

#[tokio::test]
async fn test_storage_conflict() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut note = store.schemas().note("original")?;
    store.insert(&mut note).await?;
    let stored_at = note.last_stored_at().unwrap();

    // A version older than the stored one is rejected.
    let mut stale = note.clone();
    stale.set(LAST_STORED_AT, Value::DateTime(stored_at - 1000))?;
    stale.set("text", Value::from("stale"))?;
    let error = store.update(&mut stale).await.unwrap_err();
    assert!(matches!(error.root(), Error::StorageConflict(_)));

    let records = store.retrieve_all_records().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0], "text").as_deref(), Some("original"));
    assert_eq!(records[0].last_stored_at(), Some(stored_at));

    // A newer one keeps its own time.
    let mut newer = note.clone();
    newer.set(LAST_STORED_AT, Value::DateTime(stored_at + 60_000))?;
    newer.set("text", Value::from("newer"))?;
    assert_eq!(store.update(&mut newer).await?, StoreOutcome::Updated);
    assert_eq!(newer.last_stored_at(), Some(stored_at + 60_000));

    // An unchanged time means a local edit, stamped with the current time.
    let mut edited = newer.clone();
    edited.set("text", Value::from("edited"))?;
    store.update(&mut edited).await?;
    assert!(edited.last_stored_at() != Some(stored_at + 60_000));

    // A new record can't have been stored before.
    let mut stray = store.schemas().note("stray")?;
    stray.set(LAST_STORED_AT, Value::DateTime(stored_at))?;
    let error = store.insert(&mut stray).await.unwrap_err();
    assert!(matches!(error.root(), Error::StorageConflict(_)));
    assert_eq!(store.retrieve_all_records().await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_update_except_lsa() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut note = store.schemas().note("a")?;
    store.insert(&mut note).await?;
    let stored_at = note.last_stored_at();

    note.set_last_exported_at(Some(12_345_000))?;
    let outcome = store.store(&mut note, StoreAction::UpdateOnlyExceptLsa).await?;
    assert_eq!(outcome, StoreOutcome::Updated);
    assert_eq!(note.last_stored_at(), stored_at);

    let records = store.retrieve_all_records().await?;
    assert_eq!(records[0].last_exported_at(), Some(12_345_000));
    assert_eq!(records[0].last_stored_at(), stored_at);
    Ok(())
}

#[tokio::test]
async fn test_action_not_allowed() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut site = store.schemas().site("S1", "North")?;

    let error = store
        .store(&mut site, StoreAction::UpdateOnlyExceptLsa)
        .await
        .unwrap_err();
    assert!(matches!(
        error.root(),
        Error::ActionNotAllowed { action: StoreAction::UpdateOnlyExceptLsa, .. }
    ));

    store.insert(&mut site).await?;
    let mut renamed = store.schemas().site("S1", "South")?;
    let error = store.insert(&mut renamed).await.unwrap_err();
    assert!(matches!(error.root(), Error::ActionNotAllowed { .. }));

    assert_eq!(store.update(&mut renamed).await?, StoreOutcome::Updated);
    let records = store.retrieve_all_records().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0], "name").as_deref(), Some("South"));
    Ok(())
}

#[tokio::test]
async fn test_unique_index() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut first = store.schemas().note("first")?;
    first.set("code", Value::from("X1"))?;
    store.insert(&mut first).await?;

    let mut second = store.schemas().note("second")?;
    second.set("code", Value::from("X1"))?;
    let error = store.insert(&mut second).await.unwrap_err();
    assert!(matches!(
        error.root(),
        Error::UniqueViolation { index, .. } if index == "by_code"
    ));
    assert_eq!(int(&second, "id"), None);
    assert_eq!(store.retrieve_all_records().await?.len(), 1);

    // The failed insert didn't use up an id.
    second.set("code", Value::from("X2"))?;
    store.insert(&mut second).await?;
    assert_eq!(int(&second, "id"), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_required_values() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut site = store.schemas().sites.create_record()?;
    site.set("name", Value::from("nameless"))?;

    let error = store.insert(&mut site).await.unwrap_err();
    assert!(matches!(error.root(), Error::Validation { column, .. } if column == "code"));
    assert!(store.retrieve_all_records().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_rollback() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let notes = store.schemas().notes.id();

    let mut kept = store.schemas().note("kept")?;
    store.insert(&mut kept).await?;

    store.start_transaction().await?;
    for text in ["a", "b"] {
        let mut note = store.schemas().note(text)?;
        store.insert(&mut note).await?;
    }
    kept.set("text", Value::from("changed"))?;
    store.update(&mut kept).await?;
    assert_eq!(store.retrieve_all_records().await?.len(), 3);
    assert_eq!(store.counters().last(notes), Some(2));

    store.rollback_transaction().await?;
    assert!(!store.is_in_transaction());
    let records = store.retrieve_all_records().await?;
    assert_eq!(records.len(), 1);
    assert_eq!(text(&records[0], "text").as_deref(), Some("kept"));
    assert_eq!(store.counters().last(notes), Some(0));

    let mut note = store.schemas().note("again")?;
    store.insert(&mut note).await?;
    assert_eq!(int(&note, "id"), Some(1));
    Ok(())
}

#[tokio::test]
async fn test_nested_transactions() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;

    store.start_transaction().await?;
    store.start_transaction().await?;
    let mut note = store.schemas().note("inner")?;
    store.insert(&mut note).await?;
    store.commit_transaction().await?;
    assert!(store.is_in_transaction());

    // Not persisted until the outermost commit.
    let other = store.open_again().await?;
    assert!(other.retrieve_all_records().await?.is_empty());

    store.commit_transaction().await?;
    assert!(!store.is_in_transaction());
    let other = store.open_again().await?;
    assert_eq!(other.retrieve_all_records().await?.len(), 1);

    // Committing without a transaction changes nothing.
    store.commit_transaction().await?;
    Ok(())
}

#[tokio::test]
async fn test_delete() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut notes = Vec::new();
    for i in 0..4 {
        let mut note = store.schemas().note(&format!("note {i}"))?;
        store.insert(&mut note).await?;
        notes.push(note);
    }

    assert!(store.delete(&notes[0]).await?);
    assert!(!store.delete(&notes[0]).await?);

    // Deleting by key, without a handle.
    let mut by_key = store.schemas().notes.create_record()?;
    by_key.set("id", Value::Integer(1))?;
    assert!(store.delete(&by_key).await?);

    // Records without a key can't be found.
    let keyless = store.schemas().note("keyless")?;
    assert!(!store.delete(&keyless).await?);

    assert_eq!(store.delete_records(&notes).await?, 2);
    assert!(store.retrieve_all_records().await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_closed() -> DbResult<()> {
    let mut store = TestStore::new_temp().await?;
    let mut note = store.schemas().note("a")?;
    store.insert(&mut note).await?;

    store.close().await?;
    store.close().await?;
    assert!(matches!(store.retrieve_all_records().await, Err(Error::Closed)));
    assert!(matches!(store.insert(&mut note).await, Err(Error::Closed)));
    assert!(matches!(store.start_transaction().await, Err(Error::Closed)));

    store.reopen().await?;
    assert_eq!(store.retrieve_all_records().await?.len(), 1);
    Ok(())
}
