use std::{
    io::{self, Write},
    path::Path,
    str::FromStr,
    sync::Arc,
};

use fieldstore::{
    catalog::{
        column::Column,
        model::Model,
        record::Record,
        registry::SchemaRegistry,
        schema::{Schema, SchemaFlags},
        ty::ColumnType,
    },
    config::FileStoreOpts,
    error::DbResult,
    exec::value::Value,
    export::{exporter_query, CsvExporter},
    query::{Constraint, Order, RecordsQuery, SingleRecordQuery, Source},
    store::{FileRecordStore, RecordStore},
};
use tracing::info;

const FOLDER: &str = "ignore";

#[tokio::main]
async fn main() -> DbResult<()> {
    setup_tracing();

    let schema = define_demo_schema()?;
    let (mut store, is_new) = FileRecordStore::open(FileStoreOpts::new(FOLDER, "sightings")).await?;
    if is_new {
        info!("first access; created empty store");
    }

    loop {
        println!("Pick a command: `insert`, `list`, `delete`, `export`, `backup` or `quit`.");
        let Some(cmd) = input::<String>("cmd> ")? else {
            break;
        };
        match &*cmd {
            "insert" => {
                let Some(species) = input::<String>("species (text)> ")? else { break };
                let Some(count) = input::<i64>("count (int)> ")? else { break };
                let mut record = schema.create_record()?;
                record.set("species", Value::from(species))?;
                record.set("count", Value::Integer(count))?;
                match store.insert(&mut record).await {
                    Ok(outcome) => println!("{outcome:?} (id {})", id_of(&record)),
                    Err(error) => println!("error: {error}"),
                }
            }
            "list" => {
                let query = RecordsQuery::builder(Source::schema(Arc::clone(&schema)))
                    .order_by(Order::asc("id"))
                    .build()?;
                println!("{}", "-".repeat(50));
                for record in store.retrieve_records(&query).await? {
                    let species = record
                        .get("species")?
                        .map(|v| v.to_string())
                        .unwrap_or_default();
                    let count = record.get("count")?.map(|v| v.to_string()).unwrap_or_default();
                    println!("{:<4} | {species:<20} | {count:<6}", id_of(&record));
                }
                println!("{}", "-".repeat(50));
            }
            "delete" => {
                let Some(id) = input::<i64>("id (int)> ")? else { break };
                let query = RecordsQuery::builder(Source::schema(Arc::clone(&schema)))
                    .constraint(Constraint::equal("id", Value::Integer(id)))
                    .build()?;
                match store.retrieve_record(&SingleRecordQuery::unique(query)).await? {
                    Some(record) => {
                        store.delete(&record).await?;
                        println!("deleted");
                    }
                    None => println!("no such record"),
                }
            }
            "export" => {
                let query = exporter_query(Source::Any, None, None, Vec::new(), true)?;
                let exporter = CsvExporter::new(Path::new(FOLDER).join("exports"));
                for path in exporter.export_from(&mut store, &query, true).await? {
                    println!("wrote {}", path.display());
                }
            }
            "backup" => {
                let path = store.backup(&Path::new(FOLDER).join("backups")).await?;
                println!("wrote {}", path.display());
            }
            "quit" => break,
            _ => {
                println!("invalid option; try again.");
            }
        }
    }

    store.close().await?;
    println!("bye");
    Ok(())
}

fn id_of(record: &Record) -> String {
    record
        .get("id")
        .ok()
        .flatten()
        .map(|v| v.to_string())
        .unwrap_or_default()
}

/// Registers the schema of the demo store.
fn define_demo_schema() -> DbResult<Arc<Schema>> {
    let mut model = Model::new(1, "demo", 1);
    let flags = SchemaFlags {
        track_changes: true,
        ..SchemaFlags::default()
    };
    let mut schema = model.new_schema("Sightings", flags);
    schema.add_column(Column::new("id", ColumnType::ID, false))?;
    schema.add_column(Column::string("species", false, 64))?;
    schema.add_column(Column::integer("count", true))?;
    schema.set_auto_increment_key("pk", "id")?;
    schema.seal()?;
    let schema = model.add_schema(schema)?;

    let registry = SchemaRegistry::global();
    registry.register_model(Arc::new(model))?;
    registry.register_schema(schema)
}

/// Sets up tracing subscriber.
fn setup_tracing() {
    use tracing_subscriber::{
        fmt::{format::FmtSpan, layer},
        layer::SubscriberExt,
        util::SubscriberInitExt,
        EnvFilter,
    };

    let filter_layer = EnvFilter::try_from_default_env().unwrap_or("warn".into());
    let fmt_layer = layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();
}

/// Gets a value from the stdin. Returns `None` at the end of the input.
fn input<T: FromStr>(prompt: &str) -> io::Result<Option<T>> {
    let mut buf = String::new();
    loop {
        print!("{prompt}");
        io::stdout().flush()?;
        buf.clear();
        if io::stdin().read_line(&mut buf)? == 0 {
            println!();
            return Ok(None);
        }
        match T::from_str(buf.trim()) {
            Ok(val) => return Ok(Some(val)),
            Err(_) => println!("try again."),
        }
    }
}
