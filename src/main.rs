use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use recache::cache::{CollectionKey, RecordId};
use recache::config::Config;
use recache::remote::Mutation;
use recache::RecordClient;

#[derive(Parser, Debug)]
#[command(name = "recache")]
#[command(about = "Mirror remote record collections into a local cache")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/recache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Also log to stderr
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Get every record of a collection, syncing when the cache is stale
  Sync {
    collection: String,
    /// Ignore the cache and resync
    #[arg(short, long)]
    force: bool,
  },
  /// Get one record by id
  Get {
    collection: String,
    id: RecordId,
    #[arg(short, long)]
    force: bool,
  },
  /// Create a record from a JSON object of field values
  Create { collection: String, values: String },
  /// Update a record with a JSON object of field values
  Update {
    collection: String,
    id: RecordId,
    values: String,
  },
  /// Delete a record
  Delete { collection: String, id: RecordId },
  /// Drop the cache of one collection
  Clear { collection: String },
  /// Drop every cached collection
  ClearAll,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();
  let _guard = init_logging(args.verbose)?;

  let config = Config::load(args.config.as_deref())?;
  let client = RecordClient::from_config(&config)?;

  let output = match args.command {
    Command::Sync { collection, force } => {
      let collection = config.collection(&collection)?;
      let result = client.get_all(&collection, force).await;
      if result.is_failed() {
        return Err(eyre!("Sync of '{}' failed, see the log for details", collection.key));
      }
      json!({
        "collection": collection.key,
        "outcome": result.outcome,
        "partial": result.partial,
        "truncated": result.truncated,
        "stored_at": result.stored_at,
        "count": result.records.len(),
        "records": result.records,
      })
    }
    Command::Get {
      collection,
      id,
      force,
    } => {
      let collection = config.collection(&collection)?;
      let record = client.get_one(&collection, id, force).await?;
      let record = record.ok_or_else(|| eyre!("Record {} not found in '{}'", id, collection.key))?;
      json!(record)
    }
    Command::Create { collection, values } => {
      let collection = config.collection(&collection)?;
      let values = parse_values(&values)?;
      write_output(client.write(&collection, Mutation::Create { values }).await?)
    }
    Command::Update {
      collection,
      id,
      values,
    } => {
      let collection = config.collection(&collection)?;
      let values = parse_values(&values)?;
      write_output(client.write(&collection, Mutation::Update { id, values }).await?)
    }
    Command::Delete { collection, id } => {
      let collection = config.collection(&collection)?;
      write_output(client.write(&collection, Mutation::Delete { id }).await?)
    }
    Command::Clear { collection } => {
      let key = config
        .collection(&collection)
        .map(|c| c.key)
        .unwrap_or_else(|_| CollectionKey::new(collection));
      client.clear_collection(&key).await?;
      json!({ "cleared": key })
    }
    Command::ClearAll => {
      client.clear_all().await?;
      json!({ "cleared": "all" })
    }
  };

  let text =
    serde_json::to_string_pretty(&output).map_err(|e| eyre!("Failed to render output: {}", e))?;
  println!("{}", text);

  Ok(())
}

fn parse_values(raw: &str) -> Result<Map<String, Value>> {
  serde_json::from_str(raw).map_err(|e| eyre!("Field values must be a JSON object: {}", e))
}

fn write_output<T: serde::Serialize>(result: recache::WriteResult<T>) -> Value {
  json!({
    "id": result.id,
    "record": result.record,
    "merged": result.merged,
  })
}

/// Log to a daily rolling file, and to stderr when verbose.
///
/// The returned guard flushes the file writer on drop.
fn init_logging(verbose: bool) -> Result<WorkerGuard> {
  let dir = log_dir();
  std::fs::create_dir_all(&dir)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

  let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::daily(&dir, "recache.log"));

  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("recache=info"));
  let stderr = verbose.then(|| fmt::layer().with_writer(std::io::stderr));

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false))
    .with(stderr)
    .try_init()
    .map_err(|e| eyre!("Failed to initialize logging: {}", e))?;

  Ok(guard)
}

fn log_dir() -> PathBuf {
  dirs::data_dir()
    .unwrap_or_else(|| Path::new(".").to_path_buf())
    .join("recache")
    .join("logs")
}
