use clap::{Parser, Subcommand};
use color_eyre::Result;
use std::path::PathBuf;

use stride::queue::RecordKind;
use stride::{app, config, logging};

#[derive(Parser, Debug)]
#[command(name = "stride")]
#[command(about = "Offline-first write queue for the stride goal tracker")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/stride/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a record locally
  Save {
    kind: RecordKind,
    /// Record body as JSON
    payload: String,
    /// Reuse an id to replace an earlier record
    #[arg(long)]
    id: Option<String>,
  },
  /// Show records not yet accepted by the backend
  Pending,
  /// Show every stored record
  List,
  /// Push pending records now
  Sync,
  /// Mark a synced record pending again
  Reset { id: String },
  /// Delete a record from the local queue
  Remove { id: String },
  /// Delete all synced records
  Prune,
  /// Sync automatically whenever connectivity comes back
  Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = config::Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log)?;

  let app = app::App::new(config)?;

  match args.command {
    Command::Save { kind, payload, id } => app.save(kind, &payload, id.as_deref())?,
    Command::Pending => app.pending()?,
    Command::List => app.list()?,
    Command::Sync => app.sync().await?,
    Command::Reset { id } => app.reset(&id)?,
    Command::Remove { id } => app.remove(&id)?,
    Command::Prune => app.prune()?,
    Command::Watch => app.watch().await?,
  }

  Ok(())
}
