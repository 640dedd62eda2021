use color_eyre::{eyre::eyre, Result};
use tracing::info;

use crate::config::Config;
use crate::connectivity::{spawn_probe_loop, ConnectivityMonitor, TcpProbe};
use crate::event::{Event, EventHandler};
use crate::queue::{OfflineQueue, OfflineRecord, QueueStatus, RecordKind, SqliteStore};
use crate::remote::HttpRemote;

/// Wires configuration into the queue and runs CLI commands against it
pub struct App {
  config: Config,

  /// Write queue backed by the local database and the hosted backend
  queue: OfflineQueue<SqliteStore, HttpRemote>,

  /// Shared connectivity state, fed by `probe`
  monitor: ConnectivityMonitor,

  probe: TcpProbe,
}

impl App {
  pub fn new(config: Config) -> Result<Self> {
    let store = match &config.storage.path {
      Some(path) => SqliteStore::open_at(path)?,
      None => SqliteStore::open()?,
    };
    let remote = HttpRemote::new(&config.remote)?;
    let probe = TcpProbe::new(
      config.connectivity.probe.clone(),
      config.connectivity.timeout(),
    );

    // Offline until a probe says otherwise; queuing never needs the network.
    let monitor = ConnectivityMonitor::new(false);
    let queue = OfflineQueue::new(store, remote, monitor.clone())?;

    Ok(Self {
      config,
      queue,
      monitor,
      probe,
    })
  }

  pub fn save(&self, kind: RecordKind, payload: &str, id: Option<&str>) -> Result<()> {
    let payload: serde_json::Value =
      serde_json::from_str(payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;

    let record = match id {
      Some(id) => self.queue.save_with_id(id, kind, payload)?,
      None => self.queue.save(kind, payload)?,
    };

    println!("{}", record.id);
    Ok(())
  }

  pub fn pending(&self) -> Result<()> {
    let pending = self.queue.pending()?;
    println!("{} pending", pending.len());
    for record in &pending {
      print_record(record);
    }
    Ok(())
  }

  pub fn list(&self) -> Result<()> {
    for record in self.queue.records()? {
      print_record(&record);
    }
    Ok(())
  }

  /// Probe once, then push everything pending.
  pub async fn sync(&self) -> Result<()> {
    Config::get_api_key()?;

    if !self.monitor.refresh(&self.probe).await {
      println!(
        "offline ({} unreachable), {} records pending",
        self.config.connectivity.probe,
        self.queue.pending_count()?
      );
      return Ok(());
    }

    let report = self.queue.sync().await;
    println!("{}", report);
    for id in &report.failed_ids {
      println!("  still pending: {}", id);
    }
    Ok(())
  }

  pub fn reset(&self, id: &str) -> Result<()> {
    if !self.queue.reset(id)? {
      return Err(eyre!("No record with id {}", id));
    }
    println!("{} will be resent on the next sync", id);
    Ok(())
  }

  pub fn remove(&self, id: &str) -> Result<()> {
    if !self.queue.remove(id)? {
      return Err(eyre!("No record with id {}", id));
    }
    Ok(())
  }

  pub fn prune(&self) -> Result<()> {
    let pruned = self.queue.prune_synced()?;
    println!("removed {} synced records", pruned);
    Ok(())
  }

  /// Keep probing connectivity and sync whenever it comes back, until Ctrl-C.
  pub async fn watch(&self) -> Result<()> {
    Config::get_api_key()?;

    let mut events = EventHandler::new();
    events.listen_for_shutdown();
    events.forward_status(self.queue.watch_status());

    let _auto_sync = self.queue.start_auto_sync();
    let probe_task = spawn_probe_loop(
      self.monitor.clone(),
      self.probe.clone(),
      self.config.connectivity.interval(),
    );

    log_status(&self.queue.status());

    while let Some(event) = events.next().await {
      match event {
        Event::Status(status) => log_status(&status),
        Event::Shutdown => {
          info!("shutting down");
          break;
        }
      }
    }

    probe_task.abort();
    Ok(())
  }
}

fn print_record(record: &OfflineRecord) {
  let state = if record.synced { "synced" } else { "pending" };
  println!(
    "{}  {:<14}  {:<7}  {}  {}",
    record.id,
    record.kind,
    state,
    record.timestamp.format("%Y-%m-%d %H:%M:%S"),
    record.payload
  );
}

fn log_status(status: &QueueStatus) {
  match &status.last_sync {
    Some(last) => info!(
      online = status.is_online,
      syncing = status.is_syncing,
      pending = status.pending_count,
      last_sync = %last.at.format("%H:%M:%S"),
      last_failed = last.failed,
      "queue status"
    ),
    None => info!(
      online = status.is_online,
      syncing = status.is_syncing,
      pending = status.pending_count,
      "queue status"
    ),
  }
}
