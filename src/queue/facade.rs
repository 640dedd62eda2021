//! The single entry point application code uses to queue and sync records.

use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connectivity::{ConnectivityMonitor, Subscription};
use crate::remote::RemoteStore;

use super::coordinator::SyncCoordinator;
use super::record::{OfflineRecord, RecordKind, SyncReport};
use super::storage::RecordStore;

/// Whether a sync pass is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
  Idle,
  Syncing,
}

/// Outcome of the most recent sync pass that actually ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastSync {
  pub at: DateTime<Utc>,
  pub succeeded: usize,
  pub failed: usize,
}

/// Observable queue state for status displays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStatus {
  pub is_online: bool,
  pub is_syncing: bool,
  pub pending_count: usize,
  pub last_sync: Option<LastSync>,
}

struct Inner<S, R> {
  store: S,
  remote: R,
  monitor: ConnectivityMonitor,
  coordinator: SyncCoordinator,
  syncing: AtomicBool,
  status: Arc<watch::Sender<QueueStatus>>,
  _connectivity: Subscription,
}

/// Offline-capable write queue.
///
/// `save` only ever writes locally; records reach the remote store through
/// `sync`, which runs on demand or (with `start_auto_sync`) whenever the
/// monitor reports that connectivity came back.
pub struct OfflineQueue<S: RecordStore, R: RemoteStore> {
  inner: Arc<Inner<S, R>>,
}

impl<S: RecordStore, R: RemoteStore> OfflineQueue<S, R> {
  pub fn new(store: S, remote: R, monitor: ConnectivityMonitor) -> Result<Self> {
    let status = Arc::new(watch::Sender::new(QueueStatus {
      is_online: monitor.is_online(),
      is_syncing: false,
      pending_count: store.pending_count()?,
      last_sync: None,
    }));

    let listener_status = Arc::clone(&status);
    let listener_monitor = monitor.clone();
    // Notifications can arrive out of order when writers race, so the
    // monitor is re-read rather than trusting the passed value.
    let connectivity = monitor.subscribe(move |_| {
      let online = listener_monitor.is_online();
      listener_status.send_if_modified(|s| std::mem::replace(&mut s.is_online, online) != online);
    });

    Ok(Self {
      inner: Arc::new(Inner {
        store,
        remote,
        monitor,
        coordinator: SyncCoordinator::new(),
        syncing: AtomicBool::new(false),
        status,
        _connectivity: connectivity,
      }),
    })
  }

  /// Queue a record under a generated id.
  pub fn save(&self, kind: RecordKind, payload: Value) -> Result<OfflineRecord> {
    self.store_new(OfflineRecord::new(kind, payload))
  }

  /// Queue a record under the given id, replacing any record with that id.
  /// The replacement is pending again even if the old one was synced.
  pub fn save_with_id(&self, id: &str, kind: RecordKind, payload: Value) -> Result<OfflineRecord> {
    self.store_new(OfflineRecord::with_id(id, kind, payload))
  }

  fn store_new(&self, record: OfflineRecord) -> Result<OfflineRecord> {
    self.inner.store.put(&record)?;
    debug!(id = %record.id, kind = %record.kind, "record queued");
    self.publish();
    Ok(record)
  }

  /// Push pending records to the remote store.
  ///
  /// Offline, or while another pass is running, this returns an empty
  /// report without touching the store.
  pub async fn sync(&self) -> SyncReport {
    if !self.inner.monitor.is_online() {
      debug!("offline, sync skipped");
      return SyncReport::empty();
    }

    let Some(_guard) = SyncGuard::acquire(self) else {
      debug!("sync already in progress");
      return SyncReport::empty();
    };

    let report = self
      .inner
      .coordinator
      .run(&self.inner.store, &self.inner.remote)
      .await;

    let last = LastSync {
      at: Utc::now(),
      succeeded: report.succeeded,
      failed: report.failed,
    };
    self.inner.status.send_modify(|s| s.last_sync = Some(last));

    report
  }

  pub fn is_online(&self) -> bool {
    self.inner.monitor.is_online()
  }

  pub fn is_syncing(&self) -> bool {
    self.inner.syncing.load(Ordering::SeqCst)
  }

  pub fn phase(&self) -> SyncPhase {
    if self.is_syncing() {
      SyncPhase::Syncing
    } else {
      SyncPhase::Idle
    }
  }

  /// Number of pending records, read from the store.
  pub fn pending_count(&self) -> Result<usize> {
    self.inner.store.pending_count()
  }

  pub fn status(&self) -> QueueStatus {
    self.inner.status.borrow().clone()
  }

  pub fn watch_status(&self) -> watch::Receiver<QueueStatus> {
    self.inner.status.subscribe()
  }

  pub fn records(&self) -> Result<Vec<OfflineRecord>> {
    self.inner.store.get_all()
  }

  pub fn pending(&self) -> Result<Vec<OfflineRecord>> {
    self.inner.store.get_pending()
  }

  /// Make a synced record pending again. Returns false if the id is unknown.
  pub fn reset(&self, id: &str) -> Result<bool> {
    let Some(mut record) = self.inner.store.get(id)? else {
      return Ok(false);
    };
    record.reset();
    self.inner.store.put(&record)?;
    self.publish();
    Ok(true)
  }

  pub fn remove(&self, id: &str) -> Result<bool> {
    let removed = self.inner.store.remove(id)?;
    self.publish();
    Ok(removed)
  }

  /// Drop every record the remote already accepted.
  pub fn prune_synced(&self) -> Result<usize> {
    let pruned = self.inner.store.prune_synced()?;
    info!(pruned, "pruned synced records");
    self.publish();
    Ok(pruned)
  }

  /// Recompute the derived status fields and notify watchers.
  fn publish(&self) {
    let pending = match self.inner.store.pending_count() {
      Ok(count) => Some(count),
      Err(e) => {
        warn!("Failed to count pending records: {}", e);
        None
      }
    };
    let is_online = self.inner.monitor.is_online();
    let is_syncing = self.is_syncing();

    self.inner.status.send_if_modified(|s| {
      let before = s.clone();
      s.is_online = is_online;
      s.is_syncing = is_syncing;
      if let Some(count) = pending {
        s.pending_count = count;
      }
      *s != before
    });
  }
}

impl<S, R> OfflineQueue<S, R>
where
  S: RecordStore + 'static,
  R: RemoteStore + 'static,
{
  /// Sync automatically each time connectivity is restored.
  ///
  /// Runs until the returned handle is dropped.
  pub fn start_auto_sync(&self) -> AutoSync {
    let (tx, mut rx) = mpsc::unbounded_channel();

    let subscription = self.inner.monitor.subscribe(move |online| {
      if online {
        let _ = tx.send(());
      }
    });

    let queue = self.clone();
    let task = tokio::spawn(async move {
      while rx.recv().await.is_some() {
        info!("connectivity restored, syncing");
        let report = queue.sync().await;
        if report.failed > 0 {
          warn!(failed = report.failed, "some records are still pending");
        }
      }
    });

    AutoSync {
      _subscription: subscription,
      task,
    }
  }
}

impl<S: RecordStore, R: RemoteStore> Clone for OfflineQueue<S, R> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

/// Background reconnect trigger. Dropping it unsubscribes and stops the task.
pub struct AutoSync {
  _subscription: Subscription,
  task: JoinHandle<()>,
}

impl Drop for AutoSync {
  fn drop(&mut self) {
    self.task.abort();
  }
}

/// Holds the Syncing phase; releasing it returns the queue to Idle even if
/// the sync future is dropped part way.
struct SyncGuard<'a, S: RecordStore, R: RemoteStore> {
  queue: &'a OfflineQueue<S, R>,
}

impl<'a, S: RecordStore, R: RemoteStore> SyncGuard<'a, S, R> {
  fn acquire(queue: &'a OfflineQueue<S, R>) -> Option<Self> {
    queue
      .inner
      .syncing
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .ok()?;
    queue.publish();
    Some(Self { queue })
  }
}

impl<S: RecordStore, R: RemoteStore> Drop for SyncGuard<'_, S, R> {
  fn drop(&mut self) {
    self.queue.inner.syncing.store(false, Ordering::SeqCst);
    self.queue.publish();
  }
}
