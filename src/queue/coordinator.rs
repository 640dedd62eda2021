//! Pushes pending records to the remote store.

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::remote::RemoteStore;

use super::record::SyncReport;
use super::storage::{PendingScan, RecordStore};

/// Reconciles pending local records against the remote store.
///
/// Records are sent one at a time in store order. Each record gets exactly
/// one attempt per pass; a failure is counted and the pass moves on, so a
/// rejected record never blocks the rest of the queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyncCoordinator;

impl SyncCoordinator {
  pub fn new() -> Self {
    Self
  }

  /// Run one sync pass. Never fails: every problem ends up in the report
  /// or, for an unreadable store, in the log.
  pub async fn run<S, R>(&self, store: &S, remote: &R) -> SyncReport
  where
    S: RecordStore + ?Sized,
    R: RemoteStore,
  {
    let PendingScan {
      records: pending,
      unreadable,
    } = match store.scan_pending() {
      Ok(scan) => scan,
      Err(e) => {
        warn!("Failed to read pending records, skipping sync: {}", e);
        return SyncReport::empty();
      }
    };

    if pending.is_empty() && unreadable.is_empty() {
      debug!("nothing to sync");
      return SyncReport::empty();
    }

    info!(pending = pending.len() + unreadable.len(), "sync started");
    let mut report = SyncReport::empty();

    // Undecodable rows stay pending and are reported, never sent.
    report.failed += unreadable.len();
    report.failed_ids.extend(unreadable);

    for mut record in pending {
      if let Err(e) = remote.upsert(&record).await {
        warn!(id = %record.id, kind = %record.kind, "sync failed: {}", e);
        report.failed += 1;
        report.failed_ids.push(record.id);
        continue;
      }

      record.mark_synced(Utc::now());

      // The remote has the record but we could not record that; leaving it
      // pending means it is resent later, which the upsert tolerates.
      if let Err(e) = store.put(&record) {
        warn!(id = %record.id, "failed to mark record synced: {}", e);
        report.failed += 1;
        report.failed_ids.push(record.id);
        continue;
      }

      report.succeeded += 1;
    }

    info!(
      succeeded = report.succeeded,
      failed = report.failed,
      "sync finished"
    );
    report
  }
}
