//! Remote store boundary.
//!
//! The queue only needs one thing from the backend: an idempotent upsert of
//! a record into the table for its kind. Replaying the same record must not
//! create a duplicate, which `HttpRemote` guarantees by keying the upsert on
//! the record id.

mod client;

use color_eyre::Result;
use std::future::Future;

use crate::queue::OfflineRecord;

pub use client::HttpRemote;

/// A remote store that accepts queued records.
pub trait RemoteStore: Send + Sync {
  /// Write the record to its destination. Must be safe to repeat.
  fn upsert(&self, record: &OfflineRecord) -> impl Future<Output = Result<()>> + Send;
}
