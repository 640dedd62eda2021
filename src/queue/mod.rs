//! Offline-first write queue.
//!
//! This module provides a backend-agnostic queue that:
//! - Persists typed records locally with a synced/pending flag
//! - Never writes to the remote store directly from `save`
//! - Pushes pending records one at a time on demand or on reconnect
//! - Keeps failed records pending for the next pass

mod coordinator;
mod facade;
mod record;
mod storage;

pub use coordinator::SyncCoordinator;
pub use facade::{AutoSync, LastSync, OfflineQueue, QueueStatus, SyncPhase};
pub use record::{OfflineRecord, RecordKind, SyncReport};
pub use storage::{MemoryStore, PendingScan, RecordStore, SqliteStore};
