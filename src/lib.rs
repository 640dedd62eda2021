//! Offline-first write queue for the stride goal tracker.
//!
//! Records are saved locally first and pushed to the hosted backend when
//! connectivity allows. See [`queue::OfflineQueue`] for the entry point.

pub mod app;
pub mod config;
pub mod connectivity;
pub mod event;
pub mod logging;
pub mod queue;
pub mod remote;
