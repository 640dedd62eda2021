//! Core types for queued records and sync results.

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Destination of a queued record. Each kind maps to one remote table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RecordKind {
  Goal,
  GoalNote,
  Habit,
  HabitEntry,
  JournalEntry,
  ActivityEntry,
  Reminder,
}

impl RecordKind {
  pub const ALL: [RecordKind; 7] = [
    RecordKind::Goal,
    RecordKind::GoalNote,
    RecordKind::Habit,
    RecordKind::HabitEntry,
    RecordKind::JournalEntry,
    RecordKind::ActivityEntry,
    RecordKind::Reminder,
  ];

  /// Stable name used in storage and on the command line.
  pub fn as_str(&self) -> &'static str {
    match self {
      RecordKind::Goal => "goal",
      RecordKind::GoalNote => "goal-note",
      RecordKind::Habit => "habit",
      RecordKind::HabitEntry => "habit-entry",
      RecordKind::JournalEntry => "journal-entry",
      RecordKind::ActivityEntry => "activity-entry",
      RecordKind::Reminder => "reminder",
    }
  }

  /// Remote table the record is written to.
  pub fn table(&self) -> &'static str {
    match self {
      RecordKind::Goal => "goals",
      RecordKind::GoalNote => "goal_notes",
      RecordKind::Habit => "habits",
      RecordKind::HabitEntry => "habit_entries",
      RecordKind::JournalEntry => "journal_entries",
      RecordKind::ActivityEntry => "activity_entries",
      RecordKind::Reminder => "reminders",
    }
  }

  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|kind| kind.as_str() == name)
  }
}

impl fmt::Display for RecordKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// A locally persisted unit of work waiting for remote confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineRecord {
  pub id: String,
  pub kind: RecordKind,
  pub payload: Value,
  /// When the record was written to the local store
  pub timestamp: DateTime<Utc>,
  /// Set only after the remote store accepted the record
  pub synced: bool,
  pub synced_at: Option<DateTime<Utc>>,
}

impl OfflineRecord {
  /// Create a pending record with a generated id.
  pub fn new(kind: RecordKind, payload: Value) -> Self {
    Self::with_id(uuid::Uuid::new_v4().to_string(), kind, payload)
  }

  /// Create a pending record with a caller-supplied id.
  pub fn with_id(id: impl Into<String>, kind: RecordKind, payload: Value) -> Self {
    Self {
      id: id.into(),
      kind,
      payload,
      timestamp: Utc::now(),
      synced: false,
      synced_at: None,
    }
  }

  pub fn is_pending(&self) -> bool {
    !self.synced
  }

  pub fn mark_synced(&mut self, at: DateTime<Utc>) {
    self.synced = true;
    self.synced_at = Some(at);
  }

  /// Make the record pending again so the next sync resubmits it.
  pub fn reset(&mut self) {
    self.synced = false;
    self.synced_at = None;
  }
}

/// Tally of a single sync pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  pub succeeded: usize,
  pub failed: usize,
  /// Ids of the records the remote did not accept
  pub failed_ids: Vec<String>,
}

impl SyncReport {
  pub fn empty() -> Self {
    Self::default()
  }
}

impl fmt::Display for SyncReport {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} succeeded, {} failed", self.succeeded, self.failed)
  }
}
