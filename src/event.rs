use tokio::sync::{mpsc, watch};
use tracing::warn;

use crate::queue::QueueStatus;

/// Events driving the `watch` loop
#[derive(Debug)]
pub enum Event {
  /// Queue status changed
  Status(QueueStatus),
  /// Ctrl-C or the process was asked to stop
  Shutdown,
}

/// Event handler that merges queue status changes and shutdown requests
pub struct EventHandler {
  tx: mpsc::UnboundedSender<Event>,
  rx: mpsc::UnboundedReceiver<Event>,
}

impl EventHandler {
  pub fn new() -> Self {
    let (tx, rx) = mpsc::unbounded_channel();
    Self { tx, rx }
  }

  /// Emit `Shutdown` on Ctrl-C
  pub fn listen_for_shutdown(&self) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl-C: {}", e);
      }
      let _ = tx.send(Event::Shutdown);
    });
  }

  /// Forward every status change as an `Event::Status`
  pub fn forward_status(&self, mut status: watch::Receiver<QueueStatus>) {
    let tx = self.tx.clone();
    tokio::spawn(async move {
      while status.changed().await.is_ok() {
        let current = status.borrow_and_update().clone();
        if tx.send(Event::Status(current)).is_err() {
          break;
        }
      }
    });
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<Event> {
    self.rx.recv().await
  }
}

impl Default for EventHandler {
  fn default() -> Self {
    Self::new()
  }
}
