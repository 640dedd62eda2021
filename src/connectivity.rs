//! Online/offline tracking.
//!
//! `ConnectivityMonitor` holds the current reachability state and notifies
//! subscribers synchronously on every transition. The state is fed from a
//! `NetworkProbe`, either once (`detect`, `refresh`) or continuously from a
//! background task (`spawn_probe_loop`).

use color_eyre::{eyre::eyre, Result};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info};

type Listener = Arc<dyn Fn(bool) + Send + Sync>;

struct MonitorState {
  online: bool,
  next_id: u64,
  listeners: Vec<(u64, Listener)>,
}

/// Shared online/offline state with transition listeners.
#[derive(Clone)]
pub struct ConnectivityMonitor {
  state: Arc<Mutex<MonitorState>>,
}

impl ConnectivityMonitor {
  pub fn new(online: bool) -> Self {
    Self {
      state: Arc::new(Mutex::new(MonitorState {
        online,
        next_id: 0,
        listeners: Vec::new(),
      })),
    }
  }

  /// Create a monitor whose initial state is read once from the probe.
  pub async fn detect<P: NetworkProbe>(probe: &P) -> Self {
    Self::new(read_probe(probe).await)
  }

  pub fn is_online(&self) -> bool {
    lock(&self.state).online
  }

  /// Record the current state. Listeners are called only when it changed.
  pub fn set_online(&self, online: bool) {
    let listeners: Vec<Listener> = {
      let mut state = lock(&self.state);
      if state.online == online {
        return;
      }
      state.online = online;
      state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
    };

    info!(online, "connectivity changed");

    // Called outside the lock so listeners can read the monitor.
    for listener in listeners {
      listener(online);
    }
  }

  /// Re-read the probe and apply the result. Returns the new state.
  pub async fn refresh<P: NetworkProbe>(&self, probe: &P) -> bool {
    let online = read_probe(probe).await;
    self.set_online(online);
    online
  }

  /// Register a transition listener. It stays registered until the
  /// returned handle is dropped.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(bool) + Send + Sync + 'static,
  {
    let mut state = lock(&self.state);
    let id = state.next_id;
    state.next_id += 1;
    state.listeners.push((id, Arc::new(listener)));

    Subscription {
      id,
      state: Arc::downgrade(&self.state),
    }
  }

  pub fn subscriber_count(&self) -> usize {
    lock(&self.state).listeners.len()
  }
}

impl std::fmt::Debug for ConnectivityMonitor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectivityMonitor")
      .field("online", &self.is_online())
      .field("subscribers", &self.subscriber_count())
      .finish()
  }
}

/// Handle for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
  id: u64,
  state: Weak<Mutex<MonitorState>>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(state) = self.state.upgrade() {
      lock(&state).listeners.retain(|(id, _)| *id != self.id);
    }
  }
}

/// Listeners never run under the lock, so a poisoned lock still holds
/// consistent state.
fn lock(state: &Mutex<MonitorState>) -> MutexGuard<'_, MonitorState> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Source of the host's network reachability signal.
pub trait NetworkProbe: Send + Sync {
  fn check(&self) -> impl Future<Output = Result<bool>> + Send;
}

/// Probe errors count as offline.
async fn read_probe<P: NetworkProbe>(probe: &P) -> bool {
  match probe.check().await {
    Ok(online) => online,
    Err(e) => {
      debug!("connectivity probe failed, assuming offline: {}", e);
      false
    }
  }
}

/// Probe that treats a successful TCP connect as "online".
#[derive(Debug, Clone)]
pub struct TcpProbe {
  addr: String,
  timeout: Duration,
}

impl TcpProbe {
  pub fn new(addr: impl Into<String>, timeout: Duration) -> Self {
    Self {
      addr: addr.into(),
      timeout,
    }
  }
}

impl NetworkProbe for TcpProbe {
  async fn check(&self) -> Result<bool> {
    match tokio::time::timeout(self.timeout, TcpStream::connect(self.addr.as_str())).await {
      Ok(Ok(_stream)) => Ok(true),
      Ok(Err(e)) => Err(eyre!("Failed to connect to {}: {}", self.addr, e)),
      Err(_) => Ok(false),
    }
  }
}

/// Poll the probe every `interval` and feed the result into the monitor.
/// The first check happens immediately.
pub fn spawn_probe_loop<P>(monitor: ConnectivityMonitor, probe: P, interval: Duration) -> JoinHandle<()>
where
  P: NetworkProbe + 'static,
{
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      monitor.refresh(&probe).await;
    }
  })
}
