//! Connectivity tracking.
//!
//! [`NetworkMonitor`] holds the one online flag of the process. Transitions
//! fire edge callbacks and wake [`watch`](NetworkMonitor::watch) receivers;
//! setting the flag to the value it already has does nothing.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::remote::RemoteClient;
use crate::sync::SyncEngine;

pub type Callback = Arc<dyn Fn() + Send + Sync>;

pub struct NetworkMonitor {
  online: watch::Sender<bool>,
  on_reconnect: Mutex<Vec<Callback>>,
  on_disconnect: Mutex<Vec<Callback>>,
}

impl NetworkMonitor {
  pub fn new(online: bool) -> Self {
    let (tx, _) = watch::channel(online);
    Self {
      online: tx,
      on_reconnect: Mutex::default(),
      on_disconnect: Mutex::default(),
    }
  }

  pub fn is_online(&self) -> bool {
    *self.online.borrow()
  }

  /// Receiver that wakes on every transition.
  pub fn watch(&self) -> watch::Receiver<bool> {
    self.online.subscribe()
  }

  /// Run `callback` on every offline to online transition.
  pub fn on_reconnect<F>(&self, callback: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    lock(&self.on_reconnect).push(Arc::new(callback));
  }

  /// Run `callback` on every online to offline transition.
  pub fn on_disconnect<F>(&self, callback: F)
  where
    F: Fn() + Send + Sync + 'static,
  {
    lock(&self.on_disconnect).push(Arc::new(callback));
  }

  /// Record the latest connectivity signal. Returns whether it was a transition.
  pub fn set_online(&self, online: bool) -> bool {
    let changed = self.online.send_if_modified(|current| {
      if *current == online {
        return false;
      }
      *current = online;
      true
    });
    if !changed {
      return false;
    }

    let callbacks: Vec<Callback> = if online {
      info!("connection restored");
      lock(&self.on_reconnect).clone()
    } else {
      info!("connection lost");
      lock(&self.on_disconnect).clone()
    };
    for callback in callbacks {
      callback();
    }
    true
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Periodically health-check the remote and feed the result to `monitor`.
pub fn spawn_probe(
  monitor: Arc<NetworkMonitor>,
  remote: Arc<dyn RemoteClient>,
  every: Duration,
) -> JoinHandle<()> {
  tokio::spawn(async move {
    let mut ticker = tokio::time::interval(every.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
      ticker.tick().await;
      let reachable = match remote.health_check().await {
        Ok(()) => true,
        Err(e) => {
          debug!(error = %e, "health check failed");
          false
        }
      };
      monitor.set_online(reachable);
    }
  })
}

/// Run a full sync after each reconnect, once the connection has stayed up
/// for `settle`. Ends when the monitor is dropped.
pub fn spawn_reconnect_sync(
  monitor: &NetworkMonitor,
  engine: Arc<SyncEngine>,
  settle: Duration,
) -> JoinHandle<()> {
  let mut rx = monitor.watch();
  let mut online = *rx.borrow_and_update();

  tokio::spawn(async move {
    while rx.changed().await.is_ok() {
      let now_online = *rx.borrow_and_update();
      let reconnected = now_online && !online;
      online = now_online;
      if !reconnected {
        continue;
      }

      tokio::time::sleep(settle).await;
      if !*rx.borrow() {
        debug!("connection dropped again before settling");
        continue;
      }

      match engine.full_sync().await {
        Ok(result) => info!(
          success = result.success_count,
          failed = result.failed_count,
          "reconnect sync finished"
        ),
        Err(e) => warn!(error = %e, "reconnect sync failed"),
      }
    }
  })
}
