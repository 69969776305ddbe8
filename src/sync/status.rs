//! Sync status surface and its listeners.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

/// How many errors the status reports.
pub const MAX_REPORTED_ERRORS: usize = 5;

/// Read-only view of the engine, derived on demand.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
  pub is_syncing: bool,
  pub pending_count: usize,
  pub last_sync_time: Option<DateTime<Utc>>,
  /// Most recent errors, oldest first
  pub errors: Vec<String>,
}

pub type Listener = Arc<dyn Fn(&SyncStatus) + Send + Sync>;

type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;
type Entries<E> = Mutex<Vec<(u64, Callback<E>)>>;

/// Registered listeners for one kind of event, called in registration order.
pub(crate) struct Listeners<E = SyncStatus> {
  next_id: AtomicU64,
  entries: Arc<Entries<E>>,
}

impl<E> Default for Listeners<E> {
  fn default() -> Self {
    Self {
      next_id: AtomicU64::new(0),
      entries: Arc::new(Mutex::new(Vec::new())),
    }
  }
}

impl<E: 'static> Listeners<E> {
  pub fn add(&self, listener: Callback<E>) -> Subscription {
    let id = self.next_id.fetch_add(1, Ordering::Relaxed);
    lock(&self.entries).push((id, listener));

    let entries: Weak<Entries<E>> = Arc::downgrade(&self.entries);
    Subscription {
      detach: Some(Box::new(move || {
        if let Some(entries) = entries.upgrade() {
          lock(&entries).retain(|(entry, _)| *entry != id);
        }
      })),
    }
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.entries).is_empty()
  }

  /// Call every listener. The list is copied first so a listener may
  /// subscribe or unsubscribe without deadlocking.
  pub fn notify(&self, event: &E) {
    let listeners: Vec<Callback<E>> = lock(&self.entries)
      .iter()
      .map(|(_, l)| Arc::clone(l))
      .collect();
    for listener in listeners {
      listener(event);
    }
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
  detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
  pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(detach) = self.detach.take() {
      detach();
    }
  }
}

/// An error with the time it happened, in epoch millis.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct TimedError {
  pub at: i64,
  pub message: String,
}

/// Bounded ring of engine-level errors that have no queue entry to live on.
#[derive(Default)]
pub(crate) struct ErrorLog {
  entries: Mutex<VecDeque<TimedError>>,
}

impl ErrorLog {
  pub fn push(&self, at: i64, message: String) {
    let mut entries = lock(&self.entries);
    entries.push_back(TimedError { at, message });
    while entries.len() > MAX_REPORTED_ERRORS {
      entries.pop_front();
    }
  }

  pub fn snapshot(&self) -> Vec<TimedError> {
    lock(&self.entries).iter().cloned().collect()
  }

  pub fn clear(&self) {
    lock(&self.entries).clear();
  }
}

/// Keep the most recent `MAX_REPORTED_ERRORS`, oldest first.
pub(crate) fn most_recent(mut errors: Vec<TimedError>) -> Vec<String> {
  errors.sort_by_key(|e| e.at);
  let skip = errors.len().saturating_sub(MAX_REPORTED_ERRORS);
  errors.into_iter().skip(skip).map(|e| e.message).collect()
}
