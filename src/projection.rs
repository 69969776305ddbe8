//! In-memory application state fed from the cache.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::cache::{Collection, LocalCache, Record};
use crate::sync::{Subscription, SyncEngine, SyncStatus};

/// What the app renders: every cached collection plus the sync status.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppState {
  collections: BTreeMap<Collection, Vec<Record>>,
  pub sync: SyncStatus,
}

impl AppState {
  /// Build the startup state from whatever the cache holds.
  pub fn hydrate(engine: &SyncEngine) -> Self {
    let mut state = Self {
      sync: engine.get_sync_status(),
      ..Self::default()
    };
    for collection in Collection::ALL {
      state.refresh(engine.cache(), collection);
    }
    state
  }

  /// Re-read one collection after a mutation touched it.
  pub fn refresh(&mut self, cache: &LocalCache, collection: Collection) {
    self
      .collections
      .insert(collection, cache.records(collection));
  }

  /// Keep a shared state current: every collection change re-reads that
  /// collection and every status notification replaces `sync`. The state
  /// stops following when both subscriptions are dropped.
  pub fn follow(state: Arc<Mutex<AppState>>, engine: &SyncEngine) -> (Subscription, Subscription) {
    let changes = {
      let state = state.clone();
      let cache = engine.cache().clone();
      engine.on_collection_change(move |collection| {
        lock(&state).refresh(&cache, collection);
      })
    };
    let status = engine.subscribe(move |status| lock(&state).apply_status(status.clone()));
    (changes, status)
  }

  pub fn records(&self, collection: Collection) -> &[Record] {
    self
      .collections
      .get(&collection)
      .map(Vec::as_slice)
      .unwrap_or(&[])
  }

  pub fn apply_status(&mut self, status: SyncStatus) {
    self.sync = status;
  }

  /// Record counts per collection, in collection order.
  pub fn counts(&self) -> Vec<(Collection, usize)> {
    Collection::ALL
      .iter()
      .map(|c| (*c, self.records(*c).len()))
      .collect()
  }
}

fn lock(state: &Mutex<AppState>) -> std::sync::MutexGuard<'_, AppState> {
  state.lock().unwrap_or_else(|e| e.into_inner())
}
