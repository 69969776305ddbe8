//! Persisted FIFO of operations awaiting delivery.

use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{now_millis, LocalCache};

use super::operation::{EntityKind, OperationKind, OperationStatus, QueuedOperation};

/// Storage key of the serialized queue.
pub const QUEUE_KEY: &str = "sync_queue";

/// Attempts after which an operation is no longer retried automatically.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// The queue as stored: the operations this build can read, plus entries it
/// cannot, which are written back untouched and never sent.
#[derive(Debug, Default)]
struct Stored {
  operations: Vec<QueuedOperation>,
  unreadable: Vec<Value>,
}

impl Stored {
  fn from_entries(entries: Vec<Value>) -> Self {
    let mut stored = Self::default();
    for entry in entries {
      match serde_json::from_value::<QueuedOperation>(entry.clone()) {
        Ok(op) => stored.operations.push(op),
        Err(e) => {
          debug!(error = %e, "unreadable queue entry");
          stored.unreadable.push(entry);
        }
      }
    }
    stored
  }

  /// Parse a raw queue value. Only a value that is not a JSON array at all
  /// fails; single bad entries are set aside.
  fn parse(raw: Option<&str>) -> Result<Self> {
    let Some(raw) = raw else {
      return Ok(Self::default());
    };
    let entries: Vec<Value> = serde_json::from_str(raw)
      .map_err(|e| eyre!("Sync queue is unreadable, refusing to overwrite it: {}", e))?;
    Ok(Self::from_entries(entries))
  }

  fn to_raw(&self) -> Result<String> {
    let mut entries = self.unreadable.clone();
    for op in &self.operations {
      entries.push(
        serde_json::to_value(op).map_err(|e| eyre!("Failed to serialize operation {}: {}", op.id, e))?,
      );
    }
    serde_json::to_string(&entries).map_err(|e| eyre!("Failed to serialize sync queue: {}", e))
  }
}

/// Ordered, at-least-once delivery log.
///
/// The whole queue is one cached value. Every mutation is a single atomic
/// read-modify-write on the backend, so callers in other threads or other
/// processes sharing the store never lose each other's updates.
#[derive(Clone)]
pub struct OperationQueue {
  cache: LocalCache,
  max_attempts: u32,
}

impl OperationQueue {
  pub fn new(cache: LocalCache) -> Self {
    Self {
      cache,
      max_attempts: DEFAULT_MAX_ATTEMPTS,
    }
  }

  /// Set the retry ceiling.
  pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
    self.max_attempts = max_attempts;
    self
  }

  pub fn max_attempts(&self) -> u32 {
    self.max_attempts
  }

  fn load(&self) -> Stored {
    self
      .cache
      .get_item::<Vec<Value>>(QUEUE_KEY)
      .map(Stored::from_entries)
      .unwrap_or_default()
  }

  /// Read-modify-write the queue atomically.
  ///
  /// `f` returns whether it changed anything and a result; nothing is
  /// written when it changed nothing.
  fn transact<T>(&self, f: impl FnOnce(&mut Vec<QueuedOperation>) -> (bool, T)) -> Result<T> {
    let mut f = Some(f);
    let mut out = None;
    self
      .cache
      .update_raw(QUEUE_KEY, &mut |raw| {
        let mut stored = Stored::parse(raw.as_deref())?;
        let f = f.take().ok_or_else(|| eyre!("Sync queue update ran twice"))?;
        let (changed, value) = f(&mut stored.operations);
        out = Some(value);
        if !stored.unreadable.is_empty() {
          warn!(
            count = stored.unreadable.len(),
            "keeping unreadable operations in the sync queue"
          );
        }
        if changed {
          stored.to_raw().map(Some)
        } else {
          Ok(None)
        }
      })
      .map_err(|e| e.wrap_err("Failed to persist sync queue"))?;
    out.ok_or_else(|| eyre!("Sync queue update did not run"))
  }

  fn modify<T>(&self, f: impl FnOnce(&mut Vec<QueuedOperation>) -> T) -> Result<T> {
    self.transact(|ops| (true, f(ops)))
  }

  /// Append a new operation and return its id.
  pub fn enqueue(&self, kind: OperationKind, entity: EntityKind, payload: Value) -> Result<String> {
    self.push(QueuedOperation::new(kind, entity, payload))
  }

  /// Append a prepared operation and return its id.
  pub fn push(&self, operation: QueuedOperation) -> Result<String> {
    let id = operation.id.clone();
    let (kind, entity) = (operation.kind, operation.entity);
    self.modify(|ops| ops.push(operation))?;
    info!(op_id = %id, %kind, %entity, "operation queued");
    Ok(id)
  }

  /// Remove one operation. Removing an absent id is a no-op returning false.
  pub fn dequeue(&self, operation_id: &str) -> Result<bool> {
    let removed = self.transact(|ops| {
      let before = ops.len();
      ops.retain(|op| op.id != operation_id);
      let removed = ops.len() != before;
      (removed, removed)
    })?;

    if removed {
      debug!(op_id = operation_id, "operation dequeued");
    }
    Ok(removed)
  }

  /// Update an operation's status in place.
  ///
  /// Moving to `InFlight` starts an attempt: it is the only transition that
  /// increments `attempt_count`.
  pub fn update_status(
    &self,
    operation_id: &str,
    status: OperationStatus,
    error: Option<String>,
  ) -> Result<()> {
    let found = self.transact(|ops| {
      let Some(op) = ops.iter_mut().find(|op| op.id == operation_id) else {
        return (false, false);
      };
      if status == OperationStatus::InFlight {
        op.attempt_count += 1;
        op.last_attempt_at = Some(now_millis());
      }
      op.status = status;
      if error.is_some() {
        op.last_error = error;
      }
      (true, true)
    })?;

    if !found {
      return Err(eyre!("Operation {} is not queued", operation_id));
    }
    Ok(())
  }

  /// Operations eligible for an automatic attempt, in enqueue order.
  pub fn list_pending(&self) -> Vec<QueuedOperation> {
    self
      .load()
      .operations
      .into_iter()
      .filter(|op| matches!(op.status, OperationStatus::Pending | OperationStatus::Failed))
      .filter(|op| !op.is_exhausted(self.max_attempts))
      .collect()
  }

  /// Every readable queued operation, including exhausted ones.
  pub fn list_all(&self) -> Vec<QueuedOperation> {
    self.load().operations
  }

  /// Raw entries kept in the queue that do not parse as operations.
  pub fn unreadable(&self) -> Vec<Value> {
    self.load().unreadable
  }

  /// False when a stored queue exists but is not a JSON array at all.
  /// Such a queue is left untouched and every mutation fails until it is
  /// cleared.
  pub fn is_readable(&self) -> bool {
    match self.cache.get_raw(QUEUE_KEY) {
      Ok(Some(raw)) => Stored::parse(Some(&raw)).is_ok(),
      Ok(None) => true,
      Err(e) => {
        warn!(error = %e, "sync queue read failed");
        false
      }
    }
  }

  pub fn get(&self, operation_id: &str) -> Option<QueuedOperation> {
    self
      .load()
      .operations
      .into_iter()
      .find(|op| op.id == operation_id)
  }

  /// Stored entries, unreadable ones included.
  pub fn len(&self) -> usize {
    let stored = self.load();
    stored.operations.len() + stored.unreadable.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every queued operation.
  pub fn clear(&self) -> Result<()> {
    self.cache.remove(QUEUE_KEY)?;
    info!("sync queue cleared");
    Ok(())
  }

  /// The not-yet-started create that produced the optimistic record `local_id`.
  pub fn pending_create_for(&self, local_id: &str) -> Option<QueuedOperation> {
    self.load().operations.into_iter().find(|op| {
      op.kind == OperationKind::Create
        && op.status != OperationStatus::InFlight
        && op.local_id.as_deref() == Some(local_id)
    })
  }

  /// Swap an operation's payload, keeping its place in the queue.
  pub fn replace_payload(&self, operation_id: &str, payload: Value) -> Result<bool> {
    self.transact(|ops| match ops.iter_mut().find(|op| op.id == operation_id) {
      Some(op) => {
        op.payload = payload;
        (true, true)
      }
      None => (false, false),
    })
  }

  /// Return operations stranded `InFlight` by an interrupted drain to `Pending`.
  ///
  /// An unreadable queue is reported and left alone, so startup still works
  /// and the queue can be inspected or cleared.
  pub fn recover_in_flight(&self) -> Result<usize> {
    if !self.is_readable() {
      warn!("sync queue is unreadable, skipping in-flight recovery");
      return Ok(0);
    }

    let recovered = self.transact(|ops| {
      let mut recovered = 0;
      for op in ops
        .iter_mut()
        .filter(|op| op.status == OperationStatus::InFlight)
      {
        op.status = OperationStatus::Pending;
        recovered += 1;
      }
      (recovered > 0, recovered)
    })?;

    if recovered > 0 {
      info!(recovered, "requeued operations interrupted mid-flight");
    }
    Ok(recovered)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{KvStorage, MemoryStorage, SqliteStorage};
  use serde_json::json;
  use std::sync::Arc;

  fn queue() -> OperationQueue {
    OperationQueue::new(LocalCache::new(MemoryStorage::new()))
  }

  #[test]
  fn test_enqueue_preserves_fifo_order() {
    let queue = queue();
    let a = queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({"n": "A"}))
      .unwrap();
    let b = queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({"n": "B"}))
      .unwrap();
    let c = queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({"n": "C"}))
      .unwrap();

    let ids: Vec<String> = queue.list_pending().into_iter().map(|op| op.id).collect();
    assert_eq!(ids, vec![a, b, c]);
  }

  #[test]
  fn test_dequeue_is_idempotent() {
    let queue = queue();
    let id = queue
      .enqueue(OperationKind::Delete, EntityKind::Group, json!({"id": "g1"}))
      .unwrap();
    let other = queue
      .enqueue(OperationKind::Delete, EntityKind::Group, json!({"id": "g2"}))
      .unwrap();

    assert!(queue.dequeue(&id).unwrap());
    assert!(!queue.dequeue(&id).unwrap());
    assert_eq!(queue.len(), 1);
    assert!(queue.get(&other).is_some());
  }

  #[test]
  fn test_attempt_count_only_moves_on_in_flight() {
    let queue = queue();
    let id = queue
      .enqueue(OperationKind::Update, EntityKind::Hotel, json!({"id": "h1"}))
      .unwrap();

    queue
      .update_status(&id, OperationStatus::Failed, Some("boom".into()))
      .unwrap();
    assert_eq!(queue.get(&id).unwrap().attempt_count, 0);

    queue
      .update_status(&id, OperationStatus::InFlight, None)
      .unwrap();
    let op = queue.get(&id).unwrap();
    assert_eq!(op.attempt_count, 1);
    assert_eq!(op.status, OperationStatus::InFlight);
    assert!(op.last_attempt_at.is_some());
    assert_eq!(op.last_error.as_deref(), Some("boom"));

    assert!(queue
      .update_status("missing", OperationStatus::Pending, None)
      .is_err());
  }

  #[test]
  fn test_exhausted_operations_stay_queued_but_leave_pending_set() {
    let queue = queue();
    let id = queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({}))
      .unwrap();

    for attempt in 1..=3 {
      assert_eq!(queue.list_pending().len(), 1, "attempt {}", attempt);
      queue
        .update_status(&id, OperationStatus::InFlight, None)
        .unwrap();
      queue
        .update_status(&id, OperationStatus::Failed, Some("offline".into()))
        .unwrap();
    }

    assert!(queue.list_pending().is_empty());
    assert_eq!(queue.len(), 1);
    assert_eq!(queue.list_all()[0].status, OperationStatus::Failed);

    assert!(queue.dequeue(&id).unwrap());
    assert!(queue.is_empty());
  }

  #[test]
  fn test_ceiling_is_configurable() {
    let queue = queue().with_max_attempts(1);
    let id = queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({}))
      .unwrap();
    queue
      .update_status(&id, OperationStatus::InFlight, None)
      .unwrap();
    queue
      .update_status(&id, OperationStatus::Failed, None)
      .unwrap();
    assert!(queue.list_pending().is_empty());
  }

  #[test]
  fn test_in_flight_operations_are_not_pending_until_recovered() {
    let queue = queue();
    let id = queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({}))
      .unwrap();
    queue
      .update_status(&id, OperationStatus::InFlight, None)
      .unwrap();
    assert!(queue.list_pending().is_empty());

    assert_eq!(queue.recover_in_flight().unwrap(), 1);
    let op = queue.get(&id).unwrap();
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.attempt_count, 1);
    assert_eq!(queue.recover_in_flight().unwrap(), 0);
  }

  #[test]
  fn test_pending_create_lookup_and_payload_swap() {
    let queue = queue();
    let id = queue
      .push(
        QueuedOperation::new(OperationKind::Create, EntityKind::Expense, json!({"amount": 1}))
          .with_local_id("temp_1"),
      )
      .unwrap();

    let found = queue.pending_create_for("temp_1").unwrap();
    assert_eq!(found.id, id);
    assert!(queue.pending_create_for("temp_2").is_none());

    assert!(queue.replace_payload(&id, json!({"amount": 2})).unwrap());
    assert_eq!(queue.get(&id).unwrap().payload, json!({"amount": 2}));
    assert!(!queue.replace_payload("nope", json!({})).unwrap());
  }

  #[test]
  fn test_queue_survives_in_persisted_layout() {
    let cache = LocalCache::new(MemoryStorage::new());
    let queue = OperationQueue::new(cache.clone());
    queue
      .enqueue(OperationKind::Create, EntityKind::Message, json!({"text": "hi"}))
      .unwrap();

    let raw: Vec<serde_json::Value> = cache.get_item(QUEUE_KEY).unwrap();
    assert_eq!(raw.len(), 1);
    assert_eq!(raw[0]["type"], "create");
    assert_eq!(raw[0]["entity"], "message");

    queue.clear().unwrap();
    assert!(queue.is_empty());
    assert_eq!(cache.get_item::<Vec<serde_json::Value>>(QUEUE_KEY), None);
  }

  #[test]
  fn test_unknown_entry_survives_a_write() {
    let cache = LocalCache::new(MemoryStorage::new());
    let stored = json!([
      {"id": "invoice_1_a", "type": "create", "entity": "invoice", "payload": {},
       "enqueuedAt": 1, "attemptCount": 0, "status": "pending"},
      {"id": "expense_1_b", "type": "create", "entity": "expense", "payload": {"amount": 5},
       "enqueuedAt": 1, "attemptCount": 0, "status": "pending"},
    ]);
    cache.set_item(QUEUE_KEY, &stored).unwrap();
    let queue = OperationQueue::new(cache.clone());

    let ids: Vec<String> = queue.list_pending().into_iter().map(|op| op.id).collect();
    assert_eq!(ids, vec!["expense_1_b".to_string()]);
    assert_eq!(queue.unreadable().len(), 1);
    assert_eq!(queue.len(), 2);

    let added = queue
      .enqueue(OperationKind::Delete, EntityKind::Group, json!({"id": "g1"}))
      .unwrap();
    assert!(queue.dequeue("expense_1_b").unwrap());

    let raw: Vec<Value> = cache.get_item(QUEUE_KEY).unwrap();
    assert_eq!(raw.len(), 2);
    assert_eq!(raw[0]["entity"], "invoice");
    assert_eq!(raw[1]["id"], Value::String(added));
  }

  #[test]
  fn test_unreadable_queue_is_never_overwritten() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set(QUEUE_KEY, "[{\"id\": \"expense_1_b\"").unwrap();
    let queue = OperationQueue::new(LocalCache::from_shared(storage.clone()));

    assert!(!queue.is_readable());
    assert!(queue.list_all().is_empty());
    assert_eq!(queue.recover_in_flight().unwrap(), 0);
    assert!(queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({}))
      .is_err());
    assert_eq!(
      storage.get(QUEUE_KEY).unwrap().as_deref(),
      Some("[{\"id\": \"expense_1_b\"")
    );

    queue.clear().unwrap();
    assert!(queue.is_readable());
    queue
      .enqueue(OperationKind::Create, EntityKind::Expense, json!({}))
      .unwrap();
    assert_eq!(queue.len(), 1);
  }

  #[test]
  fn test_queues_sharing_a_database_file_keep_every_operation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cache.db");
    let first = OperationQueue::new(LocalCache::new(SqliteStorage::open(&path).unwrap()));
    let second = OperationQueue::new(LocalCache::new(SqliteStorage::open(&path).unwrap()));

    let fill = |queue: &OperationQueue| {
      for n in 0..50 {
        queue
          .enqueue(OperationKind::Create, EntityKind::Expense, json!({ "n": n }))
          .unwrap();
      }
    };
    std::thread::scope(|s| {
      s.spawn(|| fill(&first));
      s.spawn(|| fill(&second));
    });

    assert_eq!(first.len(), 100);
    assert_eq!(second.list_pending().len(), 100);
  }
}
