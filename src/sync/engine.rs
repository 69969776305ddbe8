use chrono::{DateTime, Utc};
use color_eyre::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cache::{now_millis, Collection, LocalCache};
use crate::queue::{OperationQueue, OperationStatus, QueuedOperation};
use crate::remote::RemoteClient;

use super::backoff::RetryPolicy;
use super::dispatch::DispatchTable;
use super::reconcile;
use super::refresh::{rpc_records, Source, REFRESH_PLAN};
use super::status::{most_recent, ErrorLog, Listeners, Subscription, SyncStatus, TimedError};

/// Storage key of the last completed sync, in epoch millis.
pub const LAST_SYNC_KEY: &str = "last_sync_time";

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainResult {
  pub success_count: usize,
  pub failed_count: usize,
}

/// The only component that talks to the remote on behalf of queued and
/// cached data.
///
/// At most one drain runs at a time; a second `process_queue` call while one
/// is running returns an empty result instead of waiting. Operations are sent
/// strictly one after another, in enqueue order.
pub struct SyncEngine {
  cache: LocalCache,
  queue: OperationQueue,
  remote: Arc<dyn RemoteClient>,
  dispatch: DispatchTable,
  retry: RetryPolicy,
  draining: AtomicBool,
  refreshing: AtomicUsize,
  listeners: Listeners,
  changes: Listeners<Collection>,
  errors: ErrorLog,
}

/// Clears the drain flag however the drain ends, including cancellation.
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

struct RefreshGuard<'a>(&'a AtomicUsize);

impl<'a> RefreshGuard<'a> {
  fn enter(counter: &'a AtomicUsize) -> Self {
    counter.fetch_add(1, Ordering::AcqRel);
    Self(counter)
  }
}

impl Drop for RefreshGuard<'_> {
  fn drop(&mut self) {
    self.0.fetch_sub(1, Ordering::AcqRel);
  }
}

impl SyncEngine {
  /// Create the engine and requeue anything a previous run left in flight.
  pub fn new(cache: LocalCache, remote: Arc<dyn RemoteClient>, retry: RetryPolicy) -> Result<Self> {
    let queue = OperationQueue::new(cache.clone()).with_max_attempts(retry.max_attempts);
    queue.recover_in_flight()?;

    Ok(Self {
      cache,
      queue,
      remote,
      dispatch: DispatchTable::new(),
      retry,
      draining: AtomicBool::new(false),
      refreshing: AtomicUsize::new(0),
      listeners: Listeners::default(),
      changes: Listeners::default(),
      errors: ErrorLog::default(),
    })
  }

  pub fn cache(&self) -> &LocalCache {
    &self.cache
  }

  pub fn queue(&self) -> &OperationQueue {
    &self.queue
  }

  pub fn retry_policy(&self) -> RetryPolicy {
    self.retry
  }

  // ==========================================================================
  // Queue mutations. Each one may change the status, so each one notifies.
  // ==========================================================================

  pub fn enqueue(&self, operation: QueuedOperation) -> Result<String> {
    let id = self.queue.push(operation)?;
    self.notify();
    Ok(id)
  }

  pub fn dequeue(&self, operation_id: &str) -> Result<bool> {
    let removed = self.queue.dequeue(operation_id)?;
    self.notify();
    Ok(removed)
  }

  pub fn update_status(
    &self,
    operation_id: &str,
    status: OperationStatus,
    error: Option<String>,
  ) -> Result<()> {
    self.queue.update_status(operation_id, status, error)?;
    self.notify();
    Ok(())
  }

  pub fn clear_queue(&self) -> Result<()> {
    self.queue.clear()?;
    self.notify();
    Ok(())
  }

  /// Merge `changes` into the queued create of the unconfirmed record
  /// `local_id`. Returns false when no such create is waiting.
  pub fn fold_into_pending_create(&self, local_id: &str, changes: &Value) -> Result<bool> {
    let Some(create) = self.queue.pending_create_for(local_id) else {
      return Ok(false);
    };

    let mut payload = create.payload;
    if let (Some(target), Some(fields)) = (payload.as_object_mut(), changes.as_object()) {
      for (field, value) in fields {
        if field != "id" {
          target.insert(field.clone(), value.clone());
        }
      }
    }

    let replaced = self.queue.replace_payload(&create.id, payload)?;
    debug!(op_id = %create.id, local_id, "folded change into pending create");
    self.notify();
    Ok(replaced)
  }

  /// Drop the queued create of the unconfirmed record `local_id`, so a record
  /// deleted before it ever reached the remote is never sent.
  pub fn drop_pending_create(&self, local_id: &str) -> Result<bool> {
    match self.queue.pending_create_for(local_id) {
      Some(create) => self.dequeue(&create.id),
      None => Ok(false),
    }
  }

  /// Wipe every cached collection, the queue and engine errors.
  pub fn sign_out(&self) -> Result<()> {
    self.cache.clear()?;
    self.errors.clear();
    info!("local state cleared for sign-out");
    for collection in Collection::ALL {
      self.collection_changed(collection);
    }
    self.notify();
    Ok(())
  }

  // ==========================================================================
  // Remote traffic
  // ==========================================================================

  /// Deliver one operation right away, outside the queue, and reconcile the
  /// cache with the response.
  pub async fn send_now(&self, operation: &QueuedOperation) -> Result<Option<Value>> {
    self.deliver(operation).await
  }

  async fn deliver(&self, operation: &QueuedOperation) -> Result<Option<Value>> {
    let confirmed = self
      .dispatch
      .deliver(self.remote.as_ref(), operation)
      .await?;

    // The remote accepted the write; a local hiccup here must not cause a resend
    match reconcile::apply_confirmation(&self.cache, operation, confirmed.as_ref()) {
      Ok(()) => self.collection_changed(operation.entity.collection()),
      Err(e) => {
        warn!(op_id = %operation.id, error = %e, "failed to reconcile cache after confirmation")
      }
    }
    Ok(confirmed)
  }

  /// Send every eligible queued operation once, in FIFO order.
  pub async fn process_queue(&self) -> DrainResult {
    if self
      .draining
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("drain already running");
      return DrainResult::default();
    }

    let result = {
      let _guard = DrainGuard(&self.draining);
      self.notify();
      self.drain().await
    };
    self.notify();
    result
  }

  async fn drain(&self) -> DrainResult {
    let pending = self.queue.list_pending();
    let mut result = DrainResult::default();
    if pending.is_empty() {
      return result;
    }
    info!(count = pending.len(), "draining sync queue");

    for op in pending {
      if op.is_exhausted(self.retry.max_attempts) {
        result.failed_count += 1;
        continue;
      }

      let delay = self.retry.delay_for(op.attempt_count);
      if !delay.is_zero() {
        debug!(op_id = %op.id, ?delay, "backing off before retry");
        tokio::time::sleep(delay).await;
      }

      if let Err(e) = self.update_status(&op.id, OperationStatus::InFlight, None) {
        warn!(op_id = %op.id, error = %e, "could not start operation");
        result.failed_count += 1;
        continue;
      }
      // Changes folded in since the snapshot are sent too
      let op = self.queue.get(&op.id).unwrap_or(op);

      match self.deliver(&op).await {
        Ok(_) => {
          result.success_count += 1;
          info!(op_id = %op.id, kind = %op.kind, entity = %op.entity, "operation synced");
          let finished = self
            .update_status(&op.id, OperationStatus::Synced, None)
            .and_then(|_| self.dequeue(&op.id));
          if let Err(e) = finished {
            error!(op_id = %op.id, error = %e, "failed to remove synced operation");
          }
        }
        Err(e) => {
          result.failed_count += 1;
          warn!(
            op_id = %op.id,
            kind = %op.kind,
            entity = %op.entity,
            attempt = op.attempt_count + 1,
            error = %e,
            "operation failed"
          );
          let message = format!("{:#}", e);
          if let Err(e) = self.update_status(&op.id, OperationStatus::Failed, Some(message)) {
            error!(op_id = %op.id, error = %e, "failed to record operation failure");
          }
        }
      }
    }

    self.mark_synced();
    info!(
      success = result.success_count,
      failed = result.failed_count,
      "drain finished"
    );
    result
  }

  /// Replace every tracked collection with the remote's copy.
  ///
  /// All collections are fetched before any is written, so a failure part
  /// way through leaves the whole cache as it was.
  pub async fn sync_from_server(&self) -> Result<()> {
    let result = {
      let _guard = RefreshGuard::enter(&self.refreshing);
      self.notify();
      self.refresh_all().await
    };

    if let Err(e) = &result {
      warn!(error = %e, "full refresh failed");
      self
        .errors
        .push(now_millis(), format!("refresh failed: {:#}", e));
    }
    self.notify();
    result
  }

  async fn refresh_all(&self) -> Result<()> {
    let mut fetched = Vec::with_capacity(REFRESH_PLAN.len());

    for (collection, source) in REFRESH_PLAN {
      let records = match source {
        Source::Table(table) => self.remote.select_all(table).await,
        Source::Rpc(function) => self.remote.rpc(function, &json!({})).await.map(rpc_records),
      }
      .map_err(|e| e.wrap_err(format!("Failed to refresh {}", collection)))?;

      debug!(%collection, count = records.len(), "fetched");
      fetched.push((collection, records));
    }

    for (collection, records) in &fetched {
      self.cache.set(*collection, records)?;
    }
    for (collection, _) in &fetched {
      self.collection_changed(*collection);
    }

    self.mark_synced();
    info!(collections = fetched.len(), "full refresh complete");
    Ok(())
  }

  /// Pull the remote state, then push queued operations on top of it.
  pub async fn full_sync(&self) -> Result<DrainResult> {
    self.sync_from_server().await?;
    Ok(self.process_queue().await)
  }

  // ==========================================================================
  // Status
  // ==========================================================================

  pub fn last_sync_time(&self) -> Option<DateTime<Utc>> {
    self
      .cache
      .get_item::<i64>(LAST_SYNC_KEY)
      .and_then(DateTime::<Utc>::from_timestamp_millis)
  }

  fn mark_synced(&self) {
    if let Err(e) = self.cache.set_item(LAST_SYNC_KEY, &now_millis()) {
      warn!(error = %e, "failed to record sync time");
    }
  }

  /// Current status, derived from the queue and engine state.
  pub fn get_sync_status(&self) -> SyncStatus {
    let operations = self.queue.list_all();
    let unreadable = self.queue.unreadable().len();

    let mut errors: Vec<TimedError> = operations
      .iter()
      .filter(|op| op.status == OperationStatus::Failed)
      .filter_map(|op| {
        op.last_error.as_ref().map(|e| TimedError {
          at: op.last_attempt_at.unwrap_or(op.enqueued_at),
          message: format!("{} {} failed: {}", op.kind, op.entity, e),
        })
      })
      .collect();
    errors.extend(self.errors.snapshot());
    if unreadable > 0 {
      errors.push(TimedError {
        at: now_millis(),
        message: format!("{} queued operations could not be read", unreadable),
      });
    }
    if !self.queue.is_readable() {
      errors.push(TimedError {
        at: now_millis(),
        message: "sync queue is unreadable, clear it to queue changes again".to_string(),
      });
    }

    SyncStatus {
      is_syncing: self.draining.load(Ordering::Acquire)
        || self.refreshing.load(Ordering::Acquire) > 0,
      pending_count: operations.len() + unreadable,
      last_sync_time: self.last_sync_time(),
      errors: most_recent(errors),
    }
  }

  /// Call `listener` with the new status every time it may have changed.
  pub fn subscribe<F>(&self, listener: F) -> Subscription
  where
    F: Fn(&SyncStatus) + Send + Sync + 'static,
  {
    self.listeners.add(Arc::new(listener))
  }

  /// Call `listener` with each collection whose cached records change
  /// through the engine or a mutation.
  pub fn on_collection_change<F>(&self, listener: F) -> Subscription
  where
    F: Fn(Collection) + Send + Sync + 'static,
  {
    self
      .changes
      .add(Arc::new(move |collection: &Collection| listener(*collection)))
  }

  pub(crate) fn collection_changed(&self, collection: Collection) {
    self.changes.notify(&collection);
  }

  fn notify(&self) {
    if self.listeners.is_empty() {
      return;
    }
    let status = self.get_sync_status();
    self.listeners.notify(&status);
  }
}
