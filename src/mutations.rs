//! Optimistic writes with queue fallback.
//!
//! Every mutation lands in the cache first. When the device is online it is
//! then sent straight to the remote; when offline, or when the direct call
//! fails, it is queued for the next drain instead.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cache::{is_temp_id, new_temp_id, Collection, Record};
use crate::network::NetworkMonitor;
use crate::queue::{EntityKind, OperationKind, QueuedOperation};
use crate::sync::SyncEngine;

/// What became of a mutation after its optimistic cache write.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
  /// The remote accepted it; carries the authoritative record, if any
  Confirmed(Option<Record>),
  /// Queued under this operation id
  Queued(String),
  /// Absorbed by a still-queued create of the same record
  Coalesced,
}

pub struct OfflineMutator {
  engine: Arc<SyncEngine>,
  network: Arc<NetworkMonitor>,
}

impl OfflineMutator {
  pub fn new(engine: Arc<SyncEngine>, network: Arc<NetworkMonitor>) -> Self {
    Self { engine, network }
  }

  pub fn engine(&self) -> &SyncEngine {
    &self.engine
  }

  /// Create a record under a temporary id. Returns the id and the outcome.
  pub async fn create(&self, entity: EntityKind, fields: Value) -> Result<(String, Outcome)> {
    let mut record = into_object(fields, entity)?;
    let local_id = new_temp_id();
    record.insert("id".to_string(), Value::String(local_id.clone()));
    let record = Value::Object(record);

    self
      .engine
      .cache()
      .upsert_record(entity.collection(), record.clone())?;
    self.engine.collection_changed(entity.collection());
    debug!(%entity, %local_id, "optimistic create");

    let op = QueuedOperation::new(OperationKind::Create, entity, record).with_local_id(&local_id);
    let outcome = self.submit(op).await?;
    Ok((local_id, outcome))
  }

  /// Apply `changes` to the record with `id`.
  pub async fn update(&self, entity: EntityKind, id: &str, changes: Value) -> Result<Outcome> {
    let changes = Value::Object(into_object(changes, entity)?);
    let collection = entity.collection();

    if is_temp_id(id) {
      if !self.engine.fold_into_pending_create(id, &changes)? {
        return Err(eyre!(
          "{} {} is not known to the server yet and has no queued create",
          entity,
          id
        ));
      }
      self.engine.cache().merge_record(collection, id, &changes)?;
      self.engine.collection_changed(collection);
      return Ok(Outcome::Coalesced);
    }

    self.engine.cache().merge_record(collection, id, &changes)?;
    self.engine.collection_changed(collection);

    let mut payload = changes;
    if let Some(object) = payload.as_object_mut() {
      object.insert("id".to_string(), Value::String(id.to_string()));
    }
    self
      .submit(QueuedOperation::new(OperationKind::Update, entity, payload))
      .await
  }

  /// Delete the record with `id`.
  pub async fn delete(&self, entity: EntityKind, id: &str) -> Result<Outcome> {
    self
      .engine
      .cache()
      .remove_record(entity.collection(), id)?;
    self.engine.collection_changed(entity.collection());

    if is_temp_id(id) {
      self.engine.drop_pending_create(id)?;
      return Ok(Outcome::Coalesced);
    }

    self
      .submit(QueuedOperation::new(
        OperationKind::Delete,
        entity,
        json!({ "id": id }),
      ))
      .await
  }

  /// Send a chat message, showing it in the conversation immediately.
  pub async fn send_message(
    &self,
    conversation_id: &str,
    sender_id: &str,
    text: &str,
  ) -> Result<(String, Outcome)> {
    let local_id = new_temp_id();
    let message = json!({
      "id": local_id,
      "conversation_id": conversation_id,
      "sender_id": sender_id,
      "text": text,
      "created_at": Utc::now().to_rfc3339(),
    });

    self
      .engine
      .cache()
      .upsert_record(Collection::Messages, message.clone())?;
    self.engine.collection_changed(Collection::Messages);

    let op = QueuedOperation::new(OperationKind::Create, EntityKind::Message, message)
      .with_local_id(&local_id);
    let outcome = self.submit(op).await?;
    Ok((local_id, outcome))
  }

  /// Drop every piece of local state. Errors surface so an incomplete
  /// sign-out is never silent.
  pub fn sign_out(&self) -> Result<()> {
    self.engine.sign_out()
  }

  async fn submit(&self, op: QueuedOperation) -> Result<Outcome> {
    if self.network.is_online() {
      match self.engine.send_now(&op).await {
        Ok(confirmed) => return Ok(Outcome::Confirmed(confirmed)),
        Err(e) => {
          warn!(kind = %op.kind, entity = %op.entity, error = %e, "direct send failed, queueing");
        }
      }
    }

    let id = self.engine.enqueue(op)?;
    Ok(Outcome::Queued(id))
  }
}

fn into_object(value: Value, entity: EntityKind) -> Result<Map<String, Value>> {
  match value {
    Value::Object(map) => Ok(map),
    other => Err(eyre!("{} fields must be a JSON object, got {}", entity, other)),
  }
}
