//! Dispatch table from `(OperationKind, EntityKind)` to the remote call that
//! delivers it.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::collections::HashMap;

use crate::cache::is_temp_id;
use crate::queue::{EntityKind, OperationKind, QueuedOperation};
use crate::remote::RemoteClient;

/// Delivers one operation. Resolves to the authoritative record for creates
/// and updates, `None` for deletes.
pub type Handler =
  for<'a> fn(&'a dyn RemoteClient, &'a QueuedOperation) -> BoxFuture<'a, Result<Option<Value>>>;

pub struct DispatchTable {
  handlers: HashMap<(OperationKind, EntityKind), Handler>,
}

impl Default for DispatchTable {
  fn default() -> Self {
    Self::new()
  }
}

impl DispatchTable {
  /// Build the table for every tag pair.
  pub fn new() -> Self {
    let mut handlers = HashMap::new();
    for entity in EntityKind::ALL {
      for kind in OperationKind::ALL {
        handlers.insert((kind, entity), handler_for(kind, entity));
      }
    }
    Self { handlers }
  }

  pub fn len(&self) -> usize {
    self.handlers.len()
  }

  pub fn is_empty(&self) -> bool {
    self.handlers.is_empty()
  }

  /// Send `op` through its handler.
  pub async fn deliver(
    &self,
    remote: &dyn RemoteClient,
    op: &QueuedOperation,
  ) -> Result<Option<Value>> {
    let handler = self
      .handlers
      .get(&(op.kind, op.entity))
      .ok_or_else(|| eyre!("No handler for {} {}", op.kind, op.entity))?;
    handler(remote, op).await
  }
}

fn handler_for(kind: OperationKind, entity: EntityKind) -> Handler {
  match (kind, entity) {
    // Only the sender's copy exists locally; the server stamps the time
    (OperationKind::Create, EntityKind::Message) => create_message,
    (OperationKind::Create, _) => create_record,
    (OperationKind::Update, _) => update_record,
    (OperationKind::Delete, _) => delete_record,
  }
}

/// Payload without a placeholder id, which the remote must never see.
fn insert_body(op: &QueuedOperation) -> Value {
  let mut body = op.payload.clone();
  if let Some(object) = body.as_object_mut() {
    let temp = object
      .get("id")
      .and_then(Value::as_str)
      .is_some_and(is_temp_id);
    if temp {
      object.remove("id");
    }
  }
  body
}

fn target_id(op: &QueuedOperation) -> Result<String> {
  let id = op
    .target_id()
    .ok_or_else(|| eyre!("{} {} has no target id", op.kind, op.entity))?;
  if is_temp_id(&id) {
    return Err(eyre!(
      "{} {} targets {}, which the remote has not assigned yet",
      op.kind,
      op.entity,
      id
    ));
  }
  Ok(id)
}

fn create_record<'a>(
  remote: &'a dyn RemoteClient,
  op: &'a QueuedOperation,
) -> BoxFuture<'a, Result<Option<Value>>> {
  async move {
    let body = insert_body(op);
    remote.insert(op.entity.table(), &body).await.map(Some)
  }
  .boxed()
}

fn create_message<'a>(
  remote: &'a dyn RemoteClient,
  op: &'a QueuedOperation,
) -> BoxFuture<'a, Result<Option<Value>>> {
  async move {
    let mut body = insert_body(op);
    if let Some(object) = body.as_object_mut() {
      object.remove("created_at");
    }
    remote.insert(op.entity.table(), &body).await.map(Some)
  }
  .boxed()
}

fn update_record<'a>(
  remote: &'a dyn RemoteClient,
  op: &'a QueuedOperation,
) -> BoxFuture<'a, Result<Option<Value>>> {
  async move {
    let id = target_id(op)?;
    let mut changes = op.payload.clone();
    if let Some(object) = changes.as_object_mut() {
      object.remove("id");
    }
    remote
      .update(op.entity.table(), &id, &changes)
      .await
      .map(Some)
  }
  .boxed()
}

fn delete_record<'a>(
  remote: &'a dyn RemoteClient,
  op: &'a QueuedOperation,
) -> BoxFuture<'a, Result<Option<Value>>> {
  async move {
    let id = target_id(op)?;
    remote.delete(op.entity.table(), &id).await.map(|_| None)
  }
  .boxed()
}
