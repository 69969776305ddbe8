//! Folding confirmed remote responses back into the cache.

use color_eyre::Result;
use serde_json::Value;
use tracing::debug;

use crate::cache::{field_matches, is_temp_id, record_id, Collection, LocalCache, Record};
use crate::queue::{EntityKind, OperationKind, QueuedOperation};

/// Fields that identify an optimistic message when no correlation id exists.
const MESSAGE_MATCH_FIELDS: [&str; 3] = ["conversation_id", "sender_id", "text"];

/// Apply the authoritative outcome of `op` to the cache.
pub fn apply_confirmation(
  cache: &LocalCache,
  op: &QueuedOperation,
  confirmed: Option<&Record>,
) -> Result<()> {
  let collection = op.entity.collection();

  match (op.kind, confirmed) {
    (OperationKind::Create, Some(record)) => reconcile_create(cache, collection, op, record),
    (OperationKind::Update, Some(record)) => cache.upsert_record(collection, record.clone()),
    (OperationKind::Delete, _) => match op.target_id() {
      Some(id) => cache.remove_record(collection, &id).map(|_| ()),
      None => Ok(()),
    },
    (_, None) => Ok(()),
  }
}

/// Replace the optimistic copy of a created record with the confirmed one.
///
/// The placeholder is found by the operation's correlation id. Operations
/// queued without one fall back, for messages only, to matching a temporary
/// record by content. When no placeholder is left (a full refresh may have
/// dropped it) the record is upserted by its new id.
fn reconcile_create(
  cache: &LocalCache,
  collection: Collection,
  op: &QueuedOperation,
  record: &Record,
) -> Result<()> {
  if let Some(local_id) = &op.local_id {
    if cache.replace_record(collection, local_id, record.clone())? {
      debug!(%collection, %local_id, "optimistic record confirmed");
      return Ok(());
    }
  } else if op.entity == EntityKind::Message {
    if let Some(temp_id) = matching_temp_message(cache, record) {
      cache.replace_record(collection, &temp_id, record.clone())?;
      debug!(%temp_id, "optimistic message matched by content");
      return Ok(());
    }
  }

  if record_id(record).is_some() {
    cache.upsert_record(collection, record.clone())?;
  }
  Ok(())
}

/// First temporary message with the same conversation, sender and text.
fn matching_temp_message(cache: &LocalCache, confirmed: &Record) -> Option<String> {
  let conversation_id = confirmed.get("conversation_id").and_then(value_text)?;

  cache
    .messages_for_conversation(&conversation_id)
    .iter()
    .filter_map(|m| record_id(m).map(|id| (id, m)))
    .find(|(id, m)| {
      is_temp_id(id)
        && MESSAGE_MATCH_FIELDS.iter().all(|field| {
          confirmed
            .get(*field)
            .and_then(value_text)
            .is_some_and(|v| field_matches(m, field, &v))
        })
    })
    .map(|(id, _)| id)
}

fn value_text(value: &Value) -> Option<String> {
  match value {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::MemoryStorage;
  use serde_json::json;

  fn cache() -> LocalCache {
    LocalCache::new(MemoryStorage::new())
  }

  #[test]
  fn test_create_replaces_placeholder_by_correlation_id() {
    let cache = cache();
    cache
      .set(
        Collection::Expenses,
        &[json!({"id": "temp_a", "description": "Pizza"}), json!({"id": "e0"})],
      )
      .unwrap();
    let op = QueuedOperation::new(
      OperationKind::Create,
      EntityKind::Expense,
      json!({"description": "Pizza"}),
    )
    .with_local_id("temp_a");

    apply_confirmation(&cache, &op, Some(&json!({"id": "e1", "description": "Pizza"}))).unwrap();

    assert_eq!(
      cache.records(Collection::Expenses),
      vec![json!({"id": "e1", "description": "Pizza"}), json!({"id": "e0"})]
    );
  }

  #[test]
  fn test_identical_messages_are_confirmed_one_for_one() {
    let cache = cache();
    let msg = |id: &str| json!({"id": id, "conversation_id": "c1", "sender_id": "u1", "text": "hi"});
    cache
      .set(Collection::Messages, &[msg("temp_1"), msg("temp_2")])
      .unwrap();

    let second = QueuedOperation::new(OperationKind::Create, EntityKind::Message, json!({}))
      .with_local_id("temp_2");
    apply_confirmation(&cache, &second, Some(&msg("m-2"))).unwrap();

    let first = QueuedOperation::new(OperationKind::Create, EntityKind::Message, json!({}))
      .with_local_id("temp_1");
    apply_confirmation(&cache, &first, Some(&msg("m-1"))).unwrap();

    let ids: Vec<String> = cache
      .messages_for_conversation("c1")
      .iter()
      .filter_map(record_id)
      .collect();
    assert_eq!(ids, vec!["m-1", "m-2"]);
  }

  #[test]
  fn test_message_without_correlation_id_matches_by_content() {
    let cache = cache();
    cache
      .set(
        Collection::Messages,
        &[
          json!({"id": "temp_1", "conversation_id": "c1", "sender_id": "u1", "text": "hi"}),
          json!({"id": "temp_2", "conversation_id": "c1", "sender_id": "u1", "text": "bye"}),
          json!({"id": "m-1", "conversation_id": "c2", "sender_id": "u1", "text": "hi"}),
        ],
      )
      .unwrap();
    let op = QueuedOperation::new(
      OperationKind::Create,
      EntityKind::Message,
      json!({"conversation_id": "c1", "sender_id": "u1", "text": "hi"}),
    );
    let confirmed = json!({"id": "m-99", "conversation_id": "c1", "sender_id": "u1", "text": "hi"});

    apply_confirmation(&cache, &op, Some(&confirmed)).unwrap();

    let c1 = cache.messages_for_conversation("c1");
    assert_eq!(c1.len(), 2);
    assert_eq!(c1[0], confirmed);
    assert_eq!(record_id(&c1[1]).as_deref(), Some("temp_2"));
  }

  #[test]
  fn test_create_without_placeholder_upserts() {
    let cache = cache();
    cache
      .set(Collection::Groups, &[json!({"id": "g1", "name": "Trip"})])
      .unwrap();
    let op = QueuedOperation::new(OperationKind::Create, EntityKind::Group, json!({}))
      .with_local_id("temp_gone");

    // Refresh already brought the row in; no duplicate appears
    apply_confirmation(&cache, &op, Some(&json!({"id": "g1", "name": "Trip"}))).unwrap();
    apply_confirmation(&cache, &op, Some(&json!({"id": "g2", "name": "Flat"}))).unwrap();

    let ids: Vec<String> = cache
      .records(Collection::Groups)
      .iter()
      .filter_map(record_id)
      .collect();
    assert_eq!(ids, vec!["g1", "g2"]);
  }

  #[test]
  fn test_update_and_delete_follow_the_server() {
    let cache = cache();
    cache
      .set(
        Collection::Hotels,
        &[json!({"id": "h1", "name": "local"}), json!({"id": "h2"})],
      )
      .unwrap();

    let update =
      QueuedOperation::new(OperationKind::Update, EntityKind::Hotel, json!({"id": "h1"}));
    apply_confirmation(&cache, &update, Some(&json!({"id": "h1", "name": "server"}))).unwrap();

    let delete =
      QueuedOperation::new(OperationKind::Delete, EntityKind::Hotel, json!({"id": "h2"}));
    apply_confirmation(&cache, &delete, None).unwrap();

    assert_eq!(
      cache.records(Collection::Hotels),
      vec![json!({"id": "h1", "name": "server"})]
    );
  }
}
