//! Queued mutation intents and their tags.

use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::cache::{now_millis, random_suffix, record_id, Collection};

/// What a queued operation does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
  Create,
  Update,
  Delete,
}

impl OperationKind {
  pub const ALL: [OperationKind; 3] = [
    OperationKind::Create,
    OperationKind::Update,
    OperationKind::Delete,
  ];

  pub fn as_str(self) -> &'static str {
    match self {
      OperationKind::Create => "create",
      OperationKind::Update => "update",
      OperationKind::Delete => "delete",
    }
  }
}

impl fmt::Display for OperationKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Entity type a queued operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
  Expense,
  Group,
  Transaction,
  Hotel,
  PaymentMethod,
  Notification,
  Category,
  PersonalCategory,
  Settlement,
  Conversation,
  Message,
}

impl EntityKind {
  pub const ALL: [EntityKind; 11] = [
    EntityKind::Expense,
    EntityKind::Group,
    EntityKind::Transaction,
    EntityKind::Hotel,
    EntityKind::PaymentMethod,
    EntityKind::Notification,
    EntityKind::Category,
    EntityKind::PersonalCategory,
    EntityKind::Settlement,
    EntityKind::Conversation,
    EntityKind::Message,
  ];

  /// Tag used in operation ids and on the command line.
  pub fn tag(self) -> &'static str {
    match self {
      EntityKind::Expense => "expense",
      EntityKind::Group => "group",
      EntityKind::Transaction => "transaction",
      EntityKind::Hotel => "hotel",
      EntityKind::PaymentMethod => "payment_method",
      EntityKind::Notification => "notification",
      EntityKind::Category => "category",
      EntityKind::PersonalCategory => "personal_category",
      EntityKind::Settlement => "settlement",
      EntityKind::Conversation => "conversation",
      EntityKind::Message => "message",
    }
  }

  /// Remote table holding this entity.
  pub fn table(self) -> &'static str {
    match self {
      EntityKind::Expense => "expenses",
      EntityKind::Group => "groups",
      EntityKind::Transaction => "personal_transactions",
      EntityKind::Hotel => "hotels",
      EntityKind::PaymentMethod => "payment_methods",
      EntityKind::Notification => "notifications",
      EntityKind::Category => "categories",
      EntityKind::PersonalCategory => "personal_categories",
      EntityKind::Settlement => "settlements",
      EntityKind::Conversation => "conversations",
      EntityKind::Message => "messages",
    }
  }

  /// Local collection mirroring this entity.
  pub fn collection(self) -> Collection {
    match self {
      EntityKind::Expense => Collection::Expenses,
      EntityKind::Group => Collection::Groups,
      EntityKind::Transaction => Collection::Transactions,
      EntityKind::Hotel => Collection::Hotels,
      EntityKind::PaymentMethod => Collection::PaymentMethods,
      EntityKind::Notification => Collection::Notifications,
      EntityKind::Category => Collection::Categories,
      EntityKind::PersonalCategory => Collection::PersonalCategories,
      EntityKind::Settlement => Collection::Settlements,
      EntityKind::Conversation => Collection::Conversations,
      EntityKind::Message => Collection::Messages,
    }
  }
}

impl fmt::Display for EntityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.tag())
  }
}

impl FromStr for EntityKind {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    EntityKind::ALL
      .into_iter()
      .find(|e| e.tag() == s)
      .ok_or_else(|| eyre!("Unknown entity type: {}", s))
  }
}

/// Delivery state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OperationStatus {
  Pending,
  InFlight,
  Synced,
  Failed,
}

impl fmt::Display for OperationStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      OperationStatus::Pending => "pending",
      OperationStatus::InFlight => "in-flight",
      OperationStatus::Synced => "synced",
      OperationStatus::Failed => "failed",
    })
  }
}

/// A persisted intent to mutate remote state.
///
/// `payload` carries everything needed to replay the call without re-reading
/// local state: the full record for creates, `id` plus changed fields for
/// updates, `id` alone for deletes. `local_id` is the placeholder id of the
/// optimistic record a create produced, used to correlate the confirmation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
  pub id: String,
  #[serde(rename = "type")]
  pub kind: OperationKind,
  pub entity: EntityKind,
  pub payload: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub local_id: Option<String>,
  pub enqueued_at: i64,
  pub attempt_count: u32,
  pub status: OperationStatus,
  #[serde(default)]
  pub last_error: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_attempt_at: Option<i64>,
}

impl QueuedOperation {
  pub fn new(kind: OperationKind, entity: EntityKind, payload: Value) -> Self {
    Self {
      id: operation_id(entity),
      kind,
      entity,
      payload,
      local_id: None,
      enqueued_at: now_millis(),
      attempt_count: 0,
      status: OperationStatus::Pending,
      last_error: None,
      last_attempt_at: None,
    }
  }

  /// Attach the placeholder id of the optimistic record this create stands for.
  pub fn with_local_id(mut self, local_id: impl Into<String>) -> Self {
    self.local_id = Some(local_id.into());
    self
  }

  /// Remote id of the record an update or delete targets.
  pub fn target_id(&self) -> Option<String> {
    record_id(&self.payload)
  }

  /// Whether the operation reached the retry ceiling.
  pub fn is_exhausted(&self, max_attempts: u32) -> bool {
    self.attempt_count >= max_attempts
  }
}

/// `<entity>_<millis>_<suffix>`: unique without a central counter.
pub fn operation_id(entity: EntityKind) -> String {
  format!("{}_{}_{}", entity.tag(), now_millis(), random_suffix())
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_operation_id_format() {
    let id = operation_id(EntityKind::PaymentMethod);
    assert!(id.starts_with("payment_method_"));
    let suffix = id.rsplit('_').next().unwrap();
    assert_eq!(suffix.len(), 9);
    assert_ne!(id, operation_id(EntityKind::PaymentMethod));
  }

  #[test]
  fn test_serialized_layout() {
    let op = QueuedOperation::new(
      OperationKind::Update,
      EntityKind::Expense,
      json!({"id": "e1", "amount": 5}),
    );
    let value = serde_json::to_value(&op).unwrap();

    assert_eq!(value["type"], "update");
    assert_eq!(value["entity"], "expense");
    assert_eq!(value["status"], "pending");
    assert_eq!(value["attemptCount"], 0);
    assert!(value.get("enqueuedAt").is_some());
    assert!(value.get("localId").is_none());

    let back: QueuedOperation = serde_json::from_value(value).unwrap();
    assert_eq!(back, op);
    assert_eq!(back.target_id().as_deref(), Some("e1"));
  }

  #[test]
  fn test_in_flight_status_tag() {
    assert_eq!(
      serde_json::to_value(OperationStatus::InFlight).unwrap(),
      json!("in-flight")
    );
  }

  #[test]
  fn test_entity_tags_parse_back() {
    for entity in EntityKind::ALL {
      assert_eq!(entity.tag().parse::<EntityKind>().unwrap(), entity);
    }
    assert!("invoice".parse::<EntityKind>().is_err());
  }
}
