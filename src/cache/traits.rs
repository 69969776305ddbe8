//! Core types for the local cache.

use chrono::Utc;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

/// An entity record as the remote returns it. The cache treats it as opaque JSON.
pub type Record = Value;

/// Prefix carried by identifiers of records created locally and not yet confirmed.
pub const TEMP_ID_PREFIX: &str = "temp_";

/// A named entity collection cached as one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Collection {
  Expenses,
  Groups,
  Transactions,
  Hotels,
  PaymentMethods,
  Notifications,
  Categories,
  PersonalCategories,
  Balance,
  Settlements,
  Conversations,
  Messages,
}

impl Collection {
  pub const ALL: [Collection; 12] = [
    Collection::Expenses,
    Collection::Groups,
    Collection::Transactions,
    Collection::Hotels,
    Collection::PaymentMethods,
    Collection::Notifications,
    Collection::Categories,
    Collection::PersonalCategories,
    Collection::Balance,
    Collection::Settlements,
    Collection::Conversations,
    Collection::Messages,
  ];

  /// Storage key holding the serialized records.
  pub fn key(self) -> &'static str {
    match self {
      Collection::Expenses => "expenses",
      Collection::Groups => "groups",
      Collection::Transactions => "transactions",
      Collection::Hotels => "hotels",
      Collection::PaymentMethods => "payment_methods",
      Collection::Notifications => "notifications",
      Collection::Categories => "categories",
      Collection::PersonalCategories => "personal_categories",
      Collection::Balance => "balance",
      Collection::Settlements => "settlements",
      Collection::Conversations => "conversations",
      Collection::Messages => "messages",
    }
  }

  /// Storage key holding the collection's [`CacheMetadata`].
  pub fn meta_key(self) -> String {
    format!("{}_meta", self.key())
  }
}

impl fmt::Display for Collection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.key())
  }
}

impl FromStr for Collection {
  type Err = color_eyre::Report;

  fn from_str(s: &str) -> Result<Self> {
    Collection::ALL
      .into_iter()
      .find(|c| c.key() == s)
      .ok_or_else(|| eyre!("Unknown collection: {}", s))
  }
}

/// Per-collection bookkeeping written alongside every snapshot.
///
/// `last_sync` is the wall-clock time (epoch millis) of the last local write,
/// not a remote confirmation time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetadata {
  pub last_sync: i64,
  pub version: u64,
}

/// Extract a record's identifier. The remote hands out both string and numeric ids.
pub fn record_id(record: &Record) -> Option<String> {
  match record.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

pub fn is_temp_id(id: &str) -> bool {
  id.starts_with(TEMP_ID_PREFIX)
}

/// Generate a placeholder identifier for an optimistic record.
pub fn new_temp_id() -> String {
  format!("{}{}_{}", TEMP_ID_PREFIX, now_millis(), random_suffix())
}

pub(crate) fn now_millis() -> i64 {
  Utc::now().timestamp_millis()
}

/// Short random token used to keep generated ids apart without a central counter.
pub(crate) fn random_suffix() -> String {
  let mut s = uuid::Uuid::new_v4().simple().to_string();
  s.truncate(9);
  s
}
