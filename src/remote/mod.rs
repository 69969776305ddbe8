//! Remote system of record.
//!
//! The sync engine only talks to the backend through [`RemoteClient`], so the
//! hosted REST service and test doubles are interchangeable.

mod rest;
#[cfg(test)]
pub(crate) mod stub;

use async_trait::async_trait;
use color_eyre::Result;
use serde_json::Value;

pub use rest::RestClient;

/// CRUD, aggregate and health operations of the hosted backend.
#[async_trait]
pub trait RemoteClient: Send + Sync {
  /// Every row of a table visible to the current session.
  async fn select_all(&self, table: &str) -> Result<Vec<Value>>;

  /// Insert a row and return it as stored, with its assigned id.
  async fn insert(&self, table: &str, record: &Value) -> Result<Value>;

  /// Apply `changes` to the row with `id` and return the updated row.
  async fn update(&self, table: &str, id: &str, changes: &Value) -> Result<Value>;

  async fn delete(&self, table: &str, id: &str) -> Result<()>;

  /// Call a stored function, e.g. the aggregate balance.
  async fn rpc(&self, function: &str, args: &Value) -> Result<Value>;

  /// Cheap round trip used to decide whether the backend is reachable.
  async fn health_check(&self) -> Result<()>;
}
