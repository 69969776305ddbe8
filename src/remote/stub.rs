//! Scripted in-memory remote for tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use crate::cache::record_id;

use super::RemoteClient;

#[derive(Default)]
struct State {
  tables: HashMap<String, Vec<Value>>,
  rpc_results: HashMap<String, Value>,
  calls: Vec<String>,
  offline: bool,
  failing_tables: HashSet<String>,
  failures_left: usize,
  next_ids: VecDeque<String>,
  id_counter: u64,
}

/// Remote double recording every call in order.
#[derive(Default)]
pub struct StubRemote {
  state: Mutex<State>,
}

impl StubRemote {
  pub fn new() -> Self {
    Self::default()
  }

  fn state(&self) -> std::sync::MutexGuard<'_, State> {
    self.state.lock().unwrap()
  }

  pub fn with_table(self, table: &str, rows: Vec<Value>) -> Self {
    self.state().tables.insert(table.to_string(), rows);
    self
  }

  pub fn with_rpc(self, function: &str, result: Value) -> Self {
    self
      .state()
      .rpc_results
      .insert(function.to_string(), result);
    self
  }

  pub fn rows(&self, table: &str) -> Vec<Value> {
    self.state().tables.get(table).cloned().unwrap_or_default()
  }

  pub fn calls(&self) -> Vec<String> {
    self.state().calls.clone()
  }

  /// Every call fails while offline.
  pub fn set_offline(&self, offline: bool) {
    self.state().offline = offline;
  }

  /// Calls touching `table` fail until cleared.
  pub fn fail_table(&self, table: &str) {
    self.state().failing_tables.insert(table.to_string());
  }

  /// The next `n` calls fail.
  pub fn fail_next(&self, n: usize) {
    self.state().failures_left = n;
  }

  /// Id to hand out on the next insert.
  pub fn next_id(&self, id: &str) {
    self.state().next_ids.push_back(id.to_string());
  }

  /// Record the call and decide whether it fails. Yields first so concurrent
  /// callers interleave the way they would over a real network.
  async fn enter(&self, call: String, table: &str) -> Result<()> {
    tokio::task::yield_now().await;
    let mut state = self.state();
    state.calls.push(call.clone());

    if state.offline {
      return Err(eyre!("network unreachable"));
    }
    if state.failing_tables.contains(table) {
      return Err(eyre!("server error on {}", table));
    }
    if state.failures_left > 0 {
      state.failures_left -= 1;
      return Err(eyre!("transient failure during {}", call));
    }
    Ok(())
  }
}

#[async_trait]
impl RemoteClient for StubRemote {
  async fn select_all(&self, table: &str) -> Result<Vec<Value>> {
    self.enter(format!("select {}", table), table).await?;
    Ok(self.rows(table))
  }

  async fn insert(&self, table: &str, record: &Value) -> Result<Value> {
    self.enter(format!("insert {}", table), table).await?;
    let mut state = self.state();
    let id = match state.next_ids.pop_front() {
      Some(id) => id,
      None => {
        state.id_counter += 1;
        format!("srv-{}", state.id_counter)
      }
    };

    let mut row = record.clone();
    let object = row
      .as_object_mut()
      .ok_or_else(|| eyre!("insert expects an object"))?;
    object.insert("id".to_string(), Value::String(id));

    state
      .tables
      .entry(table.to_string())
      .or_default()
      .push(row.clone());
    Ok(row)
  }

  async fn update(&self, table: &str, id: &str, changes: &Value) -> Result<Value> {
    self.enter(format!("update {} {}", table, id), table).await?;
    let mut state = self.state();
    let row = state
      .tables
      .get_mut(table)
      .and_then(|rows| rows.iter_mut().find(|r| record_id(r).as_deref() == Some(id)))
      .ok_or_else(|| eyre!("no row {} in {}", id, table))?;

    if let (Some(target), Some(fields)) = (row.as_object_mut(), changes.as_object()) {
      for (field, value) in fields {
        target.insert(field.clone(), value.clone());
      }
    }
    Ok(row.clone())
  }

  async fn delete(&self, table: &str, id: &str) -> Result<()> {
    self.enter(format!("delete {} {}", table, id), table).await?;
    if let Some(rows) = self.state().tables.get_mut(table) {
      rows.retain(|r| record_id(r).as_deref() != Some(id));
    }
    Ok(())
  }

  async fn rpc(&self, function: &str, _args: &Value) -> Result<Value> {
    self.enter(format!("rpc {}", function), function).await?;
    Ok(
      self
        .state()
        .rpc_results
        .get(function)
        .cloned()
        .unwrap_or(Value::Null),
    )
  }

  async fn health_check(&self) -> Result<()> {
    self.enter("health".to_string(), "").await
  }
}
