//! Cache layer over a key/value backend: collection snapshots, metadata and
//! whole-collection record helpers.

use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::KvStorage;
use super::traits::{now_millis, record_id, CacheMetadata, Collection, Record};

/// Local cache of entity collections.
///
/// Every read produces a fresh copy and every write replaces a whole
/// collection. Reads never fail: a missing or unreadable value is `None`,
/// because the remote is the source of truth. Writes propagate errors, since
/// a failed write means the mutation did not durably happen.
#[derive(Clone)]
pub struct LocalCache {
  storage: Arc<dyn KvStorage>,
}

impl LocalCache {
  /// Create a new cache over the given storage backend.
  pub fn new<S: KvStorage + 'static>(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  /// Create a cache over a backend that other handles also hold.
  pub fn from_shared(storage: Arc<dyn KvStorage>) -> Self {
    Self { storage }
  }

  /// Read and deserialize an arbitrary key.
  pub fn get_item<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
    let raw = match self.storage.get(key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed");
        return None;
      }
    };

    match serde_json::from_str(&raw) {
      Ok(value) => Some(value),
      Err(e) => {
        warn!(key, error = %e, "discarding unreadable cache entry");
        None
      }
    }
  }

  /// The stored text of a key, with backend failures surfaced.
  pub fn get_raw(&self, key: &str) -> Result<Option<String>> {
    self.storage.get(key)
  }

  /// Serialize and write an arbitrary key.
  pub fn set_item<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
    let raw =
      serde_json::to_string(value).map_err(|e| eyre!("Failed to serialize {}: {}", key, e))?;
    self.storage.set(key, &raw)
  }

  /// Atomically rewrite the raw value of `key`; see [`KvStorage::update`].
  pub fn update_raw(
    &self,
    key: &str,
    f: &mut dyn FnMut(Option<String>) -> Result<Option<String>>,
  ) -> Result<()> {
    self.storage.update(key, f)
  }

  pub fn remove(&self, key: &str) -> Result<()> {
    self.storage.remove(key)
  }

  /// Remove all persisted state. Failures surface: an incomplete sign-out
  /// must not look like a successful one.
  pub fn clear(&self) -> Result<()> {
    self.storage.clear()?;
    debug!("cache cleared");
    Ok(())
  }

  /// Cached records of a collection, if any snapshot exists.
  pub fn get(&self, collection: Collection) -> Option<Vec<Record>> {
    self.get_item(collection.key())
  }

  /// Cached records of a collection, empty when nothing is cached.
  pub fn records(&self, collection: Collection) -> Vec<Record> {
    self.get(collection).unwrap_or_default()
  }

  pub fn metadata(&self, collection: Collection) -> Option<CacheMetadata> {
    self.get_item(&collection.meta_key())
  }

  /// Metadata as the write path sees it: absent is the default, but an
  /// unreadable value is an error so its version is never reset.
  fn stored_metadata(&self, collection: Collection) -> Result<CacheMetadata> {
    let key = collection.meta_key();
    match self.storage.get(&key)? {
      None => Ok(CacheMetadata::default()),
      Some(raw) => serde_json::from_str(&raw).map_err(|e| {
        eyre!(
          "Metadata {} is unreadable, refusing to restart its version: {}",
          key,
          e
        )
      }),
    }
  }

  /// Overwrite a collection snapshot and bump its metadata in one write.
  pub fn set(&self, collection: Collection, records: &[Record]) -> Result<CacheMetadata> {
    let previous = self.stored_metadata(collection)?;
    let metadata = CacheMetadata {
      last_sync: now_millis(),
      version: previous.version + 1,
    };

    let records_raw = serde_json::to_string(records)
      .map_err(|e| eyre!("Failed to serialize {}: {}", collection, e))?;
    let meta_raw = serde_json::to_string(&metadata)
      .map_err(|e| eyre!("Failed to serialize {} metadata: {}", collection, e))?;

    self.storage.set_many(&[
      (collection.key().to_string(), records_raw),
      (collection.meta_key(), meta_raw),
    ])?;

    debug!(
      %collection,
      count = records.len(),
      version = metadata.version,
      "collection written"
    );
    Ok(metadata)
  }

  /// Replace the record with the same id, or append it when absent.
  pub fn upsert_record(&self, collection: Collection, record: Record) -> Result<()> {
    let id = record_id(&record).ok_or_else(|| eyre!("Record in {} has no id", collection))?;
    let mut records = self.records(collection);

    match records
      .iter_mut()
      .find(|r| record_id(r).as_deref() == Some(id.as_str()))
    {
      Some(existing) => *existing = record,
      None => records.push(record),
    }

    self.set(collection, &records).map(|_| ())
  }

  /// Apply a partial change to a cached record. Returns whether it was found.
  pub fn merge_record(&self, collection: Collection, id: &str, changes: &Record) -> Result<bool> {
    let mut records = self.records(collection);
    let Some(existing) = records
      .iter_mut()
      .find(|r| record_id(r).as_deref() == Some(id))
    else {
      return Ok(false);
    };

    if let (Some(target), Some(fields)) = (existing.as_object_mut(), changes.as_object()) {
      for (field, value) in fields {
        if field != "id" {
          target.insert(field.clone(), value.clone());
        }
      }
    }

    self.set(collection, &records)?;
    Ok(true)
  }

  /// Remove a record by id. Returns whether anything was removed.
  pub fn remove_record(&self, collection: Collection, id: &str) -> Result<bool> {
    let mut records = self.records(collection);
    let before = records.len();
    records.retain(|r| record_id(r).as_deref() != Some(id));

    if records.len() == before {
      return Ok(false);
    }
    self.set(collection, &records)?;
    Ok(true)
  }

  /// Swap the record identified by `old_id` for `record`, keeping its position.
  ///
  /// Any other copy already carrying the new id is dropped so the swap never
  /// produces a duplicate. Returns false (and writes nothing) when `old_id`
  /// is not cached.
  pub fn replace_record(&self, collection: Collection, old_id: &str, record: Record) -> Result<bool> {
    let mut records = self.records(collection);
    let Some(position) = records
      .iter()
      .position(|r| record_id(r).as_deref() == Some(old_id))
    else {
      return Ok(false);
    };

    let new_id = record_id(&record);
    records[position] = record;
    if let Some(new_id) = new_id.filter(|id| id != old_id) {
      let mut index = 0;
      records.retain(|r| {
        let keep = index == position || record_id(r).as_deref() != Some(new_id.as_str());
        index += 1;
        keep
      });
    }

    self.set(collection, &records)?;
    Ok(true)
  }

  /// Replace every record whose `scope_field` equals `scope_value` with
  /// `replacement`, leaving the rest of the collection untouched.
  pub fn replace_scoped(
    &self,
    collection: Collection,
    scope_field: &str,
    scope_value: &str,
    replacement: &[Record],
  ) -> Result<()> {
    let mut records: Vec<Record> = self
      .records(collection)
      .into_iter()
      .filter(|r| !field_matches(r, scope_field, scope_value))
      .collect();
    records.extend_from_slice(replacement);

    self.set(collection, &records).map(|_| ())
  }

  /// Messages of one conversation, in cached order.
  pub fn messages_for_conversation(&self, conversation_id: &str) -> Vec<Record> {
    self
      .records(Collection::Messages)
      .into_iter()
      .filter(|m| field_matches(m, "conversation_id", conversation_id))
      .collect()
  }

  /// Replace one conversation's messages.
  pub fn set_conversation_messages(&self, conversation_id: &str, messages: &[Record]) -> Result<()> {
    self.replace_scoped(
      Collection::Messages,
      "conversation_id",
      conversation_id,
      messages,
    )
  }
}

/// Whether `record[field]` equals `value`, comparing numbers by their text.
pub(crate) fn field_matches(record: &Record, field: &str, value: &str) -> bool {
  match record.get(field) {
    Some(serde_json::Value::String(s)) => s == value,
    Some(serde_json::Value::Number(n)) => n.to_string() == value,
    _ => false,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{MemoryStorage, SqliteStorage};
  use serde_json::json;

  fn cache() -> LocalCache {
    LocalCache::new(MemoryStorage::new())
  }

  #[test]
  fn test_set_then_get_returns_same_records() {
    let cache = LocalCache::new(SqliteStorage::open_in_memory().unwrap());
    let records = vec![
      json!({"id": "e1", "description": "Pizza", "amount": 20}),
      json!({"id": "e2", "description": "Taxi", "amount": 12.5, "tags": ["work"]}),
    ];

    cache.set(Collection::Expenses, &records).unwrap();
    assert_eq!(cache.get(Collection::Expenses), Some(records));
    assert_eq!(cache.get(Collection::Groups), None);
  }

  #[test]
  fn test_version_increments_once_per_write() {
    let cache = cache();
    assert_eq!(cache.metadata(Collection::Groups), None);

    for n in 1..=5 {
      let meta = cache.set(Collection::Groups, &[json!({"id": n})]).unwrap();
      assert_eq!(meta.version, n);
    }
    let meta = cache.metadata(Collection::Groups).unwrap();
    assert_eq!(meta.version, 5);
    assert!(meta.last_sync > 0);
    // Other collections keep their own counters
    assert_eq!(cache.metadata(Collection::Expenses), None);
  }

  #[test]
  fn test_corrupt_entry_reads_as_absent() {
    let storage = MemoryStorage::new();
    storage.set("expenses", "{not json").unwrap();
    let cache = LocalCache::new(storage);

    assert_eq!(cache.get(Collection::Expenses), None);
    assert!(cache.records(Collection::Expenses).is_empty());
  }

  #[test]
  fn test_unreadable_metadata_blocks_version_reset() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = LocalCache {
      storage: storage.clone(),
    };
    cache.set(Collection::Groups, &[json!({"id": "g1"})]).unwrap();
    storage.set("groups_meta", "{\"lastSync\": 1, \"vers").unwrap();

    assert!(cache.set(Collection::Groups, &[]).is_err());
    assert_eq!(
      cache.records(Collection::Groups),
      vec![json!({"id": "g1"})]
    );

    storage
      .set("groups_meta", r#"{"lastSync": 1, "version": 41}"#)
      .unwrap();
    assert_eq!(cache.set(Collection::Groups, &[]).unwrap().version, 42);
  }

  #[test]
  fn test_write_failure_propagates() {
    let storage = Arc::new(MemoryStorage::new());
    let cache = LocalCache {
      storage: storage.clone(),
    };
    storage.set_fail_writes(true);

    assert!(cache.set(Collection::Expenses, &[]).is_err());
    assert!(cache.clear().is_err());
  }

  #[test]
  fn test_upsert_merge_and_remove() {
    let cache = cache();
    cache
      .upsert_record(Collection::Groups, json!({"id": "g1", "name": "Trip"}))
      .unwrap();
    cache
      .upsert_record(Collection::Groups, json!({"id": "g2", "name": "Flat"}))
      .unwrap();
    cache
      .upsert_record(Collection::Groups, json!({"id": "g1", "name": "Ski trip"}))
      .unwrap();

    assert!(cache
      .merge_record(Collection::Groups, "g2", &json!({"id": "ignored", "name": "House"}))
      .unwrap());
    assert!(!cache
      .merge_record(Collection::Groups, "g9", &json!({"name": "x"}))
      .unwrap());

    assert_eq!(
      cache.records(Collection::Groups),
      vec![
        json!({"id": "g1", "name": "Ski trip"}),
        json!({"id": "g2", "name": "House"}),
      ]
    );

    assert!(cache.remove_record(Collection::Groups, "g1").unwrap());
    assert!(!cache.remove_record(Collection::Groups, "g1").unwrap());
    assert_eq!(cache.records(Collection::Groups).len(), 1);
  }

  #[test]
  fn test_replace_record_keeps_position_and_avoids_duplicates() {
    let cache = cache();
    cache
      .set(
        Collection::Expenses,
        &[
          json!({"id": "e1"}),
          json!({"id": "temp_1", "description": "Pizza"}),
          json!({"id": "e3"}),
          json!({"id": "e2", "description": "Pizza"}),
        ],
      )
      .unwrap();

    let replaced = cache
      .replace_record(
        Collection::Expenses,
        "temp_1",
        json!({"id": "e2", "description": "Pizza"}),
      )
      .unwrap();
    assert!(replaced);
    assert_eq!(
      cache.records(Collection::Expenses),
      vec![
        json!({"id": "e1"}),
        json!({"id": "e2", "description": "Pizza"}),
        json!({"id": "e3"}),
      ]
    );

    assert!(!cache
      .replace_record(Collection::Expenses, "temp_404", json!({"id": "e4"}))
      .unwrap());
  }

  #[test]
  fn test_replace_scoped_only_touches_matching_scope() {
    let cache = cache();
    cache
      .set(
        Collection::Messages,
        &[
          json!({"id": "m1", "conversation_id": "c1", "text": "old"}),
          json!({"id": "m2", "conversation_id": "c2", "text": "keep"}),
          json!({"id": "m3", "conversation_id": "c1", "text": "old too"}),
        ],
      )
      .unwrap();

    cache
      .set_conversation_messages(
        "c1",
        &[json!({"id": "m4", "conversation_id": "c1", "text": "new"})],
      )
      .unwrap();

    assert_eq!(
      cache.messages_for_conversation("c1"),
      vec![json!({"id": "m4", "conversation_id": "c1", "text": "new"})]
    );
    assert_eq!(
      cache.messages_for_conversation("c2"),
      vec![json!({"id": "m2", "conversation_id": "c2", "text": "keep"})]
    );
  }

  #[test]
  fn test_clear_drops_everything() {
    let cache = cache();
    cache.set(Collection::Expenses, &[json!({"id": 1})]).unwrap();
    cache.set_item("sync_queue", &Vec::<u8>::new()).unwrap();

    cache.clear().unwrap();
    assert_eq!(cache.get(Collection::Expenses), None);
    assert_eq!(cache.metadata(Collection::Expenses), None);
    assert_eq!(cache.get_item::<Vec<u8>>("sync_queue"), None);
  }
}
