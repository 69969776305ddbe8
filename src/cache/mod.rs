//! Local cache store for entity collections and ad hoc keys.
//!
//! This module provides a durable snapshot cache that:
//! - Keeps one serialized array per collection, plus a `<collection>_meta` record
//! - Bumps the metadata version on every write, atomically with the snapshot
//! - Serves reads as fresh copies and degrades unreadable data to "absent"
//! - Offers whole-collection record helpers (upsert, replace, scoped splice)

mod layer;
mod storage;
mod traits;

pub use layer::LocalCache;
pub(crate) use layer::field_matches;
pub use storage::{KvStorage, MemoryStorage, SqliteStorage};
pub use traits::{
  is_temp_id, new_temp_id, record_id, CacheMetadata, Collection, Record, TEMP_ID_PREFIX,
};
pub(crate) use traits::{now_millis, random_suffix};
