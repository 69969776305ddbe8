//! Offline-first sync core for a shared-expense client.
//!
//! Mutations are applied to a local cache at once and delivered to the
//! hosted backend either directly or, when that is not possible, through a
//! persisted operation queue drained by the [`sync::SyncEngine`].

pub mod cache;
pub mod config;
pub mod mutations;
pub mod network;
pub mod projection;
pub mod queue;
pub mod remote;
pub mod sync;
