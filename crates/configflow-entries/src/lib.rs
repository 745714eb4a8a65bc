//! Config entries
//!
//! This crate provides the durable half of the config flow engine: the
//! [`ConfigEntry`] records a successful flow produces, their lifecycle
//! state machine, and the indexed [`ConfigEntryStore`] that enforces the
//! one-entry-per-(domain, unique_id) invariant.
//!
//! # Key Types
//!
//! - [`ConfigEntry`] - A single integration configuration
//! - [`ConfigEntryState`] - Lifecycle state of an entry
//! - [`ConfigEntryStore`] - Indexed registry of all entries
//!
//! # Storage
//!
//! Entries are persisted in `.storage/core.config_entries` with version
//! tracking, written atomically.

pub mod entry;
pub mod state_machine;
pub mod storage;
pub mod store;

pub use entry::{
    ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryUpdate, DataMap,
};

pub use state_machine::{calculate_retry_delay, InvalidTransition};

pub use storage::{Storable, Storage, StorageError, StorageFile, StorageResult};

pub use store::{
    ConfigEntriesData, ConfigEntriesError, ConfigEntriesResult, ConfigEntryStore, STORAGE_KEY,
    STORAGE_MINOR_VERSION, STORAGE_VERSION,
};
