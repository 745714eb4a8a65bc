//! Config entry store
//!
//! Indexed registry of all config entries. Enforces the core dedup
//! invariant: at most one non-ignored entry per (domain, unique_id).

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use crate::entry::{ConfigEntry, ConfigEntryState, ConfigEntryUpdate, DataMap};
use crate::storage::{Storable, Storage, StorageFile, StorageResult};

/// Storage key for config entries
pub const STORAGE_KEY: &str = "core.config_entries";
/// Current storage version
pub const STORAGE_VERSION: u32 = 1;
/// Current minor version
pub const STORAGE_MINOR_VERSION: u32 = 1;

/// Capacity of the reload broadcast channel
const RELOAD_CHANNEL_CAPACITY: usize = 64;

/// Config entry store errors
#[derive(Debug, Error)]
pub enum ConfigEntriesError {
    #[error("Entry not found: {0}")]
    NotFound(String),

    #[error("Entry already exists for domain {domain} with unique_id {unique_id}")]
    AlreadyExists { domain: String, unique_id: String },

    #[error("Storage error: {0}")]
    Storage(#[from] crate::storage::StorageError),

    #[error(transparent)]
    InvalidTransition(#[from] crate::state_machine::InvalidTransition),
}

pub type ConfigEntriesResult<T> = Result<T, ConfigEntriesError>;

/// Config entries payload for storage
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigEntriesData {
    /// All config entries
    pub entries: Vec<ConfigEntry>,
}

impl Storable for ConfigEntriesData {
    const KEY: &'static str = STORAGE_KEY;
    const VERSION: u32 = STORAGE_VERSION;
    const MINOR_VERSION: u32 = STORAGE_MINOR_VERSION;
}

/// Config entry store
///
/// Owns the set of durable entries and their lookup indexes. The flow
/// engine creates/updates entries through this store; the (out-of-scope)
/// setup subsystem listens on the reload channel to re-set-up entries
/// whose data changed behind their back.
pub struct ConfigEntryStore {
    /// Storage backend
    storage: Arc<Storage>,

    /// Primary index: entry_id -> ConfigEntry
    entries: DashMap<String, ConfigEntry>,

    /// Index: domain -> set of entry_ids
    by_domain: DashMap<String, HashSet<String>>,

    /// Index: (domain, unique_id) -> entry_id
    ///
    /// Insertion through the entry API is the atomic claim that upholds
    /// the one-entry-per-unique-id invariant under concurrent adds.
    by_unique_id: DashMap<(String, String), String>,

    /// Reload requests for entries whose data changed
    reload_tx: broadcast::Sender<String>,

    /// Serializes snapshot-and-write so a slow save cannot clobber a
    /// newer one on disk
    save_lock: Mutex<()>,
}

impl ConfigEntryStore {
    /// Create a new config entry store
    pub fn new(storage: Arc<Storage>) -> Self {
        let (reload_tx, _) = broadcast::channel(RELOAD_CHANNEL_CAPACITY);
        Self {
            storage,
            entries: DashMap::new(),
            by_domain: DashMap::new(),
            by_unique_id: DashMap::new(),
            reload_tx,
            save_lock: Mutex::new(()),
        }
    }

    /// Load entries from storage
    pub async fn load(&self) -> StorageResult<()> {
        if let Some(storage_file) = self.storage.load::<ConfigEntriesData>(STORAGE_KEY).await? {
            info!(
                "Loading {} config entries from storage (v{}.{})",
                storage_file.data.entries.len(),
                storage_file.version,
                storage_file.minor_version
            );

            for entry in storage_file.data.entries {
                self.index_entry(entry);
            }
        }
        Ok(())
    }

    /// Save entries to storage
    ///
    /// One snapshot-and-write at a time; every mutation that completed
    /// before the final save starts is in the snapshot it writes.
    pub async fn save(&self) -> StorageResult<()> {
        let _guard = self.save_lock.lock().await;

        let data = ConfigEntriesData {
            entries: self.entries.iter().map(|r| r.value().clone()).collect(),
        };

        let storage_file =
            StorageFile::new(STORAGE_KEY, data, STORAGE_VERSION, STORAGE_MINOR_VERSION);

        self.storage.save(&storage_file).await?;
        debug!("Saved {} config entries to storage", self.entries.len());
        Ok(())
    }

    /// Index an entry without a unique_id claim check
    fn index_entry(&self, entry: ConfigEntry) {
        let entry_id = entry.entry_id.clone();

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry_id.clone());

        if let Some(ref unique_id) = entry.unique_id {
            self.by_unique_id
                .insert((entry.domain.clone(), unique_id.clone()), entry_id.clone());
        }

        self.entries.insert(entry_id, entry);
    }

    /// Remove an entry from all indexes
    fn unindex_entry(&self, entry: &ConfigEntry) {
        if let Some(mut ids) = self.by_domain.get_mut(&entry.domain) {
            ids.remove(&entry.entry_id);
        }

        if let Some(ref unique_id) = entry.unique_id {
            // Only drop the claim if it still points at this entry
            self.by_unique_id
                .remove_if(&(entry.domain.clone(), unique_id.clone()), |_, id| {
                    id == &entry.entry_id
                });
        }

        self.entries.remove(&entry.entry_id);
    }

    /// Get an entry by ID
    pub fn get(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id).map(|r| r.value().clone())
    }

    /// Get all entries for a domain
    pub fn get_by_domain(&self, domain: &str) -> Vec<ConfigEntry> {
        self.by_domain
            .get(domain)
            .map(|ids| ids.iter().filter_map(|id| self.get(id)).collect())
            .unwrap_or_default()
    }

    /// Get entry by (domain, unique_id)
    pub fn get_by_unique_id(&self, domain: &str, unique_id: &str) -> Option<ConfigEntry> {
        self.by_unique_id
            .get(&(domain.to_string(), unique_id.to_string()))
            .and_then(|entry_id| self.get(&entry_id))
    }

    /// Check whether the domain has any entries
    ///
    /// Entries created by ignoring a discovery are skipped unless
    /// `include_ignore` is set.
    pub fn has_entries(&self, domain: &str, include_ignore: bool) -> bool {
        self.get_by_domain(domain)
            .iter()
            .any(|e| include_ignore || !e.is_ignored())
    }

    /// Check whether any non-ignored entry's data or options is a superset
    /// of `match_data`
    ///
    /// Used by flows for domains whose devices have no natural unique id
    /// (matching on host+port tuples and the like).
    pub fn entries_match(&self, domain: &str, match_data: &DataMap) -> bool {
        self.get_by_domain(domain).iter().any(|entry| {
            !entry.is_ignored()
                && match_data
                    .iter()
                    .all(|(k, v)| entry.data.get(k) == Some(v) || entry.options.get(k) == Some(v))
        })
    }

    /// Add a new config entry
    ///
    /// The (domain, unique_id) slot is claimed atomically: when two flows
    /// race to create the same device, exactly one add succeeds and the
    /// loser gets `AlreadyExists`.
    pub async fn add(&self, entry: ConfigEntry) -> ConfigEntriesResult<ConfigEntry> {
        if let Some(ref unique_id) = entry.unique_id {
            let key = (entry.domain.clone(), unique_id.clone());
            match self.by_unique_id.entry(key) {
                Entry::Occupied(_) => {
                    return Err(ConfigEntriesError::AlreadyExists {
                        domain: entry.domain.clone(),
                        unique_id: unique_id.clone(),
                    });
                }
                Entry::Vacant(slot) => {
                    slot.insert(entry.entry_id.clone());
                }
            }
        }

        self.by_domain
            .entry(entry.domain.clone())
            .or_default()
            .insert(entry.entry_id.clone());
        self.entries.insert(entry.entry_id.clone(), entry.clone());

        if let Err(err) = self.save().await {
            // An unacknowledged entry must not stay live in memory
            self.unindex_entry(&entry);
            return Err(err.into());
        }

        info!(
            "Added config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry.entry_id
        );

        Ok(entry)
    }

    /// Update an existing entry
    pub async fn update(
        &self,
        entry_id: &str,
        update: ConfigEntryUpdate,
    ) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);

        let mut updated = entry.clone();
        if let Some(title) = update.title {
            updated.title = title;
        }
        if let Some(data) = update.data {
            updated.data = data;
        }
        if let Some(options) = update.options {
            updated.options = options;
        }
        if let Some(unique_id) = update.unique_id {
            updated.unique_id = unique_id;
        }
        if let Some(version) = update.version {
            updated.version = version;
        }
        if let Some(minor_version) = update.minor_version {
            updated.minor_version = minor_version;
        }
        updated.modified_at = Utc::now();

        self.index_entry(updated.clone());

        if let Err(err) = self.save().await {
            self.unindex_entry(&updated);
            self.index_entry(entry);
            return Err(err.into());
        }

        debug!("Updated config entry: {}", entry_id);
        Ok(updated)
    }

    /// Merge partial updates into an entry's data
    ///
    /// Returns whether the data actually changed. Used by the dedup guard
    /// so a re-discovered device with a changed host updates the existing
    /// entry instead of erroring.
    pub async fn merge_data(
        &self,
        entry_id: &str,
        updates: &DataMap,
    ) -> ConfigEntriesResult<bool> {
        let rollback = {
            let mut entry = self
                .entries
                .get_mut(entry_id)
                .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

            let before = (entry.data.clone(), entry.modified_at);
            let mut changed = false;
            for (key, value) in updates {
                if entry.data.get(key) != Some(value) {
                    entry.data.insert(key.clone(), value.clone());
                    changed = true;
                }
            }
            if changed {
                entry.modified_at = Utc::now();
                Some(before)
            } else {
                None
            }
        };

        let Some((old_data, old_modified_at)) = rollback else {
            return Ok(false);
        };

        if let Err(err) = self.save().await {
            if let Some(mut entry) = self.entries.get_mut(entry_id) {
                entry.data = old_data;
                entry.modified_at = old_modified_at;
            }
            return Err(err.into());
        }

        debug!("Merged data updates into config entry: {}", entry_id);
        Ok(true)
    }

    /// Remove an entry
    pub async fn remove(&self, entry_id: &str) -> ConfigEntriesResult<ConfigEntry> {
        let entry = self
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        self.unindex_entry(&entry);

        if let Err(err) = self.save().await {
            self.index_entry(entry.clone());
            return Err(err.into());
        }

        info!(
            "Removed config entry: {} ({}) [{}]",
            entry.title, entry.domain, entry_id
        );

        Ok(entry)
    }

    /// Set entry state, validated by the lifecycle state machine
    pub fn set_state(
        &self,
        entry_id: &str,
        state: ConfigEntryState,
        reason: Option<String>,
    ) -> ConfigEntriesResult<()> {
        let mut entry = self
            .entries
            .get_mut(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        entry.try_set_state(state, reason)?;
        debug!("Entry {} state changed to {:?}", entry_id, state);
        Ok(())
    }

    /// Request a reload of an entry's platforms
    ///
    /// Fired when entry data changed out-of-band (dedup updates, reauth);
    /// the setup subsystem subscribes and performs the actual reload.
    pub fn schedule_reload(&self, entry_id: &str) {
        debug!("Scheduling reload for config entry: {}", entry_id);
        // Send errors just mean nobody is listening yet
        let _ = self.reload_tx.send(entry_id.to_string());
    }

    /// Subscribe to reload requests
    pub fn subscribe_reloads(&self) -> broadcast::Receiver<String> {
        self.reload_tx.subscribe()
    }

    /// Get all entry IDs
    pub fn entry_ids(&self) -> Vec<String> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }

    /// Get all domains with entries
    pub fn domains(&self) -> Vec<String> {
        self.by_domain.iter().map(|r| r.key().clone()).collect()
    }

    /// Get count of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over all entries
    pub fn iter(&self) -> impl Iterator<Item = ConfigEntry> + '_ {
        self.entries.iter().map(|r| r.value().clone())
    }
}
