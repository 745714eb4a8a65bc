//! Config entry types
//!
//! A ConfigEntry is the durable record a successful config flow produces:
//! the credentials/connection parameters (`data`) plus user-tunable
//! `options` for one instance of an integration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::state_machine::InvalidTransition;

/// Map type used for entry data and options
pub type DataMap = HashMap<String, serde_json::Value>;

/// Config entry lifecycle state
///
/// Transitions are driven by the setup/unload collaborators, not by the
/// flow engine; see [`crate::state_machine`] for the valid transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntryState {
    /// Initial state, not yet set up
    #[default]
    NotLoaded,
    /// Successfully set up
    Loaded,
    /// Setup failed
    SetupError,
    /// Waiting to retry setup
    SetupRetry,
    /// Unload failed (not recoverable)
    FailedUnload,
}

impl ConfigEntryState {
    /// Check if the entry can be unloaded/reloaded from this state
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, ConfigEntryState::FailedUnload)
    }
}

/// Source that initiated the flow which produced (or targets) an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConfigEntrySource {
    /// Configured via UI/API
    #[default]
    User,
    /// Imported from YAML config
    Import,
    /// Generic discovery
    Discovery,
    /// DHCP discovery
    Dhcp,
    /// UPnP/SSDP discovery
    Ssdp,
    /// mDNS/Bonjour discovery
    Zeroconf,
    /// Bluetooth device discovery
    Bluetooth,
    /// MQTT announcement discovery
    Mqtt,
    /// User hiding a discovery
    Ignore,
    /// Re-authentication of an existing entry
    Reauth,
    /// User reconfiguring an existing entry
    Reconfigure,
}

impl ConfigEntrySource {
    /// Whether this source is a discovery protocol
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            ConfigEntrySource::Discovery
                | ConfigEntrySource::Dhcp
                | ConfigEntrySource::Ssdp
                | ConfigEntrySource::Zeroconf
                | ConfigEntrySource::Bluetooth
                | ConfigEntrySource::Mqtt
        )
    }
}

/// A configuration entry for an integration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigEntry {
    /// Unique identifier (ULID)
    pub entry_id: String,

    /// Integration domain (e.g., "hue", "mqtt")
    pub domain: String,

    /// Human-readable display name
    pub title: String,

    /// Immutable-by-convention configuration data; replaced wholesale on reauth
    #[serde(default)]
    pub data: DataMap,

    /// User-configurable options, mutated only through an options flow
    #[serde(default)]
    pub options: DataMap,

    /// Optional identifier for duplicate prevention
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,

    /// Origin of the flow that created the entry
    #[serde(default)]
    pub source: ConfigEntrySource,

    /// Major schema version
    #[serde(default = "default_version")]
    pub version: u32,

    /// Minor schema version
    #[serde(default = "default_version")]
    pub minor_version: u32,

    /// Current lifecycle state (not persisted)
    #[serde(skip, default)]
    pub state: ConfigEntryState,

    /// Human-readable explanation for failed states
    #[serde(skip, default)]
    pub reason: Option<String>,

    /// Creation timestamp
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    /// Last modification timestamp
    #[serde(default = "Utc::now")]
    pub modified_at: DateTime<Utc>,
}

fn default_version() -> u32 {
    1
}

impl ConfigEntry {
    /// Create a new config entry
    pub fn new(domain: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            entry_id: ulid::Ulid::new().to_string(),
            domain: domain.into(),
            title: title.into(),
            data: DataMap::new(),
            options: DataMap::new(),
            unique_id: None,
            source: ConfigEntrySource::User,
            version: 1,
            minor_version: 1,
            state: ConfigEntryState::NotLoaded,
            reason: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Set entry data
    pub fn with_data(mut self, data: DataMap) -> Self {
        self.data = data;
        self
    }

    /// Set entry options
    pub fn with_options(mut self, options: DataMap) -> Self {
        self.options = options;
        self
    }

    /// Set unique_id
    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }

    /// Set source
    pub fn with_source(mut self, source: ConfigEntrySource) -> Self {
        self.source = source;
        self
    }

    /// Set version
    pub fn with_version(mut self, version: u32, minor_version: u32) -> Self {
        self.version = version;
        self.minor_version = minor_version;
        self
    }

    /// Check if entry is loaded
    pub fn is_loaded(&self) -> bool {
        self.state == ConfigEntryState::Loaded
    }

    /// Check if this entry was created by a user ignoring a discovery
    pub fn is_ignored(&self) -> bool {
        self.source == ConfigEntrySource::Ignore
    }

    /// Attempt to transition to a new state with validation.
    ///
    /// Returns an error if the transition is invalid according to the FSM
    /// rules. On success, updates the state and reason fields.
    pub fn try_set_state(
        &mut self,
        new_state: ConfigEntryState,
        reason: Option<String>,
    ) -> Result<(), InvalidTransition> {
        self.state.try_transition(new_state)?;
        self.state = new_state;
        self.reason = reason;
        Ok(())
    }
}

/// Partial update for a config entry
#[derive(Debug, Default)]
pub struct ConfigEntryUpdate {
    pub title: Option<String>,
    pub data: Option<DataMap>,
    pub options: Option<DataMap>,
    pub unique_id: Option<Option<String>>,
    pub version: Option<u32>,
    pub minor_version: Option<u32>,
}

impl ConfigEntryUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn data(mut self, data: DataMap) -> Self {
        self.data = Some(data);
        self
    }

    pub fn options(mut self, options: DataMap) -> Self {
        self.options = Some(options);
        self
    }

    pub fn unique_id(mut self, unique_id: Option<String>) -> Self {
        self.unique_id = Some(unique_id);
        self
    }
}
