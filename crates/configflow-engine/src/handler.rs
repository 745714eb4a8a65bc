//! Flow handler contract and per-step context
//!
//! Integrations implement [`ConfigFlowHandler`] once per domain. Each step
//! receives a [`FlowCtx`] granting access to the flow's own context and the
//! unique-id dedup guard; state carried between steps lives in the
//! handler's own typed fields.

use async_trait::async_trait;
use std::collections::HashMap;

use configflow_entries::{
    ConfigEntry, ConfigEntrySource, ConfigEntryState, ConfigEntryStore, ConfigEntryUpdate, DataMap,
};

use crate::context::FlowContext;
use crate::error::{AbortFlow, StepError, StepResult};
use crate::result::{
    reason, FlowResult, StepId, STEP_DISCOVERY, STEP_IMPORT, STEP_REAUTH, STEP_RECONFIGURE,
    STEP_USER,
};

/// Input submitted by the user for one form step
pub type UserInput = HashMap<String, serde_json::Value>;

/// Per-domain flow handler
///
/// The first-display convention applies to every step: invoked with
/// `user_input == None`, a step must return the `Form` for that same step
/// so the caller can render it; invoked with input, it validates and
/// either re-shows the form with errors, chains to the next step's form,
/// or returns a terminal result.
#[async_trait]
pub trait ConfigFlowHandler: Send {
    /// The step table this handler supports
    ///
    /// The manager refuses to route to, or pause at, a step not listed
    /// here; a result naming an undeclared step kills the flow.
    fn steps(&self) -> &'static [StepId];

    /// Schema version stamped on entries this handler creates
    fn version(&self) -> (u32, u32) {
        (1, 1)
    }

    /// Whether this integration supports only a single config entry
    fn single_config_entry(&self) -> bool {
        false
    }

    /// Map a flow source to its dedicated entry-point step
    fn init_step(&self, source: ConfigEntrySource) -> StepId {
        match source {
            ConfigEntrySource::User | ConfigEntrySource::Ignore => STEP_USER,
            ConfigEntrySource::Import => STEP_IMPORT,
            ConfigEntrySource::Reauth => STEP_REAUTH,
            ConfigEntrySource::Reconfigure => STEP_RECONFIGURE,
            _ => STEP_DISCOVERY,
        }
    }

    /// Run one step of the flow
    async fn handle_step(
        &mut self,
        ctx: &mut FlowCtx<'_>,
        step: StepId,
        user_input: Option<UserInput>,
    ) -> StepResult;
}

/// Factory building a fresh handler for each new flow
pub type FlowFactory =
    std::sync::Arc<dyn Fn() -> Box<dyn ConfigFlowHandler> + Send + Sync + 'static>;

/// Factory building an options-flow handler for an existing entry
pub type OptionsFlowFactory =
    std::sync::Arc<dyn Fn(&ConfigEntry) -> Box<dyn ConfigFlowHandler> + Send + Sync + 'static>;

/// Snapshot of another in-progress flow for the same domain
#[derive(Debug, Clone)]
pub struct FlowPeer {
    pub flow_id: String,
    pub source: ConfigEntrySource,
    pub unique_id: Option<String>,
}

/// Context handed into every step invocation
///
/// Borrows the flow's mutable [`FlowContext`], the entry store, and a
/// best-effort snapshot of sibling flows taken just before dispatch.
pub struct FlowCtx<'a> {
    pub(crate) flow_id: &'a str,
    pub(crate) domain: &'a str,
    /// The flow's own mutable context
    pub context: &'a mut FlowContext,
    pub(crate) entries: &'a ConfigEntryStore,
    pub(crate) peers: &'a [FlowPeer],
}

impl<'a> FlowCtx<'a> {
    pub fn flow_id(&self) -> &str {
        self.flow_id
    }

    pub fn domain(&self) -> &str {
        self.domain
    }

    pub fn source(&self) -> ConfigEntrySource {
        self.context.source
    }

    /// The unique id claimed so far, if any
    pub fn unique_id(&self) -> Option<&str> {
        self.context.unique_id.as_deref()
    }

    /// The entry targeted by a reauth/reconfigure flow
    pub fn entry_id(&self) -> Option<&str> {
        self.context.entry_id.as_deref()
    }

    /// Other in-progress flows for this domain (best-effort snapshot)
    pub fn peers(&self) -> &[FlowPeer] {
        self.peers
    }

    /// Look up an existing entry by id
    pub fn get_entry(&self, entry_id: &str) -> Option<ConfigEntry> {
        self.entries.get(entry_id)
    }

    /// Whether this domain already has entries
    pub fn has_current_entries(&self, include_ignore: bool) -> bool {
        self.entries.has_entries(self.domain, include_ignore)
    }

    /// Claim a unique id for this flow
    ///
    /// With `raise_on_progress`, aborts this (newer) flow with
    /// `already_in_progress` when a sibling flow already claims the same
    /// id. Returns the existing entry with that unique id, if any, so
    /// callers can prefill or compare.
    pub fn set_unique_id(
        &mut self,
        unique_id: impl Into<String>,
        raise_on_progress: bool,
    ) -> Result<Option<ConfigEntry>, AbortFlow> {
        let unique_id = unique_id.into();

        if raise_on_progress
            && self
                .peers
                .iter()
                .any(|peer| peer.unique_id.as_deref() == Some(unique_id.as_str()))
        {
            return Err(AbortFlow::new(reason::ALREADY_IN_PROGRESS));
        }

        let existing = self.entries.get_by_unique_id(self.domain, &unique_id);
        self.context.unique_id = Some(unique_id);
        Ok(existing)
    }

    /// Abort when the claimed unique id is already configured
    ///
    /// When `updates` is given, merges it into the existing entry's data
    /// first; if the data actually changed (or a discovery just proved a
    /// retrying entry is back online) a reload of that entry is scheduled
    /// so the new data takes effect. Ignored entries don't block a manual
    /// user flow.
    pub async fn abort_if_unique_id_configured(
        &mut self,
        updates: Option<&DataMap>,
        error: &str,
    ) -> Result<(), StepError> {
        let Some(unique_id) = self.context.unique_id.clone() else {
            return Ok(());
        };
        let Some(entry) = self.entries.get_by_unique_id(self.domain, &unique_id) else {
            return Ok(());
        };

        // Allow ignored entries to be configured on the manual user step
        if entry.is_ignored() && self.context.source == ConfigEntrySource::User {
            return Ok(());
        }

        let mut should_reload = false;
        if let Some(updates) = updates {
            if self.entries.merge_data(&entry.entry_id, updates).await?
                && matches!(
                    entry.state,
                    ConfigEntryState::Loaded | ConfigEntryState::SetupRetry
                )
            {
                should_reload = true;
            }
        }
        if self.context.source.is_discovery() && entry.state == ConfigEntryState::SetupRetry {
            // Discovery just proved the device is online again
            should_reload = true;
        }
        if should_reload {
            self.entries.schedule_reload(&entry.entry_id);
        }

        Err(AbortFlow::new(error).into())
    }

    /// Abort when an existing entry's data/options is a superset of
    /// `match_data`
    ///
    /// The address-based guard for domains without a natural unique id.
    pub fn abort_entries_match(&self, match_data: &DataMap) -> Result<(), AbortFlow> {
        if self.entries.entries_match(self.domain, match_data) {
            return Err(AbortFlow::new(reason::ALREADY_CONFIGURED));
        }
        Ok(())
    }

    /// Terminal helper for reauth/reconfigure flows
    ///
    /// Replaces the target entry's data wholesale, schedules a reload, and
    /// aborts with `reauth_successful` (or `reconfigure_successful`, keyed
    /// on the flow source). Never creates a new entry.
    pub async fn update_reload_and_abort(&mut self, entry_id: &str, data: DataMap) -> StepResult {
        self.entries
            .update(entry_id, ConfigEntryUpdate::new().data(data))
            .await?;
        self.entries.schedule_reload(entry_id);

        let reason = match self.context.source {
            ConfigEntrySource::Reconfigure => reason::RECONFIGURE_SUCCESSFUL,
            _ => reason::REAUTH_SUCCESSFUL,
        };
        Ok(FlowResult::abort(reason))
    }
}
