//! Flow manager
//!
//! Owns the registry of in-progress flows and dispatches init/configure
//! calls into the right handler step. Flows for different devices run
//! concurrently; steps of one flow are serialized by a per-flow lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use configflow_entries::{
    ConfigEntriesError, ConfigEntry, ConfigEntrySource, ConfigEntryStore, ConfigEntryUpdate,
    DataMap,
};

use crate::context::FlowContext;
use crate::error::{FlowError, StepError};
use crate::handler::{ConfigFlowHandler, FlowCtx, FlowFactory, FlowPeer, OptionsFlowFactory, UserInput};
use crate::result::{base_error, error_code, reason, FlowResult, FormSchema, StepId, STEP_INIT};

/// Idle TTL after which an abandoned paused flow is eligible for eviction
pub const DEFAULT_FLOW_TTL: Duration = Duration::from_secs(15 * 60);

/// Capacity of the flow event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Notifications about flow activity
#[derive(Debug, Clone)]
pub enum FlowEvent {
    /// A discovery-sourced flow paused awaiting user confirmation
    Discovered { domain: String, flow_id: String },
    /// An external step completed; the frontend should refresh the flow
    Progressed { domain: String, flow_id: String },
}

/// Summary of one paused flow
#[derive(Debug, Clone, Serialize)]
pub struct FlowProgress {
    pub flow_id: String,
    pub handler: String,
    pub step_id: StepId,
    pub source: ConfigEntrySource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_id: Option<String>,
}

/// What a terminal CreateEntry result does
#[derive(Debug, Clone, PartialEq, Eq)]
enum FlowKind {
    /// Materialize a new config entry
    Config,
    /// Replace the options of an existing entry
    Options { entry_id: String },
}

/// Mutable state of one in-progress flow, guarded by the per-flow lock
struct FlowState {
    handler: Box<dyn ConfigFlowHandler>,
    context: FlowContext,
    cur_step: StepId,
    /// Schema of the last form shown, re-shown on unanticipated step errors
    cur_schema: Option<FormSchema>,
    last_active: Instant,
}

#[derive(Clone)]
struct FlowSlot {
    domain: String,
    kind: FlowKind,
    state: Arc<Mutex<FlowState>>,
}

/// Manager of all in-progress config and options flows
///
/// An explicit object with a constructor; callers share it behind an
/// `Arc` and hand it the entry store it finishes flows into.
pub struct FlowManager {
    entries: Arc<ConfigEntryStore>,
    factories: DashMap<String, FlowFactory>,
    options_factories: DashMap<String, OptionsFlowFactory>,
    flows: DashMap<String, FlowSlot>,
    events: broadcast::Sender<FlowEvent>,
}

impl FlowManager {
    /// Create a flow manager over the given entry store
    pub fn new(entries: Arc<ConfigEntryStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            entries,
            factories: DashMap::new(),
            options_factories: DashMap::new(),
            flows: DashMap::new(),
            events,
        }
    }

    /// The entry store flows finish into
    pub fn entries(&self) -> &Arc<ConfigEntryStore> {
        &self.entries
    }

    /// Register a config flow factory for a domain
    pub fn register(&self, domain: impl Into<String>, factory: FlowFactory) {
        let domain = domain.into();
        debug!("Registered config flow handler for domain: {}", domain);
        self.factories.insert(domain, factory);
    }

    /// Register an options flow factory for a domain
    pub fn register_options(&self, domain: impl Into<String>, factory: OptionsFlowFactory) {
        let domain = domain.into();
        debug!("Registered options flow handler for domain: {}", domain);
        self.options_factories.insert(domain, factory);
    }

    /// Subscribe to flow events
    pub fn subscribe_events(&self) -> broadcast::Receiver<FlowEvent> {
        self.events.subscribe()
    }

    /// Start a new config flow
    ///
    /// Picks the entry-point step from the context source and runs it with
    /// `data` (None for user-initiated flows awaiting their first form).
    /// The flow stays registered only if the result pauses it.
    pub async fn init(
        &self,
        domain: &str,
        context: FlowContext,
        data: Option<UserInput>,
    ) -> Result<FlowResult, FlowError> {
        // Ignoring a discovery creates the marker entry directly
        if context.source == ConfigEntrySource::Ignore {
            return self.create_ignored_entry(domain, data).await;
        }

        let factory = self
            .factories
            .get(domain)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownHandler(domain.to_string()))?;
        let handler = factory();

        // Single-instance integrations never start a second setup flow
        if handler.single_config_entry()
            && !matches!(
                context.source,
                ConfigEntrySource::Reauth | ConfigEntrySource::Reconfigure
            )
            && self.entries.has_entries(domain, false)
        {
            return Ok(FlowResult::abort(reason::SINGLE_INSTANCE_ALLOWED));
        }

        // A second discovery for a device already being set up aborts
        // before the flow is ever registered
        if context.source.is_discovery() {
            if let Some(unique_id) = &context.unique_id {
                let dup = self
                    .peers_for(domain, None)
                    .iter()
                    .any(|peer| peer.unique_id.as_deref() == Some(unique_id.as_str()));
                if dup {
                    debug!(
                        "Discovery for {} ({}) already in progress",
                        domain, unique_id
                    );
                    return Ok(FlowResult::abort(reason::ALREADY_IN_PROGRESS));
                }
            }
        }

        let flow_id = ulid::Ulid::new().to_string();
        let source = context.source;
        let init_step = handler.init_step(source);

        let slot = FlowSlot {
            domain: domain.to_string(),
            kind: FlowKind::Config,
            state: Arc::new(Mutex::new(FlowState {
                handler,
                context,
                cur_step: init_step,
                cur_schema: None,
                last_active: Instant::now(),
            })),
        };
        self.flows.insert(flow_id.clone(), slot.clone());
        debug!(
            "Started {:?}-sourced flow {} for domain {}",
            source, flow_id, domain
        );

        let result = self.dispatch(&flow_id, &slot, data).await?;

        if source.is_discovery() && !result.is_terminal() {
            let _ = self.events.send(FlowEvent::Discovered {
                domain: domain.to_string(),
                flow_id: flow_id.clone(),
            });
        }

        Ok(result)
    }

    /// Start an options flow for an existing entry
    ///
    /// The entry-point step is always `init`; a terminal CreateEntry
    /// replaces the entry's options instead of creating an entry.
    pub async fn init_options(&self, entry_id: &str) -> Result<FlowResult, FlowError> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| ConfigEntriesError::NotFound(entry_id.to_string()))?;

        let factory = self
            .options_factories
            .get(&entry.domain)
            .map(|f| f.value().clone())
            .ok_or_else(|| FlowError::UnknownHandler(entry.domain.clone()))?;
        let handler = factory(&entry);

        let mut context = FlowContext::new(ConfigEntrySource::User);
        context.entry_id = Some(entry_id.to_string());

        let flow_id = ulid::Ulid::new().to_string();
        let slot = FlowSlot {
            domain: entry.domain.clone(),
            kind: FlowKind::Options {
                entry_id: entry_id.to_string(),
            },
            state: Arc::new(Mutex::new(FlowState {
                handler,
                context,
                cur_step: STEP_INIT,
                cur_schema: None,
                last_active: Instant::now(),
            })),
        };
        self.flows.insert(flow_id.clone(), slot.clone());
        debug!(
            "Started options flow {} for entry {} ({})",
            flow_id, entry_id, entry.domain
        );

        self.dispatch(&flow_id, &slot, None).await
    }

    /// Resume a paused flow with user input
    ///
    /// Fails with [`FlowError::UnknownFlow`] for ids that finished,
    /// were aborted, or were evicted.
    pub async fn configure(
        &self,
        flow_id: &str,
        user_input: Option<UserInput>,
    ) -> Result<FlowResult, FlowError> {
        let slot = self
            .flows
            .get(flow_id)
            .map(|r| r.value().clone())
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))?;

        self.dispatch(flow_id, &slot, user_input).await
    }

    /// Abort a paused flow
    pub fn abort(&self, flow_id: &str) -> Result<(), FlowError> {
        self.flows
            .remove(flow_id)
            .map(|_| debug!("Aborted flow {}", flow_id))
            .ok_or_else(|| FlowError::UnknownFlow(flow_id.to_string()))
    }

    /// Lazy, non-exhaustive view of paused flows
    ///
    /// Flows currently executing a step are skipped rather than waited
    /// for.
    pub fn progress(&self, domain: Option<&str>) -> Vec<FlowProgress> {
        self.flows
            .iter()
            .filter(|r| domain.map_or(true, |d| r.value().domain == d))
            .filter_map(|r| {
                let state = r.value().state.try_lock().ok()?;
                Some(FlowProgress {
                    flow_id: r.key().clone(),
                    handler: r.value().domain.clone(),
                    step_id: state.cur_step,
                    source: state.context.source,
                    unique_id: state.context.unique_id.clone(),
                })
            })
            .collect()
    }

    /// Evict flows that have been paused longer than `ttl`
    ///
    /// Nothing times out abandoned flows on its own; callers run this
    /// periodically (or on demand) with a TTL of their choosing, e.g.
    /// [`DEFAULT_FLOW_TTL`]. Returns the evicted flow ids.
    pub fn evict_stale(&self, ttl: Duration) -> Vec<String> {
        let stale: Vec<String> = self
            .flows
            .iter()
            .filter_map(|r| {
                let state = r.value().state.try_lock().ok()?;
                (state.last_active.elapsed() > ttl).then(|| r.key().clone())
            })
            .collect();

        for flow_id in &stale {
            if self.flows.remove(flow_id).is_some() {
                info!("Evicted stale flow {}", flow_id);
            }
        }
        stale
    }

    /// Number of registered in-progress flows
    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Run the flow's current step and apply the result
    async fn dispatch(
        &self,
        flow_id: &str,
        slot: &FlowSlot,
        user_input: Option<UserInput>,
    ) -> Result<FlowResult, FlowError> {
        let mut state = slot.state.lock().await;

        // The flow may have been aborted while we waited for the lock
        if !self.flows.contains_key(flow_id) {
            return Err(FlowError::UnknownFlow(flow_id.to_string()));
        }

        let step = state.cur_step;
        if !state.handler.steps().contains(&step) {
            self.flows.remove(flow_id);
            return Err(FlowError::UnknownStep {
                domain: slot.domain.clone(),
                step,
            });
        }

        let peers = self.peers_for(&slot.domain, Some(flow_id));

        let result = {
            let FlowState {
                handler,
                context,
                cur_schema,
                ..
            } = &mut *state;
            let mut ctx = FlowCtx {
                flow_id,
                domain: &slot.domain,
                context,
                entries: &self.entries,
                peers: &peers,
            };

            match handler.handle_step(&mut ctx, step, user_input).await {
                Ok(result) => result,
                Err(StepError::Abort(abort)) => FlowResult::Abort {
                    reason: abort.reason,
                    description_placeholders: abort.description_placeholders,
                },
                Err(StepError::Failed(err)) => {
                    // The blanket safety net: a buggy step must never
                    // propagate past the manager and orphan the flow
                    error!(
                        "Unexpected error in {} flow step {}: {:#}",
                        slot.domain, step, err
                    );
                    match cur_schema {
                        Some(schema) => FlowResult::form_with_errors(
                            step,
                            schema.clone(),
                            base_error(error_code::UNKNOWN),
                        ),
                        None => FlowResult::abort(reason::UNKNOWN),
                    }
                }
            }
        };

        match result {
            FlowResult::Form {
                ref step_id,
                ref schema,
                ..
            } => {
                self.check_step(flow_id, slot, &state, *step_id)?;
                state.cur_step = *step_id;
                state.cur_schema = Some(schema.clone());
                state.last_active = Instant::now();
                Ok(result)
            }
            FlowResult::ExternalStep { step_id, .. } => {
                self.check_step(flow_id, slot, &state, step_id)?;
                state.cur_step = step_id;
                state.cur_schema = None;
                state.last_active = Instant::now();
                Ok(result)
            }
            FlowResult::ExternalStepDone { next_step_id } => {
                self.check_step(flow_id, slot, &state, next_step_id)?;
                state.cur_step = next_step_id;
                state.cur_schema = None;
                state.last_active = Instant::now();
                let _ = self.events.send(FlowEvent::Progressed {
                    domain: slot.domain.clone(),
                    flow_id: flow_id.to_string(),
                });
                Ok(result)
            }
            terminal => {
                let finished = self.finish_flow(flow_id, slot, &state, terminal).await;
                drop(state);
                // Terminal flows are never resumable, even when finishing
                // itself failed
                self.flows.remove(flow_id);
                finished
            }
        }
    }

    /// Reject results naming a step the handler never declared
    fn check_step(
        &self,
        flow_id: &str,
        slot: &FlowSlot,
        state: &FlowState,
        step: StepId,
    ) -> Result<(), FlowError> {
        if state.handler.steps().contains(&step) {
            return Ok(());
        }
        self.flows.remove(flow_id);
        Err(FlowError::UnknownStep {
            domain: slot.domain.clone(),
            step,
        })
    }

    /// Apply a terminal result
    async fn finish_flow(
        &self,
        flow_id: &str,
        slot: &FlowSlot,
        state: &FlowState,
        result: FlowResult,
    ) -> Result<FlowResult, FlowError> {
        let (title, data, options) = match result {
            FlowResult::Abort { .. } => return Ok(result),
            FlowResult::CreateEntry {
                title,
                data,
                options,
                ..
            } => (title, data, options),
            // dispatch only forwards terminal results here
            other => return Ok(other),
        };

        if let FlowKind::Options { entry_id } = &slot.kind {
            self.entries
                .update(entry_id, ConfigEntryUpdate::new().options(data.clone()))
                .await?;
            self.entries.schedule_reload(entry_id);
            info!("Options updated for entry {} ({})", entry_id, slot.domain);
            return Ok(FlowResult::CreateEntry {
                title,
                data,
                options,
                entry_id: Some(entry_id.clone()),
            });
        }

        let unique_id = state.context.unique_id.clone();

        // Abort sibling flows racing to configure the same device
        if let Some(unique_id) = &unique_id {
            for peer in self.peers_for(&slot.domain, Some(flow_id)) {
                if peer.unique_id.as_deref() == Some(unique_id.as_str()) {
                    debug!(
                        "Aborting flow {} superseded by {} for {}",
                        peer.flow_id, flow_id, slot.domain
                    );
                    self.flows.remove(&peer.flow_id);
                }
            }
        }

        if state.handler.single_config_entry() && self.entries.has_entries(&slot.domain, false) {
            return Ok(FlowResult::abort(reason::SINGLE_INSTANCE_ALLOWED));
        }

        let (version, minor_version) = state.handler.version();
        let mut entry = ConfigEntry::new(&slot.domain, &title)
            .with_data(data.clone())
            .with_options(options.clone())
            .with_source(state.context.source)
            .with_version(version, minor_version);
        if let Some(unique_id) = unique_id.clone() {
            entry = entry.with_unique_id(unique_id);
        }

        // A rediscovered device replaces its existing entry instead of
        // stacking a duplicate
        if let Some(unique_id) = &unique_id {
            if let Some(existing) = self.entries.get_by_unique_id(&slot.domain, unique_id) {
                warn!(
                    "Replacing existing entry {} for {} ({})",
                    existing.entry_id, slot.domain, unique_id
                );
                self.entries.remove(&existing.entry_id).await?;
            }
        }

        // The store's atomic unique-id claim is the final arbiter of the
        // dedup race between concurrently finishing flows
        let entry = match self.entries.add(entry).await {
            Ok(entry) => entry,
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                return Ok(FlowResult::abort(reason::ALREADY_CONFIGURED));
            }
            Err(err) => return Err(err.into()),
        };

        Ok(FlowResult::CreateEntry {
            title,
            data,
            options,
            entry_id: Some(entry.entry_id),
        })
    }

    /// Snapshot other in-progress flows for a domain
    ///
    /// Best-effort: flows currently executing a step are skipped, so the
    /// final dedup decision always rests with the entry store.
    fn peers_for(&self, domain: &str, exclude: Option<&str>) -> Vec<FlowPeer> {
        self.flows
            .iter()
            .filter(|r| r.value().domain == domain && exclude != Some(r.key().as_str()))
            .filter_map(|r| {
                let state = r.value().state.try_lock().ok()?;
                Some(FlowPeer {
                    flow_id: r.key().clone(),
                    source: state.context.source,
                    unique_id: state.context.unique_id.clone(),
                })
            })
            .collect()
    }

    /// Create the marker entry for a discovery the user chose to ignore
    async fn create_ignored_entry(
        &self,
        domain: &str,
        data: Option<UserInput>,
    ) -> Result<FlowResult, FlowError> {
        let data = data.unwrap_or_default();
        let title = data
            .get("title")
            .and_then(|v| v.as_str())
            .unwrap_or("Ignored")
            .to_string();

        let mut entry =
            ConfigEntry::new(domain, &title).with_source(ConfigEntrySource::Ignore);
        if let Some(unique_id) = data.get("unique_id").and_then(|v| v.as_str()) {
            entry = entry.with_unique_id(unique_id);
        }

        match self.entries.add(entry).await {
            Ok(entry) => Ok(FlowResult::CreateEntry {
                title,
                data: DataMap::new(),
                options: DataMap::new(),
                entry_id: Some(entry.entry_id),
            }),
            Err(ConfigEntriesError::AlreadyExists { .. }) => {
                Ok(FlowResult::abort(reason::ALREADY_CONFIGURED))
            }
            Err(err) => Err(err.into()),
        }
    }
}
