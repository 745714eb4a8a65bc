//! Per-flow context
//!
//! Auxiliary data accumulated across the steps of one flow: the source
//! that started it, the unique id claimed so far, and the entry targeted
//! by reauth/reconfigure flows.

use std::collections::HashMap;

use configflow_entries::ConfigEntrySource;

/// Mutable context carried by a flow across its steps
#[derive(Debug, Clone)]
pub struct FlowContext {
    /// What triggered this flow; set once at creation, never mutated
    pub source: ConfigEntrySource,

    /// Unique id claimed by [`crate::FlowCtx::set_unique_id`]
    pub unique_id: Option<String>,

    /// Entry targeted by a reauth/reconfigure flow
    pub entry_id: Option<String>,

    /// Placeholders for rendering the flow's title
    pub title_placeholders: HashMap<String, String>,

    /// The flow only needs a confirmation click to finish
    pub confirm_only: bool,
}

impl FlowContext {
    /// Context for a flow started from the given source
    pub fn new(source: ConfigEntrySource) -> Self {
        Self {
            source,
            unique_id: None,
            entry_id: None,
            title_placeholders: HashMap::new(),
            confirm_only: false,
        }
    }

    /// Context for a reauth flow targeting an existing entry
    pub fn reauth(entry_id: impl Into<String>) -> Self {
        let mut context = Self::new(ConfigEntrySource::Reauth);
        context.entry_id = Some(entry_id.into());
        context
    }

    /// Context for a reconfigure flow targeting an existing entry
    pub fn reconfigure(entry_id: impl Into<String>) -> Self {
        let mut context = Self::new(ConfigEntrySource::Reconfigure);
        context.entry_id = Some(entry_id.into());
        context
    }

    /// Context for a discovery flow, with the unique id advertised by the
    /// discovery protocol when one is known up front
    pub fn discovery(source: ConfigEntrySource, unique_id: Option<String>) -> Self {
        let mut context = Self::new(source);
        context.unique_id = unique_id;
        context
    }
}
