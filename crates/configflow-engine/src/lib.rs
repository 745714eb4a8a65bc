//! Config flow engine
//!
//! A step-sequencing engine for multi-step configuration dialogs. Each
//! integration domain registers a [`ConfigFlowHandler`] factory with the
//! [`FlowManager`]; users (or discovery) start flows, feed them input one
//! step at a time, and a finished flow materializes a
//! [`configflow_entries::ConfigEntry`] in the shared store.
//!
//! # Key Types
//!
//! - [`FlowManager`] - Registry and dispatcher for in-progress flows
//! - [`ConfigFlowHandler`] - Per-domain step logic, with a declared step table
//! - [`FlowResult`] - What a step returns: form, create-entry, abort, external
//! - [`FlowCtx`] - The per-step view a handler gets: context, peers, and the
//!   unique-id dedup guard
//!
//! # Flow Lifecycle
//!
//! ```text
//! init ──► Form ──configure──► Form (errors) ──configure──► CreateEntry
//!   │                │                                          │
//!   │                └──► ExternalStep ──► ExternalStepDone ────┤
//!   └──────────────────────────────────────────────► Abort ◄────┘
//! ```
//!
//! Terminal results (CreateEntry, Abort) deregister the flow; its id is
//! dead afterwards.

pub mod context;
pub mod error;
pub mod handler;
pub mod manager;
pub mod result;

pub use context::FlowContext;
pub use error::{AbortFlow, FlowError, StepError, StepResult};
pub use handler::{
    ConfigFlowHandler, FlowCtx, FlowFactory, FlowPeer, OptionsFlowFactory, UserInput,
};
pub use manager::{FlowEvent, FlowManager, FlowProgress, DEFAULT_FLOW_TTL};
pub use result::{
    base_error, error_code, reason, ErrorMap, FlowResult, FormField, FormSchema, StepId,
    ERROR_BASE, STEP_DISCOVERY, STEP_IMPORT, STEP_INIT, STEP_REAUTH, STEP_REAUTH_CONFIRM,
    STEP_RECONFIGURE, STEP_USER,
};
