//! Flow engine errors
//!
//! Two distinct error kinds flow through the engine:
//!
//! - [`AbortFlow`] is a control signal: the dedup guard (or a handler)
//!   terminating the flow with a known reason. The manager converts it to
//!   an `Abort` result; broad error handling must never swallow it.
//! - [`StepError::Failed`] is an unanticipated failure inside a step. The
//!   manager logs it and re-shows the current form with an `unknown`
//!   error so a buggy step can never corrupt the flow registry.

use std::collections::HashMap;
use thiserror::Error;

use configflow_entries::ConfigEntriesError;

use crate::result::StepId;

/// Control signal terminating a flow with a known abort reason
#[derive(Debug, Error, Clone)]
#[error("Flow aborted: {reason}")]
pub struct AbortFlow {
    pub reason: String,
    pub description_placeholders: HashMap<String, String>,
}

impl AbortFlow {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            description_placeholders: HashMap::new(),
        }
    }

    pub fn with_placeholders(mut self, placeholders: HashMap<String, String>) -> Self {
        self.description_placeholders = placeholders;
        self
    }
}

/// Failure modes of one step invocation
///
/// Handlers map *expected* vendor failures to form errors themselves and
/// only propagate `AbortFlow` (via `?`) and genuinely unexpected errors.
#[derive(Debug, Error)]
pub enum StepError {
    /// Known abort condition; always passes through distinct
    #[error(transparent)]
    Abort(#[from] AbortFlow),

    /// Anything else; caught by the manager's blanket wrapper
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

impl From<ConfigEntriesError> for StepError {
    fn from(err: ConfigEntriesError) -> Self {
        StepError::Failed(err.into())
    }
}

/// Result of one step invocation
pub type StepResult = Result<crate::result::FlowResult, StepError>;

/// Manager-level errors
#[derive(Debug, Error)]
pub enum FlowError {
    /// No flow factory registered for this domain
    #[error("Unknown handler: {0}")]
    UnknownHandler(String),

    /// Flow id is not (or no longer) registered
    #[error("Unknown flow: {0}")]
    UnknownFlow(String),

    /// A step id outside the handler's declared step table
    #[error("Handler {domain} does not declare step {step}")]
    UnknownStep { domain: String, step: StepId },

    #[error(transparent)]
    Entries(#[from] ConfigEntriesError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::reason;

    #[test]
    fn test_abort_flow_display() {
        let abort = AbortFlow::new(reason::ALREADY_CONFIGURED);
        assert_eq!(abort.to_string(), "Flow aborted: already_configured");
    }

    #[test]
    fn test_abort_stays_distinct_through_step_error() {
        let err: StepError = AbortFlow::new(reason::ALREADY_IN_PROGRESS).into();
        assert!(matches!(err, StepError::Abort(_)));

        let err: StepError = anyhow::anyhow!("socket closed").into();
        assert!(matches!(err, StepError::Failed(_)));
    }

    #[test]
    fn test_unknown_step_display() {
        let err = FlowError::UnknownStep {
            domain: "demo".to_string(),
            step: crate::result::STEP_USER,
        };
        assert_eq!(err.to_string(), "Handler demo does not declare step user");
    }
}
