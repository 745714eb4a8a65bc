//! Config entry state machine
//!
//! Enforces valid transitions for the ConfigEntry lifecycle:
//!
//! ```text
//! NotLoaded → Loaded | SetupError | SetupRetry
//!
//! SetupError ⇄ SetupRetry, either → Loaded | NotLoaded
//!
//! Loaded → NotLoaded (unloaded) | SetupRetry (connection lost)
//!        → FailedUnload (terminal)
//! ```

use crate::entry::ConfigEntryState;
use thiserror::Error;

/// Error when an invalid state transition is attempted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Invalid state transition from {from:?} to {to:?}: {reason}")]
pub struct InvalidTransition {
    pub from: ConfigEntryState,
    pub to: ConfigEntryState,
    pub reason: &'static str,
}

impl ConfigEntryState {
    /// Attempt a transition to a new state.
    ///
    /// Returns the new state if valid, or an error describing why the
    /// transition is invalid.
    pub fn try_transition(
        self,
        to: ConfigEntryState,
    ) -> Result<ConfigEntryState, InvalidTransition> {
        use ConfigEntryState::*;

        let valid = match (self, to) {
            // Setup attempts from NotLoaded can land anywhere but FailedUnload
            (NotLoaded, Loaded) => true,
            (NotLoaded, SetupError) => true,
            (NotLoaded, SetupRetry) => true,

            // Failed setups may be retried, recover, or be unloaded
            (SetupError, Loaded) => true,
            (SetupError, SetupRetry) => true,
            (SetupError, NotLoaded) => true,
            (SetupRetry, Loaded) => true,
            (SetupRetry, SetupError) => true,
            (SetupRetry, NotLoaded) => true,

            // A loaded entry unloads cleanly, drops into retry, or fails to unload
            (Loaded, NotLoaded) => true,
            (Loaded, SetupRetry) => true,
            (Loaded, FailedUnload) => true,

            // Terminal state - no transitions allowed
            (FailedUnload, _) => false,

            _ => false,
        };

        if valid {
            Ok(to)
        } else {
            Err(InvalidTransition {
                from: self,
                to,
                reason: Self::transition_error_reason(self, to),
            })
        }
    }

    /// Check if a transition is valid without performing it
    pub fn can_transition_to(self, to: ConfigEntryState) -> bool {
        self.try_transition(to).is_ok()
    }

    fn transition_error_reason(from: ConfigEntryState, to: ConfigEntryState) -> &'static str {
        use ConfigEntryState::*;

        match (from, to) {
            (FailedUnload, _) => "FailedUnload is terminal - entry cannot recover",
            (NotLoaded, FailedUnload) => "Entry was never loaded - nothing to fail unloading",
            (SetupError, FailedUnload) | (SetupRetry, FailedUnload) => {
                "Only a loaded entry can fail to unload"
            }
            _ => "Invalid state transition",
        }
    }
}

/// Calculates setup retry delay with exponential backoff.
///
/// 2^min(tries, 4) * 5 + random jitter, giving delays of
/// 5s, 10s, 20s, 40s, 80s (then staying at 80s).
pub fn calculate_retry_delay(tries: u32) -> f64 {
    let base_delay = 2_u32.pow(tries.min(4)) * 5;
    // Small jitter (0-100ms) to prevent thundering herd
    let jitter = rand::random::<f64>() * 0.1;
    base_delay as f64 + jitter
}
