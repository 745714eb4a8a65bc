//! Flow step results and form schemas
//!
//! Every step of a flow returns a [`FlowResult`]: either a pause (`Form`,
//! `ExternalStep`) that keeps the flow registered, or a terminal outcome
//! (`CreateEntry`, `Abort`) that removes it.

use serde::Serialize;
use std::collections::HashMap;
use std::fmt;

use configflow_entries::DataMap;

/// Identifier of a flow step
///
/// Handlers declare their step table as `&'static [StepId]`; the manager
/// checks every routed or returned step against that table instead of
/// resolving method names at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct StepId(pub &'static str);

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Entry step for user-initiated flows
pub const STEP_USER: StepId = StepId("user");
/// Entry step for YAML-import flows
pub const STEP_IMPORT: StepId = StepId("import");
/// Entry step for discovery-initiated flows
pub const STEP_DISCOVERY: StepId = StepId("discovery");
/// Entry step for re-authentication flows
pub const STEP_REAUTH: StepId = StepId("reauth");
/// Confirmation step conventionally chained from reauth
pub const STEP_REAUTH_CONFIRM: StepId = StepId("reauth_confirm");
/// Entry step for reconfigure flows
pub const STEP_RECONFIGURE: StepId = StepId("reconfigure");
/// Entry step for options flows
pub const STEP_INIT: StepId = StepId("init");

/// Stable abort reasons
pub mod reason {
    /// An entry with this unique id already exists
    pub const ALREADY_CONFIGURED: &str = "already_configured";
    /// Another flow for this device is already in progress
    pub const ALREADY_IN_PROGRESS: &str = "already_in_progress";
    /// Reauth finished and updated the existing entry
    pub const REAUTH_SUCCESSFUL: &str = "reauth_successful";
    /// Reconfigure finished and updated the existing entry
    pub const RECONFIGURE_SUCCESSFUL: &str = "reconfigure_successful";
    /// The integration supports a single entry which already exists
    pub const SINGLE_INSTANCE_ALLOWED: &str = "single_instance_allowed";
    /// Unanticipated failure, details in the log
    pub const UNKNOWN: &str = "unknown";
}

/// Stable form error codes
pub mod error_code {
    /// Could not reach the device/service
    pub const CANNOT_CONNECT: &str = "cannot_connect";
    /// Credentials were rejected
    pub const INVALID_AUTH: &str = "invalid_auth";
    /// Unanticipated failure, details in the log
    pub const UNKNOWN: &str = "unknown";
}

/// Form-level error key (not tied to a single field)
pub const ERROR_BASE: &str = "base";

/// Errors shown inline on a form, keyed by field name or [`ERROR_BASE`]
pub type ErrorMap = HashMap<String, String>;

/// Build an `ErrorMap` with a single form-level error
pub fn base_error(code: &str) -> ErrorMap {
    let mut errors = ErrorMap::new();
    errors.insert(ERROR_BASE.to_string(), code.to_string());
    errors
}

/// One input field of a form
#[derive(Debug, Clone, Serialize)]
pub struct FormField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    pub required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

impl FormField {
    /// A required field
    pub fn required(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: true,
            default: None,
        }
    }

    /// An optional field
    pub fn optional(name: impl Into<String>, field_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            field_type: field_type.into(),
            required: false,
            default: None,
        }
    }

    /// Set a default value
    pub fn with_default(mut self, default: serde_json::Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Input schema shown to the user for one form step
pub type FormSchema = Vec<FormField>;

/// The value every flow step returns
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowResult {
    /// Pause the flow, awaiting user input for `step_id`
    Form {
        step_id: StepId,
        schema: FormSchema,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        errors: ErrorMap,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        description_placeholders: HashMap<String, String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        last_step: Option<bool>,
    },
    /// Terminal: materialize a config entry
    ///
    /// `entry_id` is filled in by the manager once the entry exists.
    CreateEntry {
        title: String,
        data: DataMap,
        options: DataMap,
        #[serde(skip_serializing_if = "Option::is_none")]
        entry_id: Option<String>,
    },
    /// Terminal: no entry created or updated
    Abort {
        reason: String,
        #[serde(skip_serializing_if = "HashMap::is_empty")]
        description_placeholders: HashMap<String, String>,
    },
    /// Pause pending an out-of-band callback (e.g., OAuth redirect)
    #[serde(rename = "external")]
    ExternalStep { step_id: StepId, url: String },
    /// The out-of-band callback arrived; resume at `next_step_id`
    #[serde(rename = "external_done")]
    ExternalStepDone { next_step_id: StepId },
}

impl FlowResult {
    /// A form with no errors
    pub fn form(step_id: StepId, schema: FormSchema) -> Self {
        FlowResult::Form {
            step_id,
            schema,
            errors: ErrorMap::new(),
            description_placeholders: HashMap::new(),
            last_step: None,
        }
    }

    /// A re-shown form with validation errors
    pub fn form_with_errors(step_id: StepId, schema: FormSchema, errors: ErrorMap) -> Self {
        FlowResult::Form {
            step_id,
            schema,
            errors,
            description_placeholders: HashMap::new(),
            last_step: None,
        }
    }

    /// A terminal create-entry result
    pub fn create_entry(title: impl Into<String>, data: DataMap) -> Self {
        FlowResult::CreateEntry {
            title: title.into(),
            data,
            options: DataMap::new(),
            entry_id: None,
        }
    }

    /// A terminal abort result
    pub fn abort(reason: impl Into<String>) -> Self {
        FlowResult::Abort {
            reason: reason.into(),
            description_placeholders: HashMap::new(),
        }
    }

    /// An external-step pause
    pub fn external_step(step_id: StepId, url: impl Into<String>) -> Self {
        FlowResult::ExternalStep {
            step_id,
            url: url.into(),
        }
    }

    /// The external-step completion marker
    pub fn external_step_done(next_step_id: StepId) -> Self {
        FlowResult::ExternalStepDone { next_step_id }
    }

    /// Whether this result finishes the flow
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowResult::CreateEntry { .. } | FlowResult::Abort { .. }
        )
    }

    /// The step this result pauses at, if any
    pub fn step_id(&self) -> Option<StepId> {
        match self {
            FlowResult::Form { step_id, .. } | FlowResult::ExternalStep { step_id, .. } => {
                Some(*step_id)
            }
            FlowResult::ExternalStepDone { next_step_id } => Some(*next_step_id),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_form_serialization() {
        let result = FlowResult::form_with_errors(
            STEP_USER,
            vec![FormField::required("host", "string")],
            base_error(error_code::CANNOT_CONNECT),
        );

        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["type"], "form");
        assert_eq!(json["step_id"], "user");
        assert_eq!(json["errors"]["base"], "cannot_connect");
        assert_eq!(json["schema"][0]["name"], "host");
        assert_eq!(json["schema"][0]["required"], true);
    }

    #[test]
    fn test_create_entry_serialization() {
        let mut data = DataMap::new();
        data.insert("host".into(), json!("10.0.0.2"));

        let result = FlowResult::create_entry("My Device", data);
        let json = serde_json::to_value(&result).unwrap();

        assert_eq!(json["type"], "create_entry");
        assert_eq!(json["title"], "My Device");
        assert_eq!(json["data"]["host"], "10.0.0.2");
        // Not yet materialized
        assert!(json.get("entry_id").is_none());
    }

    #[test]
    fn test_abort_serialization() {
        let json = serde_json::to_value(FlowResult::abort(reason::ALREADY_CONFIGURED)).unwrap();
        assert_eq!(json["type"], "abort");
        assert_eq!(json["reason"], "already_configured");
    }

    #[test]
    fn test_external_step_serialization() {
        let json =
            serde_json::to_value(FlowResult::external_step(STEP_USER, "https://example.com/auth"))
                .unwrap();
        assert_eq!(json["type"], "external");
        assert_eq!(json["url"], "https://example.com/auth");

        let json = serde_json::to_value(FlowResult::external_step_done(STEP_REAUTH_CONFIRM)).unwrap();
        assert_eq!(json["type"], "external_done");
        assert_eq!(json["next_step_id"], "reauth_confirm");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(FlowResult::abort("x").is_terminal());
        assert!(FlowResult::create_entry("t", DataMap::new()).is_terminal());
        assert!(!FlowResult::form(STEP_USER, Vec::new()).is_terminal());
        assert!(!FlowResult::external_step(STEP_USER, "u").is_terminal());
    }

    #[test]
    fn test_default_field_value() {
        let field = FormField::optional("port", "integer").with_default(json!(80));
        let json = serde_json::to_value(&field).unwrap();
        assert_eq!(json["default"], 80);
        assert_eq!(json["required"], false);
    }
}
