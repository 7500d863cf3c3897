use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    UnknownProvider,
    DuplicateRegistration,
    DuplicateProgressHandler,
    InvalidState,
    StaleEdit,
    AuthenticationRequired,
    Cancelled,
    SessionNotFound,
    DocumentNotFound,
    InvalidRange,
    InvalidPayload,
    SidecarUnavailable,
    Transport,
    Timeout,
    Remote,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::UnknownProvider => "urn:sidecar-bridge:error:unknown_provider",
            Self::DuplicateRegistration => "urn:sidecar-bridge:error:duplicate_registration",
            Self::DuplicateProgressHandler => {
                "urn:sidecar-bridge:error:duplicate_progress_handler"
            }
            Self::InvalidState => "urn:sidecar-bridge:error:invalid_state",
            Self::StaleEdit => "urn:sidecar-bridge:error:stale_edit",
            Self::AuthenticationRequired => "urn:sidecar-bridge:error:authentication_required",
            Self::Cancelled => "urn:sidecar-bridge:error:cancelled",
            Self::SessionNotFound => "urn:sidecar-bridge:error:session_not_found",
            Self::DocumentNotFound => "urn:sidecar-bridge:error:document_not_found",
            Self::InvalidRange => "urn:sidecar-bridge:error:invalid_range",
            Self::InvalidPayload => "urn:sidecar-bridge:error:invalid_payload",
            Self::SidecarUnavailable => "urn:sidecar-bridge:error:sidecar_unavailable",
            Self::Transport => "urn:sidecar-bridge:error:transport",
            Self::Timeout => "urn:sidecar-bridge:error:timeout",
            Self::Remote => "urn:sidecar-bridge:error:remote",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::UnknownProvider => "Unknown Provider",
            Self::DuplicateRegistration => "Duplicate Registration",
            Self::DuplicateProgressHandler => "Duplicate Progress Handler",
            Self::InvalidState => "Invalid State",
            Self::StaleEdit => "Stale Edit",
            Self::AuthenticationRequired => "Authentication Required",
            Self::Cancelled => "Cancelled",
            Self::SessionNotFound => "Session Not Found",
            Self::DocumentNotFound => "Document Not Found",
            Self::InvalidRange => "Invalid Range",
            Self::InvalidPayload => "Invalid Payload",
            Self::SidecarUnavailable => "Sidecar Unavailable",
            Self::Transport => "Transport Error",
            Self::Timeout => "Timeout",
            Self::Remote => "Remote Error",
        }
    }

    /// Whether the caller is expected to recover locally (no-op, retry, or
    /// prompt) rather than treat the error as a bug.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Self::InvalidState | Self::DuplicateRegistration | Self::DuplicateProgressHandler
        )
    }
}

/// Serializable summary of a [`BridgeError`], used when errors cross a
/// boundary (logs, the CLI, presentation layers).
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorReport {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BridgeError {
    #[error("unknown provider handle: {handle}")]
    UnknownProvider { handle: u64 },
    #[error("duplicate registration: {message}")]
    DuplicateRegistration { handle: u64, message: String },
    #[error("a progress handler is already registered for request {request_id}")]
    DuplicateProgressHandler { request_id: String },
    #[error("invalid state: cannot {operation} while session {session_id} is {state}")]
    InvalidState {
        session_id: String,
        operation: String,
        state: String,
    },
    #[error("stale edit for {uri}: expected version {expected}, document is at {actual:?}")]
    StaleEdit {
        uri: String,
        expected: i32,
        actual: Option<i32>,
    },
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("request cancelled")]
    Cancelled { request_id: Option<String> },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("document not found: {uri}")]
    DocumentNotFound { uri: String },
    #[error("invalid range for {uri}: {message}")]
    InvalidRange { uri: String, message: String },
    #[error("invalid payload: {message}")]
    InvalidPayload { message: String },
    #[error("sidecar unavailable ({status})")]
    SidecarUnavailable { status: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error("timeout waiting for request {request_id}")]
    Timeout { request_id: String },
    #[error("agent returned an error: {message}")]
    Remote { message: String },
}

impl BridgeError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::UnknownProvider { .. } => ErrorType::UnknownProvider,
            Self::DuplicateRegistration { .. } => ErrorType::DuplicateRegistration,
            Self::DuplicateProgressHandler { .. } => ErrorType::DuplicateProgressHandler,
            Self::InvalidState { .. } => ErrorType::InvalidState,
            Self::StaleEdit { .. } => ErrorType::StaleEdit,
            Self::AuthenticationRequired => ErrorType::AuthenticationRequired,
            Self::Cancelled { .. } => ErrorType::Cancelled,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::DocumentNotFound { .. } => ErrorType::DocumentNotFound,
            Self::InvalidRange { .. } => ErrorType::InvalidRange,
            Self::InvalidPayload { .. } => ErrorType::InvalidPayload,
            Self::SidecarUnavailable { .. } => ErrorType::SidecarUnavailable,
            Self::Transport { .. } => ErrorType::Transport,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Remote { .. } => ErrorType::Remote,
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::InvalidPayload {
            message: message.into(),
        }
    }

    pub fn to_report(&self) -> ErrorReport {
        let mut extensions = Map::new();
        let session_id = match self {
            Self::UnknownProvider { handle } | Self::DuplicateRegistration { handle, .. } => {
                extensions.insert("handle".to_string(), Value::from(*handle));
                None
            }
            Self::DuplicateProgressHandler { request_id } | Self::Timeout { request_id } => {
                extensions.insert("requestId".to_string(), Value::String(request_id.clone()));
                None
            }
            Self::Cancelled { request_id } => {
                if let Some(request_id) = request_id {
                    extensions.insert("requestId".to_string(), Value::String(request_id.clone()));
                }
                None
            }
            Self::InvalidState {
                session_id,
                operation,
                state,
            } => {
                extensions.insert("operation".to_string(), Value::String(operation.clone()));
                extensions.insert("state".to_string(), Value::String(state.clone()));
                Some(session_id.clone())
            }
            Self::StaleEdit {
                uri,
                expected,
                actual,
            } => {
                extensions.insert("uri".to_string(), Value::String(uri.clone()));
                extensions.insert("expectedVersion".to_string(), Value::from(*expected));
                if let Some(actual) = actual {
                    extensions.insert("actualVersion".to_string(), Value::from(*actual));
                }
                None
            }
            Self::DocumentNotFound { uri } | Self::InvalidRange { uri, .. } => {
                extensions.insert("uri".to_string(), Value::String(uri.clone()));
                None
            }
            Self::SessionNotFound { session_id } => Some(session_id.clone()),
            Self::SidecarUnavailable { status } => {
                extensions.insert("status".to_string(), Value::String(status.clone()));
                None
            }
            Self::AuthenticationRequired
            | Self::InvalidPayload { .. }
            | Self::Transport { .. }
            | Self::Remote { .. } => None,
        };

        let error_type = self.error_type();
        ErrorReport {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            message: self.to_string(),
            session_id,
            extensions,
        }
    }
}

impl From<BridgeError> for ErrorReport {
    fn from(value: BridgeError) -> Self {
        value.to_report()
    }
}

impl From<&BridgeError> for ErrorReport {
    fn from(value: &BridgeError) -> Self {
        value.to_report()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_carries_urn_and_session() {
        let err = BridgeError::InvalidState {
            session_id: "s1".to_string(),
            operation: "apply".to_string(),
            state: "disposed".to_string(),
        };
        let report = err.to_report();
        assert_eq!(report.type_, "urn:sidecar-bridge:error:invalid_state");
        assert_eq!(report.session_id.as_deref(), Some("s1"));
        assert_eq!(report.extensions["operation"], "apply");
        assert!(!err.error_type().is_recoverable());
    }

    #[test]
    fn stale_edit_report_includes_versions() {
        let err = BridgeError::StaleEdit {
            uri: "file:///a.ts".to_string(),
            expected: 3,
            actual: Some(5),
        };
        let value = serde_json::to_value(err.to_report()).expect("serialize report");
        assert_eq!(value["type"], "urn:sidecar-bridge:error:stale_edit");
        assert_eq!(value["expectedVersion"], 3);
        assert_eq!(value["actualVersion"], 5);
        assert!(err.error_type().is_recoverable());
    }
}
