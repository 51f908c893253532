use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, JsonSchema, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    InputAborted,
    StreamInterrupted,
    RewindTargetNotFound,
    ConnectionUnavailable,
    SessionIdentityMismatch,
    SessionNotFound,
    Conflict,
    StreamError,
    Timeout,
    Terminal,
}

impl ErrorType {
    pub fn as_urn(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "urn:rewind-agent:error:invalid_request",
            Self::InputAborted => "urn:rewind-agent:error:input_aborted",
            Self::StreamInterrupted => "urn:rewind-agent:error:stream_interrupted",
            Self::RewindTargetNotFound => "urn:rewind-agent:error:rewind_target_not_found",
            Self::ConnectionUnavailable => "urn:rewind-agent:error:connection_unavailable",
            Self::SessionIdentityMismatch => "urn:rewind-agent:error:session_identity_mismatch",
            Self::SessionNotFound => "urn:rewind-agent:error:session_not_found",
            Self::Conflict => "urn:rewind-agent:error:conflict",
            Self::StreamError => "urn:rewind-agent:error:stream_error",
            Self::Timeout => "urn:rewind-agent:error:timeout",
            Self::Terminal => "urn:rewind-agent:error:terminal",
        }
    }

    pub fn title(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "Invalid Request",
            Self::InputAborted => "Input Aborted",
            Self::StreamInterrupted => "Stream Interrupted",
            Self::RewindTargetNotFound => "Rewind Target Not Found",
            Self::ConnectionUnavailable => "Connection Unavailable",
            Self::SessionIdentityMismatch => "Session Identity Mismatch",
            Self::SessionNotFound => "Session Not Found",
            Self::Conflict => "Conflict",
            Self::StreamError => "Stream Error",
            Self::Timeout => "Timeout",
            Self::Terminal => "Terminal Error",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidRequest => 400,
            Self::InputAborted => 400,
            // Client-initiated cancellation, mirrors the de-facto 499 "client closed request".
            Self::StreamInterrupted => 499,
            Self::RewindTargetNotFound => 404,
            Self::ConnectionUnavailable => 503,
            Self::SessionIdentityMismatch => 409,
            Self::SessionNotFound => 404,
            Self::Conflict => 409,
            Self::StreamError => 502,
            Self::Timeout => 504,
            Self::Terminal => 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub type_: String,
    pub title: String,
    pub status: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(flatten, default, skip_serializing_if = "Map::is_empty")]
    pub extensions: Map<String, Value>,
}

impl ProblemDetails {
    pub fn new(error_type: ErrorType, detail: Option<String>) -> Self {
        Self {
            type_: error_type.as_urn().to_string(),
            title: error_type.title().to_string(),
            status: error_type.status_code(),
            detail,
            instance: None,
            extensions: Map::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("input aborted")]
    InputAbort,
    #[error("rewind target not found in history: {checkpoint_id}")]
    RewindTargetNotFound { checkpoint_id: String },
    #[error("connection unavailable: {message}")]
    ConnectionUnavailable { message: String },
    #[error("session identity mismatch: expected {expected}, agent reported {reported}")]
    SessionIdentityMismatch { expected: String, reported: String },
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session not found: {session_id}")]
    SessionNotFound { session_id: String },
    #[error("conflict: {message}")]
    Conflict { message: String },
    #[error("stream error: {message}")]
    StreamError { message: String },
    #[error("timeout")]
    Timeout { message: Option<String> },
    #[error("terminal error: {message}")]
    Terminal { message: String },
}

impl SessionError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InputAbort => ErrorType::InputAborted,
            Self::RewindTargetNotFound { .. } => ErrorType::RewindTargetNotFound,
            Self::ConnectionUnavailable { .. } => ErrorType::ConnectionUnavailable,
            Self::SessionIdentityMismatch { .. } => ErrorType::SessionIdentityMismatch,
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::Conflict { .. } => ErrorType::Conflict,
            Self::StreamError { .. } => ErrorType::StreamError,
            Self::Timeout { .. } => ErrorType::Timeout,
            Self::Terminal { .. } => ErrorType::Terminal,
        }
    }

    fn session_id(&self) -> Option<&str> {
        match self {
            Self::SessionNotFound { session_id } => Some(session_id),
            Self::SessionIdentityMismatch { expected, .. } => Some(expected),
            _ => None,
        }
    }

    fn details(&self) -> Option<Value> {
        match self {
            Self::RewindTargetNotFound { checkpoint_id } => {
                let mut map = Map::new();
                map.insert(
                    "checkpointId".to_string(),
                    Value::String(checkpoint_id.clone()),
                );
                Some(Value::Object(map))
            }
            Self::SessionIdentityMismatch { expected, reported } => {
                let mut map = Map::new();
                map.insert("expected".to_string(), Value::String(expected.clone()));
                map.insert("reported".to_string(), Value::String(reported.clone()));
                Some(Value::Object(map))
            }
            Self::Timeout { message } => message.as_ref().map(|msg| {
                let mut map = Map::new();
                map.insert("message".to_string(), Value::String(msg.clone()));
                Value::Object(map)
            }),
            _ => None,
        }
    }

    pub fn to_problem_details(&self) -> ProblemDetails {
        let mut problem = ProblemDetails::new(self.error_type(), Some(self.to_string()));
        let mut extensions = Map::new();
        if let Some(session_id) = self.session_id() {
            extensions.insert(
                "sessionId".to_string(),
                Value::String(session_id.to_string()),
            );
        }
        if let Some(details) = self.details() {
            extensions.insert("details".to_string(), details);
        }
        problem.extensions = extensions;
        problem
    }
}

impl From<SessionError> for ProblemDetails {
    fn from(value: SessionError) -> Self {
        value.to_problem_details()
    }
}

impl From<&SessionError> for ProblemDetails {
    fn from(value: &SessionError) -> Self {
        value.to_problem_details()
    }
}
