//! Error types for the CRM REST client.
//!
//! # Design
//! `HttpError` is the read-only view of a failed transport outcome handed to
//! error callbacks. It is built from the raw outcome and never fails: a body
//! that claims to be JSON but does not parse simply leaves `code` and
//! `message` unset.
//!
//! `ConfigError` is fatal and only produced while building a dispatcher.
//! `ApiError` covers decoding a successful response into a caller type.

use std::fmt;

use serde_json::Value;

use crate::http::{HttpResponse, TransportOutcome};

/// Error code the server uses for an expired or invalid access token.
pub const INVALID_GRANT: &str = "invalid_grant";

/// Structured view of a failed request.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpError {
    /// HTTP status, or 0 when no response was received.
    pub status: u16,
    pub response_text: String,
    pub text_status: String,
    pub error_thrown: String,
    /// Parsed response body when it is JSON.
    pub payload: Option<Value>,
    /// Machine code from the payload's `error` field.
    pub code: Option<String>,
    /// Human text from the payload's `error_message` field.
    pub message: Option<String>,
}

impl HttpError {
    pub fn from_outcome(outcome: &TransportOutcome) -> Self {
        match outcome {
            TransportOutcome::Response(response) => Self::from_response(response),
            TransportOutcome::NetworkFailure { text_status, error } => Self {
                status: 0,
                response_text: String::new(),
                text_status: text_status.clone(),
                error_thrown: error.clone(),
                payload: None,
                code: None,
                message: None,
            },
        }
    }

    pub fn from_response(response: &HttpResponse) -> Self {
        let mut error = Self {
            status: response.status,
            response_text: response.body.clone(),
            text_status: "error".to_string(),
            error_thrown: reason_phrase(response.status).to_string(),
            payload: None,
            code: None,
            message: None,
        };
        if !response.body.is_empty() && response.is_json() {
            if let Ok(payload) = serde_json::from_str::<Value>(&response.body) {
                error.code = payload.get("error").and_then(Value::as_str).map(str::to_string);
                error.message = payload
                    .get("error_message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                error.payload = Some(payload);
            }
        }
        error
    }

    /// True when the server reported an expired/invalid access token.
    pub fn is_invalid_grant(&self) -> bool {
        self.code.as_deref() == Some(INVALID_GRANT)
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "HTTP error: {}", self.status)?;
        writeln!(f, "type: {}", self.text_status)?;
        writeln!(f, "error: {}", self.error_thrown)?;
        writeln!(f, "response: {}", self.response_text)?;
        writeln!(f, "code: {}", self.code.as_deref().unwrap_or(""))?;
        write!(f, "message: {}", self.message.as_deref().unwrap_or(""))
    }
}

impl std::error::Error for HttpError {}

/// Invalid dispatcher configuration. Raised once, at build time.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("server url must not be empty")]
    EmptyServerUrl,

    #[error("platform must not be empty")]
    EmptyPlatform,

    #[error("token store key for {0} must not be empty")]
    EmptyStoreKey(&'static str),

    #[error("token store key {0:?} is used for more than one token")]
    DuplicateStoreKey(String),

    #[error("maximum GET url length must be greater than zero")]
    ZeroUrlLength,
}

/// Errors around a completed exchange that are not transport failures.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The response body could not be deserialized into the expected type.
    #[error("deserialization failed: {0}")]
    Deserialization(#[source] serde_json::Error),
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        409 => "Conflict",
        412 => "Precondition Failed",
        422 => "Unprocessable Entity",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "",
    }
}
