//! A single logical API call and its transport attempts.
//!
//! # Design
//! A `PendingRequest` lives from `Dispatcher::call` until its completion
//! fires. It is executed once, or twice when it is replayed after a token
//! refresh. Headers are attached at execution time so a replay picks up the
//! refreshed token.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::callbacks::Callbacks;
use crate::http::{Body, HttpMethod, HttpRequest, Method};

pub const OAUTH_TOKEN_HEADER: &str = "OAuth-Token";
pub const METADATA_HASH_HEADER: &str = "X-Metadata-Hash";
pub const USERPREF_HASH_HEADER: &str = "X-Userpref-Hash";

/// Identity of a request, unique per dispatcher and increasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub(crate) u64);

impl RequestId {
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request body supplied by a caller.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    /// Multipart or binary body; bypasses JSON encoding.
    Raw { content_type: String, bytes: Vec<u8> },
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Json(value)
    }
}

/// Per-call transport overrides and dispatcher flags.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    /// Batch id to queue this call under when bulk mode is on.
    pub bulk: Option<String>,
    /// Omit the metadata and user-preference hash headers.
    pub skip_metadata_hash: bool,
    /// Extra headers, applied before the auth/context headers.
    pub headers: Vec<(String, String)>,
}

impl CallOptions {
    pub fn bulk(batch_id: impl Into<String>) -> Self {
        Self {
            bulk: Some(batch_id.into()),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn skip_metadata_hash(mut self) -> Self {
        self.skip_metadata_hash = true;
        self
    }
}

/// Header values attached at execution time.
#[derive(Debug, Clone, Default)]
pub(crate) struct ContextHeaders {
    pub token: Option<String>,
    pub metadata_hash: Option<String>,
    pub userpref_hash: Option<String>,
}

/// What happens when a request resolves.
pub(crate) enum Continuation {
    /// An ordinary call: fire the caller's handlers.
    Caller(Callbacks),
    /// A batched call: demultiplex into the listed items.
    Bulk(Vec<RequestId>),
    /// The credential refresh call.
    Refresh,
}

pub struct PendingRequest {
    pub(crate) id: RequestId,
    pub(crate) method: Method,
    pub(crate) url: String,
    pub(crate) payload: Option<Payload>,
    pub(crate) options: CallOptions,
    pub(crate) debug: bool,
    pub(crate) aborted: bool,
    /// Set while the request is being replayed after a refresh.
    pub(crate) dequeuing: bool,
    pub(crate) executions: u32,
    pub(crate) state: BTreeMap<String, Value>,
    pub(crate) continuation: Continuation,
}

impl PendingRequest {
    pub(crate) fn new(
        id: RequestId,
        method: Method,
        url: String,
        payload: Option<Payload>,
        options: CallOptions,
        debug: bool,
        continuation: Continuation,
    ) -> Self {
        Self {
            id,
            method,
            url,
            payload,
            options,
            debug,
            aborted: false,
            dequeuing: false,
            executions: 0,
            state: BTreeMap::new(),
            continuation,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn method(&self) -> Method {
        self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    pub fn is_dequeuing(&self) -> bool {
        self.dequeuing
    }

    /// Number of times this request has been handed to the transport.
    pub fn executions(&self) -> u32 {
        self.executions
    }

    /// Contextual state captured at the last execution.
    pub fn state(&self) -> &BTreeMap<String, Value> {
        &self.state
    }

    /// Build the transport request for one attempt.
    pub(crate) fn execute(
        &mut self,
        context: &ContextHeaders,
        state: &BTreeMap<String, Value>,
    ) -> HttpRequest {
        let method = self.method.http_method();
        let mut headers = vec![("Accept".to_string(), "application/json".to_string())];

        let body = match (&self.payload, method) {
            (_, HttpMethod::Get) | (None, _) => None,
            (Some(Payload::Json(value)), _) => {
                headers.push(("Content-Type".to_string(), "application/json".to_string()));
                Some(Body::Json(value.to_string()))
            }
            (Some(Payload::Raw { content_type, bytes }), _) => Some(Body::Raw {
                content_type: content_type.clone(),
                bytes: bytes.clone(),
            }),
        };

        headers.extend(self.options.headers.iter().cloned());
        if let Some(token) = &context.token {
            headers.push((OAUTH_TOKEN_HEADER.to_string(), token.clone()));
        }
        if let Some(hash) = &context.metadata_hash {
            headers.push((METADATA_HASH_HEADER.to_string(), hash.clone()));
        }
        if let Some(hash) = &context.userpref_hash {
            headers.push((USERPREF_HASH_HEADER.to_string(), hash.clone()));
        }

        self.state = state.clone();
        self.executions += 1;

        let request = HttpRequest {
            method,
            url: self.url.clone(),
            headers,
            body,
            timeout: self.options.timeout,
        };

        if self.debug {
            tracing::debug!(
                id = %self.id,
                method = method.as_str(),
                url = %request.url,
                payload = %redacted_payload(self.payload.as_ref()),
                headers = ?request.headers,
                timeout = ?request.timeout,
                "executing request"
            );
        }

        request
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("aborted", &self.aborted)
            .field("dequeuing", &self.dequeuing)
            .field("executions", &self.executions)
            .finish()
    }
}

/// Render a payload for diagnostics with any `password` field masked.
pub(crate) fn redacted_payload(payload: Option<&Payload>) -> String {
    match payload {
        None => String::new(),
        Some(Payload::Raw { content_type, bytes }) => {
            format!("<{} bytes of {content_type}>", bytes.len())
        }
        Some(Payload::Json(value)) => {
            let mut value = value.clone();
            if let Some(password) = value.get_mut("password") {
                *password = Value::String("***".to_string());
            }
            value.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pending(method: Method, payload: Option<Payload>) -> PendingRequest {
        PendingRequest::new(
            RequestId(1),
            method,
            "/rest/v10/Accounts".to_string(),
            payload,
            CallOptions::default(),
            false,
            Continuation::Caller(Callbacks::new()),
        )
    }

    #[test]
    fn absent_context_values_add_no_headers() {
        let mut req = pending(Method::Read, None);
        let http = req.execute(&ContextHeaders::default(), &BTreeMap::new());
        assert!(http.header(OAUTH_TOKEN_HEADER).is_none());
        assert!(http.header(METADATA_HASH_HEADER).is_none());
        assert!(http.header(USERPREF_HASH_HEADER).is_none());
        assert_eq!(http.header("accept"), Some("application/json"));
    }

    #[test]
    fn present_context_values_become_headers() {
        let mut req = pending(Method::Read, None);
        let context = ContextHeaders {
            token: Some("tok".to_string()),
            metadata_hash: Some("m1".to_string()),
            userpref_hash: Some("u1".to_string()),
        };
        let http = req.execute(&context, &BTreeMap::new());
        assert_eq!(http.header(OAUTH_TOKEN_HEADER), Some("tok"));
        assert_eq!(http.header(METADATA_HASH_HEADER), Some("m1"));
        assert_eq!(http.header(USERPREF_HASH_HEADER), Some("u1"));
        assert_eq!(req.executions(), 1);
    }

    #[test]
    fn get_never_carries_a_body() {
        let mut req = pending(Method::Read, Some(json!({"a": 1}).into()));
        let http = req.execute(&ContextHeaders::default(), &BTreeMap::new());
        assert!(http.body.is_none());
    }

    #[test]
    fn json_payload_is_encoded() {
        let mut req = pending(Method::Create, Some(json!({"name": "Acme"}).into()));
        let http = req.execute(&ContextHeaders::default(), &BTreeMap::new());
        assert_eq!(http.body, Some(Body::Json(r#"{"name":"Acme"}"#.to_string())));
        assert_eq!(http.header("content-type"), Some("application/json"));
    }

    #[test]
    fn raw_payload_bypasses_json() {
        let payload = Payload::Raw {
            content_type: "multipart/form-data; boundary=x".to_string(),
            bytes: b"--x--".to_vec(),
        };
        let mut req = pending(Method::Create, Some(payload));
        let http = req.execute(&ContextHeaders::default(), &BTreeMap::new());
        assert!(matches!(http.body, Some(Body::Raw { .. })));
        assert!(http.header("content-type").is_none());
    }

    #[test]
    fn state_is_snapshotted_at_execution() {
        let mut req = pending(Method::Read, None);
        let mut state = BTreeMap::new();
        state.insert("module".to_string(), json!("Accounts"));
        req.execute(&ContextHeaders::default(), &state);
        state.insert("module".to_string(), json!("Contacts"));
        assert_eq!(req.state()["module"], json!("Accounts"));
    }

    #[test]
    fn password_is_masked() {
        let payload = Payload::Json(json!({"username": "admin", "password": "secret"}));
        let rendered = redacted_payload(Some(&payload));
        assert!(rendered.contains("admin"));
        assert!(!rendered.contains("secret"));
        assert!(rendered.contains("***"));
    }
}
