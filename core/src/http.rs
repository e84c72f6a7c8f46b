//! HTTP transport types for the host-does-IO pattern.
//!
//! # Design
//! These types describe HTTP requests and responses as plain data. The
//! dispatcher builds `HttpRequest` values and consumes `TransportOutcome`
//! values without ever touching the network; the host executes the I/O.
//!
//! Single requests and bulk items resolve through the same
//! `TransportOutcome` type, so the error-interception path does not care
//! whether an outcome came off the wire or out of a demultiplexed batch.

use std::time::Duration;

/// HTTP method for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Delete => "DELETE",
        }
    }
}

/// CRUD verb used by callers of `Dispatcher::call`.
///
/// The mapping to HTTP verbs is not the obvious one: `create` is a `POST` and
/// `update` is a `PUT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Read,
    Create,
    Update,
    Delete,
}

impl Method {
    pub fn http_method(&self) -> HttpMethod {
        match self {
            Method::Read => HttpMethod::Get,
            Method::Create => HttpMethod::Post,
            Method::Update => HttpMethod::Put,
            Method::Delete => HttpMethod::Delete,
        }
    }

    pub fn as_action(&self) -> &'static str {
        match self {
            Method::Read => "read",
            Method::Create => "create",
            Method::Update => "update",
            Method::Delete => "delete",
        }
    }
}

/// Request body as handed to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Body {
    /// JSON-encoded text, sent with `content-type: application/json`.
    Json(String),
    /// Pre-built body (multipart form, binary upload). Sent as-is.
    Raw { content_type: String, bytes: Vec<u8> },
}

/// An HTTP request described as plain data.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Body>,
    /// Transport-level timeout requested by the caller, if any.
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

/// An HTTP response described as plain data.
#[derive(Debug, Clone, Default)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// A response carrying a JSON body with the matching content type.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string(),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_json(&self) -> bool {
        self.header("content-type")
            .is_some_and(|ct| ct.to_ascii_lowercase().contains("json"))
    }
}

/// Result of one transport attempt as reported by the host.
#[derive(Debug, Clone)]
pub enum TransportOutcome {
    /// The server answered. Any status, including 4xx/5xx.
    Response(HttpResponse),
    /// No response at all (connection refused, DNS, timeout).
    NetworkFailure { text_status: String, error: String },
}

impl TransportOutcome {
    pub fn is_success(&self) -> bool {
        match self {
            TransportOutcome::Response(response) => response.is_success(),
            TransportOutcome::NetworkFailure { .. } => false,
        }
    }

    pub fn status(&self) -> u16 {
        match self {
            TransportOutcome::Response(response) => response.status,
            TransportOutcome::NetworkFailure { .. } => 0,
        }
    }
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crud_verbs_map_to_http_methods() {
        assert_eq!(Method::Read.http_method(), HttpMethod::Get);
        assert_eq!(Method::Create.http_method(), HttpMethod::Post);
        assert_eq!(Method::Update.http_method(), HttpMethod::Put);
        assert_eq!(Method::Delete.http_method(), HttpMethod::Delete);
    }

    #[test]
    fn header_lookup_ignores_case() {
        let response = HttpResponse {
            status: 200,
            headers: vec![("Content-Type".to_string(), "application/json; charset=utf-8".to_string())],
            body: "{}".to_string(),
        };
        assert_eq!(response.header("content-type"), Some("application/json; charset=utf-8"));
        assert!(response.is_json());
    }

    #[test]
    fn network_failure_has_status_zero() {
        let outcome = TransportOutcome::NetworkFailure {
            text_status: "error".to_string(),
            error: "connection refused".to_string(),
        };
        assert_eq!(outcome.status(), 0);
        assert!(!outcome.is_success());
    }
}
