//! Canonical REST url construction.
//!
//! Urls take the shape
//! `{server_url}/{module}/{id}/link/{link}/{action}/{related_id}?{params}`,
//! with every segment optional. Query parameters are serialized the way the
//! backend's form decoder expects: `key[]=v` for lists and `key[sub]=v` for
//! nested objects.

use serde_json::Value;

/// Path segment marking every authentication endpoint.
pub const AUTH_SEGMENT: &str = "/oauth2/";
/// Path segment of the login/token endpoint.
pub const LOGIN_SEGMENT: &str = "/oauth2/token";

const CRUD_ACTIONS: [&str; 4] = ["create", "read", "update", "delete"];

/// Relationship link attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Link {
    /// Emits the bare `link` segment.
    Any,
    /// Emits `link/{name}`.
    Named(String),
}

/// Record attributes consulted while building a url.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlAttributes {
    pub id: Option<String>,
    pub link: Option<Link>,
    pub related_id: Option<String>,
    pub field: Option<String>,
    pub file_id: Option<String>,
}

impl UrlAttributes {
    pub fn id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(Link::Named(link.into()));
        self
    }

    pub fn with_related_id(mut self, related_id: impl Into<String>) -> Self {
        self.related_id = Some(related_id.into());
        self
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }
}

/// Stateless url builder bound to a server url such as `/rest/v10`.
#[derive(Debug, Clone)]
pub struct UrlBuilder {
    server_url: String,
}

impl UrlBuilder {
    pub fn new(server_url: &str) -> Self {
        Self {
            server_url: server_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    /// Build the url for `action` on `module`.
    ///
    /// `params` is expected to be a JSON object or `Value::Null`; null
    /// members are skipped.
    pub fn build_url(
        &self,
        module: Option<&str>,
        action: Option<&str>,
        attributes: Option<&UrlAttributes>,
        params: &Value,
    ) -> String {
        let mut parts: Vec<&str> = vec![&self.server_url];

        if let Some(module) = module.filter(|m| !m.is_empty()) {
            parts.push(module);
        }

        if let Some(attrs) = attributes {
            if action != Some("create") {
                if let Some(id) = attrs.id.as_deref() {
                    parts.push(id);
                }
            }
            if action != Some("file") {
                match &attrs.link {
                    Some(Link::Any) => parts.push("link"),
                    Some(Link::Named(name)) => {
                        parts.push("link");
                        parts.push(name);
                    }
                    None => {}
                }
            }
        }

        if let Some(action) = action.filter(|a| !a.is_empty() && !CRUD_ACTIONS.contains(a)) {
            parts.push(action);
        }

        if let Some(attrs) = attributes {
            if let Some(related_id) = attrs.related_id.as_deref() {
                parts.push(related_id);
            }
            if action == Some("file") {
                if let Some(field) = attrs.field.as_deref() {
                    parts.push(field);
                    if let Some(file_id) = attrs.file_id.as_deref() {
                        parts.push(file_id);
                    }
                }
            }
        }

        let mut url = parts.join("/");
        let query = encode_params(params);
        if !query.is_empty() {
            url.push('?');
            url.push_str(&query);
        }
        url
    }

    /// Url of a file field, optionally with extra query parameters.
    pub fn build_file_url(&self, module: &str, attributes: &UrlAttributes, params: &Value) -> String {
        self.build_url(Some(module), Some("file"), Some(attributes), params)
    }

    pub fn login_url(&self) -> String {
        format!("{}{LOGIN_SEGMENT}", self.server_url)
    }

    pub fn logout_url(&self) -> String {
        format!("{}/oauth2/logout", self.server_url)
    }

    pub fn bulk_url(&self) -> String {
        format!("{}/bulk", self.server_url)
    }
}

/// True for every url taking part in login, logout or token refresh.
pub fn is_auth_url(url: &str) -> bool {
    url.contains(AUTH_SEGMENT)
}

/// True for the login/token endpoint.
pub fn is_login_url(url: &str) -> bool {
    url.contains(LOGIN_SEGMENT)
}

/// Strip everything up to and including `/rest`, leaving `/v10/...`.
///
/// Bulk items are addressed relative to the REST root.
pub fn version_relative(url: &str) -> &str {
    match url.find("/rest/") {
        Some(idx) => &url[idx + "/rest".len()..],
        None => url,
    }
}

/// Serialize a JSON object into a query string.
pub fn encode_params(params: &Value) -> String {
    let mut pairs = Vec::new();
    if let Value::Object(map) = params {
        for (key, value) in map {
            push_param(&mut pairs, key, value);
        }
    }
    pairs.join("&")
}

fn push_param(pairs: &mut Vec<String>, prefix: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => {
            for (i, item) in items.iter().enumerate() {
                let key = if item.is_object() || item.is_array() {
                    format!("{prefix}[{i}]")
                } else {
                    format!("{prefix}[]")
                };
                push_param(pairs, &key, item);
            }
        }
        Value::Object(map) => {
            for (k, v) in map {
                push_param(pairs, &format!("{prefix}[{k}]"), v);
            }
        }
        Value::String(s) => pairs.push(format!("{}={}", encode(prefix), encode(s))),
        other => pairs.push(format!("{}={}", encode(prefix), encode(&other.to_string()))),
    }
}

fn encode(s: &str) -> String {
    urlencoding::encode(s).replace("%20", "+")
}
