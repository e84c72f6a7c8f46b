//! Convenience wrappers over `Dispatcher::call`.
//!
//! Each method only marshals its arguments into a url and a payload; all
//! lifecycle and refresh behaviour lives in the dispatcher.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::callbacks::Callbacks;
use crate::dispatcher::Dispatcher;
use crate::http::Method;
use crate::request::{CallOptions, Payload, RequestId};
use crate::url::{Link, UrlAttributes};

/// Username/password pair for the password grant.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoginCredentials {
    pub username: String,
    pub password: String,
}

/// Target of a relationship call.
#[derive(Debug, Clone, Default)]
pub struct RelationshipData {
    pub id: String,
    pub link: String,
    pub related_id: Option<String>,
    /// Body for create/update.
    pub related: Option<Value>,
}

/// Query flags of a file download url.
#[derive(Debug, Clone, Default)]
pub struct FileUrlOptions {
    pub pass_download_token: bool,
    pub force_download: bool,
    pub html_json_format: bool,
    pub delete_if_fails: bool,
    pub keep: bool,
    pub platform: Option<String>,
}

impl Dispatcher {
    /// Password-grant login. `extra` members are merged into the payload.
    pub fn login(
        &mut self,
        credentials: &LoginCredentials,
        extra: Option<&Value>,
        callbacks: Callbacks,
    ) -> RequestId {
        let config = self.config();
        let mut payload = json!({
            "username": credentials.username,
            "password": credentials.password,
            "grant_type": "password",
            "client_id": config.client_id,
            "client_secret": config.client_secret,
            "platform": config.platform,
        });
        if let (Some(Value::Object(extra)), Value::Object(base)) = (extra, &mut payload) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        let url = self.urls().login_url();
        self.call(Method::Create, url, Some(Payload::Json(payload)), callbacks, CallOptions::default())
    }

    /// Revoke the current token. Credentials are cleared once it resolves.
    pub fn logout(&mut self, callbacks: Callbacks) -> RequestId {
        let payload = json!({ "token": self.get_oauth_token().unwrap_or_default() });
        let url = self.urls().logout_url();
        self.call(Method::Create, url, Some(Payload::Json(payload)), callbacks, CallOptions::default())
    }

    /// CRUD on a module. The record id, when needed, is read from `data.id`.
    pub fn records(
        &mut self,
        method: Method,
        module: &str,
        data: &Value,
        params: &Value,
        callbacks: Callbacks,
        options: CallOptions,
    ) -> RequestId {
        let attributes = UrlAttributes {
            id: data.get("id").and_then(Value::as_str).map(str::to_string),
            ..UrlAttributes::default()
        };
        let url = self
            .urls()
            .build_url(Some(module), Some(method.as_action()), Some(&attributes), params);
        let payload = body_for(method, data);
        self.call(method, url, payload, callbacks, options)
    }

    /// CRUD on a relationship link of a record.
    pub fn relationships(
        &mut self,
        method: Method,
        module: &str,
        data: &RelationshipData,
        params: &Value,
        callbacks: Callbacks,
        options: CallOptions,
    ) -> RequestId {
        let attributes = UrlAttributes {
            id: Some(data.id.clone()),
            link: Some(Link::Named(data.link.clone())),
            related_id: data.related_id.clone(),
            ..UrlAttributes::default()
        };
        let url = self
            .urls()
            .build_url(Some(module), Some(method.as_action()), Some(&attributes), params);
        let payload = data.related.as_ref().and_then(|related| body_for(method, related));
        self.call(method, url, payload, callbacks, options)
    }

    /// Full-text search, optionally scoped to a module.
    pub fn search(
        &mut self,
        module: Option<&str>,
        params: &Value,
        callbacks: Callbacks,
        options: CallOptions,
    ) -> RequestId {
        let url = self.urls().build_url(module, Some("search"), None, params);
        self.call(Method::Read, url, None, callbacks, options)
    }

    /// Current user: read or update.
    pub fn me(&mut self, method: Method, data: Option<&Value>, params: &Value, callbacks: Callbacks) -> RequestId {
        let url = self.urls().build_url(Some("me"), Some(method.as_action()), None, params);
        let payload = data.and_then(|d| body_for(method, d));
        self.call(method, url, payload, callbacks, CallOptions::default())
    }

    /// Metadata download. Sent without the metadata hash header, since the
    /// hash it would carry is what this call refreshes.
    pub fn metadata(
        &mut self,
        hash: Option<&str>,
        types: &[&str],
        modules: &[&str],
        callbacks: Callbacks,
    ) -> RequestId {
        let mut params = Map::new();
        if !types.is_empty() {
            params.insert("type_filter".to_string(), Value::String(types.join(",")));
        }
        if !modules.is_empty() {
            params.insert("module_filter".to_string(), Value::String(modules.join(",")));
        }
        if let Some(hash) = hash {
            params.insert("_hash".to_string(), Value::String(hash.to_string()));
        }
        let url = self
            .urls()
            .build_url(Some("metadata"), Some("read"), None, &Value::Object(params));
        self.call(Method::Read, url, None, callbacks, CallOptions::default().skip_metadata_hash())
    }

    /// Dropdown options of an enum field.
    pub fn enum_options(&mut self, module: &str, field: &str, callbacks: Callbacks) -> RequestId {
        let action = format!("enum/{field}");
        let url = self.urls().build_url(Some(module), Some(&action), None, &Value::Null);
        self.call(Method::Read, url, None, callbacks, CallOptions::default())
    }

    /// Compiled stylesheet urls for a platform and theme.
    pub fn css(&mut self, platform: &str, theme_name: Option<&str>, callbacks: Callbacks) -> RequestId {
        let mut params = json!({ "platform": platform });
        if let Some(theme) = theme_name {
            params["themeName"] = Value::String(theme.to_string());
        }
        let url = self.urls().build_url(Some("css"), Some("read"), None, &params);
        self.call(Method::Read, url, None, callbacks, CallOptions::default())
    }

    /// Anonymous lead registration.
    pub fn signup(&mut self, data: &Value, callbacks: Callbacks) -> RequestId {
        let url = self
            .urls()
            .build_url(Some("Leads"), Some("register"), None, &Value::Null);
        self.call(
            Method::Create,
            url,
            Some(Payload::Json(data.clone())),
            callbacks,
            CallOptions::default(),
        )
    }

    /// Check the current user's password.
    pub fn verify_password(&mut self, password: &str, callbacks: Callbacks) -> RequestId {
        let url = self
            .urls()
            .build_url(Some("me"), Some("password"), None, &Value::Null);
        let payload = json!({ "password_to_verify": password });
        self.call(Method::Create, url, Some(Payload::Json(payload)), callbacks, CallOptions::default())
    }

    /// Download url of a file field.
    pub fn file_url(&self, module: &str, attributes: &UrlAttributes, options: &FileUrlOptions) -> String {
        let mut params = Map::new();
        if options.html_json_format {
            params.insert("format".to_string(), json!("sugar-html-json"));
        }
        if options.delete_if_fails {
            params.insert("delete_if_fails".to_string(), json!(1));
        }
        if options.keep {
            params.insert("keep".to_string(), json!(1));
        }
        if let Some(platform) = &options.platform {
            params.insert("platform".to_string(), json!(platform));
        }
        if options.force_download {
            params.insert("force_download".to_string(), json!(1));
        }
        if options.pass_download_token {
            if let Some(token) = self.get_download_token() {
                params.insert("download_token".to_string(), json!(token));
            }
        }
        self.urls()
            .build_file_url(module, attributes, &Value::Object(params))
    }
}

fn body_for(method: Method, data: &Value) -> Option<Payload> {
    match method {
        Method::Read => None,
        _ if data.is_null() => None,
        _ => Some(Payload::Json(data.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherConfig;
    use crate::dispatcher::{Action, Credentials};
    use crate::http::{Body, HttpMethod};

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(DispatcherConfig::default()).unwrap()
    }

    fn sent(d: &mut Dispatcher) -> crate::http::HttpRequest {
        match d.poll_action() {
            Some(Action::Send { request, .. }) => request,
            other => panic!("expected a send, got {other:?}"),
        }
    }

    #[test]
    fn login_sends_password_grant_without_token() {
        let mut d = dispatcher();
        d.set_tokens(&Credentials {
            access_token: "old".to_string(),
            refresh_token: "r".to_string(),
            download_token: "d".to_string(),
        });
        let creds = LoginCredentials {
            username: "admin".to_string(),
            password: "asdf".to_string(),
        };
        d.login(&creds, Some(&json!({"client_info": {"current_language": "en_us"}})), Callbacks::new());
        let req = sent(&mut d);
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.url, "/rest/v10/oauth2/token");
        assert!(req.header("OAuth-Token").is_none());
        let Some(Body::Json(body)) = req.body else {
            panic!("expected a JSON body");
        };
        let body: Value = serde_json::from_str(&body).unwrap();
        assert_eq!(body["grant_type"], "password");
        assert_eq!(body["username"], "admin");
        assert_eq!(body["client_id"], "sugar");
        assert_eq!(body["platform"], "base");
        assert_eq!(body["client_info"]["current_language"], "en_us");
    }

    #[test]
    fn records_update_uses_id_from_data() {
        let mut d = dispatcher();
        d.records(
            Method::Update,
            "Contacts",
            &json!({"id": "1234", "first_name": "Jo"}),
            &Value::Null,
            Callbacks::new(),
            CallOptions::default(),
        );
        let req = sent(&mut d);
        assert_eq!(req.method, HttpMethod::Put);
        assert_eq!(req.url, "/rest/v10/Contacts/1234");
        assert!(req.body.is_some());
    }

    #[test]
    fn records_read_has_params_and_no_body() {
        let mut d = dispatcher();
        d.records(
            Method::Read,
            "Accounts",
            &Value::Null,
            &json!({"max_num": 5}),
            Callbacks::new(),
            CallOptions::default(),
        );
        let req = sent(&mut d);
        assert_eq!(req.url, "/rest/v10/Accounts?max_num=5");
        assert!(req.body.is_none());
    }

    #[test]
    fn relationship_create_posts_related_record() {
        let mut d = dispatcher();
        let data = RelationshipData {
            id: "1".to_string(),
            link: "contacts".to_string(),
            related_id: None,
            related: Some(json!({"first_name": "Al"})),
        };
        d.relationships(Method::Create, "Accounts", &data, &Value::Null, Callbacks::new(), CallOptions::default());
        let req = sent(&mut d);
        assert_eq!(req.method, HttpMethod::Post);
        assert_eq!(req.url, "/rest/v10/Accounts/1/link/contacts");
    }

    #[test]
    fn metadata_skips_hash_headers() {
        let mut d = dispatcher();
        d.set_metadata_hash(Some("m1".to_string()));
        d.set_userpref_hash(Some("u1".to_string()));
        d.metadata(Some("abc"), &["modules", "labels"], &[], Callbacks::new());
        let req = sent(&mut d);
        assert_eq!(
            req.url,
            "/rest/v10/metadata?type_filter=modules%2Clabels&_hash=abc"
        );
        assert!(req.header("X-Metadata-Hash").is_none());
        assert!(req.header("X-Userpref-Hash").is_none());
    }

    #[test]
    fn enum_search_and_css_urls() {
        let mut d = dispatcher();
        d.enum_options("Accounts", "industry", Callbacks::new());
        assert_eq!(sent(&mut d).url, "/rest/v10/Accounts/enum/industry");

        d.search(None, &json!({"q": "acme"}), Callbacks::new(), CallOptions::default());
        assert_eq!(sent(&mut d).url, "/rest/v10/search?q=acme");

        d.css("portal", Some("default"), Callbacks::new());
        assert_eq!(sent(&mut d).url, "/rest/v10/css?platform=portal&themeName=default");
    }

    #[test]
    fn file_url_passes_download_token() {
        let mut d = dispatcher();
        d.set_tokens(&Credentials {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            download_token: "dl".to_string(),
        });
        let attrs = UrlAttributes::id("n1").with_field("filename");
        let options = FileUrlOptions {
            pass_download_token: true,
            force_download: true,
            ..FileUrlOptions::default()
        };
        assert_eq!(
            d.file_url("Notes", &attrs, &options),
            "/rest/v10/Notes/n1/file/filename?force_download=1&download_token=dl"
        );
    }

    #[test]
    fn logout_carries_current_token() {
        let mut d = dispatcher();
        d.set_tokens(&Credentials {
            access_token: "a".to_string(),
            refresh_token: "r".to_string(),
            download_token: "dl".to_string(),
        });
        d.logout(Callbacks::new());
        let req = sent(&mut d);
        assert_eq!(req.url, "/rest/v10/oauth2/logout");
        assert_eq!(req.header("OAuth-Token"), Some("a"));
    }
}
