//! Dispatcher configuration.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Static settings of a dispatcher.
///
/// Deserializable so a host can keep it next to the rest of its settings;
/// every field has a default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// REST root including the version, e.g. `/rest/v10`.
    pub server_url: String,
    pub platform: String,
    pub client_id: String,
    pub client_secret: String,
    /// Enables the bulk path for calls carrying a batch id.
    pub bulk: bool,
    /// Log every request before it is handed to the transport.
    pub debug: bool,
    /// Defer 401s carrying an external login url to the host.
    pub external_login: bool,
    /// GET urls longer than this are sent through a one-item bulk call.
    pub max_get_url_len: usize,
    pub keys: StoreKeys,
}

/// Names under which tokens are kept in a `TokenStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreKeys {
    pub access_token: String,
    pub refresh_token: String,
    pub download_token: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self {
            access_token: "AuthAccessToken".to_string(),
            refresh_token: "AuthRefreshToken".to_string(),
            download_token: "DownloadToken".to_string(),
        }
    }
}

impl StoreKeys {
    pub fn all(&self) -> [&str; 3] {
        [&self.access_token, &self.refresh_token, &self.download_token]
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            server_url: "/rest/v10".to_string(),
            platform: "base".to_string(),
            client_id: "sugar".to_string(),
            client_secret: String::new(),
            bulk: false,
            debug: false,
            external_login: false,
            max_get_url_len: 2048,
            keys: StoreKeys::default(),
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_url.trim().is_empty() {
            return Err(ConfigError::EmptyServerUrl);
        }
        if self.platform.trim().is_empty() {
            return Err(ConfigError::EmptyPlatform);
        }
        if self.max_get_url_len == 0 {
            return Err(ConfigError::ZeroUrlLength);
        }
        let names = ["access token", "refresh token", "download token"];
        let keys = self.keys.all();
        for (name, key) in names.into_iter().zip(keys) {
            if key.is_empty() {
                return Err(ConfigError::EmptyStoreKey(name));
            }
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[i + 1..].contains(key) {
                return Err(ConfigError::DuplicateStoreKey((*key).to_string()));
            }
        }
        Ok(())
    }
}
