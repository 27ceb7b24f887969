//! Connection settings for the Proxmox API.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// Default node name.
pub const DEFAULT_NODE: &str = "pve01";

/// Default per-request timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Invalid connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("API URL must start with http:// or https://, got {0:?}")]
    InvalidUrl(String),

    #[error("API user must not be empty")]
    EmptyUser,

    #[error("node name must not be empty")]
    EmptyNode,

    #[error("request timeout must be non-zero")]
    ZeroTimeout,
}

/// Proxmox API connection settings.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxmoxConfig {
    /// Base URL, e.g. `https://pve01:8006`.
    pub api_url: String,
    /// API user including realm, e.g. `root@pam`.
    pub user: String,
    pub password: String,
    pub node: String,
    /// Reject self-signed certificates when true.
    pub verify_tls: bool,
    pub timeout: Duration,
}

impl ProxmoxConfig {
    /// Create a config with defaults for everything but the credentials.
    pub fn new(
        api_url: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            api_url: api_url.into(),
            user: user.into(),
            password: password.into(),
            node: DEFAULT_NODE.to_string(),
            verify_tls: false,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Builder: set node.
    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = node.into();
        self
    }

    /// Builder: set verify_tls.
    pub fn with_verify_tls(mut self, verify_tls: bool) -> Self {
        self.verify_tls = verify_tls;
        self
    }

    /// Builder: set timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.api_url.starts_with("https://") || self.api_url.starts_with("http://")) {
            return Err(ConfigError::InvalidUrl(self.api_url.clone()));
        }
        if self.user.trim().is_empty() {
            return Err(ConfigError::EmptyUser);
        }
        if self.node.trim().is_empty() {
            return Err(ConfigError::EmptyNode);
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }
        Ok(())
    }

    /// `<api_url>/api2/json<path>`.
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}/api2/json{}", self.api_url.trim_end_matches('/'), path)
    }
}

// Keeps the password out of logs.
impl fmt::Debug for ProxmoxConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxmoxConfig")
            .field("api_url", &self.api_url)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("node", &self.node)
            .field("verify_tls", &self.verify_tls)
            .field("timeout", &self.timeout)
            .finish()
    }
}
