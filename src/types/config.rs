use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Bounds for the HTTP request timeout (seconds).
pub const HTTP_TIMEOUT_MIN_SECS: u64 = 1;
pub const HTTP_TIMEOUT_MAX_SECS: u64 = 300;
pub const HTTP_TIMEOUT_DEFAULT_SECS: u64 = 30;

/// Transport-specific settings for a server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Local subprocess speaking JSON-RPC over stdio pipes.
    Stdio {
        command: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        args: Vec<String>,
        /// Overlaid on top of the parent environment; overlay wins.
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },

    /// Long-lived HTTP event stream with a POST side-channel.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        /// Override for the stream endpoint; defaults to `url`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sse_endpoint: Option<String>,
        /// Override for the outbound POST endpoint; defaults to `url`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        post_endpoint: Option<String>,
    },

    /// Plain request/response HTTP.
    Http {
        url: String,
        #[serde(default)]
        method: HttpMethod,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
        /// Clamped to 1..=300 by [`ServerConfig::validate`].
        #[serde(default = "default_http_timeout")]
        timeout_secs: u64,
    },
}

fn default_http_timeout() -> u64 {
    HTTP_TIMEOUT_DEFAULT_SECS
}

impl TransportConfig {
    /// Short tag used in logs and dedup keys.
    pub fn kind(&self) -> &'static str {
        match self {
            TransportConfig::Stdio { .. } => "stdio",
            TransportConfig::Sse { .. } => "sse",
            TransportConfig::Http { .. } => "http",
        }
    }

    /// The field that defines identity for dedup: command for stdio,
    /// URL for the remote transports.
    pub fn defining_field(&self) -> &str {
        match self {
            TransportConfig::Stdio { command, .. } => command,
            TransportConfig::Sse { url, .. } | TransportConfig::Http { url, .. } => url,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    #[default]
    Post,
}

/// Which external tool ecosystem a configuration was imported from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    ClaudeDesktop,
    Vscode,
    Cursor,
    Windsurf,
    Zed,
    Generic,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::ClaudeDesktop => "claude-desktop",
            ClientKind::Vscode => "vscode",
            ClientKind::Cursor => "cursor",
            ClientKind::Windsurf => "windsurf",
            ClientKind::Zed => "zed",
            ClientKind::Generic => "generic",
        }
    }
}

/// Where an imported configuration came from, kept for export round-trips.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub client: ClientKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
}

/// OAuth 2.1 settings for a remote server that requires a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthConfig {
    pub client_id: String,
    pub authorize_url: String,
    pub token_url: String,
    pub redirect_uri: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
}

/// Restart policy for stdio servers that exit unexpectedly.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RestartPolicy {
    /// Respawn automatically on unexpected exit.
    pub auto: bool,
    /// Consecutive failures tolerated before giving up.
    pub max_consecutive: u32,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            auto: false,
            max_consecutive: 5,
        }
    }
}

/// A configured tool-provider server.
///
/// `id` is immutable after creation; every mutation must go through
/// [`ServerConfig::touch`] so `updated_at` advances monotonically.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provenance: Option<Provenance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OAuthConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    pub transport: TransportConfig,
}

impl ServerConfig {
    /// Create a configuration with a generated id and current timestamps.
    pub fn new(name: impl Into<String>, transport: TransportConfig) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: None,
            enabled: true,
            created_at: now,
            updated_at: now,
            provenance: None,
            oauth: None,
            restart_policy: None,
            transport,
        }
    }

    /// Advance `updated_at`. Monotonic even if the wall clock stepped
    /// backwards between mutations.
    pub fn touch(&mut self) {
        let now = Utc::now();
        let floor = self.updated_at + Duration::milliseconds(1);
        self.updated_at = if now > floor { now } else { floor };
    }

    /// Validate transport invariants, clamping the HTTP timeout into range.
    pub fn validate(&mut self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidConfig("server name is empty".into()));
        }
        match &mut self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(Error::InvalidConfig("stdio command is empty".into()));
                }
            }
            TransportConfig::Sse { url, .. } => {
                url::Url::parse(url)
                    .map_err(|e| Error::InvalidConfig(format!("bad SSE url: {e}")))?;
            }
            TransportConfig::Http { url, timeout_secs, .. } => {
                url::Url::parse(url)
                    .map_err(|e| Error::InvalidConfig(format!("bad HTTP url: {e}")))?;
                *timeout_secs = (*timeout_secs).clamp(HTTP_TIMEOUT_MIN_SECS, HTTP_TIMEOUT_MAX_SECS);
            }
        }
        Ok(())
    }
}
