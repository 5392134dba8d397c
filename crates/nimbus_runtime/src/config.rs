//! Runtime configuration.

use crate::keys::ServiceIdentity;
use nimbus_protocol::PROTOCOL_VERSION;

/// Default cap on inbound frame size.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Key sent as the `key` connection parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AuthorizationKey {
    /// Administrative key.
    Admin(String),
    /// User-scoped key.
    User(String),
}

impl AuthorizationKey {
    /// The raw key.
    pub fn as_str(&self) -> &str {
        match self {
            AuthorizationKey::Admin(k) | AuthorizationKey::User(k) => k,
        }
    }

    /// True for an administrative key.
    pub fn is_admin(&self) -> bool {
        matches!(self, AuthorizationKey::Admin(_))
    }
}

/// Credentials for one connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Credentials {
    /// Authorization key.
    pub authorization_key: AuthorizationKey,
    /// Optional bearer token, sent as the connection subprotocol.
    pub bearer_token: Option<String>,
}

impl Credentials {
    /// Credentials with a user-scoped key.
    pub fn user(key: impl Into<String>) -> Self {
        Self {
            authorization_key: AuthorizationKey::User(key.into()),
            bearer_token: None,
        }
    }

    /// Credentials with an administrative key.
    pub fn admin(key: impl Into<String>) -> Self {
        Self {
            authorization_key: AuthorizationKey::Admin(key.into()),
            bearer_token: None,
        }
    }

    /// Adds a bearer token.
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }
}

/// Configuration for one service client.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Target service build.
    pub service: ServiceIdentity,
    /// Base URL of the service endpoint.
    pub endpoint: String,
    /// Connection credentials.
    pub credentials: Credentials,
    /// Protocol version sent with every request.
    pub protocol_version: u16,
    /// Prefix for request log contexts.
    pub log_context_prefix: Option<String>,
    /// Largest accepted inbound frame.
    pub max_frame_bytes: usize,
}

impl RuntimeConfig {
    /// Creates a configuration with defaults.
    pub fn new(service: ServiceIdentity, endpoint: impl Into<String>, credentials: Credentials) -> Self {
        Self {
            service,
            endpoint: endpoint.into(),
            credentials,
            protocol_version: PROTOCOL_VERSION,
            log_context_prefix: None,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }

    /// Sets the protocol version.
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the log context prefix.
    pub fn with_log_context_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.log_context_prefix = Some(prefix.into());
        self
    }

    /// Sets the inbound frame cap.
    pub fn with_max_frame_bytes(mut self, max: usize) -> Self {
        self.max_frame_bytes = max;
        self
    }

    /// Connection parameters derived from this configuration.
    pub fn connect_params(&self) -> ConnectParams {
        ConnectParams::new(&self.endpoint, &self.credentials)
    }

    /// A fresh log context: the prefix, if any, followed by a UUID.
    pub fn new_log_context(&self) -> String {
        let id = uuid::Uuid::new_v4();
        match &self.log_context_prefix {
            Some(prefix) => format!("{prefix}-{id}"),
            None => id.to_string(),
        }
    }
}

/// What a connector needs to open a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectParams {
    /// Connect URL with the authorization key as a query parameter.
    pub url: String,
    /// Bearer token offered as the subprotocol.
    pub subprotocol: Option<String>,
}

impl ConnectParams {
    /// Derives parameters from an endpoint and credentials.
    pub fn new(endpoint: &str, credentials: &Credentials) -> Self {
        let url = format!(
            "{}/connect?key={}",
            endpoint.trim_end_matches('/'),
            urlencoding::encode(credentials.authorization_key.as_str())
        );
        Self {
            url,
            subprotocol: credentials.bearer_token.clone(),
        }
    }

    /// The decoded `key` query parameter, if present.
    pub fn authorization_key(&self) -> Option<String> {
        let (_, query) = self.url.split_once('?')?;
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == "key")
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|value| value.into_owned())
    }
}
