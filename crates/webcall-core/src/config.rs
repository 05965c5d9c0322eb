//! Client configuration
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         ClientConfig         │
//! │ ┌──────────────────────────┐ │
//! │ │ AccountConfig            │ │  • identity URI & credentials
//! │ │ TransportConfig          │ │  • websocket servers, ICE, deadlines
//! │ │ ReconnectionConfig       │ │  • backoff, burst, dying budget
//! │ │ MediaConfig             ─┼─┼─ • default devices, stats polling
//! │ └──────────────────────────┘ │
//! └──────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust
//! use webcall_core::config::ClientConfig;
//!
//! let config = ClientConfig::new("sip:201@example.com", "201", "secret")
//!     .with_ws_server("wss://pbx.example.com/ws")
//!     .with_ice_server("stun:stun.example.com:3478")
//!     .with_keepalive_interval_ms(Some(15_000));
//!
//! assert!(config.validate().is_ok());
//! assert_eq!(config.domain(), "example.com");
//! ```
//!
//! Configuration may also be loaded from JSON:
//!
//! ```rust
//! use webcall_core::config::ClientConfig;
//!
//! let json = r#"{
//!     "account": { "uri": "sip:201@example.com", "user": "201", "password": "secret" },
//!     "transport": { "ws_servers": ["wss://pbx.example.com/ws"] }
//! }"#;
//! let config = ClientConfig::from_json_str(json).unwrap();
//! assert_eq!(config.reconnection.dying_budget_ms, 60_000);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{ClientError, ClientResult};

/// Account identity and credentials
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Address of record, e.g. `sip:201@example.com`
    pub uri: String,
    /// Digest authentication username
    pub user: String,
    /// Digest authentication password. Never logged.
    pub password: String,
    /// Name shown to callees
    #[serde(default)]
    pub display_name: Option<String>,
    /// Contact user part, defaults to a random token chosen by the engine
    #[serde(default)]
    pub contact_name: Option<String>,
}

/// Signalling transport settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// WebSocket signalling endpoints, tried in order
    pub ws_servers: Vec<String>,
    /// STUN/TURN servers handed to the media layer
    pub ice_servers: Vec<String>,
    pub user_agent_string: String,
    /// Requested registration lifetime
    pub register_expires_secs: u32,
    /// Deadline for a websocket handshake (engine start and probes)
    pub ws_timeout_ms: u64,
    /// Deadline for a REGISTER / un-REGISTER round trip
    pub register_timeout_ms: u64,
    /// OPTIONS keepalive period while connected. `None` disables pings.
    pub keepalive_interval_ms: Option<u64>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ws_servers: Vec::new(),
            ice_servers: Vec::new(),
            user_agent_string: format!("webcall-core/{}", env!("CARGO_PKG_VERSION")),
            register_expires_secs: 600,
            ws_timeout_ms: 5_000,
            register_timeout_ms: 10_000,
            keepalive_interval_ms: None,
        }
    }
}

/// Reconnection tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionConfig {
    /// First backoff interval in once mode
    pub retry_interval_ms: u64,
    /// Backoff ceiling
    pub retry_limit_ms: u64,
    /// Probe period in burst mode
    pub burst_interval_ms: u64,
    /// Time an in-progress call is considered recoverable after network loss.
    ///
    /// Assumes the server tears the dialog down after roughly this long; check
    /// the real value for your PBX.
    pub dying_budget_ms: u64,
    /// Granularity of the dying countdown
    pub dying_tick_ms: u64,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            retry_interval_ms: 2_000,
            retry_limit_ms: 30_000,
            burst_interval_ms: 100,
            dying_budget_ms: 60_000,
            dying_tick_ms: 1_000,
        }
    }
}

/// Default device settings for new sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// `None` selects the system default device
    pub device_id: Option<String>,
    pub volume: f32,
    pub muted: bool,
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            device_id: None,
            volume: 1.0,
            muted: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub input: DeviceSettings,
    pub output: DeviceSettings,
    /// How often call quality is sampled
    pub stats_interval_ms: u64,
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            input: DeviceSettings::default(),
            output: DeviceSettings::default(),
            stats_interval_ms: 5_000,
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub account: AccountConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub reconnection: ReconnectionConfig,
    #[serde(default)]
    pub media: MediaConfig,
}

impl ClientConfig {
    pub fn new(uri: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            account: AccountConfig {
                uri: uri.into(),
                user: user.into(),
                password: password.into(),
                display_name: None,
                contact_name: None,
            },
            transport: TransportConfig::default(),
            reconnection: ReconnectionConfig::default(),
            media: MediaConfig::default(),
        }
    }

    /// Parse a JSON document and validate it
    pub fn from_json_str(json: &str) -> ClientResult<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| ClientError::invalid_configuration("json", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.account.display_name = Some(name.into());
        self
    }

    pub fn with_ws_server(mut self, url: impl Into<String>) -> Self {
        self.transport.ws_servers.push(url.into());
        self
    }

    pub fn with_ice_server(mut self, url: impl Into<String>) -> Self {
        self.transport.ice_servers.push(url.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.transport.user_agent_string = user_agent.into();
        self
    }

    pub fn with_keepalive_interval_ms(mut self, interval: Option<u64>) -> Self {
        self.transport.keepalive_interval_ms = interval;
        self
    }

    pub fn with_reconnection(mut self, reconnection: ReconnectionConfig) -> Self {
        self.reconnection = reconnection;
        self
    }

    pub fn with_media(mut self, media: MediaConfig) -> Self {
        self.media = media;
        self
    }

    /// Host part of the account URI, used to complete dial strings
    pub fn domain(&self) -> String {
        self.account
            .uri
            .split_once('@')
            .map(|(_, host)| host)
            .unwrap_or("")
            .split(|c| c == ';' || c == '>')
            .next()
            .unwrap_or("")
            .to_string()
    }

    pub fn ws_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.ws_timeout_ms)
    }

    pub fn register_timeout(&self) -> Duration {
        Duration::from_millis(self.transport.register_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.transport.keepalive_interval_ms.map(Duration::from_millis)
    }

    pub fn burst_interval(&self) -> Duration {
        Duration::from_millis(self.reconnection.burst_interval_ms)
    }

    pub fn dying_budget(&self) -> Duration {
        Duration::from_millis(self.reconnection.dying_budget_ms)
    }

    pub fn dying_tick(&self) -> Duration {
        Duration::from_millis(self.reconnection.dying_tick_ms)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.media.stats_interval_ms)
    }

    /// Check the settings that would otherwise fail deep inside the engine
    pub fn validate(&self) -> ClientResult<()> {
        let uri = self.account.uri.to_ascii_lowercase();
        if !(uri.starts_with("sip:") || uri.starts_with("sips:")) || self.domain().is_empty() {
            return Err(ClientError::invalid_configuration(
                "account.uri",
                format!("expected sip:user@domain, got '{}'", self.account.uri),
            ));
        }

        if self.transport.ws_servers.is_empty() {
            return Err(ClientError::invalid_configuration(
                "transport.ws_servers",
                "at least one websocket server is required",
            ));
        }
        for server in &self.transport.ws_servers {
            let url = Url::parse(server)
                .map_err(|e| ClientError::invalid_configuration("transport.ws_servers", format!("{}: {}", server, e)))?;
            if url.scheme() != "ws" && url.scheme() != "wss" {
                return Err(ClientError::invalid_configuration(
                    "transport.ws_servers",
                    format!("{} is not a ws:// or wss:// url", server),
                ));
            }
        }

        let positive = [
            ("transport.ws_timeout_ms", self.transport.ws_timeout_ms),
            ("transport.register_timeout_ms", self.transport.register_timeout_ms),
            ("reconnection.retry_interval_ms", self.reconnection.retry_interval_ms),
            ("reconnection.burst_interval_ms", self.reconnection.burst_interval_ms),
            ("reconnection.dying_tick_ms", self.reconnection.dying_tick_ms),
            ("media.stats_interval_ms", self.media.stats_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ClientError::invalid_configuration(field, "must be greater than zero"));
            }
        }
        if self.transport.keepalive_interval_ms == Some(0) {
            return Err(ClientError::invalid_configuration(
                "transport.keepalive_interval_ms",
                "must be greater than zero",
            ));
        }

        if self.reconnection.retry_limit_ms < self.reconnection.retry_interval_ms {
            return Err(ClientError::invalid_configuration(
                "reconnection.retry_limit_ms",
                "must not be smaller than retry_interval_ms",
            ));
        }

        for (field, settings) in [("media.input", &self.media.input), ("media.output", &self.media.output)] {
            if !(0.0..=1.0).contains(&settings.volume) {
                return Err(ClientError::invalid_configuration(field, "volume must be within 0.0..=1.0"));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ClientConfig {
        ClientConfig::new("sip:201@example.com", "201", "secret").with_ws_server("wss://pbx.example.com/ws")
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert_eq!(config.reconnection.retry_interval_ms, 2_000);
        assert_eq!(config.reconnection.retry_limit_ms, 30_000);
        assert_eq!(config.burst_interval(), Duration::from_millis(100));
        assert_eq!(config.dying_budget(), Duration::from_secs(60));
        assert!(config.keepalive_interval().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_non_websocket_server() {
        let config = ClientConfig::new("sip:201@example.com", "201", "secret").with_ws_server("https://example.com");
        let err = config.validate().unwrap_err();
        assert_eq!(err.category(), "configuration");
    }

    #[test]
    fn test_rejects_missing_domain() {
        let mut config = valid();
        config.account.uri = "sip:201".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_inverted_backoff() {
        let mut config = valid();
        config.reconnection.retry_limit_ms = 100;
        assert!(matches!(
            config.validate(),
            Err(ClientError::InvalidConfiguration { field, .. }) if field == "reconnection.retry_limit_ms"
        ));
    }

    #[test]
    fn test_from_json_fills_defaults() {
        let json = r#"{
            "account": { "uri": "sip:201@example.com", "user": "201", "password": "secret" },
            "transport": { "ws_servers": ["ws://127.0.0.1:8088/ws"], "keepalive_interval_ms": 20000 },
            "media": { "input": { "volume": 0.5 } }
        }"#;
        let config = ClientConfig::from_json_str(json).unwrap();
        assert_eq!(config.keepalive_interval(), Some(Duration::from_secs(20)));
        assert_eq!(config.media.input.volume, 0.5);
        assert_eq!(config.media.output.volume, 1.0);
        assert_eq!(config.transport.register_timeout_ms, 10_000);
    }

    #[test]
    fn test_from_json_reports_parse_errors() {
        let err = ClientConfig::from_json_str("{").unwrap_err();
        assert!(matches!(err, ClientError::InvalidConfiguration { field, .. } if field == "json"));
    }
}
