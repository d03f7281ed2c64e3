//! Broker Configuration
//!
//! One `BrokerConfig` per remote MQTT broker; a `BridgeConfig` is the full
//! set and is always applied as a whole.

use std::time::Duration;

use serde::Deserialize;

use crate::codec::MAX_REMAINING_LENGTH;
use crate::protocol::ProtocolVersion;

/// Client identifier presented to every broker unless overridden
pub const DEFAULT_CLIENT_ID: &str = "gotify";

/// Port used when an address carries none
pub const DEFAULT_PORT: u16 = 1883;

/// Address of the broker in the default configuration
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:1883";

/// Topic subscribed to in the default configuration
pub const DEFAULT_TOPIC: &str = "*";

/// Schemes accepted in front of `host:port`
const SUPPORTED_SCHEMES: &[&str] = &["tcp", "mqtt"];

/// Configuration for a single broker connection
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct BrokerConfig {
    /// Broker address (`host:port`, `host`, or `tcp://host:port`)
    pub address: String,

    /// Username for authentication (sent only when non-empty)
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication (sent only when non-empty)
    #[serde(default)]
    pub password: Option<String>,

    /// Topic filters to subscribe to, in order
    #[serde(default, alias = "subscribe")]
    pub topics: Vec<String>,

    /// Client ID to use when connecting
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// MQTT protocol version ("3.1.1" or "5")
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// Keep-alive interval in seconds (0 disables PINGREQ)
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Ask the broker to discard any previous session state
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// Upper bound on the TCP connect + CONNACK handshake (e.g. "30s")
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// Time allowed for DISCONNECT to flush on close (e.g. "500ms")
    #[serde(default = "default_disconnect_grace", with = "humantime_serde")]
    pub disconnect_grace: Duration,

    /// Reconnect after losing an established connection
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,

    /// Initial delay before reconnecting
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Upper bound for the exponential reconnect backoff
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// Largest inbound packet accepted; announced to v5 brokers in CONNECT.
    /// Larger packets are skipped without dropping the connection.
    #[serde(default = "default_max_packet_size")]
    pub max_packet_size: usize,
}

fn default_client_id() -> String {
    DEFAULT_CLIENT_ID.to_string()
}

fn default_keepalive() -> u16 {
    30
}

fn default_true() -> bool {
    true
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_disconnect_grace() -> Duration {
    Duration::from_millis(500)
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_max_packet_size() -> usize {
    MAX_REMAINING_LENGTH
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_ADDRESS).with_topics([DEFAULT_TOPIC])
    }
}

impl BrokerConfig {
    /// Create a broker config with default connection settings and no topics
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            username: None,
            password: None,
            topics: Vec::new(),
            client_id: default_client_id(),
            protocol_version: ProtocolVersion::default(),
            keepalive: default_keepalive(),
            clean_session: true,
            connect_timeout: default_connect_timeout(),
            disconnect_grace: default_disconnect_grace(),
            auto_reconnect: true,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            max_packet_size: default_max_packet_size(),
        }
    }

    pub fn with_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Username to present, if one is configured and non-empty
    pub fn effective_username(&self) -> Option<&str> {
        self.username.as_deref().filter(|u| !u.is_empty())
    }

    /// Password to present, if one is configured and non-empty
    pub fn effective_password(&self) -> Option<&str> {
        self.password.as_deref().filter(|p| !p.is_empty())
    }

    /// Parse the address into host and port
    ///
    /// Accepts an optional `tcp://` or `mqtt://` scheme and bracketed IPv6
    /// hosts. The port defaults to 1883.
    pub fn parse_address(&self) -> Result<(String, u16), &'static str> {
        let address = self.address.trim();
        if address.is_empty() {
            return Err("address cannot be empty");
        }

        let rest = match address.split_once("://") {
            Some((scheme, rest)) => {
                if !SUPPORTED_SCHEMES.contains(&scheme.to_ascii_lowercase().as_str()) {
                    return Err("unsupported address scheme");
                }
                rest
            }
            None => address,
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or("unterminated IPv6 address")?;
            match tail {
                "" => (host, None),
                _ => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err("unexpected characters after IPv6 address"),
                },
            }
        } else if rest.matches(':').count() > 1 {
            // Bare IPv6 address without a port
            (rest, None)
        } else {
            match rest.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (rest, None),
            }
        };

        if host.is_empty() {
            return Err("host cannot be empty");
        }

        let port = match port {
            Some(port) => match port.parse::<u16>() {
                Ok(0) | Err(_) => return Err("port must be a number between 1 and 65535"),
                Ok(port) => port,
            },
            None => DEFAULT_PORT,
        };

        Ok((host.to_string(), port))
    }
}

/// The complete, externally supplied set of brokers
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Brokers to connect to, in connection order
    #[serde(alias = "servers")]
    pub brokers: Vec<BrokerConfig>,
}

impl Default for BridgeConfig {
    /// One local broker subscribed to `*`
    fn default() -> Self {
        Self {
            brokers: vec![BrokerConfig::default()],
        }
    }
}

impl BridgeConfig {
    pub fn new(brokers: Vec<BrokerConfig>) -> Self {
        Self { brokers }
    }

    /// A configuration with no brokers at all
    pub fn empty() -> Self {
        Self {
            brokers: Vec::new(),
        }
    }
}
