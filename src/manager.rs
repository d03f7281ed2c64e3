//! Connection Manager
//!
//! Owns the set of broker sessions and rebuilds it whenever the broker
//! configuration or the enabled flag changes. All operations go through one
//! async mutex, so concurrent callers are serialized.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use crate::config::{validate, BridgeConfig, BrokerConfig, ValidationError};
use crate::notify::{normalize, DeliverySink};
use crate::session::{BrokerSession, ConnectError, MessageCallback, SessionStatus};

/// Bridge-level failure returned to whoever supplied the configuration
#[derive(Debug)]
pub enum BridgeError {
    /// Configuration rejected; nothing was changed
    InvalidConfig(ValidationError),
    /// A broker could not be connected; earlier brokers stay connected
    Connect {
        address: String,
        source: ConnectError,
    },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::InvalidConfig(e) => write!(f, "invalid configuration: {}", e),
            BridgeError::Connect { address, source } => {
                write!(f, "failed to connect to broker '{}': {}", address, source)
            }
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            BridgeError::InvalidConfig(e) => Some(e),
            BridgeError::Connect { source, .. } => Some(source),
        }
    }
}

impl From<ValidationError> for BridgeError {
    fn from(e: ValidationError) -> Self {
        BridgeError::InvalidConfig(e)
    }
}

/// Lifecycle state of the broker set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// No configuration stored yet
    Uninitialized,
    /// Configuration stored; sessions not (all) open
    Configured,
    /// Enabled and every configured broker opened
    Connected,
    /// Disabled; no sessions
    Disabled,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerState::Uninitialized => write!(f, "uninitialized"),
            ManagerState::Configured => write!(f, "configured"),
            ManagerState::Connected => write!(f, "connected"),
            ManagerState::Disabled => write!(f, "disabled"),
        }
    }
}

struct Inner {
    state: ManagerState,
    enabled: bool,
    brokers: Option<Vec<BrokerConfig>>,
    sessions: Vec<BrokerSession>,
}

/// Maintains one session per configured broker while enabled
pub struct ConnectionManager {
    inner: Mutex<Inner>,
    sink: Arc<dyn DeliverySink>,
}

impl ConnectionManager {
    /// Create a manager with no configuration, delivering to `sink`
    pub fn new(sink: Arc<dyn DeliverySink>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: ManagerState::Uninitialized,
                enabled: false,
                brokers: None,
                sessions: Vec::new(),
            }),
            sink,
        }
    }

    /// Replace the broker set
    ///
    /// An invalid candidate is rejected before anything is closed. When
    /// enabled, the new brokers are connected before returning.
    pub async fn apply_config(&self, candidate: BridgeConfig) -> Result<(), BridgeError> {
        validate(&candidate)?;

        let mut inner = self.inner.lock().await;
        Self::close_sessions(&mut inner);
        info!(
            "Applying configuration with {} brokers",
            candidate.brokers.len()
        );
        inner.brokers = Some(candidate.brokers);

        if inner.enabled {
            self.connect_locked(&mut inner).await
        } else {
            if inner.state != ManagerState::Disabled {
                inner.state = ManagerState::Configured;
            }
            debug!("Bridge disabled, deferring connect");
            Ok(())
        }
    }

    /// Close existing sessions and open one per stored broker, in order
    ///
    /// Stops at the first failure; sessions opened before it stay open.
    pub async fn connect_all(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        self.connect_locked(&mut inner).await
    }

    /// Close every session. Never fails.
    pub async fn disconnect_all(&self) {
        let mut inner = self.inner.lock().await;
        Self::close_sessions(&mut inner);
        if inner.state == ManagerState::Connected {
            inner.state = ManagerState::Configured;
        }
    }

    /// Mark enabled and connect the stored configuration, if any
    pub async fn enable(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        inner.enabled = true;
        if inner.brokers.is_none() {
            debug!("Enabled without configuration");
            return Ok(());
        }
        self.connect_locked(&mut inner).await
    }

    /// Mark disabled and close every session
    pub async fn disable(&self) {
        let mut inner = self.inner.lock().await;
        inner.enabled = false;
        Self::close_sessions(&mut inner);
        if inner.brokers.is_some() {
            inner.state = ManagerState::Disabled;
        }
    }

    pub async fn is_enabled(&self) -> bool {
        self.inner.lock().await.enabled
    }

    pub async fn state(&self) -> ManagerState {
        self.inner.lock().await.state
    }

    /// Number of open sessions
    pub async fn session_count(&self) -> usize {
        self.inner.lock().await.sessions.len()
    }

    /// Number of sessions currently connected
    pub async fn connected_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sessions
            .iter()
            .filter(|s| s.is_connected())
            .count()
    }

    /// Longest `disconnect_grace` among the stored brokers
    pub async fn disconnect_grace(&self) -> Duration {
        self.inner
            .lock()
            .await
            .brokers
            .iter()
            .flatten()
            .map(|b| b.disconnect_grace)
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Address and status of every open session
    pub async fn status(&self) -> Vec<(String, SessionStatus)> {
        self.inner
            .lock()
            .await
            .sessions
            .iter()
            .map(|s| (s.address().to_string(), s.status()))
            .collect()
    }

    async fn connect_locked(&self, inner: &mut Inner) -> Result<(), BridgeError> {
        Self::close_sessions(inner);

        let brokers = inner.brokers.clone().unwrap_or_default();
        inner.state = ManagerState::Configured;

        for broker in brokers {
            let address = broker.address.clone();
            let on_message = self.message_callback(&address);
            match BrokerSession::open(broker, on_message).await {
                Ok(session) => inner.sessions.push(session),
                Err(source) => {
                    warn!("Broker '{}': Connect failed: {}", address, source);
                    return Err(BridgeError::Connect { address, source });
                }
            }
        }

        inner.state = ManagerState::Connected;
        info!("Connected to {} brokers", inner.sessions.len());
        Ok(())
    }

    fn close_sessions(inner: &mut Inner) {
        if inner.sessions.is_empty() {
            return;
        }
        debug!("Closing {} sessions", inner.sessions.len());
        for mut session in inner.sessions.drain(..) {
            session.close();
        }
    }

    /// Normalize and deliver every message of one broker
    fn message_callback(&self, address: &str) -> MessageCallback {
        let sink = self.sink.clone();
        let address = address.to_string();
        Arc::new(move |topic: &str, payload: Bytes| {
            trace!("Broker '{}': Message on '{}'", address, topic);
            if let Some(message) = normalize(&payload) {
                sink.deliver(message);
            }
        })
    }
}
