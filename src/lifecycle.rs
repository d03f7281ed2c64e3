//! Bridge lifecycle
//!
//! [`Bridge`] is what a host embeds: it is built from a delivery sink and an
//! initial configuration, starts disabled, and is switched on and off
//! explicitly.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::config::BridgeConfig;
use crate::manager::{BridgeError, ConnectionManager, ManagerState};
use crate::notify::DeliverySink;
use crate::session::SessionStatus;

/// An MQTT to notification bridge
pub struct Bridge {
    manager: ConnectionManager,
}

impl Bridge {
    /// Build a disabled bridge holding `initial`
    ///
    /// Fails only if `initial` does not validate. No connection is made
    /// until [`Bridge::enable`].
    pub async fn new(
        sink: Arc<dyn DeliverySink>,
        initial: BridgeConfig,
    ) -> Result<Self, BridgeError> {
        let manager = ConnectionManager::new(sink);
        manager.apply_config(initial).await?;
        Ok(Self { manager })
    }

    /// Activate the bridge and connect every configured broker
    ///
    /// Calling it again reconnects from scratch.
    pub async fn enable(&self) -> Result<(), BridgeError> {
        info!("Enabling bridge");
        self.manager.enable().await
    }

    /// Deactivate the bridge and close every session
    pub async fn disable(&self) {
        info!("Disabling bridge");
        self.manager.disable().await
    }

    /// Replace the broker set, reconnecting if enabled
    pub async fn apply_config(&self, candidate: BridgeConfig) -> Result<(), BridgeError> {
        self.manager.apply_config(candidate).await
    }

    pub async fn is_enabled(&self) -> bool {
        self.manager.is_enabled().await
    }

    pub async fn state(&self) -> ManagerState {
        self.manager.state().await
    }

    /// Address and status of every open session
    pub async fn status(&self) -> Vec<(String, SessionStatus)> {
        self.manager.status().await
    }

    /// How long closed sessions may take to send DISCONNECT
    pub async fn disconnect_grace(&self) -> Duration {
        self.manager.disconnect_grace().await
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }
}
