//! GATT connection handling
//!
//! Turns the callbacks of one GATT link into connection state updates and
//! broadcast [`GattAction`]s, and drives the sound write once services are
//! known.

use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::backend::{GattCallback, GattCharacteristicInfo, GattLink, GattServiceInfo};
use super::protocol::{self, GattStatus, ProfileState};
use crate::domain::models::{ConnectionState, GattAction};
use crate::domain::settings::Settings;

/// What to write once services have been discovered
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub service_uuid: Uuid,
    pub characteristic_uuid: Uuid,
    pub value: Vec<u8>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            service_uuid: protocol::SOUND_SERVICE_UUID,
            characteristic_uuid: protocol::SOUND_CHARACTERISTIC_UUID,
            value: protocol::play_sound_command(),
        }
    }
}

impl ConnectionConfig {
    pub fn from_settings(settings: &Settings) -> Result<Self, uuid::Error> {
        Ok(Self {
            service_uuid: Uuid::parse_str(&settings.sound_service_uuid)?,
            characteristic_uuid: Uuid::parse_str(&settings.sound_characteristic_uuid)?,
            value: protocol::play_sound_command(),
        })
    }
}

/// Callback handler for one GATT link
pub struct GattConnection {
    link: Arc<dyn GattLink>,
    config: ConnectionConfig,
    actions: broadcast::Sender<GattAction>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl GattConnection {
    pub fn new(
        link: Arc<dyn GattLink>,
        config: ConnectionConfig,
        actions: broadcast::Sender<GattAction>,
        state: Arc<watch::Sender<ConnectionState>>,
    ) -> Self {
        Self {
            link,
            config,
            actions,
            state,
        }
    }

    /// Process one callback from the link
    pub async fn handle(&self, callback: GattCallback) {
        match callback {
            GattCallback::ConnectionStateChanged { status, new_state } => {
                self.on_connection_state_change(status, new_state).await
            }
            GattCallback::ServicesDiscovered { status, services } => {
                self.on_services_discovered(status, &services).await
            }
            GattCallback::CharacteristicRead {
                status,
                characteristic,
                ..
            } => self.on_characteristic_read(status, &characteristic),
        }
    }

    async fn on_connection_state_change(&self, status: GattStatus, new_state: ProfileState) {
        match status {
            GattStatus::Success => match new_state {
                ProfileState::Connected => {
                    self.state.send_replace(ConnectionState::Connected);
                    info!(address = %self.link.address(), "Connected to GATT device");
                    if let Err(e) = self.link.discover_services().await {
                        error!("Service discovery could not be started: {}", e);
                    }
                    self.broadcast(GattAction::GattConnected);
                }
                ProfileState::Disconnected => {
                    self.state.send_replace(ConnectionState::Disconnected);
                    self.broadcast(GattAction::GattDisconnected);
                    info!(address = %self.link.address(), "Disconnected from GATT device");
                }
                other => {
                    debug!(
                        "Connection state changed to {:?} (tracked state {:?})",
                        other,
                        *self.state.borrow()
                    );
                }
            },
            GattStatus::PeerTerminated => {
                self.broadcast(GattAction::EventCompleted);
            }
            GattStatus::Other(code) => {
                error!("Failed to connect to bluetooth device! Status: {}", code);
                self.broadcast(GattAction::EventFailed);
            }
        }
    }

    async fn on_services_discovered(&self, status: GattStatus, services: &[GattServiceInfo]) {
        if status != GattStatus::Success {
            debug!("Service discovery finished with status {}", status.code());
        }

        let Some(service) = services.iter().find(|s| s.uuid == self.config.service_uuid) else {
            error!("Sound service {} not found", self.config.service_uuid);
            return;
        };

        if service
            .characteristic(self.config.characteristic_uuid)
            .is_none()
        {
            error!(
                "Sound characteristic {} not found",
                self.config.characteristic_uuid
            );
            return;
        }

        match self
            .link
            .write_characteristic(
                self.config.service_uuid,
                self.config.characteristic_uuid,
                &self.config.value,
            )
            .await
        {
            Ok(()) => info!("Playing sound..."),
            Err(e) => {
                error!("Failed to write sound characteristic: {}", e);
                self.broadcast(GattAction::EventFailed);
            }
        }
    }

    fn on_characteristic_read(&self, status: GattStatus, characteristic: &GattCharacteristicInfo) {
        if status == GattStatus::Success && protocol::is_event_callback(characteristic.properties)
        {
            self.broadcast(GattAction::EventCompleted);
        }
    }

    fn broadcast(&self, action: GattAction) {
        debug!("Broadcasting {}", action);
        // No subscribers is fine
        let _ = self.actions.send(action);
    }
}
