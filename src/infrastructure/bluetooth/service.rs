//! Bluetooth LE Service
//!
//! Owns the adapter and the active GATT link, pumps link callbacks through
//! a [`GattConnection`], and publishes [`GattAction`]s to subscribers.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::{BleAdapter, BleBackend, GattLink};
use super::connection::{ConnectionConfig, GattConnection};
use crate::domain::models::{BluetoothAddress, ConnectionState, GattAction};

const ACTION_CHANNEL_CAPACITY: usize = 32;

/// Result of a [`BluetoothLeService::play_sound`] request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoundOutcome {
    /// The tag reported completion
    Completed,
    /// The connection failed or dropped before completion
    Failed,
    /// No completion event arrived in time
    TimedOut,
    /// No adapter, a malformed address, or the connection could not start
    NotStarted,
}

pub struct BluetoothLeService {
    backend: Arc<dyn BleBackend>,
    adapter: Option<Arc<dyn BleAdapter>>,
    link: Option<Arc<dyn GattLink>>,
    pump: Option<JoinHandle<()>>,
    config: ConnectionConfig,
    actions: broadcast::Sender<GattAction>,
    state: Arc<watch::Sender<ConnectionState>>,
}

impl BluetoothLeService {
    pub fn new(backend: Arc<dyn BleBackend>, config: ConnectionConfig) -> Self {
        let (actions, _) = broadcast::channel(ACTION_CHANNEL_CAPACITY);
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            backend,
            adapter: None,
            link: None,
            pump: None,
            config,
            actions,
            state: Arc::new(state),
        }
    }

    /// Look up the default adapter
    pub async fn init(&mut self) -> bool {
        match self.backend.default_adapter().await {
            Ok(adapter) => {
                info!(
                    backend = self.backend.name(),
                    "Using bluetooth adapter: {}",
                    adapter.describe()
                );
                self.adapter = Some(adapter);
                true
            }
            Err(e) => {
                warn!("No bluetooth adapter: {}", e);
                false
            }
        }
    }

    pub fn adapter(&self) -> Option<Arc<dyn BleAdapter>> {
        self.adapter.clone()
    }

    /// Start a GATT connection to `device_address`.
    ///
    /// Returns `false` when the adapter is not initialized, the address is
    /// malformed, or the backend refuses the attempt. Progress is reported
    /// through [`BluetoothLeService::subscribe`].
    pub async fn connect(&mut self, device_address: &str) -> bool {
        let Some(adapter) = self.adapter.clone() else {
            warn!("Bluetooth adapter is not initialized!");
            return false;
        };

        let address = match device_address.parse::<BluetoothAddress>() {
            Ok(address) => address,
            Err(e) => {
                error!("Failed to connect to device! {}", e);
                return false;
            }
        };

        // One link at a time
        self.close_link().await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let link = match adapter.connect_gatt(address, tx).await {
            Ok(link) => link,
            Err(e) => {
                error!("Failed to connect to device! {}", e);
                return false;
            }
        };

        let connection = GattConnection::new(
            link.clone(),
            self.config.clone(),
            self.actions.clone(),
            self.state.clone(),
        );
        self.pump = Some(tokio::spawn(async move {
            while let Some(callback) = rx.recv().await {
                connection.handle(callback).await;
            }
            debug!("GATT callback channel closed");
        }));
        self.link = Some(link);

        true
    }

    /// Close the active link, if any
    pub async fn unbind(&mut self) {
        self.close_link().await;
        debug!("Unbinding BluetoothLeService");
    }

    async fn close_link(&mut self) {
        if let Some(link) = self.link.take() {
            link.close().await;
            debug!(address = %link.address(), "Closed GATT link");
        }
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.state.send_replace(ConnectionState::Disconnected);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GattAction> {
        self.actions.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Connect to a tag, play its sound, and wait for the outcome.
    ///
    /// The link is closed before returning.
    pub async fn play_sound(&mut self, device_address: &str, timeout: Duration) -> SoundOutcome {
        if self.adapter.is_none() && !self.init().await {
            return SoundOutcome::NotStarted;
        }

        let mut actions = self.subscribe();
        if !self.connect(device_address).await {
            return SoundOutcome::NotStarted;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let outcome = loop {
            match tokio::time::timeout_at(deadline, actions.recv()).await {
                Err(_) => break SoundOutcome::TimedOut,
                Ok(Ok(GattAction::EventCompleted)) => break SoundOutcome::Completed,
                Ok(Ok(GattAction::EventFailed)) => break SoundOutcome::Failed,
                Ok(Ok(GattAction::GattDisconnected)) => {
                    warn!("Connection closed before the sound event completed");
                    break SoundOutcome::Failed;
                }
                Ok(Ok(GattAction::GattConnected)) => continue,
                Ok(Err(broadcast::error::RecvError::Lagged(skipped))) => {
                    debug!("Skipped {} GATT actions", skipped);
                    continue;
                }
                Ok(Err(broadcast::error::RecvError::Closed)) => break SoundOutcome::Failed,
            }
        };

        info!(address = device_address, ?outcome, "Sound request finished");
        self.unbind().await;
        outcome
    }
}

impl Drop for BluetoothLeService {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}
