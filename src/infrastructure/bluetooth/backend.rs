//! Platform seam for BLE access.
//!
//! A [`BleBackend`] hands out the default adapter. The adapter scans and
//! opens GATT links. Link operations complete asynchronously: results are
//! reported as [`GattCallback`]s on the channel given to
//! [`BleAdapter::connect_gatt`], in the order the platform produced them.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::protocol::{GattStatus, ProfileState};
use crate::domain::models::{BluetoothAddress, ScannedDevice};
use crate::error::BleResult;

pub type CallbackSender = mpsc::UnboundedSender<GattCallback>;
pub type ScanSender = mpsc::UnboundedSender<ScannedDevice>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattCharacteristicInfo {
    pub uuid: Uuid,
    pub properties: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristicInfo>,
}

impl GattServiceInfo {
    pub fn characteristic(&self, uuid: Uuid) -> Option<&GattCharacteristicInfo> {
        self.characteristics.iter().find(|c| c.uuid == uuid)
    }
}

/// Events delivered by a GATT link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GattCallback {
    ConnectionStateChanged {
        status: GattStatus,
        new_state: ProfileState,
    },
    ServicesDiscovered {
        status: GattStatus,
        services: Vec<GattServiceInfo>,
    },
    CharacteristicRead {
        status: GattStatus,
        characteristic: GattCharacteristicInfo,
        value: Vec<u8>,
    },
}

/// Classifies link drops for platform stacks that do not expose the remote
/// disconnect reason.
///
/// A tag acknowledges the sound request by terminating the link, which a
/// native stack reports as status 19. Once a characteristic write has
/// succeeded on a link, a drop is reported as [`GattStatus::PeerTerminated`];
/// before that it is a plain disconnect.
#[derive(Debug, Clone, Default)]
pub struct LinkDropTracker {
    wrote: Arc<AtomicBool>,
}

impl LinkDropTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_written(&self) {
        self.wrote.store(true, Ordering::SeqCst);
    }

    /// Callback for a link that just went down
    pub fn disconnected(&self) -> GattCallback {
        let status = if self.wrote.load(Ordering::SeqCst) {
            GattStatus::PeerTerminated
        } else {
            GattStatus::Success
        };
        GattCallback::ConnectionStateChanged {
            status,
            new_state: ProfileState::Disconnected,
        }
    }
}

#[async_trait]
pub trait BleBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// The system's default adapter
    async fn default_adapter(&self) -> BleResult<Arc<dyn BleAdapter>>;
}

#[async_trait]
pub trait BleAdapter: Send + Sync {
    fn describe(&self) -> String;

    /// Start a GATT connection to `address`.
    ///
    /// Returns once the attempt is under way; the outcome arrives as a
    /// `ConnectionStateChanged` callback.
    async fn connect_gatt(
        &self,
        address: BluetoothAddress,
        callbacks: CallbackSender,
    ) -> BleResult<Arc<dyn GattLink>>;

    /// Report advertisements on `sink` until [`BleAdapter::stop_scan`]
    async fn start_scan(&self, sink: ScanSender) -> BleResult<()>;

    async fn stop_scan(&self) -> BleResult<()>;
}

#[async_trait]
pub trait GattLink: Send + Sync {
    fn address(&self) -> BluetoothAddress;

    /// Request service discovery; answered by `ServicesDiscovered`
    async fn discover_services(&self) -> BleResult<()>;

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> BleResult<()>;

    /// Release the link; no callbacks follow
    async fn close(&self);
}
