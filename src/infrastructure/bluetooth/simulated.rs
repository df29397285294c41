//! In-process BLE backend with scripted tags.
//!
//! Used by tests and by `--simulate` runs on machines without a radio.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

use super::backend::{
    BleAdapter, BleBackend, CallbackSender, GattCallback, GattCharacteristicInfo, GattLink,
    GattServiceInfo, ScanSender,
};
use super::protocol::{
    self, GattStatus, ProfileState, APPLE_COMPANY_ID, FIND_MY_PAYLOAD_TYPE,
    SOUND_CHARACTERISTIC_UUID, SOUND_SERVICE_UUID,
};
use crate::domain::models::{BluetoothAddress, ScannedDevice};
use crate::error::{BleError, BleResult};

/// A scripted remote device
#[derive(Debug, Clone)]
pub struct SimulatedTag {
    pub address: BluetoothAddress,
    pub name: Option<String>,
    pub rssi: i16,
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub connectable: bool,
    pub services: Vec<GattServiceInfo>,
    /// Status of the connection callback
    pub connect_status: GattStatus,
    /// Callbacks emitted after a successful characteristic write
    pub after_write: Vec<GattCallback>,
}

impl SimulatedTag {
    /// A Find My tag that plays its sound and then drops the link (status 19)
    pub fn airtag(address: BluetoothAddress) -> Self {
        Self {
            address,
            name: None,
            rssi: -58,
            manufacturer_data: BTreeMap::from([(
                APPLE_COMPANY_ID,
                vec![FIND_MY_PAYLOAD_TYPE, 0x19, 0x10, 0x4A, 0x7E, 0x21],
            )]),
            connectable: true,
            services: vec![GattServiceInfo {
                uuid: SOUND_SERVICE_UUID,
                characteristics: vec![GattCharacteristicInfo {
                    uuid: SOUND_CHARACTERISTIC_UUID,
                    properties: 0x0A,
                }],
            }],
            connect_status: GattStatus::Success,
            after_write: vec![GattCallback::ConnectionStateChanged {
                status: GattStatus::PeerTerminated,
                new_state: ProfileState::Disconnected,
            }],
        }
    }

    /// A device that advertises but is not a tracker
    pub fn plain(address: BluetoothAddress, name: &str) -> Self {
        Self {
            address,
            name: Some(name.to_string()),
            rssi: -71,
            manufacturer_data: BTreeMap::new(),
            connectable: true,
            services: Vec::new(),
            connect_status: GattStatus::Success,
            after_write: Vec::new(),
        }
    }

    pub fn with_connect_status(mut self, status: GattStatus) -> Self {
        self.connect_status = status;
        self
    }

    pub fn with_services(mut self, services: Vec<GattServiceInfo>) -> Self {
        self.services = services;
        self
    }

    pub fn with_after_write(mut self, callbacks: Vec<GattCallback>) -> Self {
        self.after_write = callbacks;
        self
    }

    fn advertisement(&self) -> ScannedDevice {
        ScannedDevice {
            address: self.address,
            name: self.name.clone(),
            rssi: self.rssi,
            manufacturer_data: self.manufacturer_data.clone(),
            connectable: self.connectable,
        }
    }
}

/// A characteristic write observed by the simulator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedWrite {
    pub address: BluetoothAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

struct SimulatorState {
    adapter_available: bool,
    tags: Mutex<Vec<SimulatedTag>>,
    writes: Mutex<Vec<RecordedWrite>>,
    scanning: AtomicBool,
}

#[derive(Clone)]
pub struct SimulatedBackend {
    state: Arc<SimulatorState>,
}

impl Default for SimulatedBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedBackend {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A backend whose default adapter lookup fails
    pub fn without_adapter() -> Self {
        Self::build(false)
    }

    fn build(adapter_available: bool) -> Self {
        Self {
            state: Arc::new(SimulatorState {
                adapter_available,
                tags: Mutex::new(Vec::new()),
                writes: Mutex::new(Vec::new()),
                scanning: AtomicBool::new(false),
            }),
        }
    }

    /// Two trackers and one ordinary device
    pub fn demo() -> Self {
        Self::new()
            .with_tag(SimulatedTag::airtag(BluetoothAddress::new([
                0xD4, 0x1A, 0x7C, 0x22, 0x90, 0x01,
            ])))
            .with_tag(SimulatedTag::airtag(BluetoothAddress::new([
                0xE8, 0x33, 0x05, 0xB1, 0x6F, 0x02,
            ])))
            .with_tag(SimulatedTag::plain(
                BluetoothAddress::new([0x3C, 0x61, 0x05, 0x11, 0x22, 0x33]),
                "Headphones",
            ))
    }

    pub fn with_tag(self, tag: SimulatedTag) -> Self {
        if let Ok(mut tags) = self.state.tags.lock() {
            tags.push(tag);
        }
        self
    }

    pub fn writes(&self) -> Vec<RecordedWrite> {
        self.state
            .writes
            .lock()
            .map(|w| w.clone())
            .unwrap_or_default()
    }

    pub fn is_scanning(&self) -> bool {
        self.state.scanning.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BleBackend for SimulatedBackend {
    fn name(&self) -> &'static str {
        "simulated"
    }

    async fn default_adapter(&self) -> BleResult<Arc<dyn BleAdapter>> {
        if !self.state.adapter_available {
            return Err(BleError::AdapterNotAvailable);
        }
        Ok(Arc::new(SimulatedAdapter {
            state: self.state.clone(),
        }))
    }
}

struct SimulatedAdapter {
    state: Arc<SimulatorState>,
}

impl SimulatedAdapter {
    fn find_tag(&self, address: BluetoothAddress) -> Option<SimulatedTag> {
        self.state
            .tags
            .lock()
            .ok()?
            .iter()
            .find(|t| t.address == address)
            .cloned()
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    fn describe(&self) -> String {
        "simulated adapter".to_string()
    }

    async fn connect_gatt(
        &self,
        address: BluetoothAddress,
        callbacks: CallbackSender,
    ) -> BleResult<Arc<dyn GattLink>> {
        let tag = self
            .find_tag(address)
            .ok_or_else(|| BleError::UnknownDevice(address.to_string()))?;

        let new_state = if tag.connect_status == GattStatus::Success {
            ProfileState::Connected
        } else {
            ProfileState::Disconnected
        };
        debug!(%address, ?new_state, "Simulated connection attempt");
        let _ = callbacks.send(GattCallback::ConnectionStateChanged {
            status: tag.connect_status,
            new_state,
        });

        Ok(Arc::new(SimulatedLink {
            tag,
            state: self.state.clone(),
            callbacks: Mutex::new(Some(callbacks)),
        }))
    }

    async fn start_scan(&self, sink: ScanSender) -> BleResult<()> {
        if self.state.scanning.swap(true, Ordering::SeqCst) {
            return Err(BleError::ScanInProgress);
        }
        let tags = self
            .state
            .tags
            .lock()
            .map(|t| t.clone())
            .unwrap_or_default();
        info!("Simulated scan reporting {} devices", tags.len());
        for tag in tags {
            if sink.send(tag.advertisement()).is_err() {
                break;
            }
        }
        Ok(())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        self.state.scanning.store(false, Ordering::SeqCst);
        Ok(())
    }
}

struct SimulatedLink {
    tag: SimulatedTag,
    state: Arc<SimulatorState>,
    callbacks: Mutex<Option<CallbackSender>>,
}

impl SimulatedLink {
    fn emit(&self, callback: GattCallback) -> BleResult<()> {
        let guard = self
            .callbacks
            .lock()
            .map_err(|_| BleError::Hardware("callback lock poisoned".to_string()))?;
        let sender = guard.as_ref().ok_or(BleError::NotConnected)?;
        let _ = sender.send(callback);
        Ok(())
    }
}

#[async_trait]
impl GattLink for SimulatedLink {
    fn address(&self) -> BluetoothAddress {
        self.tag.address
    }

    async fn discover_services(&self) -> BleResult<()> {
        self.emit(GattCallback::ServicesDiscovered {
            status: GattStatus::Success,
            services: self.tag.services.clone(),
        })
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> BleResult<()> {
        let found = self
            .tag
            .services
            .iter()
            .find(|s| s.uuid == service)
            .ok_or(BleError::ServiceNotFound(service))?;
        found
            .characteristic(characteristic)
            .ok_or(BleError::CharacteristicNotFound(characteristic))?;

        if let Ok(mut writes) = self.state.writes.lock() {
            writes.push(RecordedWrite {
                address: self.tag.address,
                service,
                characteristic,
                value: value.to_vec(),
            });
        }
        if value == protocol::play_sound_command().as_slice() {
            info!(address = %self.tag.address, "Simulated tag playing sound");
        }

        for callback in &self.tag.after_write {
            self.emit(callback.clone())?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.take();
        }
    }
}
