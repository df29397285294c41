//! Cross-platform backend on top of `btleplug`

use async_trait::async_trait;
use btleplug::api::{
    BDAddr, Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::backend::{
    BleAdapter, BleBackend, CallbackSender, GattCallback, GattCharacteristicInfo, GattLink,
    GattServiceInfo, LinkDropTracker, ScanSender,
};
use super::protocol::{self, GattStatus, ProfileState};
use crate::domain::models::{BluetoothAddress, ScannedDevice};
use crate::error::{BleError, BleResult};

fn hw(e: btleplug::Error) -> BleError {
    BleError::Hardware(e.to_string())
}

fn to_address(addr: BDAddr) -> BluetoothAddress {
    BluetoothAddress::new(addr.into_inner())
}

async fn scanned(peripheral: &Peripheral) -> btleplug::Result<Option<ScannedDevice>> {
    let Some(props) = peripheral.properties().await? else {
        return Ok(None);
    };
    Ok(Some(ScannedDevice {
        address: to_address(props.address),
        name: props.local_name,
        rssi: props.rssi.unwrap_or_default(),
        manufacturer_data: props.manufacturer_data.into_iter().collect(),
        connectable: true,
    }))
}

#[derive(Default)]
pub struct BtleplugBackend;

impl BtleplugBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BleBackend for BtleplugBackend {
    fn name(&self) -> &'static str {
        "btleplug"
    }

    async fn default_adapter(&self) -> BleResult<Arc<dyn BleAdapter>> {
        let manager = Manager::new().await.map_err(hw)?;
        let adapter = manager
            .adapters()
            .await
            .map_err(hw)?
            .into_iter()
            .next()
            .ok_or(BleError::AdapterNotAvailable)?;
        Ok(Arc::new(BtleplugAdapter {
            adapter,
            scan_task: Mutex::new(None),
        }))
    }
}

struct BtleplugAdapter {
    adapter: Adapter,
    scan_task: Mutex<Option<JoinHandle<()>>>,
}

impl BtleplugAdapter {
    async fn find(&self, address: BluetoothAddress) -> BleResult<Peripheral> {
        let wanted = BDAddr::from(address.bytes());
        self.adapter
            .peripherals()
            .await
            .map_err(hw)?
            .into_iter()
            .find(|p| p.address() == wanted)
            .ok_or_else(|| BleError::UnknownDevice(address.to_string()))
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    fn describe(&self) -> String {
        "btleplug adapter".to_string()
    }

    async fn connect_gatt(
        &self,
        address: BluetoothAddress,
        callbacks: CallbackSender,
    ) -> BleResult<Arc<dyn GattLink>> {
        let peripheral = self.find(address).await?;
        let mut events = self.adapter.events().await.map_err(hw)?;

        let drops = LinkDropTracker::new();
        let sender = callbacks.clone();
        let target = peripheral.clone();
        let link_drops = drops.clone();
        let task = tokio::spawn(async move {
            info!("Connecting to Bluetooth device: {}", address);
            let (status, new_state) = match target.connect().await {
                Ok(()) => (GattStatus::Success, ProfileState::Connected),
                Err(e) => {
                    warn!("Connection attempt failed: {}", e);
                    (
                        GattStatus::Other(protocol::GATT_ERROR),
                        ProfileState::Disconnected,
                    )
                }
            };
            if sender
                .send(GattCallback::ConnectionStateChanged { status, new_state })
                .is_err()
                || new_state == ProfileState::Disconnected
            {
                return;
            }

            let id = target.id();
            while let Some(event) = events.next().await {
                if matches!(&event, CentralEvent::DeviceDisconnected(gone) if *gone == id) {
                    let _ = sender.send(link_drops.disconnected());
                    break;
                }
            }
        });

        Ok(Arc::new(BtleplugLink {
            address,
            peripheral,
            callbacks: Mutex::new(Some(callbacks)),
            watcher: Mutex::new(Some(task)),
            drops,
        }))
    }

    async fn start_scan(&self, sink: ScanSender) -> BleResult<()> {
        if self
            .scan_task
            .lock()
            .map_err(|_| BleError::Hardware("scan lock poisoned".to_string()))?
            .is_some()
        {
            return Err(BleError::ScanInProgress);
        }

        let mut events = self.adapter.events().await.map_err(hw)?;
        self.adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(hw)?;
        debug!("BLE scan started");

        let adapter = self.adapter.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = events.next().await {
                let id = match event {
                    CentralEvent::DeviceDiscovered(id)
                    | CentralEvent::DeviceUpdated(id)
                    | CentralEvent::ManufacturerDataAdvertisement { id, .. } => id,
                    _ => continue,
                };
                let Ok(peripheral) = adapter.peripheral(&id).await else {
                    continue;
                };
                match scanned(&peripheral).await {
                    Ok(Some(device)) => {
                        if sink.send(device).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => debug!("Unreadable peripheral properties: {}", e),
                }
            }
        });

        if let Ok(mut slot) = self.scan_task.lock() {
            *slot = Some(task);
        }
        Ok(())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        let task = self
            .scan_task
            .lock()
            .map_err(|_| BleError::Hardware("scan lock poisoned".to_string()))?
            .take();
        if let Some(task) = task {
            task.abort();
            self.adapter.stop_scan().await.map_err(hw)?;
            debug!("BLE scan stopped");
        }
        Ok(())
    }
}

struct BtleplugLink {
    address: BluetoothAddress,
    peripheral: Peripheral,
    callbacks: Mutex<Option<CallbackSender>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    drops: LinkDropTracker,
}

impl BtleplugLink {
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
impl GattLink for BtleplugLink {
    fn address(&self) -> BluetoothAddress {
        self.address
    }

    async fn discover_services(&self) -> BleResult<()> {
        let status = match self.peripheral.discover_services().await {
            Ok(()) => GattStatus::Success,
            Err(e) => {
                warn!("Service discovery failed: {}", e);
                GattStatus::Other(protocol::GATT_ERROR)
            }
        };

        let services = self
            .peripheral
            .services()
            .into_iter()
            .map(|s| GattServiceInfo {
                uuid: s.uuid,
                characteristics: s
                    .characteristics
                    .into_iter()
                    .map(|c| GattCharacteristicInfo {
                        uuid: c.uuid,
                        properties: u32::from(c.properties.bits()),
                    })
                    .collect(),
            })
            .collect::<Vec<_>>();
        info!("Found {} GATT services", services.len());

        self.emit(GattCallback::ServicesDiscovered { status, services })
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> BleResult<()> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(BleError::CharacteristicNotFound(characteristic))?;
        self.peripheral
            .write(&target, value, WriteType::WithResponse)
            .await
            .map_err(hw)?;
        self.drops.mark_written();
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.take();
        }
        let watcher = self.watcher.lock().ok().and_then(|mut w| w.take());
        if let Some(watcher) = watcher {
            watcher.abort();
        }
        if let Err(e) = self.peripheral.disconnect().await {
            warn!("Failed to disconnect peripheral: {}", e);
        }
    }
}
