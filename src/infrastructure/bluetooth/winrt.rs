//! WinRT backend
//!
//! Uses the `Windows.Devices.Bluetooth` APIs. WinRT connects lazily on the
//! first GATT request, so a link reports `Connected` as soon as the device
//! object is resolved and follows `ConnectionStatusChanged` afterwards.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;
use windows::core::GUID;
use windows::Devices::Bluetooth::Advertisement::{
    BluetoothLEAdvertisementReceivedEventArgs, BluetoothLEAdvertisementWatcher,
    BluetoothLEScanningMode,
};
use windows::Devices::Bluetooth::GenericAttributeProfile::{
    GattCommunicationStatus, GattDeviceService,
};
use windows::Devices::Bluetooth::{BluetoothAdapter, BluetoothConnectionStatus, BluetoothLEDevice};
use windows::Foundation::TypedEventHandler;
use windows::Storage::Streams::{DataReader, DataWriter, IBuffer};

use super::backend::{
    BleAdapter, BleBackend, CallbackSender, GattCallback, GattCharacteristicInfo, GattLink,
    GattServiceInfo, LinkDropTracker, ScanSender,
};
use super::protocol::{GattStatus, ProfileState};
use crate::domain::models::{BluetoothAddress, ScannedDevice};
use crate::error::{BleError, BleResult};

fn hw(e: windows::core::Error) -> BleError {
    BleError::Hardware(format!("{:?}", e))
}

fn to_guid(uuid: Uuid) -> GUID {
    GUID::from_u128(uuid.as_u128())
}

fn to_uuid(guid: GUID) -> Uuid {
    Uuid::from_u128(guid.to_u128())
}

fn read_buffer(buffer: &IBuffer) -> windows::core::Result<Vec<u8>> {
    let reader = DataReader::FromBuffer(buffer)?;
    let mut bytes = vec![0u8; reader.UnconsumedBufferLength()? as usize];
    reader.ReadBytes(&mut bytes)?;
    Ok(bytes)
}

fn advertisement(
    args: &BluetoothLEAdvertisementReceivedEventArgs,
) -> windows::core::Result<ScannedDevice> {
    let adv = args.Advertisement()?;
    let name = adv.LocalName()?.to_string();

    let mut manufacturer_data = BTreeMap::new();
    let sections = adv.ManufacturerData()?;
    for i in 0..sections.Size()? {
        let section = sections.GetAt(i)?;
        manufacturer_data.insert(section.CompanyId()?, read_buffer(&section.Data()?)?);
    }

    Ok(ScannedDevice {
        address: BluetoothAddress::from_u64(args.BluetoothAddress()?),
        name: (!name.is_empty()).then_some(name),
        rssi: args.RawSignalStrengthInDBm()?,
        manufacturer_data,
        connectable: args.IsConnectable()?,
    })
}

#[derive(Default)]
pub struct WinRtBackend;

impl WinRtBackend {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BleBackend for WinRtBackend {
    fn name(&self) -> &'static str {
        "winrt"
    }

    async fn default_adapter(&self) -> BleResult<Arc<dyn BleAdapter>> {
        let adapter = BluetoothAdapter::GetDefaultAsync()
            .map_err(hw)?
            .await
            .map_err(|_| BleError::AdapterNotAvailable)?;
        Ok(Arc::new(WinRtAdapter {
            adapter,
            watcher: Mutex::new(None),
        }))
    }
}

struct WinRtAdapter {
    adapter: BluetoothAdapter,
    watcher: Mutex<Option<BluetoothLEAdvertisementWatcher>>,
}

#[async_trait]
impl BleAdapter for WinRtAdapter {
    fn describe(&self) -> String {
        self.adapter
            .BluetoothAddress()
            .map(|a| format!("WinRT adapter {}", BluetoothAddress::from_u64(a)))
            .unwrap_or_else(|_| "WinRT adapter".to_string())
    }

    async fn connect_gatt(
        &self,
        address: BluetoothAddress,
        callbacks: CallbackSender,
    ) -> BleResult<Arc<dyn GattLink>> {
        info!("Connecting to Bluetooth device: {}", address);
        let device = BluetoothLEDevice::FromBluetoothAddressAsync(address.as_u64())
            .map_err(hw)?
            .await
            .map_err(|_| BleError::UnknownDevice(address.to_string()))?;

        // Follow link drops reported by the OS
        let drops = LinkDropTracker::new();
        let link_drops = drops.clone();
        let sender = callbacks.clone();
        let token = device
            .ConnectionStatusChanged(&TypedEventHandler::new(
                move |dev: windows::core::Ref<BluetoothLEDevice>, _| {
                    if let Some(dev) = dev.as_ref() {
                        let callback = match dev.ConnectionStatus()? {
                            BluetoothConnectionStatus::Connected => {
                                GattCallback::ConnectionStateChanged {
                                    status: GattStatus::Success,
                                    new_state: ProfileState::Connected,
                                }
                            }
                            _ => link_drops.disconnected(),
                        };
                        let _ = sender.send(callback);
                    }
                    Ok(())
                },
            ))
            .map_err(hw)?;

        let _ = callbacks.send(GattCallback::ConnectionStateChanged {
            status: GattStatus::Success,
            new_state: ProfileState::Connected,
        });

        Ok(Arc::new(WinRtLink {
            address,
            device,
            status_token: token,
            callbacks: Mutex::new(Some(callbacks)),
            drops,
        }))
    }

    async fn start_scan(&self, sink: ScanSender) -> BleResult<()> {
        let mut slot = self
            .watcher
            .lock()
            .map_err(|_| BleError::Hardware("watcher lock poisoned".to_string()))?;
        if slot.is_some() {
            return Err(BleError::ScanInProgress);
        }

        let watcher = BluetoothLEAdvertisementWatcher::new().map_err(hw)?;
        watcher
            .SetScanningMode(BluetoothLEScanningMode::Active)
            .map_err(hw)?;

        let handler = TypedEventHandler::new(
            move |_: windows::core::Ref<BluetoothLEAdvertisementWatcher>,
                  args: windows::core::Ref<BluetoothLEAdvertisementReceivedEventArgs>| {
                if let Some(args) = args.as_ref() {
                    match advertisement(args) {
                        Ok(device) => {
                            let _ = sink.send(device);
                        }
                        Err(e) => debug!("Unreadable advertisement: {:?}", e),
                    }
                }
                Ok(())
            },
        );

        watcher.Received(&handler).map_err(hw)?;
        watcher.Start().map_err(hw)?;
        *slot = Some(watcher);
        Ok(())
    }

    async fn stop_scan(&self) -> BleResult<()> {
        let watcher = self
            .watcher
            .lock()
            .map_err(|_| BleError::Hardware("watcher lock poisoned".to_string()))?
            .take();
        if let Some(watcher) = watcher {
            watcher.Stop().map_err(hw)?;
        }
        Ok(())
    }
}

struct WinRtLink {
    address: BluetoothAddress,
    device: BluetoothLEDevice,
    status_token: i64,
    callbacks: Mutex<Option<CallbackSender>>,
    drops: LinkDropTracker,
}

impl WinRtLink {
    fn emit(&self, callback: GattCallback) -> BleResult<()> {
        let guard = self
            .callbacks
            .lock()
            .map_err(|_| BleError::Hardware("callback lock poisoned".to_string()))?;
        let sender = guard.as_ref().ok_or(BleError::NotConnected)?;
        let _ = sender.send(callback);
        Ok(())
    }

    async fn service(&self, uuid: Uuid) -> BleResult<GattDeviceService> {
        let result = self
            .device
            .GetGattServicesForUuidAsync(to_guid(uuid))
            .map_err(hw)?
            .await
            .map_err(hw)?;
        if result.Status().map_err(hw)? != GattCommunicationStatus::Success {
            return Err(BleError::ServiceNotFound(uuid));
        }
        let services = result.Services().map_err(hw)?;
        if services.Size().map_err(hw)? == 0 {
            return Err(BleError::ServiceNotFound(uuid));
        }
        services.GetAt(0).map_err(hw)
    }

    async fn collect_services(&self) -> windows::core::Result<(GattStatus, Vec<GattServiceInfo>)> {
        let result = self.device.GetGattServicesAsync()?.await?;
        if result.Status()? != GattCommunicationStatus::Success {
            warn!("Failed to get GATT services: {:?}", result.Status()?);
            return Ok((GattStatus::Other(result.Status()?.0 as u8), Vec::new()));
        }

        let services = result.Services()?;
        let mut infos = Vec::new();
        for i in 0..services.Size()? {
            let service = services.GetAt(i)?;
            let mut characteristics = Vec::new();
            let chars = service.GetCharacteristicsAsync()?.await?;
            if chars.Status()? == GattCommunicationStatus::Success {
                let list = chars.Characteristics()?;
                for j in 0..list.Size()? {
                    let c = list.GetAt(j)?;
                    characteristics.push(GattCharacteristicInfo {
                        uuid: to_uuid(c.Uuid()?),
                        properties: c.CharacteristicProperties()?.0,
                    });
                }
            }
            infos.push(GattServiceInfo {
                uuid: to_uuid(service.Uuid()?),
                characteristics,
            });
        }
        Ok((GattStatus::Success, infos))
    }
}

#[async_trait]
impl GattLink for WinRtLink {
    fn address(&self) -> BluetoothAddress {
        self.address
    }

    async fn discover_services(&self) -> BleResult<()> {
        let (status, services) = self.collect_services().await.map_err(hw)?;
        info!("Found {} GATT services", services.len());
        self.emit(GattCallback::ServicesDiscovered { status, services })
    }

    async fn write_characteristic(
        &self,
        service: Uuid,
        characteristic: Uuid,
        value: &[u8],
    ) -> BleResult<()> {
        let gatt_service = self.service(service).await?;
        let result = gatt_service
            .GetCharacteristicsForUuidAsync(to_guid(characteristic))
            .map_err(hw)?
            .await
            .map_err(hw)?;
        let chars = result.Characteristics().map_err(hw)?;
        if result.Status().map_err(hw)? != GattCommunicationStatus::Success
            || chars.Size().map_err(hw)? == 0
        {
            return Err(BleError::CharacteristicNotFound(characteristic));
        }
        let target = chars.GetAt(0).map_err(hw)?;

        let writer = DataWriter::new().map_err(hw)?;
        writer.WriteBytes(value).map_err(hw)?;
        let buffer = writer.DetachBuffer().map_err(hw)?;
        let status = target
            .WriteValueAsync(&buffer)
            .map_err(hw)?
            .await
            .map_err(hw)?;
        if status != GattCommunicationStatus::Success {
            return Err(BleError::Hardware(format!("write returned {:?}", status)));
        }
        self.drops.mark_written();
        Ok(())
    }

    async fn close(&self) {
        if let Ok(mut callbacks) = self.callbacks.lock() {
            callbacks.take();
        }
        let _ = self.device.RemoveConnectionStatusChanged(self.status_token);
        let _ = self.device.Close();
    }
}
