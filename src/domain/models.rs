use crate::error::BleError;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// 48-bit Bluetooth device address.
///
/// Parses `AA:BB:CC:DD:EE:FF` in either case and always displays upper-case,
/// which is the form stored in the device table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BluetoothAddress([u8; 6]);

impl BluetoothAddress {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    pub fn bytes(&self) -> [u8; 6] {
        self.0
    }

    /// Address packed into the low 48 bits, most significant byte first.
    pub fn as_u64(&self) -> u64 {
        self.0.iter().fold(0u64, |acc, b| (acc << 8) | *b as u64)
    }

    pub fn from_u64(value: u64) -> Self {
        let mut bytes = [0u8; 6];
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (value >> (8 * (5 - i))) as u8;
        }
        Self(bytes)
    }
}

impl FromStr for BluetoothAddress {
    type Err = BleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || BleError::InvalidAddress(s.to_string());
        let parts: Vec<&str> = s.trim().split(':').collect();
        if parts.len() != 6 {
            return Err(invalid());
        }

        let mut bytes = [0u8; 6];
        for (byte, part) in bytes.iter_mut().zip(parts) {
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            a, b, c, d, e, g
        )
    }
}

/// A row of the `device` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Row id, `0` until the device has been inserted.
    pub device_id: i64,
    pub address: String,
    pub name: Option<String>,
    pub ignore: bool,
    pub connectable: bool,
    pub payload_data: Option<u8>,
    pub first_discovery: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub notification_sent: bool,
    pub last_notification_sent: Option<NaiveDateTime>,
}

impl Device {
    pub fn new(address: impl Into<String>, seen_at: NaiveDateTime) -> Self {
        Self {
            device_id: 0,
            address: address.into(),
            name: None,
            ignore: false,
            connectable: false,
            payload_data: None,
            first_discovery: seen_at,
            last_seen: seen_at,
            notification_sent: false,
            last_notification_sent: None,
        }
    }
}

/// One received advertisement of a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub beacon_id: i64,
    pub received_at: NaiveDateTime,
    pub rssi: i32,
    pub device_address: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub manufacturer_data: Option<Vec<u8>>,
}

impl Beacon {
    pub fn new(device_address: impl Into<String>, received_at: NaiveDateTime, rssi: i32) -> Self {
        Self {
            beacon_id: 0,
            received_at,
            rssi,
            device_address: device_address.into(),
            latitude: None,
            longitude: None,
            manufacturer_data: None,
        }
    }
}

/// A tracking alert raised for a device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub notification_id: i64,
    pub device_address: String,
    pub false_alarm: bool,
    pub dismissed: Option<bool>,
    pub clicked: Option<bool>,
    pub created_at: NaiveDateTime,
}

impl Notification {
    pub fn new(device_address: impl Into<String>, created_at: NaiveDateTime) -> Self {
        Self {
            notification_id: 0,
            device_address: device_address.into(),
            false_alarm: false,
            dismissed: None,
            clicked: None,
            created_at,
        }
    }
}

/// Read-only projection of a device with its beacons and notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceBeaconNotification {
    pub device: Device,
    pub beacons: Vec<Beacon>,
    pub notifications: Vec<Notification>,
}

/// Advertisement reported by a scan.
#[derive(Debug, Clone, PartialEq)]
pub struct ScannedDevice {
    pub address: BluetoothAddress,
    pub name: Option<String>,
    pub rssi: i16,
    /// Manufacturer-specific data keyed by company id.
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
    pub connectable: bool,
}

/// Status signals broadcast by the GATT service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattAction {
    GattConnected,
    GattDisconnected,
    EventCompleted,
    EventFailed,
}

impl GattAction {
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::GattConnected => "ACTION_GATT_CONNECTED",
            Self::GattDisconnected => "ACTION_GATT_DISCONNECTED",
            Self::EventCompleted => "EVENT_COMPLETED",
            Self::EventFailed => "EVENT_FAILED",
        }
    }
}

impl fmt::Display for GattAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
}
