//! Tracker sound protocol
//!
//! GATT identifiers and values understood by the tag firmware, GATT status
//! codes, and recognition of Find My advertisements.

use std::collections::BTreeMap;
use uuid::Uuid;

/// Service exposing the sound characteristic
pub const SOUND_SERVICE_UUID: Uuid = Uuid::from_u128(0x7DFC9000_7D1C_4951_86AA_8D9728F8D66C);

/// Characteristic that starts the sound when written
pub const SOUND_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x7DFC9001_7D1C_4951_86AA_8D9728F8D66C);

/// Value written to the sound characteristic
pub const PLAY_SOUND_OPCODE: u8 = 175;

/// Characteristic property bits that mark the tag's completion event
pub const EVENT_CALLBACK_PROPERTIES: u32 = 0x302;

/// Generic GATT failure reported when a backend cannot connect
pub const GATT_ERROR: u8 = 0x85;

/// Bluetooth SIG company identifier of Apple
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// First byte of an Apple offline-finding (Find My) payload
pub const FIND_MY_PAYLOAD_TYPE: u8 = 0x12;

/// Status attached to GATT callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GattStatus {
    Success,
    /// The remote side terminated the connection (status 19)
    PeerTerminated,
    Other(u8),
}

impl GattStatus {
    pub fn code(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::PeerTerminated => 19,
            Self::Other(code) => code,
        }
    }
}

impl From<u8> for GattStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => Self::Success,
            19 => Self::PeerTerminated,
            other => Self::Other(other),
        }
    }
}

/// Link state reported with a connection state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Encode `value` as an unsigned 8-bit field at `offset`
pub fn encode_uint8(value: u8, offset: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; offset + 1];
    buffer[offset] = value;
    buffer
}

/// Payload that makes the tag play its sound
pub fn play_sound_command() -> Vec<u8> {
    encode_uint8(PLAY_SOUND_OPCODE, 0)
}

/// True when all event-callback bits are set in `properties`
pub fn is_event_callback(properties: u32) -> bool {
    properties & EVENT_CALLBACK_PROPERTIES == EVENT_CALLBACK_PROPERTIES
}

/// Apple manufacturer data if it carries a Find My payload
pub fn find_my_payload(manufacturer_data: &BTreeMap<u16, Vec<u8>>) -> Option<&[u8]> {
    manufacturer_data
        .get(&APPLE_COMPANY_ID)
        .map(Vec::as_slice)
        .filter(|data| data.first() == Some(&FIND_MY_PAYLOAD_TYPE))
}

/// Status byte of a Find My payload
///
/// ```text
/// [0]     : payload type (0x12)
/// [1]     : payload length
/// [2]     : status (battery level, maintained bit)
/// [3..]   : public key fragment
/// ```
pub fn find_my_status(manufacturer_data: &BTreeMap<u16, Vec<u8>>) -> Option<u8> {
    find_my_payload(manufacturer_data).and_then(|data| data.get(2).copied())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apple(data: Vec<u8>) -> BTreeMap<u16, Vec<u8>> {
        BTreeMap::from([(APPLE_COMPANY_ID, data)])
    }

    #[test]
    fn test_uuids() {
        assert_eq!(
            SOUND_SERVICE_UUID.to_string(),
            "7dfc9000-7d1c-4951-86aa-8d9728f8d66c"
        );
        assert_eq!(
            SOUND_CHARACTERISTIC_UUID.to_string(),
            "7dfc9001-7d1c-4951-86aa-8d9728f8d66c"
        );
    }

    #[test]
    fn test_play_sound_command() {
        assert_eq!(play_sound_command(), vec![0xAF]);
        assert_eq!(encode_uint8(7, 2), vec![0, 0, 7]);
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(GattStatus::from(0), GattStatus::Success);
        assert_eq!(GattStatus::from(19), GattStatus::PeerTerminated);
        assert_eq!(GattStatus::from(GATT_ERROR), GattStatus::Other(0x85));
        assert_eq!(GattStatus::PeerTerminated.code(), 19);
    }

    #[test]
    fn test_event_callback_mask() {
        assert!(is_event_callback(0x302));
        assert!(is_event_callback(0x30A));
        assert!(!is_event_callback(0x300));
        assert!(!is_event_callback(0x002));
    }

    #[test]
    fn test_find_my_detection() {
        let tag = apple(vec![0x12, 0x19, 0x10, 0xAA]);
        assert!(find_my_payload(&tag).is_some());
        assert_eq!(find_my_status(&tag), Some(0x10));

        // Nearby-info payloads from phones are not trackers
        assert!(find_my_payload(&apple(vec![0x10, 0x05, 0x01])).is_none());
        assert!(find_my_payload(&BTreeMap::from([(0x0075, vec![0x12])])).is_none());
        assert_eq!(find_my_status(&apple(vec![0x12])), None);
    }
}
