//! Turns scan results into device and beacon rows.

use chrono::NaiveDateTime;
use tracing::debug;

use crate::domain::models::{Beacon, Device, ScannedDevice};
use crate::error::{StoreError, StoreResult};
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::database::{
    device_by_address, insert_beacon, insert_device, update_device, Database, Table,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SightingOutcome {
    /// First time this address was seen
    NewDevice,
    /// An existing device was refreshed
    KnownDevice { ignored: bool },
}

pub struct SightingRecorder {
    db: Database,
}

impl SightingRecorder {
    pub fn new(db: &Database) -> Self {
        Self { db: db.clone() }
    }

    /// Record one advertisement seen at `seen_at`.
    ///
    /// The device upsert and the beacon insert commit together. Ignored
    /// devices are still refreshed and get a beacon row; filtering them is
    /// up to the reader.
    pub fn record(
        &self,
        scanned: &ScannedDevice,
        seen_at: NaiveDateTime,
    ) -> StoreResult<SightingOutcome> {
        let address = scanned.address.to_string();
        let payload = protocol::find_my_status(&scanned.manufacturer_data);

        let mut device = Device::new(address.clone(), seen_at);
        device.name = scanned.name.clone();
        device.connectable = scanned.connectable;
        device.payload_data = payload;

        let mut beacon = Beacon::new(address.clone(), seen_at, i32::from(scanned.rssi));
        beacon.manufacturer_data =
            protocol::find_my_payload(&scanned.manufacturer_data).map(<[u8]>::to_vec);

        let outcome = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;

            let outcome = if insert_device(&tx, "INSERT OR IGNORE", &device)? > 0 {
                debug!(%address, "New device discovered");
                SightingOutcome::NewDevice
            } else {
                let mut existing = device_by_address(&tx, &address)?
                    .ok_or_else(|| StoreError::Conflict(address.clone()))?;
                existing.last_seen = seen_at;
                existing.connectable = scanned.connectable;
                if scanned.name.is_some() {
                    existing.name = scanned.name.clone();
                }
                if payload.is_some() {
                    existing.payload_data = payload;
                }
                update_device(&tx, &existing)?;
                SightingOutcome::KnownDevice {
                    ignored: existing.ignore,
                }
            };

            insert_beacon(&tx, &beacon)?;
            tx.commit()?;
            Ok(outcome)
        })?;

        self.db.notify(&[Table::Device, Table::Beacon]);
        Ok(outcome)
    }
}
