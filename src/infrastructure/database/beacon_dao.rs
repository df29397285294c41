//! Queries over the `beacon` table

use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{Database, Table};
use crate::domain::models::Beacon;
use crate::error::StoreResult;

const BEACON_COLUMNS: &str =
    "beacon_id, received_at, rssi, device_address, latitude, longitude, manufacturer_data";

#[derive(Clone)]
pub struct BeaconDao {
    db: Database,
}

fn beacon_from_row(row: &Row<'_>) -> rusqlite::Result<Beacon> {
    Ok(Beacon {
        beacon_id: row.get("beacon_id")?,
        received_at: row.get("received_at")?,
        rssi: row.get("rssi")?,
        device_address: row.get("device_address")?,
        latitude: row.get("latitude")?,
        longitude: row.get("longitude")?,
        manufacturer_data: row.get("manufacturer_data")?,
    })
}

pub(crate) fn beacons_for_device(conn: &Connection, address: &str) -> StoreResult<Vec<Beacon>> {
    let sql = format!(
        "SELECT {BEACON_COLUMNS} FROM beacon WHERE device_address = ?1 ORDER BY received_at DESC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![address], beacon_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

pub(crate) fn insert_beacon(conn: &Connection, beacon: &Beacon) -> StoreResult<i64> {
    conn.prepare_cached(
        "INSERT INTO beacon (received_at, rssi, device_address, latitude, longitude, manufacturer_data) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
    )?
    .execute(params![
        beacon.received_at,
        beacon.rssi,
        beacon.device_address,
        beacon.latitude,
        beacon.longitude,
        beacon.manufacturer_data,
    ])?;
    Ok(conn.last_insert_rowid())
}

impl BeaconDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a beacon; the device row must already exist
    pub fn insert(&self, beacon: &Beacon) -> StoreResult<i64> {
        let id = self.db.with_conn(|conn| insert_beacon(conn, beacon))?;
        self.db.notify(&[Table::Beacon]);
        Ok(id)
    }

    /// Beacons of one device, newest first
    pub fn for_device(&self, address: &str) -> StoreResult<Vec<Beacon>> {
        self.db.with_conn(|conn| beacons_for_device(conn, address))
    }

    pub fn latest_for_device(&self, address: &str) -> StoreResult<Option<Beacon>> {
        let sql = format!(
            "SELECT {BEACON_COLUMNS} FROM beacon WHERE device_address = ?1 \
             ORDER BY received_at DESC LIMIT 1"
        );
        self.db.with_conn(|conn| {
            Ok(conn
                .query_row(&sql, params![address], beacon_from_row)
                .optional()?)
        })
    }

    pub fn watch_count_since(&self, since: NaiveDateTime) -> BoxStream<'static, StoreResult<i64>> {
        self.db.observe(Table::Beacon, move |conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM beacon WHERE received_at >= ?1",
                params![since],
                |row| row.get(0),
            )?)
        })
    }

    pub fn count_since(&self, since: NaiveDateTime) -> StoreResult<i64> {
        self.db.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM beacon WHERE received_at >= ?1",
                params![since],
                |row| row.get(0),
            )?)
        })
    }

    /// Drop beacons received before `cutoff`, returning how many were removed
    pub fn delete_older_than(&self, cutoff: NaiveDateTime) -> StoreResult<usize> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM beacon WHERE received_at < ?1",
                params![cutoff],
            )?)
        })?;
        if deleted > 0 {
            self.db.notify(&[Table::Beacon]);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Device;
    use crate::error::StoreError;
    use chrono::NaiveDate;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn setup() -> (Database, BeaconDao) {
        let db = Database::in_memory().unwrap();
        db.device_dao()
            .insert(&Device::new("AA:AA:AA:AA:AA:01", at(0)))
            .unwrap();
        let dao = db.beacon_dao();
        (db, dao)
    }

    #[test]
    fn test_insert_requires_device() {
        let (_db, dao) = setup();
        let err = dao
            .insert(&Beacon::new("FF:FF:FF:FF:FF:FF", at(1), -70))
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }

    #[test]
    fn test_for_device_newest_first() {
        let (_db, dao) = setup();
        let mut with_payload = Beacon::new("AA:AA:AA:AA:AA:01", at(3), -40);
        with_payload.manufacturer_data = Some(vec![0x12, 0x19, 0x10]);
        dao.insert(&Beacon::new("AA:AA:AA:AA:AA:01", at(1), -70))
            .unwrap();
        dao.insert(&with_payload).unwrap();

        let beacons = dao.for_device("AA:AA:AA:AA:AA:01").unwrap();
        assert_eq!(beacons.len(), 2);
        assert_eq!(beacons[0].rssi, -40);
        assert_eq!(beacons[0].manufacturer_data, Some(vec![0x12, 0x19, 0x10]));

        let latest = dao.latest_for_device("AA:AA:AA:AA:AA:01").unwrap().unwrap();
        assert_eq!(latest.received_at, at(3));
    }

    #[test]
    fn test_count_and_prune() {
        let (_db, dao) = setup();
        for hour in [1, 2, 5, 8] {
            dao.insert(&Beacon::new("AA:AA:AA:AA:AA:01", at(hour), -60))
                .unwrap();
        }

        assert_eq!(dao.count_since(at(5)).unwrap(), 2);
        assert_eq!(dao.delete_older_than(at(5)).unwrap(), 2);
        assert_eq!(dao.count_since(at(0)).unwrap(), 2);
    }
}
