//! Queries over the `device` table

use chrono::NaiveDateTime;
use futures::stream::BoxStream;
use rusqlite::{params, Connection, OptionalExtension, Params, Row};

use super::beacon_dao::beacons_for_device;
use super::notification_dao::notifications_for_device;
use super::{Database, Table};
use crate::domain::models::{Device, DeviceBeaconNotification};
use crate::error::{StoreError, StoreResult};

const DEVICE_COLUMNS: &str = "device_id, address, name, `ignore`, connectable, payload_data, \
     first_discovery, last_seen, notification_sent, last_notification_sent";

/// Data access for devices.
///
/// `watch_*` methods return streams that yield immediately and again after
/// every write to the device table.
#[derive(Clone)]
pub struct DeviceDao {
    db: Database,
}

pub(crate) fn device_from_row(row: &Row<'_>) -> rusqlite::Result<Device> {
    Ok(Device {
        device_id: row.get("device_id")?,
        address: row.get("address")?,
        name: row.get("name")?,
        ignore: row.get("ignore")?,
        connectable: row.get("connectable")?,
        payload_data: row.get("payload_data")?,
        first_discovery: row.get("first_discovery")?,
        last_seen: row.get("last_seen")?,
        notification_sent: row.get("notification_sent")?,
        last_notification_sent: row.get("last_notification_sent")?,
    })
}

fn query_devices<P: Params>(conn: &Connection, sql: &str, params: P) -> StoreResult<Vec<Device>> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt.query_map(params, device_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

fn query_count<P: Params>(conn: &Connection, sql: &str, params: P) -> StoreResult<i64> {
    Ok(conn.query_row(sql, params, |row| row.get(0))?)
}

fn select_all() -> String {
    format!("SELECT {DEVICE_COLUMNS} FROM device ORDER BY last_seen DESC")
}

fn select_ignored() -> String {
    format!("SELECT {DEVICE_COLUMNS} FROM device WHERE `ignore` = 1 ORDER BY last_seen DESC")
}

/// Map a unique-constraint failure to [`StoreError::Conflict`]
fn map_conflict(err: rusqlite::Error, address: &str) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Conflict(address.to_string())
        }
        _ => StoreError::Sqlite(err),
    }
}

fn id_param(device: &Device) -> Option<i64> {
    (device.device_id != 0).then_some(device.device_id)
}

pub(crate) fn insert_device(
    conn: &Connection,
    verb: &str,
    device: &Device,
) -> rusqlite::Result<usize> {
    let sql = format!(
        "{verb} INTO device ({DEVICE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)"
    );
    conn.prepare_cached(&sql)?.execute(params![
        id_param(device),
        device.address,
        device.name,
        device.ignore,
        device.connectable,
        device.payload_data,
        device.first_discovery,
        device.last_seen,
        device.notification_sent,
        device.last_notification_sent,
    ])
}

/// First device whose address matches the `LIKE` pattern
pub(crate) fn device_by_address(conn: &Connection, address: &str) -> StoreResult<Option<Device>> {
    let sql = format!("SELECT {DEVICE_COLUMNS} FROM device WHERE address LIKE ?1 LIMIT 1");
    Ok(conn
        .prepare_cached(&sql)?
        .query_row(params![address], device_from_row)
        .optional()?)
}

pub(crate) fn update_device(conn: &Connection, device: &Device) -> StoreResult<usize> {
    conn.prepare_cached(
        "UPDATE device SET address = ?2, name = ?3, `ignore` = ?4, connectable = ?5, \
         payload_data = ?6, first_discovery = ?7, last_seen = ?8, \
         notification_sent = ?9, last_notification_sent = ?10 \
         WHERE device_id = ?1",
    )?
    .execute(params![
        device.device_id,
        device.address,
        device.name,
        device.ignore,
        device.connectable,
        device.payload_data,
        device.first_discovery,
        device.last_seen,
        device.notification_sent,
        device.last_notification_sent,
    ])
    .map_err(|e| map_conflict(e, &device.address))
}

/// Projection rows for the given devices, read inside one transaction
fn device_beacons(
    conn: &Connection,
    sql: &str,
    params: impl Params,
) -> StoreResult<Vec<DeviceBeaconNotification>> {
    let tx = conn.unchecked_transaction()?;
    let devices = query_devices(&tx, sql, params)?;

    let mut result = Vec::with_capacity(devices.len());
    for device in devices {
        let beacons = beacons_for_device(&tx, &device.address)?;
        let notifications = notifications_for_device(&tx, &device.address)?;
        result.push(DeviceBeaconNotification {
            device,
            beacons,
            notifications,
        });
    }
    tx.commit()?;
    Ok(result)
}

impl DeviceDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// All devices, most recently seen first
    pub fn watch_all(&self) -> BoxStream<'static, StoreResult<Vec<Device>>> {
        let sql = select_all();
        self.db
            .observe(Table::Device, move |conn| query_devices(conn, &sql, []))
    }

    pub fn all(&self) -> StoreResult<Vec<Device>> {
        self.db.with_conn(|conn| query_devices(conn, &select_all(), []))
    }

    /// Ignored devices, most recently seen first
    pub fn watch_ignored(&self) -> BoxStream<'static, StoreResult<Vec<Device>>> {
        let sql = select_ignored();
        self.db
            .observe(Table::Device, move |conn| query_devices(conn, &sql, []))
    }

    pub fn ignored(&self) -> StoreResult<Vec<Device>> {
        self.db
            .with_conn(|conn| query_devices(conn, &select_ignored(), []))
    }

    /// First device whose address matches the `LIKE` pattern
    pub fn get_by_address(&self, address: &str) -> StoreResult<Option<Device>> {
        self.db.with_conn(|conn| device_by_address(conn, address))
    }

    /// Delete every device whose address matches the `LIKE` pattern
    pub fn remove(&self, address: &str) -> StoreResult<usize> {
        let removed = self.db.with_conn(|conn| {
            Ok(conn.execute("DELETE FROM device WHERE address LIKE ?1", params![address])?)
        })?;
        if removed > 0 {
            self.db
                .notify(&[Table::Device, Table::Beacon, Table::Notification]);
        }
        Ok(removed)
    }

    pub fn ignore(&self, address: &str) -> StoreResult<usize> {
        self.set_ignore(address, true)
    }

    pub fn un_ignore(&self, address: &str) -> StoreResult<usize> {
        self.set_ignore(address, false)
    }

    fn set_ignore(&self, address: &str, ignore: bool) -> StoreResult<usize> {
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "UPDATE device SET `ignore` = ?2 WHERE address = ?1",
                params![address, ignore],
            )?)
        })?;
        if updated > 0 {
            self.db.notify(&[Table::Device]);
        }
        Ok(updated)
    }

    pub fn watch_total_count(&self) -> BoxStream<'static, StoreResult<i64>> {
        self.db.observe(Table::Device, |conn| {
            query_count(conn, "SELECT COUNT(*) FROM device", [])
        })
    }

    /// Number of devices first discovered at or after `since`
    pub fn watch_total_count_change(
        &self,
        since: NaiveDateTime,
    ) -> BoxStream<'static, StoreResult<i64>> {
        self.db.observe(Table::Device, move |conn| {
            query_count(
                conn,
                "SELECT COUNT(*) FROM device WHERE first_discovery >= ?1",
                params![since],
            )
        })
    }

    /// Number of devices seen at or after `since`
    pub fn watch_currently_monitored(
        &self,
        since: NaiveDateTime,
    ) -> BoxStream<'static, StoreResult<i64>> {
        self.db.observe(Table::Device, move |conn| {
            query_count(
                conn,
                "SELECT COUNT(*) FROM device WHERE last_seen >= ?1",
                params![since],
            )
        })
    }

    pub fn device_beacons_since(
        &self,
        date_time: NaiveDateTime,
    ) -> StoreResult<Vec<DeviceBeaconNotification>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM device WHERE first_discovery >= ?1");
        self.db
            .with_conn(|conn| device_beacons(conn, &sql, params![date_time]))
    }

    pub fn device_beacons(&self) -> StoreResult<Vec<DeviceBeaconNotification>> {
        let sql = format!("SELECT {DEVICE_COLUMNS} FROM device");
        self.db.with_conn(|conn| device_beacons(conn, &sql, []))
    }

    /// Insert all devices in one transaction.
    ///
    /// A duplicate address aborts the call with [`StoreError::Conflict`] and
    /// nothing from the batch is kept.
    pub fn insert_all(&self, devices: &[Device]) -> StoreResult<()> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            for device in devices {
                insert_device(&tx, "INSERT", device)
                    .map_err(|e| map_conflict(e, &device.address))?;
            }
            tx.commit()?;
            Ok(())
        })?;
        if !devices.is_empty() {
            self.db.notify(&[Table::Device]);
        }
        Ok(())
    }

    /// Insert one device, ignoring conflicts.
    ///
    /// Returns the new row id, or `-1` when a device with the same address
    /// (or id) already existed.
    pub fn insert(&self, device: &Device) -> StoreResult<i64> {
        let row_id = self.db.with_conn(|conn| {
            let inserted = insert_device(conn, "INSERT OR IGNORE", device)?;
            Ok(if inserted == 0 {
                -1
            } else {
                conn.last_insert_rowid()
            })
        })?;
        if row_id != -1 {
            self.db.notify(&[Table::Device]);
        }
        Ok(row_id)
    }

    /// Overwrite the row with the same `device_id`
    pub fn update(&self, device: &Device) -> StoreResult<usize> {
        let updated = self.db.with_conn(|conn| update_device(conn, device))?;
        if updated > 0 {
            self.db.notify(&[Table::Device]);
        }
        Ok(updated)
    }

    /// Delete the row with the same `device_id`
    pub fn delete(&self, device: &Device) -> StoreResult<usize> {
        let deleted = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM device WHERE device_id = ?1",
                params![device.device_id],
            )?)
        })?;
        if deleted > 0 {
            self.db
                .notify(&[Table::Device, Table::Beacon, Table::Notification]);
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{Beacon, Notification};
    use chrono::{Duration as ChronoDuration, NaiveDate};
    use futures::StreamExt;
    use std::time::Duration;

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn device(address: &str, hour: u32) -> Device {
        Device::new(address, at(hour))
    }

    fn dao() -> DeviceDao {
        Database::in_memory().unwrap().device_dao()
    }

    #[test]
    fn test_insert_all_aborts_on_duplicate() {
        let dao = dao();
        dao.insert_all(&[device("AA:AA:AA:AA:AA:01", 1)]).unwrap();

        let err = dao
            .insert_all(&[device("AA:AA:AA:AA:AA:01", 2)])
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(ref a) if a == "AA:AA:AA:AA:AA:01"));

        let stored = dao.get_by_address("AA:AA:AA:AA:AA:01").unwrap().unwrap();
        assert_eq!(stored.last_seen, at(1));
    }

    #[test]
    fn test_insert_all_rolls_back_whole_batch() {
        let dao = dao();
        let err = dao.insert_all(&[
            device("AA:AA:AA:AA:AA:01", 1),
            device("AA:AA:AA:AA:AA:02", 1),
            device("AA:AA:AA:AA:AA:01", 2),
        ]);
        assert!(err.is_err());
        assert!(dao.all().unwrap().is_empty());
    }

    #[test]
    fn test_insert_ignores_duplicate() {
        let dao = dao();
        let id = dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        assert!(id > 0);

        let mut duplicate = device("AA:AA:AA:AA:AA:01", 5);
        duplicate.name = Some("other".to_string());
        assert_eq!(dao.insert(&duplicate).unwrap(), -1);

        let stored = dao.get_by_address("AA:AA:AA:AA:AA:01").unwrap().unwrap();
        assert_eq!(stored.device_id, id);
        assert_eq!(stored.name, None);
        assert_eq!(stored.last_seen, at(1));
    }

    #[test]
    fn test_insert_ignores_duplicate_id() {
        let dao = dao();
        let id = dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();

        let mut same_id = device("AA:AA:AA:AA:AA:02", 2);
        same_id.device_id = id;
        assert_eq!(dao.insert(&same_id).unwrap(), -1);

        let all = dao.all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].address, "AA:AA:AA:AA:AA:01");
        assert!(dao.get_by_address("AA:AA:AA:AA:AA:02").unwrap().is_none());
    }

    #[test]
    fn test_all_orders_by_last_seen_desc() {
        let dao = dao();
        dao.insert_all(&[
            device("AA:AA:AA:AA:AA:01", 3),
            device("AA:AA:AA:AA:AA:02", 9),
            device("AA:AA:AA:AA:AA:03", 6),
        ])
        .unwrap();

        let order: Vec<String> = dao.all().unwrap().into_iter().map(|d| d.address).collect();
        assert_eq!(
            order,
            vec!["AA:AA:AA:AA:AA:02", "AA:AA:AA:AA:AA:03", "AA:AA:AA:AA:AA:01"]
        );
    }

    #[test]
    fn test_ignore_then_un_ignore_restores_visibility() {
        let dao = dao();
        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        dao.insert(&device("AA:AA:AA:AA:AA:02", 2)).unwrap();

        assert_eq!(dao.ignore("AA:AA:AA:AA:AA:01").unwrap(), 1);
        let ignored = dao.ignored().unwrap();
        assert_eq!(ignored.len(), 1);
        assert!(ignored[0].ignore);

        dao.un_ignore("AA:AA:AA:AA:AA:01").unwrap();
        assert!(dao.ignored().unwrap().is_empty());
        let all = dao.all().unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|d| !d.ignore));
    }

    #[test]
    fn test_ignore_uses_exact_match() {
        let dao = dao();
        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        assert_eq!(dao.ignore("AA:AA:AA:AA:AA:0_").unwrap(), 0);
    }

    #[test]
    fn test_get_by_address_and_remove_use_like() {
        let dao = dao();
        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        dao.insert(&device("AA:AA:AA:AA:AA:02", 2)).unwrap();
        dao.insert(&device("BB:AA:AA:AA:AA:03", 3)).unwrap();

        assert!(dao.get_by_address("aa:aa:aa:aa:aa:01").unwrap().is_some());
        assert!(dao.get_by_address("CC:%").unwrap().is_none());

        assert_eq!(dao.remove("AA:%").unwrap(), 2);
        let remaining = dao.all().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].address, "BB:AA:AA:AA:AA:03");
    }

    #[test]
    fn test_update_and_delete_by_id() {
        let dao = dao();
        let id = dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        dao.insert(&device("AA:AA:AA:AA:AA:02", 1)).unwrap();

        let mut stored = dao.get_by_address("AA:AA:AA:AA:AA:01").unwrap().unwrap();
        assert_eq!(stored.device_id, id);
        stored.last_seen = at(7);
        stored.payload_data = Some(0x10);
        assert_eq!(dao.update(&stored).unwrap(), 1);
        assert_eq!(
            dao.get_by_address("AA:AA:AA:AA:AA:01").unwrap().unwrap(),
            stored
        );

        stored.address = "AA:AA:AA:AA:AA:02".to_string();
        assert!(matches!(dao.update(&stored), Err(StoreError::Conflict(_))));

        assert_eq!(dao.delete(&stored).unwrap(), 1);
        assert!(dao.get_by_address("AA:AA:AA:AA:AA:01").unwrap().is_none());
    }

    #[test]
    fn test_device_beacons_projection() {
        let db = Database::in_memory().unwrap();
        let dao = db.device_dao();
        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        dao.insert(&device("AA:AA:AA:AA:AA:02", 8)).unwrap();

        let beacons = db.beacon_dao();
        beacons
            .insert(&Beacon::new("AA:AA:AA:AA:AA:01", at(1), -60))
            .unwrap();
        beacons
            .insert(&Beacon::new("AA:AA:AA:AA:AA:01", at(2), -55))
            .unwrap();
        db.notification_dao()
            .insert(&Notification::new("AA:AA:AA:AA:AA:01", at(2)))
            .unwrap();

        let all = dao.device_beacons().unwrap();
        assert_eq!(all.len(), 2);
        let first = all
            .iter()
            .find(|d| d.device.address == "AA:AA:AA:AA:AA:01")
            .unwrap();
        assert_eq!(first.beacons.len(), 2);
        assert_eq!(first.notifications.len(), 1);

        let recent = dao.device_beacons_since(at(5)).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].device.address, "AA:AA:AA:AA:AA:02");
        assert!(recent[0].beacons.is_empty());
    }

    #[test]
    fn test_remove_cascades_to_beacons_and_notifications() {
        let db = Database::in_memory().unwrap();
        let dao = db.device_dao();
        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        dao.insert(&device("AA:AA:AA:AA:AA:02", 1)).unwrap();
        db.beacon_dao()
            .insert(&Beacon::new("AA:AA:AA:AA:AA:01", at(1), -60))
            .unwrap();
        db.notification_dao()
            .insert(&Notification::new("AA:AA:AA:AA:AA:01", at(2)))
            .unwrap();
        db.notification_dao()
            .insert(&Notification::new("AA:AA:AA:AA:AA:02", at(2)))
            .unwrap();

        assert_eq!(dao.remove("AA:AA:AA:AA:AA:01").unwrap(), 1);
        assert!(db
            .beacon_dao()
            .for_device("AA:AA:AA:AA:AA:01")
            .unwrap()
            .is_empty());
        assert!(db
            .notification_dao()
            .for_device("AA:AA:AA:AA:AA:01")
            .unwrap()
            .is_empty());
        assert_eq!(
            db.notification_dao()
                .for_device("AA:AA:AA:AA:AA:02")
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_watch_all_emits_after_writes() {
        let dao = dao();
        let mut all = dao.watch_all();
        assert!(all.next().await.unwrap().unwrap().is_empty());

        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        let devices = tokio::time::timeout(Duration::from_secs(1), all.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(devices.len(), 1);

        dao.ignore("AA:AA:AA:AA:AA:01").unwrap();
        let devices = tokio::time::timeout(Duration::from_secs(1), all.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(devices[0].ignore);
    }

    #[tokio::test]
    async fn test_watch_ignored_follows_un_ignore() {
        let dao = dao();
        dao.insert(&device("AA:AA:AA:AA:AA:01", 1)).unwrap();
        dao.ignore("AA:AA:AA:AA:AA:01").unwrap();

        let mut ignored = dao.watch_ignored();
        assert_eq!(ignored.next().await.unwrap().unwrap().len(), 1);

        dao.un_ignore("AA:AA:AA:AA:AA:01").unwrap();
        let after = tokio::time::timeout(Duration::from_secs(1), ignored.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(after.is_empty());
    }

    #[tokio::test]
    async fn test_count_streams() {
        let dao = dao();
        let mut old = device("AA:AA:AA:AA:AA:01", 1);
        old.last_seen = at(10);
        dao.insert_all(&[old, device("AA:AA:AA:AA:AA:02", 6), device("AA:AA:AA:AA:AA:03", 2)])
            .unwrap();

        let since = at(1) + ChronoDuration::hours(4);
        assert_eq!(dao.watch_total_count().next().await.unwrap().unwrap(), 3);
        assert_eq!(
            dao.watch_total_count_change(since)
                .next()
                .await
                .unwrap()
                .unwrap(),
            1
        );
        assert_eq!(
            dao.watch_currently_monitored(since)
                .next()
                .await
                .unwrap()
                .unwrap(),
            2
        );
    }
}
