//! Database schema definitions

use rusqlite::Connection;

use crate::error::StoreResult;

pub const SCHEMA_VERSION: i64 = 1;

/// Create all tables and indexes
pub fn create_tables(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        r#"
        -- One row per distinct device address
        CREATE TABLE IF NOT EXISTS device (
            device_id INTEGER PRIMARY KEY AUTOINCREMENT,
            address TEXT NOT NULL UNIQUE,
            name TEXT,
            `ignore` INTEGER NOT NULL DEFAULT 0,
            connectable INTEGER NOT NULL DEFAULT 0,
            payload_data INTEGER,
            first_discovery TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            notification_sent INTEGER NOT NULL DEFAULT 0,
            last_notification_sent TEXT
        );

        -- Every received advertisement
        CREATE TABLE IF NOT EXISTS beacon (
            beacon_id INTEGER PRIMARY KEY AUTOINCREMENT,
            received_at TEXT NOT NULL,
            rssi INTEGER NOT NULL,
            device_address TEXT NOT NULL,
            latitude REAL,
            longitude REAL,
            manufacturer_data BLOB,
            FOREIGN KEY (device_address) REFERENCES device(address) ON DELETE CASCADE
        );

        -- Tracking alerts raised for a device
        CREATE TABLE IF NOT EXISTS notification (
            notification_id INTEGER PRIMARY KEY AUTOINCREMENT,
            device_address TEXT NOT NULL,
            false_alarm INTEGER NOT NULL DEFAULT 0,
            dismissed INTEGER,
            clicked INTEGER,
            created_at TEXT NOT NULL,
            FOREIGN KEY (device_address) REFERENCES device(address) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_device_last_seen ON device(last_seen);
        CREATE INDEX IF NOT EXISTS idx_device_first_discovery ON device(first_discovery);
        CREATE INDEX IF NOT EXISTS idx_beacon_device ON beacon(device_address);
        CREATE INDEX IF NOT EXISTS idx_beacon_received_at ON beacon(received_at);
        CREATE INDEX IF NOT EXISTS idx_notification_device ON notification(device_address);
        "#,
    )?;

    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(tables, vec!["beacon", "device", "notification"]);

        let version: i64 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
