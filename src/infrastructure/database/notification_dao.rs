//! Queries over the `notification` table

use rusqlite::{params, Connection, Row};

use super::{Database, Table};
use crate::domain::models::Notification;
use crate::error::StoreResult;

const NOTIFICATION_COLUMNS: &str =
    "notification_id, device_address, false_alarm, dismissed, clicked, created_at";

#[derive(Clone)]
pub struct NotificationDao {
    db: Database,
}

fn notification_from_row(row: &Row<'_>) -> rusqlite::Result<Notification> {
    Ok(Notification {
        notification_id: row.get("notification_id")?,
        device_address: row.get("device_address")?,
        false_alarm: row.get("false_alarm")?,
        dismissed: row.get("dismissed")?,
        clicked: row.get("clicked")?,
        created_at: row.get("created_at")?,
    })
}

pub(crate) fn notifications_for_device(
    conn: &Connection,
    address: &str,
) -> StoreResult<Vec<Notification>> {
    let sql = format!(
        "SELECT {NOTIFICATION_COLUMNS} FROM notification WHERE device_address = ?1 \
         ORDER BY created_at DESC"
    );
    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt.query_map(params![address], notification_from_row)?;
    Ok(rows.collect::<Result<Vec<_>, _>>()?)
}

impl NotificationDao {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Store a notification and mark its device as notified
    pub fn insert(&self, notification: &Notification) -> StoreResult<i64> {
        let id = self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO notification (device_address, false_alarm, dismissed, clicked, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    notification.device_address,
                    notification.false_alarm,
                    notification.dismissed,
                    notification.clicked,
                    notification.created_at,
                ],
            )?;
            let id = tx.last_insert_rowid();
            tx.execute(
                "UPDATE device SET notification_sent = 1, last_notification_sent = ?2 \
                 WHERE address = ?1",
                params![notification.device_address, notification.created_at],
            )?;
            tx.commit()?;
            Ok(id)
        })?;
        self.db.notify(&[Table::Notification, Table::Device]);
        Ok(id)
    }

    pub fn for_device(&self, address: &str) -> StoreResult<Vec<Notification>> {
        self.db
            .with_conn(|conn| notifications_for_device(conn, address))
    }

    pub fn set_false_alarm(&self, notification_id: i64, false_alarm: bool) -> StoreResult<usize> {
        self.set_flag("false_alarm", notification_id, false_alarm)
    }

    pub fn set_dismissed(&self, notification_id: i64, dismissed: bool) -> StoreResult<usize> {
        self.set_flag("dismissed", notification_id, dismissed)
    }

    pub fn set_clicked(&self, notification_id: i64, clicked: bool) -> StoreResult<usize> {
        self.set_flag("clicked", notification_id, clicked)
    }

    // `column` is always one of the literals above
    fn set_flag(&self, column: &str, notification_id: i64, value: bool) -> StoreResult<usize> {
        let sql = format!("UPDATE notification SET {column} = ?2 WHERE notification_id = ?1");
        let updated = self.db.with_conn(|conn| {
            Ok(conn.execute(&sql, params![notification_id, value])?)
        })?;
        if updated > 0 {
            self.db.notify(&[Table::Notification]);
        }
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Device;
    use chrono::{NaiveDate, NaiveDateTime};

    fn at(hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 1)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    #[test]
    fn test_insert_marks_device_notified() {
        let db = Database::in_memory().unwrap();
        db.device_dao()
            .insert(&Device::new("AA:AA:AA:AA:AA:01", at(0)))
            .unwrap();

        let dao = db.notification_dao();
        let id = dao
            .insert(&Notification::new("AA:AA:AA:AA:AA:01", at(4)))
            .unwrap();
        assert!(id > 0);

        let device = db
            .device_dao()
            .get_by_address("AA:AA:AA:AA:AA:01")
            .unwrap()
            .unwrap();
        assert!(device.notification_sent);
        assert_eq!(device.last_notification_sent, Some(at(4)));
    }

    #[test]
    fn test_feedback_flags() {
        let db = Database::in_memory().unwrap();
        db.device_dao()
            .insert(&Device::new("AA:AA:AA:AA:AA:01", at(0)))
            .unwrap();
        let dao = db.notification_dao();
        let id = dao
            .insert(&Notification::new("AA:AA:AA:AA:AA:01", at(1)))
            .unwrap();

        assert_eq!(dao.set_false_alarm(id, true).unwrap(), 1);
        assert_eq!(dao.set_clicked(id, true).unwrap(), 1);
        assert_eq!(dao.set_dismissed(id + 100, true).unwrap(), 0);

        let stored = &dao.for_device("AA:AA:AA:AA:AA:01").unwrap()[0];
        assert!(stored.false_alarm);
        assert_eq!(stored.clicked, Some(true));
        assert_eq!(stored.dismissed, None);
    }
}
