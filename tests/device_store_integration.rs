use chrono::{Duration, NaiveDate, NaiveDateTime};
use futures::StreamExt;
use std::collections::BTreeMap;

use tracking_detection::domain::models::{BluetoothAddress, Notification, ScannedDevice};
use tracking_detection::domain::sightings::{SightingOutcome, SightingRecorder};
use tracking_detection::infrastructure::bluetooth::protocol;
use tracking_detection::infrastructure::database::Database;

fn at(hour: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 6, 10)
        .unwrap()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
}

fn tracker(last: u8, rssi: i16) -> ScannedDevice {
    let mut manufacturer_data = BTreeMap::new();
    manufacturer_data.insert(
        protocol::APPLE_COMPANY_ID,
        vec![protocol::FIND_MY_PAYLOAD_TYPE, 0x19, 0x10, 0x01],
    );
    ScannedDevice {
        address: BluetoothAddress::new([0xC0, 0xFF, 0xEE, 0x00, 0x00, last]),
        name: None,
        rssi,
        manufacturer_data,
        connectable: true,
    }
}

#[tokio::test]
async fn record_query_ignore_remove() {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open(dir.path().join("store").join("devices.db")).unwrap();
    let devices = db.device_dao();
    let recorder = SightingRecorder::new(&db);

    let mut all = devices.watch_all();
    assert!(all.next().await.unwrap().unwrap().is_empty());

    assert_eq!(
        recorder.record(&tracker(1, -70), at(8)).unwrap(),
        SightingOutcome::NewDevice
    );
    recorder.record(&tracker(2, -55), at(9)).unwrap();
    recorder.record(&tracker(1, -65), at(10)).unwrap();

    let listed = all.next().await.unwrap().unwrap();
    assert!(!listed.is_empty());
    assert_eq!(devices.all().unwrap().len(), 2);

    let first = devices.get_by_address("C0:FF:EE:00:00:01").unwrap().unwrap();
    assert_eq!(first.first_discovery, at(8));
    assert_eq!(first.last_seen, at(10));

    db.notification_dao()
        .insert(&Notification::new("C0:FF:EE:00:00:01", at(10)))
        .unwrap();

    let report = devices.device_beacons_since(at(8)).unwrap();
    assert_eq!(report.len(), 2);
    let entry = report
        .iter()
        .find(|r| r.device.address == "C0:FF:EE:00:00:01")
        .unwrap();
    assert_eq!(entry.beacons.len(), 2);
    assert_eq!(entry.notifications.len(), 1);
    assert!(entry.device.notification_sent);

    assert_eq!(devices.ignore("C0:FF:EE:00:00:02").unwrap(), 1);
    assert_eq!(devices.ignored().unwrap().len(), 1);
    assert_eq!(
        recorder.record(&tracker(2, -50), at(11)).unwrap(),
        SightingOutcome::KnownDevice { ignored: true }
    );

    let mut monitored = devices.watch_currently_monitored(at(10));
    assert_eq!(monitored.next().await.unwrap().unwrap(), 2);

    assert_eq!(devices.remove("C0:FF:EE:00:00:01").unwrap(), 1);
    assert!(db
        .beacon_dao()
        .for_device("C0:FF:EE:00:00:01")
        .unwrap()
        .is_empty());
    assert!(db
        .notification_dao()
        .for_device("C0:FF:EE:00:00:01")
        .unwrap()
        .is_empty());
    assert_eq!(monitored.next().await.unwrap().unwrap(), 1);

    assert_eq!(
        db.beacon_dao()
            .delete_older_than(at(11) + Duration::minutes(1))
            .unwrap(),
        2
    );
}
