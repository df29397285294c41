//! Device store
//!
//! SQLite persistence for sighted devices, their beacons and the
//! notifications raised for them. Each table has a DAO; list and count
//! queries are also available as streams that re-run after every write
//! to the table they read.

mod beacon_dao;
mod connection;
mod device_dao;
mod notification_dao;
mod schema;

pub use beacon_dao::BeaconDao;
pub use connection::{Database, Table};
pub use device_dao::DeviceDao;
pub use notification_dao::NotificationDao;

pub(crate) use beacon_dao::insert_beacon;
pub(crate) use device_dao::{device_by_address, insert_device, update_device};
