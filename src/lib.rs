//! Tracker detection: a local store of sighted Bluetooth LE devices and a
//! GATT client that makes a tag play its sound.

pub mod app;
pub mod cli;
pub mod domain;
pub mod error;
pub mod infrastructure;
