//! Bluetooth Module
//!
//! Provides BLE scanning for tracking devices and the GATT sound service.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                   BluetoothLeService                     │
//! │  (Owns the adapter and link, publishes GATT actions)     │
//! └─────────────────────┬───────────────────────────────────┘
//!                       │
//!         ┌─────────────┼─────────────┐
//!         │             │             │
//!         ▼             ▼             ▼
//! ┌───────────┐  ┌────────────┐  ┌──────────┐
//! │  Scanner  │  │ Connection │  │ Protocol │
//! │           │  │            │  │          │
//! │ - Tracker │  │ - Callback │  │ - UUIDs  │
//! │   filter  │  │   handling │  │ - Opcodes│
//! └─────┬─────┘  └─────┬──────┘  └──────────┘
//!       │              │
//!       ▼              ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │          Backend (WinRT / btleplug / simulated)          │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - Sound service UUIDs, opcodes, and advertisement parsing
//! - [`backend`] - Adapter and GATT link traits
//! - [`scanner`] - Tracker discovery
//! - [`connection`] - GATT callback state machine
//! - [`service`] - Main service coordinator
//! - [`simulated`] - In-process backend for tests and `--simulate`

pub mod backend;
pub mod connection;
pub mod protocol;
pub mod scanner;
pub mod service;
pub mod simulated;

#[cfg(feature = "btleplug")]
pub mod btle;
#[cfg(windows)]
pub mod winrt;

// Re-export main service for convenience
pub use service::{BluetoothLeService, SoundOutcome};
