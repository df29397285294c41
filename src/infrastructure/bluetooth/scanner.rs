//! BLE Scanner Module
//!
//! Discovers tracking devices by filtering advertisements for Find My
//! payloads.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::backend::BleAdapter;
use super::protocol;
use crate::domain::models::ScannedDevice;
use crate::error::{BleError, BleResult};

/// True when the advertisement comes from an offline-finding tracker
pub fn is_tracker(device: &ScannedDevice) -> bool {
    protocol::find_my_payload(&device.manufacturer_data).is_some()
}

pub struct BleScanner {
    adapter: Arc<dyn BleAdapter>,
    show_all_devices: bool,
    filter_task: Option<JoinHandle<()>>,
}

impl BleScanner {
    /// `show_all_devices` disables the tracker filter
    pub fn new(adapter: Arc<dyn BleAdapter>, show_all_devices: bool) -> Self {
        Self {
            adapter,
            show_all_devices,
            filter_task: None,
        }
    }

    /// Start scanning; matching advertisements arrive on the returned channel
    pub async fn start(&mut self) -> BleResult<mpsc::UnboundedReceiver<ScannedDevice>> {
        if self.is_scanning() {
            return Err(BleError::ScanInProgress);
        }

        info!(
            show_all = self.show_all_devices,
            "Starting BLE scan on {}",
            self.adapter.describe()
        );

        let (raw_tx, mut raw_rx) = mpsc::unbounded_channel();
        let (tx, rx) = mpsc::unbounded_channel();
        self.adapter.start_scan(raw_tx).await?;

        let show_all = self.show_all_devices;
        self.filter_task = Some(tokio::spawn(async move {
            while let Some(device) = raw_rx.recv().await {
                if !show_all && !is_tracker(&device) {
                    continue;
                }
                debug!(address = %device.address, rssi = device.rssi, "Tracker advertisement");
                if tx.send(device).is_err() {
                    break;
                }
            }
        }));

        Ok(rx)
    }

    pub async fn stop(&mut self) -> BleResult<()> {
        if let Some(task) = self.filter_task.take() {
            info!("Stopping BLE scan...");
            task.abort();
            self.adapter.stop_scan().await?;
        }
        Ok(())
    }

    pub fn is_scanning(&self) -> bool {
        self.filter_task.is_some()
    }

    /// Scan for `duration` and return every matching advertisement received
    pub async fn scan_for(&mut self, duration: Duration) -> BleResult<Vec<ScannedDevice>> {
        let mut rx = self.start().await?;
        let deadline = tokio::time::Instant::now() + duration;
        let mut found = Vec::new();

        while let Ok(Some(device)) = tokio::time::timeout_at(deadline, rx.recv()).await {
            found.push(device);
        }

        self.stop().await?;
        info!("Scan finished with {} advertisements", found.len());
        Ok(found)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        if let Some(task) = self.filter_task.take() {
            task.abort();
            // The adapter stays in scan mode until told otherwise
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let adapter = self.adapter.clone();
                handle.spawn(async move {
                    if let Err(e) = adapter.stop_scan().await {
                        warn!("Failed to stop scan of dropped scanner: {}", e);
                    }
                });
            }
        }
    }
}
