//! Background hot-plug polling.
//!
//! The monitor re-enumerates devices on a fixed interval, publishes the
//! latest list with a generation number that changes whenever the list does,
//! and tells the [`Coordinator`] when the device an operation is writing to
//! has gone away.

use crate::device::BlockDevice;
use crate::operation::Coordinator;
use crate::platform::DeviceEnumerator;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const SLEEP_SLICE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    /// Bumped each time the device list changes.
    pub generation: u64,
    pub devices: Vec<BlockDevice>,
}

pub struct DeviceMonitor {
    stop: Arc<AtomicBool>,
    snapshot: Arc<Mutex<DeviceSnapshot>>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceMonitor {
    pub fn spawn(
        enumerator: Arc<dyn DeviceEnumerator>,
        coordinator: Arc<Coordinator>,
        interval: Duration,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let snapshot = Arc::new(Mutex::new(DeviceSnapshot::default()));

        let handle = {
            let stop = Arc::clone(&stop);
            let snapshot = Arc::clone(&snapshot);
            thread::Builder::new()
                .name("device-monitor".to_string())
                .spawn(move || {
                    debug!("Device monitor started ({:?} interval)", interval);
                    while !stop.load(Ordering::SeqCst) {
                        poll_once(enumerator.as_ref(), &coordinator, &snapshot);
                        sleep_unless_stopped(&stop, interval);
                    }
                    debug!("Device monitor stopped");
                })
        };

        let handle = match handle {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!("Failed to start the device monitor: {}", e);
                None
            }
        };

        Self {
            stop,
            snapshot,
            handle,
        }
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.snapshot
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("Device monitor thread panicked");
            }
        }
    }
}

impl Drop for DeviceMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sleep_unless_stopped(stop: &AtomicBool, interval: Duration) {
    let deadline = Instant::now() + interval;
    while !stop.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep(SLEEP_SLICE.min(deadline - now));
    }
}

/// One monitor tick. Enumeration errors skip the tick.
pub fn poll_once(
    enumerator: &dyn DeviceEnumerator,
    coordinator: &Coordinator,
    snapshot: &Mutex<DeviceSnapshot>,
) {
    let devices = match enumerator.list_devices() {
        Ok(devices) => devices,
        Err(e) => {
            warn!("Device enumeration failed: {}", e);
            return;
        }
    };

    if let Some(target) = coordinator.active_target() {
        if !devices.iter().any(|d| d.path == target) {
            coordinator.device_disconnected(&target);
        }
    }

    if let Ok(mut current) = snapshot.lock() {
        if current.devices != devices {
            current.generation += 1;
            info!(
                "Device list changed ({} devices, generation {})",
                devices.len(),
                current.generation
            );
            current.devices = devices;
        }
    }
}
