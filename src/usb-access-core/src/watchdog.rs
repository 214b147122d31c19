//! Watchdog for records stuck waiting on a follow-up that never came.
//!
//! PLUGGED, CERTIFYING and MOUNTING are left only through a follow-up event
//! the engine queues before entering them, so such a record always has an
//! event in flight. One that sits in such a state longer than the device
//! timeout with nothing in flight lost its follow-up: the watchdog enqueues
//! PLUGOUT, which moves every attached state to UNPLUGGED and marks the
//! record, so the engine's reclamation gate frees it. A later insert for the
//! same id starts over with a fresh record.
//!
//! Steady states (DENY, MOUNT_FAILED, INSERVICE) describe present devices and
//! are never nudged. The watchdog itself never reclaims; that stays on the
//! engine thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, warn};

use crate::device::{DeviceId, UsbEvent, UsbState};
use crate::error::AccessError;
use crate::queue::EventQueue;
use crate::registry::DeviceRegistry;

/// Name of the watchdog thread.
pub const WATCHDOG_THREAD_NAME: &str = "usb-watchdog";

/// Forces stuck records back to UNPLUGGED.
#[derive(Debug)]
pub struct DeviceWatchdog {
    registry: Arc<DeviceRegistry>,
    queue: Arc<EventQueue>,
    device_timeout: Duration,
    check_interval: Duration,
}

impl DeviceWatchdog {
    /// Create a watchdog.
    pub fn new(registry: Arc<DeviceRegistry>, queue: Arc<EventQueue>, device_timeout: Duration) -> Self {
        Self {
            registry,
            queue,
            device_timeout,
            check_interval: Duration::from_secs(1),
        }
    }

    /// Override how often records are checked.
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// Records waiting on a follow-up with none in flight for longer than
    /// the device timeout.
    pub fn overdue(&self) -> Vec<DeviceId> {
        self.registry
            .snapshot()
            .into_iter()
            .filter(|device| device.in_flight() == 0)
            .filter(|device| device.state().is_ok_and(UsbState::awaits_follow_up))
            .filter(|device| device.state_since().elapsed() > self.device_timeout)
            .map(|device| device.id())
            .collect()
    }

    /// Enqueue PLUGOUT for every overdue record. Returns how many were nudged.
    pub fn check(&self) -> usize {
        let mut nudged = 0;
        for id in self.overdue() {
            let Some(device) = self.registry.find_by_id(id) else {
                continue;
            };
            warn!(
                device_id = %id,
                state = ?device.state(),
                marked = device.is_marked_for_free(),
                timeout_secs = self.device_timeout.as_secs(),
                "Watchdog: device stuck without a pending event, forcing PLUGOUT"
            );
            self.queue.push(&device, UsbEvent::Plugout);
            nudged += 1;
        }
        nudged
    }

    /// Check periodically until `shutdown` is set.
    pub fn run(&self, shutdown: &AtomicBool) {
        debug!(
            interval_ms = self.check_interval.as_millis() as u64,
            "Watchdog: started"
        );
        while !shutdown.load(Ordering::Acquire) {
            thread::sleep(self.check_interval);
            if shutdown.load(Ordering::Acquire) {
                break;
            }
            self.check();
        }
        debug!("Watchdog: stopped");
    }

    /// Run on a dedicated thread.
    pub fn spawn(self: Arc<Self>, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>, AccessError> {
        thread::Builder::new()
            .name(WATCHDOG_THREAD_NAME.into())
            .spawn(move || self.run(&shutdown))
            .map_err(|source| AccessError::ThreadSpawn {
                name: WATCHDOG_THREAD_NAME,
                source,
            })
    }
}
