//! Device registry with two-phase deletion.
//!
//! Records are shared as `Arc<UsbDevice>`. Removal is split in two:
//!
//! 1. **Mark**: the plug-out action sets the soft-delete flag.
//! 2. **Reclaim**: the engine's post-transition check unlinks the record once
//!    it is marked, back in UNPLUGGED, and no queued event references it.
//!
//! Unlinking happens under the write lock, so a concurrent `find_by_id` sees
//! either the live record or nothing.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::device::{DeviceId, UsbDevice};
use crate::error::AccessError;

/// Thread-safe collection of live device records keyed by id.
#[derive(Debug, Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<DeviceId, Arc<UsbDevice>>>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take ownership of a new record and return the shared handle.
    pub fn add(&self, device: UsbDevice) -> Result<Arc<UsbDevice>, AccessError> {
        let id = device.id();
        let device = Arc::new(device);
        {
            let mut map = self.devices.write();
            if map.contains_key(&id) {
                return Err(AccessError::DuplicateDevice { id });
            }
            map.insert(id, Arc::clone(&device));
        }
        info!(device_id = %id, "Registry: added device");
        Ok(device)
    }

    /// Look up a live record.
    pub fn find_by_id(&self, id: DeviceId) -> Option<Arc<UsbDevice>> {
        self.devices.read().get(&id).cloned()
    }

    /// Set the soft-delete flag on a record. Idempotent.
    pub fn mark_for_removal(&self, device: &UsbDevice) {
        // Hold the lock so marking is ordered against reclaim and cleanup.
        let _guard = self.devices.write();
        if device.mark_for_free() {
            info!(device_id = %device.id(), "Registry: marked device for removal");
        } else {
            debug!(device_id = %device.id(), "Registry: device already marked");
        }
    }

    /// Unlink the record if the reclamation gate holds.
    ///
    /// Returns `true` when the record was removed. Only the entry that is the
    /// same allocation as `device` is removed, so a newer record that reused
    /// the id is never touched.
    pub fn reclaim_if_eligible(&self, device: &Arc<UsbDevice>) -> bool {
        let mut map = self.devices.write();
        if !device.is_reclaimable() {
            return false;
        }
        let id = device.id();
        match map.get(&id) {
            Some(current) if Arc::ptr_eq(current, device) => {
                map.remove(&id);
                drop(map);
                info!(device_id = %id, "Registry: reclaimed device");
                true
            },
            _ => false,
        }
    }

    /// Remove every remaining record. Shutdown-only safety net.
    ///
    /// Returns the number of records removed. Each one is logged as a
    /// warning because the normal gate should have reclaimed it.
    pub fn force_cleanup_all(&self) -> usize {
        let drained: Vec<Arc<UsbDevice>> = {
            let mut map = self.devices.write();
            map.drain().map(|(_, device)| device).collect()
        };
        for device in &drained {
            warn!(
                device_id = %device.id(),
                state = ?device.state(),
                marked = device.is_marked_for_free(),
                in_flight = device.in_flight(),
                "Registry: force-reclaiming device left behind at shutdown"
            );
        }
        drained.len()
    }

    /// Whether no records are live.
    pub fn is_empty(&self) -> bool {
        self.devices.read().is_empty()
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    /// Handles to every live record, in id order.
    pub fn snapshot(&self) -> Vec<Arc<UsbDevice>> {
        let mut devices: Vec<_> = self.devices.read().values().cloned().collect();
        devices.sort_by_key(|d| d.id());
        devices
    }
}
