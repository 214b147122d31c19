//! Translation of presence notifications into queue entries.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::device::{DeviceId, DeviceProperties, NotificationFields, UsbDevice, UsbEvent};
use crate::error::AccessError;
use crate::queue::EventQueue;
use crate::registry::DeviceRegistry;

/// Kind of presence change reported by the notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceKind {
    /// Already attached when the listener connected.
    Present,
    /// Newly attached.
    Insert,
    /// Detached.
    Remove,
}

impl PresenceKind {
    /// Map a USBGuard presence event code.
    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Present),
            1 => Some(Self::Insert),
            3 => Some(Self::Remove),
            _ => None,
        }
    }
}

/// One presence notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceNotification {
    /// Raw device id from the notifier.
    pub device_id: u32,
    /// Kind of change.
    pub kind: PresenceKind,
    /// Raw notifier fields.
    pub fields: NotificationFields,
    /// Advertised properties.
    pub properties: DeviceProperties,
}

/// What the handler did with a notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PresenceOutcome {
    /// A record was created and PLUGIN enqueued.
    Registered(DeviceId),
    /// PLUGOUT was enqueued for an existing record.
    Removed(DeviceId),
    /// The notification was logged and dropped.
    Ignored,
}

/// Feeds presence notifications into the registry and queue.
#[derive(Debug, Clone)]
pub struct PresenceHandler {
    registry: Arc<DeviceRegistry>,
    queue: Arc<EventQueue>,
}

impl PresenceHandler {
    /// Create a handler.
    pub fn new(registry: Arc<DeviceRegistry>, queue: Arc<EventQueue>) -> Self {
        Self { registry, queue }
    }

    /// Handle one notification. May block while the queue is full.
    pub fn handle(&self, notification: PresenceNotification) -> PresenceOutcome {
        let id = match DeviceId::new(notification.device_id) {
            Ok(id) => id,
            Err(reason) => {
                let err = AccessError::InvalidDeviceId {
                    id: notification.device_id,
                    reason,
                };
                warn!(error = %err, "Presence: ignoring notification");
                return PresenceOutcome::Ignored;
            },
        };

        match notification.kind {
            PresenceKind::Insert | PresenceKind::Present => {
                self.insert(id, notification.fields, notification.properties)
            },
            PresenceKind::Remove => self.remove(id),
        }
    }

    fn insert(
        &self,
        id: DeviceId,
        fields: NotificationFields,
        properties: DeviceProperties,
    ) -> PresenceOutcome {
        let record = UsbDevice::with_notification(id, fields, properties);
        match self.registry.add(record) {
            Ok(device) => {
                info!(device_id = %id, "Presence: device attached");
                self.queue.push(&device, UsbEvent::Plugin);
                PresenceOutcome::Registered(id)
            },
            Err(e) => {
                warn!(device_id = %id, error = %e, "Presence: insert for live device ignored");
                PresenceOutcome::Ignored
            },
        }
    }

    fn remove(&self, id: DeviceId) -> PresenceOutcome {
        match self.registry.find_by_id(id) {
            Some(device) => {
                info!(device_id = %id, "Presence: device detached");
                self.queue.push(&device, UsbEvent::Plugout);
                PresenceOutcome::Removed(id)
            },
            None => {
                debug!(device_id = %id, "Presence: remove for unknown device ignored");
                PresenceOutcome::Ignored
            },
        }
    }
}
