//! Device records, FSM states and FSM events.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::validation::{
    validate_device_id, ValidationError, MAX_KEY_LEN, MAX_PROPERTIES, MAX_RULE_LEN, MAX_VALUE_LEN,
};

/// Registry key of a device, as assigned by the presence notifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(u32);

impl DeviceId {
    /// Create a device id, rejecting zero and out-of-range values.
    pub fn new(raw: u32) -> Result<Self, ValidationError> {
        validate_device_id(raw)?;
        Ok(Self(raw))
    }

    /// Raw numeric id.
    pub fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// FSM states. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum UsbState {
    /// Not attached, or detached and waiting for reclamation. Initial state.
    Unplugged = 0,
    /// Attached, not yet classified.
    Plugged = 1,
    /// Access denied.
    Deny = 2,
    /// Certificate challenge in progress.
    Certifying = 3,
    /// Access granted, waiting for the mount result.
    Mounting = 4,
    /// Authorization or mount failed.
    MountFailed = 5,
    /// Device in use.
    InService = 6,
}

impl UsbState {
    /// Number of states.
    pub const COUNT: usize = 7;

    /// All states in discriminant order.
    pub const ALL: [UsbState; Self::COUNT] = [
        Self::Unplugged,
        Self::Plugged,
        Self::Deny,
        Self::Certifying,
        Self::Mounting,
        Self::MountFailed,
        Self::InService,
    ];

    /// Table index of this state.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Unplugged => "UNPLUGGED",
            Self::Plugged => "PLUGGED",
            Self::Deny => "DENY",
            Self::Certifying => "CERTIFYING",
            Self::Mounting => "MOUNTING",
            Self::MountFailed => "MOUNT_FAILED",
            Self::InService => "INSERVICE",
        }
    }

    /// Whether the engine leaves this state on its own through a queued
    /// follow-up event.
    pub fn awaits_follow_up(self) -> bool {
        matches!(self, Self::Plugged | Self::Certifying | Self::Mounting)
    }
}

impl TryFrom<u8> for UsbState {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(raw)).copied().ok_or(raw)
    }
}

impl fmt::Display for UsbState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// FSM events. The set is closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum UsbEvent {
    /// Device inserted.
    Plugin = 0,
    /// Device removed.
    Plugout = 1,
    /// Generic allow.
    AllowAccess = 2,
    /// Deny access at the OS level.
    DenyAccess = 3,
    /// Non-storage device, no certification needed.
    AllowAccessNonStorage = 4,
    /// Storage device, certification required.
    AllowAccessStorage = 5,
    /// Certificate challenge failed.
    CertificateNotVerified = 6,
    /// Certificate challenge passed.
    CertificateVerified = 7,
    /// Authorization or mount failed.
    MountFailed = 8,
    /// Device authorized and usable.
    MountSuccess = 9,
    /// Stop the FSM consumer. Carries no device.
    Exit = 10,
}

impl UsbEvent {
    /// Number of events.
    pub const COUNT: usize = 11;

    /// All events in discriminant order.
    pub const ALL: [UsbEvent; Self::COUNT] = [
        Self::Plugin,
        Self::Plugout,
        Self::AllowAccess,
        Self::DenyAccess,
        Self::AllowAccessNonStorage,
        Self::AllowAccessStorage,
        Self::CertificateNotVerified,
        Self::CertificateVerified,
        Self::MountFailed,
        Self::MountSuccess,
        Self::Exit,
    ];

    /// Table index of this event.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Canonical upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Plugin => "PLUGIN",
            Self::Plugout => "PLUGOUT",
            Self::AllowAccess => "ALLOW_ACCESS",
            Self::DenyAccess => "DENY_ACCESS",
            Self::AllowAccessNonStorage => "ALLOW_ACCESS_NONSTR",
            Self::AllowAccessStorage => "ALLOW_ACCESS_STR",
            Self::CertificateNotVerified => "CERTIFICATE_NOT_VERIFIED",
            Self::CertificateVerified => "CERTIFICATE_VERIFIED",
            Self::MountFailed => "MOUNT_FAILED",
            Self::MountSuccess => "MOUNT_SUCCESS",
            Self::Exit => "EXIT",
        }
    }
}

impl TryFrom<u8> for UsbEvent {
    type Error = u8;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        Self::ALL.get(usize::from(raw)).copied().ok_or(raw)
    }
}

impl fmt::Display for UsbEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Vendor/product identity parsed from the `id` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UsbId {
    /// USB vendor id.
    pub vendor: u16,
    /// USB product id.
    pub product: u16,
}

impl UsbId {
    /// Vendor id as four lower-case hex digits, the sysfs `idVendor` format.
    pub fn vendor_hex(&self) -> String {
        format!("{:04x}", self.vendor)
    }

    /// Product id as four lower-case hex digits, the sysfs `idProduct` format.
    pub fn product_hex(&self) -> String {
        format!("{:04x}", self.product)
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}:{:04x}", self.vendor, self.product)
    }
}

/// Ordered, bounded key/value description of a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceProperties(Vec<(String, String)>);

impl DeviceProperties {
    /// Collect properties, keeping at most [`MAX_PROPERTIES`] pairs and
    /// truncating over-long keys and values.
    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for (key, value) in pairs {
            if kept.len() >= MAX_PROPERTIES {
                dropped += 1;
                continue;
            }
            kept.push((
                truncate_to(key.into(), MAX_KEY_LEN),
                truncate_to(value.into(), MAX_VALUE_LEN),
            ));
        }
        if dropped > 0 {
            warn!(
                dropped = dropped,
                max = MAX_PROPERTIES,
                "Device advertised too many properties, extra entries dropped"
            );
        }
        Self(kept)
    }

    /// Look up the first value for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Iterate over the pairs in advertised order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Number of pairs.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no properties were advertised.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn truncate_to(mut value: String, max: usize) -> String {
    if value.len() > max {
        let mut cut = max;
        while !value.is_char_boundary(cut) {
            cut -= 1;
        }
        value.truncate(cut);
    }
    value
}

/// Raw fields copied verbatim from the presence notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationFields {
    /// Notifier event code.
    pub event_code: u32,
    /// Notifier target code.
    pub target_code: u32,
    /// Notifier rule text.
    pub rule: String,
}

/// One physical USB device known to the system.
///
/// Shared as `Arc<UsbDevice>` between the registry and queued events. The
/// state has a single writer, the FSM engine thread, which also stamps when
/// the state last changed.
#[derive(Debug)]
pub struct UsbDevice {
    id: DeviceId,
    notification: NotificationFields,
    properties: DeviceProperties,
    state: AtomicU8,
    state_since: Mutex<Instant>,
    marked_for_free: AtomicBool,
    in_flight: AtomicUsize,
}

impl UsbDevice {
    /// Create a record in the UNPLUGGED state.
    pub fn new(id: DeviceId, properties: DeviceProperties) -> Self {
        Self::with_notification(id, NotificationFields::default(), properties)
    }

    /// Create a record carrying the notifier's raw fields.
    pub fn with_notification(
        id: DeviceId,
        mut notification: NotificationFields,
        properties: DeviceProperties,
    ) -> Self {
        notification.rule = truncate_to(notification.rule, MAX_RULE_LEN);
        Self {
            id,
            notification,
            properties,
            state: AtomicU8::new(UsbState::Unplugged as u8),
            state_since: Mutex::new(Instant::now()),
            marked_for_free: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Device id.
    pub fn id(&self) -> DeviceId {
        self.id
    }

    /// Raw notifier fields.
    pub fn notification(&self) -> &NotificationFields {
        &self.notification
    }

    /// Advertised properties.
    pub fn properties(&self) -> &DeviceProperties {
        &self.properties
    }

    /// Current state, or the raw value if it is outside the state set.
    pub fn state(&self) -> Result<UsbState, u8> {
        UsbState::try_from(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_state(&self, state: UsbState) {
        let previous = self.state.swap(state as u8, Ordering::AcqRel);
        if previous != state as u8 {
            *self.state_since.lock() = Instant::now();
        }
    }

    /// When the record entered its current state.
    pub fn state_since(&self) -> Instant {
        *self.state_since.lock()
    }

    #[cfg(test)]
    pub(crate) fn store_raw_state(&self, raw: u8) {
        self.state.store(raw, Ordering::Release);
    }

    /// Set the soft-delete flag. Returns `true` only for the first call.
    pub fn mark_for_free(&self) -> bool {
        !self.marked_for_free.swap(true, Ordering::AcqRel)
    }

    /// Whether the record has been marked for removal.
    pub fn is_marked_for_free(&self) -> bool {
        self.marked_for_free.load(Ordering::Acquire)
    }

    /// Number of queued events still referencing this record.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn acquire_event(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn release_event(&self) {
        // Saturating: a release without acquire must not wrap.
        let _ = self
            .in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Whether the reclamation gate holds: marked, UNPLUGGED, nothing in flight.
    pub fn is_reclaimable(&self) -> bool {
        self.is_marked_for_free()
            && self.state() == Ok(UsbState::Unplugged)
            && self.in_flight() == 0
    }
}
