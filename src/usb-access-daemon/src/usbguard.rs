//! USBGuard D-Bus adapter.
//!
//! Two directions:
//! - [`UsbGuardPolicy`] calls `applyDevicePolicy` on `org.usbguard.Devices1`
//! - [`UsbGuardListener`] receives `DevicePresenceChanged` signals and hands
//!   them to the [`PresenceHandler`]
//!
//! Both use the blocking zbus API; they run on the FSM and listener threads,
//! never on the async runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};
use usb_access_core::{
    DeviceId, DeviceProperties, NotificationFields, PolicyEnforcer, PolicyError, PolicyTarget,
    PresenceHandler, PresenceKind, PresenceNotification, PresenceOutcome,
};
use zbus::blocking::{Connection, MessageIterator};

/// Well-known bus name of the USBGuard daemon.
pub const USBGUARD_BUS_NAME: &str = "org.usbguard1";
/// Object path of the devices interface.
pub const DEVICES_PATH: &str = "/org/usbguard1/Devices";
/// Devices interface name.
pub const DEVICES_INTERFACE: &str = "org.usbguard.Devices1";
/// Presence signal member.
pub const PRESENCE_SIGNAL: &str = "DevicePresenceChanged";
/// Policy method member.
pub const APPLY_POLICY_METHOD: &str = "applyDevicePolicy";

/// Body of `DevicePresenceChanged`: id, event, target, rule, attributes.
pub type PresenceBody = (u32, u32, u32, String, HashMap<String, String>);

/// Convert a signal body into a notification.
///
/// Returns `None` for event codes the handler has no use for. Attributes are
/// sorted by key so the stored properties do not depend on hash order.
pub fn decode_presence(body: PresenceBody) -> Option<PresenceNotification> {
    let (device_id, event_code, target_code, rule, attributes) = body;
    let kind = PresenceKind::from_code(event_code)?;

    let mut pairs: Vec<(String, String)> = attributes.into_iter().collect();
    pairs.sort();

    Some(PresenceNotification {
        device_id,
        kind,
        fields: NotificationFields {
            event_code,
            target_code,
            rule,
        },
        properties: DeviceProperties::from_pairs(pairs),
    })
}

fn policy_error(err: zbus::Error) -> PolicyError {
    match err {
        zbus::Error::MethodError(name, detail, _) => PolicyError::Rejected {
            message: match detail {
                Some(detail) => format!("{name}: {detail}"),
                None => name.to_string(),
            },
        },
        zbus::Error::Variant(e) => PolicyError::MalformedReply {
            message: e.to_string(),
        },
        other => PolicyError::Unreachable {
            message: other.to_string(),
        },
    }
}

/// [`PolicyEnforcer`] that forwards decisions to USBGuard.
///
/// The system bus connection is opened lazily and dropped after a transport
/// failure so the next attempt reconnects.
#[derive(Default)]
pub struct UsbGuardPolicy {
    connection: Mutex<Option<Connection>>,
}

impl std::fmt::Debug for UsbGuardPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbGuardPolicy")
            .field("connected", &self.connection.lock().is_some())
            .finish()
    }
}

impl UsbGuardPolicy {
    /// Create an enforcer; no connection is made until the first call.
    pub fn new() -> Self {
        Self::default()
    }

    fn connection(&self) -> Result<Connection, PolicyError> {
        let mut slot = self.connection.lock();
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = Connection::system().map_err(|e| PolicyError::Unreachable {
            message: format!("failed to connect to system bus: {e}"),
        })?;
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

impl PolicyEnforcer for UsbGuardPolicy {
    fn apply_policy(
        &self,
        device: DeviceId,
        target: PolicyTarget,
        permanent: bool,
    ) -> Result<Option<u32>, PolicyError> {
        let conn = self.connection()?;
        let reply = conn
            .call_method(
                Some(USBGUARD_BUS_NAME),
                DEVICES_PATH,
                Some(DEVICES_INTERFACE),
                APPLY_POLICY_METHOD,
                &(device.get(), target.code(), permanent),
            )
            .map_err(policy_error);

        let reply = match reply {
            Ok(reply) => reply,
            Err(e) => {
                if e.is_transient() {
                    self.connection.lock().take();
                }
                return Err(e);
            },
        };

        let rule_id: u32 = reply.body().deserialize().map_err(|e| PolicyError::MalformedReply {
            message: e.to_string(),
        })?;
        debug!(device_id = %device, target = ?target, rule_id, "USBGuard: policy applied");
        Ok(permanent.then_some(rule_id))
    }
}

/// Subscription to USBGuard presence signals.
pub struct UsbGuardListener {
    messages: MessageIterator,
}

impl std::fmt::Debug for UsbGuardListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsbGuardListener").finish_non_exhaustive()
    }
}

impl UsbGuardListener {
    /// Connect to the system bus and subscribe to presence changes.
    pub fn connect() -> anyhow::Result<Self> {
        let conn = Connection::system().context("failed to connect to system bus")?;
        let rule = zbus::MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .interface(DEVICES_INTERFACE)
            .context("invalid interface name")?
            .member(PRESENCE_SIGNAL)
            .context("invalid signal name")?
            .build();
        let messages = MessageIterator::for_match_rule(rule, &conn, None)
            .context("failed to subscribe to USBGuard presence signals")?;
        info!(interface = DEVICES_INTERFACE, signal = PRESENCE_SIGNAL, "USBGuard: listening");
        Ok(Self { messages })
    }

    /// Feed signals to `handler` until the stream ends or `shutdown` is set.
    ///
    /// Blocks between signals; a set `shutdown` flag is noticed on the next
    /// message.
    pub fn run(self, handler: &PresenceHandler, shutdown: &AtomicBool) -> anyhow::Result<()> {
        for message in self.messages {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let message = message.context("USBGuard signal stream failed")?;
            let body: PresenceBody = match message.body().deserialize() {
                Ok(body) => body,
                Err(e) => {
                    warn!(error = %e, "USBGuard: malformed presence signal");
                    continue;
                },
            };
            let (id, event_code) = (body.0, body.1);
            let Some(notification) = decode_presence(body) else {
                debug!(device_id = id, event_code, "USBGuard: presence event ignored");
                continue;
            };
            match handler.handle(notification) {
                PresenceOutcome::Ignored => trace!(device_id = id, "USBGuard: signal dropped"),
                outcome => trace!(?outcome, "USBGuard: signal handled"),
            }
        }
        debug!("USBGuard: listener stopped");
        Ok(())
    }
}
