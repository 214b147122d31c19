//! The FSM engine: single consumer of the event queue.
//!
//! Per dequeued entry:
//! 1. Reject records whose stored state is outside the state set.
//! 2. Look up the (state, event) cell and run its action, if any.
//! 3. Apply the cell's target state.
//! 4. Release the entry's in-flight reference and run the reclamation gate.
//!
//! Only this thread writes device state and only this thread reclaims
//! records, so at most one transition per device is ever in progress.
//!
//! ## Security Properties
//!
//! - Fail-closed: certification failures always lead to DENY
//! - No bad entry stops the loop; it is logged and dropped

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::certificate::CertificateWorkflow;
use crate::collaborators::{DeviceClassifier, PolicyEnforcer, PolicyTarget};
use crate::config::AccessConfig;
use crate::device::{UsbDevice, UsbEvent, UsbState};
use crate::error::{AccessError, PolicyError};
use crate::fsm::{Action, TransitionTable};
use crate::queue::{EventQueue, QueueEntry};
use crate::registry::DeviceRegistry;

/// Name of the engine thread.
pub const ENGINE_THREAD_NAME: &str = "usb-fsm";

/// Delay between policy enforcement attempts.
pub const POLICY_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Services the actions call out to.
#[derive(Clone)]
pub struct Collaborators {
    /// Storage classifier for the PLUGIN action.
    pub classifier: Arc<dyn DeviceClassifier>,
    /// OS-level allow/block.
    pub enforcer: Arc<dyn PolicyEnforcer>,
    /// Certificate challenge.
    pub workflow: CertificateWorkflow,
}

/// Retry bounds for policy enforcement.
#[derive(Debug, Clone, Copy)]
pub struct PolicyRetry {
    /// Attempts per call, at least one.
    pub attempts: u32,
    /// Delay between attempts.
    pub delay: Duration,
}

impl From<&AccessConfig> for PolicyRetry {
    fn from(config: &AccessConfig) -> Self {
        Self {
            attempts: config.policy_retry_count,
            delay: POLICY_RETRY_DELAY,
        }
    }
}

impl Default for PolicyRetry {
    fn default() -> Self {
        Self::from(&AccessConfig::default())
    }
}

/// Result of dispatching one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// A defined cell was applied.
    Applied {
        /// State before dispatch.
        from: UsbState,
        /// State after dispatch.
        to: UsbState,
        /// Action that ran.
        action: Option<Action>,
    },
    /// The event does not apply in the current state.
    NoOp {
        /// Unchanged state.
        state: UsbState,
    },
    /// The entry was dropped as a logic error.
    Dropped,
    /// The shutdown sentinel was seen.
    Exit,
}

/// Counters reported when the loop stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Entries that changed state or ran an action.
    pub applied: u64,
    /// Entries that did not apply.
    pub noops: u64,
    /// Entries dropped as logic errors.
    pub dropped: u64,
    /// Records reclaimed by the gate.
    pub reclaimed: u64,
}

/// Drives every device through the transition table.
pub struct FsmEngine {
    table: TransitionTable,
    registry: Arc<DeviceRegistry>,
    queue: Arc<EventQueue>,
    collaborators: Collaborators,
    policy_retry: PolicyRetry,
}

impl std::fmt::Debug for FsmEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsmEngine")
            .field("policy_retry", &self.policy_retry)
            .finish_non_exhaustive()
    }
}

impl FsmEngine {
    /// Create an engine with the standard transition table.
    pub fn new(
        registry: Arc<DeviceRegistry>,
        queue: Arc<EventQueue>,
        collaborators: Collaborators,
        policy_retry: PolicyRetry,
    ) -> Self {
        Self::with_table(
            TransitionTable::standard(),
            registry,
            queue,
            collaborators,
            policy_retry,
        )
    }

    /// Create an engine with a custom table.
    pub fn with_table(
        table: TransitionTable,
        registry: Arc<DeviceRegistry>,
        queue: Arc<EventQueue>,
        collaborators: Collaborators,
        policy_retry: PolicyRetry,
    ) -> Self {
        Self {
            table,
            registry,
            queue,
            collaborators,
            policy_retry,
        }
    }

    /// The transition table in use.
    pub fn table(&self) -> &TransitionTable {
        &self.table
    }

    /// Run the consumer loop on a dedicated thread.
    pub fn spawn(self: Arc<Self>) -> Result<JoinHandle<EngineStats>, AccessError> {
        thread::Builder::new()
            .name(ENGINE_THREAD_NAME.into())
            .spawn(move || self.run())
            .map_err(|source| AccessError::ThreadSpawn {
                name: ENGINE_THREAD_NAME,
                source,
            })
    }

    /// Dequeue and dispatch until EXIT is seen.
    pub fn run(&self) -> EngineStats {
        info!("FsmEngine: consumer loop started");
        let mut stats = EngineStats::default();
        loop {
            let entry = self.queue.dequeue();
            match self.dispatch_counted(entry, &mut stats) {
                DispatchOutcome::Exit => break,
                DispatchOutcome::Applied { .. } => stats.applied += 1,
                DispatchOutcome::NoOp { .. } => stats.noops += 1,
                DispatchOutcome::Dropped => stats.dropped += 1,
            }
        }
        info!(
            applied = stats.applied,
            noops = stats.noops,
            dropped = stats.dropped,
            reclaimed = stats.reclaimed,
            "FsmEngine: EXIT received, consumer loop stopped"
        );
        stats
    }

    /// Dispatch one entry.
    pub fn dispatch(&self, entry: QueueEntry) -> DispatchOutcome {
        let mut stats = EngineStats::default();
        self.dispatch_counted(entry, &mut stats)
    }

    fn dispatch_counted(&self, entry: QueueEntry, stats: &mut EngineStats) -> DispatchOutcome {
        let (device, event) = entry.into_parts();
        let Some(device) = device else {
            if event != UsbEvent::Exit {
                error!(event = %event, "FsmEngine: entry without device dropped");
                return DispatchOutcome::Dropped;
            }
            return DispatchOutcome::Exit;
        };

        let outcome = if event == UsbEvent::Exit {
            DispatchOutcome::Exit
        } else {
            self.apply(&device, event)
        };

        device.release_event();
        if self.registry.reclaim_if_eligible(&device) {
            stats.reclaimed += 1;
        }
        outcome
    }

    fn apply(&self, device: &Arc<UsbDevice>, event: UsbEvent) -> DispatchOutcome {
        let from = match device.state() {
            Ok(state) => state,
            Err(raw) => {
                error!(
                    device_id = %device.id(),
                    raw_state = raw,
                    event = %event,
                    "FsmEngine: state outside the state set, entry dropped"
                );
                return DispatchOutcome::Dropped;
            },
        };

        let cell = self.table.lookup(from, event);
        if cell.is_noop_for(from) {
            debug!(
                device_id = %device.id(),
                state = %from,
                event = %event,
                "FsmEngine: event not applicable in this state"
            );
            return DispatchOutcome::NoOp { state: from };
        }

        if let Some(action) = cell.action {
            self.execute(action, device);
        }
        device.set_state(cell.next);

        info!(
            device_id = %device.id(),
            from = %from,
            event = %event,
            to = %cell.next,
            "FsmEngine: transition"
        );
        DispatchOutcome::Applied {
            from,
            to: cell.next,
            action: cell.action,
        }
    }

    fn execute(&self, action: Action, device: &Arc<UsbDevice>) {
        let id = device.id();
        match action {
            Action::Classify => {
                let follow_up = if self.collaborators.classifier.is_storage(device.properties()) {
                    UsbEvent::AllowAccessStorage
                } else {
                    UsbEvent::AllowAccessNonStorage
                };
                let notification = device.notification();
                debug!(
                    device_id = %id,
                    follow_up = %follow_up,
                    target_code = notification.target_code,
                    rule = %notification.rule,
                    "FsmEngine: classified device"
                );
                self.queue.push_follow_up(device, follow_up);
            },
            Action::MarkForRemoval => self.registry.mark_for_removal(device),
            Action::DenyAccess => {
                if let Err(e) = self.enforce(device, PolicyTarget::Block) {
                    error!(
                        device_id = %id,
                        error = %e,
                        "FsmEngine: ESCALATION - could not block device at the OS level"
                    );
                }
            },
            Action::Certify => {
                let result = self.collaborators.workflow.run(device);
                self.queue.push_follow_up(device, result);
            },
            Action::GrantNonStorage => {
                info!(device_id = %id, "FsmEngine: non-storage device, authorizing without certification");
                let follow_up = self.authorize(device);
                self.queue.push_follow_up(device, follow_up);
            },
            Action::LogNotVerified => {
                warn!(device_id = %id, "FsmEngine: access denied, certificate not verified");
            },
            Action::AuthorizeVerified => {
                info!(device_id = %id, "FsmEngine: certificate verified, authorizing device");
                let follow_up = self.authorize(device);
                self.queue.push_follow_up(device, follow_up);
            },
            Action::LogMountFailed => warn!(device_id = %id, "FsmEngine: mount failed"),
            Action::LogMountSuccess => info!(device_id = %id, "FsmEngine: device in service"),
            Action::LogRecovered => {
                info!(device_id = %id, "FsmEngine: device recovered from failed mount");
            },
        }
    }

    /// Allow the device; the mount event that reports the outcome.
    fn authorize(&self, device: &UsbDevice) -> UsbEvent {
        match self.enforce(device, PolicyTarget::Allow) {
            Ok(_) => UsbEvent::MountSuccess,
            Err(e) => {
                warn!(device_id = %device.id(), error = %e, "FsmEngine: authorization failed");
                UsbEvent::MountFailed
            },
        }
    }

    fn enforce(&self, device: &UsbDevice, target: PolicyTarget) -> Result<Option<u32>, PolicyError> {
        let attempts = self.policy_retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self
                .collaborators
                .enforcer
                .apply_policy(device.id(), target, false)
            {
                Ok(rule) => {
                    info!(device_id = %device.id(), target = ?target, attempt, "FsmEngine: policy applied");
                    return Ok(rule);
                },
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!(
                        device_id = %device.id(),
                        target = ?target,
                        attempt,
                        max = attempts,
                        error = %e,
                        "FsmEngine: policy call failed, retrying"
                    );
                    thread::sleep(self.policy_retry.delay);
                    attempt += 1;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
