//! Transition table of the per-device state machine.
//!
//! The table is plain data: one cell per (state, event) pair holding the
//! target state and an optional [`Action`]. Cells that are not listed below
//! keep the current state and run nothing.
//!
//! | From         | Event                    | To           | Action              |
//! |--------------|--------------------------|--------------|---------------------|
//! | UNPLUGGED    | PLUGIN                   | PLUGGED      | `Classify`          |
//! | PLUGGED      | PLUGOUT                  | UNPLUGGED    | `MarkForRemoval`    |
//! | PLUGGED      | DENY_ACCESS              | DENY         | `DenyAccess`        |
//! | PLUGGED      | ALLOW_ACCESS_STR         | CERTIFYING   | `Certify`           |
//! | PLUGGED      | ALLOW_ACCESS_NONSTR      | MOUNTING     | `GrantNonStorage`   |
//! | DENY         | PLUGOUT                  | UNPLUGGED    | `MarkForRemoval`    |
//! | CERTIFYING   | PLUGOUT                  | UNPLUGGED    | `MarkForRemoval`    |
//! | CERTIFYING   | CERTIFICATE_NOT_VERIFIED | DENY         | `LogNotVerified`    |
//! | CERTIFYING   | CERTIFICATE_VERIFIED     | MOUNTING     | `AuthorizeVerified` |
//! | MOUNTING     | PLUGOUT                  | UNPLUGGED    | `MarkForRemoval`    |
//! | MOUNTING     | MOUNT_FAILED             | MOUNT_FAILED | `LogMountFailed`    |
//! | MOUNTING     | MOUNT_SUCCESS            | INSERVICE    | `LogMountSuccess`   |
//! | MOUNT_FAILED | PLUGOUT                  | UNPLUGGED    | `MarkForRemoval`    |
//! | MOUNT_FAILED | MOUNT_SUCCESS            | INSERVICE    | `LogRecovered`      |
//! | INSERVICE    | PLUGOUT                  | UNPLUGGED    | `MarkForRemoval`    |

use std::fmt;

use serde::Serialize;

use crate::device::{UsbEvent, UsbState};

/// Side effect attached to a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Classify the device and enqueue `ALLOW_ACCESS_STR` or `ALLOW_ACCESS_NONSTR`.
    Classify,
    /// Set the soft-delete flag.
    MarkForRemoval,
    /// Block the device through the policy enforcer.
    DenyAccess,
    /// Run the certificate workflow.
    Certify,
    /// Authorize without certification, then enqueue `MOUNT_SUCCESS` or
    /// `MOUNT_FAILED`.
    GrantNonStorage,
    /// Log the certification failure.
    LogNotVerified,
    /// Authorize the device, then enqueue `MOUNT_SUCCESS` or `MOUNT_FAILED`.
    AuthorizeVerified,
    /// Log the mount failure.
    LogMountFailed,
    /// Log that the device is in service.
    LogMountSuccess,
    /// Log recovery from a failed mount.
    LogRecovered,
}

impl Action {
    /// Every action, in declaration order.
    pub const ALL: [Action; 10] = [
        Self::Classify,
        Self::MarkForRemoval,
        Self::DenyAccess,
        Self::Certify,
        Self::GrantNonStorage,
        Self::LogNotVerified,
        Self::AuthorizeVerified,
        Self::LogMountFailed,
        Self::LogMountSuccess,
        Self::LogRecovered,
    ];

    /// Short name used in logs.
    pub fn name(self) -> &'static str {
        match self {
            Self::Classify => "classify",
            Self::MarkForRemoval => "mark_for_removal",
            Self::DenyAccess => "deny_access",
            Self::Certify => "certify",
            Self::GrantNonStorage => "grant_non_storage",
            Self::LogNotVerified => "log_not_verified",
            Self::AuthorizeVerified => "authorize_verified",
            Self::LogMountFailed => "log_mount_failed",
            Self::LogMountSuccess => "log_mount_success",
            Self::LogRecovered => "log_recovered",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One cell of the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Transition {
    /// State after dispatch.
    pub next: UsbState,
    /// Action run before the state is applied.
    pub action: Option<Action>,
}

impl Transition {
    /// A cell that keeps `state` and runs nothing.
    pub fn noop(state: UsbState) -> Self {
        Self {
            next: state,
            action: None,
        }
    }

    /// Whether this cell is a no-op for `from`.
    pub fn is_noop_for(&self, from: UsbState) -> bool {
        self.action.is_none() && self.next == from
    }
}

/// Defined transitions as (from, event, to, action) rows.
const STANDARD_ROWS: &[(UsbState, UsbEvent, UsbState, Action)] = &[
    (UsbState::Unplugged, UsbEvent::Plugin, UsbState::Plugged, Action::Classify),
    (UsbState::Plugged, UsbEvent::Plugout, UsbState::Unplugged, Action::MarkForRemoval),
    (UsbState::Plugged, UsbEvent::DenyAccess, UsbState::Deny, Action::DenyAccess),
    (UsbState::Plugged, UsbEvent::AllowAccessStorage, UsbState::Certifying, Action::Certify),
    (
        UsbState::Plugged,
        UsbEvent::AllowAccessNonStorage,
        UsbState::Mounting,
        Action::GrantNonStorage,
    ),
    (UsbState::Deny, UsbEvent::Plugout, UsbState::Unplugged, Action::MarkForRemoval),
    (UsbState::Certifying, UsbEvent::Plugout, UsbState::Unplugged, Action::MarkForRemoval),
    (
        UsbState::Certifying,
        UsbEvent::CertificateNotVerified,
        UsbState::Deny,
        Action::LogNotVerified,
    ),
    (
        UsbState::Certifying,
        UsbEvent::CertificateVerified,
        UsbState::Mounting,
        Action::AuthorizeVerified,
    ),
    (UsbState::Mounting, UsbEvent::Plugout, UsbState::Unplugged, Action::MarkForRemoval),
    (UsbState::Mounting, UsbEvent::MountFailed, UsbState::MountFailed, Action::LogMountFailed),
    (UsbState::Mounting, UsbEvent::MountSuccess, UsbState::InService, Action::LogMountSuccess),
    (UsbState::MountFailed, UsbEvent::Plugout, UsbState::Unplugged, Action::MarkForRemoval),
    (UsbState::MountFailed, UsbEvent::MountSuccess, UsbState::InService, Action::LogRecovered),
    (UsbState::InService, UsbEvent::Plugout, UsbState::Unplugged, Action::MarkForRemoval),
];

/// Complete (state, event) table. Built once and read-only afterwards.
#[derive(Debug, Clone)]
pub struct TransitionTable {
    cells: [[Transition; UsbEvent::COUNT]; UsbState::COUNT],
}

impl TransitionTable {
    /// Table with every cell a no-op.
    pub fn empty() -> Self {
        let mut cells = [[Transition::noop(UsbState::Unplugged); UsbEvent::COUNT]; UsbState::COUNT];
        for state in UsbState::ALL {
            cells[state.index()] = [Transition::noop(state); UsbEvent::COUNT];
        }
        Self { cells }
    }

    /// The access-control table.
    pub fn standard() -> Self {
        let mut table = Self::empty();
        for &(from, event, next, action) in STANDARD_ROWS {
            table.set(from, event, next, Some(action));
        }
        table
    }

    /// Overwrite one cell.
    pub fn set(&mut self, from: UsbState, event: UsbEvent, next: UsbState, action: Option<Action>) {
        self.cells[from.index()][event.index()] = Transition { next, action };
    }

    /// Look up a cell.
    pub fn lookup(&self, from: UsbState, event: UsbEvent) -> Transition {
        self.cells[from.index()][event.index()]
    }

    /// Every cell that is not a no-op, in (state, event) order.
    pub fn defined(&self) -> Vec<(UsbState, UsbEvent, Transition)> {
        let mut rows = Vec::new();
        for state in UsbState::ALL {
            for event in UsbEvent::ALL {
                let cell = self.lookup(state, event);
                if !cell.is_noop_for(state) {
                    rows.push((state, event, cell));
                }
            }
        }
        rows
    }
}

impl Default for TransitionTable {
    fn default() -> Self {
        Self::standard()
    }
}
