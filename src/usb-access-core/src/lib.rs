//! # usb-access-core
//!
//! Core of the USB access-control daemon: the per-device state machine, the
//! event queue that serializes every transition, the device registry with
//! two-phase reclamation, and the certificate challenge for storage devices.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────┐   PLUGIN/PLUGOUT   ┌──────────────┐
//! │ PresenceHandler│ ─────────────────▶ │  EventQueue  │ ◀──┐
//! └────────────────┘                    └──────────────┘    │ follow-up
//!         │ add                                │ dequeue    │ events
//!         ▼                                    ▼            │
//! ┌────────────────┐   mark / reclaim   ┌──────────────┐    │
//! │ DeviceRegistry │ ◀───────────────── │  FsmEngine   │ ───┘
//! └────────────────┘                    └──────────────┘
//!         ▲                                    │ actions
//!         │ overdue                            ▼
//! ┌────────────────┐          ┌─────────────────────────────────┐
//! │ DeviceWatchdog │          │ Classifier · PolicyEnforcer ·   │
//! └────────────────┘          │ CertificateWorkflow             │
//!                             └─────────────────────────────────┘
//! ```
//!
//! ## Security Properties
//!
//! - **Fail-closed**: every certification failure becomes CERTIFICATE_NOT_VERIFIED
//! - **Bounded**: locator retries, verifier calls and queue depth are all capped
//! - **No use-after-remove**: a record is reclaimed only when marked, UNPLUGGED
//!   and referenced by no queued event

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)] // Too strict for production code
#![allow(clippy::doc_markdown)] // Allow product names without backticks
#![allow(clippy::missing_errors_doc)] // Error documentation not required
#![allow(clippy::missing_panics_doc)] // Panic documentation not required
#![allow(clippy::module_name_repetitions)] // Allow Type in module::Type
#![allow(clippy::must_use_candidate)] // Not all functions need must_use

pub mod certificate;
pub mod collaborators;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod fsm;
pub mod presence;
pub mod queue;
pub mod registry;
pub mod validation;
pub mod watchdog;

pub use certificate::{CertificateWorkflow, CertificationPolicy};
pub use collaborators::{
    CertificateReader, CertificateVerifier, DeviceClassifier, FileCertificateReader,
    PolicyEnforcer, PolicyTarget, PropertyClassifier, SignatureLocator,
};
pub use config::{AccessConfig, LoadedConfig, LogLevel};
pub use device::{
    DeviceId, DeviceProperties, NotificationFields, UsbDevice, UsbEvent, UsbId, UsbState,
};
pub use engine::{Collaborators, DispatchOutcome, EngineStats, FsmEngine, PolicyRetry};
pub use error::{AccessError, CertifyError, PolicyError, VerifierError};
pub use fsm::{Action, Transition, TransitionTable};
pub use presence::{PresenceHandler, PresenceKind, PresenceNotification, PresenceOutcome};
pub use queue::{EventQueue, QueueEntry, DEFAULT_QUEUE_CAPACITY};
pub use registry::DeviceRegistry;
pub use validation::ValidationError;
pub use watchdog::DeviceWatchdog;
