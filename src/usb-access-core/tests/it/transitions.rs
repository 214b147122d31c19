//! Property-based tests for the transition table and the engine.
//!
//! Random event histories are fed to one device, draining the queue after
//! each injected event. A pure walk of the same table predicts the final
//! state; the engine must agree and must never leave a dangling reference.

use proptest::prelude::*;

use usb_access_core::{Action, TransitionTable, UsbEvent, UsbState};

use crate::support::{non_storage_properties, storage_properties, Harness, HarnessOptions};

/// Strategy for any event except EXIT.
fn device_event() -> impl Strategy<Value = UsbEvent> {
    (0u8..10).prop_map(|raw| UsbEvent::try_from(raw).unwrap())
}

/// Follow-up produced by `action` for the harness collaborators.
fn follow_up(action: Action, storage: bool, verified: bool) -> Option<UsbEvent> {
    match action {
        Action::Classify if storage => Some(UsbEvent::AllowAccessStorage),
        Action::Classify => Some(UsbEvent::AllowAccessNonStorage),
        Action::Certify if verified => Some(UsbEvent::CertificateVerified),
        Action::Certify => Some(UsbEvent::CertificateNotVerified),
        Action::GrantNonStorage | Action::AuthorizeVerified => Some(UsbEvent::MountSuccess),
        _ => None,
    }
}

/// Walk the table for one injected event and its follow-up chain.
fn model_step(
    table: &TransitionTable,
    state: &mut UsbState,
    marked: &mut bool,
    event: UsbEvent,
    storage: bool,
    verified: bool,
) {
    let mut pending = Some(event);
    while let Some(event) = pending.take() {
        let cell = table.lookup(*state, event);
        if let Some(action) = cell.action {
            if action == Action::MarkForRemoval {
                *marked = true;
            }
            pending = follow_up(action, storage, verified);
        }
        *state = cell.next;
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// The engine agrees with a pure walk of the table.
    #[test]
    fn engine_matches_table_model(
        events in prop::collection::vec(device_event(), 1..12),
        storage in any::<bool>(),
        verified in any::<bool>(),
    ) {
        let harness = Harness::new(HarnessOptions {
            verifier_answer: verified,
            retry_count: 1,
            ..HarnessOptions::default()
        });
        let properties = if storage { storage_properties() } else { non_storage_properties() };
        let dev = harness.add_device(1, &properties);
        let table = TransitionTable::standard();

        let mut state = UsbState::Unplugged;
        let mut marked = false;
        for event in events {
            if harness.registry.find_by_id(dev.id()).is_none() {
                break;
            }
            harness.queue.push(&dev, event);
            harness.drain();
            model_step(&table, &mut state, &mut marked, event, storage, verified);

            prop_assert_eq!(dev.state(), Ok(state));
            prop_assert_eq!(dev.is_marked_for_free(), marked);
            prop_assert_eq!(dev.in_flight(), 0);
        }
    }

    /// A record is gone from the registry exactly when the gate holds.
    #[test]
    fn reclaimed_iff_marked_and_unplugged(
        events in prop::collection::vec(device_event(), 1..12),
    ) {
        let harness = Harness::new(HarnessOptions::default());
        let dev = harness.add_device(2, &non_storage_properties());

        for event in events {
            harness.queue.push(&dev, event);
            harness.drain();
            let gate = dev.is_marked_for_free() && dev.state() == Ok(UsbState::Unplugged);
            prop_assert_eq!(harness.registry.find_by_id(dev.id()).is_none(), gate);
            if gate {
                break;
            }
        }
    }

    /// Undefined cells never change state.
    #[test]
    fn undefined_cells_keep_state(raw_state in 0u8..7, event in device_event()) {
        let table = TransitionTable::standard();
        let state = UsbState::try_from(raw_state).unwrap();
        let cell = table.lookup(state, event);
        if cell.action.is_none() {
            prop_assert_eq!(cell.next, state);
        }
    }
}

#[test]
fn storage_path_never_bypasses_certification() {
    let table = TransitionTable::standard();
    // The only way into MOUNTING from PLUGGED for storage is through CERTIFYING.
    let into_mounting: Vec<_> = table
        .defined()
        .into_iter()
        .filter(|(_, _, cell)| cell.next == UsbState::Mounting)
        .map(|(from, event, _)| (from, event))
        .collect();
    assert_eq!(
        into_mounting,
        vec![
            (UsbState::Plugged, UsbEvent::AllowAccessNonStorage),
            (UsbState::Certifying, UsbEvent::CertificateVerified),
        ]
    );
}
