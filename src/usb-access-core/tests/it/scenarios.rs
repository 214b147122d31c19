//! End-to-end device lifecycles driven through the queue and engine.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use usb_access_core::{
    Action, DeviceId, DeviceProperties, DeviceWatchdog, DispatchOutcome, NotificationFields,
    PolicyTarget, PresenceHandler, PresenceKind, PresenceNotification, PresenceOutcome,
    QueueEntry, TransitionTable, UsbEvent, UsbState,
};

use crate::support::{non_storage_properties, storage_properties, Harness, HarnessOptions};

#[test]
fn storage_device_with_valid_certificate_goes_in_service() {
    let harness = Harness::new(HarnessOptions {
        locator_succeeds_on: Some(2),
        ..HarnessOptions::default()
    });
    let dev = harness.add_device(1, &storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    let seen = harness.drain();

    assert_eq!(
        seen,
        vec![
            UsbEvent::Plugin,
            UsbEvent::AllowAccessStorage,
            UsbEvent::CertificateVerified,
            UsbEvent::MountSuccess,
        ]
    );
    assert_eq!(dev.state(), Ok(UsbState::InService));
    assert_eq!(harness.locator.calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.verifier.calls.load(Ordering::SeqCst), 1);
    assert_eq!(harness.enforcer_calls(), vec![(dev.id(), PolicyTarget::Allow)]);
    assert_eq!(dev.in_flight(), 0);
}

#[test]
fn storage_device_without_signature_source_is_denied() {
    let harness = Harness::new(HarnessOptions {
        locator_succeeds_on: None,
        retry_count: 3,
        ..HarnessOptions::default()
    });
    let dev = harness.add_device(2, &storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    let seen = harness.drain();

    assert_eq!(
        seen,
        vec![
            UsbEvent::Plugin,
            UsbEvent::AllowAccessStorage,
            UsbEvent::CertificateNotVerified,
        ]
    );
    assert_eq!(dev.state(), Ok(UsbState::Deny));
    assert_eq!(harness.locator.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.verifier.calls.load(Ordering::SeqCst), 0);
    assert!(harness.enforcer_calls().is_empty());
}

#[test]
fn untrusted_certificate_is_denied() {
    let harness = Harness::new(HarnessOptions {
        verifier_answer: false,
        ..HarnessOptions::default()
    });
    let dev = harness.add_device(3, &storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    harness.drain();

    assert_eq!(dev.state(), Ok(UsbState::Deny));
    assert_eq!(harness.verifier.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn non_storage_device_skips_certification() {
    let harness = Harness::new(HarnessOptions::default());
    let dev = harness.add_device(4, &non_storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    let seen = harness.drain();

    assert_eq!(
        seen,
        vec![
            UsbEvent::Plugin,
            UsbEvent::AllowAccessNonStorage,
            UsbEvent::MountSuccess,
        ]
    );
    assert_eq!(dev.state(), Ok(UsbState::InService));
    assert_eq!(harness.classifier_calls(), 1);
    assert_eq!(harness.locator.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.verifier.calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.enforcer_calls(), vec![(dev.id(), PolicyTarget::Allow)]);
}

#[test]
fn plugout_during_certification_defers_reclamation() {
    let harness = Harness::new(HarnessOptions::default());
    let dev = harness.add_device(5, &storage_properties());

    // The listener reports removal while the workflow is still running.
    {
        let queue = Arc::clone(&harness.queue);
        let dev = Arc::clone(&dev);
        harness
            .locator
            .set_hook(move || queue.push(&dev, UsbEvent::Plugout));
    }

    harness.queue.push(&dev, UsbEvent::Plugin);
    assert_eq!(harness.step().0, UsbEvent::Plugin);
    assert_eq!(harness.step().0, UsbEvent::AllowAccessStorage);
    assert_eq!(dev.state(), Ok(UsbState::Certifying));

    let (event, outcome) = harness.step();
    assert_eq!(event, UsbEvent::Plugout);
    assert_eq!(
        outcome,
        DispatchOutcome::Applied {
            from: UsbState::Certifying,
            to: UsbState::Unplugged,
            action: Some(Action::MarkForRemoval),
        }
    );
    assert!(dev.is_marked_for_free());
    assert_eq!(dev.in_flight(), 1);
    assert!(
        harness.registry.find_by_id(dev.id()).is_some(),
        "record reclaimed while the verification result was still queued"
    );

    let (event, outcome) = harness.step();
    assert_eq!(event, UsbEvent::CertificateVerified);
    assert_eq!(
        outcome,
        DispatchOutcome::NoOp {
            state: UsbState::Unplugged
        }
    );
    assert!(harness.registry.find_by_id(dev.id()).is_none());
    assert!(harness.queue.is_empty());
    assert_eq!(harness.classifier_calls(), 1);
    assert!(harness.enforcer_calls().is_empty());
}

#[test]
fn full_lifecycle_ends_with_reclamation() {
    let harness = Harness::new(HarnessOptions::default());
    let dev = harness.add_device(6, &non_storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    harness.drain();
    assert_eq!(dev.state(), Ok(UsbState::InService));

    harness.queue.push(&dev, UsbEvent::Plugout);
    harness.drain();
    assert_eq!(dev.state(), Ok(UsbState::Unplugged));
    assert!(harness.registry.is_empty());
}

#[test]
fn mount_failed_device_recovers() {
    let harness = Harness::new(HarnessOptions::default());
    let dev = harness.add_device(7, &non_storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    assert_eq!(harness.step().0, UsbEvent::Plugin);
    assert_eq!(harness.step().0, UsbEvent::AllowAccessNonStorage);

    // MOUNT_FAILED overtakes the queued MOUNT_SUCCESS.
    let queued_success = harness.queue.dequeue();
    harness.queue.push(&dev, UsbEvent::MountFailed);
    harness.step();
    assert_eq!(dev.state(), Ok(UsbState::MountFailed));

    let outcome = harness.engine.dispatch(queued_success);
    assert_eq!(
        outcome,
        DispatchOutcome::Applied {
            from: UsbState::MountFailed,
            to: UsbState::InService,
            action: Some(Action::LogRecovered),
        }
    );
    assert_eq!(dev.in_flight(), 0);
}

#[test]
fn presence_handler_and_engine_thread_end_to_end() {
    let harness = Harness::new(HarnessOptions::default());
    let presence = PresenceHandler::new(Arc::clone(&harness.registry), Arc::clone(&harness.queue));
    let Harness {
        engine,
        registry,
        queue,
        ..
    } = harness;
    let engine = Arc::new(engine);
    let consumer = Arc::clone(&engine).spawn().unwrap();

    presence.handle(PresenceNotification {
        device_id: 11,
        kind: PresenceKind::Insert,
        fields: NotificationFields::default(),
        properties: DeviceProperties::from_pairs(non_storage_properties()),
    });
    let id = DeviceId::new(11).unwrap();
    let dev = registry.find_by_id(id).unwrap();
    while dev.state() != Ok(UsbState::InService) {
        thread::yield_now();
    }

    presence.handle(PresenceNotification {
        device_id: 11,
        kind: PresenceKind::Remove,
        fields: NotificationFields::default(),
        properties: DeviceProperties::default(),
    });
    queue.enqueue(QueueEntry::exit());
    let stats = consumer.join().unwrap();

    assert_eq!(stats.applied, 4);
    assert_eq!(stats.reclaimed, 1);
    assert!(registry.find_by_id(id).is_none());
}

#[test]
fn shutdown_force_cleanup_catches_leftovers() {
    let harness = Harness::new(HarnessOptions::default());
    let dev = harness.add_device(8, &storage_properties());
    harness.queue.push(&dev, UsbEvent::Plugin);
    harness.step();
    assert_eq!(dev.state(), Ok(UsbState::Plugged));

    assert_eq!(harness.registry.force_cleanup_all(), 1);
    assert!(harness.registry.is_empty());
}

fn presence(device_id: u32, kind: PresenceKind) -> PresenceNotification {
    PresenceNotification {
        device_id,
        kind,
        fields: NotificationFields::default(),
        properties: DeviceProperties::from_pairs(non_storage_properties()),
    }
}

#[test]
fn replug_while_removal_is_queued_is_dropped_with_the_old_record() {
    let harness = Harness::new(HarnessOptions::default());
    let presence_handler =
        PresenceHandler::new(Arc::clone(&harness.registry), Arc::clone(&harness.queue));
    let id = DeviceId::new(13).unwrap();

    let outcomes = [
        presence_handler.handle(presence(13, PresenceKind::Insert)),
        presence_handler.handle(presence(13, PresenceKind::Remove)),
        presence_handler.handle(presence(13, PresenceKind::Insert)),
    ];
    assert_eq!(
        outcomes,
        [
            PresenceOutcome::Registered(id),
            PresenceOutcome::Removed(id),
            PresenceOutcome::Ignored,
        ]
    );
    let dev = harness.registry.find_by_id(id).unwrap();
    assert_eq!(harness.registry.len(), 1);
    assert_eq!(dev.in_flight(), 2);

    assert_eq!(
        harness.drain(),
        vec![
            UsbEvent::Plugin,
            UsbEvent::Plugout,
            UsbEvent::AllowAccessNonStorage,
        ]
    );
    assert_eq!(dev.state(), Ok(UsbState::Unplugged));
    assert!(dev.is_marked_for_free());
    assert_eq!(dev.in_flight(), 0);
    assert!(harness.registry.is_empty());
    assert!(harness.enforcer_calls().is_empty());

    // Once the old record is gone the next insert starts a fresh lifecycle.
    assert_eq!(
        presence_handler.handle(presence(13, PresenceKind::Present)),
        PresenceOutcome::Registered(id)
    );
    harness.drain();
    let fresh = harness.registry.find_by_id(id).unwrap();
    assert!(!Arc::ptr_eq(&fresh, &dev));
    assert_eq!(fresh.state(), Ok(UsbState::InService));
}

#[test]
fn watchdog_recovers_device_whose_follow_up_was_lost() {
    // Non-storage grant that never produces its mount result.
    let mut table = TransitionTable::standard();
    table.set(UsbState::Plugged, UsbEvent::AllowAccessNonStorage, UsbState::Mounting, None);
    let harness = Harness::with_table(HarnessOptions::default(), table);
    let dev = harness.add_device(14, &non_storage_properties());

    harness.queue.push(&dev, UsbEvent::Plugin);
    harness.drain();
    assert_eq!(dev.state(), Ok(UsbState::Mounting));
    assert_eq!(dev.in_flight(), 0);

    let watchdog = DeviceWatchdog::new(
        Arc::clone(&harness.registry),
        Arc::clone(&harness.queue),
        Duration::ZERO,
    );
    thread::sleep(Duration::from_millis(5));
    assert_eq!(watchdog.check(), 1);

    assert_eq!(harness.drain(), vec![UsbEvent::Plugout]);
    assert_eq!(dev.state(), Ok(UsbState::Unplugged));
    assert!(dev.is_marked_for_free());
    assert!(harness.registry.is_empty());
    assert_eq!(watchdog.check(), 0);
}

#[test]
fn watchdog_leaves_device_in_service_alone() {
    let harness = Harness::new(HarnessOptions::default());
    let dev = harness.add_device(15, &non_storage_properties());
    harness.queue.push(&dev, UsbEvent::Plugin);
    harness.drain();
    assert_eq!(dev.state(), Ok(UsbState::InService));

    let watchdog = DeviceWatchdog::new(
        Arc::clone(&harness.registry),
        Arc::clone(&harness.queue),
        Duration::ZERO,
    );
    thread::sleep(Duration::from_millis(5));
    assert_eq!(watchdog.check(), 0);
    assert!(harness.queue.is_empty());
    assert!(harness.registry.find_by_id(dev.id()).is_some());
}
