//! Property-based tests for the bounded event queue.

use std::sync::Arc;
use std::thread;

use proptest::prelude::*;

use usb_access_core::{DeviceId, DeviceProperties, EventQueue, UsbDevice, UsbEvent};

fn device(id: u32) -> Arc<UsbDevice> {
    Arc::new(UsbDevice::new(DeviceId::new(id).unwrap(), DeviceProperties::default()))
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        max_shrink_iters: 200,
        ..ProptestConfig::default()
    })]

    /// Concurrent producers: every entry arrives exactly once and each
    /// producer's own entries keep their order.
    #[test]
    fn concurrent_producers_preserve_per_producer_order(
        producers in 1usize..5,
        per_producer in 1usize..40,
        capacity in 1usize..8,
    ) {
        let queue = Arc::new(EventQueue::new(capacity).unwrap());
        let handles: Vec<_> = (0..producers)
            .map(|p| {
                let queue = Arc::clone(&queue);
                let dev = device(p as u32 + 1);
                thread::spawn(move || {
                    for i in 0..per_producer {
                        // Encode the sequence number in the event so order is observable.
                        let event = UsbEvent::try_from((i % 10) as u8).unwrap();
                        queue.push(&dev, event);
                    }
                })
            })
            .collect();

        let mut seen: Vec<Vec<UsbEvent>> = vec![Vec::new(); producers];
        for _ in 0..producers * per_producer {
            let entry = queue.dequeue();
            let producer = entry.device().unwrap().id().get() as usize - 1;
            seen[producer].push(entry.event());
        }
        for handle in handles {
            handle.join().unwrap();
        }

        prop_assert!(queue.is_empty());
        for events in seen {
            let expected: Vec<UsbEvent> = (0..per_producer)
                .map(|i| UsbEvent::try_from((i % 10) as u8).unwrap())
                .collect();
            prop_assert_eq!(events, expected);
        }
    }

    /// Single producer: dequeue order equals enqueue order.
    #[test]
    fn single_producer_fifo(raw in prop::collection::vec(0u8..11, 1..64)) {
        let queue = EventQueue::new(raw.len()).unwrap();
        let dev = device(1);
        let events: Vec<UsbEvent> = raw.iter().map(|r| UsbEvent::try_from(*r).unwrap()).collect();
        for event in &events {
            queue.push(&dev, *event);
        }
        prop_assert_eq!(dev.in_flight(), events.len());
        let drained: Vec<UsbEvent> = (0..events.len()).map(|_| queue.dequeue().event()).collect();
        prop_assert_eq!(drained, events);
    }
}

#[test]
fn capacity_is_never_exceeded_by_producers() {
    let queue = Arc::new(EventQueue::new(2).unwrap());
    let dev = device(1);
    let producer = {
        let queue = Arc::clone(&queue);
        let dev = Arc::clone(&dev);
        thread::spawn(move || {
            for _ in 0..20 {
                queue.push(&dev, UsbEvent::Plugin);
            }
        })
    };
    for _ in 0..20 {
        assert!(queue.len() <= queue.capacity());
        queue.dequeue();
    }
    producer.join().unwrap();
    assert!(queue.is_empty());
}
