//! Bounded blocking event queue.
//!
//! A fixed-capacity FIFO guarded by one mutex and two condition variables
//! ("not full", "not empty"). Producers block when the queue is full; the
//! single FSM consumer blocks when it is empty. Entries are never dropped or
//! reordered.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::device::{UsbDevice, UsbEvent};
use crate::error::AccessError;

/// Default capacity of the event queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// A device handle paired with an event.
///
/// The device is `None` only for [`UsbEvent::Exit`].
#[derive(Debug, Clone)]
pub struct QueueEntry {
    device: Option<Arc<UsbDevice>>,
    event: UsbEvent,
}

impl QueueEntry {
    /// Entry for a device event.
    pub fn new(device: Arc<UsbDevice>, event: UsbEvent) -> Self {
        Self {
            device: Some(device),
            event,
        }
    }

    /// The shutdown sentinel.
    pub fn exit() -> Self {
        Self {
            device: None,
            event: UsbEvent::Exit,
        }
    }

    /// Referenced device, if any.
    pub fn device(&self) -> Option<&Arc<UsbDevice>> {
        self.device.as_ref()
    }

    /// The event.
    pub fn event(&self) -> UsbEvent {
        self.event
    }

    /// Split into parts.
    pub fn into_parts(self) -> (Option<Arc<UsbDevice>>, UsbEvent) {
        (self.device, self.event)
    }
}

/// Bounded multi-producer FIFO feeding the FSM engine.
#[derive(Debug)]
pub struct EventQueue {
    buffer: Mutex<VecDeque<QueueEntry>>,
    capacity: usize,
    not_full: Condvar,
    not_empty: Condvar,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Result<Self, AccessError> {
        if capacity == 0 {
            return Err(AccessError::InvalidQueueCapacity { capacity });
        }
        Ok(Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        })
    }

    /// Append an entry, blocking while the queue is full.
    ///
    /// A device-bearing entry counts as in flight for that device until the
    /// engine has dispatched it.
    pub fn enqueue(&self, entry: QueueEntry) {
        if let Some(device) = entry.device() {
            device.acquire_event();
        }
        let mut buffer = self.buffer.lock();
        while buffer.len() >= self.capacity {
            self.not_full.wait(&mut buffer);
        }
        trace!(
            event = %entry.event(),
            device_id = ?entry.device().map(|d| d.id()),
            depth = buffer.len() + 1,
            "Queue: enqueued"
        );
        buffer.push_back(entry);
        self.not_empty.notify_one();
    }

    /// Shorthand for enqueuing a device event.
    pub fn push(&self, device: &Arc<UsbDevice>, event: UsbEvent) {
        self.enqueue(QueueEntry::new(Arc::clone(device), event));
    }

    /// Append a follow-up event from the consumer thread without blocking.
    ///
    /// The consumer emits at most one follow-up per dequeued entry, so the
    /// buffer holds at most `capacity + 1` entries. Blocking here would
    /// deadlock the only thread that drains the queue.
    pub fn push_follow_up(&self, device: &Arc<UsbDevice>, event: UsbEvent) {
        device.acquire_event();
        let mut buffer = self.buffer.lock();
        trace!(
            event = %event,
            device_id = %device.id(),
            depth = buffer.len() + 1,
            "Queue: enqueued follow-up"
        );
        buffer.push_back(QueueEntry::new(Arc::clone(device), event));
        self.not_empty.notify_one();
    }

    /// Remove the oldest entry, blocking while the queue is empty.
    pub fn dequeue(&self) -> QueueEntry {
        let mut buffer = self.buffer.lock();
        loop {
            if let Some(entry) = buffer.pop_front() {
                self.not_full.notify_one();
                return entry;
            }
            self.not_empty.wait(&mut buffer);
        }
    }

    /// Entries currently queued.
    pub fn len(&self) -> usize {
        self.buffer.lock().len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.lock().is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
