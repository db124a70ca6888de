use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use super::Event;

struct Shared {
    queue: Mutex<Queue>,
    notify: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct Queue {
    events: VecDeque<Event>,
    /// Bound on buffered droppable events.
    capacity: usize,
    droppable: usize,
    dropped: u64,
    closed: bool,
}

impl Queue {
    fn push(&mut self, event: Event) {
        if event.is_droppable() {
            if self.droppable >= self.capacity {
                self.evict(&event);
            }
            self.droppable += 1;
        }
        self.events.push_back(event);
    }

    /// Drops the oldest buffered status update of the incoming event's axis.
    /// An axis with nothing buffered is admitted over the bound, so every
    /// axis keeps its latest snapshot.
    fn evict(&mut self, incoming: &Event) {
        let victim = self
            .events
            .iter()
            .position(|e| e.is_droppable() && e.axis() == incoming.axis());

        if let Some(index) = victim {
            self.events.remove(index);
            self.droppable -= 1;
            self.dropped += 1;
        }
    }

    fn pop(&mut self) -> Option<Event> {
        let event = self.events.pop_front()?;
        if event.is_droppable() {
            self.droppable -= 1;
        }
        Some(event)
    }
}

pub(super) fn channel(capacity: usize) -> (EventSink, EventStream) {
    let shared = Arc::new(Shared {
        queue: Mutex::new(Queue {
            events: VecDeque::new(),
            capacity,
            droppable: 0,
            dropped: 0,
            closed: false,
        }),
        notify: Notify::new(),
    });
    (
        EventSink {
            shared: shared.clone(),
        },
        EventStream { shared },
    )
}

/// Bus-side end of a subscription.
pub(super) struct EventSink {
    shared: Arc<Shared>,
}

impl EventSink {
    /// Returns `false` once the subscriber has gone away.
    pub(super) fn push(&self, event: Event) -> bool {
        if Arc::strong_count(&self.shared) < 2 {
            return false;
        }
        self.shared.lock().push(event);
        self.shared.notify.notify_one();
        true
    }
}

impl Drop for EventSink {
    fn drop(&mut self) {
        self.shared.lock().closed = true;
        self.shared.notify.notify_one();
    }
}

/// Receiving end of a subscription.
pub struct EventStream {
    shared: Arc<Shared>,
}

impl EventStream {
    /// Next event, or `None` once the bus has shut down and the buffer is empty.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut queue = self.shared.lock();
                if let Some(event) = queue.pop() {
                    return Some(event);
                }
                if queue.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Event> {
        self.shared.lock().pop()
    }

    /// Number of status updates coalesced away so far.
    pub fn dropped(&self) -> u64 {
        self.shared.lock().dropped
    }
}

impl std::fmt::Debug for EventStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let queue = self.shared.lock();
        f.debug_struct("EventStream")
            .field("buffered", &queue.events.len())
            .field("dropped", &queue.dropped)
            .finish()
    }
}
