//! Fan-out of axis and session events to any number of subscribers.
//!
//! Publishers hand events to a single bus task which copies them into one
//! bounded queue per subscriber. A slow subscriber loses intermediate
//! `StatusChanged` events of an axis, never the latest one, and never faults
//! or session health changes.

mod channel;

use tokio::sync::mpsc;
use tracing::debug;

use crate::models::{AxisId, AxisState, FaultKind};
use crate::session::SessionHealth;

pub use channel::EventStream;
use channel::EventSink;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    StatusChanged {
        axis: AxisId,
        state: AxisState,
    },
    AxisFault {
        axis: AxisId,
        fault: FaultKind,
        state: AxisState,
    },
    SessionHealthChanged {
        port: String,
        health: SessionHealth,
    },
}

impl Event {
    pub fn axis(&self) -> Option<&AxisId> {
        match self {
            Event::StatusChanged { axis, .. } | Event::AxisFault { axis, .. } => Some(axis),
            Event::SessionHealthChanged { .. } => None,
        }
    }

    /// Only plain status updates may be coalesced away.
    pub fn is_droppable(&self) -> bool {
        matches!(self, Event::StatusChanged { .. })
    }
}

enum BusMessage {
    Publish(Event),
    Subscribe(EventSink),
}

#[derive(Debug, Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<BusMessage>,
    capacity: usize,
}

impl EventBus {
    /// Spawns the bus task. `capacity` bounds the number of buffered status
    /// updates per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_bus(rx));
        EventBus {
            tx,
            capacity: capacity.max(1),
        }
    }

    pub fn publish(&self, event: Event) {
        if self.tx.send(BusMessage::Publish(event)).is_err() {
            debug!("Event bus closed, dropping event");
        }
    }

    /// The stream sees every event published after this call returns.
    pub fn subscribe(&self) -> EventStream {
        let (sink, stream) = channel::channel(self.capacity);
        if self.tx.send(BusMessage::Subscribe(sink)).is_err() {
            debug!("Event bus closed, subscriber will see no events");
        }
        stream
    }
}

async fn run_bus(mut rx: mpsc::UnboundedReceiver<BusMessage>) {
    let mut sinks: Vec<EventSink> = Vec::new();

    while let Some(message) = rx.recv().await {
        match message {
            BusMessage::Subscribe(sink) => sinks.push(sink),
            BusMessage::Publish(event) => {
                sinks.retain(|sink| sink.push(event.clone()));
            }
        }
    }

    debug!("Event bus stopped");
}
