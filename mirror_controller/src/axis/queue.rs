use std::collections::VecDeque;

use tokio::time::Instant;

use crate::models::{Command, MotionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    AwaitingAck,
    /// Acknowledged. Only polls numbered `poll_watermark` or later were
    /// issued after the acknowledgement and may report completion.
    Executing { poll_watermark: u64 },
}

#[derive(Debug, Clone)]
pub(crate) struct InFlight {
    pub command: Command,
    pub target: Option<f64>,
    pub phase: Phase,
    pub superseded: bool,
    /// A Home that reached the device zero and is now travelling on to the
    /// configured home position.
    pub returning_home: bool,
    pub started_at: Instant,
}

#[derive(Debug, Clone)]
struct Queued {
    command: Command,
    target: Option<f64>,
}

/// Pending commands of one axis plus the single command on the wire.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    pending: VecDeque<Queued>,
    in_flight: Option<InFlight>,
}

impl CommandQueue {
    pub fn push(&mut self, command: Command, target: Option<f64>) {
        self.pending.push_back(Queued { command, target });
    }

    /// Moves the next pending command on the wire if nothing is in flight.
    pub fn start_next(&mut self, now: Instant) -> Option<&InFlight> {
        if self.in_flight.is_some() {
            return None;
        }
        let next = self.pending.pop_front()?;
        self.in_flight = Some(InFlight {
            command: next.command,
            target: next.target,
            phase: Phase::AwaitingAck,
            superseded: false,
            returning_home: false,
            started_at: now,
        });
        self.in_flight.as_ref()
    }

    pub fn in_flight(&self) -> Option<&InFlight> {
        self.in_flight.as_ref()
    }

    pub fn in_flight_mut(&mut self) -> Option<&mut InFlight> {
        self.in_flight.as_mut()
    }

    pub fn finish(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }

    /// Drops pending motion commands older than `sequence` and marks the
    /// in-flight one superseded. Returns the affected sequence numbers.
    pub fn supersede_motion_before(&mut self, sequence: u64) -> Vec<u64> {
        let mut superseded = Vec::new();
        self.pending.retain(|queued| {
            let drop =
                queued.command.request.is_motion() && queued.command.sequence < sequence;
            if drop {
                superseded.push(queued.command.sequence);
            }
            !drop
        });
        if let Some(in_flight) = self.in_flight.as_mut()
            && !in_flight.superseded
            && in_flight.command.request.is_motion()
            && in_flight.command.sequence < sequence
        {
            in_flight.superseded = true;
            superseded.push(in_flight.command.sequence);
        }
        superseded
    }

    /// Drops every pending command and marks the in-flight one superseded.
    pub fn supersede_all(&mut self) -> Vec<u64> {
        let mut superseded: Vec<u64> = self
            .pending
            .drain(..)
            .map(|queued| queued.command.sequence)
            .collect();
        if let Some(in_flight) = self.in_flight.as_mut()
            && !in_flight.superseded
        {
            in_flight.superseded = true;
            superseded.push(in_flight.command.sequence);
        }
        superseded
    }

    /// Takes out a superseded command that was already acknowledged. One
    /// still waiting for its acknowledgement keeps the slot until it resolves.
    pub fn release_superseded(&mut self) -> Option<InFlight> {
        match &self.in_flight {
            Some(in_flight)
                if in_flight.superseded
                    && matches!(in_flight.phase, Phase::Executing { .. }) =>
            {
                self.in_flight.take()
            }
            _ => None,
        }
    }

    /// Where the axis will be once every queued command has run, if known.
    pub fn planned_position(&self) -> Option<f64> {
        self.pending.iter().rev().find_map(|queued| queued.target).or_else(|| {
            self.in_flight
                .as_ref()
                .filter(|in_flight| !in_flight.superseded)
                .and_then(|in_flight| in_flight.target)
        })
    }

    /// Whether a Home that still counts is on the wire.
    pub fn homing(&self) -> bool {
        self.in_flight.as_ref().is_some_and(|in_flight| {
            !in_flight.superseded && in_flight.command.request == MotionRequest::Home
        })
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Whether a request waits for a poll to complete after its acknowledgement.
pub(crate) fn completes_on_poll(request: &MotionRequest) -> bool {
    request.is_motion()
}
