use std::{fmt, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::TransportError;

/// Stable identifier of a logical axis, e.g. `PM1Y`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AxisId(String);

impl AxisId {
    pub fn new(id: impl Into<String>) -> Self {
        AxisId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AxisId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AxisId {
    fn from(id: &str) -> Self {
        AxisId::new(id)
    }
}

impl From<String> for AxisId {
    fn from(id: String) -> Self {
        AxisId(id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Unit {
    #[serde(rename = "mm")]
    Millimetres,
    #[serde(rename = "deg")]
    Degrees,
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unit::Millimetres => f.write_str("mm"),
            Unit::Degrees => f.write_str("deg"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimits {
    pub min: f64,
    pub max: f64,
}

impl SoftLimits {
    pub fn new(min: f64, max: f64) -> Self {
        SoftLimits { min, max }
    }

    /// Inclusive range check. NaN is never inside.
    pub fn contains(&self, position: f64) -> bool {
        position >= self.min && position <= self.max
    }

    pub fn contains_within(&self, position: f64, tolerance: f64) -> bool {
        position >= self.min - tolerance && position <= self.max + tolerance
    }

    pub fn is_valid(&self) -> bool {
        self.min.is_finite() && self.max.is_finite() && self.min < self.max
    }
}

/// Static description of one motor. Immutable once registered.
#[derive(Debug, Clone, PartialEq)]
pub struct MotorInfo {
    pub id: AxisId,
    pub label: String,
    pub port: String,
    pub device: u8,
    pub unit: Unit,
    pub steps_per_unit: f64,
    pub limits: SoftLimits,
    pub home_position: f64,
    pub poll_interval: Duration,
    /// Default speed in units per second.
    pub speed: f64,
    pub max_speed: Option<f64>,
    pub homeable: bool,
}

impl MotorInfo {
    /// Half a microstep, the resolution below which reported positions are
    /// indistinguishable from the limits.
    pub fn position_tolerance(&self) -> f64 {
        0.5 / self.steps_per_unit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FaultKind {
    /// Garbled or rejected exchange.
    Protocol,
    /// Reported position left the soft limits.
    OutOfLimits,
    /// The device itself raised a fault flag.
    Hardware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisStatus {
    Idle,
    Moving,
    Faulted,
    Stale,
}

/// Latest known state of an axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisState {
    pub position: f64,
    /// Derived from successive polls, units per second.
    pub velocity: f64,
    pub moving: bool,
    pub fault: Option<FaultKind>,
    pub last_error: Option<TransportError>,
    pub last_updated: Option<Instant>,
    pub stale: bool,
    /// Sequence number of the last command whose effect has been applied.
    pub applied_sequence: u64,
    pub homed: bool,
}

impl AxisState {
    /// State of an axis that has not been polled yet.
    pub fn unknown() -> Self {
        AxisState {
            position: 0.0,
            velocity: 0.0,
            moving: false,
            fault: None,
            last_error: None,
            last_updated: None,
            stale: true,
            applied_sequence: 0,
            homed: false,
        }
    }

    pub fn status(&self) -> AxisStatus {
        if self.fault.is_some() {
            AxisStatus::Faulted
        } else if self.stale {
            AxisStatus::Stale
        } else if self.moving {
            AxisStatus::Moving
        } else {
            AxisStatus::Idle
        }
    }

    /// Compares the observable fields, ignoring timestamps and velocity.
    pub fn differs_from(&self, other: &AxisState) -> bool {
        (self.position - other.position).abs() > 1e-9
            || self.moving != other.moving
            || self.fault != other.fault
            || self.last_error != other.last_error
            || self.stale != other.stale
            || self.applied_sequence != other.applied_sequence
            || self.homed != other.homed
    }
}

impl Default for AxisState {
    fn default() -> Self {
        Self::unknown()
    }
}

/// What a caller asks an axis to do.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionRequest {
    MoveAbsolute { position: f64, speed: Option<f64> },
    MoveRelative { distance: f64, speed: Option<f64> },
    Home,
    Stop,
    SetSpeed { speed: f64 },
}

impl MotionRequest {
    pub fn is_stop(&self) -> bool {
        matches!(self, MotionRequest::Stop)
    }

    /// Commands that physically move the stage and can be superseded by Stop.
    pub fn is_motion(&self) -> bool {
        matches!(
            self,
            MotionRequest::MoveAbsolute { .. } | MotionRequest::MoveRelative { .. } | MotionRequest::Home
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    pub axis: AxisId,
    pub request: MotionRequest,
    pub sequence: u64,
    pub submitted_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CommandId {
    pub axis: AxisId,
    pub sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Accepted {
    pub sequence: u64,
}
