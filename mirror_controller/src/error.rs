//! Error types shared across the controller.

use thiserror::Error;

use crate::models::AxisId;

/// Failure to open a device session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("port is busy")]
    PortBusy,
    #[error("port not found")]
    NotFound,
    #[error("connection attempt timed out")]
    Timeout,
}

/// Failure of a single exchange on an open session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("session is disconnected")]
    Disconnected,
    #[error("device did not answer in time")]
    Timeout,
    #[error("unexpected or rejected reply")]
    ProtocolError,
}

/// Reasons an axis controller refuses a command without touching the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Rejected {
    #[error("target is outside the soft limits")]
    OutOfRange,
    #[error("axis is faulted")]
    AxisFaulted,
    #[error("operation not supported by this axis")]
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("unknown axis")]
    UnknownAxis,
    #[error("device session is down")]
    SessionDown,
    #[error(transparent)]
    Rejected(#[from] Rejected),
}

/// Errors from submitting directly to an axis controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Rejected(#[from] Rejected),
    #[error("axis controller has stopped")]
    Stopped,
}

impl From<SubmitError> for DispatchError {
    fn from(error: SubmitError) -> Self {
        match error {
            SubmitError::Rejected(rejected) => DispatchError::Rejected(rejected),
            SubmitError::Stopped => DispatchError::UnknownAxis,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error("axis {0} is already registered")]
    DuplicateAxis(AxisId),
    #[error("axis {0} is not registered")]
    UnknownAxis(AxisId),
    #[error("axis {axis} refers to unknown port {port:?}")]
    UnknownPort { axis: AxisId, port: String },
    #[error("device {device} on port {port:?} is already bound to axis {existing}")]
    DuplicateDevice {
        port: String,
        device: u8,
        existing: AxisId,
    },
    #[error("axis {0} has invalid soft limits")]
    InvalidLimits(AxisId),
    #[error("axis {axis} has an invalid {field}")]
    InvalidParameter { axis: AxisId, field: &'static str },
}
