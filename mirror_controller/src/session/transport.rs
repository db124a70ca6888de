use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ConnectError, TransportError};
use crate::session::{AxisBinding, SessionDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    ZaberAsciiTcp,
    ZaberAsciiSerial,
    Simulated,
}

/// A command as it goes on the wire, in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WireCommand {
    MoveAbsolute { position: f64, speed: Option<f64> },
    Home,
    Stop,
    SetSpeed { speed: f64 },
}

/// The device accepted a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ack;

/// One status poll as reported by the device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RawStatus {
    pub position: f64,
    pub moving: bool,
    pub fault: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredDevice {
    pub device: u8,
    pub detail: Option<String>,
}

/// An open connection to a chain of devices. Only the owning session calls
/// these methods, one at a time.
#[async_trait]
pub trait Transport: Send {
    async fn write_command(
        &mut self,
        binding: &AxisBinding,
        command: &WireCommand,
    ) -> Result<Ack, TransportError>;

    async fn read_status(&mut self, binding: &AxisBinding) -> Result<RawStatus, TransportError>;

    async fn discover(&mut self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        Ok(Vec::new())
    }

    async fn close(&mut self) {}
}

/// Opens transports for a session, on start-up and on every reconnect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, descriptor: &SessionDescriptor) -> Result<Box<dyn Transport>, ConnectError>;
}
