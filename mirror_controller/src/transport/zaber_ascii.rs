use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt, BufStream};
use tracing::{debug, warn};
use utilities::stream::{SerialError, SerialErrorKind, connect_tcp, open_serial};
use zaber::{ExchangeError, ZaberDevice};

use crate::error::{ConnectError, TransportError};
use crate::session::{
    Ack, AxisBinding, Connector, DiscoveredDevice, RawStatus, SessionDescriptor, Transport,
    TransportKind, WireCommand,
};

/// Replies to a detection broadcast stop arriving after this much silence.
const DETECT_SETTLE: Duration = Duration::from_millis(200);

/// Every supported stage is a single-axis device.
const AXIS: u8 = 1;

#[derive(Debug, Clone)]
pub struct ZaberConnector {
    connect_timeout: Duration,
}

impl ZaberConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        ZaberConnector { connect_timeout }
    }
}

#[async_trait]
impl Connector for ZaberConnector {
    async fn open(&self, descriptor: &SessionDescriptor) -> Result<Box<dyn Transport>, ConnectError> {
        match descriptor.kind {
            TransportKind::ZaberAsciiTcp => {
                let stream = connect_tcp(&descriptor.address, self.connect_timeout)
                    .await
                    .map_err(|e| classify_io(&e))?;
                debug!(address = %descriptor.address, "TCP connection established");
                Ok(Box::new(ZaberTransport::new(BufStream::new(stream))))
            }
            TransportKind::ZaberAsciiSerial => {
                let port = open_serial(&descriptor.address, descriptor.baud_rate)
                    .map_err(|e| classify_serial(&e))?;
                debug!(path = %descriptor.address, baud = descriptor.baud_rate, "Serial port opened");
                Ok(Box::new(ZaberTransport::new(BufStream::new(port))))
            }
            TransportKind::Simulated => {
                warn!(port = %descriptor.port, "Zaber connector cannot open a simulated port");
                Err(ConnectError::NotFound)
            }
        }
    }
}

fn classify_io(error: &io::Error) -> ConnectError {
    match error.kind() {
        io::ErrorKind::TimedOut => ConnectError::Timeout,
        io::ErrorKind::PermissionDenied
        | io::ErrorKind::AddrInUse
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::ResourceBusy => ConnectError::PortBusy,
        _ => ConnectError::NotFound,
    }
}

fn classify_serial(error: &SerialError) -> ConnectError {
    match &error.kind {
        SerialErrorKind::Io(kind) => classify_io(&io::Error::from(*kind)),
        _ => ConnectError::NotFound,
    }
}

/// Zaber ASCII over any buffered byte stream.
pub struct ZaberTransport<S> {
    stream: S,
}

impl<S> ZaberTransport<S>
where
    S: AsyncBufRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        ZaberTransport { stream }
    }
}

fn map_exchange(error: ExchangeError) -> TransportError {
    match error {
        ExchangeError::Io(e) if e.kind() == io::ErrorKind::TimedOut => TransportError::Timeout,
        ExchangeError::Io(_) | ExchangeError::Closed => TransportError::Disconnected,
        ExchangeError::Parse(e) => {
            warn!(error = %e, "Malformed reply");
            TransportError::ProtocolError
        }
        ExchangeError::Rejected { device, reason } => {
            warn!(device, %reason, "Command rejected");
            TransportError::ProtocolError
        }
    }
}

#[async_trait]
impl<S> Transport for ZaberTransport<S>
where
    S: AsyncBufRead + AsyncWrite + Unpin + Send,
{
    async fn write_command(
        &mut self,
        binding: &AxisBinding,
        command: &WireCommand,
    ) -> Result<Ack, TransportError> {
        let device = ZaberDevice::new(binding.device, AXIS);
        let steps = binding.steps_per_unit;

        let speed = match *command {
            WireCommand::MoveAbsolute { speed, .. } => speed,
            WireCommand::SetSpeed { speed } => Some(speed),
            WireCommand::Home | WireCommand::Stop => None,
        };
        if let Some(speed) = speed {
            device
                .set_max_speed(&mut self.stream, zaber::speed_to_native(speed, steps))
                .await
                .map_err(map_exchange)?;
        }

        let result = match *command {
            WireCommand::MoveAbsolute { position, .. } => {
                device
                    .move_absolute(&mut self.stream, zaber::to_native(position, steps))
                    .await
            }
            WireCommand::Home => device.home(&mut self.stream).await,
            WireCommand::Stop => device.stop(&mut self.stream).await,
            WireCommand::SetSpeed { .. } => return Ok(Ack),
        };
        result.map(|_| Ack).map_err(map_exchange)
    }

    async fn read_status(&mut self, binding: &AxisBinding) -> Result<RawStatus, TransportError> {
        let device = ZaberDevice::new(binding.device, AXIS);
        let (steps, reply) = device
            .position(&mut self.stream)
            .await
            .map_err(map_exchange)?;

        Ok(RawStatus {
            position: zaber::from_native(steps, binding.steps_per_unit),
            moving: reply.busy,
            fault: reply.warning.is_fault(),
        })
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let replies = zaber::async_client::detect(&mut self.stream, DETECT_SETTLE)
            .await
            .map_err(map_exchange)?;

        Ok(replies
            .into_iter()
            .map(|reply| DiscoveredDevice {
                device: reply.device,
                detail: (!reply.warning.is_empty()).then(|| format!("{:?}", reply.warning)),
            })
            .collect())
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}
