//! One device session per physical port.
//!
//! A session owns the transport for its port and runs it from a single task.
//! Requests from every axis on the port queue up in one channel and are
//! answered strictly in arrival order, so exchanges never interleave on the
//! wire. Any transport failure drops the connection and schedules a
//! reconnect with exponential backoff; until it succeeds every request fails
//! fast with [`TransportError::Disconnected`].

mod transport;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant};
use tracing::{debug, info, instrument, warn};
use utilities::backoff::{Backoff, BackoffPolicy};

use crate::error::{ConnectError, TransportError};
use crate::event_bus::{Event, EventBus};
use crate::models::{AxisId, MotorInfo};

pub use transport::{
    Ack, Connector, DiscoveredDevice, RawStatus, Transport, TransportKind, WireCommand,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionHealth {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Where and how to reach one chain of devices.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescriptor {
    pub port: String,
    pub kind: TransportKind,
    /// `host:port` for TCP, device path for serial.
    pub address: String,
    pub baud_rate: u32,
}

/// What a transport needs to know to address one axis.
#[derive(Debug, Clone, PartialEq)]
pub struct AxisBinding {
    pub axis: AxisId,
    pub device: u8,
    pub steps_per_unit: f64,
}

impl From<&MotorInfo> for AxisBinding {
    fn from(motor: &MotorInfo) -> Self {
        AxisBinding {
            axis: motor.id.clone(),
            device: motor.device,
            steps_per_unit: motor.steps_per_unit,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SessionSettings {
    fn default() -> Self {
        SessionSettings {
            connect_timeout: Duration::from_secs(2),
            io_timeout: Duration::from_millis(500),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Everything a session needs besides its descriptor.
#[derive(Clone)]
pub struct SessionContext {
    pub connector: Arc<dyn Connector>,
    pub settings: SessionSettings,
    pub bus: EventBus,
}

type Responder<T> = oneshot::Sender<Result<T, TransportError>>;

enum SessionRequest {
    Send {
        axis: AxisId,
        command: WireCommand,
        reply: Responder<Ack>,
    },
    Poll {
        axis: AxisId,
        reply: Responder<RawStatus>,
    },
    Discover {
        reply: Responder<Vec<DiscoveredDevice>>,
    },
    Attach(AxisBinding),
    Detach(AxisId),
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Reply to a queued session request. The request is already queued when
/// the future is created, awaiting it only waits for the answer.
pub struct PendingReply<T> {
    rx: Option<oneshot::Receiver<Result<T, TransportError>>>,
}

impl<T> Unpin for PendingReply<T> {}

impl<T> Future for PendingReply<T> {
    type Output = Result<T, TransportError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match self.get_mut().rx.as_mut() {
            Some(rx) => Pin::new(rx)
                .poll(cx)
                .map(|reply| reply.unwrap_or(Err(TransportError::Disconnected))),
            None => Poll::Ready(Err(TransportError::Disconnected)),
        }
    }
}

/// Cloneable handle to a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    port: Arc<str>,
    tx: mpsc::UnboundedSender<SessionRequest>,
    health: watch::Receiver<SessionHealth>,
}

impl SessionHandle {
    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn health(&self) -> SessionHealth {
        *self.health.borrow()
    }

    pub fn watch_health(&self) -> watch::Receiver<SessionHealth> {
        self.health.clone()
    }

    pub fn send(&self, axis: &AxisId, command: WireCommand) -> PendingReply<Ack> {
        self.request(|reply| SessionRequest::Send {
            axis: axis.clone(),
            command,
            reply,
        })
    }

    pub fn poll(&self, axis: &AxisId) -> PendingReply<RawStatus> {
        self.request(|reply| SessionRequest::Poll {
            axis: axis.clone(),
            reply,
        })
    }

    pub fn discover(&self) -> PendingReply<Vec<DiscoveredDevice>> {
        self.request(|reply| SessionRequest::Discover { reply })
    }

    pub fn attach(&self, binding: AxisBinding) {
        let _ = self.tx.send(SessionRequest::Attach(binding));
    }

    pub fn detach(&self, axis: &AxisId) {
        let _ = self.tx.send(SessionRequest::Detach(axis.clone()));
    }

    /// Closes the transport and stops reconnecting. Requests made afterwards
    /// fail with `Disconnected`.
    pub async fn close(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(SessionRequest::Close { reply }).is_ok() {
            let _ = done.await;
        }
    }

    fn request<T>(&self, build: impl FnOnce(Responder<T>) -> SessionRequest) -> PendingReply<T> {
        let (reply, rx) = oneshot::channel();
        let queued = self.tx.send(build(reply)).is_ok();
        PendingReply {
            rx: queued.then_some(rx),
        }
    }
}

/// Opens a session, failing if the first connection attempt fails.
#[instrument(skip_all, fields(port = %descriptor.port))]
pub async fn open(
    descriptor: SessionDescriptor,
    bindings: Vec<AxisBinding>,
    context: SessionContext,
) -> Result<SessionHandle, ConnectError> {
    let transport = connect(&context, &descriptor).await?;
    info!("Session connected");
    Ok(spawn(descriptor, bindings, context, Some(transport)))
}

/// Opens a session that keeps retrying in the background if the first
/// connection attempt fails.
#[instrument(skip_all, fields(port = %descriptor.port))]
pub async fn open_or_retry(
    descriptor: SessionDescriptor,
    bindings: Vec<AxisBinding>,
    context: SessionContext,
) -> SessionHandle {
    match connect(&context, &descriptor).await {
        Ok(transport) => {
            info!("Session connected");
            spawn(descriptor, bindings, context, Some(transport))
        }
        Err(error) => {
            warn!(%error, "Initial connection failed, retrying in background");
            spawn(descriptor, bindings, context, None)
        }
    }
}

async fn connect(
    context: &SessionContext,
    descriptor: &SessionDescriptor,
) -> Result<Box<dyn Transport>, ConnectError> {
    time::timeout(
        context.settings.connect_timeout,
        context.connector.open(descriptor),
    )
    .await
    .unwrap_or(Err(ConnectError::Timeout))
}

fn spawn(
    descriptor: SessionDescriptor,
    bindings: Vec<AxisBinding>,
    context: SessionContext,
    transport: Option<Box<dyn Transport>>,
) -> SessionHandle {
    let initial = if transport.is_some() {
        SessionHealth::Connected
    } else {
        SessionHealth::Reconnecting
    };
    let (health_tx, health_rx) = watch::channel(initial);
    let (tx, rx) = mpsc::unbounded_channel();
    let port: Arc<str> = Arc::from(descriptor.port.as_str());

    context.bus.publish(Event::SessionHealthChanged {
        port: descriptor.port.clone(),
        health: initial,
    });

    let mut worker = SessionWorker {
        backoff: Backoff::new(context.settings.backoff),
        descriptor,
        context,
        transport,
        bindings: bindings
            .into_iter()
            .map(|binding| (binding.axis.clone(), binding))
            .collect(),
        retry_at: None,
        health: health_tx,
    };
    if worker.transport.is_none() {
        worker.schedule_retry();
    }
    tokio::spawn(worker.run(rx));

    SessionHandle {
        port,
        tx,
        health: health_rx,
    }
}

struct SessionWorker {
    descriptor: SessionDescriptor,
    context: SessionContext,
    transport: Option<Box<dyn Transport>>,
    bindings: HashMap<AxisId, AxisBinding>,
    backoff: Backoff,
    retry_at: Option<Instant>,
    health: watch::Sender<SessionHealth>,
}

impl SessionWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SessionRequest>) {
        loop {
            let retry_at = self.retry_at;
            tokio::select! {
                request = rx.recv() => match request {
                    Some(SessionRequest::Close { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(request) => self.handle(request).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                _ = time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    self.reconnect().await;
                }
            }
        }
        debug!(port = %self.descriptor.port, "Session stopped");
    }

    async fn handle(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Send {
                axis,
                command,
                reply,
            } => {
                let result = self.send(&axis, &command).await;
                let _ = reply.send(result);
            }
            SessionRequest::Poll { axis, reply } => {
                let result = self.poll(&axis).await;
                let _ = reply.send(result);
            }
            SessionRequest::Discover { reply } => {
                let result = self.discover().await;
                let _ = reply.send(result);
            }
            SessionRequest::Attach(binding) => {
                debug!(port = %self.descriptor.port, axis = %binding.axis, "Axis attached");
                self.bindings.insert(binding.axis.clone(), binding);
            }
            SessionRequest::Detach(axis) => {
                debug!(port = %self.descriptor.port, %axis, "Axis detached");
                self.bindings.remove(&axis);
            }
            SessionRequest::Close { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    fn binding(&self, axis: &AxisId) -> Result<AxisBinding, TransportError> {
        self.bindings.get(axis).cloned().ok_or_else(|| {
            warn!(port = %self.descriptor.port, %axis, "Request for an axis not bound to this session");
            TransportError::ProtocolError
        })
    }

    async fn send(&mut self, axis: &AxisId, command: &WireCommand) -> Result<Ack, TransportError> {
        let binding = self.binding(axis)?;
        let io_timeout = self.context.settings.io_timeout;
        let transport = self.transport.as_mut().ok_or(TransportError::Disconnected)?;

        debug!(port = %self.descriptor.port, %axis, ?command, "Sending command");
        let result = time::timeout(io_timeout, transport.write_command(&binding, command))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        self.check(result).await
    }

    async fn poll(&mut self, axis: &AxisId) -> Result<RawStatus, TransportError> {
        let binding = self.binding(axis)?;
        let io_timeout = self.context.settings.io_timeout;
        let transport = self.transport.as_mut().ok_or(TransportError::Disconnected)?;

        let result = time::timeout(io_timeout, transport.read_status(&binding))
            .await
            .unwrap_or(Err(TransportError::Timeout));
        self.check(result).await
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        let io_timeout = self.context.settings.io_timeout.max(Duration::from_secs(2));
        let transport = self.transport.as_mut().ok_or(TransportError::Disconnected)?;

        let result = time::timeout(io_timeout, transport.discover())
            .await
            .unwrap_or(Err(TransportError::Timeout));
        self.check(result).await
    }

    async fn check<T>(&mut self, result: Result<T, TransportError>) -> Result<T, TransportError> {
        if let Err(error) = &result {
            self.fail(*error).await;
        }
        result
    }

    async fn fail(&mut self, error: TransportError) {
        warn!(port = %self.descriptor.port, %error, "Transport failure, dropping connection");
        self.drop_transport().await;
        self.set_health(SessionHealth::Disconnected);
        self.set_health(SessionHealth::Reconnecting);
        self.schedule_retry();
    }

    fn schedule_retry(&mut self) {
        let delay = self.backoff.next_delay();
        debug!(port = %self.descriptor.port, ?delay, attempt = self.backoff.attempt(), "Scheduling reconnect");
        self.retry_at = Some(Instant::now() + delay);
    }

    async fn reconnect(&mut self) {
        self.retry_at = None;
        match connect(&self.context, &self.descriptor).await {
            Ok(transport) => {
                info!(port = %self.descriptor.port, attempts = self.backoff.attempt(), "Session reconnected");
                self.transport = Some(transport);
                self.backoff.reset();
                self.set_health(SessionHealth::Connected);
            }
            Err(error) => {
                warn!(port = %self.descriptor.port, %error, "Reconnect failed");
                self.schedule_retry();
            }
        }
    }

    async fn shutdown(&mut self) {
        self.retry_at = None;
        self.drop_transport().await;
        self.set_health(SessionHealth::Disconnected);
        info!(port = %self.descriptor.port, "Session closed");
    }

    async fn drop_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            let _ = time::timeout(self.context.settings.io_timeout, transport.close()).await;
        }
    }

    fn set_health(&mut self, health: SessionHealth) {
        if *self.health.borrow() == health {
            return;
        }
        self.health.send_replace(health);
        self.context.bus.publish(Event::SessionHealthChanged {
            port: self.descriptor.port.clone(),
            health,
        });
    }
}
