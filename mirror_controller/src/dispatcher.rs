//! Front door for motion requests.
//!
//! The dispatcher resolves an axis, allocates the next per-axis sequence
//! number and hands the command to the axis controller in one step, so
//! sequence order and queue order always agree.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tokio::sync::{oneshot, watch};
use tokio::time::Instant;
use tracing::{info, instrument, warn};

use crate::axis::{AxisHandle, AxisSettings};
use crate::error::{DispatchError, Rejected, RegistryError, TransportError};
use crate::event_bus::{EventBus, EventStream};
use crate::interlock::{self, Interlock};
use crate::models::{Accepted, AxisId, AxisState, Command, CommandId, MotionRequest, MotorInfo};
use crate::registry::MotorRegistry;
use crate::session::{
    self, AxisBinding, Connector, DiscoveredDevice, SessionContext, SessionDescriptor,
    SessionHandle, SessionHealth, SessionSettings,
};

#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherSettings {
    pub session: SessionSettings,
    pub axis: AxisSettings,
    pub event_buffer: usize,
    pub interlocks: Vec<Interlock>,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        DispatcherSettings {
            session: SessionSettings::default(),
            axis: AxisSettings::default(),
            event_buffer: 256,
            interlocks: Vec::new(),
        }
    }
}

type Verdict = oneshot::Receiver<Result<Accepted, Rejected>>;

struct AxisEntry {
    handle: AxisHandle,
    session: SessionHandle,
    last_sequence: Mutex<u64>,
}

impl AxisEntry {
    fn new(handle: AxisHandle, session: SessionHandle) -> Self {
        AxisEntry {
            handle,
            session,
            last_sequence: Mutex::new(0),
        }
    }

    fn enqueue(&self, request: MotionRequest) -> Result<(u64, Verdict), DispatchError> {
        let mut last = self
            .last_sequence
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let sequence = *last + 1;
        let verdict = self.handle.enqueue(Command {
            axis: self.handle.motor().id.clone(),
            request,
            sequence,
            submitted_at: Instant::now(),
        })?;
        *last = sequence;
        Ok((sequence, verdict))
    }
}

async fn settle(verdict: Verdict) -> Result<Accepted, DispatchError> {
    Ok(verdict.await.map_err(|_| DispatchError::UnknownAxis)??)
}

pub struct Dispatcher {
    registry: RwLock<MotorRegistry>,
    axes: RwLock<HashMap<AxisId, Arc<AxisEntry>>>,
    sessions: HashMap<String, SessionHandle>,
    bus: EventBus,
    axis_settings: AxisSettings,
    interlocks: Vec<Interlock>,
}

impl Dispatcher {
    /// Opens one session per port and starts a controller for every motor.
    /// Ports that fail to connect keep retrying in the background.
    pub async fn start<F>(
        registry: MotorRegistry,
        ports: Vec<SessionDescriptor>,
        connector_for: F,
        settings: DispatcherSettings,
    ) -> Result<Self, RegistryError>
    where
        F: Fn(&SessionDescriptor) -> Arc<dyn Connector>,
    {
        if let Some(motor) = registry
            .iter()
            .find(|motor| !ports.iter().any(|port| port.port == motor.port))
        {
            return Err(RegistryError::UnknownPort {
                axis: motor.id.clone(),
                port: motor.port.clone(),
            });
        }

        let bus = EventBus::new(settings.event_buffer);
        let mut sessions = HashMap::new();
        for descriptor in ports {
            let bindings = registry
                .on_port(&descriptor.port)
                .map(|motor| AxisBinding::from(motor.as_ref()))
                .collect();
            let context = SessionContext {
                connector: connector_for(&descriptor),
                settings: settings.session.clone(),
                bus: bus.clone(),
            };
            let port = descriptor.port.clone();
            let handle = session::open_or_retry(descriptor, bindings, context).await;
            sessions.insert(port, handle);
        }

        let mut axes = HashMap::new();
        for motor in registry.iter() {
            if let Some(session) = sessions.get(&motor.port) {
                let handle =
                    AxisHandle::spawn(motor.clone(), session.clone(), bus.clone(), settings.axis);
                axes.insert(
                    motor.id.clone(),
                    Arc::new(AxisEntry::new(handle, session.clone())),
                );
            }
        }
        info!(axes = axes.len(), sessions = sessions.len(), "Dispatcher started");

        Ok(Dispatcher {
            registry: RwLock::new(registry),
            axes: RwLock::new(axes),
            sessions,
            bus,
            axis_settings: settings.axis,
            interlocks: settings.interlocks,
        })
    }

    fn entry(&self, axis: &AxisId) -> Result<Arc<AxisEntry>, DispatchError> {
        self.axes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(axis)
            .cloned()
            .ok_or(DispatchError::UnknownAxis)
    }

    /// Validates and queues a request. Returns once the axis controller has
    /// accepted or rejected it, not when the motion completes.
    #[instrument(skip(self), level = "debug")]
    pub async fn dispatch(
        &self,
        axis: &AxisId,
        request: MotionRequest,
    ) -> Result<CommandId, DispatchError> {
        if request.is_stop() {
            return self.cancel(axis).await;
        }

        let entry = self.entry(axis)?;
        if entry.session.health() != SessionHealth::Connected {
            return Err(DispatchError::SessionDown);
        }
        let (sequence, verdict) = entry.enqueue(request)?;
        settle(verdict).await?;

        Ok(CommandId {
            axis: axis.clone(),
            sequence,
        })
    }

    /// Stops the axis, superseding everything queued before. The queue is
    /// cleared even when the session is down, in which case `SessionDown`
    /// reports that the stage itself could not be told to stop.
    #[instrument(skip(self), level = "debug")]
    pub async fn cancel(&self, axis: &AxisId) -> Result<CommandId, DispatchError> {
        let entry = self.entry(axis)?;
        let connected = entry.session.health() == SessionHealth::Connected;
        let (sequence, verdict) = entry.enqueue(MotionRequest::Stop)?;
        settle(verdict).await?;

        if !connected {
            warn!(%axis, "Stop queued while session is down");
            return Err(DispatchError::SessionDown);
        }
        Ok(CommandId {
            axis: axis.clone(),
            sequence,
        })
    }

    pub fn state(&self, axis: &AxisId) -> Result<AxisState, DispatchError> {
        Ok(self.entry(axis)?.handle.state())
    }

    pub fn watch_state(&self, axis: &AxisId) -> Result<watch::Receiver<AxisState>, DispatchError> {
        Ok(self.entry(axis)?.handle.watch_state())
    }

    /// Every axis with its state, in registration order.
    pub fn states(&self) -> Vec<(AxisId, AxisState)> {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        let axes = self.axes.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .iter()
            .filter_map(|motor| {
                axes.get(&motor.id)
                    .map(|entry| (motor.id.clone(), entry.handle.state()))
            })
            .collect()
    }

    pub fn motors(&self) -> Vec<Arc<MotorInfo>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn motor(&self, axis: &AxisId) -> Option<Arc<MotorInfo>> {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(axis)
            .cloned()
    }

    pub fn session_health(&self, port: &str) -> Option<SessionHealth> {
        self.sessions.get(port).map(SessionHandle::health)
    }

    pub fn watch_session(&self, port: &str) -> Option<watch::Receiver<SessionHealth>> {
        self.sessions.get(port).map(SessionHandle::watch_health)
    }

    pub fn subscribe(&self) -> EventStream {
        self.bus.subscribe()
    }

    /// Lists the devices answering on `port`. An unknown port reads as
    /// disconnected.
    pub async fn discover(&self, port: &str) -> Result<Vec<DiscoveredDevice>, TransportError> {
        match self.sessions.get(port) {
            Some(session) => session.discover().await,
            None => Err(TransportError::Disconnected),
        }
    }

    /// Last known position of every axis that has reported at least once.
    pub fn positions(&self) -> HashMap<AxisId, f64> {
        self.states()
            .into_iter()
            .filter(|(_, state)| state.last_updated.is_some())
            .map(|(axis, state)| (axis, state.position))
            .collect()
    }

    /// Interlocks matched by the current positions.
    pub fn interlock_matches(&self) -> Vec<Interlock> {
        interlock::evaluate(&self.interlocks, &self.positions())
            .into_iter()
            .cloned()
            .collect()
    }

    /// Registers a motor at runtime on an already configured port.
    pub fn add_axis(&self, motor: MotorInfo) -> Result<Arc<MotorInfo>, RegistryError> {
        let session = self
            .sessions
            .get(&motor.port)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownPort {
                axis: motor.id.clone(),
                port: motor.port.clone(),
            })?;

        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let mut axes = self.axes.write().unwrap_or_else(PoisonError::into_inner);
        let motor = registry.insert(motor)?;

        session.attach(AxisBinding::from(motor.as_ref()));
        let handle = AxisHandle::spawn(
            motor.clone(),
            session.clone(),
            self.bus.clone(),
            self.axis_settings,
        );
        axes.insert(motor.id.clone(), Arc::new(AxisEntry::new(handle, session)));
        info!(axis = %motor.id, port = %motor.port, "Axis added");
        Ok(motor)
    }

    /// Stops and unregisters an axis. Requests already holding the axis see
    /// `UnknownAxis` once its controller has stopped.
    pub async fn remove_axis(&self, axis: &AxisId) -> Result<Arc<MotorInfo>, DispatchError> {
        let entry = {
            let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
            let mut axes = self.axes.write().unwrap_or_else(PoisonError::into_inner);
            let entry = axes.remove(axis).ok_or(DispatchError::UnknownAxis)?;
            let _ = registry.remove(axis);
            entry
        };

        entry.handle.shutdown().await;
        entry.session.detach(axis);
        info!(%axis, "Axis removed");
        Ok(entry.handle.motor().clone())
    }

    /// Stops every axis and closes every session.
    pub async fn shutdown(&self) {
        let entries: Vec<_> = self
            .axes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for entry in entries {
            entry.handle.shutdown().await;
        }
        for session in self.sessions.values() {
            session.close().await;
        }
        info!("Dispatcher stopped");
    }
}
