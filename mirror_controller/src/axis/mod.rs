//! Per-axis controller.
//!
//! Each axis runs as its own task owning the authoritative [`AxisState`].
//! Commands are validated on submit, queued, and put on the wire one at a
//! time through the port's session. A motion command completes on the first
//! status poll issued after its acknowledgement that reports the axis idle.
//! Stop bypasses the queue and supersedes every older motion command.

mod queue;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{Instrument as _, debug, error, info, info_span, warn};

use crate::error::{Rejected, SubmitError, TransportError};
use crate::event_bus::{Event, EventBus};
use crate::models::{Accepted, AxisState, Command, FaultKind, MotionRequest, MotorInfo};
use crate::session::{Ack, PendingReply, RawStatus, SessionHandle, WireCommand};

use queue::{CommandQueue, Phase, completes_on_poll};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisSettings {
    /// A command still running after this long is abandoned and the axis stopped.
    pub motion_time_limit: Duration,
}

impl Default for AxisSettings {
    fn default() -> Self {
        AxisSettings {
            motion_time_limit: Duration::from_secs(60),
        }
    }
}

enum AxisMessage {
    Submit {
        command: Command,
        reply: oneshot::Sender<Result<Accepted, Rejected>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum Completion {
    Command {
        sequence: u64,
        result: Result<Ack, TransportError>,
    },
    Stop {
        sequence: Option<u64>,
        result: Result<Ack, TransportError>,
    },
    Poll {
        id: u64,
        result: Result<RawStatus, TransportError>,
    },
}

#[derive(Debug, Clone)]
pub struct AxisHandle {
    motor: Arc<MotorInfo>,
    tx: mpsc::UnboundedSender<AxisMessage>,
    state: watch::Receiver<AxisState>,
}

impl AxisHandle {
    pub fn spawn(
        motor: Arc<MotorInfo>,
        session: SessionHandle,
        bus: EventBus,
        settings: AxisSettings,
    ) -> AxisHandle {
        let (tx, messages) = mpsc::unbounded_channel();
        let (completions_tx, completions) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(AxisState::unknown());

        let controller = AxisController {
            speed: motor.speed,
            device_speed: None,
            motor: motor.clone(),
            settings,
            session,
            bus,
            state: AxisState::unknown(),
            published: AxisState::unknown(),
            state_tx,
            queue: CommandQueue::default(),
            completions: completions_tx,
            poll_in_flight: false,
            next_poll_id: 0,
            last_sample: None,
        };
        let span = info_span!("axis", axis = %motor.id);
        tokio::spawn(controller.run(messages, completions).instrument(span));

        AxisHandle { motor, tx, state }
    }

    pub fn motor(&self) -> &Arc<MotorInfo> {
        &self.motor
    }

    pub fn state(&self) -> AxisState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<AxisState> {
        self.state.clone()
    }

    /// Queues `command` and returns a receiver for the verdict. The command
    /// is ordered against other submissions at the moment this returns.
    pub fn enqueue(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<Result<Accepted, Rejected>>, SubmitError> {
        let (reply, verdict) = oneshot::channel();
        self.tx
            .send(AxisMessage::Submit { command, reply })
            .map_err(|_| SubmitError::Stopped)?;
        Ok(verdict)
    }

    pub async fn submit(&self, command: Command) -> Result<Accepted, SubmitError> {
        let verdict = self.enqueue(command)?;
        Ok(verdict.await.map_err(|_| SubmitError::Stopped)??)
    }

    /// Stops the axis if it is busy and ends the controller task.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.tx.send(AxisMessage::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }
}

struct AxisController {
    motor: Arc<MotorInfo>,
    settings: AxisSettings,
    session: SessionHandle,
    bus: EventBus,
    state: AxisState,
    /// Last state announced with `StatusChanged`.
    published: AxisState,
    state_tx: watch::Sender<AxisState>,
    queue: CommandQueue,
    completions: mpsc::UnboundedSender<Completion>,
    /// Speed used for moves that do not name one.
    speed: f64,
    /// Speed last written to the device, if known.
    device_speed: Option<f64>,
    poll_in_flight: bool,
    next_poll_id: u64,
    last_sample: Option<(Instant, f64)>,
}

impl AxisController {
    async fn run(
        mut self,
        mut messages: mpsc::UnboundedReceiver<AxisMessage>,
        mut completions: mpsc::UnboundedReceiver<Completion>,
    ) {
        let mut ticker = time::interval(self.motor.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(port = %self.motor.port, device = self.motor.device, "Axis controller started");

        loop {
            tokio::select! {
                biased;
                message = messages.recv() => match message {
                    Some(AxisMessage::Submit { command, reply }) => {
                        let verdict = self.submit(command);
                        let _ = reply.send(verdict);
                    }
                    Some(AxisMessage::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(completion) = completions.recv() => self.complete(completion),
                _ = ticker.tick() => self.tick(),
            }
            self.publish();
        }
    }

    fn submit(&mut self, command: Command) -> Result<Accepted, Rejected> {
        let accepted = Accepted {
            sequence: command.sequence,
        };
        if command.request.is_stop() {
            self.stop(command.sequence);
            return Ok(accepted);
        }

        let target = self.validate(&command.request).inspect_err(|rejected| {
            debug!(sequence = command.sequence, request = ?command.request, %rejected, "Command rejected");
        })?;
        debug!(sequence = command.sequence, request = ?command.request, "Command accepted");
        self.queue.push(command, target);
        self.start_next();
        Ok(accepted)
    }

    /// Checks a request against the axis and returns its absolute target.
    fn validate(&self, request: &MotionRequest) -> Result<Option<f64>, Rejected> {
        match *request {
            MotionRequest::MoveAbsolute { position, speed } => {
                self.ensure_healthy()?;
                self.check_speed(speed)?;
                self.check_target(position).map(Some)
            }
            MotionRequest::MoveRelative { distance, speed } => {
                self.ensure_healthy()?;
                self.check_speed(speed)?;
                let base = match self.queue.planned_position() {
                    Some(planned) => planned,
                    None if self.state.last_updated.is_some() => self.state.position,
                    None => return Err(Rejected::Unsupported),
                };
                self.check_target(base + distance).map(Some)
            }
            MotionRequest::Home if self.motor.homeable => Ok(Some(self.motor.home_position)),
            MotionRequest::Home => Err(Rejected::Unsupported),
            MotionRequest::SetSpeed { speed } => {
                self.check_speed(Some(speed))?;
                Ok(None)
            }
            MotionRequest::Stop => Ok(None),
        }
    }

    fn ensure_healthy(&self) -> Result<(), Rejected> {
        match self.state.fault {
            Some(_) => Err(Rejected::AxisFaulted),
            None => Ok(()),
        }
    }

    fn check_target(&self, target: f64) -> Result<f64, Rejected> {
        if self.motor.limits.contains(target) {
            Ok(target)
        } else {
            Err(Rejected::OutOfRange)
        }
    }

    fn check_speed(&self, speed: Option<f64>) -> Result<(), Rejected> {
        match speed {
            None => Ok(()),
            Some(speed) if !speed.is_finite() || speed <= 0.0 => Err(Rejected::OutOfRange),
            Some(speed) if self.motor.max_speed.is_some_and(|max| speed > max) => {
                Err(Rejected::OutOfRange)
            }
            Some(_) => Ok(()),
        }
    }

    fn stop(&mut self, sequence: u64) {
        let superseded = self.queue.supersede_motion_before(sequence);
        if !superseded.is_empty() {
            info!(sequence, ?superseded, "Stop superseded queued commands");
        }
        self.send_stop(Some(sequence));
        self.release_superseded();
    }

    fn release_superseded(&mut self) {
        if let Some(released) = self.queue.release_superseded() {
            debug!(sequence = released.command.sequence, "Released superseded command");
            self.start_next();
        }
    }

    fn send_stop(&mut self, sequence: Option<u64>) {
        let reply = self.session.send(&self.motor.id, WireCommand::Stop);
        self.forward(reply, move |result| Completion::Stop { sequence, result });
    }

    fn start_next(&mut self) {
        let Some(in_flight) = self.queue.start_next(Instant::now()) else {
            return;
        };
        let (sequence, request, target) = (
            in_flight.command.sequence,
            in_flight.command.request,
            in_flight.target,
        );

        let wire = match (request, target) {
            (
                MotionRequest::MoveAbsolute { speed, .. } | MotionRequest::MoveRelative { speed, .. },
                Some(position),
            ) => self.move_to(position, speed),
            (MotionRequest::Home, _) => WireCommand::Home,
            (MotionRequest::SetSpeed { speed }, _) => {
                self.device_speed = Some(speed);
                WireCommand::SetSpeed { speed }
            }
            _ => {
                warn!(sequence, ?request, "Command cannot be sent, dropping it");
                self.queue.finish();
                return self.start_next();
            }
        };

        debug!(sequence, command = ?wire, "Sending command");
        let reply = self.session.send(&self.motor.id, wire);
        self.forward(reply, move |result| Completion::Command { sequence, result });
    }

    /// Absolute move that only carries a speed when it differs from the one
    /// last written to the device.
    fn move_to(&mut self, position: f64, speed: Option<f64>) -> WireCommand {
        let speed = speed.unwrap_or(self.speed);
        let changed = self.device_speed != Some(speed);
        self.device_speed = Some(speed);
        WireCommand::MoveAbsolute {
            position,
            speed: changed.then_some(speed),
        }
    }

    fn forward<T, F>(&self, reply: PendingReply<T>, wrap: F)
    where
        T: Send + 'static,
        F: FnOnce(Result<T, TransportError>) -> Completion + Send + 'static,
    {
        let completions = self.completions.clone();
        tokio::spawn(async move {
            let result = reply.await;
            let _ = completions.send(wrap(result));
        });
    }

    fn tick(&mut self) {
        self.check_time_limit();
        if self.poll_in_flight {
            return;
        }
        self.poll_in_flight = true;
        let id = self.next_poll_id;
        self.next_poll_id += 1;

        let reply = self.session.poll(&self.motor.id);
        self.forward(reply, move |result| Completion::Poll { id, result });
    }

    fn check_time_limit(&mut self) {
        let Some(in_flight) = self.queue.in_flight() else {
            return;
        };
        if in_flight.started_at.elapsed() <= self.settings.motion_time_limit {
            return;
        }

        warn!(
            sequence = in_flight.command.sequence,
            limit = ?self.settings.motion_time_limit,
            "Command exceeded its time limit, stopping axis"
        );
        self.queue.finish();
        self.state.last_error = Some(TransportError::Timeout);
        self.send_stop(None);
        self.start_next();
    }

    fn complete(&mut self, completion: Completion) {
        match completion {
            Completion::Command { sequence, result } => self.on_command_result(sequence, result),
            Completion::Stop { sequence, result } => self.on_stop_result(sequence, result),
            Completion::Poll { id, result } => {
                self.poll_in_flight = false;
                match result {
                    Ok(status) => self.on_status(id, status),
                    Err(error) => self.on_poll_error(error),
                }
            }
        }
    }

    fn on_command_result(&mut self, sequence: u64, result: Result<Ack, TransportError>) {
        let Some(in_flight) = self
            .queue
            .in_flight_mut()
            .filter(|in_flight| in_flight.command.sequence == sequence)
        else {
            debug!(sequence, "Ignoring completion of a command no longer in flight");
            return;
        };
        let superseded = in_flight.superseded;
        let request = in_flight.command.request;

        match result {
            Ok(Ack) if superseded => {
                debug!(sequence, "Superseded command acknowledged");
                if let MotionRequest::SetSpeed { speed } = request {
                    self.speed = speed;
                }
                self.queue.finish();
                self.start_next();
            }
            Ok(Ack) if completes_on_poll(&request) => {
                in_flight.phase = Phase::Executing {
                    poll_watermark: self.next_poll_id,
                };
            }
            Ok(Ack) => {
                if let MotionRequest::SetSpeed { speed } = request {
                    self.speed = speed;
                }
                self.queue.finish();
                self.apply(sequence);
                self.start_next();
            }
            Err(error) => {
                self.queue.finish();
                let dropped = self.queue.supersede_all();
                warn!(sequence, %error, ?dropped, "Command failed, dropping queued commands");
                self.device_speed = None;
                self.state.last_error = Some(error);
                if error == TransportError::ProtocolError {
                    self.latch_fault(FaultKind::Protocol);
                }
            }
        }
    }

    fn on_stop_result(&mut self, sequence: Option<u64>, result: Result<Ack, TransportError>) {
        match result {
            Ok(Ack) => {
                if let Some(sequence) = sequence {
                    self.apply(sequence);
                }
            }
            Err(error) => {
                warn!(?sequence, %error, "Stop could not be delivered");
                self.state.last_error = Some(error);
            }
        }
    }

    fn on_status(&mut self, id: u64, status: RawStatus) {
        let now = Instant::now();
        self.state.velocity = match self.last_sample {
            Some((at, position)) if status.moving && now > at => {
                (status.position - position) / (now - at).as_secs_f64()
            }
            _ => 0.0,
        };
        self.last_sample = Some((now, status.position));

        if self.state.stale && self.state.last_updated.is_some() {
            info!(position = status.position, "Status polling recovered");
        }
        self.state.position = status.position;
        self.state.moving = status.moving;
        self.state.stale = false;
        self.state.last_updated = Some(now);
        self.state.last_error = None;

        self.check_completion(id, status.moving);

        // homing passes through the device zero, which may lie outside the limits
        if status.fault {
            self.latch_fault(FaultKind::Hardware);
        } else if !self.queue.homing()
            && !self
                .motor
                .limits
                .contains_within(status.position, self.motor.position_tolerance())
        {
            self.latch_fault(FaultKind::OutOfLimits);
        }

        self.start_next();
    }

    fn check_completion(&mut self, id: u64, moving: bool) {
        let away_from_home = (self.state.position - self.motor.home_position).abs()
            > self.motor.position_tolerance();
        let Some(in_flight) = self.queue.in_flight_mut() else {
            return;
        };
        let Phase::Executing { poll_watermark } = in_flight.phase else {
            return;
        };
        if moving || id < poll_watermark {
            return;
        }

        if in_flight.command.request == MotionRequest::Home
            && !in_flight.superseded
            && !in_flight.returning_home
            && away_from_home
        {
            in_flight.returning_home = true;
            in_flight.phase = Phase::AwaitingAck;
            let sequence = in_flight.command.sequence;
            let wire = self.move_to(self.motor.home_position, None);
            debug!(sequence, command = ?wire, "Device zero reached, moving to home position");
            let reply = self.session.send(&self.motor.id, wire);
            self.forward(reply, move |result| Completion::Command { sequence, result });
            return;
        }

        let Some(done) = self.queue.finish() else {
            return;
        };
        if done.superseded {
            return;
        }

        if done.command.request == MotionRequest::Home {
            self.state.homed = true;
            if let Some(fault) = self.state.fault.take() {
                info!(?fault, "Fault cleared by homing");
            }
        }
        debug!(
            sequence = done.command.sequence,
            position = self.state.position,
            "Command completed"
        );
        self.apply(done.command.sequence);
    }

    fn on_poll_error(&mut self, error: TransportError) {
        if !self.state.stale {
            warn!(%error, "Status poll failed, state is stale");
        }
        self.state.stale = true;
        self.state.velocity = 0.0;
        self.state.last_error = Some(error);
        self.last_sample = None;

        if error == TransportError::ProtocolError {
            self.latch_fault(FaultKind::Protocol);
        }
    }

    fn latch_fault(&mut self, fault: FaultKind) {
        if self.state.fault.is_some() {
            return;
        }
        self.state.fault = Some(fault);
        let busy = !self.queue.is_idle() || self.state.moving;
        let superseded = self.queue.supersede_all();
        error!(?fault, position = self.state.position, ?superseded, "Axis fault latched");

        self.release_superseded();
        if busy {
            self.send_stop(None);
        }
        self.bus.publish(Event::AxisFault {
            axis: self.motor.id.clone(),
            fault,
            state: self.state.clone(),
        });
    }

    fn apply(&mut self, sequence: u64) {
        if sequence > self.state.applied_sequence {
            self.state.applied_sequence = sequence;
        } else {
            debug!(sequence, applied = self.state.applied_sequence, "Stale completion ignored");
        }
    }

    fn publish(&mut self) {
        if self.state.differs_from(&self.published) {
            self.published = self.state.clone();
            self.bus.publish(Event::StatusChanged {
                axis: self.motor.id.clone(),
                state: self.state.clone(),
            });
        }
        if *self.state_tx.borrow() != self.state {
            self.state_tx.send_replace(self.state.clone());
        }
    }

    async fn shutdown(&mut self) {
        let busy = !self.queue.is_idle() || self.state.moving;
        self.queue.supersede_all();
        if busy {
            if let Err(error) = self.session.send(&self.motor.id, WireCommand::Stop).await {
                warn!(%error, "Failed to stop axis on shutdown");
            }
        }
        info!("Axis controller stopped");
    }
}
