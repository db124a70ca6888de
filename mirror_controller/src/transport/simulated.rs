//! In-memory device chain used by the `simulated` port kind and by tests.
//!
//! Every move takes a fixed number of status polls to complete, reporting
//! evenly spaced intermediate positions. Failures can be scripted per call
//! and every exchange is recorded with its start and end time.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{self, Instant};

use crate::error::{ConnectError, TransportError};
use crate::session::{
    Ack, AxisBinding, Connector, DiscoveredDevice, RawStatus, SessionDescriptor, Transport,
    WireCommand,
};

/// One exchange as seen by the simulated chain. Polls have no command.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub device: u8,
    pub command: Option<WireCommand>,
    pub started: Instant,
    pub finished: Instant,
}

#[derive(Debug, Clone, Default)]
struct SimDevice {
    position: f64,
    start: f64,
    target: f64,
    travel: u32,
    polls_left: u32,
    speed: Option<f64>,
    fault: bool,
}

impl SimDevice {
    fn begin_move(&mut self, target: f64, travel: u32) {
        self.start = self.position;
        self.target = target;
        self.travel = travel;
        self.polls_left = travel;
        if travel == 0 {
            self.position = target;
        }
    }

    fn advance(&mut self) -> bool {
        if self.polls_left == 0 {
            return false;
        }
        self.polls_left -= 1;
        let done = f64::from(self.travel - self.polls_left);
        self.position = self.start + (self.target - self.start) * done / f64::from(self.travel);
        true
    }
}

struct ChainState {
    devices: BTreeMap<u8, SimDevice>,
    travel_polls: u32,
    io_latency: Duration,
    connect_latency: Duration,
    connect_failures: VecDeque<ConnectError>,
    poll_failures: VecDeque<TransportError>,
    command_failures: VecDeque<TransportError>,
    wire_log: Vec<WireRecord>,
    opens: u32,
}

impl ChainState {
    fn device(&mut self, device: u8) -> &mut SimDevice {
        self.devices.entry(device).or_default()
    }

    fn apply(&mut self, device: u8, command: &WireCommand) {
        let travel = self.travel_polls;
        let dev = self.device(device);
        match *command {
            WireCommand::MoveAbsolute { position, speed } => {
                dev.speed = speed.or(dev.speed);
                dev.begin_move(position, travel);
            }
            WireCommand::Home => {
                dev.begin_move(0.0, travel);
                dev.fault = false;
            }
            WireCommand::Stop => {
                dev.polls_left = 0;
                dev.target = dev.position;
            }
            WireCommand::SetSpeed { speed } => dev.speed = Some(speed),
        }
    }
}

#[derive(Clone)]
pub struct SimulatedChain {
    state: Arc<Mutex<ChainState>>,
}

impl Default for SimulatedChain {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedChain {
    pub fn new() -> Self {
        SimulatedChain {
            state: Arc::new(Mutex::new(ChainState {
                devices: BTreeMap::new(),
                travel_polls: 3,
                io_latency: Duration::ZERO,
                connect_latency: Duration::ZERO,
                connect_failures: VecDeque::new(),
                poll_failures: VecDeque::new(),
                command_failures: VecDeque::new(),
                wire_log: Vec::new(),
                opens: 0,
            })),
        }
    }

    /// Number of polls a move needs before the device reports idle.
    pub fn with_travel_polls(self, polls: u32) -> Self {
        self.lock().travel_polls = polls;
        self
    }

    pub fn with_io_latency(self, latency: Duration) -> Self {
        self.lock().io_latency = latency;
        self
    }

    pub fn with_connect_latency(self, latency: Duration) -> Self {
        self.lock().connect_latency = latency;
        self
    }

    pub fn with_device(self, device: u8, position: f64) -> Self {
        self.set_position(device, position);
        self
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Teleports a device, cancelling any motion.
    pub fn set_position(&self, device: u8, position: f64) {
        let mut state = self.lock();
        let dev = state.device(device);
        dev.position = position;
        dev.target = position;
        dev.polls_left = 0;
    }

    pub fn position(&self, device: u8) -> f64 {
        self.lock().device(device).position
    }

    pub fn speed(&self, device: u8) -> Option<f64> {
        self.lock().device(device).speed
    }

    pub fn set_fault(&self, device: u8, fault: bool) {
        self.lock().device(device).fault = fault;
    }

    pub fn fail_connects(&self, error: ConnectError, count: usize) {
        self.lock().connect_failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_polls(&self, error: TransportError, count: usize) {
        self.lock().poll_failures.extend(std::iter::repeat_n(error, count));
    }

    pub fn fail_commands(&self, error: TransportError, count: usize) {
        self.lock().command_failures.extend(std::iter::repeat_n(error, count));
    }

    /// Number of successful connection attempts.
    pub fn opens(&self) -> u32 {
        self.lock().opens
    }

    pub fn wire_log(&self) -> Vec<WireRecord> {
        self.lock().wire_log.clone()
    }

    /// Commands that reached the wire for one device, in order.
    pub fn commands_for(&self, device: u8) -> Vec<WireCommand> {
        self.lock()
            .wire_log
            .iter()
            .filter(|record| record.device == device)
            .filter_map(|record| record.command)
            .collect()
    }

    async fn io_delay(&self) {
        let latency = self.lock().io_latency;
        if !latency.is_zero() {
            time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl Connector for SimulatedChain {
    async fn open(&self, _descriptor: &SessionDescriptor) -> Result<Box<dyn Transport>, ConnectError> {
        let latency = self.lock().connect_latency;
        if !latency.is_zero() {
            time::sleep(latency).await;
        }

        let mut state = self.lock();
        if let Some(error) = state.connect_failures.pop_front() {
            return Err(error);
        }
        state.opens += 1;
        Ok(Box::new(SimulatedTransport {
            chain: self.clone(),
        }))
    }
}

struct SimulatedTransport {
    chain: SimulatedChain,
}

#[async_trait]
impl Transport for SimulatedTransport {
    async fn write_command(
        &mut self,
        binding: &AxisBinding,
        command: &WireCommand,
    ) -> Result<Ack, TransportError> {
        let started = Instant::now();
        self.chain.io_delay().await;

        let mut state = self.chain.lock();
        let outcome = match state.command_failures.pop_front() {
            Some(error) => Err(error),
            None => {
                state.apply(binding.device, command);
                Ok(Ack)
            }
        };
        state.wire_log.push(WireRecord {
            device: binding.device,
            command: Some(*command),
            started,
            finished: Instant::now(),
        });
        outcome
    }

    async fn read_status(&mut self, binding: &AxisBinding) -> Result<RawStatus, TransportError> {
        let started = Instant::now();
        self.chain.io_delay().await;

        let mut state = self.chain.lock();
        let outcome = match state.poll_failures.pop_front() {
            Some(error) => Err(error),
            None => {
                let dev = state.device(binding.device);
                let moving = dev.advance();
                Ok(RawStatus {
                    position: dev.position,
                    moving,
                    fault: dev.fault,
                })
            }
        };
        state.wire_log.push(WireRecord {
            device: binding.device,
            command: None,
            started,
            finished: Instant::now(),
        });
        outcome
    }

    async fn discover(&mut self) -> Result<Vec<DiscoveredDevice>, TransportError> {
        self.chain.io_delay().await;
        Ok(self
            .chain
            .lock()
            .devices
            .keys()
            .map(|&device| DiscoveredDevice {
                device,
                detail: Some("simulated".to_string()),
            })
            .collect())
    }
}
