#![allow(dead_code)]

use std::time::Duration;

use mirror_controller::dispatcher::{Dispatcher, DispatcherSettings};
use mirror_controller::event_bus::{Event, EventBus, EventStream};
use mirror_controller::models::{AxisId, AxisState, MotionRequest, MotorInfo, SoftLimits, Unit};
use mirror_controller::registry::MotorRegistry;
use mirror_controller::session::{
    AxisBinding, SessionContext, SessionDescriptor, SessionSettings, TransportKind,
};
use mirror_controller::transport::SimulatedChain;
use utilities::backoff::BackoffPolicy;

pub const PORT: &str = "chain";

pub fn linear(id: &str, device: u8, min: f64, max: f64) -> MotorInfo {
    MotorInfo {
        id: AxisId::from(id),
        label: format!("{id} stage"),
        port: PORT.to_string(),
        device,
        unit: Unit::Millimetres,
        steps_per_unit: 1000.0,
        limits: SoftLimits::new(min, max),
        home_position: 0.0,
        poll_interval: Duration::from_millis(50),
        speed: 10.0,
        max_speed: Some(20.0),
        homeable: true,
    }
}

pub fn descriptor() -> SessionDescriptor {
    SessionDescriptor {
        port: PORT.to_string(),
        kind: TransportKind::Simulated,
        address: String::new(),
        baud_rate: 115_200,
    }
}

pub fn binding(id: &str, device: u8) -> AxisBinding {
    AxisBinding::from(&linear(id, device, 0.0, 100.0))
}

pub fn session_settings() -> SessionSettings {
    SessionSettings {
        connect_timeout: Duration::from_secs(1),
        io_timeout: Duration::from_millis(200),
        backoff: BackoffPolicy::default(),
    }
}

pub fn context(chain: &SimulatedChain, bus: &EventBus) -> SessionContext {
    SessionContext {
        connector: chain.connector(),
        settings: session_settings(),
        bus: bus.clone(),
    }
}

pub fn settings() -> DispatcherSettings {
    DispatcherSettings {
        session: session_settings(),
        ..DispatcherSettings::default()
    }
}

pub async fn bench(chain: &SimulatedChain, motors: Vec<MotorInfo>) -> Dispatcher {
    bench_with(chain, motors, settings()).await
}

pub async fn bench_with(
    chain: &SimulatedChain,
    motors: Vec<MotorInfo>,
    settings: DispatcherSettings,
) -> Dispatcher {
    let registry = MotorRegistry::with_motors([PORT], motors).unwrap();
    let connector = chain.connector();
    Dispatcher::start(registry, vec![descriptor()], move |_| connector.clone(), settings)
        .await
        .unwrap()
}

pub fn to(position: f64) -> MotionRequest {
    MotionRequest::MoveAbsolute {
        position,
        speed: None,
    }
}

pub fn idle(state: &AxisState) -> bool {
    !state.stale && !state.moving && state.fault.is_none()
}

/// Waits until the axis state satisfies `predicate`.
pub async fn wait_for(
    dispatcher: &Dispatcher,
    axis: &AxisId,
    predicate: impl Fn(&AxisState) -> bool,
) -> AxisState {
    let mut states = dispatcher.watch_state(axis).unwrap();
    tokio::time::timeout(Duration::from_secs(120), async {
        loop {
            {
                let state = states.borrow_and_update();
                if predicate(&state) {
                    return state.clone();
                }
            }
            states.changed().await.expect("axis controller stopped");
        }
    })
    .await
    .expect("axis never reached the expected state")
}

pub async fn next_event(events: &mut EventStream) -> Event {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("no event in time")
        .expect("event bus closed")
}

/// Skips events until one matches `pick`.
pub async fn find_event<T>(events: &mut EventStream, pick: impl Fn(&Event) -> Option<T>) -> T {
    loop {
        let event = next_event(events).await;
        if let Some(found) = pick(&event) {
            return found;
        }
    }
}
