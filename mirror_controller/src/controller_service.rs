use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::config::{AppConfig, PortConfig};
use crate::dispatcher::{Dispatcher, DispatcherSettings};
use crate::event_bus::{Event, EventStream};
use crate::session::SessionHealth;
use crate::transport;

pub async fn create_dispatcher(config: &AppConfig) -> Result<Arc<Dispatcher>> {
    config.validate()?;
    let registry = config.registry()?;
    let session = config.session.settings();
    let connect_timeout = session.connect_timeout;
    let ports = config.ports.iter().map(PortConfig::descriptor).collect();

    let settings = DispatcherSettings {
        session,
        axis: config.motion.settings(),
        event_buffer: config.events.subscriber_buffer,
        interlocks: config.interlocks.clone(),
    };

    let dispatcher = Dispatcher::start(
        registry,
        ports,
        |descriptor| transport::connector_for(descriptor, connect_timeout),
        settings,
    )
    .await?;

    Ok(Arc::new(dispatcher))
}

/// Writes bus events to the log until the bus shuts down.
pub async fn run_event_logger(mut events: EventStream, log_status_changes: bool) {
    while let Some(event) = events.recv().await {
        match event {
            Event::StatusChanged { axis, state } => {
                if log_status_changes {
                    info!(
                        %axis,
                        position = state.position,
                        moving = state.moving,
                        status = ?state.status(),
                        applied = state.applied_sequence,
                        "Axis status changed"
                    );
                }
            }
            Event::AxisFault { axis, fault, state } => {
                error!(%axis, ?fault, position = state.position, "Axis faulted");
            }
            Event::SessionHealthChanged { port, health } => match health {
                SessionHealth::Connected => info!(%port, "Session connected"),
                SessionHealth::Disconnected => warn!(%port, "Session disconnected"),
                SessionHealth::Reconnecting => warn!(%port, "Session reconnecting"),
            },
        }
    }

    if events.dropped() > 0 {
        info!(dropped = events.dropped(), "Event logger coalesced status updates");
    }
}
