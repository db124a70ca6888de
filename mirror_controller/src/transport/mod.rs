pub mod simulated;
pub mod zaber_ascii;

use std::sync::Arc;
use std::time::Duration;

use crate::session::{Connector, SessionDescriptor, TransportKind};

pub use simulated::SimulatedChain;
pub use zaber_ascii::ZaberConnector;

/// Picks the connector matching the descriptor's transport kind.
pub fn connector_for(descriptor: &SessionDescriptor, connect_timeout: Duration) -> Arc<dyn Connector> {
    match descriptor.kind {
        TransportKind::ZaberAsciiTcp | TransportKind::ZaberAsciiSerial => {
            Arc::new(ZaberConnector::new(connect_timeout))
        }
        TransportKind::Simulated => SimulatedChain::new().connector(),
    }
}
