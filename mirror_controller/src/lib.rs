pub mod axis;
pub mod config;
pub mod controller_service;
pub mod dispatcher;
pub mod error;
pub mod event_bus;
pub mod interlock;
pub mod logging;
pub mod models;
pub mod registry;
pub mod session;
pub mod state_monitor;
pub mod transport;
