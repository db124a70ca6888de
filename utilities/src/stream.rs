use std::io::{Error, ErrorKind, Result};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

pub use tokio_serial::{Error as SerialError, ErrorKind as SerialErrorKind};

/// Opens a TCP connection to `addr`, giving up after `connect_timeout`.
pub async fn connect_tcp(addr: &str, connect_timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| Error::new(ErrorKind::TimedOut, format!("connect to {addr} timed out")))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Opens a serial device in 8N1 mode.
pub fn open_serial(path: &str, baud_rate: u32) -> tokio_serial::Result<SerialStream> {
    tokio_serial::new(path, baud_rate)
        .data_bits(tokio_serial::DataBits::Eight)
        .parity(tokio_serial::Parity::None)
        .stop_bits(tokio_serial::StopBits::One)
        .flow_control(tokio_serial::FlowControl::None)
        .open_native_async()
}
