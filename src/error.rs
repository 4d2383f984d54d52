use thiserror::Error;

use crate::transport::{ConnectionKey, PortError};

#[derive(Debug, Error)]
pub enum NetError {
    #[error("Port error: {0}")]
    Port(#[from] PortError),
    #[error("No socket bound to port {0}")]
    NotBound(u16),
    #[error("Stack has no address configured")]
    NotConfigured,
    #[error("Unknown connection {0:?}")]
    UnknownConnection(ConnectionKey),
    #[error("Payload of {0} bytes does not fit the MTU")]
    TooBig(usize),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("IO error: {0:?}")]
    Io(#[from] std::io::Error),
}
