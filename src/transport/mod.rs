//! Transport layer
//!
//! This module contains the transport-layer pieces of the stack:
//! - Port allocation shared by UDP and TCP
//! - UDP: User Datagram Protocol sockets
//! - TCP: segment and error demultiplexing

pub mod ports;
pub mod tcp;
pub mod udp;

// Re-export commonly used items
pub use ports::{port_ranges, PortError, PortUtil};
pub use tcp::{Connection, ConnectionKey, Tcp, TcpHeader};
pub use udp::{Datagram, Udp, UdpErrorReport, UdpHeader};
