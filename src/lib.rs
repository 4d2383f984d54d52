//! An IPv4 network stack composition layer
//!
//! This library provides one IPv4 stack per network device, including:
//! - Address configuration, static or via DHCP, with configuration observers
//! - Loopback and virtual addresses with source address selection
//! - Netfilter-style filter chains on the inbound and outbound paths
//! - ICMP echo replies and error delivery to UDP sockets and TCP connections
//! - Bitmap-based ephemeral port allocation

pub mod error;
pub mod iface;
pub mod network;
pub mod service;
pub mod transport;
pub mod util;

// Re-export commonly used types
pub use error::NetError;
pub use iface::{Device, Inet, Inet4, Ipv4Config, LoopbackDevice, StackOptions, StackRegistry, TunDevice, V4};
pub use network::{FilterChain, Hook, IcmpError, IcmpErrorKind, Packet, Verdict};
pub use transport::{PortError, PortUtil};
