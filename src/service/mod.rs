//! Application-level collaborators driven by the stack
//!
//! - DNS: name resolution with a per-stack cache
//! - DHCP: address negotiation

pub mod dhcp;
pub mod dns;

pub use dhcp::{DhcpClient, FixedLease, Lease};
pub use dns::{CachingResolver, DnsClient, ResolveFn};
