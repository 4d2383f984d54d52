//! DHCP client boundary
//!
//! The stack starts a negotiation and polls the client; the lease protocol
//! is the client's business. The stack owns the negotiation deadline and
//! runs the timeout handler itself.

use std::net::Ipv4Addr;
use std::time::Instant;

/// Address configuration obtained from a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Option<Ipv4Addr>,
    pub domain_name: Option<String>,
}

pub trait DhcpClient {
    /// Begin (or restart) negotiation
    fn negotiate(&mut self, now: Instant);

    /// Report a lease once one has been acquired
    fn poll(&mut self, now: Instant) -> Option<Lease>;

    /// Stop negotiating after the stack gave up
    fn abandon(&mut self) {}
}

/// A client that always obtains the same lease on the first poll after
/// negotiation starts.
#[derive(Debug, Clone)]
pub struct FixedLease {
    lease: Lease,
    negotiating: bool,
}

impl FixedLease {
    pub fn new(lease: Lease) -> Self {
        FixedLease {
            lease,
            negotiating: false,
        }
    }
}

impl DhcpClient for FixedLease {
    fn negotiate(&mut self, _now: Instant) {
        self.negotiating = true;
    }

    fn poll(&mut self, _now: Instant) -> Option<Lease> {
        if !self.negotiating {
            return None;
        }
        self.negotiating = false;
        Some(self.lease.clone())
    }

    fn abandon(&mut self) {
        self.negotiating = false;
    }
}
