//! IPv4 routing state
//!
//! The router owns the forwarding delegate that receives traffic not
//! addressed to this stack, and keeps per-stack packet counters.

use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::network::ipv4::same_network;
use crate::network::packet::Packet;

/// Receives packets that are not for this stack
pub type ForwardDelg = Rc<dyn Fn(Packet)>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub packets_rx: u64,
    pub packets_tx: u64,
    pub packets_forwarded: u64,
    pub packets_dropped: u64,
}

#[derive(Default)]
pub struct Router {
    forward: Option<ForwardDelg>,
    stats: RouterStats,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_packet_forwarding(&mut self, delg: ForwardDelg) {
        self.forward = Some(delg);
    }

    pub fn forward_delg(&self) -> Option<ForwardDelg> {
        self.forward.clone()
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut RouterStats {
        &mut self.stats
    }

    /// Hand a packet to the forwarding delegate, dropping it if there is none
    pub(crate) fn forward(&mut self, packet: Packet) {
        match &self.forward {
            Some(delg) => {
                self.stats.packets_forwarded += 1;
                delg(packet);
            }
            None => {
                self.stats.packets_dropped += 1;
                tracing::debug!(dst = ?packet.ip_dst(), "no forwarding delegate, dropping");
            }
        }
    }
}

/// Pick the next hop for `dst`: directly on-link, or via the gateway
pub fn next_hop(dst: Ipv4Addr, addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr) -> Ipv4Addr {
    if dst.is_broadcast() || same_network(dst, addr, netmask) || gateway.is_unspecified() {
        dst
    } else {
        gateway
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("forwarding", &self.forward.is_some())
            .field("stats", &self.stats)
            .finish()
    }
}
