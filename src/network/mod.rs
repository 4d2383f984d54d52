//! Network layer
//!
//! This module contains the network-layer pieces of the stack:
//! - IPv4: header handling and the router holding the forwarding delegate
//! - ICMP: echo replies and error reports
//! - ARP: link-address cache and proxy policy
//! - Filter chains applied at the netfilter-style hooks

pub mod arp;
pub mod filter;
pub mod icmp;
pub mod ipv4;
pub mod packet;
pub mod router;

// Re-export commonly used items
pub use arp::{Arp, MacAddr};
pub use filter::{FilterChain, Hook, Verdict};
pub use icmp::{IcmpError, IcmpErrorKind};
pub use ipv4::{protocol, Ipv4Header};
pub use packet::Packet;
pub use router::Router;

/// Calculate Internet checksum
///
/// Sum data in 16-bit chunks, fold the carries back in and
/// return the one's complement of the result.
pub fn checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;

    for chunk in data.chunks_exact(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }

    // odd length: pad with zero
    if data.len() % 2 != 0 {
        if let Some(&last_byte) = data.last() {
            sum += (last_byte as u32) << 8;
        }
    }

    while (sum >> 16) > 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
