//! Packet buffers
//!
//! A `Packet` owns its bytes and remembers how much headroom was reserved in
//! front of the network-layer data for the device's link header.

use std::net::Ipv4Addr;

use crate::network::checksum;
use crate::network::ipv4::{Ipv4Header, IPV4_HEADER_LEN};
use byteorder::{BigEndian, ByteOrder};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
    offset: usize,
    next_hop: Option<Ipv4Addr>,
}

impl Packet {
    /// Empty packet with `offset` bytes reserved for the link header
    pub fn with_headroom(offset: usize) -> Self {
        Packet {
            buf: vec![0u8; offset],
            offset,
            next_hop: None,
        }
    }

    /// Wrap network-layer bytes received from a device
    pub fn from_ip_bytes(bytes: &[u8]) -> Self {
        Packet {
            buf: bytes.to_vec(),
            offset: 0,
            next_hop: None,
        }
    }

    /// Bytes reserved in front of the network-layer data
    pub fn link_headroom(&self) -> usize {
        self.offset
    }

    /// Network-layer bytes
    pub fn data(&self) -> &[u8] {
        &self.buf[self.offset..]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.offset..]
    }

    /// The whole buffer including the link headroom
    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    pub fn frame_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len() - self.offset
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn next_hop(&self) -> Option<Ipv4Addr> {
        self.next_hop
    }

    pub fn set_next_hop(&mut self, hop: Ipv4Addr) {
        self.next_hop = Some(hop);
    }

    /// Write a fresh IPv4 header for `proto`, discarding any existing data
    pub fn init_ip(&mut self, proto: u8) {
        self.buf.truncate(self.offset);
        let mut header = Ipv4Header::new_simple(proto, Ipv4Addr::UNSPECIFIED, Ipv4Addr::UNSPECIFIED, 0);
        header.update_checksum();
        self.buf.extend_from_slice(&header.to_bytes());
    }

    pub fn ip_header(&self) -> Option<Ipv4Header> {
        Ipv4Header::from_bytes(self.data())
    }

    pub fn ip_src(&self) -> Option<Ipv4Addr> {
        self.ip_header().map(|h| h.src_addr)
    }

    pub fn ip_dst(&self) -> Option<Ipv4Addr> {
        self.ip_header().map(|h| h.dst_addr)
    }

    pub fn ip_protocol(&self) -> Option<u8> {
        self.ip_header().map(|h| h.protocol)
    }

    pub fn set_ip_src(&mut self, addr: Ipv4Addr) {
        self.write_addr(12, addr);
    }

    pub fn set_ip_dst(&mut self, addr: Ipv4Addr) {
        self.write_addr(16, addr);
    }

    pub fn set_ttl(&mut self, ttl: u8) {
        if self.len() >= IPV4_HEADER_LEN {
            self.data_mut()[8] = ttl;
            self.update_ip_checksum();
        }
    }

    fn write_addr(&mut self, at: usize, addr: Ipv4Addr) {
        if self.len() < IPV4_HEADER_LEN {
            return;
        }
        self.data_mut()[at..at + 4].copy_from_slice(&addr.octets());
        self.update_ip_checksum();
    }

    fn ip_header_len(&self) -> usize {
        self.ip_header()
            .map(|h| h.header_len().min(self.len()))
            .unwrap_or(0)
    }

    /// Bytes following the IP header, bounded by the total length field
    pub fn ip_payload(&self) -> &[u8] {
        let Some(header) = self.ip_header() else {
            return &[];
        };
        let start = header.header_len().min(self.len());
        let end = (header.total_len as usize).clamp(start, self.len());
        &self.data()[start..end]
    }

    pub fn ip_payload_mut(&mut self) -> &mut [u8] {
        let start = self.ip_header_len();
        &mut self.data_mut()[start..]
    }

    /// Replace the IP payload and fix up total length and checksum
    pub fn set_ip_payload(&mut self, payload: &[u8]) {
        let start = self.offset + self.ip_header_len();
        self.buf.truncate(start);
        self.buf.extend_from_slice(payload);

        let total_len = self.len() as u16;
        BigEndian::write_u16(&mut self.data_mut()[2..4], total_len);
        self.update_ip_checksum();
    }

    pub fn update_ip_checksum(&mut self) {
        let header_len = self.ip_header_len();
        if header_len < IPV4_HEADER_LEN {
            return;
        }
        let data = self.data_mut();
        data[10..12].copy_from_slice(&[0, 0]);
        let sum = checksum(&data[..header_len]);
        BigEndian::write_u16(&mut data[10..12], sum);
    }
}
