//! UDP (User Datagram Protocol)
//!
//! Header handling and the per-port socket table. Port reservation goes
//! through the stack's `PortUtil`, which this module borrows for each call.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::network::checksum;
use crate::network::icmp::IcmpError;
use crate::network::ipv4::protocol;
use crate::network::packet::Packet;
use crate::transport::ports::{PortError, PortUtil};

pub const UDP_HEADER_LEN: usize = 8;

/// Datagrams queued per socket before new arrivals are dropped
const RX_QUEUE_LIMIT: usize = 256;

/// The 8-byte UDP header (RFC 768)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    /// Returns None if the data is too short to contain a UDP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < UDP_HEADER_LEN {
            return None;
        }

        Some(UdpHeader {
            src_port: BigEndian::read_u16(&data[0..2]),
            dst_port: BigEndian::read_u16(&data[2..4]),
            length: BigEndian::read_u16(&data[4..6]),
            checksum: BigEndian::read_u16(&data[6..8]),
        })
    }

    pub fn to_bytes(&self) -> [u8; UDP_HEADER_LEN] {
        let mut bytes = [0u8; UDP_HEADER_LEN];
        BigEndian::write_u16(&mut bytes[0..2], self.src_port);
        BigEndian::write_u16(&mut bytes[2..4], self.dst_port);
        BigEndian::write_u16(&mut bytes[4..6], self.length);
        BigEndian::write_u16(&mut bytes[6..8], self.checksum);
        bytes
    }
}

/// Checksum over the IPv4 pseudo header and the UDP bytes
pub fn udp_checksum(src: Ipv4Addr, dst: Ipv4Addr, udp: &[u8]) -> u16 {
    let mut pseudo = Vec::with_capacity(12 + udp.len());
    pseudo.extend_from_slice(&src.octets());
    pseudo.extend_from_slice(&dst.octets());
    pseudo.push(0);
    pseudo.push(protocol::UDP);
    pseudo.extend_from_slice(&(udp.len() as u16).to_be_bytes());
    pseudo.extend_from_slice(udp);
    checksum(&pseudo)
}

/// Build UDP header plus payload with the checksum filled in
pub fn build_datagram(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let header = UdpHeader {
        src_port,
        dst_port,
        length: (UDP_HEADER_LEN + payload.len()) as u16,
        checksum: 0,
    };

    let mut udp = Vec::with_capacity(UDP_HEADER_LEN + payload.len());
    udp.extend_from_slice(&header.to_bytes());
    udp.extend_from_slice(payload);

    let sum = match udp_checksum(src, dst, &udp) {
        0 => 0xFFFF,
        sum => sum,
    };
    BigEndian::write_u16(&mut udp[6..8], sum);
    udp
}

/// Length and (optional) checksum validation
pub fn validate(src: Ipv4Addr, dst: Ipv4Addr, udp: &[u8]) -> bool {
    let Some(header) = UdpHeader::from_bytes(udp) else {
        return false;
    };
    if header.length as usize != udp.len() {
        return false;
    }
    header.checksum == 0 || udp_checksum(src, dst, udp) == 0
}

/// A datagram waiting in a socket's receive queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    pub src_addr: Ipv4Addr,
    pub src_port: u16,
    pub dst_addr: Ipv4Addr,
    pub dst_port: u16,
    pub data: Vec<u8>,
}

/// An ICMP error delivered to a socket
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpErrorReport {
    pub error: IcmpError,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

#[derive(Debug, Default)]
pub struct UdpSocket {
    rx_queue: VecDeque<Datagram>,
    errors: VecDeque<UdpErrorReport>,
}

impl UdpSocket {
    pub fn has_packet(&self) -> bool {
        !self.rx_queue.is_empty()
    }
}

/// Outcome of handing an inbound datagram to the socket table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    /// No socket is bound to the destination port
    NoSocket,
    /// Malformed, bad checksum, or queue full
    Dropped,
}

#[derive(Debug, Default)]
pub struct Udp {
    sockets: HashMap<u16, UdpSocket>,
}

impl Udp {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a socket on `port`
    pub fn bind(&mut self, ports: &mut PortUtil, port: u16) -> Result<(), PortError> {
        if ports.is_bound(port) {
            return Err(PortError::InUse(port));
        }
        ports.bind(port);
        self.sockets.insert(port, UdpSocket::default());
        tracing::debug!(port, "udp socket bound");
        Ok(())
    }

    /// Open a socket on the next free ephemeral port
    pub fn bind_ephemeral(&mut self, ports: &mut PortUtil) -> Result<u16, PortError> {
        let port = ports.get_next_ephemeral()?;
        self.bind(ports, port)?;
        Ok(port)
    }

    /// Close the socket on `port`, releasing the port. Returns false if none was open.
    pub fn close(&mut self, ports: &mut PortUtil, port: u16) -> bool {
        if self.sockets.remove(&port).is_none() {
            return false;
        }
        ports.unbind(port);
        true
    }

    pub fn is_open(&self, port: u16) -> bool {
        self.sockets.contains_key(&port)
    }

    pub fn socket(&self, port: u16) -> Option<&UdpSocket> {
        self.sockets.get(&port)
    }

    /// Demultiplex an inbound IPv4 packet carrying UDP
    pub fn receive(&mut self, packet: &Packet) -> Delivery {
        let (Some(src), Some(dst)) = (packet.ip_src(), packet.ip_dst()) else {
            return Delivery::Dropped;
        };
        let udp = packet.ip_payload();
        if !validate(src, dst, udp) {
            tracing::debug!(%src, %dst, "invalid udp datagram");
            return Delivery::Dropped;
        }
        let Some(header) = UdpHeader::from_bytes(udp) else {
            return Delivery::Dropped;
        };

        let Some(socket) = self.sockets.get_mut(&header.dst_port) else {
            tracing::trace!(port = header.dst_port, "no udp socket");
            return Delivery::NoSocket;
        };
        if socket.rx_queue.len() >= RX_QUEUE_LIMIT {
            tracing::warn!(port = header.dst_port, "udp receive queue full");
            return Delivery::Dropped;
        }

        socket.rx_queue.push_back(Datagram {
            src_addr: src,
            src_port: header.src_port,
            dst_addr: dst,
            dst_port: header.dst_port,
            data: udp[UDP_HEADER_LEN..].to_vec(),
        });
        Delivery::Delivered
    }

    /// Deliver an ICMP error to the socket that sent `orig`
    pub fn error_report(&mut self, err: IcmpError, orig: &Packet) {
        let (Some(header), Some(remote_addr)) = (UdpHeader::from_bytes(orig.ip_payload()), orig.ip_dst()) else {
            return;
        };
        match self.sockets.get_mut(&header.src_port) {
            Some(socket) => socket.errors.push_back(UdpErrorReport {
                error: err,
                remote_addr,
                remote_port: header.dst_port,
            }),
            None => tracing::debug!(port = header.src_port, ?err, "icmp error for closed udp port"),
        }
    }

    pub fn recv(&mut self, port: u16) -> Option<Datagram> {
        self.sockets.get_mut(&port)?.rx_queue.pop_front()
    }

    pub fn take_error(&mut self, port: u16) -> Option<UdpErrorReport> {
        self.sockets.get_mut(&port)?.errors.pop_front()
    }
}
