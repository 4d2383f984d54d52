//! Network devices a stack can own
//!
//! A stack owns exactly one device. `LoopbackDevice` keeps transmitted
//! packets in memory; `TunDevice` exchanges raw IPv4 packets with the host
//! kernel through a TUN interface.

use std::collections::VecDeque;
use std::fmt;
use std::io;

use tun_tap::{Iface, Mode};

use crate::network::arp::MacAddr;
use crate::network::packet::Packet;

pub const DEFAULT_MTU: u16 = 1500;

pub trait Device {
    fn device_name(&self) -> &str;

    fn link_address(&self) -> MacAddr;

    /// Bytes of link header in front of the network-layer data
    fn frame_offset_link(&self) -> usize;

    /// A fresh packet buffer with `offset` bytes of headroom
    fn create_packet(&mut self, offset: usize) -> Packet {
        Packet::with_headroom(offset)
    }

    fn mtu(&self) -> u16;

    fn buffers_available(&self) -> usize;

    fn buffers_total(&self) -> usize;

    /// Packets the device can accept right now
    fn transmit_queue_available(&self) -> usize;

    fn transmit(&mut self, packet: Packet);

    /// Transmit buffers freed since the last call
    fn take_released(&mut self) -> usize {
        0
    }

    fn migrate_to_cpu(&mut self, _cpu_id: usize) {}
}

/// Ethernet header length, reserved by `LoopbackDevice` by default
pub const ETHERNET_HEADER_LEN: usize = 14;

const LOOPBACK_QUEUE_LEN: usize = 256;

/// In-memory device keeping everything it transmits
pub struct LoopbackDevice {
    name: String,
    mac: MacAddr,
    link_offset: usize,
    mtu: u16,
    capacity: usize,
    sent: VecDeque<Packet>,
    released: usize,
    dropped: u64,
    cpu_id: usize,
}

impl LoopbackDevice {
    pub fn new(name: impl Into<String>) -> Self {
        LoopbackDevice {
            name: name.into(),
            mac: MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]),
            link_offset: ETHERNET_HEADER_LEN,
            mtu: DEFAULT_MTU,
            capacity: LOOPBACK_QUEUE_LEN,
            sent: VecDeque::new(),
            released: 0,
            dropped: 0,
            cpu_id: 0,
        }
    }

    pub fn with_mac(mut self, mac: MacAddr) -> Self {
        self.mac = mac;
        self
    }

    pub fn with_link_offset(mut self, offset: usize) -> Self {
        self.link_offset = offset;
        self
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Oldest transmitted packet
    pub fn pop_sent(&mut self) -> Option<Packet> {
        let packet = self.sent.pop_front()?;
        self.released += 1;
        Some(packet)
    }

    /// Everything transmitted so far, oldest first
    pub fn take_sent(&mut self) -> Vec<Packet> {
        self.released += self.sent.len();
        self.sent.drain(..).collect()
    }

    pub fn sent_len(&self) -> usize {
        self.sent.len()
    }

    /// Packets refused because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }
}

impl Device for LoopbackDevice {
    fn device_name(&self) -> &str {
        &self.name
    }

    fn link_address(&self) -> MacAddr {
        self.mac
    }

    fn frame_offset_link(&self) -> usize {
        self.link_offset
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn buffers_available(&self) -> usize {
        self.capacity - self.sent.len()
    }

    fn buffers_total(&self) -> usize {
        self.capacity
    }

    fn transmit_queue_available(&self) -> usize {
        self.capacity - self.sent.len()
    }

    fn transmit(&mut self, packet: Packet) {
        if self.sent.len() >= self.capacity {
            self.dropped += 1;
            tracing::warn!(device = %self.name, "transmit queue full, dropping packet");
            return;
        }
        self.sent.push_back(packet);
    }

    fn take_released(&mut self) -> usize {
        std::mem::take(&mut self.released)
    }

    fn migrate_to_cpu(&mut self, cpu_id: usize) {
        self.cpu_id = cpu_id;
    }
}

impl fmt::Debug for LoopbackDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackDevice")
            .field("name", &self.name)
            .field("mac", &self.mac)
            .field("sent", &self.sent.len())
            .field("dropped", &self.dropped)
            .finish()
    }
}

/// Write buffers the kernel side is assumed to have. TUN writes complete
/// synchronously so the queue never fills.
const TUN_BUFFERS: usize = 1024;

/// A Linux TUN interface carrying bare IPv4 packets
pub struct TunDevice {
    iface: Iface,
    mtu: u16,
    buf: Vec<u8>,
    tx_errors: u64,
}

impl TunDevice {
    pub fn open(name: &str) -> io::Result<Self> {
        let iface = Iface::without_packet_info(name, Mode::Tun)?;
        tracing::info!(device = iface.name(), "opened tun device");
        Ok(TunDevice {
            iface,
            mtu: DEFAULT_MTU,
            buf: vec![0u8; DEFAULT_MTU as usize + 4],
            tx_errors: 0,
        })
    }

    /// Block until the kernel hands us a packet
    pub fn recv(&mut self) -> io::Result<Packet> {
        let nbytes = self.iface.recv(&mut self.buf)?;
        Ok(Packet::from_ip_bytes(&self.buf[..nbytes]))
    }

    pub fn tx_errors(&self) -> u64 {
        self.tx_errors
    }
}

impl Device for TunDevice {
    fn device_name(&self) -> &str {
        self.iface.name()
    }

    fn link_address(&self) -> MacAddr {
        MacAddr::ZERO
    }

    fn frame_offset_link(&self) -> usize {
        0
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    fn buffers_available(&self) -> usize {
        TUN_BUFFERS
    }

    fn buffers_total(&self) -> usize {
        TUN_BUFFERS
    }

    fn transmit_queue_available(&self) -> usize {
        TUN_BUFFERS
    }

    fn transmit(&mut self, packet: Packet) {
        if let Err(e) = self.iface.send(packet.frame()) {
            self.tx_errors += 1;
            tracing::warn!(device = self.iface.name(), "tun send failed: {e}");
        }
    }
}

impl fmt::Debug for TunDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunDevice")
            .field("name", &self.iface.name())
            .field("mtu", &self.mtu)
            .finish()
    }
}
