//! TCP demultiplexing
//!
//! Segments are matched to connections by their 4-tuple, or queued on a
//! listener when they open a new connection. The connection state machine
//! itself lives with the owner of the `Connection`; this module only routes
//! segments and ICMP errors to it.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;

use crate::network::icmp::IcmpError;
use crate::network::packet::Packet;
use crate::transport::ports::{PortError, PortUtil};

pub const TCP_HEADER_LEN: usize = 20;

/// Pending connection requests per listener
const BACKLOG: usize = 64;

/// The fixed 20-byte TCP header (RFC 793)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq_number: u32,
    pub ack_number: u32,
    pub data_offset_and_flags: u16, // data offset (4 bits) + reserved (3 bits) + flags (9 bits)
    pub window_size: u16,
    pub checksum: u16,
    pub urgent_ptr: u16,
}

impl TcpHeader {
    /// Returns None if the data is too short to contain a TCP header
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < TCP_HEADER_LEN {
            return None;
        }

        Some(TcpHeader {
            src_port: u16::from_be_bytes([data[0], data[1]]),
            dst_port: u16::from_be_bytes([data[2], data[3]]),
            seq_number: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            ack_number: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            data_offset_and_flags: u16::from_be_bytes([data[12], data[13]]),
            window_size: u16::from_be_bytes([data[14], data[15]]),
            checksum: u16::from_be_bytes([data[16], data[17]]),
            urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
        })
    }

    /// Read only the port pair, as quoted in ICMP errors (first 8 bytes)
    pub fn ports(data: &[u8]) -> Option<(u16, u16)> {
        if data.len() < 4 {
            return None;
        }
        Some((
            u16::from_be_bytes([data[0], data[1]]),
            u16::from_be_bytes([data[2], data[3]]),
        ))
    }

    pub fn to_bytes(&self) -> [u8; TCP_HEADER_LEN] {
        let mut bytes = [0u8; TCP_HEADER_LEN];
        bytes[0..2].copy_from_slice(&self.src_port.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.dst_port.to_be_bytes());
        bytes[4..8].copy_from_slice(&self.seq_number.to_be_bytes());
        bytes[8..12].copy_from_slice(&self.ack_number.to_be_bytes());
        bytes[12..14].copy_from_slice(&self.data_offset_and_flags.to_be_bytes());
        bytes[14..16].copy_from_slice(&self.window_size.to_be_bytes());
        bytes[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        bytes[18..20].copy_from_slice(&self.urgent_ptr.to_be_bytes());
        bytes
    }

    pub fn is_syn(&self) -> bool {
        (self.data_offset_and_flags & 0x0002) != 0
    }

    pub fn is_ack(&self) -> bool {
        (self.data_offset_and_flags & 0x0010) != 0
    }

    pub fn is_rst(&self) -> bool {
        (self.data_offset_and_flags & 0x0004) != 0
    }
}

/// Identifies a connection from the local side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub local_port: u16,
    pub remote_addr: Ipv4Addr,
    pub remote_port: u16,
}

#[derive(Debug)]
pub struct Connection {
    key: ConnectionKey,
    segments: VecDeque<Vec<u8>>,
    soft_error: Option<IcmpError>,
    aborted: Option<IcmpError>,
    path_mtu: Option<u16>,
    /// Whether closing the connection releases its local port
    owns_port: bool,
}

impl Connection {
    fn new(key: ConnectionKey, owns_port: bool) -> Self {
        Connection {
            key,
            segments: VecDeque::new(),
            soft_error: None,
            aborted: None,
            path_mtu: None,
            owns_port,
        }
    }

    pub fn key(&self) -> ConnectionKey {
        self.key
    }

    /// The hard error that aborted this connection, if any
    pub fn aborted(&self) -> Option<IcmpError> {
        self.aborted
    }

    /// The most recent soft error (RFC 1122 4.2.3.9)
    pub fn soft_error(&self) -> Option<IcmpError> {
        self.soft_error
    }

    pub fn path_mtu(&self) -> Option<u16> {
        self.path_mtu
    }

    fn on_error(&mut self, err: IcmpError) {
        if err.is_too_big() {
            self.path_mtu = err.mtu;
        } else if err.is_hard() {
            tracing::debug!(key = ?self.key, ?err, "connection aborted by icmp error");
            self.aborted = Some(err);
        } else {
            self.soft_error = Some(err);
        }
    }
}

#[derive(Debug, Default)]
struct Listener {
    backlog: VecDeque<(ConnectionKey, Vec<u8>)>,
}

#[derive(Debug, Default)]
pub struct Tcp {
    listeners: HashMap<u16, Listener>,
    connections: HashMap<ConnectionKey, Connection>,
    dropped: u64,
}

impl Tcp {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listen(&mut self, ports: &mut PortUtil, port: u16) -> Result<(), PortError> {
        if ports.is_bound(port) {
            return Err(PortError::InUse(port));
        }
        ports.bind(port);
        self.listeners.insert(port, Listener::default());
        tracing::debug!(port, "tcp listening");
        Ok(())
    }

    /// Register an outgoing connection from a fresh ephemeral port
    pub fn connect(
        &mut self,
        ports: &mut PortUtil,
        remote_addr: Ipv4Addr,
        remote_port: u16,
    ) -> Result<ConnectionKey, PortError> {
        let local_port = ports.get_next_ephemeral()?;
        ports.bind(local_port);

        let key = ConnectionKey {
            local_port,
            remote_addr,
            remote_port,
        };
        self.connections.insert(key, Connection::new(key, true));
        tracing::debug!(?key, "tcp connection opened");
        Ok(key)
    }

    /// Take the oldest pending connection request on `port`.
    ///
    /// Requests for a connection that already exists are discarded.
    pub fn accept(&mut self, port: u16) -> Option<ConnectionKey> {
        let listener = self.listeners.get_mut(&port)?;
        loop {
            let (key, syn) = listener.backlog.pop_front()?;
            if self.connections.contains_key(&key) {
                tracing::trace!(?key, "stale connection request");
                continue;
            }
            let mut conn = Connection::new(key, false);
            conn.segments.push_back(syn);
            self.connections.insert(key, conn);
            return Some(key);
        }
    }

    /// Close a connection. Returns false if it did not exist.
    pub fn close(&mut self, ports: &mut PortUtil, key: ConnectionKey) -> bool {
        let Some(conn) = self.connections.remove(&key) else {
            return false;
        };
        if conn.owns_port {
            ports.unbind(key.local_port);
        }
        true
    }

    /// Stop listening on `port`, dropping queued requests
    pub fn unlisten(&mut self, ports: &mut PortUtil, port: u16) -> bool {
        if self.listeners.remove(&port).is_none() {
            return false;
        }
        ports.unbind(port);
        true
    }

    pub fn connection(&self, key: ConnectionKey) -> Option<&Connection> {
        self.connections.get(&key)
    }

    /// Next queued segment for a connection
    pub fn recv(&mut self, key: ConnectionKey) -> Option<Vec<u8>> {
        self.connections.get_mut(&key)?.segments.pop_front()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Demultiplex an inbound IPv4 packet carrying TCP.
    /// Returns false if nothing accepted the segment.
    pub fn receive(&mut self, packet: &Packet) -> bool {
        let segment = packet.ip_payload();
        let (Some(header), Some(remote_addr)) = (TcpHeader::from_bytes(segment), packet.ip_src()) else {
            self.dropped += 1;
            return false;
        };

        let key = ConnectionKey {
            local_port: header.dst_port,
            remote_addr,
            remote_port: header.src_port,
        };

        if let Some(conn) = self.connections.get_mut(&key) {
            conn.segments.push_back(segment.to_vec());
            return true;
        }

        match self.listeners.get_mut(&header.dst_port) {
            Some(listener) if header.is_syn() && !header.is_ack() => {
                // retransmitted SYN for a request that is still pending
                if listener.backlog.iter().any(|(pending, _)| *pending == key) {
                    tracing::trace!(?key, "duplicate syn");
                    return true;
                }
                if listener.backlog.len() >= BACKLOG {
                    tracing::debug!(?key, "tcp backlog full");
                    self.dropped += 1;
                    return false;
                }
                listener.backlog.push_back((key, segment.to_vec()));
                true
            }
            _ => {
                tracing::trace!(?key, "tcp segment without connection");
                self.dropped += 1;
                false
            }
        }
    }

    /// Deliver an ICMP error to the connection that sent `orig`
    pub fn error_report(&mut self, err: IcmpError, orig: &Packet) {
        let (Some((src_port, dst_port)), Some(remote_addr)) = (TcpHeader::ports(orig.ip_payload()), orig.ip_dst())
        else {
            return;
        };
        let key = ConnectionKey {
            local_port: src_port,
            remote_addr,
            remote_port: dst_port,
        };
        match self.connections.get_mut(&key) {
            Some(conn) => conn.on_error(err),
            None => tracing::debug!(?key, ?err, "icmp error for unknown tcp connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::icmp::{unreachable, IcmpErrorKind};
    use crate::network::ipv4::protocol;

    const LOCAL: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);

    fn segment(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, flags: u16) -> Packet {
        let header = TcpHeader {
            src_port,
            dst_port,
            seq_number: 1,
            ack_number: 0,
            data_offset_and_flags: (5 << 12) | flags,
            window_size: 1024,
            checksum: 0,
            urgent_ptr: 0,
        };
        let mut packet = Packet::with_headroom(0);
        packet.init_ip(protocol::TCP);
        packet.set_ip_src(src);
        packet.set_ip_dst(dst);
        packet.set_ip_payload(&header.to_bytes());
        packet
    }

    #[test]
    fn test_listener_queues_syn_and_accepts() {
        let mut ports = PortUtil::with_cursor(50000);
        let mut tcp = Tcp::new();
        tcp.listen(&mut ports, 80).unwrap();
        assert_eq!(tcp.listen(&mut ports, 80), Err(PortError::InUse(80)));

        assert!(tcp.receive(&segment(REMOTE, LOCAL, 40000, 80, 0x0002)));
        // plain ACK without connection is dropped
        assert!(!tcp.receive(&segment(REMOTE, LOCAL, 40001, 80, 0x0010)));
        assert_eq!(tcp.dropped(), 1);

        let key = tcp.accept(80).unwrap();
        assert_eq!(key.remote_port, 40000);
        let syn = tcp.recv(key).unwrap();
        assert!(TcpHeader::from_bytes(&syn).unwrap().is_syn());

        // closing an accepted connection keeps the listening port bound
        assert!(tcp.close(&mut ports, key));
        assert!(ports.is_bound(80));
    }

    #[test]
    fn test_retransmitted_syn_yields_one_connection() {
        let mut ports = PortUtil::with_cursor(50000);
        let mut tcp = Tcp::new();
        tcp.listen(&mut ports, 80).unwrap();

        let syn = segment(REMOTE, LOCAL, 40000, 80, 0x0002);
        assert!(tcp.receive(&syn));
        assert!(tcp.receive(&syn));

        let key = tcp.accept(80).unwrap();
        assert!(tcp.recv(key).is_some());

        let mut data = segment(REMOTE, LOCAL, 40000, 80, 0x0010);
        let mut payload = data.ip_payload().to_vec();
        payload.extend_from_slice(b"DATA");
        data.set_ip_payload(&payload);
        assert!(tcp.receive(&data));

        assert_eq!(tcp.accept(80), None);
        let queued = tcp.recv(key).unwrap();
        assert_eq!(&queued[TCP_HEADER_LEN..], b"DATA");
    }

    #[test]
    fn test_stale_backlog_entry_is_skipped() {
        let mut ports = PortUtil::with_cursor(50000);
        let mut tcp = Tcp::new();
        tcp.listen(&mut ports, 80).unwrap();

        let syn = segment(REMOTE, LOCAL, 40000, 80, 0x0002);
        assert!(tcp.receive(&syn));
        let key = tcp.accept(80).unwrap();
        tcp.recv(key);

        // a SYN for a live connection goes to the connection, not the backlog
        assert!(tcp.receive(&syn));
        assert_eq!(tcp.accept(80), None);
        assert!(tcp.recv(key).is_some());
    }

    #[test]
    fn test_connect_uses_ephemeral_port() {
        let mut ports = PortUtil::with_cursor(50000);
        let mut tcp = Tcp::new();
        let key = tcp.connect(&mut ports, REMOTE, 443).unwrap();
        assert_eq!(key.local_port, 50001);
        assert!(ports.is_bound(50001));

        assert!(tcp.receive(&segment(REMOTE, LOCAL, 443, 50001, 0x0012)));
        assert!(tcp.recv(key).is_some());

        assert!(tcp.close(&mut ports, key));
        assert!(!ports.is_bound(50001));
    }

    #[test]
    fn test_icmp_errors() {
        let mut ports = PortUtil::with_cursor(50000);
        let mut tcp = Tcp::new();
        let key = tcp.connect(&mut ports, REMOTE, 443).unwrap();
        let sent = segment(LOCAL, REMOTE, key.local_port, 443, 0x0002);

        let soft = IcmpError::new(IcmpErrorKind::TimeExceeded, 0);
        tcp.error_report(soft, &sent);
        assert_eq!(tcp.connection(key).unwrap().soft_error(), Some(soft));
        assert!(tcp.connection(key).unwrap().aborted().is_none());

        let mut too_big = IcmpError::new(IcmpErrorKind::DestUnreachable, unreachable::FRAGMENTATION_NEEDED);
        too_big.mtu = Some(1280);
        tcp.error_report(too_big, &sent);
        assert_eq!(tcp.connection(key).unwrap().path_mtu(), Some(1280));

        let hard = IcmpError::new(IcmpErrorKind::DestUnreachable, unreachable::PORT);
        tcp.error_report(hard, &sent);
        assert_eq!(tcp.connection(key).unwrap().aborted(), Some(hard));
    }
}
