//! The IPv4 stack
//!
//! `Inet4` owns one device and every protocol layer on top of it. Inbound
//! packets pass Prerouting, then Input and protocol dispatch when they are
//! for us, or Forward and the forwarding delegate when they are not.
//! Outbound packets pass Output, go back in through the loopback queue when
//! addressed to ourselves, or get a next hop, pass Postrouting and reach the
//! device.
//!
//! Everything runs on the caller's thread. Packets looped back to the stack
//! are queued and processed before `receive`, `transmit` and `poll` return.

use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::mem;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::error::NetError;
use crate::iface::config::{ConfigHandle, ConfigHandler, Ipv4Config, Observers, StackOptions};
use crate::iface::device::Device;
use crate::iface::inet::{DhcpTimeoutFn, Inet, TransmitAvailDelg, V4};
use crate::network::arp::{Arp, MacAddr};
use crate::network::filter::{FilterChain, Hook, Verdict};
use crate::network::icmp::{
    echo_reply, error_message, parse_error, unreachable, IcmpError, IcmpErrorKind, IcmpHeader,
};
use crate::network::ipv4::{protocol, validate_checksum, IPV4_HEADER_LEN};
use crate::network::packet::Packet;
use crate::network::router::{next_hop, ForwardDelg, Router, RouterStats};
use crate::service::dhcp::{DhcpClient, Lease};
use crate::service::dns::{CachingResolver, DnsClient, ResolveFn};
use crate::transport::ports::PortUtil;
use crate::transport::tcp::{Connection, ConnectionKey, Tcp};
use crate::transport::udp::{build_datagram, Datagram, Delivery, Udp, UdpErrorReport, UDP_HEADER_LEN};

struct DhcpPending {
    deadline: Instant,
    on_timeout: Option<DhcpTimeoutFn>,
}

pub struct Inet4<D: Device> {
    nic: D,
    config: Ipv4Config,
    observers: Observers<V4>,
    vip4s: HashSet<Ipv4Addr>,

    arp: Arp,
    router: Router,
    ports: PortUtil,
    udp: Udp,
    tcp: Tcp,

    chains: [FilterChain<dyn Inet<V4>>; 5],

    dns: Box<dyn DnsClient>,
    dhcp: Option<Box<dyn DhcpClient>>,
    dhcp_pending: Option<DhcpPending>,

    tqa: Vec<TransmitAvailDelg>,
    loopback_queue: VecDeque<Packet>,
    cpu_id: usize,
}

impl<D: Device + 'static> Inet4<D> {
    pub fn new(nic: D) -> Self {
        Self::with_options(nic, StackOptions::default())
    }

    pub fn with_options(nic: D, options: StackOptions) -> Self {
        let ports = match options.ephemeral_start {
            Some(start) => PortUtil::with_cursor(start),
            None => PortUtil::new(),
        };
        let mut arp = Arp::new();
        arp.set_cache_flush_interval(options.link_cache_flush_interval);

        let mut vip4s = HashSet::new();
        vip4s.insert(Ipv4Addr::LOCALHOST);

        tracing::debug!(ifname = nic.device_name(), "creating ipv4 stack");
        let mut inet = Inet4 {
            nic,
            config: Ipv4Config::default(),
            observers: Observers::new(),
            vip4s,
            arp,
            router: Router::new(),
            ports,
            udp: Udp::new(),
            tcp: Tcp::new(),
            chains: Hook::ALL.map(FilterChain::for_hook),
            dns: Box::new(CachingResolver::with_max_ttl(options.dns_max_ttl)),
            dhcp: None,
            dhcp_pending: None,
            tqa: Vec::new(),
            loopback_queue: VecDeque::new(),
            cpu_id: 0,
        };

        if let Some(config) = options.config {
            inet.network_config(config.address, config.netmask, config.gateway, Some(config.dns_server));
            inet.set_domain_name(config.domain_name);
        }
        inet
    }

    pub fn nic(&self) -> &D {
        &self.nic
    }

    pub fn nic_mut(&mut self) -> &mut D {
        &mut self.nic
    }

    pub fn config(&self) -> &Ipv4Config {
        &self.config
    }

    pub fn ports(&self) -> &PortUtil {
        &self.ports
    }

    pub fn arp(&self) -> &Arp {
        &self.arp
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn udp(&self) -> &Udp {
        &self.udp
    }

    pub fn tcp(&self) -> &Tcp {
        &self.tcp
    }

    pub fn set_dns_client(&mut self, client: Box<dyn DnsClient>) {
        self.dns = client;
    }

    pub fn set_dhcp_client(&mut self, client: Box<dyn DhcpClient>) {
        self.dhcp = Some(client);
    }

    /// Whether a DHCP negotiation is still waiting for a lease
    pub fn dhcp_pending(&self) -> bool {
        self.dhcp_pending.is_some()
    }

    /// Handle a packet received by the device
    pub fn receive(&mut self, packet: Packet) {
        self.ingress(packet);
        self.drain_loopback();
        self.restart_send_queues();
    }

    /// Send a locally originated packet. An unspecified source address is
    /// filled in from the destination.
    pub fn transmit(&mut self, packet: Packet) {
        self.egress(packet);
        self.drain_loopback();
    }

    /// Drive timers: link cache expiry, DHCP negotiation and send queues
    /// waiting for device buffers
    pub fn poll(&mut self, now: Instant) {
        self.arp.poll(now);
        self.poll_dhcp(now);
        self.drain_loopback();
        self.restart_send_queues();
    }

    /// Share `free` transmit buffers between the registered delegates.
    /// Earlier delegates get the remainder one packet each.
    pub fn process_sendq(&mut self, free: usize) {
        let n = self.tqa.len();
        if n == 0 || free == 0 {
            return;
        }
        let share = free / n;
        let extra = free % n;
        for (idx, delg) in self.tqa.iter_mut().enumerate() {
            let quota = share + usize::from(idx < extra);
            if quota > 0 {
                delg(quota);
            }
        }
        self.drain_loopback();
    }

    /// Hand buffers the device released back to the send queues
    fn restart_send_queues(&mut self) {
        let released = self.nic.take_released();
        if released == 0 {
            return;
        }
        let free = self.nic.transmit_queue_available();
        tracing::trace!(released, free, "transmit buffers released");
        self.process_sendq(free);
    }

    // UDP

    pub fn udp_bind(&mut self, port: u16) -> Result<(), NetError> {
        self.udp.bind(&mut self.ports, port)?;
        Ok(())
    }

    pub fn udp_bind_ephemeral(&mut self) -> Result<u16, NetError> {
        Ok(self.udp.bind_ephemeral(&mut self.ports)?)
    }

    pub fn udp_close(&mut self, port: u16) -> bool {
        self.udp.close(&mut self.ports, port)
    }

    pub fn udp_send_to(&mut self, src_port: u16, dst: Ipv4Addr, dst_port: u16, payload: &[u8]) -> Result<(), NetError> {
        if !self.udp.is_open(src_port) {
            return Err(NetError::NotBound(src_port));
        }
        let src = self.get_source_addr(dst);
        if src.is_unspecified() && !dst.is_broadcast() {
            return Err(NetError::NotConfigured);
        }
        let max = (self.mtu() as usize).saturating_sub(IPV4_HEADER_LEN + UDP_HEADER_LEN);
        if payload.len() > max {
            return Err(NetError::TooBig(payload.len()));
        }

        let datagram = build_datagram(src, dst, src_port, dst_port, payload);
        let mut packet = self.create_ip_packet(protocol::UDP);
        packet.set_ip_src(src);
        packet.set_ip_dst(dst);
        packet.set_ip_payload(&datagram);
        self.transmit(packet);
        Ok(())
    }

    pub fn udp_recv(&mut self, port: u16) -> Option<Datagram> {
        self.udp.recv(port)
    }

    pub fn udp_take_error(&mut self, port: u16) -> Option<UdpErrorReport> {
        self.udp.take_error(port)
    }

    // TCP

    pub fn tcp_listen(&mut self, port: u16) -> Result<(), NetError> {
        self.tcp.listen(&mut self.ports, port)?;
        Ok(())
    }

    pub fn tcp_unlisten(&mut self, port: u16) -> bool {
        self.tcp.unlisten(&mut self.ports, port)
    }

    pub fn tcp_connect(&mut self, remote: Ipv4Addr, port: u16) -> Result<ConnectionKey, NetError> {
        Ok(self.tcp.connect(&mut self.ports, remote, port)?)
    }

    pub fn tcp_accept(&mut self, port: u16) -> Option<ConnectionKey> {
        self.tcp.accept(port)
    }

    pub fn tcp_close(&mut self, key: ConnectionKey) -> bool {
        self.tcp.close(&mut self.ports, key)
    }

    /// Send a TCP segment built by the connection's owner
    pub fn tcp_send(&mut self, key: ConnectionKey, segment: &[u8]) -> Result<(), NetError> {
        if self.tcp.connection(key).is_none() {
            return Err(NetError::UnknownConnection(key));
        }
        let max = (self.mtu() as usize).saturating_sub(IPV4_HEADER_LEN);
        if segment.len() > max {
            return Err(NetError::TooBig(segment.len()));
        }

        let mut packet = self.create_ip_packet(protocol::TCP);
        packet.set_ip_dst(key.remote_addr);
        packet.set_ip_payload(segment);
        self.transmit(packet);
        Ok(())
    }

    pub fn tcp_recv(&mut self, key: ConnectionKey) -> Option<Vec<u8>> {
        self.tcp.recv(key)
    }

    pub fn tcp_connection(&self, key: ConnectionKey) -> Option<&Connection> {
        self.tcp.connection(key)
    }

    fn run_chain(&mut self, hook: Hook, packet: &mut Packet) -> Verdict {
        let idx = hook.index();
        if self.chains[idx].is_empty() {
            return Verdict::Accept;
        }
        let mut chain = mem::replace(&mut self.chains[idx], FilterChain::for_hook(hook));
        let verdict = chain.run(packet, &*self);
        self.chains[idx] = chain;
        verdict
    }

    fn is_broadcast(&self, dst: Ipv4Addr) -> bool {
        dst.is_broadcast() || (self.config.is_configured() && dst == self.config.broadcast())
    }

    fn is_local(&self, dst: Ipv4Addr) -> bool {
        (self.config.is_configured() && dst == self.config.address)
            || self.is_broadcast(dst)
            || self.is_loopback(dst)
    }

    fn ingress(&mut self, mut packet: Packet) {
        self.router.stats_mut().packets_rx += 1;

        let Some(header) = packet.ip_header() else {
            self.drop_packet("not an ipv4 packet");
            return;
        };
        if !header.is_valid(packet.len()) || !validate_checksum(&packet.data()[..header.header_len()]) {
            self.drop_packet("invalid ipv4 header");
            return;
        }

        if self.run_chain(Hook::Prerouting, &mut packet) == Verdict::Drop {
            return;
        }
        let Some(dst) = packet.ip_dst() else {
            return;
        };

        if self.is_local(dst) {
            if self.run_chain(Hook::Input, &mut packet) == Verdict::Drop {
                return;
            }
            self.dispatch(packet);
        } else {
            if self.run_chain(Hook::Forward, &mut packet) == Verdict::Drop {
                return;
            }
            tracing::debug!(%dst, "forwarding packet");
            self.router.forward(packet);
        }
    }

    fn dispatch(&mut self, packet: Packet) {
        match packet.ip_protocol() {
            Some(protocol::ICMP) => self.receive_icmp(packet),
            Some(protocol::UDP) => match self.udp.receive(&packet) {
                Delivery::NoSocket => {
                    let to_broadcast = packet.ip_dst().is_some_and(|dst| self.is_broadcast(dst));
                    if !to_broadcast {
                        let err = IcmpError::new(IcmpErrorKind::DestUnreachable, unreachable::PORT);
                        self.send_icmp_error(err, &packet);
                    }
                }
                Delivery::Delivered | Delivery::Dropped => {}
            },
            Some(protocol::TCP) => {
                self.tcp.receive(&packet);
            }
            proto => {
                tracing::warn!(?proto, "unsupported protocol");
                self.router.stats_mut().packets_dropped += 1;
            }
        }
    }

    fn receive_icmp(&mut self, packet: Packet) {
        let icmp = packet.ip_payload();
        let Some(header) = IcmpHeader::from_bytes(icmp) else {
            return;
        };

        if header.is_echo_request() {
            let (Some(reply), Some(src), Some(dst)) = (echo_reply(icmp), packet.ip_src(), packet.ip_dst()) else {
                return;
            };
            let mut out = self.create_ip_packet(protocol::ICMP);
            out.set_ip_dst(src);
            if !self.is_broadcast(dst) {
                out.set_ip_src(dst);
            }
            out.set_ip_payload(&reply);
            tracing::trace!(%src, "echo reply");
            self.egress(out);
        } else if header.is_error() {
            if let Some((err, orig)) = parse_error(icmp) {
                self.error_report(err, orig);
            }
        }
    }

    fn send_icmp_error(&mut self, err: IcmpError, orig: &Packet) {
        let (Some(src), Some(dst)) = (orig.ip_src(), orig.ip_dst()) else {
            return;
        };
        // RFC 1122 3.2.2: no errors to a source that names no single host
        if src.is_unspecified() || src.is_multicast() || self.is_broadcast(src) {
            tracing::trace!(%src, "not sending icmp error");
            return;
        }
        let msg = error_message(err, orig);
        let mut out = self.create_ip_packet(protocol::ICMP);
        out.set_ip_src(dst);
        out.set_ip_dst(src);
        out.set_ip_payload(&msg);
        self.egress(out);
    }

    fn egress(&mut self, mut packet: Packet) {
        let (Some(src), Some(dst)) = (packet.ip_src(), packet.ip_dst()) else {
            tracing::warn!("refusing to send a packet without an ipv4 header");
            return;
        };
        if src.is_unspecified() {
            packet.set_ip_src(self.get_source_addr(dst));
        }

        if self.run_chain(Hook::Output, &mut packet) == Verdict::Drop {
            return;
        }
        let Some(dst) = packet.ip_dst() else {
            return;
        };
        self.router.stats_mut().packets_tx += 1;

        if self.is_loopback(dst) || (self.config.is_configured() && dst == self.config.address) {
            tracing::trace!(%dst, "looping packet back");
            self.loopback_queue.push_back(packet);
            return;
        }

        let hop = next_hop(dst, self.config.address, self.config.netmask, self.config.gateway);
        packet.set_next_hop(hop);
        if self.run_chain(Hook::Postrouting, &mut packet) == Verdict::Drop {
            return;
        }
        self.nic.transmit(packet);
    }

    fn drain_loopback(&mut self) {
        while let Some(packet) = self.loopback_queue.pop_front() {
            self.ingress(packet);
        }
    }

    fn drop_packet(&mut self, reason: &'static str) {
        self.router.stats_mut().packets_dropped += 1;
        tracing::debug!(reason, "dropping packet");
    }

    fn poll_dhcp(&mut self, now: Instant) {
        let Some(deadline) = self.dhcp_pending.as_ref().map(|pending| pending.deadline) else {
            return;
        };

        if let Some(lease) = self.dhcp.as_mut().and_then(|client| client.poll(now)) {
            self.dhcp_pending = None;
            self.apply_lease(lease);
            return;
        }

        if now >= deadline {
            let pending = self.dhcp_pending.take();
            if let Some(client) = self.dhcp.as_mut() {
                client.abandon();
            }
            tracing::warn!(ifname = self.nic.device_name(), "dhcp negotiation timed out");
            if let Some(on_timeout) = pending.and_then(|pending| pending.on_timeout) {
                on_timeout();
            }
        }
    }

    fn apply_lease(&mut self, lease: Lease) {
        tracing::info!(ifname = self.nic.device_name(), address = %lease.address, "dhcp lease acquired");
        if let Some(domain) = lease.domain_name {
            self.config.domain_name = domain;
        }
        self.network_config(lease.address, lease.netmask, lease.gateway, lease.dns_server);
    }
}

impl<D: Device + 'static> Inet<V4> for Inet4<D> {
    fn ifname(&self) -> &str {
        self.nic.device_name()
    }

    fn link_addr(&self) -> MacAddr {
        self.nic.link_address()
    }

    fn mtu(&self) -> u16 {
        self.nic.mtu()
    }

    fn ip_addr(&self) -> Ipv4Addr {
        self.config.address
    }

    fn netmask(&self) -> Ipv4Addr {
        self.config.netmask
    }

    fn gateway(&self) -> Ipv4Addr {
        self.config.gateway
    }

    fn dns_addr(&self) -> Ipv4Addr {
        self.config.dns_server
    }

    fn broadcast_addr(&self) -> Ipv4Addr {
        self.config.broadcast()
    }

    fn domain_name(&self) -> &str {
        &self.config.domain_name
    }

    fn set_domain_name(&mut self, domain_name: String) {
        self.config.domain_name = domain_name;
    }

    fn set_gateway(&mut self, gateway: Ipv4Addr) {
        self.config.gateway = gateway;
    }

    fn set_dns_server(&mut self, server: Ipv4Addr) {
        self.config.dns_server = server;
    }

    fn is_configured(&self) -> bool {
        self.config.is_configured()
    }

    fn network_config(&mut self, addr: Ipv4Addr, netmask: Ipv4Addr, gateway: Ipv4Addr, dns: Option<Ipv4Addr>) {
        let was_configured = self.config.is_configured();
        self.config.address = addr;
        self.config.netmask = netmask;
        self.config.gateway = gateway;
        self.config.dns_server = dns.unwrap_or(Ipv4Addr::UNSPECIFIED);
        tracing::info!(ifname = self.nic.device_name(), config = %self.config, "network configured");

        if !was_configured && self.config.is_configured() {
            let mut observers = mem::take(&mut self.observers);
            observers.dispatch(&*self);
            self.observers = observers;
        }
    }

    fn reset_config(&mut self) {
        self.config.reset();
        tracing::info!(ifname = self.nic.device_name(), "network configuration reset");
    }

    fn on_config(&mut self, handler: ConfigHandler<V4>) -> ConfigHandle {
        self.observers.register(handler)
    }

    fn remove_on_config(&mut self, handle: ConfigHandle) -> bool {
        self.observers.remove(handle)
    }

    fn negotiate_dhcp(&mut self, timeout: Duration, on_timeout: Option<DhcpTimeoutFn>) {
        let now = Instant::now();
        match self.dhcp.as_mut() {
            Some(client) => client.negotiate(now),
            None => tracing::warn!(ifname = self.nic.device_name(), "no dhcp client, negotiation will time out"),
        }
        tracing::debug!(ifname = self.nic.device_name(), ?timeout, "dhcp negotiation started");
        self.dhcp_pending = Some(DhcpPending {
            deadline: now + timeout,
            on_timeout,
        });
    }

    fn is_loopback(&self, addr: Ipv4Addr) -> bool {
        addr.is_loopback() || self.vip4s.contains(&addr)
    }

    fn add_vip(&mut self, addr: Ipv4Addr) {
        if self.is_loopback(addr) {
            return;
        }
        self.vip4s.insert(addr);
        tracing::info!(ifname = self.nic.device_name(), %addr, "virtual ip added");
    }

    fn remove_vip(&mut self, addr: Ipv4Addr) {
        if addr == Ipv4Addr::LOCALHOST {
            tracing::warn!("{addr} cannot be removed");
            return;
        }
        if self.vip4s.remove(&addr) {
            tracing::info!(ifname = self.nic.device_name(), %addr, "virtual ip removed");
        }
    }

    fn virtual_ips(&self) -> Vec<Ipv4Addr> {
        let mut vips: Vec<_> = self.vip4s.iter().copied().collect();
        vips.sort();
        vips
    }

    fn get_source_addr(&self, dest: Ipv4Addr) -> Ipv4Addr {
        if dest.is_loopback() {
            Ipv4Addr::LOCALHOST
        } else if self.vip4s.contains(&dest) {
            dest
        } else {
            self.config.address
        }
    }

    fn is_valid_source(&self, src: Ipv4Addr) -> bool {
        self.is_loopback(src) || src == self.config.address
    }

    fn cache_link_addr(&mut self, addr: Ipv4Addr, mac: MacAddr) {
        self.arp.cache(addr, mac);
    }

    fn flush_link_cache(&mut self) {
        self.arp.flush_cache();
    }

    fn set_link_cache_flush_interval(&mut self, interval: Duration) {
        self.arp.set_cache_flush_interval(interval);
    }

    fn set_forward_delg(&mut self, fwd: ForwardDelg) {
        self.router.set_packet_forwarding(fwd);
    }

    fn forward_delg(&self) -> Option<ForwardDelg> {
        self.router.forward_delg()
    }

    fn set_route_checker(&mut self, delg: Rc<dyn Fn(Ipv4Addr) -> bool>) {
        self.arp.set_proxy_policy(delg);
    }

    fn error_report(&mut self, err: IcmpError, orig: Packet) {
        match orig.ip_protocol() {
            Some(protocol::UDP) => self.udp.error_report(err, &orig),
            Some(protocol::TCP) => self.tcp.error_report(err, &orig),
            proto => tracing::debug!(?proto, ?err, "icmp error for unhandled protocol"),
        }
    }

    fn create_packet(&mut self) -> Packet {
        let offset = self.nic.frame_offset_link();
        self.nic.create_packet(offset)
    }

    fn create_ip_packet(&mut self, proto: u8) -> Packet {
        let mut packet = self.create_packet();
        packet.init_ip(proto);
        packet
    }

    fn buffers_available(&self) -> usize {
        self.nic.buffers_available()
    }

    fn buffers_total(&self) -> usize {
        self.nic.buffers_total()
    }

    fn transmit_queue_available(&self) -> usize {
        self.nic.transmit_queue_available()
    }

    fn on_transmit_queue_available(&mut self, delg: TransmitAvailDelg) {
        self.tqa.push(delg);
    }

    fn force_start_send_queues(&mut self) {
        let free = self.nic.transmit_queue_available();
        self.process_sendq(free);
    }

    fn resolve(&mut self, hostname: &str, func: ResolveFn, force: bool) {
        let server = self.config.dns_server;
        self.dns.resolve(server, hostname, func, force);
    }

    fn resolve_with(&mut self, hostname: &str, server: Ipv4Addr, func: ResolveFn, force: bool) {
        self.dns.resolve(server, hostname, func, force);
    }

    fn filter_chain(&mut self, hook: Hook) -> &mut FilterChain<dyn Inet<V4>> {
        &mut self.chains[hook.index()]
    }

    fn move_to_cpu(&mut self, cpu_id: usize) {
        self.cpu_id = cpu_id;
        self.nic.migrate_to_cpu(cpu_id);
        tracing::info!(ifname = self.nic.device_name(), cpu_id, "stack moved");
    }

    fn cpu_id(&self) -> usize {
        self.cpu_id
    }
}

impl<D: Device> fmt::Debug for Inet4<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inet4")
            .field("ifname", &self.nic.device_name())
            .field("config", &self.config)
            .field("vips", &self.vip4s.len())
            .field("router", &self.router)
            .field("cpu_id", &self.cpu_id)
            .finish()
    }
}
