use std::cell::{Cell, RefCell};
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use byteorder::{BigEndian, ByteOrder};
use inet_stack::iface::inet::V4;
use inet_stack::network::icmp::{self, unreachable, ICMP_TYPE_ECHO_REPLY, ICMP_TYPE_ECHO_REQUEST};
use inet_stack::network::ipv4::protocol;
use inet_stack::network::{checksum, IcmpError, IcmpErrorKind, Packet, Verdict};
use inet_stack::service::{CachingResolver, DhcpClient, FixedLease, Lease};
use inet_stack::transport::udp::build_datagram;
use inet_stack::transport::PortError;
use inet_stack::{Device, Hook, Inet, Inet4, LoopbackDevice, NetError, StackOptions, StackRegistry};

const OWN: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 42);
const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);
const GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 1);
const PEER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 7);
const REMOTE: Ipv4Addr = Ipv4Addr::new(192, 168, 5, 5);

fn unconfigured() -> Inet4<LoopbackDevice> {
    let _ = tracing_subscriber::fmt::try_init();
    let options = StackOptions {
        ephemeral_start: Some(50000),
        ..StackOptions::default()
    };
    Inet4::with_options(LoopbackDevice::new("eth0"), options)
}

fn configured() -> Inet4<LoopbackDevice> {
    let mut inet = unconfigured();
    inet.network_config(OWN, NETMASK, GATEWAY, None);
    inet
}

fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Packet {
    let mut packet = Packet::with_headroom(0);
    packet.init_ip(protocol::UDP);
    packet.set_ip_src(src);
    packet.set_ip_dst(dst);
    packet.set_ip_payload(&build_datagram(src, dst, src_port, dst_port, payload));
    packet
}

fn echo_request(src: Ipv4Addr, dst: Ipv4Addr) -> Packet {
    let mut icmp = vec![ICMP_TYPE_ECHO_REQUEST, 0, 0, 0, 0x12, 0x34, 0, 1, b'p', b'i', b'n', b'g'];
    let sum = checksum(&icmp);
    BigEndian::write_u16(&mut icmp[2..4], sum);

    let mut packet = Packet::with_headroom(0);
    packet.init_ip(protocol::ICMP);
    packet.set_ip_src(src);
    packet.set_ip_dst(dst);
    packet.set_ip_payload(&icmp);
    packet
}

/// An ICMP error sent by `from` quoting `orig`
fn icmp_error(from: Ipv4Addr, err: IcmpError, orig: &Packet) -> Packet {
    let mut packet = Packet::with_headroom(0);
    packet.init_ip(protocol::ICMP);
    packet.set_ip_src(from);
    packet.set_ip_dst(orig.ip_src().unwrap());
    packet.set_ip_payload(&icmp::error_message(err, orig));
    packet
}

#[test]
fn test_network_config_fires_observers_once_per_transition() {
    let mut inet = unconfigured();
    let seen = Rc::new(RefCell::new(Vec::new()));
    for id in 0..2 {
        let seen = seen.clone();
        inet.on_config(Box::new(move |stack: &dyn Inet<V4>| {
            seen.borrow_mut().push((id, stack.ip_addr()));
        }));
    }
    assert!(!inet.is_configured());

    let addr = Ipv4Addr::new(10, 0, 0, 5);
    inet.network_config(addr, NETMASK, GATEWAY, Some(Ipv4Addr::new(8, 8, 8, 8)));
    assert!(inet.is_configured());
    assert_eq!(inet.broadcast_addr(), Ipv4Addr::new(10, 0, 0, 255));
    assert_eq!(inet.gateway(), GATEWAY);
    assert_eq!(inet.dns_addr(), Ipv4Addr::new(8, 8, 8, 8));
    assert_eq!(*seen.borrow(), vec![(0, addr), (1, addr)]);

    // already configured: no second dispatch
    inet.network_config(Ipv4Addr::new(10, 0, 0, 6), NETMASK, GATEWAY, Some(Ipv4Addr::new(8, 8, 8, 8)));
    assert_eq!(seen.borrow().len(), 2);

    inet.reset_config();
    assert!(!inet.is_configured());
    assert_eq!(inet.dns_addr(), Ipv4Addr::new(8, 8, 8, 8));

    inet.network_config(addr, NETMASK, GATEWAY, None);
    assert_eq!(seen.borrow().len(), 4);
    assert_eq!(inet.dns_addr(), Ipv4Addr::UNSPECIFIED);
}

#[test]
fn test_removed_observer_is_skipped() {
    let mut inet = unconfigured();
    let order = Rc::new(RefCell::new(Vec::new()));
    let mut handles = Vec::new();
    for id in 0..3 {
        let order = order.clone();
        handles.push(inet.on_config(Box::new(move |_: &dyn Inet<V4>| order.borrow_mut().push(id))));
    }

    assert!(inet.remove_on_config(handles[1]));
    assert!(!inet.remove_on_config(handles[1]));
    inet.network_config(OWN, NETMASK, GATEWAY, None);
    assert_eq!(*order.borrow(), vec![0, 2]);
}

#[test]
fn test_virtual_ips() {
    let mut inet = configured();
    let vip = Ipv4Addr::new(10, 1, 1, 1);
    assert!(inet.is_loopback(Ipv4Addr::LOCALHOST));
    assert!(!inet.is_loopback(vip));

    inet.add_vip(vip);
    assert!(inet.is_loopback(vip));
    assert_eq!(inet.virtual_ips(), vec![vip, Ipv4Addr::LOCALHOST]);

    inet.remove_vip(vip);
    assert!(!inet.is_loopback(vip));
    inet.remove_vip(Ipv4Addr::LOCALHOST);
    assert!(inet.is_loopback(Ipv4Addr::LOCALHOST));
}

#[test]
fn test_udp_delivery_and_input_drop() {
    let mut inet = configured();
    inet.udp_bind(7).unwrap();
    inet.input_chain().push(move |packet, _| {
        if packet.ip_src() == Some(REMOTE) {
            Verdict::Drop
        } else {
            Verdict::Accept
        }
    });

    inet.receive(udp_packet(REMOTE, OWN, 4000, 7, b"blocked"));
    assert!(inet.udp_recv(7).is_none());
    // dropped at Input, so no port unreachable either
    assert_eq!(inet.nic().sent_len(), 0);

    inet.receive(udp_packet(PEER, OWN, 4000, 7, b"hello"));
    let datagram = inet.udp_recv(7).unwrap();
    assert_eq!(datagram.data, b"hello");
    assert_eq!(datagram.src_addr, PEER);
    assert_eq!(datagram.src_port, 4000);
}

#[test]
fn test_input_filter_can_check_source() {
    let mut inet = configured();
    inet.udp_bind(7).unwrap();
    inet.input_chain().push(|packet, stack| match packet.ip_src() {
        Some(src) if src == stack.ip_addr() => Verdict::Drop,
        _ => Verdict::Accept,
    });

    // spoofed: claims to come from our own address
    inet.receive(udp_packet(OWN, OWN, 4000, 7, b"spoof"));
    assert!(inet.udp_recv(7).is_none());
}

#[test]
fn test_forward_chain_and_delegate() {
    let forwarded = Rc::new(Cell::new(0));
    let mut inet = configured();
    let counter = forwarded.clone();
    inet.set_forward_delg(Rc::new(move |_: Packet| counter.set(counter.get() + 1)));
    assert!(inet.forward_delg().is_some());

    inet.receive(udp_packet(PEER, REMOTE, 4000, 53, b"q"));
    assert_eq!(forwarded.get(), 1);

    inet.forward_chain().push(|_, _| Verdict::Drop);
    inet.receive(udp_packet(PEER, REMOTE, 4000, 53, b"q"));
    assert_eq!(forwarded.get(), 1);
    assert_eq!(inet.stats().packets_forwarded, 1);
}

#[test]
fn test_non_local_without_delegate_is_dropped() {
    let mut inet = configured();
    inet.receive(udp_packet(PEER, REMOTE, 4000, 53, b"q"));
    assert_eq!(inet.stats().packets_dropped, 1);
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_prerouting_rewrite_is_seen_downstream() {
    let mut inet = configured();
    inet.udp_bind(7).unwrap();
    inet.prerouting_chain().push(|packet, stack| {
        if packet.ip_dst() == Some(Ipv4Addr::new(10, 0, 0, 99)) {
            packet.set_ip_dst(stack.ip_addr());
        }
        Verdict::Accept
    });

    // the datagram checksum covers the original destination, so send it without one
    let mut packet = udp_packet(PEER, Ipv4Addr::new(10, 0, 0, 99), 4000, 7, b"nat");
    packet.ip_payload_mut()[6..8].copy_from_slice(&[0, 0]);
    inet.receive(packet);

    let datagram = inet.udp_recv(7).unwrap();
    assert_eq!(datagram.dst_addr, OWN);
    assert_eq!(datagram.data, b"nat");
}

#[test]
fn test_output_and_postrouting_drops() {
    let mut inet = configured();
    let port = inet.udp_bind_ephemeral().unwrap();

    inet.output_chain().push(|_, _| Verdict::Drop);
    inet.udp_send_to(port, REMOTE, 53, b"q").unwrap();
    assert_eq!(inet.nic().sent_len(), 0);
    inet.output_chain().clear();

    inet.postrouting_chain().push(|_, _| Verdict::Drop);
    inet.udp_send_to(port, REMOTE, 53, b"q").unwrap();
    assert_eq!(inet.nic().sent_len(), 0);
    inet.filter_chain(Hook::Postrouting).clear();

    inet.udp_send_to(port, REMOTE, 53, b"q").unwrap();
    let sent = inet.nic_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip_src(), Some(OWN));
    assert_eq!(sent[0].ip_dst(), Some(REMOTE));
    assert_eq!(sent[0].next_hop(), Some(GATEWAY));
    assert_eq!(sent[0].link_headroom(), inet.nic().frame_offset_link());
}

#[test]
fn test_postrouting_sees_next_hop() {
    let mut inet = configured();
    let hops = Rc::new(RefCell::new(Vec::new()));
    let sink = hops.clone();
    inet.postrouting_chain().push(move |packet, _| {
        sink.borrow_mut().push(packet.next_hop());
        Verdict::Accept
    });

    let port = inet.udp_bind_ephemeral().unwrap();
    inet.udp_send_to(port, PEER, 53, b"q").unwrap();
    inet.udp_send_to(port, REMOTE, 53, b"q").unwrap();
    assert_eq!(*hops.borrow(), vec![Some(PEER), Some(GATEWAY)]);
}

#[test]
fn test_echo_request_gets_reply() {
    let mut inet = configured();
    inet.receive(echo_request(PEER, OWN));

    let sent = inet.nic_mut().take_sent();
    assert_eq!(sent.len(), 1);
    let reply = &sent[0];
    assert_eq!(reply.ip_protocol(), Some(protocol::ICMP));
    assert_eq!(reply.ip_src(), Some(OWN));
    assert_eq!(reply.ip_dst(), Some(PEER));
    assert_eq!(reply.ip_payload()[0], ICMP_TYPE_ECHO_REPLY);
    assert_eq!(&reply.ip_payload()[4..], &[0x12, 0x34, 0, 1, b'p', b'i', b'n', b'g']);
    assert_eq!(checksum(reply.ip_payload()), 0);
}

#[test]
fn test_echo_to_unconfigured_stack_is_not_answered() {
    let mut inet = unconfigured();
    inet.receive(echo_request(PEER, OWN));
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_ping_loopback() {
    let mut inet = configured();
    let replies = Rc::new(Cell::new(0));
    let counter = replies.clone();
    inet.input_chain().push(move |packet, _| {
        if packet.ip_protocol() == Some(protocol::ICMP) && packet.ip_payload()[0] == ICMP_TYPE_ECHO_REPLY {
            counter.set(counter.get() + 1);
        }
        Verdict::Accept
    });

    inet.transmit(echo_request(Ipv4Addr::UNSPECIFIED, Ipv4Addr::new(127, 0, 0, 5)));
    assert_eq!(replies.get(), 1);
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_port_unreachable_reaches_local_socket() {
    let mut inet = configured();
    let port = inet.udp_bind_ephemeral().unwrap();

    inet.udp_send_to(port, Ipv4Addr::LOCALHOST, 9, b"anyone?").unwrap();

    let report = inet.udp_take_error(port).unwrap();
    assert_eq!(report.error.kind, IcmpErrorKind::DestUnreachable);
    assert_eq!(report.error.code, unreachable::PORT);
    assert_eq!(report.remote_addr, Ipv4Addr::LOCALHOST);
    assert_eq!(report.remote_port, 9);
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_remote_port_unreachable() {
    let mut inet = configured();
    inet.receive(udp_packet(PEER, OWN, 4000, 9, b"x"));

    let sent = inet.nic_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip_dst(), Some(PEER));
    let (err, quoted) = icmp::parse_error(sent[0].ip_payload()).unwrap();
    assert_eq!(err.code, unreachable::PORT);
    assert_eq!(quoted.ip_src(), Some(PEER));

    // never in answer to a broadcast
    inet.receive(udp_packet(PEER, Ipv4Addr::new(10, 0, 0, 255), 4000, 9, b"x"));
    inet.receive(udp_packet(PEER, Ipv4Addr::BROADCAST, 4000, 9, b"x"));
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_no_port_unreachable_to_group_sources() {
    let mut inet = configured();
    inet.receive(udp_packet(Ipv4Addr::new(224, 0, 0, 251), OWN, 5353, 9, b"x"));
    inet.receive(udp_packet(Ipv4Addr::BROADCAST, OWN, 68, 9, b"x"));
    inet.receive(udp_packet(Ipv4Addr::new(10, 0, 0, 255), OWN, 4000, 9, b"x"));
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_icmp_error_for_closed_port_is_dropped() {
    let mut inet = configured();
    let orig = udp_packet(OWN, REMOTE, 40000, 53, b"q");
    let err = IcmpError::new(IcmpErrorKind::DestUnreachable, unreachable::PORT);

    inet.receive(icmp_error(GATEWAY, err, &orig));
    assert!(inet.udp_take_error(40000).is_none());
    assert_eq!(inet.nic().sent_len(), 0);
}

#[test]
fn test_icmp_error_aborts_tcp_connection() {
    let mut inet = configured();
    let key = inet.tcp_connect(REMOTE, 443).unwrap();

    let mut syn = vec![0u8; 20];
    BigEndian::write_u16(&mut syn[0..2], key.local_port);
    BigEndian::write_u16(&mut syn[2..4], 443);
    syn[12] = 5 << 4;
    syn[13] = 0x02;
    inet.tcp_send(key, &syn).unwrap();

    let sent = inet.nic_mut().take_sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].ip_src(), Some(OWN));

    let err = IcmpError::new(IcmpErrorKind::DestUnreachable, unreachable::PROTOCOL);
    inet.receive(icmp_error(GATEWAY, err, &sent[0]));
    assert_eq!(inet.tcp_connection(key).unwrap().aborted(), Some(err));

    assert!(inet.tcp_close(key));
    assert!(matches!(inet.tcp_send(key, &syn), Err(NetError::UnknownConnection(_))));
}

#[test]
fn test_udp_and_tcp_share_ports() {
    let mut inet = configured();
    inet.udp_bind(8080).unwrap();
    assert!(matches!(inet.tcp_listen(8080), Err(NetError::Port(PortError::InUse(8080)))));
    assert!(inet.ports().is_bound(8080));

    let udp_port = inet.udp_bind_ephemeral().unwrap();
    let key = inet.tcp_connect(REMOTE, 443).unwrap();
    assert_ne!(udp_port, key.local_port);
    assert_eq!(inet.ports().ephemeral_in_use(), 2);

    assert!(inet.udp_close(udp_port));
    assert!(inet.tcp_close(key));
    assert_eq!(inet.ports().ephemeral_in_use(), 0);
}

struct NeverLease {
    negotiations: Rc<Cell<u32>>,
    abandoned: Rc<Cell<bool>>,
}

impl DhcpClient for NeverLease {
    fn negotiate(&mut self, _now: Instant) {
        self.negotiations.set(self.negotiations.get() + 1);
    }

    fn poll(&mut self, _now: Instant) -> Option<Lease> {
        None
    }

    fn abandon(&mut self) {
        self.abandoned.set(true);
    }
}

#[test]
fn test_dhcp_timeout_runs_callback_once() {
    let mut inet = unconfigured();
    let negotiations = Rc::new(Cell::new(0));
    let abandoned = Rc::new(Cell::new(false));
    inet.set_dhcp_client(Box::new(NeverLease {
        negotiations: negotiations.clone(),
        abandoned: abandoned.clone(),
    }));

    let timeouts = Rc::new(Cell::new(0));
    let counter = timeouts.clone();
    inet.negotiate_dhcp(Duration::from_secs(5), Some(Box::new(move || counter.set(counter.get() + 1))));
    assert_eq!(negotiations.get(), 1);

    inet.poll(Instant::now());
    assert_eq!(timeouts.get(), 0);

    let later = Instant::now() + Duration::from_secs(10);
    inet.poll(later);
    inet.poll(later);
    assert_eq!(timeouts.get(), 1);
    assert!(abandoned.get());
    assert!(!inet.is_configured());
    assert_eq!(negotiations.get(), 1);
}

#[test]
fn test_dhcp_lease_configures_stack() {
    let mut inet = unconfigured();
    inet.set_dhcp_client(Box::new(FixedLease::new(Lease {
        address: OWN,
        netmask: NETMASK,
        gateway: GATEWAY,
        dns_server: Some(Ipv4Addr::new(10, 0, 0, 53)),
        domain_name: Some("lan".to_string()),
    })));

    let fired = Rc::new(Cell::new(0));
    let counter = fired.clone();
    inet.on_config(Box::new(move |_: &dyn Inet<V4>| counter.set(counter.get() + 1)));

    let timed_out = Rc::new(Cell::new(false));
    let flag = timed_out.clone();
    inet.negotiate_dhcp(Duration::from_secs(5), Some(Box::new(move || flag.set(true))));
    inet.poll(Instant::now());

    assert!(inet.is_configured());
    assert_eq!(inet.ip_addr(), OWN);
    assert_eq!(inet.dns_addr(), Ipv4Addr::new(10, 0, 0, 53));
    assert_eq!(inet.domain_name(), "lan");
    assert_eq!(fired.get(), 1);
    assert!(!inet.dhcp_pending());

    inet.poll(Instant::now() + Duration::from_secs(10));
    assert!(!timed_out.get());
}

#[test]
fn test_resolve_uses_configured_server() {
    let mut inet = unconfigured();
    inet.network_config(OWN, NETMASK, GATEWAY, Some(Ipv4Addr::new(10, 0, 0, 53)));
    let resolver = Rc::new(RefCell::new(CachingResolver::new()));
    inet.set_dns_client(Box::new(resolver.clone()));

    let answers = Rc::new(RefCell::new(Vec::new()));
    let sink = answers.clone();
    inet.resolve(
        "example.com",
        Box::new(move |_: &str, addr: Option<Ipv4Addr>| sink.borrow_mut().push(addr)),
        false,
    );
    let sink = answers.clone();
    inet.resolve_with(
        "other.example",
        Ipv4Addr::new(1, 1, 1, 1),
        Box::new(move |_: &str, addr: Option<Ipv4Addr>| sink.borrow_mut().push(addr)),
        false,
    );

    let mut pending: Vec<_> = resolver
        .borrow()
        .pending_queries()
        .map(|(server, name)| (server, name.to_string()))
        .collect();
    pending.sort();
    assert_eq!(
        pending,
        vec![
            (Ipv4Addr::new(1, 1, 1, 1), "other.example".to_string()),
            (Ipv4Addr::new(10, 0, 0, 53), "example.com".to_string()),
        ]
    );

    let addr = Ipv4Addr::new(93, 184, 216, 34);
    resolver.borrow_mut().answer("example.com", Some(addr), Duration::from_secs(60));
    assert_eq!(*answers.borrow(), vec![Some(addr)]);
}

#[test]
fn test_link_cache_and_route_checker() {
    let mut inet = configured();
    let mac = inet_stack::network::MacAddr([0x02, 0, 0, 0, 0, 7]);
    inet.cache_link_addr(PEER, mac);
    assert_eq!(inet.arp().lookup(PEER), Some(mac));
    inet.flush_link_cache();
    assert!(inet.arp().lookup(PEER).is_none());

    inet.set_link_cache_flush_interval(Duration::from_secs(30));
    assert_eq!(inet.arp().flush_interval(), Duration::from_secs(30));

    assert!(!inet.arp().should_proxy(REMOTE));
    inet.set_route_checker(Rc::new(|addr: Ipv4Addr| addr.octets()[0] == 192));
    assert!(inet.arp().should_proxy(REMOTE));
    assert!(!inet.arp().should_proxy(PEER));
}

#[test]
fn test_force_start_send_queues() {
    let mut inet = configured();
    let granted = Rc::new(Cell::new(0));
    let counter = granted.clone();
    inet.on_transmit_queue_available(Box::new(move |n: usize| counter.set(counter.get() + n)));

    inet.force_start_send_queues();
    assert_eq!(granted.get(), inet.transmit_queue_available());
    assert_eq!(inet.buffers_available(), inet.buffers_total());
}

#[test]
fn test_registry_ifconfig() {
    let _ = tracing_subscriber::fmt::try_init();
    let mut registry: StackRegistry<V4> = StackRegistry::new();
    registry.add(Box::new(Inet4::new(LoopbackDevice::new("eth0"))));
    let idx = registry.add(Box::new(Inet4::new(LoopbackDevice::new("eth1"))));

    assert!(registry.ifconfig(idx, OWN, NETMASK, GATEWAY, None));
    let stack = registry.stack_mut(idx).unwrap();
    assert!(stack.is_configured());
    assert_eq!(stack.ifname(), "eth1");

    stack.prerouting_chain().push(|_, _| Verdict::Drop);
    assert_eq!(registry.stack_mut(idx).unwrap().prerouting_chain().len(), 1);
    assert!(!registry.stack(0).unwrap().is_configured());
}
