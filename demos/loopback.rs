//! An in-memory walkthrough of the stack
//!
//! Two stacks on loopback devices are registered, one configured
//! statically and one through DHCP. The first one then shows virtual
//! addresses, an anti-spoofing filter, UDP over loopback and the ICMP
//! error a datagram to a closed port produces.
//!
//! ```sh
//! cargo run --example loopback
//! ```

use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use inet_stack::iface::inet::V4;
use inet_stack::service::{FixedLease, Lease};
use inet_stack::util::parse_ip_cidr;
use inet_stack::{Hook, Inet, Inet4, LoopbackDevice, NetError, Packet, StackRegistry, Verdict};

fn main() -> Result<(), NetError> {
    tracing_subscriber::fmt::init();

    let mut registry: StackRegistry<V4, Inet4<LoopbackDevice>> = StackRegistry::new();
    let eth0 = registry.add(Box::new(Inet4::new(LoopbackDevice::new("eth0"))));

    let mut eth1 = Inet4::new(LoopbackDevice::new("eth1"));
    eth1.set_dhcp_client(Box::new(FixedLease::new(Lease {
        address: Ipv4Addr::new(192, 168, 1, 20),
        netmask: Ipv4Addr::new(255, 255, 255, 0),
        gateway: Ipv4Addr::new(192, 168, 1, 1),
        dns_server: Some(Ipv4Addr::new(192, 168, 1, 1)),
        domain_name: Some("home.arpa".to_string()),
    })));
    eth1.on_config(Box::new(|stack: &dyn Inet<V4>| {
        println!("{} configured: {}/{}", stack.ifname(), stack.ip_addr(), stack.netmask());
    }));
    let eth1 = registry.add(Box::new(eth1));

    let (addr, netmask) = parse_ip_cidr("10.0.0.42/24")?;
    registry.ifconfig(eth0, addr, netmask, Ipv4Addr::new(10, 0, 0, 1), None);
    registry.ifconfig_dhcp(
        eth1,
        Duration::from_secs(10),
        Some(Box::new(|| println!("eth1: no lease"))),
    );
    if let Some(stack) = registry.stack_mut(eth1) {
        stack.poll(Instant::now());
    }

    let Some(inet) = registry.stack_mut(eth0) else {
        return Ok(());
    };
    println!("{} broadcast {}", inet.ifname(), inet.broadcast_addr());

    inet.add_vip(Ipv4Addr::new(10, 9, 9, 9));
    println!("virtual ips: {:?}", inet.virtual_ips());

    inet.filter_chain(Hook::Input).push(|packet: &mut Packet, stack| match packet.ip_src() {
        Some(src) if !stack.is_valid_source(src) && stack.is_loopback(packet.ip_dst().unwrap_or(src)) => {
            println!("dropping spoofed loopback packet from {src}");
            Verdict::Drop
        }
        _ => Verdict::Accept,
    });

    let server = inet.udp_bind_ephemeral()?;
    let client = inet.udp_bind_ephemeral()?;
    inet.udp_send_to(client, Ipv4Addr::new(10, 9, 9, 9), server, b"hello over a vip")?;
    if let Some(datagram) = inet.udp_recv(server) {
        println!(
            "port {server} got {:?} from {}:{}",
            String::from_utf8_lossy(&datagram.data),
            datagram.src_addr,
            datagram.src_port
        );
    }

    inet.udp_send_to(client, Ipv4Addr::LOCALHOST, 9, b"anyone?")?;
    if let Some(report) = inet.udp_take_error(client) {
        println!(
            "port {client}: {:?} code {} from {}:{}",
            report.error.kind, report.error.code, report.remote_addr, report.remote_port
        );
    }

    println!(
        "ephemeral ports in use: {}, stats: {:?}",
        inet.ports().ephemeral_in_use(),
        inet.stats()
    );

    Ok(())
}
