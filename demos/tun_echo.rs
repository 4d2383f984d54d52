//! A UDP echo server on a TUN interface
//!
//! The stack owns `tun0` with address 10.0.0.1/24 while the host side gets
//! 10.0.0.254. Datagrams sent to port 7 are echoed back and pings are
//! answered.
//!
//! To run this example:
//!
//! ```sh
//! cargo run --example tun_echo
//! echo hello | nc -u 10.0.0.1 7
//! ```
//!
//! Note: Root/sudo privileges are required to create and configure the TUN device.

use std::net::Ipv4Addr;
use std::time::Instant;

use inet_stack::util::parse_ip_cidr;
use inet_stack::{Device, Inet, Inet4, NetError, TunDevice};

mod utils;
use utils::network::configure_interface;

const ECHO_PORT: u16 = 7;

fn main() -> Result<(), NetError> {
    tracing_subscriber::fmt::init();

    let tun = TunDevice::open("tun0")?;
    configure_interface(tun.device_name(), "10.0.0.254/24")?;

    let (addr, netmask) = parse_ip_cidr("10.0.0.1/24")?;
    let mut inet = Inet4::new(tun);
    inet.network_config(addr, netmask, Ipv4Addr::new(10, 0, 0, 254), None);
    inet.udp_bind(ECHO_PORT)?;
    println!("echoing on {}:{}", inet.ip_addr(), ECHO_PORT);

    loop {
        let packet = inet.nic_mut().recv()?;
        inet.receive(packet);

        while let Some(datagram) = inet.udp_recv(ECHO_PORT) {
            println!(
                "{}:{} -> {} bytes",
                datagram.src_addr,
                datagram.src_port,
                datagram.data.len()
            );
            inet.udp_send_to(ECHO_PORT, datagram.src_addr, datagram.src_port, &datagram.data)?;
        }

        inet.poll(Instant::now());
    }
}
