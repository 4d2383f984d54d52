//! The capability interface every IP stack exposes
//!
//! `Inet<V>` is generic over the IP version so that configuration helpers,
//! filters and the stack registry can work with any stack without knowing
//! its device or concrete type. IPv4 is the only version implemented.

use std::fmt::{Debug, Display};
use std::hash::Hash;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use crate::iface::config::{ConfigHandle, ConfigHandler};
use crate::network::arp::MacAddr;
use crate::network::filter::{FilterChain, Hook};
use crate::network::icmp::IcmpError;
use crate::network::packet::Packet;
use crate::network::router::ForwardDelg;
use crate::service::dns::ResolveFn;

pub trait IpVersion: 'static {
    type Addr: Copy + Eq + Ord + Hash + Debug + Display;

    const ANY: Self::Addr;
    const LOOPBACK: Self::Addr;
    const NAME: &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct V4;

impl IpVersion for V4 {
    type Addr = Ipv4Addr;

    const ANY: Ipv4Addr = Ipv4Addr::UNSPECIFIED;
    const LOOPBACK: Ipv4Addr = Ipv4Addr::LOCALHOST;
    const NAME: &'static str = "IPv4";
}

/// Run once when DHCP negotiation times out
pub type DhcpTimeoutFn = Box<dyn FnOnce()>;

/// Told how many transmit buffers were freed
pub type TransmitAvailDelg = Box<dyn FnMut(usize)>;

pub trait Inet<V: IpVersion> {
    // link
    fn ifname(&self) -> &str;
    fn link_addr(&self) -> MacAddr;
    fn mtu(&self) -> u16;

    // addressing
    fn ip_addr(&self) -> V::Addr;
    fn netmask(&self) -> V::Addr;
    fn gateway(&self) -> V::Addr;
    fn dns_addr(&self) -> V::Addr;
    fn broadcast_addr(&self) -> V::Addr;
    fn domain_name(&self) -> &str;
    fn set_domain_name(&mut self, domain_name: String);
    fn set_gateway(&mut self, gateway: V::Addr);
    fn set_dns_server(&mut self, server: V::Addr);

    // configuration
    fn is_configured(&self) -> bool;
    fn network_config(&mut self, addr: V::Addr, netmask: V::Addr, gateway: V::Addr, dns: Option<V::Addr>);
    fn reset_config(&mut self);
    fn on_config(&mut self, handler: ConfigHandler<V>) -> ConfigHandle;
    fn remove_on_config(&mut self, handle: ConfigHandle) -> bool;
    fn negotiate_dhcp(&mut self, timeout: Duration, on_timeout: Option<DhcpTimeoutFn>);

    // loopback and virtual addresses
    fn is_loopback(&self, addr: V::Addr) -> bool;
    fn add_vip(&mut self, addr: V::Addr);
    fn remove_vip(&mut self, addr: V::Addr);
    fn virtual_ips(&self) -> Vec<V::Addr>;
    fn get_source_addr(&self, dest: V::Addr) -> V::Addr;
    fn is_valid_source(&self, src: V::Addr) -> bool;

    // link-address cache
    fn cache_link_addr(&mut self, addr: V::Addr, mac: MacAddr);
    fn flush_link_cache(&mut self);
    fn set_link_cache_flush_interval(&mut self, interval: Duration);

    // routing
    fn set_forward_delg(&mut self, fwd: ForwardDelg);
    fn forward_delg(&self) -> Option<ForwardDelg>;
    fn set_route_checker(&mut self, delg: Rc<dyn Fn(V::Addr) -> bool>);
    fn error_report(&mut self, err: IcmpError, orig: Packet);

    // packets
    fn create_packet(&mut self) -> Packet;
    fn create_ip_packet(&mut self, proto: u8) -> Packet;
    fn buffers_available(&self) -> usize;
    fn buffers_total(&self) -> usize;
    fn transmit_queue_available(&self) -> usize;
    fn on_transmit_queue_available(&mut self, delg: TransmitAvailDelg);
    fn force_start_send_queues(&mut self);

    // name resolution
    fn resolve(&mut self, hostname: &str, func: ResolveFn, force: bool);
    fn resolve_with(&mut self, hostname: &str, server: V::Addr, func: ResolveFn, force: bool);

    // filtering
    fn filter_chain(&mut self, hook: Hook) -> &mut FilterChain<dyn Inet<V>>;

    fn prerouting_chain(&mut self) -> &mut FilterChain<dyn Inet<V>> {
        self.filter_chain(Hook::Prerouting)
    }

    fn input_chain(&mut self) -> &mut FilterChain<dyn Inet<V>> {
        self.filter_chain(Hook::Input)
    }

    fn forward_chain(&mut self) -> &mut FilterChain<dyn Inet<V>> {
        self.filter_chain(Hook::Forward)
    }

    fn output_chain(&mut self) -> &mut FilterChain<dyn Inet<V>> {
        self.filter_chain(Hook::Output)
    }

    fn postrouting_chain(&mut self) -> &mut FilterChain<dyn Inet<V>> {
        self.filter_chain(Hook::Postrouting)
    }

    // execution
    fn move_to_cpu(&mut self, cpu_id: usize);
    fn cpu_id(&self) -> usize;
}
