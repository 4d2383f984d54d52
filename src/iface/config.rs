//! Stack configuration state
//!
//! `Ipv4Config` is the address configuration of one stack, `StackOptions`
//! the static tuning knobs it is created with, and `Observers` the ordered
//! list of handlers run when the stack becomes configured.

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::iface::inet::{Inet, IpVersion};
use crate::network::arp::DEFAULT_FLUSH_INTERVAL;
use crate::network::ipv4::broadcast;
use crate::service::dns::DEFAULT_MAX_TTL;

/// Called with the stack once it becomes configured
pub type ConfigHandler<V> = Box<dyn FnMut(&dyn Inet<V>)>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ipv4Config {
    pub address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub dns_server: Ipv4Addr,
    pub domain_name: String,
}

impl Ipv4Config {
    /// A stack is configured once it has an address
    pub fn is_configured(&self) -> bool {
        !self.address.is_unspecified()
    }

    pub fn broadcast(&self) -> Ipv4Addr {
        broadcast(self.address, self.netmask)
    }

    /// Forget address, netmask and gateway. DNS server and domain survive.
    pub fn reset(&mut self) {
        self.address = Ipv4Addr::UNSPECIFIED;
        self.netmask = Ipv4Addr::UNSPECIFIED;
        self.gateway = Ipv4Addr::UNSPECIFIED;
    }
}

impl Default for Ipv4Config {
    fn default() -> Self {
        Ipv4Config {
            address: Ipv4Addr::UNSPECIFIED,
            netmask: Ipv4Addr::UNSPECIFIED,
            gateway: Ipv4Addr::UNSPECIFIED,
            dns_server: Ipv4Addr::UNSPECIFIED,
            domain_name: String::new(),
        }
    }
}

impl fmt::Display for Ipv4Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr {} netmask {} gateway {} dns {}",
            self.address, self.netmask, self.gateway, self.dns_server
        )
    }
}

/// Tuning applied when a stack is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackOptions {
    /// Interval between sweeps of the link-address cache
    pub link_cache_flush_interval: Duration,
    /// Cap on how long a DNS answer stays cached
    pub dns_max_ttl: Duration,
    /// Where ephemeral allocation starts. Random when unset.
    pub ephemeral_start: Option<u16>,
    /// Static configuration applied at creation through `network_config`
    pub config: Option<Ipv4Config>,
}

impl Default for StackOptions {
    fn default() -> Self {
        StackOptions {
            link_cache_flush_interval: DEFAULT_FLUSH_INTERVAL,
            dns_max_ttl: DEFAULT_MAX_TTL,
            ephemeral_start: None,
            config: None,
        }
    }
}

/// Returned by `on_config`, used to deregister the handler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConfigHandle(u64);

pub struct Observers<V: IpVersion> {
    handlers: Vec<(ConfigHandle, ConfigHandler<V>)>,
    next_id: u64,
}

impl<V: IpVersion> Observers<V> {
    pub fn new() -> Self {
        Observers {
            handlers: Vec::new(),
            next_id: 0,
        }
    }

    pub fn register(&mut self, handler: ConfigHandler<V>) -> ConfigHandle {
        let handle = ConfigHandle(self.next_id);
        self.next_id += 1;
        self.handlers.push((handle, handler));
        handle
    }

    /// Remove a handler, keeping the order of the rest
    pub fn remove(&mut self, handle: ConfigHandle) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(h, _)| *h != handle);
        self.handlers.len() != before
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Run every handler in registration order
    pub fn dispatch(&mut self, stack: &dyn Inet<V>) {
        for (_, handler) in self.handlers.iter_mut() {
            handler(stack);
        }
    }
}

impl<V: IpVersion> Default for Observers<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: IpVersion> fmt::Debug for Observers<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observers")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
