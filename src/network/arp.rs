//! Link-address resolution cache
//!
//! Holds the IPv4 → MAC mappings learned by the resolution protocol, expires
//! them on a configurable interval, and carries the proxy policy deciding
//! whether to answer for addresses that are not our own.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// How long a learned mapping stays valid
pub const CACHE_EXPIRY: Duration = Duration::from_secs(60 * 5);

/// Default interval between sweeps of expired entries
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(60 * 5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const ZERO: MacAddr = MacAddr([0; 6]);
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            m[0], m[1], m[2], m[3], m[4], m[5]
        )
    }
}

/// Decides whether we have a route to an address we should answer for
pub type RouteChecker = Rc<dyn Fn(Ipv4Addr) -> bool>;

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    mac: MacAddr,
    timestamp: Instant,
}

impl CacheEntry {
    fn expired(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.timestamp) > CACHE_EXPIRY
    }
}

pub struct Arp {
    cache: HashMap<Ipv4Addr, CacheEntry>,
    flush_interval: Duration,
    last_flush: Option<Instant>,
    proxy: Option<RouteChecker>,
}

impl Arp {
    pub fn new() -> Self {
        Arp {
            cache: HashMap::new(),
            flush_interval: DEFAULT_FLUSH_INTERVAL,
            last_flush: None,
            proxy: None,
        }
    }

    /// Cache a resolution, refreshing the timestamp of an existing entry
    pub fn cache(&mut self, ip: Ipv4Addr, mac: MacAddr) {
        self.cache_at(ip, mac, Instant::now());
    }

    pub fn cache_at(&mut self, ip: Ipv4Addr, mac: MacAddr, now: Instant) {
        tracing::trace!(%ip, %mac, "caching link address");
        self.cache.insert(ip, CacheEntry { mac, timestamp: now });
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        self.cache.get(&ip).map(|entry| entry.mac)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn flush_cache(&mut self) {
        self.cache.clear();
    }

    pub fn flush_interval(&self) -> Duration {
        self.flush_interval
    }

    pub fn set_cache_flush_interval(&mut self, interval: Duration) {
        self.flush_interval = interval;
    }

    /// Remove expired entries
    pub fn flush_expired(&mut self, now: Instant) {
        let before = self.cache.len();
        self.cache.retain(|_, entry| !entry.expired(now));
        self.last_flush = Some(now);

        let removed = before - self.cache.len();
        if removed > 0 {
            tracing::debug!(removed, "flushed expired link cache entries");
        }
    }

    /// Run `flush_expired` if the flush interval has elapsed
    pub fn poll(&mut self, now: Instant) {
        match self.last_flush {
            Some(last) if now.saturating_duration_since(last) < self.flush_interval => {}
            Some(_) => self.flush_expired(now),
            None => self.last_flush = Some(now),
        }
    }

    /// No policy means proxying is disabled.
    pub fn set_proxy_policy(&mut self, policy: RouteChecker) {
        self.proxy = Some(policy);
    }

    pub fn proxy_policy(&self) -> Option<RouteChecker> {
        self.proxy.clone()
    }

    /// Whether requests for `ip` should be answered on its behalf
    pub fn should_proxy(&self, ip: Ipv4Addr) -> bool {
        self.proxy.as_ref().is_some_and(|policy| policy(ip))
    }
}

impl Default for Arp {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Arp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Arp")
            .field("entries", &self.cache.len())
            .field("flush_interval", &self.flush_interval)
            .field("proxy", &self.proxy.is_some())
            .finish()
    }
}
