//! DNS client boundary
//!
//! The stack resolves names through a `DnsClient`. `CachingResolver` keeps
//! the per-stack answer cache and coalesces outstanding lookups; whoever
//! speaks the query protocol drains `pending_queries` and feeds results back
//! through `answer`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Called with the hostname and its address, or None if it did not resolve
pub type ResolveFn = Box<dyn FnOnce(&str, Option<Ipv4Addr>)>;

pub trait DnsClient {
    /// Resolve `hostname` using `server`. `force` bypasses any local cache.
    fn resolve(&mut self, server: Ipv4Addr, hostname: &str, callback: ResolveFn, force: bool);

    /// Drop every cached answer
    fn flush_cache(&mut self) {}
}

/// Lets the owner keep a handle to a client it gave to a stack
impl<T: DnsClient> DnsClient for Rc<RefCell<T>> {
    fn resolve(&mut self, server: Ipv4Addr, hostname: &str, callback: ResolveFn, force: bool) {
        self.borrow_mut().resolve(server, hostname, callback, force);
    }

    fn flush_cache(&mut self) {
        self.borrow_mut().flush_cache();
    }
}

/// Upper bound on how long an answer is cached, whatever its TTL
pub const DEFAULT_MAX_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    addr: Ipv4Addr,
    expires: Instant,
}

struct PendingQuery {
    server: Ipv4Addr,
    callbacks: Vec<ResolveFn>,
}

pub struct CachingResolver {
    cache: HashMap<String, CacheEntry>,
    pending: HashMap<String, PendingQuery>,
    max_ttl: Duration,
}

impl CachingResolver {
    pub fn new() -> Self {
        Self::with_max_ttl(DEFAULT_MAX_TTL)
    }

    pub fn with_max_ttl(max_ttl: Duration) -> Self {
        CachingResolver {
            cache: HashMap::new(),
            pending: HashMap::new(),
            max_ttl,
        }
    }

    /// Lookups waiting for an answer, as `(server, hostname)`
    pub fn pending_queries(&self) -> impl Iterator<Item = (Ipv4Addr, &str)> + '_ {
        self.pending
            .iter()
            .map(|(name, query)| (query.server, name.as_str()))
    }

    pub fn cached(&self, hostname: &str) -> Option<Ipv4Addr> {
        let key = normalize(hostname);
        self.cache
            .get(&key)
            .filter(|entry| Instant::now() < entry.expires)
            .map(|entry| entry.addr)
    }

    /// Complete a pending lookup. A positive answer is cached for `ttl`.
    pub fn answer(&mut self, hostname: &str, addr: Option<Ipv4Addr>, ttl: Duration) {
        let key = normalize(hostname);
        if let Some(addr) = addr {
            let expires = Instant::now() + ttl.min(self.max_ttl);
            self.cache.insert(key.clone(), CacheEntry { addr, expires });
        }

        let Some(query) = self.pending.remove(&key) else {
            return;
        };
        tracing::debug!(hostname = %key, ?addr, waiters = query.callbacks.len(), "dns answer");
        for callback in query.callbacks {
            callback(hostname, addr);
        }
    }
}

impl DnsClient for CachingResolver {
    fn resolve(&mut self, server: Ipv4Addr, hostname: &str, callback: ResolveFn, force: bool) {
        if !force {
            if let Some(addr) = self.cached(hostname) {
                tracing::trace!(hostname, %addr, "dns cache hit");
                callback(hostname, Some(addr));
                return;
            }
        }

        self.pending
            .entry(normalize(hostname))
            .or_insert_with(|| PendingQuery {
                server,
                callbacks: Vec::new(),
            })
            .callbacks
            .push(callback);
    }

    fn flush_cache(&mut self) {
        self.cache.clear();
    }
}

impl Default for CachingResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CachingResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachingResolver")
            .field("cached", &self.cache.len())
            .field("pending", &self.pending.len())
            .field("max_ttl", &self.max_ttl)
            .finish()
    }
}

fn normalize(hostname: &str) -> String {
    hostname.trim_end_matches('.').to_ascii_lowercase()
}
