//! Per-device stack registry
//!
//! Stacks are created by whoever brings up the devices and handed to the
//! registry, which gives each an index. Configuration helpers address
//! stacks by that index.

use std::marker::PhantomData;
use std::time::Duration;

use crate::iface::inet::{DhcpTimeoutFn, Inet, IpVersion};

pub struct StackRegistry<V: IpVersion, S: Inet<V> + ?Sized = dyn Inet<V>> {
    stacks: Vec<Box<S>>,
    _version: PhantomData<V>,
}

impl<V: IpVersion, S: Inet<V> + ?Sized> StackRegistry<V, S> {
    pub fn new() -> Self {
        StackRegistry {
            stacks: Vec::new(),
            _version: PhantomData,
        }
    }

    /// Take ownership of a stack, returning its index
    pub fn add(&mut self, stack: Box<S>) -> usize {
        self.stacks.push(stack);
        let idx = self.stacks.len() - 1;
        tracing::debug!(idx, ifname = self.stacks[idx].ifname(), version = V::NAME, "stack registered");
        idx
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn stack(&self, n: usize) -> Option<&S> {
        self.stacks.get(n).map(|stack| &**stack)
    }

    pub fn stack_mut(&mut self, n: usize) -> Option<&mut S> {
        self.stacks.get_mut(n).map(|stack| &mut **stack)
    }

    pub fn iter(&self) -> impl Iterator<Item = &S> + '_ {
        self.stacks.iter().map(|stack| &**stack)
    }

    /// Statically configure stack `n`. Returns false if there is no such stack.
    pub fn ifconfig(&mut self, n: usize, addr: V::Addr, netmask: V::Addr, gateway: V::Addr, dns: Option<V::Addr>) -> bool {
        let Some(stack) = self.stack_mut(n) else {
            tracing::warn!(n, "ifconfig on unknown stack");
            return false;
        };
        stack.network_config(addr, netmask, gateway, dns);
        true
    }

    /// Start DHCP on stack `n`. A zero timeout leaves the stack alone.
    pub fn ifconfig_dhcp(&mut self, n: usize, timeout: Duration, on_timeout: Option<DhcpTimeoutFn>) -> bool {
        if timeout.is_zero() {
            return false;
        }
        let Some(stack) = self.stack_mut(n) else {
            tracing::warn!(n, "ifconfig_dhcp on unknown stack");
            return false;
        };
        stack.negotiate_dhcp(timeout, on_timeout);
        true
    }
}

impl<V: IpVersion, S: Inet<V> + ?Sized> Default for StackRegistry<V, S> {
    fn default() -> Self {
        Self::new()
    }
}
