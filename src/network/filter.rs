//! Packet filter chains
//!
//! A chain is an ordered list of filters attached to one hook of the packet
//! path. Filters run in registration order; the first `Drop` ends traversal
//! and the packet goes no further than that hook. Filters may rewrite the
//! packet before returning `Accept`.

use std::fmt;

use crate::network::packet::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verdict {
    Accept,
    Drop,
}

/// Attachment points in the packet path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hook {
    /// Every inbound packet, before the routing decision
    Prerouting,
    /// Inbound packets for this stack, before protocol dispatch
    Input,
    /// Inbound packets for other hosts, before retransmission
    Forward,
    /// Locally originated packets, before the routing decision
    Output,
    /// Every packet about to leave the device
    Postrouting,
}

impl Hook {
    pub const ALL: [Hook; 5] = [
        Hook::Prerouting,
        Hook::Input,
        Hook::Forward,
        Hook::Output,
        Hook::Postrouting,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Hook::Prerouting => "Prerouting",
            Hook::Input => "Input",
            Hook::Forward => "Forward",
            Hook::Output => "Output",
            Hook::Postrouting => "Postrouting",
        }
    }

    pub(crate) const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A filter sees the packet and a read-only view of its owner (the stack).
pub type Filter<C> = Box<dyn FnMut(&mut Packet, &C) -> Verdict>;

pub struct FilterChain<C: ?Sized> {
    name: &'static str,
    chain: Vec<Box<dyn FnMut(&mut Packet, &C) -> Verdict>>,
}

impl<C: ?Sized> FilterChain<C> {
    pub fn new(name: &'static str) -> Self {
        FilterChain {
            name,
            chain: Vec::new(),
        }
    }

    pub fn for_hook(hook: Hook) -> Self {
        Self::new(hook.name())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Append a filter at the end of the chain
    pub fn push<F>(&mut self, filter: F)
    where
        F: FnMut(&mut Packet, &C) -> Verdict + 'static,
    {
        self.chain.push(Box::new(filter));
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn clear(&mut self) {
        self.chain.clear();
    }

    /// Run the packet through every filter until one drops it
    pub fn run(&mut self, packet: &mut Packet, ctx: &C) -> Verdict {
        for (idx, filter) in self.chain.iter_mut().enumerate() {
            if filter(packet, ctx) == Verdict::Drop {
                tracing::debug!(chain = self.name, filter = idx, "packet dropped");
                return Verdict::Drop;
            }
        }
        Verdict::Accept
    }
}

impl<C: ?Sized> fmt::Debug for FilterChain<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterChain")
            .field("name", &self.name)
            .field("filters", &self.chain.len())
            .finish()
    }
}
