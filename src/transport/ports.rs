//! Port bookkeeping and ephemeral port generation
//!
//! `PortUtil` tracks the full 16-bit port space in a bitmap where a set bit
//! means the port is free and a cleared bit means it is bound. Ephemeral
//! ports are handed out from the dynamic range (RFC 6335) by advancing a
//! cursor; on collision only the dynamic window of the bitmap is scanned.

use crate::util::{BitmapView, FixedBitmap};
use rand::Rng;
use thiserror::Error;

/// Port range constants (RFC 6335)
pub mod port_ranges {
    pub const SYSTEM_START: u16 = 0;
    pub const SYSTEM_END: u16 = 1023;
    pub const REGISTERED_START: u16 = 1024;
    pub const REGISTERED_END: u16 = 49151;
    pub const DYNAMIC_START: u16 = 49152;
    pub const DYNAMIC_END: u16 = 65535;

    /// Number of ports in the dynamic range
    pub const DYNAMIC_SIZE: u32 = DYNAMIC_END as u32 - DYNAMIC_START as u32 + 1;

    pub const fn is_dynamic(port: u16) -> bool {
        port >= DYNAMIC_START
    }
}

use port_ranges::{is_dynamic, DYNAMIC_END, DYNAMIC_SIZE, DYNAMIC_START};

const PORT_SPACE: usize = 1 << 16;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PortError {
    #[error("all ephemeral ports are taken")]
    EphemeralExhausted,
    #[error("port {0} is already bound")]
    InUse(u16),
}

/// Pick a random starting point inside the dynamic range
pub fn new_ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(DYNAMIC_START..=DYNAMIC_END)
}

/// Free/bound map over every port plus the ephemeral cursor.
#[derive(Debug)]
pub struct PortUtil {
    ports: FixedBitmap<PORT_SPACE>,
    eph_view: BitmapView,
    ephemeral: u16,
    eph_count: u32,
}

impl PortUtil {
    /// All ports free, cursor at a random ephemeral port
    pub fn new() -> Self {
        Self::with_cursor(new_ephemeral_port())
    }

    /// All ports free, cursor at `start`.
    ///
    /// A `start` below the dynamic range is moved to `DYNAMIC_START`.
    pub fn with_cursor(start: u16) -> Self {
        let mut ports = FixedBitmap::new();
        ports.set_all();

        PortUtil {
            ports,
            eph_view: BitmapView::new(DYNAMIC_START as usize, DYNAMIC_SIZE as usize),
            ephemeral: start.max(DYNAMIC_START),
            eph_count: 0,
        }
    }

    /// Mark `port` as bound.
    ///
    /// Binding a port that is already bound leaves the ephemeral counter alone.
    pub fn bind(&mut self, port: u16) {
        if self.is_bound(port) {
            tracing::warn!(port, "bind on already bound port");
            return;
        }
        self.ports.reset(port as usize);

        if is_dynamic(port) {
            self.eph_count += 1;
        }
    }

    /// Mark `port` as free.
    ///
    /// Unbinding a free port leaves the ephemeral counter alone.
    pub fn unbind(&mut self, port: u16) {
        if !self.is_bound(port) {
            tracing::warn!(port, "unbind on free port");
            return;
        }
        self.ports.set(port as usize);

        if is_dynamic(port) {
            self.eph_count -= 1;
        }
    }

    pub fn is_bound(&self, port: u16) -> bool {
        !self.ports.get(port as usize)
    }

    pub fn has_free_ephemeral(&self) -> bool {
        self.eph_count < DYNAMIC_SIZE
    }

    /// Number of bound ports inside the dynamic range
    pub fn ephemeral_in_use(&self) -> u32 {
        self.eph_count
    }

    /// The last ephemeral port handed out
    pub fn cursor(&self) -> u16 {
        self.ephemeral
    }

    /// Advance the cursor to the next free ephemeral port and return it.
    ///
    /// The port is not bound by this call; callers claiming it must `bind` it.
    ///
    /// # Panics
    ///
    /// Panics if the bitmap and the ephemeral counter disagree, which means
    /// the port map is corrupt.
    pub fn get_next_ephemeral(&mut self) -> Result<u16, PortError> {
        if !self.has_free_ephemeral() {
            return Err(PortError::EphemeralExhausted);
        }

        // wrap around to the start of the dynamic range, never to zero
        self.ephemeral = match self.ephemeral.checked_add(1) {
            Some(port) => port,
            None => DYNAMIC_START,
        };

        if self.is_bound(self.ephemeral) {
            let Some(idx) = self.eph_view.first_set(&self.ports) else {
                panic!(
                    "no free ephemeral port although {} of {} are in use",
                    self.eph_count, DYNAMIC_SIZE
                );
            };
            self.ephemeral = DYNAMIC_START + idx as u16;
        }

        assert!(
            !self.is_bound(self.ephemeral),
            "generated ephemeral port {} is already bound",
            self.ephemeral
        );
        tracing::trace!(port = self.ephemeral, "next ephemeral port");
        Ok(self.ephemeral)
    }
}

impl Default for PortUtil {
    fn default() -> Self {
        Self::new()
    }
}
