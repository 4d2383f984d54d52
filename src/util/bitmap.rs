//! Fixed-size bit set with windowed views
//!
//! `FixedBitmap` stores `N` bits in a `bitvec` buffer of 64-bit words. A
//! `BitmapView` addresses a contiguous window of a larger bitmap so that
//! scans can be restricted to that window (e.g. the ephemeral port range)
//! without touching the rest of the set.

use bitvec::prelude::*;

/// A bit set holding exactly `N` bits
#[derive(Clone)]
pub struct FixedBitmap<const N: usize> {
    bits: BitVec<u64, Lsb0>,
}

impl<const N: usize> FixedBitmap<N> {
    /// Create a bitmap with every bit cleared
    pub fn new() -> Self {
        FixedBitmap {
            bits: bitvec![u64, Lsb0; 0; N],
        }
    }

    /// Number of bits in the set
    pub const fn size(&self) -> usize {
        N
    }

    pub fn set_all(&mut self) {
        self.bits.fill(true);
    }

    pub fn reset_all(&mut self) {
        self.bits.fill(false);
    }

    pub fn set(&mut self, bit: usize) {
        self.bits.set(bit, true);
    }

    pub fn reset(&mut self, bit: usize) {
        self.bits.set(bit, false);
    }

    pub fn get(&self, bit: usize) -> bool {
        self.bits[bit]
    }

    /// Count set bits across the whole bitmap
    pub fn count_ones(&self) -> usize {
        self.bits.count_ones()
    }

    fn window(&self, start: usize, len: usize) -> &BitSlice<u64, Lsb0> {
        &self.bits[start..start + len]
    }
}

impl<const N: usize> Default for FixedBitmap<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> std::fmt::Debug for FixedBitmap<N> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedBitmap")
            .field("size", &N)
            .field("ones", &self.count_ones())
            .finish()
    }
}

/// A window `[start, start + len)` over a `FixedBitmap`.
///
/// Indices passed to and returned from a view are relative to `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitmapView {
    start: usize,
    len: usize,
}

impl BitmapView {
    pub const fn new(start: usize, len: usize) -> Self {
        BitmapView { start, len }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get<const N: usize>(&self, bitmap: &FixedBitmap<N>, idx: usize) -> bool {
        debug_assert!(idx < self.len);
        bitmap.get(self.start + idx)
    }

    /// Relative index of the first set bit inside the window
    pub fn first_set<const N: usize>(&self, bitmap: &FixedBitmap<N>) -> Option<usize> {
        debug_assert!(self.start + self.len <= N);
        bitmap.window(self.start, self.len).first_one()
    }
}
