//! Fixed-capacity bit vectors indexed by physical cache slot.
//!
//! Every per-slot flag in the replay subsystem (dirty, wanted, a peer's
//! available/missing sets) is one of these. The wire format groups slots into
//! 16-wide ranges, so range-level accessors are provided alongside the
//! per-bit ones.

use std::ops::{BitAnd, BitAndAssign, BitOr, BitOrAssign, Not};

/// A bit vector of `WORDS * 64` bits.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BitVec<const WORDS: usize> {
    words: [u64; WORDS],
}

/// One bit per physical cache slot.
pub type SlotBits = BitVec<4>;

/// Slots per wire range.
pub const RANGE_WIDTH: usize = 16;

impl<const WORDS: usize> BitVec<WORDS> {
    pub const BITS: usize = WORDS * 64;

    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    pub fn set(&mut self, idx: usize) {
        self.words[idx / 64] |= 1 << (idx % 64);
    }

    pub fn clear(&mut self, idx: usize) {
        self.words[idx / 64] &= !(1 << (idx % 64));
    }

    pub fn assign(&mut self, idx: usize, value: bool) {
        if value {
            self.set(idx);
        } else {
            self.clear(idx);
        }
    }

    pub fn test(&self, idx: usize) -> bool {
        self.words[idx / 64] & (1 << (idx % 64)) != 0
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn none(&self) -> bool {
        !self.any()
    }

    pub fn clear_all(&mut self) {
        self.words = [0; WORDS];
    }

    /// Indices of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(w, &word)| {
            let mut rest = word;
            std::iter::from_fn(move || {
                if rest == 0 {
                    return None;
                }
                let bit = rest.trailing_zeros() as usize;
                rest &= rest - 1;
                Some(w * 64 + bit)
            })
        })
    }

    /// Number of 16-slot ranges.
    pub const fn ranges() -> usize {
        Self::BITS / RANGE_WIDTH
    }

    /// The 16 bits of range `range`; bit j is slot `range * 16 + j`.
    pub fn range(&self, range: usize) -> u16 {
        let word = self.words[range / 4];
        (word >> ((range % 4) * RANGE_WIDTH)) as u16
    }

    /// Overwrite range `range` with `bits`.
    pub fn set_range(&mut self, range: usize, bits: u16) {
        let shift = (range % 4) * RANGE_WIDTH;
        let word = &mut self.words[range / 4];
        *word = (*word & !(0xFFFF_u64 << shift)) | (u64::from(bits) << shift);
    }

    /// Bit r set when range r has any bit set.
    pub fn range_map(&self) -> u32 {
        (0..Self::ranges())
            .filter(|&r| self.range(r) != 0)
            .fold(0, |map, r| map | (1 << r))
    }
}

impl<const WORDS: usize> Default for BitVec<WORDS> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const WORDS: usize> std::fmt::Debug for BitVec<WORDS> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.ones()).finish()
    }
}

impl<const WORDS: usize> FromIterator<usize> for BitVec<WORDS> {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut bits = Self::new();
        for idx in iter {
            bits.set(idx);
        }
        bits
    }
}

impl<const WORDS: usize> BitAnd for BitVec<WORDS> {
    type Output = Self;

    fn bitand(mut self, rhs: Self) -> Self {
        self &= rhs;
        self
    }
}

impl<const WORDS: usize> BitAndAssign for BitVec<WORDS> {
    fn bitand_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words) {
            *a &= b;
        }
    }
}

impl<const WORDS: usize> BitOr for BitVec<WORDS> {
    type Output = Self;

    fn bitor(mut self, rhs: Self) -> Self {
        self |= rhs;
        self
    }
}

impl<const WORDS: usize> BitOrAssign for BitVec<WORDS> {
    fn bitor_assign(&mut self, rhs: Self) {
        for (a, b) in self.words.iter_mut().zip(rhs.words) {
            *a |= b;
        }
    }
}

impl<const WORDS: usize> Not for BitVec<WORDS> {
    type Output = Self;

    fn not(mut self) -> Self {
        for w in self.words.iter_mut() {
            *w = !*w;
        }
        self
    }
}
