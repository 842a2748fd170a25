//! Multiply-with-carry generator.
//!
//! Used only to vary traversal order and read sizes between runs. Not cryptographic.

use std::time::{SystemTime, UNIX_EPOCH};

const DEFAULT_Z: u32 = 362_436_069;
const DEFAULT_W: u32 = 521_288_629;

/// Marsaglia MWC with two 16-bit lags.
#[derive(Debug, Clone)]
pub struct Mwc {
    z: u32,
    w: u32,
}

impl Default for Mwc {
    fn default() -> Self {
        Self::with_seed(DEFAULT_Z, DEFAULT_W)
    }
}

impl Mwc {
    #[must_use]
    pub fn with_seed(z: u32, w: u32) -> Self {
        // a zero lag makes that half of the generator stick at zero
        Self {
            z: if z == 0 { DEFAULT_Z } else { z },
            w: if w == 0 { DEFAULT_W } else { w },
        }
    }

    /// Seed from the clock and pid so concurrent runs diverge.
    #[must_use]
    pub fn from_entropy() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let pid = u64::from(std::process::id());
        let mixed = nanos ^ pid.rotate_left(32);
        Self::with_seed(mixed as u32, (mixed >> 32) as u32 ^ pid as u32)
    }

    pub fn next_u32(&mut self) -> u32 {
        self.z = 36_969u32
            .wrapping_mul(self.z & 0xffff)
            .wrapping_add(self.z >> 16);
        self.w = 18_000u32
            .wrapping_mul(self.w & 0xffff)
            .wrapping_add(self.w >> 16);
        (self.z << 16).wrapping_add(self.w)
    }

    /// Uniform-ish value in `0..bound`; returns 0 when `bound` is 0.
    pub fn below(&mut self, bound: u32) -> u32 {
        if bound == 0 { 0 } else { self.next_u32() % bound }
    }
}
