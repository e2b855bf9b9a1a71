//! Counter-based dropout RNG
//!
//! Keep decisions are a pure function of `(seed, offset, b, h, i, j)`, so the
//! backward kernel regenerates exactly the mask the forward kernel used
//! without it ever being stored.

use crate::params::FwdProblem;

/// Dropout mask generator for one problem
#[derive(Debug, Clone, Copy)]
pub struct DropoutMask {
    p: f32,
    seed: u64,
    offset: u64,
    num_heads: usize,
    seqlen_q: usize,
    seqlen_k: usize,
}

impl DropoutMask {
    pub fn new(
        p: f32,
        seed: u64,
        offset: u64,
        num_heads: usize,
        seqlen_q: usize,
        seqlen_k: usize,
    ) -> Self {
        DropoutMask {
            p,
            seed,
            offset,
            num_heads,
            seqlen_q,
            seqlen_k,
        }
    }

    pub fn from_problem(problem: &FwdProblem) -> Self {
        DropoutMask::new(
            problem.dropout_p,
            problem.philox_seed,
            problem.philox_offset,
            problem.num_heads,
            problem.seqlen_q,
            problem.seqlen_k,
        )
    }

    pub fn is_enabled(&self) -> bool {
        self.p > 0.0
    }

    /// Multiplier applied to kept probabilities
    pub fn keep_scale(&self) -> f32 {
        1.0 / (1.0 - self.p)
    }

    /// Whether score `(i, j)` of head `h` in batch `b` survives
    #[inline]
    pub fn keep(&self, b: usize, h: usize, i: usize, j: usize) -> bool {
        if !self.is_enabled() {
            return true;
        }
        let counter = (((b * self.num_heads + h) * self.seqlen_q + i) * self.seqlen_k + j) as u64;
        uniform(self.seed, self.offset.wrapping_add(counter)) >= self.p
    }

    /// `keep_scale()` for kept elements, 0 for dropped ones
    #[inline]
    pub fn factor(&self, b: usize, h: usize, i: usize, j: usize) -> f32 {
        if !self.is_enabled() {
            1.0
        } else if self.keep(b, h, i, j) {
            self.keep_scale()
        } else {
            0.0
        }
    }

    /// Dense `[batch, heads, seqlen_q, seqlen_k]` keep mask
    pub fn materialize(&self, batch_size: usize) -> Vec<bool> {
        let mut mask = Vec::with_capacity(batch_size * self.num_heads * self.seqlen_q * self.seqlen_k);
        for b in 0..batch_size {
            for h in 0..self.num_heads {
                for i in 0..self.seqlen_q {
                    for j in 0..self.seqlen_k {
                        mask.push(self.keep(b, h, i, j));
                    }
                }
            }
        }
        mask
    }
}

#[inline]
fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Uniform in [0, 1) with 24 bits of resolution
#[inline]
fn uniform(seed: u64, counter: u64) -> f32 {
    let bits = splitmix64(seed ^ splitmix64(counter));
    (bits >> 40) as f32 * (1.0 / (1u64 << 24) as f32)
}
