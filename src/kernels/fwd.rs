//! Flash attention forward
//!
//! Each tile covers `block_m` query rows of one (batch, head). Keys are
//! consumed in blocks of `block_n`; per row the kernel keeps a running max
//! `m`, a running sum of exponentials `l` and an unnormalized f32 output
//! accumulator, rescaling the latter two by `exp(m_old - m_new)` whenever a
//! block raises the max. The score matrix is never materialized.
//!
//! Saved statistics are `m` (in scaled-score units) and `l` for every row;
//! the normalizer uses pre-dropout probabilities.

use rayon::prelude::*;

use crate::backend::HipBuffer;
use crate::config::Bf16Rounding;
use crate::kernels::dropout::DropoutMask;
use crate::kernels::registry::KernelTraits;
use crate::kernels::{axpy, dot, load_bhsd, store_bhsd, KernelResult};
use crate::params::{FlashFwdParams, FwdProblem};

/// Buffers a forward launch reads and writes
#[derive(Debug, Clone)]
pub struct FwdBuffers {
    pub q: HipBuffer,
    pub k: HipBuffer,
    pub v: HipBuffer,
    pub out: HipBuffer,
    pub softmax_stats: HipBuffer,
}

impl FwdBuffers {
    pub fn from_params(params: &FlashFwdParams) -> Self {
        FwdBuffers {
            q: params.q.clone(),
            k: params.k.clone(),
            v: params.v.clone(),
            out: params.out.clone(),
            softmax_stats: params.softmax_stats.clone(),
        }
    }
}

struct FwdTile {
    out: Vec<f32>,
    row_max: Vec<f32>,
    row_sum: Vec<f32>,
}

struct FwdContext<'a> {
    problem: &'a FwdProblem,
    traits: &'a KernelTraits,
    q: &'a [f32],
    k: &'a [f32],
    v: &'a [f32],
    mask: DropoutMask,
}

impl FwdContext<'_> {
    fn tile(&self, b: usize, h: usize, m_block: usize) -> FwdTile {
        let p = self.problem;
        let d = p.head_dim;
        let row_start = m_block * self.traits.block_m;
        let row_end = (row_start + self.traits.block_m).min(p.seqlen_q);
        let rows = row_end - row_start;

        let mut tile = FwdTile {
            out: vec![0.0; rows * d],
            row_max: vec![f32::NEG_INFINITY; rows],
            row_sum: vec![0.0; rows],
        };
        let mut scores = vec![0.0f32; self.traits.block_n];

        for (r, out_row) in tile.out.chunks_exact_mut(d).enumerate() {
            let (m, l) = self.row(b, h, row_start + r, out_row, &mut scores);
            tile.row_max[r] = m;
            tile.row_sum[r] = l;
        }
        tile
    }

    /// Attend one query row; `acc` receives the normalized output
    fn row(&self, b: usize, h: usize, i: usize, acc: &mut [f32], scores: &mut [f32]) -> (f32, f32) {
        let p = self.problem;
        let d = p.head_dim;
        let hk = p.kv_head(h);
        let q_row = &self.q[((b * p.num_heads + h) * p.seqlen_q + i) * d..][..d];
        let kv_base = (b * p.num_heads_k + hk) * p.seqlen_k;
        let limit = p.key_limit(i);

        let mut m = f32::NEG_INFINITY;
        let mut l = 0.0f32;

        for n_start in (0..limit).step_by(self.traits.block_n) {
            let n_end = (n_start + self.traits.block_n).min(limit);
            let block = &mut scores[..n_end - n_start];
            for (jj, s) in block.iter_mut().enumerate() {
                let k_row = &self.k[(kv_base + n_start + jj) * d..][..d];
                *s = p.softmax_scale * dot(q_row, k_row);
            }

            let block_max = block.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let m_new = m.max(block_max);
            if !(self.traits.fused && m_new == m) {
                let alpha = (m - m_new).exp();
                l *= alpha;
                acc.iter_mut().for_each(|a| *a *= alpha);
            }

            for (jj, &s) in block.iter().enumerate() {
                let j = n_start + jj;
                let prob = (s - m_new).exp();
                l += prob;
                let factor = self.mask.factor(b, h, i, j);
                if factor != 0.0 {
                    let v_row = &self.v[(kv_base + j) * d..][..d];
                    axpy(acc, prob * factor, v_row);
                }
            }
            m = m_new;
        }

        let inv = 1.0 / l;
        acc.iter_mut().for_each(|a| *a *= inv);
        (m, l)
    }
}

/// Run the forward kernel to completion
pub fn flash_fwd(
    problem: &FwdProblem,
    traits: &KernelTraits,
    rounding: Bf16Rounding,
    buffers: &FwdBuffers,
) -> KernelResult<()> {
    let p = problem;
    let q_dims = [p.batch_size, p.num_heads, p.seqlen_q, p.head_dim];
    let k_dims = [p.batch_size, p.num_heads_k, p.seqlen_k, p.head_dim];

    let q = load_bhsd(&buffers.q, &p.q_layout, q_dims)?;
    let k = load_bhsd(&buffers.k, &p.k_layout, k_dims)?;
    let v = load_bhsd(&buffers.v, &p.v_layout, k_dims)?;

    let ctx = FwdContext {
        problem: p,
        traits,
        q: &q,
        k: &k,
        v: &v,
        mask: DropoutMask::from_problem(p),
    };

    let m_blocks = p.seqlen_q.div_ceil(traits.block_m);
    let tiles: Vec<(usize, usize, usize)> = (0..p.batch_size)
        .flat_map(|b| (0..p.num_heads).flat_map(move |h| (0..m_blocks).map(move |mb| (b, h, mb))))
        .collect();

    let results: Vec<FwdTile> = if traits.fused {
        tiles.par_iter().map(|&(b, h, mb)| ctx.tile(b, h, mb)).collect()
    } else {
        tiles.iter().map(|&(b, h, mb)| ctx.tile(b, h, mb)).collect()
    };

    let rows = p.stats_rows();
    let mut out = vec![0.0f32; q.len()];
    let mut stats = vec![0.0f32; 2 * rows];
    for (&(b, h, mb), tile) in tiles.iter().zip(results) {
        let row_start = mb * traits.block_m;
        let first = p.stats_row(b, h, row_start);
        let n = tile.row_max.len();
        out[first * p.head_dim..(first + n) * p.head_dim].copy_from_slice(&tile.out);
        stats[first..first + n].copy_from_slice(&tile.row_max);
        stats[rows + first..rows + first + n].copy_from_slice(&tile.row_sum);
    }

    store_bhsd(&buffers.out, &p.out_layout, q_dims, &out, rounding)?;
    let mut storage = buffers.softmax_stats.write()?;
    for (idx, &value) in stats.iter().enumerate() {
        storage.store(idx, value, rounding);
    }
    Ok(())
}
