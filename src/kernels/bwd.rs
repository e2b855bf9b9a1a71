//! Flash attention backward
//!
//! Recomputes attention probabilities block by block from the saved row
//! statistics instead of reading a stored score matrix:
//!
//! ```text
//! D_i  = rowsum(dO_i * O_i)
//! P_ij = exp(scale * q_i.k_j - m_i) / l_i
//! dV_j += P_ij Z_ij dO_i            Z = keep / (1 - p), 0 when dropped
//! dP_ij = (dO_i.v_j) Z_ij
//! dS_ij = P_ij (dP_ij - D_i)
//! dK_j += scale dS_ij q_i
//! dQ_i += scale dS_ij k_j
//! ```
//!
//! Work is split into tasks of one key block of one (batch, kv head). A task
//! owns its dK/dV rows outright; dQ rows receive contributions from every key
//! block and are combined according to the [`AccumulationStrategy`].

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use rayon::prelude::*;

use crate::backend::{HipBuffer, WorkspacePool};
use crate::config::{AccumulationStrategy, Bf16Rounding};
use crate::kernels::dropout::DropoutMask;
use crate::kernels::registry::KernelTraits;
use crate::kernels::{axpy, dot, load_bhsd, store_bhsd, KernelResult};
use crate::params::{BwdProblem, FlashBwdParams};

/// Buffers a backward launch reads and writes
#[derive(Debug, Clone)]
pub struct BwdBuffers {
    pub q: HipBuffer,
    pub k: HipBuffer,
    pub v: HipBuffer,
    pub out: HipBuffer,
    pub softmax_stats: HipBuffer,
    pub dout: HipBuffer,
    pub dq: HipBuffer,
    pub dk: HipBuffer,
    pub dv: HipBuffer,
}

impl BwdBuffers {
    pub fn from_params(params: &FlashBwdParams) -> Self {
        let f = &params.fwd;
        BwdBuffers {
            q: f.q.clone(),
            k: f.k.clone(),
            v: f.v.clone(),
            out: f.out.clone(),
            softmax_stats: f.softmax_stats.clone(),
            dout: params.dout.clone(),
            dq: params.dq.clone(),
            dk: params.dk.clone(),
            dv: params.dv.clone(),
        }
    }
}

/// Scratch bytes a launch draws from the device workspace
pub fn workspace_bytes(
    problem: &BwdProblem,
    traits: &KernelTraits,
    accumulation: AccumulationStrategy,
) -> usize {
    let p = &problem.fwd;
    let dq_bytes = p.stats_rows() * p.head_dim * std::mem::size_of::<f32>();
    match accumulation {
        AccumulationStrategy::Atomic => dq_bytes,
        AccumulationStrategy::Deterministic => p.seqlen_k.div_ceil(traits.block_n) * dq_bytes,
    }
}

struct BwdTile {
    dk: Vec<f32>,
    dv: Vec<f32>,
    // [group, seqlen_q, head_dim] dQ partial; empty when accumulating atomically
    dq_partial: Vec<f32>,
}

struct BwdContext<'a> {
    problem: &'a BwdProblem,
    traits: &'a KernelTraits,
    q: &'a [f32],
    k: &'a [f32],
    v: &'a [f32],
    dout: &'a [f32],
    stats: &'a [f32],
    delta: &'a [f32],
    mask: DropoutMask,
}

impl BwdContext<'_> {
    fn tile(&self, b: usize, hk: usize, n_block: usize, dq_atomic: Option<&[AtomicU32]>) -> BwdTile {
        let p = &self.problem.fwd;
        let d = p.head_dim;
        let group = p.head_group();
        let rows = p.stats_rows();
        let n_start = n_block * self.traits.block_n;
        let n_end = (n_start + self.traits.block_n).min(p.seqlen_k);
        let n_len = n_end - n_start;
        let kv_base = (b * p.num_heads_k + hk) * p.seqlen_k;

        let mut tile = BwdTile {
            dk: vec![0.0; n_len * d],
            dv: vec![0.0; n_len * d],
            dq_partial: if dq_atomic.is_some() {
                Vec::new()
            } else {
                vec![0.0; group * p.seqlen_q * d]
            },
        };
        let mut dq_row = vec![0.0f32; d];

        // Under the causal mask query rows before n_start see none of these keys
        let first_row = if p.is_causal { n_start } else { 0 };
        let first_block_row = first_row - first_row % self.traits.block_m;

        for g in 0..group {
            let h = hk * group + g;
            for m_start in (first_block_row..p.seqlen_q).step_by(self.traits.block_m) {
                let m_end = (m_start + self.traits.block_m).min(p.seqlen_q);
                for i in m_start..m_end {
                    let limit = p.key_limit(i).min(n_end);
                    if limit <= n_start {
                        continue;
                    }
                    let row = p.stats_row(b, h, i);
                    let row_max = self.stats[row];
                    let inv_sum = 1.0 / self.stats[rows + row];
                    let delta = self.delta[row];
                    let q_row = &self.q[row * d..][..d];
                    let do_row = &self.dout[row * d..][..d];

                    dq_row.iter_mut().for_each(|x| *x = 0.0);
                    for j in n_start..limit {
                        let jj = j - n_start;
                        let k_row = &self.k[(kv_base + j) * d..][..d];
                        let v_row = &self.v[(kv_base + j) * d..][..d];

                        let prob = (p.softmax_scale * dot(q_row, k_row) - row_max).exp() * inv_sum;
                        let factor = self.mask.factor(b, h, i, j);
                        axpy(&mut tile.dv[jj * d..][..d], prob * factor, do_row);

                        let dp = dot(do_row, v_row) * factor;
                        let ds = p.softmax_scale * prob * (dp - delta);
                        axpy(&mut tile.dk[jj * d..][..d], ds, q_row);
                        axpy(&mut dq_row, ds, k_row);
                    }

                    match dq_atomic {
                        Some(acc) => {
                            for (cell, &value) in acc[row * d..][..d].iter().zip(&dq_row) {
                                atomic_add_f32(cell, value);
                            }
                        }
                        None => {
                            tile.dq_partial[(g * p.seqlen_q + i) * d..][..d].copy_from_slice(&dq_row);
                        }
                    }
                }
            }
        }
        tile
    }
}

#[inline]
fn atomic_add_f32(cell: &AtomicU32, value: f32) {
    let mut current = cell.load(Ordering::Relaxed);
    loop {
        let next = (f32::from_bits(current) + value).to_bits();
        match cell.compare_exchange_weak(current, next, Ordering::Relaxed, Ordering::Relaxed) {
            Ok(_) => return,
            Err(actual) => current = actual,
        }
    }
}

/// Run the backward kernel to completion
pub fn flash_bwd(
    problem: &BwdProblem,
    traits: &KernelTraits,
    accumulation: AccumulationStrategy,
    rounding: Bf16Rounding,
    workspace: &Arc<WorkspacePool>,
    buffers: &BwdBuffers,
) -> KernelResult<()> {
    let p = &problem.fwd;
    let d = p.head_dim;
    let rows = p.stats_rows();
    let q_dims = [p.batch_size, p.num_heads, p.seqlen_q, d];
    let k_dims = [p.batch_size, p.num_heads_k, p.seqlen_k, d];

    let _reservation = workspace.reserve(workspace_bytes(problem, traits, accumulation))?;

    let q = load_bhsd(&buffers.q, &p.q_layout, q_dims)?;
    let k = load_bhsd(&buffers.k, &p.k_layout, k_dims)?;
    let v = load_bhsd(&buffers.v, &p.v_layout, k_dims)?;
    let out = load_bhsd(&buffers.out, &p.out_layout, q_dims)?;
    let dout = load_bhsd(&buffers.dout, &problem.dout_layout, q_dims)?;
    let stats: Vec<f32> = {
        let storage = buffers.softmax_stats.read()?;
        (0..2 * rows).map(|idx| storage.load(idx)).collect()
    };

    let delta: Vec<f32> = dout
        .chunks_exact(d)
        .zip(out.chunks_exact(d))
        .map(|(do_row, o_row)| dot(do_row, o_row))
        .collect();

    let ctx = BwdContext {
        problem,
        traits,
        q: &q,
        k: &k,
        v: &v,
        dout: &dout,
        stats: &stats,
        delta: &delta,
        mask: DropoutMask::from_problem(p),
    };

    let n_blocks = p.seqlen_k.div_ceil(traits.block_n);
    let tasks: Vec<(usize, usize, usize)> = (0..p.batch_size)
        .flat_map(|b| {
            (0..p.num_heads_k).flat_map(move |hk| (0..n_blocks).map(move |nb| (b, hk, nb)))
        })
        .collect();

    let dq_atomic: Vec<AtomicU32> = match accumulation {
        AccumulationStrategy::Atomic => (0..rows * d).map(|_| AtomicU32::new(0)).collect(),
        AccumulationStrategy::Deterministic => Vec::new(),
    };
    let sink = match accumulation {
        AccumulationStrategy::Atomic => Some(dq_atomic.as_slice()),
        AccumulationStrategy::Deterministic => None,
    };

    let results: Vec<BwdTile> = if traits.fused {
        tasks
            .par_iter()
            .map(|&(b, hk, nb)| ctx.tile(b, hk, nb, sink))
            .collect()
    } else {
        tasks
            .iter()
            .map(|&(b, hk, nb)| ctx.tile(b, hk, nb, sink))
            .collect()
    };

    let mut dk = vec![0.0f32; k.len()];
    let mut dv = vec![0.0f32; v.len()];
    for (&(b, hk, nb), tile) in tasks.iter().zip(&results) {
        let first = ((b * p.num_heads_k + hk) * p.seqlen_k + nb * traits.block_n) * d;
        dk[first..first + tile.dk.len()].copy_from_slice(&tile.dk);
        dv[first..first + tile.dv.len()].copy_from_slice(&tile.dv);
    }

    let dq: Vec<f32> = match accumulation {
        AccumulationStrategy::Atomic => dq_atomic
            .iter()
            .map(|cell| f32::from_bits(cell.load(Ordering::Relaxed)))
            .collect(),
        AccumulationStrategy::Deterministic => {
            let group = p.head_group();
            let mut dq = vec![0.0f32; rows * d];
            // Fixed order: key blocks ascending, then batch, then kv head
            for nb in 0..n_blocks {
                for b in 0..p.batch_size {
                    for hk in 0..p.num_heads_k {
                        let tile = &results[(b * p.num_heads_k + hk) * n_blocks + nb];
                        for g in 0..group {
                            let h = hk * group + g;
                            let dst = p.stats_row(b, h, 0) * d;
                            let src = g * p.seqlen_q * d;
                            let len = p.seqlen_q * d;
                            for (acc, &x) in dq[dst..dst + len]
                                .iter_mut()
                                .zip(&tile.dq_partial[src..src + len])
                            {
                                *acc += x;
                            }
                        }
                    }
                }
            }
            dq
        }
    };

    store_bhsd(&buffers.dq, &problem.dq_layout, q_dims, &dq, rounding)?;
    store_bhsd(&buffers.dk, &problem.dk_layout, k_dims, &dk, rounding)?;
    store_bhsd(&buffers.dv, &problem.dv_layout, k_dims, &dv, rounding)?;
    Ok(())
}
