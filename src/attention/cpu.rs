//! Naive CPU reference attention
//!
//! Materializes the full score matrix in f64. Slow and memory hungry, but
//! independent of the tiled kernels, which makes it the oracle for tests and
//! benchmarks. Tensors are dense `[b, h, s, d]` f32 slices.

use crate::params::FwdProblem;

/// Reference forward results
#[derive(Debug, Clone)]
pub struct ReferenceForward {
    /// `[b, h, seqlen_q, d]`
    pub out: Vec<f32>,
    /// Row max of the scaled scores, per `(b, h, i)`
    pub row_max: Vec<f32>,
    /// Row sum of `exp(score - row_max)`, per `(b, h, i)`
    pub row_sum: Vec<f32>,
}

/// Reference gradients
#[derive(Debug, Clone)]
pub struct ReferenceGrads {
    pub dq: Vec<f32>,
    pub dk: Vec<f32>,
    pub dv: Vec<f32>,
}

/// CPU reference implementation
pub struct CpuReference;

impl CpuReference {
    /// Softmax attention forward. `keep` is an optional dense
    /// `[b, h, seqlen_q, seqlen_k]` dropout keep mask.
    pub fn forward(
        problem: &FwdProblem,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        keep: Option<&[bool]>,
    ) -> ReferenceForward {
        let p = problem;
        let d = p.head_dim;
        let rows = p.stats_rows();
        let mut result = ReferenceForward {
            out: vec![0.0; rows * d],
            row_max: vec![0.0; rows],
            row_sum: vec![0.0; rows],
        };

        for b in 0..p.batch_size {
            for h in 0..p.num_heads {
                let probs = probabilities(p, q, k, b, h);
                for i in 0..p.seqlen_q {
                    let row = p.stats_row(b, h, i);
                    let scores = scores_row(p, q, k, b, h, i);
                    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                    result.row_max[row] = max as f32;
                    result.row_sum[row] = scores.iter().map(|s| (s - max).exp()).sum::<f64>() as f32;

                    let mut acc = vec![0.0f64; d];
                    for j in 0..p.key_limit(i) {
                        let weight = probs[i * p.seqlen_k + j] * dropout_factor(p, keep, b, h, i, j);
                        let v_row = kv_row(p, v, b, p.kv_head(h), j);
                        for (a, &x) in acc.iter_mut().zip(v_row) {
                            *a += weight * x as f64;
                        }
                    }
                    for (o, a) in result.out[row * d..][..d].iter_mut().zip(acc) {
                        *o = a as f32;
                    }
                }
            }
        }
        result
    }

    /// Gradients of `sum(out * dout)` with respect to q, k and v
    pub fn backward(
        problem: &FwdProblem,
        q: &[f32],
        k: &[f32],
        v: &[f32],
        dout: &[f32],
        keep: Option<&[bool]>,
    ) -> ReferenceGrads {
        let p = problem;
        let d = p.head_dim;
        let sk = p.seqlen_k;
        let mut dq = vec![0.0f64; p.stats_rows() * d];
        let mut dk = vec![0.0f64; k.len()];
        let mut dv = vec![0.0f64; v.len()];

        for b in 0..p.batch_size {
            for h in 0..p.num_heads {
                let hk = p.kv_head(h);
                let probs = probabilities(p, q, k, b, h);
                for i in 0..p.seqlen_q {
                    let row = p.stats_row(b, h, i);
                    let q_row = &q[row * d..][..d];
                    let do_row = &dout[row * d..][..d];
                    let limit = p.key_limit(i);

                    // dP_ij through the dropout mask
                    let dp: Vec<f64> = (0..limit)
                        .map(|j| {
                            let v_row = kv_row(p, v, b, hk, j);
                            dot64(do_row, v_row) * dropout_factor(p, keep, b, h, i, j)
                        })
                        .collect();
                    let weighted: f64 = (0..limit).map(|j| probs[i * sk + j] * dp[j]).sum();

                    for j in 0..limit {
                        let prob = probs[i * sk + j];
                        let factor = dropout_factor(p, keep, b, h, i, j);
                        let ds = prob * (dp[j] - weighted) * p.softmax_scale as f64;
                        let kv = ((b * p.num_heads_k + hk) * sk + j) * d;
                        let k_row = &k[kv..][..d];
                        for x in 0..d {
                            dv[kv + x] += prob * factor * do_row[x] as f64;
                            dk[kv + x] += ds * q_row[x] as f64;
                            dq[row * d + x] += ds * k_row[x] as f64;
                        }
                    }
                }
            }
        }

        let narrow = |v: Vec<f64>| -> Vec<f32> { v.into_iter().map(|x| x as f32).collect() };
        ReferenceGrads {
            dq: narrow(dq),
            dk: narrow(dk),
            dv: narrow(dv),
        }
    }
}

fn kv_row<'a>(p: &FwdProblem, t: &'a [f32], b: usize, hk: usize, j: usize) -> &'a [f32] {
    &t[((b * p.num_heads_k + hk) * p.seqlen_k + j) * p.head_dim..][..p.head_dim]
}

fn dot64(a: &[f32], b: &[f32]) -> f64 {
    a.iter().zip(b).map(|(&x, &y)| x as f64 * y as f64).sum()
}

/// Scaled scores of the visible keys of row `i`
fn scores_row(p: &FwdProblem, q: &[f32], k: &[f32], b: usize, h: usize, i: usize) -> Vec<f64> {
    let row = p.stats_row(b, h, i);
    let q_row = &q[row * p.head_dim..][..p.head_dim];
    (0..p.key_limit(i))
        .map(|j| p.softmax_scale as f64 * dot64(q_row, kv_row(p, k, b, p.kv_head(h), j)))
        .collect()
}

/// Dense `[seqlen_q, seqlen_k]` softmax of one head; masked entries are 0
fn probabilities(p: &FwdProblem, q: &[f32], k: &[f32], b: usize, h: usize) -> Vec<f64> {
    let mut probs = vec![0.0f64; p.seqlen_q * p.seqlen_k];
    for i in 0..p.seqlen_q {
        let scores = scores_row(p, q, k, b, h, i);
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let sum: f64 = scores.iter().map(|s| (s - max).exp()).sum();
        for (j, s) in scores.iter().enumerate() {
            probs[i * p.seqlen_k + j] = (s - max).exp() / sum;
        }
    }
    probs
}

fn dropout_factor(p: &FwdProblem, keep: Option<&[bool]>, b: usize, h: usize, i: usize, j: usize) -> f64 {
    match keep {
        Some(mask) if p.dropout_p > 0.0 => {
            let idx = ((b * p.num_heads + h) * p.seqlen_q + i) * p.seqlen_k + j;
            if mask[idx] {
                1.0 / (1.0 - p.dropout_p as f64)
            } else {
                0.0
            }
        }
        _ => 1.0,
    }
}
