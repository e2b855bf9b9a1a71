//! Seeded attention inputs and descriptor builders

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rocflash::{AttentionShape, DataType, FlashBwdParams, FlashFwdParams, HipBuffer};

/// Host copies of one problem's inputs
///
/// Values are drawn once and kept in f32. Descriptors built from the same
/// fixture see the same data.
#[derive(Debug, Clone)]
pub struct AttentionProblem {
    pub shape: AttentionShape,
    pub dtype: DataType,
    pub q: Vec<f32>,
    pub k: Vec<f32>,
    pub v: Vec<f32>,
    pub dout: Vec<f32>,
}

impl AttentionProblem {
    pub fn new(shape: AttentionShape, dtype: DataType, seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut draw = |len: usize| -> Vec<f32> { (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect() };
        let q = draw(shape.q_numel());
        let k = draw(shape.k_numel());
        let v = draw(shape.k_numel());
        let dout = draw(shape.q_numel());
        AttentionProblem {
            shape,
            dtype,
            q,
            k,
            v,
            dout,
        }
    }

    /// Forward descriptor over fresh device buffers
    pub fn fwd_params(&self) -> FlashFwdParams {
        FlashFwdParams::new(
            self.shape,
            self.dtype,
            HipBuffer::from_host(self.dtype, &self.q),
            HipBuffer::from_host(self.dtype, &self.k),
            HipBuffer::from_host(self.dtype, &self.v),
            HipBuffer::zeros(self.dtype, self.shape.q_numel()),
            HipBuffer::zeros(DataType::F32, self.shape.stats_numel()),
        )
    }

    /// Backward descriptor reusing the forward buffers of `fwd`
    pub fn bwd_params(&self, fwd: &FlashFwdParams) -> FlashBwdParams {
        FlashBwdParams::new(
            fwd.clone(),
            HipBuffer::from_host(self.dtype, &self.dout),
            HipBuffer::zeros(self.dtype, self.shape.q_numel()),
            HipBuffer::zeros(self.dtype, self.shape.k_numel()),
            HipBuffer::zeros(self.dtype, self.shape.k_numel()),
        )
    }
}

pub fn assert_close(actual: &[f32], expected: &[f32], tol: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!(
            (a - e).abs() <= tol * (1.0 + e.abs()),
            "mismatch at {}: got {}, expected {}",
            idx,
            a,
            e
        );
    }
}

/// Raw bit patterns, for bitwise comparisons
pub fn bits(buffer: &HipBuffer) -> Vec<u32> {
    buffer
        .to_host()
        .unwrap()
        .iter()
        .map(|x| x.to_bits())
        .collect()
}
