//! Attention kernels
//!
//! Host implementations of the compiled flash-attention instances:
//! - `registry`: the compiled variant table and selection
//! - `dropout`: counter-based keep mask shared by both passes
//! - `fwd`: tiled online-softmax forward
//! - `bwd`: recomputation backward with atomic or deterministic dQ

pub mod bwd;
pub mod dropout;
pub mod fwd;
pub mod registry;


pub use dropout::DropoutMask;
pub use registry::{
    Direction, HeadDimSupport, KernelKey, KernelTable, KernelTraits, KernelVariant,
};

use thiserror::Error;

use crate::backend::{HipBuffer, ScratchError};
use crate::config::Bf16Rounding;
use crate::error::FlashError;
use crate::params::StridedLayout;

/// Device-side failure of a running kernel
#[derive(Error, Debug)]
pub enum KernelError {
    #[error(transparent)]
    Workspace(#[from] ScratchError),

    #[error("buffer access failed: {0}")]
    Buffer(#[from] FlashError),
}

pub type KernelResult<T> = Result<T, KernelError>;

/// Gather a strided `[b, h, s, d]` tensor into a dense f32 copy
pub(crate) fn load_bhsd(
    buffer: &HipBuffer,
    layout: &StridedLayout,
    dims: [usize; 4],
) -> KernelResult<Vec<f32>> {
    let [batch, heads, seqlen, head_dim] = dims;
    let storage = buffer.read()?;
    let mut dense = Vec::with_capacity(batch * heads * seqlen * head_dim);
    for b in 0..batch {
        for h in 0..heads {
            for s in 0..seqlen {
                let base = layout.offset(b, h, s);
                dense.extend((0..head_dim).map(|d| storage.load(base + d)));
            }
        }
    }
    Ok(dense)
}

/// Scatter a dense `[b, h, s, d]` f32 tensor into a strided buffer
pub(crate) fn store_bhsd(
    buffer: &HipBuffer,
    layout: &StridedLayout,
    dims: [usize; 4],
    dense: &[f32],
    rounding: Bf16Rounding,
) -> KernelResult<()> {
    let [batch, heads, seqlen, head_dim] = dims;
    let mut storage = buffer.write()?;
    let mut src = dense.iter();
    for b in 0..batch {
        for h in 0..heads {
            for s in 0..seqlen {
                let base = layout.offset(b, h, s);
                for d in 0..head_dim {
                    if let Some(&value) = src.next() {
                        storage.store(base + d, value, rounding);
                    }
                }
            }
        }
    }
    Ok(())
}

#[inline]
pub(crate) fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `acc += alpha * x`
#[inline]
pub(crate) fn axpy(acc: &mut [f32], alpha: f32, x: &[f32]) {
    for (a, &v) in acc.iter_mut().zip(x) {
        *a += alpha * v;
    }
}
