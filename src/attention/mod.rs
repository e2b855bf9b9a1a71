//! Reference attention
//!
//! The naive full-matrix implementation the tiled kernels are checked
//! against.

pub mod cpu;

pub use cpu::{CpuReference, ReferenceForward, ReferenceGrads};
