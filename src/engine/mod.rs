//! Forward and backward execution engines
//!
//! An engine owns an arch-filtered copy of the compiled kernel table and
//! the execution mode it was built with. Given a validated problem it picks
//! one variant and enqueues it on the caller's stream; it never blocks and
//! never synchronizes.
//!
//! - [`fwd`] - [`FlashFwdRunner`], the tiled forward engine
//! - [`bwd`] - [`FlashBwdRunner`], the recomputation backward engine

pub mod bwd;
pub mod fwd;

pub use bwd::FlashBwdRunner;
pub use fwd::FlashFwdRunner;

use crate::backend::HipStream;
use crate::config::RunnerConfig;
use crate::error::FlashResult;
use crate::kernels::KernelVariant;
use crate::params::{BwdProblem, FlashBwdParams, FlashFwdParams, FwdProblem};

/// Forward execution engine
pub trait FwdEngine: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &RunnerConfig;

    /// Variant that would run `problem`, or `UnsupportedConfiguration`
    fn select(&self, problem: &FwdProblem) -> FlashResult<&KernelVariant>;

    /// Enqueue the forward pass. `problem` must come from `params.validate()`.
    fn run(&self, params: &FlashFwdParams, problem: FwdProblem, stream: &HipStream) -> FlashResult<()>;
}

/// Backward execution engine
pub trait BwdEngine: Send + Sync {
    fn name(&self) -> &str;

    fn config(&self) -> &RunnerConfig;

    fn select(&self, problem: &BwdProblem) -> FlashResult<&KernelVariant>;

    /// Enqueue the backward pass. `problem` must come from `params.validate()`.
    fn run(&self, params: &FlashBwdParams, problem: BwdProblem, stream: &HipStream) -> FlashResult<()>;
}
