//! rocflash - Flash attention dispatch for AMD GPUs
//!
//! Validates attention parameter descriptors, selects a compiled kernel
//! variant for the device architecture and enqueues the forward or backward
//! pass on a caller-owned HIP stream.

#![allow(clippy::too_many_arguments)] // Kernel launches need many args
#![allow(clippy::needless_range_loop)] // Clearer for tiled index math
#![allow(clippy::manual_memcpy)] // Strided tensor copies are often manual
#![allow(clippy::type_complexity)]

pub mod attention;
pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod kernels;
pub mod logging;
pub mod params;
pub mod runner;

pub use backend::{DataType, GfxArch, HipBuffer, HipDevice, HipStream, WorkspacePool};
pub use config::{AccumulationStrategy, Bf16Rounding, RunnerConfig};
pub use engine::{BwdEngine, FlashBwdRunner, FlashFwdRunner, FwdEngine};
pub use error::{ErrorCategory, FlashError, FlashResult};
pub use kernels::{Direction, KernelTable, KernelVariant};
pub use params::{AttentionShape, FlashBwdParams, FlashFwdParams, TensorLayout, TensorStrides};
pub use runner::FlashRunner;
