//! Host-emulated HIP runtime
//!
//! Devices, streams and buffers with the semantics the attention engines
//! rely on: asynchronous in-order launch queues, typed device storage and
//! per-device kernel workspace.

mod device;
mod memory;
mod stream;

pub use device::{GfxArch, HipDevice};
pub use memory::{DataType, HipBuffer};
pub use stream::HipStream;
