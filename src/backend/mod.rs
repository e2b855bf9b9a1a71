//! ROCm/HIP backend module

pub mod hip_backend;
pub mod scratch;

pub use hip_backend::*;
pub use scratch::{ScratchError, WorkspacePool, WorkspaceReservation};
