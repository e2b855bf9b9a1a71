//! Common test utilities for runner integration tests
//!
//! Every test runs against a host-emulated device so results do not depend
//! on the machine's GPU or `HIP_VISIBLE_DEVICES`. Inputs come from a seeded
//! `StdRng`, so each test sees the same data on every run.
//!
//! # Usage
//!
//! ```ignore
//! mod common;
//! use common::{device, AttentionProblem};
//!
//! let problem = AttentionProblem::new(AttentionShape::new(1, 2, 32, 32, 64), DataType::F16, 7);
//! let runner = FlashRunner::on_device(device(), RunnerConfig::default());
//! ```

#![allow(dead_code)]

mod fixtures;

use once_cell::sync::Lazy;
use rocflash::{GfxArch, HipDevice};
pub use serial_test::serial;

pub use fixtures::{assert_close, bits, AttentionProblem};

/// Shared emulated gfx90a device
///
/// Tests that exercise workspace limits build their own device with
/// [`HipDevice::emulated_with_workspace`] instead.
pub static DEVICE_FIXTURE: Lazy<HipDevice> = Lazy::new(|| HipDevice::emulated(GfxArch::Gfx90a));

pub fn device() -> HipDevice {
    DEVICE_FIXTURE.clone()
}
