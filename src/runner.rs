//! Public entry point: `FlashRunner`
//!
//! A runner is created once per calling context. Every call validates its
//! descriptor synchronously, then hands the validated problem to the owned
//! forward or backward engine, which selects a kernel and enqueues it on the
//! caller's stream. Nothing about a call is retained afterwards.

use crate::backend::{HipDevice, HipStream};
use crate::config::RunnerConfig;
use crate::engine::{BwdEngine, FlashBwdRunner, FlashFwdRunner, FwdEngine};
use crate::error::{FlashError, FlashResult};
use crate::params::{FlashBwdParams, FlashFwdParams};

/// Flash attention runner owning one forward and one backward engine
#[derive(Debug)]
pub struct FlashRunner<F: FwdEngine = FlashFwdRunner, B: BwdEngine = FlashBwdRunner> {
    device: HipDevice,
    config: RunnerConfig,
    fwd: F,
    bwd: B,
}

impl FlashRunner {
    /// Runner on the current device from the two framework flags
    pub fn new(unit_test_mode: bool, deterministic_mode: bool) -> FlashResult<Self> {
        Self::with_config(RunnerConfig::from_flags(unit_test_mode, deterministic_mode))
    }

    pub fn with_config(config: RunnerConfig) -> FlashResult<Self> {
        let device = HipDevice::current()?;
        Ok(Self::on_device(device, config))
    }

    /// Runner configured from `ROCFLASH_*` environment variables
    pub fn from_env() -> FlashResult<Self> {
        Self::with_config(RunnerConfig::from_env()?)
    }

    pub fn on_device(device: HipDevice, config: RunnerConfig) -> Self {
        let fwd = FlashFwdRunner::new(&device, &config);
        let bwd = FlashBwdRunner::new(&device, &config);
        tracing::debug!(
            "FlashRunner: {} ({}) unit_test_mode={} accumulation={:?} bf16_rounding={:?}",
            device.name(),
            device.arch(),
            config.unit_test_mode,
            config.accumulation,
            config.bf16_rounding
        );
        FlashRunner {
            device,
            config,
            fwd,
            bwd,
        }
    }
}

impl<F: FwdEngine, B: BwdEngine> FlashRunner<F, B> {
    /// Runner over caller-provided engines
    pub fn from_engines(device: HipDevice, fwd: F, bwd: B) -> Self {
        let config = *fwd.config();
        FlashRunner {
            device,
            config,
            fwd,
            bwd,
        }
    }

    /// Enqueue the forward pass on `stream`
    ///
    /// Invalid descriptors and unsupported configurations fail here with
    /// nothing enqueued. Kernel failures are reported by
    /// [`HipStream::synchronize`].
    pub fn run_fwd(&self, params: &FlashFwdParams, stream: &HipStream) -> FlashResult<()> {
        let problem = params.validate().map_err(|e| {
            tracing::debug!("run_fwd: rejected descriptor: {}", e);
            e
        })?;
        self.check_stream(stream)?;
        self.fwd.run(params, problem, stream)
    }

    /// Enqueue the backward pass on `stream`
    ///
    /// Same contract as [`FlashRunner::run_fwd`]. The saved statistics must
    /// come from a forward pass over the same descriptor.
    pub fn run_bwd(&self, params: &FlashBwdParams, stream: &HipStream) -> FlashResult<()> {
        let problem = params.validate().map_err(|e| {
            tracing::debug!("run_bwd: rejected descriptor: {}", e);
            e
        })?;
        self.check_stream(stream)?;
        self.bwd.run(params, problem, stream)
    }

    fn check_stream(&self, stream: &HipStream) -> FlashResult<()> {
        if stream.device().same_device(&self.device) {
            Ok(())
        } else {
            Err(FlashError::InvalidParameters(format!(
                "stream {} belongs to device {}, runner uses device {}",
                stream.id(),
                stream.device().ordinal(),
                self.device.ordinal()
            )))
        }
    }

    pub fn device(&self) -> &HipDevice {
        &self.device
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn unit_test_mode(&self) -> bool {
        self.config.unit_test_mode
    }

    pub fn deterministic_mode(&self) -> bool {
        self.config.deterministic_mode()
    }

    pub fn fwd_engine(&self) -> &F {
        &self.fwd
    }

    pub fn bwd_engine(&self) -> &B {
        &self.bwd
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DataType, GfxArch, HipBuffer};
    use crate::config::AccumulationStrategy;
    use crate::params::AttentionShape;
    use serial_test::serial;

    fn fwd_params(shape: AttentionShape) -> FlashFwdParams {
        let dtype = DataType::F16;
        FlashFwdParams::new(
            shape,
            dtype,
            HipBuffer::zeros(dtype, shape.q_numel()),
            HipBuffer::zeros(dtype, shape.k_numel()),
            HipBuffer::zeros(dtype, shape.k_numel()),
            HipBuffer::zeros(dtype, shape.q_numel()),
            HipBuffer::zeros(DataType::F32, shape.stats_numel()),
        )
    }

    #[test]
    #[serial]
    fn test_runner_new_uses_flags() {
        std::env::remove_var("HIP_VISIBLE_DEVICES");
        std::env::remove_var("ROCFLASH_DEVICE_ARCH");
        let runner = FlashRunner::new(true, true).unwrap();
        assert!(runner.unit_test_mode());
        assert!(runner.deterministic_mode());
        assert_eq!(runner.bwd_engine().accumulation(), AccumulationStrategy::Deterministic);
        assert_eq!(runner.device().arch(), GfxArch::Gfx90a);
    }

    #[test]
    #[serial]
    fn test_runner_without_device() {
        std::env::set_var("HIP_VISIBLE_DEVICES", "-1");
        let err = FlashRunner::new(false, false).unwrap_err();
        std::env::remove_var("HIP_VISIBLE_DEVICES");
        assert!(matches!(err, FlashError::DeviceUnavailable(_)));
    }

    #[test]
    fn test_invalid_descriptor_enqueues_nothing() {
        let device = HipDevice::emulated(GfxArch::Gfx942);
        let runner = FlashRunner::on_device(device.clone(), RunnerConfig::default());
        let stream = HipStream::new(&device).unwrap();

        let mut params = fwd_params(AttentionShape::new(1, 2, 8, 8, 64));
        params.seqlen_q = -8;
        let err = runner.run_fwd(&params, &stream).unwrap_err();
        assert!(matches!(err, FlashError::InvalidParameters(_)));
        assert_eq!(stream.launch_count(), 0);
    }

    #[test]
    #[serial]
    fn test_stream_on_other_device_is_rejected() {
        std::env::set_var("HIP_VISIBLE_DEVICES", "0,1");
        let first = HipDevice::open(0).unwrap();
        let second = HipDevice::open(1).unwrap();
        std::env::remove_var("HIP_VISIBLE_DEVICES");

        let runner = FlashRunner::on_device(first.clone(), RunnerConfig::default());
        let params = fwd_params(AttentionShape::new(1, 2, 8, 8, 64));

        let foreign = HipStream::new(&second).unwrap();
        let err = runner.run_fwd(&params, &foreign).unwrap_err();
        assert!(matches!(err, FlashError::InvalidParameters(_)));
        assert_eq!(foreign.launch_count(), 0);

        let local = HipStream::new(&first).unwrap();
        runner.run_fwd(&params, &local).unwrap();
        local.synchronize().unwrap();
        assert_eq!(local.completed_count(), 1);
    }

    #[test]
    fn test_stream_on_other_hardware_class_is_rejected() {
        let runner = FlashRunner::on_device(HipDevice::emulated(GfxArch::Gfx942), RunnerConfig::default());
        let params = fwd_params(AttentionShape::new(1, 2, 8, 8, 64));

        for device in [HipDevice::emulated(GfxArch::Gfx1100), HipDevice::emulated(GfxArch::Gfx942)] {
            let stream = HipStream::new(&device).unwrap();
            let err = runner.run_fwd(&params, &stream).unwrap_err();
            assert!(matches!(err, FlashError::InvalidParameters(_)));
            assert_eq!(stream.launch_count(), 0);
            assert_eq!(params.softmax_stats.tag().unwrap(), None);
        }
    }

    #[test]
    fn test_from_engines() {
        let device = HipDevice::emulated(GfxArch::Gfx90a);
        let config = RunnerConfig::from_flags(true, false);
        let runner = FlashRunner::from_engines(
            device.clone(),
            FlashFwdRunner::new(&device, &config),
            FlashBwdRunner::new(&device, &config),
        );
        assert!(runner.unit_test_mode());
        assert!(!runner.deterministic_mode());
        assert_eq!(runner.fwd_engine().name(), "flash_fwd");
    }
}
