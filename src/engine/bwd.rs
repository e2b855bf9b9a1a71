//! Backward execution engine

use std::sync::Arc;

use crate::backend::{GfxArch, HipDevice, HipStream};
use crate::config::{AccumulationStrategy, RunnerConfig};
use crate::engine::BwdEngine;
use crate::error::FlashResult;
use crate::kernels::bwd::{flash_bwd, workspace_bytes, BwdBuffers};
use crate::kernels::{Direction, KernelKey, KernelTable, KernelVariant};
use crate::params::{BwdProblem, FlashBwdParams};

/// Recomputation backward engine
#[derive(Debug, Clone)]
pub struct FlashBwdRunner {
    arch: GfxArch,
    config: RunnerConfig,
    table: KernelTable,
}

impl FlashBwdRunner {
    pub fn new(device: &HipDevice, config: &RunnerConfig) -> Self {
        Self::with_table(device, config, KernelTable::compiled())
    }

    pub fn with_table(device: &HipDevice, config: &RunnerConfig, table: &KernelTable) -> Self {
        let table = table.for_engine(Direction::Bwd, device.arch());
        if table.is_empty() {
            tracing::warn!(
                "FlashBwdRunner::new: no backward kernels compiled for {}",
                device.arch()
            );
        }
        FlashBwdRunner {
            arch: device.arch(),
            config: *config,
            table,
        }
    }

    /// Engine with an explicit accumulation strategy, other modes from `config`
    pub fn with_accumulation(
        device: &HipDevice,
        config: &RunnerConfig,
        accumulation: AccumulationStrategy,
    ) -> Self {
        Self::new(device, &config.with_accumulation(accumulation))
    }

    pub fn accumulation(&self) -> AccumulationStrategy {
        self.config.accumulation
    }

    pub fn arch(&self) -> GfxArch {
        self.arch
    }

    pub fn table(&self) -> &KernelTable {
        &self.table
    }
}

impl BwdEngine for FlashBwdRunner {
    fn name(&self) -> &str {
        "flash_bwd"
    }

    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn select(&self, problem: &BwdProblem) -> FlashResult<&KernelVariant> {
        let key = KernelKey {
            direction: Direction::Bwd,
            arch: self.arch,
            dtype: problem.fwd.dtype,
            head_dim: problem.fwd.head_dim,
            is_causal: problem.fwd.is_causal,
        };
        self.table.select(&key, self.config.unit_test_mode)
    }

    fn run(&self, params: &FlashBwdParams, problem: BwdProblem, stream: &HipStream) -> FlashResult<()> {
        let variant = self.select(&problem)?;
        let traits = variant.traits;
        let accumulation = self.config.accumulation;
        let rounding = self.config.bf16_rounding;
        let workspace = Arc::clone(stream.device().workspace());
        let buffers = BwdBuffers::from_params(params);

        tracing::debug!(
            "FlashBwdRunner::run: {} ({:?}, {} workspace bytes) for b={} h={}/{} sq={} sk={} d={} on stream {}",
            variant.name,
            accumulation,
            workspace_bytes(&problem, &traits, accumulation),
            problem.fwd.batch_size,
            problem.fwd.num_heads,
            problem.fwd.num_heads_k,
            problem.fwd.seqlen_q,
            problem.fwd.seqlen_k,
            problem.fwd.head_dim,
            stream.id()
        );

        stream.enqueue(variant.name.clone(), move || {
            flash_bwd(&problem, &traits, accumulation, rounding, &workspace, &buffers)
                .map_err(|e| e.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{DataType, HipBuffer};
    use crate::error::FlashError;
    use crate::params::{AttentionShape, FlashFwdParams};

    fn params(shape: AttentionShape) -> FlashBwdParams {
        let dtype = DataType::F16;
        let fwd = FlashFwdParams::new(
            shape,
            dtype,
            HipBuffer::from_host(dtype, &vec![0.1; shape.q_numel()]),
            HipBuffer::from_host(dtype, &vec![0.2; shape.k_numel()]),
            HipBuffer::from_host(dtype, &vec![0.3; shape.k_numel()]),
            HipBuffer::zeros(dtype, shape.q_numel()),
            HipBuffer::zeros(DataType::F32, shape.stats_numel()),
        );
        FlashBwdParams::new(
            fwd,
            HipBuffer::from_host(dtype, &vec![1.0; shape.q_numel()]),
            HipBuffer::zeros(dtype, shape.q_numel()),
            HipBuffer::zeros(dtype, shape.k_numel()),
            HipBuffer::zeros(dtype, shape.k_numel()),
        )
    }

    #[test]
    fn test_accumulation_strategy_is_explicit() {
        let device = HipDevice::emulated(GfxArch::Gfx90a);
        let config = RunnerConfig::default();
        let engine = FlashBwdRunner::with_accumulation(&device, &config, AccumulationStrategy::Deterministic);
        assert_eq!(engine.accumulation(), AccumulationStrategy::Deterministic);
        assert!(engine.config().deterministic_mode());
        assert_eq!(FlashBwdRunner::new(&device, &config).accumulation(), AccumulationStrategy::Atomic);
    }

    #[test]
    fn test_workspace_exhaustion_is_asynchronous() {
        let device = HipDevice::emulated_with_workspace(GfxArch::Gfx90a, 1024);
        let engine = FlashBwdRunner::new(&device, &RunnerConfig::default());
        let stream = HipStream::new(&device).unwrap();
        let p = params(AttentionShape::new(1, 2, 64, 64, 64));

        engine.run(&p, p.validate().unwrap(), &stream).unwrap();
        match stream.synchronize() {
            Err(FlashError::DeviceExecutionFailure { kernel, reason }) => {
                assert_eq!(kernel, "flash_bwd_hdim64_fp16_nocausal_gfx90a");
                assert!(reason.contains("out of workspace memory"));
            }
            other => panic!("expected device failure, got {:?}", other),
        }
        assert_eq!(device.workspace().in_use(), 0);
    }

    #[test]
    fn test_unsupported_head_dim() {
        let device = HipDevice::emulated(GfxArch::Gfx90a);
        let engine = FlashBwdRunner::new(&device, &RunnerConfig::from_flags(true, true));
        let stream = HipStream::new(&device).unwrap();
        let shape = AttentionShape::new(1, 1, 8, 8, 160);
        let sentinel = 7.0f32;
        let mut p = params(shape);
        p.dq = HipBuffer::from_host(DataType::F16, &vec![sentinel; shape.q_numel()]);
        p.dk = HipBuffer::from_host(DataType::F16, &vec![sentinel; shape.k_numel()]);
        p.dv = HipBuffer::from_host(DataType::F16, &vec![sentinel; shape.k_numel()]);

        let err = engine.run(&p, p.validate().unwrap(), &stream).unwrap_err();
        assert!(matches!(err, FlashError::UnsupportedConfiguration(_)));
        assert_eq!(stream.launch_count(), 0);

        stream.synchronize().unwrap();
        for grad in [&p.dq, &p.dk, &p.dv] {
            assert!(grad.to_host().unwrap().iter().all(|&x| x == sentinel));
        }
    }
}
