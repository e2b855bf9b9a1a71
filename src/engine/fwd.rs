//! Forward execution engine

use crate::backend::{GfxArch, HipDevice, HipStream};
use crate::config::RunnerConfig;
use crate::engine::FwdEngine;
use crate::error::FlashResult;
use crate::kernels::fwd::{flash_fwd, FwdBuffers};
use crate::kernels::{Direction, KernelKey, KernelTable, KernelVariant};
use crate::params::{FlashFwdParams, FwdProblem};

/// Tiled online-softmax forward engine
#[derive(Debug, Clone)]
pub struct FlashFwdRunner {
    arch: GfxArch,
    config: RunnerConfig,
    table: KernelTable,
}

impl FlashFwdRunner {
    /// Engine for `device` over the compiled kernel table
    pub fn new(device: &HipDevice, config: &RunnerConfig) -> Self {
        Self::with_table(device, config, KernelTable::compiled())
    }

    /// Engine over an explicit table (only its forward variants for the
    /// device's arch are kept)
    pub fn with_table(device: &HipDevice, config: &RunnerConfig, table: &KernelTable) -> Self {
        let table = table.for_engine(Direction::Fwd, device.arch());
        if table.is_empty() {
            tracing::warn!(
                "FlashFwdRunner::new: no forward kernels compiled for {}",
                device.arch()
            );
        }
        FlashFwdRunner {
            arch: device.arch(),
            config: *config,
            table,
        }
    }

    pub fn arch(&self) -> GfxArch {
        self.arch
    }

    pub fn table(&self) -> &KernelTable {
        &self.table
    }
}

impl FwdEngine for FlashFwdRunner {
    fn name(&self) -> &str {
        "flash_fwd"
    }

    fn config(&self) -> &RunnerConfig {
        &self.config
    }

    fn select(&self, problem: &FwdProblem) -> FlashResult<&KernelVariant> {
        let key = KernelKey {
            direction: Direction::Fwd,
            arch: self.arch,
            dtype: problem.dtype,
            head_dim: problem.head_dim,
            is_causal: problem.is_causal,
        };
        self.table.select(&key, self.config.unit_test_mode)
    }

    fn run(&self, params: &FlashFwdParams, problem: FwdProblem, stream: &HipStream) -> FlashResult<()> {
        let variant = self.select(&problem)?;
        let traits = variant.traits;
        let rounding = self.config.bf16_rounding;
        let buffers = FwdBuffers::from_params(params);

        tracing::debug!(
            "FlashFwdRunner::run: {} for b={} h={}/{} sq={} sk={} d={} dropout={} on stream {}",
            variant.name,
            problem.batch_size,
            problem.num_heads,
            problem.num_heads_k,
            problem.seqlen_q,
            problem.seqlen_k,
            problem.head_dim,
            problem.dropout_p,
            stream.id()
        );

        // Stream order guarantees the stats exist before any later backward
        // on this stream reads them. Tagged before the launch is queued so a
        // failure here leaves the stream untouched.
        let previous = params.softmax_stats.tag()?;
        params.softmax_stats.set_tag(Some(params.fingerprint()))?;

        let queued = stream.enqueue(variant.name.clone(), move || {
            flash_fwd(&problem, &traits, rounding, &buffers).map_err(|e| e.to_string())
        });
        if queued.is_err() {
            params.softmax_stats.set_tag(previous)?;
        }
        queued
    }
}
