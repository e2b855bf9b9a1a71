//! Runtime configuration for the flash runner
//!
//! [`RunnerConfig`] carries the execution-mode decisions that are fixed for
//! the lifetime of a [`FlashRunner`](crate::runner::FlashRunner): the
//! verification (unit-test) path, the gradient accumulation strategy and the
//! bf16 output rounding mode.

use serde::{Deserialize, Serialize};

use crate::error::{FlashError, FlashResult};

const UNIT_TEST_MODE_ENV: &str = "ROCFLASH_UNIT_TEST_MODE";
const DETERMINISTIC_ENV: &str = "ROCFLASH_DETERMINISTIC";
const USE_RTN_ENV: &str = "ROCFLASH_USE_RTN";

/// How partial dQ contributions from parallel key blocks are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AccumulationStrategy {
    /// Unordered atomic adds. Fastest; bits may differ run to run.
    #[default]
    Atomic,
    /// Per-block partials reduced in a fixed, shape-derived order.
    /// Repeated runs on identical inputs are bit-identical.
    Deterministic,
}

impl AccumulationStrategy {
    /// Map the framework's `deterministic` flag onto a strategy
    pub fn from_deterministic(deterministic: bool) -> Self {
        if deterministic {
            AccumulationStrategy::Deterministic
        } else {
            AccumulationStrategy::Atomic
        }
    }

    pub fn is_deterministic(&self) -> bool {
        matches!(self, AccumulationStrategy::Deterministic)
    }
}

/// Rounding used when converting f32 accumulators to bf16 outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Bf16Rounding {
    /// Truncate the low mantissa bits (RTZ)
    #[default]
    TowardZero,
    /// Round to nearest, ties to even (RTN)
    NearestEven,
}

/// Execution-mode configuration for a runner and its engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Prefer unfused kernel variants whose results are easy to cross-check
    pub unit_test_mode: bool,

    /// Backward dQ accumulation strategy
    pub accumulation: AccumulationStrategy,

    /// bf16 output rounding
    pub bf16_rounding: Bf16Rounding,
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from the two framework flags
    pub fn from_flags(unit_test_mode: bool, deterministic_mode: bool) -> Self {
        RunnerConfig::new()
            .with_unit_test_mode(unit_test_mode)
            .with_accumulation(AccumulationStrategy::from_deterministic(deterministic_mode))
    }

    /// Read `ROCFLASH_UNIT_TEST_MODE`, `ROCFLASH_DETERMINISTIC` and
    /// `ROCFLASH_USE_RTN`. Unset variables keep their defaults; malformed
    /// values are rejected.
    pub fn from_env() -> FlashResult<Self> {
        let mut config = RunnerConfig::new();
        if let Some(value) = env_flag(UNIT_TEST_MODE_ENV)? {
            config.unit_test_mode = value;
        }
        if let Some(value) = env_flag(DETERMINISTIC_ENV)? {
            config.accumulation = AccumulationStrategy::from_deterministic(value);
        }
        if let Some(value) = env_flag(USE_RTN_ENV)? {
            config.bf16_rounding = if value {
                Bf16Rounding::NearestEven
            } else {
                Bf16Rounding::TowardZero
            };
        }
        Ok(config)
    }

    pub fn with_unit_test_mode(mut self, unit_test_mode: bool) -> Self {
        self.unit_test_mode = unit_test_mode;
        self
    }

    pub fn with_accumulation(mut self, accumulation: AccumulationStrategy) -> Self {
        self.accumulation = accumulation;
        self
    }

    pub fn with_bf16_rounding(mut self, bf16_rounding: Bf16Rounding) -> Self {
        self.bf16_rounding = bf16_rounding;
        self
    }

    pub fn deterministic_mode(&self) -> bool {
        self.accumulation.is_deterministic()
    }
}

/// Parse a boolean flag (`1/0`, `true/false`, `yes/no`, `on/off`)
pub fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn env_flag(name: &str) -> FlashResult<Option<bool>> {
    match std::env::var(name) {
        Ok(value) => parse_flag(&value).map(Some).ok_or_else(|| {
            FlashError::InvalidConfiguration(format!(
                "{}={:?} is not a boolean flag",
                name, value
            ))
        }),
        Err(_) => Ok(None),
    }
}
