//! Runner construction from the process environment
//!
//! These tests mutate environment variables and must run serially.

mod common;

use common::{serial, AttentionProblem};
use rocflash::{
    AccumulationStrategy, AttentionShape, Bf16Rounding, DataType, FlashError, FlashRunner,
    GfxArch, HipStream,
};

const ENV_VARS: &[&str] = &[
    "HIP_VISIBLE_DEVICES",
    "ROCFLASH_DEVICE_ARCH",
    "ROCFLASH_WORKSPACE_MB",
    "ROCFLASH_UNIT_TEST_MODE",
    "ROCFLASH_DETERMINISTIC",
    "ROCFLASH_USE_RTN",
];

fn clear_env() {
    for var in ENV_VARS {
        std::env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_from_env_reads_modes() -> anyhow::Result<()> {
    clear_env();
    std::env::set_var("ROCFLASH_DETERMINISTIC", "1");
    std::env::set_var("ROCFLASH_USE_RTN", "on");
    std::env::set_var("ROCFLASH_DEVICE_ARCH", "gfx942");
    let runner = FlashRunner::from_env();
    clear_env();

    let runner = runner?;
    assert!(runner.deterministic_mode());
    assert!(!runner.unit_test_mode());
    assert_eq!(runner.config().bf16_rounding, Bf16Rounding::NearestEven);
    assert_eq!(runner.bwd_engine().accumulation(), AccumulationStrategy::Deterministic);
    assert_eq!(runner.device().arch(), GfxArch::Gfx942);
    Ok(())
}

#[test]
#[serial]
fn test_no_visible_device() {
    for value in ["", "-1"] {
        clear_env();
        std::env::set_var("HIP_VISIBLE_DEVICES", value);
        let err = FlashRunner::new(false, false).unwrap_err();
        assert!(matches!(err, FlashError::DeviceUnavailable(_)), "{:?}", err);
    }
    clear_env();
}

#[test]
#[serial]
fn test_malformed_environment() {
    let cases = [
        ("ROCFLASH_DEVICE_ARCH", "gfx9000"),
        ("ROCFLASH_WORKSPACE_MB", "lots"),
        ("ROCFLASH_WORKSPACE_MB", "18446744073709551615"),
        ("ROCFLASH_UNIT_TEST_MODE", "perhaps"),
    ];
    for (var, value) in cases {
        clear_env();
        std::env::set_var(var, value);
        let err = FlashRunner::from_env().unwrap_err();
        assert!(matches!(err, FlashError::InvalidConfiguration(_)), "{}={}: {:?}", var, value, err);
    }
    clear_env();
}

#[test]
#[serial]
fn test_arch_without_compiled_kernels() -> anyhow::Result<()> {
    clear_env();
    std::env::set_var("ROCFLASH_DEVICE_ARCH", "gfx1100");
    let runner = FlashRunner::new(true, false);
    clear_env();

    let runner = runner?;
    let stream = HipStream::new(runner.device())?;
    let problem = AttentionProblem::new(AttentionShape::new(1, 2, 8, 8, 64), DataType::F16, 50);
    let err = runner.run_fwd(&problem.fwd_params(), &stream).unwrap_err();
    assert!(matches!(err, FlashError::UnsupportedConfiguration(_)));
    assert_eq!(stream.launch_count(), 0);
    Ok(())
}

#[test]
#[serial]
fn test_workspace_limit_from_environment() -> anyhow::Result<()> {
    clear_env();
    std::env::set_var("ROCFLASH_WORKSPACE_MB", "1");
    let runner = FlashRunner::new(false, true);
    clear_env();

    let runner = runner?;
    assert_eq!(runner.device().workspace().limit(), Some(1024 * 1024));

    // 4 heads x 256 rows x 128 dims of f32 is 512 KiB of dQ; the
    // deterministic partials over 8 key blocks need 4 MiB
    let problem = AttentionProblem::new(AttentionShape::new(1, 4, 256, 256, 128), DataType::F16, 51);
    let stream = HipStream::new(runner.device())?;
    let fwd = problem.fwd_params();
    runner.run_fwd(&fwd, &stream)?;
    runner.run_bwd(&problem.bwd_params(&fwd), &stream)?;
    let err = stream.synchronize().unwrap_err();
    assert!(matches!(err, FlashError::DeviceExecutionFailure { .. }));
    assert!(fwd.out.to_host()?.iter().any(|&x| x != 0.0));
    Ok(())
}
