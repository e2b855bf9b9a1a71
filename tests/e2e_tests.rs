//! End-to-end forward/backward on a realistic shape

mod common;

use common::{assert_close, device, AttentionProblem};
use rocflash::attention::CpuReference;
use rocflash::{AttentionShape, DataType, FlashRunner, HipStream, RunnerConfig};

#[test]
fn test_e2e_causal_stats_reconstruct_probabilities() -> anyhow::Result<()> {
    let (b, h, s, d) = (2usize, 4usize, 128usize, 64usize);
    let problem = AttentionProblem::new(
        AttentionShape::new(b as i64, h as i64, s as i64, s as i64, d as i64),
        DataType::F16,
        42,
    );
    let runner = FlashRunner::on_device(device(), RunnerConfig::default());
    let stream = HipStream::new(runner.device())?;

    let fwd = problem.fwd_params().with_causal(true);
    runner.run_fwd(&fwd, &stream)?;
    let bwd = problem.bwd_params(&fwd);
    runner.run_bwd(&bwd, &stream)?;
    stream.synchronize()?;
    assert!(stream.query());

    // Inputs as the kernel saw them (f16-rounded)
    let q = fwd.q.to_host()?;
    let k = fwd.k.to_host()?;
    let stats = fwd.softmax_stats.to_host()?;
    let rows = b * h * s;
    let (row_max, row_sum) = stats.split_at(rows);
    let scale = fwd.softmax_scale as f64;

    for bh in 0..b * h {
        for i in 0..s {
            let row = bh * s + i;
            let q_row = &q[row * d..][..d];
            let total: f64 = (0..=i)
                .map(|j| {
                    let k_row = &k[(bh * s + j) * d..][..d];
                    let score: f64 = q_row.iter().zip(k_row).map(|(&x, &y)| x as f64 * y as f64).sum();
                    (scale * score - row_max[row] as f64).exp() / row_sum[row] as f64
                })
                .sum();
            assert!((total - 1.0).abs() < 1e-3, "row {} sums to {}", row, total);
        }
    }

    let validated = fwd.validate()?;
    let reference = CpuReference::forward(&validated, &q, &k, &fwd.v.to_host()?, None);
    assert_close(&fwd.out.to_host()?, &reference.out, 2e-3);

    for grad in [&bwd.dq, &bwd.dk, &bwd.dv] {
        assert!(grad.to_host()?.iter().all(|x| x.is_finite()));
    }
    Ok(())
}
