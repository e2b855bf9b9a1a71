//! Flash Attention Benchmark Suite
//!
//! Times the emulated forward pass and the backward pass under both dQ
//! accumulation strategies:
//! - Forward, fused vs unit-test (unfused) selection
//! - Backward, atomic vs deterministic accumulation
//!
//! Run with: `cargo bench --bench attention_bench`

use std::hint::black_box;
use std::time::{Duration, Instant};

use rocflash::{
    AccumulationStrategy, AttentionShape, DataType, FlashBwdParams, FlashFwdParams, FlashRunner,
    GfxArch, HipBuffer, HipDevice, HipStream, RunnerConfig,
};

// ============================================================================
// Benchmark Harness
// ============================================================================

struct Benchmark {
    name: String,
    iterations: usize,
    warmup_iterations: usize,
}

impl Benchmark {
    fn new(name: &str, iterations: usize) -> Self {
        Benchmark {
            name: name.to_string(),
            iterations,
            warmup_iterations: iterations.min(2),
        }
    }

    fn run_time<F, R>(&self, mut f: F) -> BenchmarkResult
    where
        F: FnMut() -> R,
    {
        for _ in 0..self.warmup_iterations {
            black_box(f());
        }

        let mut durations = Vec::with_capacity(self.iterations);
        for _ in 0..self.iterations {
            let start = Instant::now();
            black_box(f());
            durations.push(start.elapsed());
        }

        BenchmarkResult {
            name: self.name.clone(),
            iterations: self.iterations,
            durations,
        }
    }
}

struct BenchmarkResult {
    name: String,
    iterations: usize,
    durations: Vec<Duration>,
}

impl BenchmarkResult {
    fn report(&self) {
        let mut sorted = self.durations.clone();
        sorted.sort();
        let total: Duration = sorted.iter().sum();
        let avg = total / self.iterations as u32;
        let min = sorted[0];
        let max = sorted[sorted.len() - 1];
        let p50 = sorted[sorted.len() / 2];

        println!("\n=== {} ===", self.name);
        println!("Iterations: {}", self.iterations);
        println!("Average: {:?} ({:.3} ms)", avg, avg.as_secs_f64() * 1000.0);
        println!("Min:     {:?} ({:.3} ms)", min, min.as_secs_f64() * 1000.0);
        println!("Max:     {:?} ({:.3} ms)", max, max.as_secs_f64() * 1000.0);
        println!("P50:     {:?} ({:.3} ms)", p50, p50.as_secs_f64() * 1000.0);
    }
}

// ============================================================================
// Test Data Generation
// ============================================================================

fn generate(len: usize, phase: f32) -> Vec<f32> {
    (0..len).map(|i| (i as f32 * 0.01 + phase).sin() * 0.1).collect()
}

fn fwd_params(shape: AttentionShape, dtype: DataType) -> FlashFwdParams {
    FlashFwdParams::new(
        shape,
        dtype,
        HipBuffer::from_host(dtype, &generate(shape.q_numel(), 0.0)),
        HipBuffer::from_host(dtype, &generate(shape.k_numel(), 1.0)),
        HipBuffer::from_host(dtype, &generate(shape.k_numel(), 2.0)),
        HipBuffer::zeros(dtype, shape.q_numel()),
        HipBuffer::zeros(DataType::F32, shape.stats_numel()),
    )
    .with_causal(true)
}

const SHAPES: &[(i64, i64, i64, i64)] = &[(1, 8, 256, 64), (2, 8, 512, 64), (1, 16, 512, 128)];

// ============================================================================
// Forward
// ============================================================================

fn benchmark_forward(device: &HipDevice) {
    println!("\n[Flash Attention Forward]");
    println!("=========================");

    for &(b, h, s, d) in SHAPES {
        let shape = AttentionShape::new(b, h, s, s, d);
        let params = fwd_params(shape, DataType::F16);

        for unit_test_mode in [false, true] {
            let runner = FlashRunner::on_device(
                device.clone(),
                RunnerConfig::new().with_unit_test_mode(unit_test_mode),
            );
            let stream = match HipStream::new(device) {
                Ok(stream) => stream,
                Err(e) => {
                    eprintln!("stream creation failed: {}", e);
                    return;
                }
            };
            let name = format!(
                "fwd b={} h={} s={} d={} fp16 causal{}",
                b,
                h,
                s,
                d,
                if unit_test_mode { " (unit-test mode)" } else { "" }
            );
            let result = Benchmark::new(&name, 5).run_time(|| {
                runner
                    .run_fwd(&params, &stream)
                    .and_then(|_| stream.synchronize())
            });
            result.report();
        }
    }
}

// ============================================================================
// Backward
// ============================================================================

fn benchmark_backward(device: &HipDevice) {
    println!("\n[Flash Attention Backward]");
    println!("==========================");

    for &(b, h, s, d) in SHAPES {
        let shape = AttentionShape::new(b, h, s, s, d);
        let fwd = fwd_params(shape, DataType::F16);
        let stream = match HipStream::new(device) {
            Ok(stream) => stream,
            Err(e) => {
                eprintln!("stream creation failed: {}", e);
                return;
            }
        };

        let prepare = FlashRunner::on_device(device.clone(), RunnerConfig::default());
        if let Err(e) = prepare
            .run_fwd(&fwd, &stream)
            .and_then(|_| stream.synchronize())
        {
            eprintln!("forward failed: {}", e);
            continue;
        }

        let params = FlashBwdParams::new(
            fwd.clone(),
            HipBuffer::from_host(DataType::F16, &generate(shape.q_numel(), 3.0)),
            HipBuffer::zeros(DataType::F16, shape.q_numel()),
            HipBuffer::zeros(DataType::F16, shape.k_numel()),
            HipBuffer::zeros(DataType::F16, shape.k_numel()),
        );

        for accumulation in [AccumulationStrategy::Atomic, AccumulationStrategy::Deterministic] {
            let runner = FlashRunner::on_device(
                device.clone(),
                RunnerConfig::new().with_accumulation(accumulation),
            );
            let name = format!("bwd b={} h={} s={} d={} fp16 causal {:?}", b, h, s, d, accumulation);
            let result = Benchmark::new(&name, 5).run_time(|| {
                runner
                    .run_bwd(&params, &stream)
                    .and_then(|_| stream.synchronize())
            });
            result.report();
        }
    }
}

fn main() {
    println!("rocflash attention benchmarks (host-emulated device)");
    let device = HipDevice::emulated(GfxArch::Gfx90a);
    benchmark_forward(&device);
    benchmark_backward(&device);
}
