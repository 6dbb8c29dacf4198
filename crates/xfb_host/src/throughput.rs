use crate::generator::XorShift;
use crate::stats::LatencyStats;
use anyhow::{Context, Result, ensure};
use rayon::prelude::*;
use std::path::Path;
use std::time::Instant;
use tracing::warn;
use xfb_common::isa::Engine;
use xfb_core::reference::{compare, gemm_ref};
use xfb_core::vm::ElemType;
use xfb_runtime::{RuntimeContext, Transpose};

const ELEM_SIZE: usize = 4;

struct KernelRun {
    stats: LatencyStats,
    verified: bool,
}

/// Runs `reps` GEMMs on one kernel instance and checks the last result.
fn run_kernel(rt: &RuntimeContext, kernel: usize, (m, k, n): (usize, usize, usize), reps: usize) -> Result<KernelRun> {
    let mut rng = XorShift::new(kernel as u64 + 1);
    let a = rng.vector(m * k);
    let b = rng.vector(k * n);
    let mut c = vec![0f32; m * n];

    let ha = rt.malloc(m, k, ELEM_SIZE, kernel)?;
    let hb = rt.malloc(k, n, ELEM_SIZE, kernel)?;
    let hc = rt.malloc(m, n, ELEM_SIZE, kernel)?;
    rt.set_matrix(m, k, &a, k, ha, kernel)?;
    rt.set_matrix(k, n, &b, n, hb, kernel)?;

    let mut stats = LatencyStats::new();
    let mut got = vec![0f32; m * n];
    for _ in 0..reps {
        let start = Instant::now();
        rt.gemm(Transpose::N, Transpose::N, m, k, n, 1.0, ha, k, hb, n, 0.0, hc, n, kernel)?;
        rt.get_matrix(m, n, &mut got, n, hc, kernel)?;
        stats.update(start.elapsed().as_nanos() as u64);
    }

    gemm_ref(m, k, n, 1.0, &a, k, &b, n, 0.0, &mut c, n);
    let mismatch = compare(&got, &c);
    if let Some(bad) = mismatch {
        warn!(kernel, index = bad.index, got = bad.got, want = bad.want, "result mismatch");
    }
    for h in [ha, hb, hc] {
        rt.free(h, kernel)?;
    }
    Ok(KernelRun {
        stats,
        verified: mismatch.is_none(),
    })
}

/// GEMM benchmark: every kernel instance runs `reps` multiplications in
/// parallel, then the results are compared against the reference model.
pub fn run_benchmark(xclbin: &Path, config: &Path, dims: (usize, usize, usize), kernels: usize, reps: usize) -> Result<()> {
    ensure!(reps > 0, "--reps must be positive");
    let rt = RuntimeContext::create(xclbin, config, None, Engine::Gemm, kernels)
        .with_context(|| format!("failed to open {}", xclbin.display()))?;
    ensure!(
        rt.config().elem == ElemType::Float,
        "the benchmark drives float images, this one runs {:?}",
        rt.config().elem
    );
    let (m, k, n) = dims;
    println!(
        "GEMM {m}x{k}x{n}, {kernels} kernel(s), {reps} rep(s), block size {}",
        rt.min_size()
    );

    let start = Instant::now();
    let runs = (0..kernels)
        .into_par_iter()
        .map(|kernel| run_kernel(&rt, kernel, dims, reps))
        .collect::<Result<Vec<_>>>()?;
    let seconds = start.elapsed().as_secs_f64();

    let stats = runs
        .iter()
        .fold(LatencyStats::new(), |acc, run| acc.merge(&run.stats));
    let verified = runs.iter().filter(|r| r.verified).count();
    let flops = 2.0 * (m * k * n) as f64 * (reps * kernels) as f64;

    println!("Results");
    println!("Time: {seconds:.4} s");
    println!("Throughput: {:.3} GFLOP/s", flops / seconds / 1e9);
    println!("Verified: {verified}/{kernels}");
    stats.print_report();

    let report = rt.destroy()?;
    ensure!(report.is_clean(), "{} buffer(s) leaked", report.leaked.len());
    ensure!(verified == kernels, "{} kernel(s) produced wrong results", kernels - verified);
    Ok(())
}
