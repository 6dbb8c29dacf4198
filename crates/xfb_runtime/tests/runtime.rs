use rand::{Rng, SeedableRng, rngs::StdRng};
use rayon::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use xfb_common::isa::Engine;
use xfb_common::mem::XCLBIN_MAGIC;
use xfb_core::reference::{compare, gemm_ref};
use xfb_core::{BlasError, XfblasStatus};
use xfb_runtime::{HostBuffer, RuntimeContext, Transpose};

const GEMM_CONFIG: &str = "\
GEMX_dataType=float
GEMX_ddrWidth=16
GEMX_runGemm=1
GEMX_gemmMBlocks=4
GEMX_gemmKBlocks=4
GEMX_gemmNBlocks=4
GEMX_ddrSizeMB=4
";

const GEMV_CONFIG: &str = "\
GEMX_dataType=float
GEMX_ddrWidth=16
GEMX_runGemv=1
GEMX_ddrSizeMB=4
";

struct Image {
    _dir: TempDir,
    xclbin: PathBuf,
    config: PathBuf,
    log: PathBuf,
}

fn image(config: &str) -> Image {
    let dir = tempfile::tempdir().unwrap();
    let xclbin = dir.path().join("gemx.xclbin");
    let mut body = XCLBIN_MAGIC.to_vec();
    body.extend_from_slice(&[0u8; 120]);
    fs::write(&xclbin, body).unwrap();
    let cfg = dir.path().join("config_info.dat");
    fs::write(&cfg, config).unwrap();
    let log = dir.path().join("xrt.log");
    Image {
        _dir: dir,
        xclbin,
        config: cfg,
        log,
    }
}

fn create(img: &Image, kernels: usize) -> RuntimeContext {
    RuntimeContext::create(&img.xclbin, &img.config, None, Engine::Gemm, kernels).unwrap()
}

fn random_matrix(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-2.0f32..2.0)).collect()
}

#[test]
fn restricted_gemm_256() {
    let img = image(GEMM_CONFIG);
    let rt = RuntimeContext::create(&img.xclbin, &img.config, Some(img.log.as_path()), Engine::Gemm, 1).unwrap();
    assert_eq!(rt.min_size(), 64);

    let n = 256;
    let mut rng = StdRng::seed_from_u64(256);
    let a = random_matrix(&mut rng, n * n);
    let b = random_matrix(&mut rng, n * n);
    let c0 = random_matrix(&mut rng, n * n);

    let ha = HostBuffer::from_slice(&a).into_shared();
    let hb = HostBuffer::from_slice(&b).into_shared();
    let hc = HostBuffer::from_slice(&c0).into_shared();
    let a_h = rt.malloc_restricted(n, n, 4, &ha, n, 0).unwrap();
    let b_h = rt.malloc_restricted(n, n, 4, &hb, n, 0).unwrap();
    let c_h = rt.malloc_restricted(n, n, 4, &hc, n, 0).unwrap();
    rt.set_matrix_restricted(a_h, 0).unwrap();
    rt.set_matrix_restricted(b_h, 0).unwrap();
    rt.set_matrix_restricted(c_h, 0).unwrap();

    rt.gemm(Transpose::N, Transpose::N, n, n, n, 1.0, a_h, n, b_h, n, 1.0, c_h, n, 0)
        .unwrap();
    rt.get_matrix_restricted(c_h, 0).unwrap();

    let mut want = c0.clone();
    gemm_ref(n, n, n, 1.0, &a, n, &b, n, 1.0, &mut want, n);
    assert_eq!(compare(&hc.lock().to_vec::<f32>(), &want), None);

    for h in [a_h, b_h, c_h] {
        rt.free(h, 0).unwrap();
    }
    assert!(rt.destroy().unwrap().is_clean());

    let log = fs::read_to_string(&img.log).unwrap();
    assert_eq!(log.lines().count(), 1);
    assert!(log.contains("gemm"));
}

#[test]
fn padded_gemm_matches_reference_for_random_shapes() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 1);
    let mut rng = StdRng::seed_from_u64(7);

    let mut shapes = vec![(1, 1, 1)];
    for _ in 0..4 {
        shapes.push((rng.gen_range(1..100), rng.gen_range(1..100), rng.gen_range(1..100)));
    }
    for (m, k, n) in shapes {
        let a = random_matrix(&mut rng, m * k);
        let b = random_matrix(&mut rng, k * n);
        let mut c = random_matrix(&mut rng, m * n);

        let a_h = rt.malloc(m, k, 4, 0).unwrap();
        let b_h = rt.malloc(k, n, 4, 0).unwrap();
        let c_h = rt.malloc(m, n, 4, 0).unwrap();
        rt.set_matrix(m, k, &a, k, a_h, 0).unwrap();
        rt.set_matrix(k, n, &b, n, b_h, 0).unwrap();
        rt.set_matrix(m, n, &c, n, c_h, 0).unwrap();
        rt.gemm(Transpose::N, Transpose::N, m, k, n, 1.0, a_h, k, b_h, n, 1.0, c_h, n, 0)
            .unwrap();

        let mut got = vec![0f32; m * n];
        rt.get_matrix(m, n, &mut got, n, c_h, 0).unwrap();
        gemm_ref(m, k, n, 1.0, &a, k, &b, n, 1.0, &mut c, n);
        assert_eq!(compare(&got, &c), None, "{m}x{k}x{n}");

        for h in [a_h, b_h, c_h] {
            rt.free(h, 0).unwrap();
        }
    }
    rt.destroy().unwrap();
}

#[test]
fn handle_lifecycle_errors() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 1);
    let data = vec![1.0f32; 64 * 64];

    assert!(matches!(
        rt.set_matrix(64, 64, &data, 64, 9, 0),
        Err(BlasError::Handle { handle: 9, .. })
    ));
    assert!(matches!(rt.free(9, 0), Err(BlasError::Handle { .. })));

    let a = rt.malloc(64, 64, 4, 0).unwrap();
    let keep = rt.malloc(64, 64, 4, 0).unwrap();
    rt.set_matrix(64, 64, &data, 64, a, 0).unwrap();
    rt.free(a, 0).unwrap();

    let err = rt.free(a, 0).unwrap_err();
    assert!(matches!(err, BlasError::DoubleFree(h) if h == a));
    assert_eq!(err.status(), XfblasStatus::AllocFailed);
    assert!(matches!(
        rt.set_matrix(64, 64, &data, 64, a, 0),
        Err(BlasError::Handle { .. })
    ));
    let mut out = vec![0f32; 64 * 64];
    assert!(matches!(
        rt.get_matrix(64, 64, &mut out, 64, a, 0),
        Err(BlasError::Handle { .. })
    ));
    assert!(matches!(
        rt.gemm(Transpose::N, Transpose::N, 64, 64, 64, 1.0, a, 64, keep, 64, 0.0, keep, 64, 0),
        Err(BlasError::Handle { .. })
    ));

    // Handles are never reused within an instance.
    let next = rt.malloc(64, 64, 4, 0).unwrap();
    assert!(next > keep);
}

#[test]
fn gemm_dimensions_must_fit_the_buffers() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 1);
    let small = rt.malloc(64, 64, 4, 0).unwrap();
    let big = rt.malloc(128, 128, 4, 0).unwrap();
    assert!(matches!(
        rt.gemm(Transpose::N, Transpose::N, 128, 128, 128, 1.0, small, 128, big, 128, 0.0, big, 128, 0),
        Err(BlasError::DimMismatch(_))
    ));
    assert!(matches!(
        rt.gemm(Transpose::N, Transpose::N, 0, 64, 64, 1.0, small, 64, small, 64, 0.0, small, 64, 0),
        Err(BlasError::DimMismatch(_))
    ));
}

#[test]
fn kernels_run_in_parallel() {
    let img = image(GEMM_CONFIG);
    let kernels = 4;
    let rt = create(&img, kernels);
    let n = 64;

    let results: Vec<bool> = (0..kernels)
        .into_par_iter()
        .map(|k| {
            let mut rng = StdRng::seed_from_u64(k as u64);
            let a = random_matrix(&mut rng, n * n);
            let b = random_matrix(&mut rng, n * n);
            let mut c = vec![0f32; n * n];
            let (ha, hb, hc) = (
                rt.malloc(n, n, 4, k).unwrap(),
                rt.malloc(n, n, 4, k).unwrap(),
                rt.malloc(n, n, 4, k).unwrap(),
            );
            rt.set_matrix(n, n, &a, n, ha, k).unwrap();
            rt.set_matrix(n, n, &b, n, hb, k).unwrap();
            rt.set_matrix(n, n, &c, n, hc, k).unwrap();
            rt.gemm(Transpose::N, Transpose::N, n, n, n, 0.5, ha, n, hb, n, 0.0, hc, n, k)
                .unwrap();
            let mut got = vec![0f32; n * n];
            rt.get_matrix(n, n, &mut got, n, hc, k).unwrap();
            gemm_ref(n, n, n, 0.5, &a, n, &b, n, 0.0, &mut c, n);
            compare(&got, &c).is_none()
        })
        .collect();
    assert!(results.into_iter().all(|ok| ok));

    let report = rt.destroy().unwrap();
    assert_eq!(report.kernels, kernels);
    assert_eq!(report.leaked.len(), 3 * kernels);
}

#[test]
fn destroy_reports_leaks_and_closes_the_runtime() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 2);
    let h = rt.malloc(64, 64, 4, 1).unwrap();

    let report = rt.destroy().unwrap();
    assert_eq!(report.kernels, 2);
    assert_eq!(report.leaked.len(), 1);
    assert_eq!(report.leaked[0].kernel, 1);
    assert_eq!(report.leaked[0].handle, h);
    assert_eq!(report.leaked[0].bytes, 64 * 64 * 4);

    assert!(matches!(rt.malloc(64, 64, 4, 0), Err(BlasError::NotReady(_))));
    assert!(matches!(rt.free(h, 1), Err(BlasError::NotReady(_))));
    assert!(matches!(rt.destroy(), Err(BlasError::NotReady(_))));
}

fn create_err(img: &Image, engine: Engine) -> BlasError {
    match RuntimeContext::create(&img.xclbin, &img.config, None, engine, 1) {
        Ok(_) => panic!("create succeeded"),
        Err(e) => e,
    }
}

#[test]
fn creation_errors() {
    let missing_width = image("GEMX_dataType=float\nGEMX_runGemm=1\n");
    assert!(matches!(create_err(&missing_width, Engine::Gemm), BlasError::Config(_)));

    let img = image(GEMM_CONFIG);
    let err = create_err(&img, Engine::Gemv);
    assert!(matches!(err, BlasError::Config(_)));
    assert_eq!(err.status(), XfblasStatus::NotInitialized);

    fs::write(&img.xclbin, b"definitely not an image").unwrap();
    assert!(matches!(create_err(&img, Engine::Gemm), BlasError::Load { .. }));

    let no_config = RuntimeContext::create(&img.xclbin, Path::new("/nonexistent/config_info.dat"), None, Engine::Gemm, 1);
    assert!(matches!(no_config, Err(BlasError::Config(_))));

    let good = image(GEMM_CONFIG);
    assert!(matches!(
        RuntimeContext::create(&good.xclbin, &good.config, None, Engine::Gemm, 0),
        Err(BlasError::InvalidValue(_))
    ));
}

#[test]
fn device_memory_is_recycled_once_empty() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 1);
    // 4 MiB of device memory holds exactly four 512x512 float matrices.
    let a = rt.malloc(512, 512, 4, 0).unwrap();
    let b = rt.malloc(512, 512, 4, 0).unwrap();
    let c = rt.malloc(512, 512, 4, 0).unwrap();
    let d = rt.malloc(512, 512, 4, 0).unwrap();
    assert!(matches!(rt.malloc(64, 64, 4, 0), Err(BlasError::Alloc { .. })));
    for h in [a, b, c, d] {
        rt.free(h, 0).unwrap();
    }
    assert!(rt.malloc(512, 512, 4, 0).is_ok());
}

fn identity(n: usize) -> Vec<f32> {
    let mut m = vec![0f32; n * n];
    for i in 0..n {
        m[i * n + i] = 1.0;
    }
    m
}

#[test]
fn copies_after_a_gemm_do_not_change_its_inputs() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 1);
    let n = 64;
    let b: Vec<f32> = (0..n * n).map(|v| v as f32).collect();

    let a_h = rt.malloc(n, n, 4, 0).unwrap();
    let b_h = rt.malloc(n, n, 4, 0).unwrap();
    let c_h = rt.malloc(n, n, 4, 0).unwrap();
    rt.set_matrix(n, n, &identity(n), n, a_h, 0).unwrap();
    rt.set_matrix(n, n, &b, n, b_h, 0).unwrap();
    rt.gemm(Transpose::N, Transpose::N, n, n, n, 1.0, a_h, n, b_h, n, 0.0, c_h, n, 0)
        .unwrap();
    rt.set_matrix(n, n, &vec![0f32; n * n], n, a_h, 0).unwrap();

    let mut got = vec![0f32; n * n];
    rt.get_matrix(n, n, &mut got, n, c_h, 0).unwrap();
    assert_eq!(got, b);

    // Same for a caller-bound operand pushed after the record was queued.
    let bound = HostBuffer::from_slice(&identity(n)).into_shared();
    let d_h = rt.malloc_restricted(n, n, 4, &bound, n, 0).unwrap();
    rt.set_matrix_restricted(d_h, 0).unwrap();
    rt.gemm(Transpose::N, Transpose::N, n, n, n, 2.0, d_h, n, b_h, n, 0.0, c_h, n, 0)
        .unwrap();
    bound.lock().write(&vec![0f32; n * n]).unwrap();
    rt.set_matrix_restricted(d_h, 0).unwrap();
    rt.get_matrix(n, n, &mut got, n, c_h, 0).unwrap();
    assert!(got.iter().zip(&b).all(|(g, v)| *g == 2.0 * v));
}

#[test]
fn freed_memory_is_reused_while_other_buffers_stay_live() {
    let img = image(GEMM_CONFIG);
    let rt = create(&img, 1);
    let keep = rt.malloc(4, 4, 4, 0).unwrap();
    for _ in 0..50 {
        let h = rt.malloc(512, 512, 4, 0).unwrap();
        rt.free(h, 0).unwrap();
    }

    // After `keep`, less than four 512x512 matrices fit; freeing one of
    // three makes room again.
    let big: Vec<_> = (0..3).map(|_| rt.malloc(512, 512, 4, 0).unwrap()).collect();
    assert!(matches!(rt.malloc(512, 512, 4, 0), Err(BlasError::Alloc { .. })));
    rt.free(big[1], 0).unwrap();
    let again = rt.malloc(512, 512, 4, 0).unwrap();

    for h in [keep, big[0], big[2], again] {
        rt.free(h, 0).unwrap();
    }
    assert!(rt.destroy().unwrap().is_clean());
}

#[test]
fn gemv_handle_lifecycle_and_order() {
    let img = image(GEMV_CONFIG);
    let rt = RuntimeContext::create(&img.xclbin, &img.config, None, Engine::Gemv, 1).unwrap();
    assert_eq!(rt.min_size(), 16);
    let (m, n) = (16, 16);
    let a = rt.malloc(m, n, 4, 0).unwrap();
    let x = rt.malloc_vector(n, 4, 0).unwrap();
    let y = rt.malloc_vector(m, 4, 0).unwrap();
    let xs: Vec<f32> = (0..n).map(|v| v as f32).collect();
    rt.set_matrix(m, n, &identity(n), n, a, 0).unwrap();
    rt.set_vector(&xs, x, 0).unwrap();

    assert!(matches!(
        rt.gemv(Transpose::N, m, n, 1.0, a, n, 99, 0.0, y, 0),
        Err(BlasError::Handle { handle: 99, .. })
    ));

    rt.gemv(Transpose::N, m, n, 1.0, a, n, x, 0.0, y, 0).unwrap();
    rt.set_vector(&vec![0f32; n], x, 0).unwrap();
    let mut got = vec![0f32; m];
    rt.get_vector(&mut got, y, 0).unwrap();
    assert_eq!(got, xs);

    rt.free(y, 0).unwrap();
    assert!(matches!(
        rt.gemv(Transpose::N, m, n, 1.0, a, n, x, 0.0, y, 0),
        Err(BlasError::Handle { .. })
    ));
    assert!(matches!(rt.free(y, 0), Err(BlasError::DoubleFree(_))));

    let err = rt
        .gemm(Transpose::N, Transpose::N, m, n, n, 1.0, a, n, a, n, 0.0, a, n, 0)
        .unwrap_err();
    assert!(matches!(err, BlasError::NotSupported(_)));
    assert_eq!(err.status(), XfblasStatus::NotSupported);
}
