//! End-to-end tests through the public API. Every test bails out early
//! when no Vulkan device (or no `vk_shaders/` directory) is available.

use half::f16;
use rand::Rng;
use vktensor::{
    ComputeParams, Tensor, TensorBackend, TensorData, TensorOp, TensorType, VulkanBackend,
};

fn backend() -> Option<VulkanBackend> {
    VulkanBackend::new().ok()
}

/// Column-major m×n reference: D[c*m + r] = Σ_i x[r*k + i] * y[c*k + i].
fn sgemm_ref(m: usize, n: usize, k: usize, x: &[f32], y: &[f32]) -> Vec<f32> {
    let mut d = vec![0.0f32; m * n];
    for c in 0..n {
        for r in 0..m {
            let mut acc = 0.0f32;
            for i in 0..k {
                acc += x[r * k + i] * y[c * k + i];
            }
            d[c * m + r] = acc;
        }
    }
    d
}

#[test]
fn compute_forward_matmul_f32() {
    let Some(backend) = backend() else { return };
    // n = 110 < 128 with k > 128, so this also drives the split-K path
    let (m, n, k) = (128usize, 110usize, 622usize);

    let mut rng = rand::thread_rng();
    let mut x: Vec<f32> = (0..m * k).map(|_| rng.gen()).collect();
    let mut y: Vec<f32> = (0..k * n).map(|_| rng.gen()).collect();

    let src0 = Tensor::new(TensorType::F32, [k as i64, m as i64, 1, 1], x.as_mut_ptr() as *mut u8);
    let src1 = Tensor::new(TensorType::F32, [k as i64, n as i64, 1, 1], y.as_mut_ptr() as *mut u8);

    // Readback lands in pinned memory
    let Some(d_ptr) = backend.host_alloc(4 * m * n) else { return };
    let mut dst = Tensor::new(TensorType::F32, [m as i64, n as i64, 1, 1], d_ptr);
    dst.op = TensorOp::MulMat;

    let handled = backend
        .compute_forward(&ComputeParams::compute_root(), &src0, &src1, &mut dst)
        .unwrap();
    assert!(handled);

    let d = unsafe { std::slice::from_raw_parts(d_ptr as *const f32, m * n) };
    let d_ref = sgemm_ref(m, n, k, &x, &y);
    let avg_err: f64 = d
        .iter()
        .zip(d_ref.iter())
        .map(|(a, b)| (a - b).abs() as f64)
        .sum::<f64>()
        / (m * n) as f64;
    assert!(avg_err < 1e-3, "avg_err={avg_err}");

    backend.host_free(d_ptr);
}

#[test]
fn compute_forward_defers_when_nothing_on_gpu() {
    let Some(backend) = backend() else { return };

    let mut x = vec![0.0f32; 16 * 16];
    let mut y = vec![0.0f32; 16 * 16];
    let mut d = vec![0.0f32; 16 * 16];
    let src0 = Tensor::new(TensorType::F32, [16, 16, 1, 1], x.as_mut_ptr() as *mut u8);
    let src1 = Tensor::new(TensorType::F32, [16, 16, 1, 1], y.as_mut_ptr() as *mut u8);
    let mut dst = Tensor::new(TensorType::F32, [16, 16, 1, 1], d.as_mut_ptr() as *mut u8);
    dst.op = TensorOp::MulMat;

    // Too small to offload and nothing device-resident
    let handled = backend
        .compute_forward(&ComputeParams::compute_root(), &src0, &src1, &mut dst)
        .unwrap();
    assert!(!handled);
}

#[test]
fn non_root_workers_are_no_ops() {
    let Some(backend) = backend() else { return };

    let mut x = vec![0.0f32; 64 * 64];
    let mut y = vec![0.0f32; 64 * 64];
    let mut d = vec![0.0f32; 64 * 64];
    let src0 = Tensor::new(TensorType::F32, [64, 64, 1, 1], x.as_mut_ptr() as *mut u8);
    let src1 = Tensor::new(TensorType::F32, [64, 64, 1, 1], y.as_mut_ptr() as *mut u8);
    let mut dst = Tensor::new(TensorType::F32, [64, 64, 1, 1], d.as_mut_ptr() as *mut u8);
    dst.op = TensorOp::MulMat;

    let params = ComputeParams { phase: vktensor::TaskPhase::Compute, ith: 1, nth: 4 };
    let handled = backend.compute_forward(&params, &src0, &src1, &mut dst).unwrap();
    // Handled without doing any work
    assert!(handled);
    assert!(d.iter().all(|&v| v == 0.0));
}

#[test]
fn transform_tensor_moves_weights_to_gpu() {
    let Some(backend) = backend() else { return };
    let (m, n, k) = (64usize, 40usize, 64usize);

    let mut rng = rand::thread_rng();
    let mut w: Vec<f32> = (0..m * k).map(|_| rng.gen()).collect();
    let mut y: Vec<f32> = (0..k * n).map(|_| rng.gen()).collect();

    let mut src0 = Tensor::new(TensorType::F32, [k as i64, m as i64, 1, 1], std::ptr::null_mut());
    backend.transform_tensor(w.as_mut_ptr() as *mut u8, &mut src0).unwrap();
    assert_eq!(src0.backend, TensorBackend::Gpu);
    assert!(matches!(src0.data, TensorData::Device(_)));

    let src1 = Tensor::new(TensorType::F32, [k as i64, n as i64, 1, 1], y.as_mut_ptr() as *mut u8);
    let Some(d_ptr) = backend.host_alloc(4 * m * n) else {
        backend.free_data(&mut src0);
        return;
    };
    let mut dst = Tensor::new(TensorType::F32, [m as i64, n as i64, 1, 1], d_ptr);
    dst.op = TensorOp::MulMat;

    let handled = backend
        .compute_forward(&ComputeParams::compute_root(), &src0, &src1, &mut dst)
        .unwrap();
    assert!(handled);

    let d = unsafe { std::slice::from_raw_parts(d_ptr as *const f32, m * n) };
    let d_ref = sgemm_ref(m, n, k, &w, &y);
    let avg_err: f64 = d
        .iter()
        .zip(d_ref.iter())
        .map(|(a, b)| (a - b).abs() as f64)
        .sum::<f64>()
        / (m * n) as f64;
    assert!(avg_err < 1e-3, "avg_err={avg_err}");

    backend.host_free(d_ptr);
    backend.free_data(&mut src0);
    assert!(matches!(src0.data, TensorData::None));
}

#[test]
fn compute_forward_matvec_f16() {
    let Some(backend) = backend() else { return };
    let (m, k) = (64usize, 128usize);

    let mut rng = rand::thread_rng();
    let mut w: Vec<f16> = (0..m * k).map(|_| f16::from_f32(rng.gen())).collect();
    let mut y: Vec<f32> = (0..k).map(|_| rng.gen()).collect();

    // A GPU-resident f16 weight with N = 1 drives the fused
    // dequant + mat-vec kernel
    let mut src0 = Tensor::new(TensorType::F16, [k as i64, m as i64, 1, 1], std::ptr::null_mut());
    backend.transform_tensor(w.as_mut_ptr() as *mut u8, &mut src0).unwrap();

    let src1 = Tensor::new(TensorType::F32, [k as i64, 1, 1, 1], y.as_mut_ptr() as *mut u8);
    let Some(d_ptr) = backend.host_alloc(4 * m) else {
        backend.free_data(&mut src0);
        return;
    };
    let mut dst = Tensor::new(TensorType::F32, [m as i64, 1, 1, 1], d_ptr);
    dst.op = TensorOp::MulMat;

    let handled = backend
        .compute_forward(&ComputeParams::compute_root(), &src0, &src1, &mut dst)
        .unwrap();
    assert!(handled);

    let d = unsafe { std::slice::from_raw_parts(d_ptr as *const f32, m) };
    for r in 0..m {
        let mut expect = 0.0f32;
        for i in 0..k {
            expect += w[r * k + i].to_f32() * y[i];
        }
        assert!((d[r] - expect).abs() < 1e-2, "row {r}: {} vs {expect}", d[r]);
    }

    backend.host_free(d_ptr);
    backend.free_data(&mut src0);
}

#[test]
fn compute_forward_elementwise_mul_broadcasts() {
    let Some(backend) = backend() else { return };
    let (ne0, ne1) = (64usize, 32usize);

    let mut rng = rand::thread_rng();
    let mut x: Vec<f32> = (0..ne0 * ne1 * 2).map(|_| rng.gen()).collect();
    let mut w: Vec<f32> = (0..ne0 * ne1).map(|_| rng.gen()).collect();

    // B lives on the GPU and is broadcast over the batch dimension of A
    let mut src1 = Tensor::new(TensorType::F32, [ne0 as i64, ne1 as i64, 1, 1], std::ptr::null_mut());
    backend.transform_tensor(w.as_mut_ptr() as *mut u8, &mut src1).unwrap();

    let src0 = Tensor::new(
        TensorType::F32,
        [ne0 as i64, ne1 as i64, 2, 1],
        x.as_mut_ptr() as *mut u8,
    );
    let Some(d_ptr) = backend.host_alloc(4 * ne0 * ne1 * 2) else {
        backend.free_data(&mut src1);
        return;
    };
    let mut dst = Tensor::new(TensorType::F32, [ne0 as i64, ne1 as i64, 2, 1], d_ptr);
    dst.op = TensorOp::Mul;

    let handled = backend
        .compute_forward(&ComputeParams::compute_root(), &src0, &src1, &mut dst)
        .unwrap();
    assert!(handled);

    let d = unsafe { std::slice::from_raw_parts(d_ptr as *const f32, ne0 * ne1 * 2) };
    for tile in 0..2 {
        for i in 0..ne0 * ne1 {
            let got = d[tile * ne0 * ne1 + i];
            let expect = x[tile * ne0 * ne1 + i] * w[i];
            assert!(
                (got - expect).abs() < 1e-6,
                "tile {tile} element {i}: {got} vs {expect}"
            );
        }
    }

    backend.host_free(d_ptr);
    backend.free_data(&mut src1);
}
