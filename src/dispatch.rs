//! Graph-facing entry points: operation routing, weight upload, and
//! pinned-memory allocation.

use ash::vk;
use log::debug;

use crate::device::GpuError;
use crate::tensor::{
    ComputeParams, TaskPhase, Tensor, TensorBackend, TensorData, TensorOp, TensorType,
};
use crate::VulkanBackend;

/// True when this (src0, src1, dst) combination has a matmul kernel and
/// the shape is worth offloading: f32/f16/quantized operands, f32
/// destination, and either every side at least 32 wide or the weight
/// already device-resident.
pub(crate) fn can_mul_mat(src0: &Tensor, src1: &Tensor, dst: &Tensor) -> bool {
    let supported = |t: TensorType| {
        matches!(t, TensorType::F32 | TensorType::F16) || t.is_quantized()
    };

    supported(src0.ty)
        && supported(src1.ty)
        && dst.ty == TensorType::F32
        && ((dst.ne[0] >= 32 && dst.ne[1] >= 32 && src1.ne[0] >= 32)
            || src0.backend == TensorBackend::Gpu)
}

impl VulkanBackend {
    fn mul_mat(&self, src0: &Tensor, src1: &Tensor, dst: &mut Tensor) -> Result<(), GpuError> {
        assert!(can_mul_mat(src0, src1, dst));

        if src0.ty == TensorType::F32 && src1.ty == TensorType::F32 {
            self.mul_mat_f32(src0, src1, dst)
        } else if src1.ne[1] == 1
            && (src0.ty == TensorType::F16 || src0.ty.is_quantized())
        {
            self.mul_mat_vec_q_f16(src0, src1, dst)
        } else if src0.ty == TensorType::F16
            && src1.ty == TensorType::F32
            && self.device.fp16()
        {
            self.mul_mat_f16(src0, src1, dst)
        } else {
            self.mul_mat_q_f16(src0, src1, dst)
        }
    }

    fn mul(&self, src0: &Tensor, src1: &Tensor, dst: &mut Tensor) -> Result<(), GpuError> {
        assert!(
            src0.ty == TensorType::F32
                && src1.ty == TensorType::F32
                && dst.ty == TensorType::F32
        );
        self.mul_f32(src0, src1, dst)
    }

    /// Graph entry point. Returns `Ok(false)` to defer the op to the CPU
    /// path; `Ok(true)` when handled — which includes the no-op calls
    /// from non-root workers and the init/finalize phases.
    pub fn compute_forward(
        &self,
        params: &ComputeParams,
        src0: &Tensor,
        src1: &Tensor,
        dst: &mut Tensor,
    ) -> Result<bool, GpuError> {
        let any_on_device = dst.backend == TensorBackend::Gpu
            || src0.backend == TensorBackend::Gpu
            || src0.backend == TensorBackend::GpuSplit
            || src1.backend == TensorBackend::Gpu;

        match dst.op {
            TensorOp::Mul => {
                if !any_on_device {
                    return Ok(false);
                }
            }
            TensorOp::MulMat => {
                if !any_on_device && !can_mul_mat(src0, src1, dst) {
                    return Ok(false);
                }
            }
            TensorOp::None => return Ok(false),
        }

        // Only the root worker in the compute phase does actual work
        if params.ith != 0 {
            return Ok(true);
        }
        if params.phase != TaskPhase::Compute {
            return Ok(true);
        }

        match dst.op {
            TensorOp::Mul => self.mul(src0, src1, dst)?,
            TensorOp::MulMat => self.mul_mat(src0, src1, dst)?,
            TensorOp::None => unreachable!(),
        }
        Ok(true)
    }

    /// Move a weight tensor to the GPU: upload its bytes into a fresh
    /// device-local buffer and swap the tensor's data to the device
    /// handle.
    pub fn transform_tensor(&self, data: *mut u8, tensor: &mut Tensor) -> Result<(), GpuError> {
        debug!("transform_tensor({:?}, {:?})", tensor.ty, tensor.ne);
        let [ne0, ne1, ne2, ne3] = tensor.ne;
        assert!(ne2 == 1 && ne3 == 1);

        let q_sz = tensor.ty.type_size() as u64 * (ne0 * ne1 * ne2 * ne3) as u64
            / tensor.ty.block_size() as u64;
        let dst = self.device.create_buffer(q_sz, vk::MemoryPropertyFlags::DEVICE_LOCAL)?;

        let tr0 = &self.device.transfer_queues[0];
        tensor.data = TensorData::Host(data);
        let seq = self
            .device
            .h2d_tensor_2d(&dst, 0, tensor, 0, 0, tr0, Vec::new(), Vec::new(), None)?;
        let mut sequences = vec![seq];
        self.device.submit(tr0, &mut sequences, vk::Fence::null())?;
        self.device.queue_wait_idle(tr0)?;
        self.device.queue_cleanup(tr0)?;

        tensor.data = TensorData::Device(Box::new(dst));
        tensor.backend = TensorBackend::Gpu;
        Ok(())
    }

    /// Tear down a GPU-resident tensor created by [`transform_tensor`].
    ///
    /// [`transform_tensor`]: VulkanBackend::transform_tensor
    pub fn free_data(&self, tensor: &mut Tensor) {
        if tensor.backend != TensorBackend::Gpu {
            return;
        }
        if let TensorData::Device(buf) = std::mem::replace(&mut tensor.data, TensorData::None) {
            self.device.destroy_buffer(*buf);
        }
        tensor.backend = TensorBackend::Cpu;
    }

    /// Pinned host allocation; see [`VulkanDevice::host_alloc`].
    ///
    /// [`VulkanDevice::host_alloc`]: crate::VulkanDevice::host_alloc
    pub fn host_alloc(&self, size: usize) -> Option<*mut u8> {
        self.device.host_alloc(size)
    }

    /// Release a pinned allocation; see [`VulkanDevice::host_free`].
    ///
    /// [`VulkanDevice::host_free`]: crate::VulkanDevice::host_free
    pub fn host_free(&self, ptr: *mut u8) {
        self.device.host_free(ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tensor(ty: TensorType, ne: [i64; 4]) -> Tensor {
        Tensor::new(ty, ne, std::ptr::null_mut())
    }

    #[test]
    fn mul_mat_gate_accepts_large_f32() {
        let a = tensor(TensorType::F32, [622, 128, 1, 1]);
        let b = tensor(TensorType::F32, [622, 110, 1, 1]);
        let d = tensor(TensorType::F32, [128, 110, 1, 1]);
        assert!(can_mul_mat(&a, &b, &d));
    }

    #[test]
    fn mul_mat_gate_rejects_small_shapes_on_cpu() {
        let a = tensor(TensorType::F32, [16, 16, 1, 1]);
        let b = tensor(TensorType::F32, [16, 16, 1, 1]);
        let d = tensor(TensorType::F32, [16, 16, 1, 1]);
        assert!(!can_mul_mat(&a, &b, &d));
    }

    #[test]
    fn mul_mat_gate_accepts_small_shapes_with_gpu_weight() {
        let mut a = tensor(TensorType::Q4_0, [32, 16, 1, 1]);
        a.backend = TensorBackend::Gpu;
        let b = tensor(TensorType::F32, [32, 1, 1, 1]);
        let d = tensor(TensorType::F32, [16, 1, 1, 1]);
        assert!(can_mul_mat(&a, &b, &d));
    }

    #[test]
    fn mul_mat_gate_rejects_f16_destination() {
        let a = tensor(TensorType::F16, [4096, 4096, 1, 1]);
        let b = tensor(TensorType::F32, [4096, 49, 1, 1]);
        let d = tensor(TensorType::F16, [4096, 49, 1, 1]);
        assert!(!can_mul_mat(&a, &b, &d));
    }
}
