//! Vulkan compute backend for dense tensor arithmetic.
//!
//! Accelerates element-wise multiply and matrix multiplication over
//! f32 / f16 / q4_0 tensors. The execution substrate streams tensor
//! tiles across one compute and two transfer queues, dequantizes on
//! device where needed, dispatches tiled matmul kernels (with optional
//! split-K reduction) and streams results back, all coordinated with
//! binary semaphores. Kernels are pre-compiled SPIR-V binaries loaded
//! from `vk_shaders/`.
//!
//! Entry points: [`VulkanBackend::new`], [`VulkanBackend::compute_forward`],
//! [`VulkanBackend::transform_tensor`], and pinned-memory allocation via
//! [`VulkanDevice::host_alloc`].

pub mod device;
pub mod dispatch;
pub mod memory;
pub mod ops;
pub mod pipeline;
pub mod pool;
pub mod tensor;
pub mod transfer;

pub use device::{GpuError, VulkanDevice};
pub use memory::Buffer;
pub use tensor::{
    ComputeParams, TaskPhase, Tensor, TensorBackend, TensorData, TensorOp, TensorType,
};

use pipeline::Pipelines;

/// The backend context: device, queues, and every compute pipeline.
///
/// All public operations hang off this handle; nothing is process-global.
pub struct VulkanBackend {
    pub(crate) device: VulkanDevice,
    pub(crate) pipelines: Pipelines,
}

impl VulkanBackend {
    /// Create the device context and build all pipelines from
    /// `vk_shaders/`. Fails when no usable device or a shader binary is
    /// missing; the embedding layer treats that as "stay on the CPU".
    pub fn new() -> Result<Self, GpuError> {
        let mut device = VulkanDevice::new()?;
        let pipelines = Pipelines::load(&mut device)?;
        Ok(VulkanBackend { device, pipelines })
    }

    pub fn device(&self) -> &VulkanDevice {
        &self.device
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device.device_wait_idle();
        }
        self.pipelines.release(&self.device.device);
    }
}
