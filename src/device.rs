//! Vulkan instance creation, device selection, and queue setup.
//!
//! The backend drives three logical queues: one compute queue and two
//! transfer queues, each wrapped in a [`Queue`] record that owns a
//! transient command pool plus rotating command-buffer and semaphore
//! rings. When the hardware exposes no dedicated transfer family, the
//! transfer records wrap the compute queue instead.

use std::ffi::CStr;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use ash::vk;
use log::{debug, error, warn};

use crate::memory::PinnedEntry;
use crate::pool::BufferPool;

/// Number of dedicated transfer queues the backend tries to obtain.
pub const TRANSFER_QUEUE_COUNT: usize = 2;

const KHR_16BIT_STORAGE: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_16bit_storage\0") };
const KHR_SHADER_FLOAT16_INT8: &CStr =
    unsafe { CStr::from_bytes_with_nul_unchecked(b"VK_KHR_shader_float16_int8\0") };

/// Error type for backend operations.
#[derive(Debug)]
pub enum GpuError {
    /// Vulkan API returned an error code.
    Vk(vk::Result),
    /// Vulkan loader or instance creation failed.
    NoGpu,
    /// No queue family satisfied the requirements.
    NoQueueFamily,
    /// No memory type matched the requested property flags.
    NoMemoryType,
    /// A shader binary could not be read.
    ShaderLoad { path: PathBuf, source: std::io::Error },
    /// Asynchronous readback requires a pinned destination.
    UnpinnedReadback,
    /// General error with description.
    Other(String),
}

impl fmt::Display for GpuError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GpuError::Vk(code) => write!(f, "Vulkan error: {code:?}"),
            GpuError::NoGpu => write!(f, "No Vulkan-capable GPU found"),
            GpuError::NoQueueFamily => write!(f, "No suitable queue family found"),
            GpuError::NoMemoryType => write!(f, "No suitable memory type"),
            GpuError::ShaderLoad { path, source } => {
                write!(f, "Failed to load shader {}: {source}", path.display())
            }
            GpuError::UnpinnedReadback => {
                write!(f, "Async readback destination is not pinned memory")
            }
            GpuError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for GpuError {}

impl From<vk::Result> for GpuError {
    fn from(result: vk::Result) -> Self {
        GpuError::Vk(result)
    }
}

/// How descriptor sets can be allocated on this device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorPoolMode {
    Unknown,
    /// Many sets per pool work; one shared 128-set pool per pipeline.
    Multi,
    /// Multi-set allocation fails on this driver; one pool per set.
    Single,
}

/// Rotating per-queue state. Command buffers and semaphores below the
/// cursor are in flight; entries past it are reusable after cleanup.
pub(crate) struct QueueRing {
    pub pool: vk::CommandPool,
    pub cmd_buffers: Vec<vk::CommandBuffer>,
    pub cmd_buffer_idx: usize,
    pub semaphores: Vec<vk::Semaphore>,
    pub semaphore_idx: usize,
}

/// One logical queue with its command pool and rotation state. The mutex
/// serializes submission and ring rotation between concurrent callers.
pub struct Queue {
    pub(crate) family_index: u32,
    pub(crate) queue: vk::Queue,
    pub(crate) stage_flags: vk::PipelineStageFlags,
    pub(crate) ring: Mutex<QueueRing>,
}

impl Queue {
    fn new(
        device: &ash::Device,
        family_index: u32,
        queue_index: u32,
        stage_flags: vk::PipelineStageFlags,
    ) -> Result<Self, GpuError> {
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(family_index);
        let pool = unsafe { device.create_command_pool(&pool_info, None)? };
        let queue = unsafe { device.get_device_queue(family_index, queue_index) };

        Ok(Queue {
            family_index,
            queue,
            stage_flags,
            ring: Mutex::new(QueueRing {
                pool,
                cmd_buffers: Vec::new(),
                cmd_buffer_idx: 0,
                semaphores: Vec::new(),
                semaphore_idx: 0,
            }),
        })
    }
}

/// Device context: physical device, logical device, the three queues and
/// the process-wide buffer pool and pinned-memory registry.
pub struct VulkanDevice {
    pub(crate) _entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) fp16: bool,
    pub(crate) device: ash::Device,
    pub(crate) vendor_id: u32,
    pub(crate) compute_queue: Queue,
    pub(crate) transfer_queues: [Queue; TRANSFER_QUEUE_COUNT],
    pub(crate) descriptor_set_mode: DescriptorPoolMode,
    pub(crate) pinned: Mutex<Vec<PinnedEntry>>,
    pub(crate) pool: BufferPool,
}

/// Queue family search with relaxation: honor the avoid set first, then
/// drop it, then allow sharing the compute family, then drop the queue
/// count requirement.
fn find_queue_family_index(
    props: &[vk::QueueFamilyProperties],
    required: vk::QueueFlags,
    avoid: vk::QueueFlags,
    compute_index: Option<u32>,
    min_num_queues: u32,
) -> Result<u32, GpuError> {
    let not_compute =
        |i: usize| compute_index.map_or(true, |c| i as u32 != c);

    for (i, f) in props.iter().enumerate() {
        if f.queue_count >= min_num_queues
            && not_compute(i)
            && f.queue_flags.contains(required)
            && !f.queue_flags.intersects(avoid)
        {
            return Ok(i as u32);
        }
    }
    for (i, f) in props.iter().enumerate() {
        if f.queue_count >= min_num_queues && not_compute(i) && f.queue_flags.contains(required) {
            return Ok(i as u32);
        }
    }
    for (i, f) in props.iter().enumerate() {
        if f.queue_count >= min_num_queues && f.queue_flags.contains(required) {
            return Ok(i as u32);
        }
    }
    for (i, f) in props.iter().enumerate() {
        if f.queue_flags.contains(required) {
            return Ok(i as u32);
        }
    }

    error!("no suitable queue family found");
    for f in props {
        error!("  queues: {} flags: {:?}", f.queue_count, f.queue_flags);
    }
    Err(GpuError::NoQueueFamily)
}

impl VulkanDevice {
    /// Initialize Vulkan: create an instance, pick a physical device,
    /// discover queue families and create the logical device.
    ///
    /// The device index is taken from `VKTENSOR_DEVICE` (default 0).
    pub fn new() -> Result<Self, GpuError> {
        let dev_num: usize = std::env::var("VKTENSOR_DEVICE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let entry = unsafe { ash::Entry::load().map_err(|_| GpuError::NoGpu)? };

        let app_name = unsafe { CStr::from_bytes_with_nul_unchecked(b"vktensor\0") };
        let app_info = vk::ApplicationInfo::default()
            .application_name(app_name)
            .application_version(1)
            .api_version(vk::API_VERSION_1_2);
        let instance_info = vk::InstanceCreateInfo::default().application_info(&app_info);
        let instance = unsafe { entry.create_instance(&instance_info, None)? };

        let physical_devices = unsafe { instance.enumerate_physical_devices()? };
        let physical_device = *physical_devices.get(dev_num).ok_or(GpuError::NoGpu)?;

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let vendor_id = properties.vendor_id;
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) };
        debug!("using {}", device_name.to_string_lossy());

        // 16-bit support requires both the storage and the arithmetic extension
        let ext_props =
            unsafe { instance.enumerate_device_extension_properties(physical_device)? };
        let mut fp16_storage = false;
        let mut fp16_compute = false;
        for ext in &ext_props {
            let name = unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) };
            if name == KHR_16BIT_STORAGE {
                fp16_storage = true;
            } else if name == KHR_SHADER_FLOAT16_INT8 {
                fp16_compute = true;
            }
        }
        let mut fp16 = fp16_storage && fp16_compute;

        let mut vk11_features = vk::PhysicalDeviceVulkan11Features::default();
        let mut vk12_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut vk11_features)
            .push_next(&mut vk12_features);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

        fp16 = fp16 && vk12_features.shader_float16 != 0;
        let storage_16bit = vk11_features.storage_buffer16_bit_access != 0;
        if !storage_16bit {
            warn!("device does not support 16-bit storage");
        }
        if fp16 {
            debug!("16-bit arithmetic enabled");
        }

        let queue_family_props =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        // Prefer a non-graphics compute family and a transfer-only family
        let compute_family = find_queue_family_index(
            &queue_family_props,
            vk::QueueFlags::COMPUTE,
            vk::QueueFlags::GRAPHICS,
            None,
            1,
        )?;
        let transfer_family = find_queue_family_index(
            &queue_family_props,
            vk::QueueFlags::TRANSFER,
            vk::QueueFlags::COMPUTE
                | vk::QueueFlags::GRAPHICS
                | vk::QueueFlags::VIDEO_DECODE_KHR
                | vk::QueueFlags::PROTECTED
                | vk::QueueFlags::OPTICAL_FLOW_NV,
            Some(compute_family),
            TRANSFER_QUEUE_COUNT as u32,
        )?;

        // Clamp to what the family actually offers; sharing the compute
        // family reserves its queue 0 for compute work.
        let family_capacity = queue_family_props[transfer_family as usize].queue_count as usize;
        let mut transfer_queue_count = TRANSFER_QUEUE_COUNT;
        if transfer_queue_count > family_capacity {
            transfer_queue_count = if compute_family == transfer_family {
                family_capacity - 1
            } else {
                family_capacity
            };
        }
        debug!(
            "compute family {compute_family}, transfer family {transfer_family} ({transfer_queue_count} transfer queues)"
        );

        let priorities = [1.0f32; 1 + TRANSFER_QUEUE_COUNT];
        let mut queue_infos = Vec::new();
        if compute_family != transfer_family {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(compute_family)
                    .queue_priorities(&priorities[..1]),
            );
            if transfer_queue_count > 0 {
                queue_infos.push(
                    vk::DeviceQueueCreateInfo::default()
                        .queue_family_index(transfer_family)
                        .queue_priorities(&priorities[..transfer_queue_count]),
                );
            }
        } else {
            queue_infos.push(
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(compute_family)
                    .queue_priorities(&priorities[..1 + transfer_queue_count]),
            );
        }

        let mut device_extensions = vec![KHR_16BIT_STORAGE.as_ptr()];
        if fp16 {
            device_extensions.push(KHR_SHADER_FLOAT16_INT8.as_ptr());
        }

        let mut enable_vk11 = vk::PhysicalDeviceVulkan11Features::default()
            .storage_buffer16_bit_access(storage_16bit);
        let mut enable_vk12 =
            vk::PhysicalDeviceVulkan12Features::default().shader_float16(fp16);

        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions)
            .push_next(&mut enable_vk11)
            .push_next(&mut enable_vk12);

        let device = unsafe { instance.create_device(physical_device, &device_info, None)? };

        // Queue 0 of the compute family always carries compute; transfer
        // records spread over the remaining queues of their family.
        let queue_index_offset = u32::from(compute_family == transfer_family);
        let compute_queue = Queue::new(
            &device,
            compute_family,
            0,
            vk::PipelineStageFlags::COMPUTE_SHADER | vk::PipelineStageFlags::TRANSFER,
        )?;
        let mut transfer_queues = Vec::with_capacity(TRANSFER_QUEUE_COUNT);
        for i in 0..TRANSFER_QUEUE_COUNT {
            let q = if transfer_queue_count > 0 {
                Queue::new(
                    &device,
                    transfer_family,
                    queue_index_offset + (i % transfer_queue_count) as u32,
                    vk::PipelineStageFlags::TRANSFER,
                )?
            } else {
                // No spare queue anywhere; fall back to the compute queue
                Queue::new(&device, compute_family, 0, vk::PipelineStageFlags::TRANSFER)?
            };
            transfer_queues.push(q);
        }
        let transfer_queues: [Queue; TRANSFER_QUEUE_COUNT] =
            transfer_queues.try_into().map_err(|_| GpuError::NoQueueFamily)?;

        Ok(VulkanDevice {
            _entry: entry,
            instance,
            physical_device,
            properties,
            fp16,
            device,
            vendor_id,
            compute_queue,
            transfer_queues,
            descriptor_set_mode: DescriptorPoolMode::Unknown,
            pinned: Mutex::new(Vec::new()),
            pool: BufferPool::new(),
        })
    }

    /// True when the device supports 16-bit storage and arithmetic.
    pub fn fp16(&self) -> bool {
        self.fp16
    }

    pub fn vendor_id(&self) -> u32 {
        self.vendor_id
    }

    pub fn device_name(&self) -> String {
        let name = unsafe { CStr::from_ptr(self.properties.device_name.as_ptr()) };
        name.to_string_lossy().into_owned()
    }

    pub(crate) fn min_storage_offset_alignment(&self) -> usize {
        self.properties.limits.min_storage_buffer_offset_alignment as usize
    }

    /// Acquire the next command buffer from the queue's ring, allocating
    /// a fresh one when the ring is exhausted.
    pub(crate) fn create_cmd_buffer(&self, q: &Queue) -> Result<vk::CommandBuffer, GpuError> {
        let mut ring = q.ring.lock().unwrap();
        if ring.cmd_buffers.len() > ring.cmd_buffer_idx {
            let buf = ring.cmd_buffers[ring.cmd_buffer_idx];
            ring.cmd_buffer_idx += 1;
            return Ok(buf);
        }

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(ring.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buf = unsafe { self.device.allocate_command_buffers(&alloc_info)? }[0];
        ring.cmd_buffers.push(buf);
        ring.cmd_buffer_idx += 1;
        Ok(buf)
    }

    /// Acquire the next semaphore from the queue's ring.
    pub(crate) fn create_semaphore(&self, q: &Queue) -> Result<vk::Semaphore, GpuError> {
        let mut ring = q.ring.lock().unwrap();
        if ring.semaphores.len() > ring.semaphore_idx {
            let sem = ring.semaphores[ring.semaphore_idx];
            ring.semaphore_idx += 1;
            return Ok(sem);
        }

        let sem = unsafe { self.device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None)? };
        ring.semaphores.push(sem);
        ring.semaphore_idx += 1;
        Ok(sem)
    }

    /// Reset the queue's rotation state. All previously acquired command
    /// buffers and semaphores must be idle.
    pub(crate) fn queue_cleanup(&self, q: &Queue) -> Result<(), GpuError> {
        let mut ring = q.ring.lock().unwrap();
        ring.semaphore_idx = 0;
        unsafe {
            self.device
                .reset_command_pool(ring.pool, vk::CommandPoolResetFlags::empty())?;
        }
        ring.cmd_buffer_idx = 0;
        Ok(())
    }

    pub(crate) fn queue_wait_idle(&self, q: &Queue) -> Result<(), GpuError> {
        let _guard = q.ring.lock().unwrap();
        unsafe { self.device.queue_wait_idle(q.queue)? };
        Ok(())
    }
}

impl Drop for VulkanDevice {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            for buf in self.pool.drain() {
                buf.release(&self.device);
            }
            let pinned = std::mem::take(&mut *self.pinned.lock().unwrap());
            for entry in pinned {
                entry.buffer.release(&self.device);
            }

            for q in std::iter::once(&self.compute_queue).chain(self.transfer_queues.iter()) {
                let ring = q.ring.lock().unwrap();
                for &sem in &ring.semaphores {
                    self.device.destroy_semaphore(sem, None);
                }
                self.device.destroy_command_pool(ring.pool, None);
            }

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_cleanup_resets_rotation() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return, // skip without a Vulkan device
        };

        let q = &gpu.compute_queue;
        let c0 = gpu.create_cmd_buffer(q).unwrap();
        let _c1 = gpu.create_cmd_buffer(q).unwrap();
        let s0 = gpu.create_semaphore(q).unwrap();
        {
            let ring = q.ring.lock().unwrap();
            assert_eq!(ring.cmd_buffer_idx, 2);
            assert_eq!(ring.semaphore_idx, 1);
        }

        gpu.queue_cleanup(q).unwrap();
        {
            let ring = q.ring.lock().unwrap();
            assert_eq!(ring.cmd_buffer_idx, 0);
            assert_eq!(ring.semaphore_idx, 0);
        }

        // The rings hand back the same objects after a reset
        assert_eq!(gpu.create_cmd_buffer(q).unwrap(), c0);
        assert_eq!(gpu.create_semaphore(q).unwrap(), s0);
    }
}
