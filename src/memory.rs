//! Buffer allocation, memory-type selection, queue-family ownership
//! barriers, and the pinned host-memory registry.

use std::ffi::c_void;
use std::sync::atomic::{AtomicU32, Ordering};

use ash::vk;
use log::{debug, warn};
use once_cell::sync::OnceCell;

use crate::device::{GpuError, Queue, VulkanDevice};

/// One device allocation plus its buffer object.
///
/// Host-visible buffers stay persistently mapped for their whole
/// lifetime. Staging children are created lazily by the transfer layer
/// and die with their parent. The queue-family owner records which
/// family last wrote the buffer so cross-family ownership-transfer
/// barriers can be emitted; `vk::QUEUE_FAMILY_IGNORED` means no transfer
/// is needed on next use.
pub struct Buffer {
    pub(crate) buffer: vk::Buffer,
    pub(crate) memory: vk::DeviceMemory,
    pub(crate) flags: vk::MemoryPropertyFlags,
    pub(crate) ptr: *mut c_void,
    pub(crate) size: vk::DeviceSize,
    pub(crate) sb_write: OnceCell<Box<Buffer>>,
    pub(crate) sb_read: OnceCell<Box<Buffer>>,
    pub(crate) qf_owner: AtomicU32,
}

// The mapped pointer is only dereferenced by transfer operations; the
// caller contract is one orchestrator per buffer at a time.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub fn size(&self) -> u64 {
        self.size
    }

    pub(crate) fn host_visible(&self) -> bool {
        self.flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE)
    }

    /// Mapped host pointer; null unless the buffer is host-visible.
    pub fn mapped_ptr(&self) -> *mut u8 {
        self.ptr as *mut u8
    }

    pub(crate) fn qf_owner(&self) -> u32 {
        self.qf_owner.load(Ordering::Relaxed)
    }

    pub(crate) fn reset_qf_owner(&self) {
        self.qf_owner.store(vk::QUEUE_FAMILY_IGNORED, Ordering::Relaxed);
    }

    /// Full-range view of this buffer.
    pub(crate) fn subbuffer(&self) -> SubBuffer<'_> {
        SubBuffer { buffer: self, offset: 0, size: self.size }
    }

    /// Destroy the Vulkan objects, cascading to staging children.
    pub(crate) fn release(self, device: &ash::Device) {
        let Buffer { buffer, memory, sb_write, sb_read, .. } = self;
        unsafe {
            device.free_memory(memory, None);
            device.destroy_buffer(buffer, None);
        }
        if let Some(sb) = sb_write.into_inner() {
            sb.release(device);
        }
        if let Some(sb) = sb_read.into_inner() {
            sb.release(device);
        }
    }
}

/// Non-owning (buffer, offset, size) view used by dispatches and copies.
#[derive(Clone, Copy)]
pub struct SubBuffer<'a> {
    pub buffer: &'a Buffer,
    pub offset: u64,
    pub size: u64,
}

/// Registry record for a pinned host allocation that doubles as a DMA
/// staging source/target.
pub(crate) struct PinnedEntry {
    pub base: *mut u8,
    pub len: usize,
    pub buffer: Buffer,
}

unsafe impl Send for PinnedEntry {}

impl VulkanDevice {
    /// Create a storage/transfer buffer backed by the first memory type
    /// that matches the requested property flags and whose heap can hold
    /// the allocation. Host-visible buffers are mapped immediately.
    pub(crate) fn create_buffer(
        &self,
        size: u64,
        req_flags: vk::MemoryPropertyFlags,
    ) -> Result<Buffer, GpuError> {
        debug!("create_buffer({size}, {req_flags:?})");
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(
                vk::BufferUsageFlags::STORAGE_BUFFER
                    | vk::BufferUsageFlags::TRANSFER_SRC
                    | vk::BufferUsageFlags::TRANSFER_DST,
            )
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        let buffer = unsafe { self.device.create_buffer(&buffer_info, None)? };

        let mem_req = unsafe { self.device.get_buffer_memory_requirements(buffer) };
        let mem_props = unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        };

        let mut memory_type_index = None;
        for i in 0..mem_props.memory_type_count as usize {
            let mem_type = mem_props.memory_types[i];
            let heap = mem_props.memory_heaps[mem_type.heap_index as usize];
            if mem_req.memory_type_bits & (1 << i) != 0
                && mem_type.property_flags.contains(req_flags)
                && heap.size >= mem_req.size
            {
                memory_type_index = Some(i as u32);
                break;
            }
        }
        let Some(memory_type_index) = memory_type_index else {
            unsafe { self.device.destroy_buffer(buffer, None) };
            return Err(GpuError::NoMemoryType);
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(mem_req.size)
            .memory_type_index(memory_type_index);
        let memory = match unsafe { self.device.allocate_memory(&alloc_info, None) } {
            Ok(m) => m,
            Err(e) => {
                unsafe { self.device.destroy_buffer(buffer, None) };
                return Err(e.into());
            }
        };

        let mut ptr: *mut c_void = std::ptr::null_mut();
        if req_flags.contains(vk::MemoryPropertyFlags::HOST_VISIBLE) {
            ptr = unsafe {
                self.device
                    .map_memory(memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
            };
        }

        unsafe { self.device.bind_buffer_memory(buffer, memory, 0)? };

        Ok(Buffer {
            buffer,
            memory,
            flags: req_flags,
            ptr,
            size,
            sb_write: OnceCell::new(),
            sb_read: OnceCell::new(),
            qf_owner: AtomicU32::new(vk::QUEUE_FAMILY_IGNORED),
        })
    }

    /// Free a buffer and any staging children attached to it.
    pub(crate) fn destroy_buffer(&self, buf: Buffer) {
        debug!("destroy_buffer({})", buf.size);
        buf.release(&self.device);
    }

    /// Record one pipeline barrier covering all listed subbuffers.
    ///
    /// Buffers owned by a different queue family get an ownership
    /// transfer barrier (and their owner updated); same-family buffers
    /// are barriered only when `force` is set. Stage masks on both sides
    /// are the queue's profile.
    pub(crate) fn sync_buffers(
        &self,
        cmd: vk::CommandBuffer,
        buffers: &[SubBuffer<'_>],
        q: &Queue,
        src_access: vk::AccessFlags,
        dst_access: vk::AccessFlags,
        force: bool,
    ) {
        let mut barriers = Vec::new();
        for sub in buffers {
            let owner = sub.buffer.qf_owner();
            if owner != vk::QUEUE_FAMILY_IGNORED && owner != q.family_index {
                sub.buffer.qf_owner.store(q.family_index, Ordering::Relaxed);
                barriers.push(
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(owner)
                        .dst_queue_family_index(q.family_index)
                        .buffer(sub.buffer.buffer)
                        .offset(sub.offset)
                        .size(sub.size),
                );
            } else if force {
                barriers.push(
                    vk::BufferMemoryBarrier::default()
                        .src_access_mask(src_access)
                        .dst_access_mask(dst_access)
                        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                        .buffer(sub.buffer.buffer)
                        .offset(sub.offset)
                        .size(sub.size),
                );
            }
        }

        if barriers.is_empty() {
            return;
        }

        unsafe {
            self.device.cmd_pipeline_barrier(
                cmd,
                q.stage_flags,
                q.stage_flags,
                vk::DependencyFlags::empty(),
                &[],
                &barriers,
                &[],
            );
        }
    }

    /// Allocate pinned (host-visible, coherent, cached) memory and
    /// register it for zero-staging transfers. Returns `None` when
    /// `VKTENSOR_NO_PINNED` is set or the allocation is unavailable.
    pub fn host_alloc(&self, size: usize) -> Option<*mut u8> {
        if std::env::var_os("VKTENSOR_NO_PINNED").is_some() {
            return None;
        }

        let buf = match self.create_buffer(
            size as u64,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ) {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    "failed to allocate {:.2} MB of pinned memory: {e}",
                    size as f64 / 1024.0 / 1024.0
                );
                return None;
            }
        };

        let ptr = buf.mapped_ptr();
        self.pinned
            .lock()
            .unwrap()
            .push(PinnedEntry { base: ptr, len: size, buffer: buf });
        Some(ptr)
    }

    /// Unregister and release a pointer returned by [`host_alloc`].
    ///
    /// [`host_alloc`]: VulkanDevice::host_alloc
    pub fn host_free(&self, ptr: *mut u8) {
        let mut pinned = self.pinned.lock().unwrap();
        let idx = pinned.iter().position(|e| {
            let addr = ptr as usize;
            let base = e.base as usize;
            addr >= base && addr < base + e.len
        });
        match idx {
            Some(i) => {
                let entry = pinned.remove(i);
                entry.buffer.release(&self.device);
            }
            None => warn!("host_free: pointer {ptr:?} not in pinned registry"),
        }
    }

    /// Look up the pinned buffer containing `ptr`, returning its handle
    /// and the offset of `ptr` within it. Linear scan; the registry is
    /// small.
    pub(crate) fn find_pinned(&self, ptr: *const u8) -> Option<(vk::Buffer, u64)> {
        let pinned = self.pinned.lock().unwrap();
        let addr = ptr as usize;
        for e in pinned.iter() {
            let base = e.base as usize;
            if addr >= base && addr < base + e.len {
                return Some((e.buffer.buffer, (addr - base) as u64));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VulkanDevice;

    #[test]
    fn host_visible_buffers_stay_mapped() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return, // skip without a Vulkan device
        };

        let host = gpu
            .create_buffer(
                4096,
                vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            )
            .unwrap();
        assert!(!host.mapped_ptr().is_null());

        let local = gpu
            .create_buffer(4096, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        assert!(local.mapped_ptr().is_null());
        assert_eq!(local.qf_owner(), vk::QUEUE_FAMILY_IGNORED);

        gpu.destroy_buffer(host);
        gpu.destroy_buffer(local);
    }
}
