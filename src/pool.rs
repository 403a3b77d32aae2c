//! Spin-locked recycler for device-local scratch buffers.
//!
//! Orchestrators allocate per-call scratch through the pool so repeated
//! graph evaluations reuse device memory instead of hammering the
//! allocator. Allocation picks the smallest idle buffer that fits; on a
//! miss the largest idle buffer is destroyed first to bound peak memory.

use std::cell::UnsafeCell;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, Ordering};

use ash::vk;
use log::{debug, warn};

use crate::device::{GpuError, VulkanDevice};
use crate::memory::Buffer;

pub(crate) const MAX_POOL_BUFFERS: usize = 256;

/// Minimal test-and-set spin lock. Critical sections are bounded scans
/// over the slot array, never allocation or device calls.
pub(crate) struct SpinLock<T> {
    locked: AtomicBool,
    value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinLock<T> {}

impl<T> SpinLock<T> {
    pub fn new(value: T) -> Self {
        SpinLock { locked: AtomicBool::new(false), value: UnsafeCell::new(value) }
    }

    pub fn lock(&self) -> SpinGuard<'_, T> {
        while self.locked.swap(true, Ordering::Acquire) {
            std::hint::spin_loop();
        }
        SpinGuard { lock: self }
    }
}

pub(crate) struct SpinGuard<'a, T> {
    lock: &'a SpinLock<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.value.get() }
    }
}

impl<T> DerefMut for SpinGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.value.get() }
    }
}

impl<T> Drop for SpinGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.locked.store(false, Ordering::Release);
    }
}

/// Fixed-capacity free list of idle device buffers.
pub(crate) struct BufferPool {
    slots: SpinLock<Vec<Option<Buffer>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        BufferPool {
            slots: SpinLock::new((0..MAX_POOL_BUFFERS).map(|_| None).collect()),
        }
    }

    /// Remove and return every pooled buffer (shutdown path).
    pub fn drain(&self) -> Vec<Buffer> {
        let mut slots = self.slots.lock();
        slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl VulkanDevice {
    /// Take the smallest pooled buffer of at least `size` bytes, or
    /// allocate a fresh device-local buffer after evicting the largest
    /// idle one.
    pub(crate) fn pool_malloc(&self, size: u64) -> Result<Buffer, GpuError> {
        debug!("pool_malloc({size})");
        let evicted = {
            let mut slots = self.pool.slots.lock();
            let mut best: Option<(usize, u64)> = None;
            let mut worst: Option<(usize, u64)> = None;
            for (i, slot) in slots.iter().enumerate() {
                if let Some(b) = slot {
                    if b.size() >= size && best.map_or(true, |(_, s)| b.size() < s) {
                        best = Some((i, b.size()));
                    }
                    if worst.map_or(true, |(_, s)| b.size() > s) {
                        worst = Some((i, b.size()));
                    }
                }
            }
            if let Some((i, _)) = best {
                return Ok(slots[i].take().unwrap());
            }
            worst.map(|(i, _)| slots[i].take().unwrap())
        };

        if let Some(buf) = evicted {
            self.destroy_buffer(buf);
        }
        self.create_buffer(size, vk::MemoryPropertyFlags::DEVICE_LOCAL)
    }

    /// Return a buffer to the pool, or destroy it when the pool is full.
    pub(crate) fn pool_free(&self, buffer: Buffer) {
        debug!("pool_free({})", buffer.size());
        // Clear the owning family so the next user skips the transfer barrier
        buffer.reset_qf_owner();

        let mut slots = self.pool.slots.lock();
        if let Some(i) = slots.iter().position(Option::is_none) {
            slots[i] = Some(buffer);
            return;
        }
        drop(slots);
        warn!("buffer pool full, destroying buffer");
        self.destroy_buffer(buffer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::VulkanDevice;
    use std::sync::atomic::Ordering;

    #[test]
    fn equal_size_cycles_reuse_one_allocation() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return, // skip without a Vulkan device
        };

        const SIZE: u64 = 4 * 1024 * 1024;
        let bufs: Vec<_> = (0..8).map(|_| gpu.pool_malloc(SIZE).unwrap()).collect();
        let first_handle = bufs[0].buffer;
        for b in bufs {
            gpu.pool_free(b);
        }

        // Best-fit scan lands on the first pooled buffer; no new allocation
        let again = gpu.pool_malloc(SIZE).unwrap();
        assert_eq!(again.buffer, first_handle);
        gpu.pool_free(again);
    }

    #[test]
    fn free_resets_queue_family_owner() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return,
        };

        let buf = gpu.pool_malloc(4096).unwrap();
        buf.qf_owner.store(2, Ordering::Relaxed);
        gpu.pool_free(buf);

        let buf = gpu.pool_malloc(4096).unwrap();
        assert_eq!(buf.qf_owner(), ash::vk::QUEUE_FAMILY_IGNORED);
        gpu.pool_free(buf);
    }

    #[test]
    fn best_fit_prefers_smallest_buffer() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return,
        };

        let small = gpu.pool_malloc(4096).unwrap();
        let large = gpu.pool_malloc(1024 * 1024).unwrap();
        let small_handle = small.buffer;
        gpu.pool_free(large);
        gpu.pool_free(small);

        let got = gpu.pool_malloc(1024).unwrap();
        assert_eq!(got.buffer, small_handle);
        gpu.pool_free(got);
    }
}
