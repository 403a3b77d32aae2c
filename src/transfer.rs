//! Host ↔ device transfers.
//!
//! Every operation picks one of three paths: a direct memcpy through the
//! persistent mapping when the device buffer is host-visible, a
//! zero-staging `copy_buffer` when the host pointer falls inside a
//! pinned registration, or a round-trip through the buffer's lazily
//! created staging child. Async variants record into a fresh submission
//! (or fold into an open one) and leave submission to the caller; the
//! host-side memcpy into staging happens after recording, which is safe
//! because nothing has been submitted yet.

use ash::vk;
use half::f16;
use log::debug;

use crate::device::{GpuError, Queue, VulkanDevice};
use crate::memory::{Buffer, SubBuffer};
use crate::pipeline::{Sequence, Submission};
use crate::tensor::{Tensor, TensorType};

/// Round `width` up to a multiple of `align`.
pub(crate) fn align_size(width: usize, align: usize) -> usize {
    width.div_ceil(align) * align
}

impl VulkanDevice {
    fn write_staging<'a>(&self, dst: &'a Buffer) -> Result<&'a Buffer, GpuError> {
        dst.sb_write
            .get_or_try_init(|| {
                self.create_buffer(
                    dst.size(),
                    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
                )
                .map(Box::new)
            })
            .map(|b| b.as_ref())
    }

    fn read_staging<'a>(&self, src: &'a Buffer) -> Result<&'a Buffer, GpuError> {
        src.sb_read
            .get_or_try_init(|| {
                self.create_buffer(
                    src.size(),
                    vk::MemoryPropertyFlags::HOST_VISIBLE
                        | vk::MemoryPropertyFlags::HOST_COHERENT
                        | vk::MemoryPropertyFlags::HOST_CACHED,
                )
                .map(Box::new)
            })
            .map(|b| b.as_ref())
    }

    /// Record an async 2D write of `height` rows of `width` bytes (host
    /// stride `spitch`, device rows packed). Returns the new sequence in
    /// standalone mode, an empty one when folded into `s`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn buffer_write_2d_async(
        &self,
        dst: &Buffer,
        offset: u64,
        src: *const u8,
        spitch: usize,
        width: usize,
        height: usize,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        s: Option<&mut Submission>,
    ) -> Result<Sequence, GpuError> {
        debug!("buffer_write_2d_async({width}, {height})");
        assert!(
            !dst.host_visible(),
            "async write to a host-visible buffer; use the synchronous write"
        );

        let pinned = self.find_pinned(src);

        let standalone = s.is_none();
        let mut owned: Option<Submission> = None;
        let s: &mut Submission = match s {
            Some(sub) => sub,
            None => owned.insert(Submission {
                buffer: self.create_cmd_buffer(q)?,
                wait_semaphores,
                signal_semaphores,
            }),
        };
        if standalone {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(s.buffer, &begin_info)? };
        }

        if let Some((pinned_buf, pinned_offset)) = pinned {
            // Pinned source doubles as the staging buffer
            let slices: Vec<vk::BufferCopy> = if width == spitch {
                vec![vk::BufferCopy {
                    src_offset: pinned_offset,
                    dst_offset: offset,
                    size: (width * height) as u64,
                }]
            } else {
                (0..height)
                    .map(|i| vk::BufferCopy {
                        src_offset: pinned_offset + (i * spitch) as u64,
                        dst_offset: offset + (i * width) as u64,
                        size: width as u64,
                    })
                    .collect()
            };

            self.sync_buffers(
                s.buffer,
                &[dst.subbuffer()],
                q,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::MEMORY_WRITE,
                false,
            );
            unsafe {
                self.device
                    .cmd_copy_buffer(s.buffer, pinned_buf, dst.buffer, &slices)
            };
        } else {
            let staging = self.write_staging(dst)?;
            let copy = vk::BufferCopy {
                src_offset: offset,
                dst_offset: offset,
                size: (width * height) as u64,
            };

            self.sync_buffers(
                s.buffer,
                &[dst.subbuffer()],
                q,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::MEMORY_WRITE,
                false,
            );
            unsafe {
                self.device
                    .cmd_copy_buffer(s.buffer, staging.buffer, dst.buffer, &[copy])
            };

            // Fill staging after recording; the submit has not happened yet
            let staging_ptr = staging.mapped_ptr();
            unsafe {
                if width == spitch {
                    std::ptr::copy_nonoverlapping(
                        src,
                        staging_ptr.add(offset as usize),
                        width * height,
                    );
                } else {
                    for i in 0..height {
                        std::ptr::copy_nonoverlapping(
                            src.add(i * spitch),
                            staging_ptr.add(offset as usize + i * width),
                            width,
                        );
                    }
                }
            }
        }

        if standalone {
            unsafe { self.device.end_command_buffer(s.buffer)? };
        }
        Ok(owned.map(|sub| vec![sub]).unwrap_or_default())
    }

    /// Record an async zero-padded 2D write: rows of `width` bytes land
    /// at stride `align_size(width, align)` with zeroed tails.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn buffer_write_2d_async_zeropad(
        &self,
        dst: &Buffer,
        offset: u64,
        src: *const u8,
        spitch: usize,
        width: usize,
        height: usize,
        align: usize,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        s: Option<&mut Submission>,
    ) -> Result<Sequence, GpuError> {
        debug!("buffer_write_2d_async_zeropad({offset}, {spitch}, {width}, {height}, {align})");
        assert!(
            !dst.host_visible(),
            "zero-padded write to a host-visible buffer; use the synchronous write"
        );

        let pinned = self.find_pinned(src);
        let padded_width = align_size(width, align);

        let standalone = s.is_none();
        let mut owned: Option<Submission> = None;
        let s: &mut Submission = match s {
            Some(sub) => sub,
            None => owned.insert(Submission {
                buffer: self.create_cmd_buffer(q)?,
                wait_semaphores,
                signal_semaphores,
            }),
        };
        if standalone {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(s.buffer, &begin_info)? };
        }

        if let Some((pinned_buf, pinned_offset)) = pinned {
            let slices: Vec<vk::BufferCopy> = if width == padded_width && width == spitch {
                vec![vk::BufferCopy {
                    src_offset: pinned_offset,
                    dst_offset: offset,
                    size: (width * height) as u64,
                }]
            } else {
                (0..height)
                    .map(|i| vk::BufferCopy {
                        src_offset: pinned_offset + (i * spitch) as u64,
                        dst_offset: offset + (i * padded_width) as u64,
                        size: width as u64,
                    })
                    .collect()
            };

            self.sync_buffers(
                s.buffer,
                &[dst.subbuffer()],
                q,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::MEMORY_WRITE,
                false,
            );
            if padded_width > width {
                // Clear the whole destination so the pad tails read zero,
                // then order the fill before the row copies
                unsafe {
                    self.device
                        .cmd_fill_buffer(s.buffer, dst.buffer, 0, vk::WHOLE_SIZE, 0)
                };
                let barrier = vk::BufferMemoryBarrier::default()
                    .src_access_mask(vk::AccessFlags::MEMORY_WRITE)
                    .dst_access_mask(vk::AccessFlags::MEMORY_WRITE)
                    .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
                    .buffer(dst.buffer)
                    .offset(0)
                    .size(vk::WHOLE_SIZE);
                unsafe {
                    self.device.cmd_pipeline_barrier(
                        s.buffer,
                        q.stage_flags,
                        q.stage_flags,
                        vk::DependencyFlags::empty(),
                        &[],
                        &[barrier],
                        &[],
                    );
                }
            }
            unsafe {
                self.device
                    .cmd_copy_buffer(s.buffer, pinned_buf, dst.buffer, &slices)
            };
        } else {
            let staging = self.write_staging(dst)?;
            let copy = vk::BufferCopy {
                src_offset: offset,
                dst_offset: offset,
                size: (padded_width * height) as u64,
            };

            self.sync_buffers(
                s.buffer,
                &[dst.subbuffer()],
                q,
                vk::AccessFlags::MEMORY_READ,
                vk::AccessFlags::TRANSFER_WRITE,
                false,
            );
            unsafe {
                self.device
                    .cmd_copy_buffer(s.buffer, staging.buffer, dst.buffer, &[copy])
            };

            let zeropad = padded_width - width;
            let staging_ptr = staging.mapped_ptr();
            unsafe {
                if width == padded_width && width == spitch {
                    std::ptr::copy_nonoverlapping(
                        src,
                        staging_ptr.add(offset as usize),
                        width * height,
                    );
                } else {
                    for i in 0..height {
                        let row = staging_ptr.add(offset as usize + i * padded_width);
                        std::ptr::copy_nonoverlapping(src.add(i * spitch), row, width);
                        std::ptr::write_bytes(row.add(width), 0, zeropad);
                    }
                }
            }
        }

        if standalone {
            unsafe { self.device.end_command_buffer(s.buffer)? };
        }
        Ok(owned.map(|sub| vec![sub]).unwrap_or_default())
    }

    /// One-row async write.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn buffer_write_async(
        &self,
        dst: &Buffer,
        offset: u64,
        src: *const u8,
        size: usize,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        s: Option<&mut Submission>,
    ) -> Result<Sequence, GpuError> {
        self.buffer_write_2d_async(
            dst,
            offset,
            src,
            size,
            size,
            1,
            q,
            wait_semaphores,
            signal_semaphores,
            s,
        )
    }

    /// Blocking 2D write. Host-visible destinations are written through
    /// the persistent mapping; everything else goes through the async
    /// path and a fence.
    pub(crate) fn buffer_write_2d(
        &self,
        dst: &Buffer,
        offset: u64,
        src: *const u8,
        spitch: usize,
        width: usize,
        height: usize,
        q: &Queue,
    ) -> Result<(), GpuError> {
        debug!("buffer_write_2d({width}, {height})");
        if dst.host_visible() {
            assert!(dst.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
            let ptr = dst.mapped_ptr();
            unsafe {
                for i in 0..height {
                    std::ptr::copy_nonoverlapping(
                        src.add(i * spitch),
                        ptr.add(offset as usize + i * width),
                        width,
                    );
                }
            }
            return Ok(());
        }

        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let seq = self
            .buffer_write_2d_async(dst, offset, src, spitch, width, height, q, Vec::new(), Vec::new(), None)?;
        let mut sequences = vec![seq];
        self.submit(q, &mut sequences, fence)?;
        let wait = unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) };
        unsafe { self.device.destroy_fence(fence, None) };
        wait?;
        Ok(())
    }

    /// Blocking 1D write.
    pub(crate) fn buffer_write(
        &self,
        dst: &Buffer,
        offset: u64,
        src: *const u8,
        size: usize,
        q: &Queue,
    ) -> Result<(), GpuError> {
        self.buffer_write_2d(dst, offset, src, size, size, 1, q)
    }

    /// Record an async readback. The destination must be pinned; there
    /// is no staging fallback without blocking.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn buffer_read_async(
        &self,
        src: &Buffer,
        offset: u64,
        dst: *mut u8,
        size: usize,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        s: Option<&mut Submission>,
    ) -> Result<Sequence, GpuError> {
        debug!("buffer_read_async({size})");
        let Some((pinned_buf, pinned_offset)) = self.find_pinned(dst) else {
            return Err(GpuError::UnpinnedReadback);
        };

        let copy = vk::BufferCopy {
            src_offset: offset,
            dst_offset: pinned_offset,
            size: size as u64,
        };

        let standalone = s.is_none();
        let mut owned: Option<Submission> = None;
        let s: &mut Submission = match s {
            Some(sub) => sub,
            None => owned.insert(Submission {
                buffer: self.create_cmd_buffer(q)?,
                wait_semaphores,
                signal_semaphores,
            }),
        };
        if standalone {
            let begin_info = vk::CommandBufferBeginInfo::default()
                .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
            unsafe { self.device.begin_command_buffer(s.buffer, &begin_info)? };
        }

        self.sync_buffers(
            s.buffer,
            &[src.subbuffer()],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::MEMORY_READ,
            false,
        );
        unsafe {
            self.device
                .cmd_copy_buffer(s.buffer, src.buffer, pinned_buf, &[copy])
        };

        if standalone {
            unsafe { self.device.end_command_buffer(s.buffer)? };
        }
        Ok(owned.map(|sub| vec![sub]).unwrap_or_default())
    }

    /// Blocking read: host-visible mapping, pinned destination, or a
    /// fenced round-trip through the read-staging child.
    pub(crate) fn buffer_read(
        &self,
        src: &Buffer,
        offset: u64,
        dst: *mut u8,
        size: usize,
        q: &Queue,
    ) -> Result<(), GpuError> {
        debug!("buffer_read({size})");
        if src.host_visible() {
            assert!(src.flags.contains(vk::MemoryPropertyFlags::HOST_COHERENT));
            unsafe {
                std::ptr::copy_nonoverlapping(src.mapped_ptr().add(offset as usize), dst, size)
            };
            return Ok(());
        }

        if self.find_pinned(dst).is_some() {
            let fence =
                unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
            let seq = self
                .buffer_read_async(src, offset, dst, size, q, Vec::new(), Vec::new(), None)?;
            let mut sequences = vec![seq];
            self.submit(q, &mut sequences, fence)?;
            let wait = unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) };
            unsafe { self.device.destroy_fence(fence, None) };
            wait?;
            return Ok(());
        }

        let staging = self.read_staging(src)?;
        let copy = vk::BufferCopy { src_offset: offset, dst_offset: 0, size: size as u64 };

        let mut s = self.begin_submission(q)?;
        self.sync_buffers(
            s.buffer,
            &[src.subbuffer()],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::TRANSFER_READ,
            false,
        );
        unsafe {
            self.device
                .cmd_copy_buffer(s.buffer, src.buffer, staging.buffer, &[copy])
        };
        self.end_submission(&mut s, Vec::new(), Vec::new())?;

        let fence = unsafe { self.device.create_fence(&vk::FenceCreateInfo::default(), None)? };
        let mut sequences = vec![vec![s]];
        self.submit(q, &mut sequences, fence)?;
        let wait = unsafe { self.device.wait_for_fences(&[fence], true, u64::MAX) };
        unsafe { self.device.destroy_fence(fence, None) };
        wait?;

        unsafe { std::ptr::copy_nonoverlapping(staging.mapped_ptr(), dst, size) };
        Ok(())
    }

    /// Upload one `(i3, i2)` tile of a host tensor, choosing between a
    /// flat write and a row-strided write from the tensor's strides.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn h2d_tensor_2d(
        &self,
        dst: &Buffer,
        offset: u64,
        src: &Tensor,
        i3: i64,
        i2: i64,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
        s: Option<&mut Submission>,
    ) -> Result<Sequence, GpuError> {
        debug!("h2d_tensor_2d(i3={i3}, i2={i2})");
        let ne0 = src.ne[0];
        let ne1 = src.ne[1];
        let nb0 = src.nb[0];
        let nb1 = src.nb[1];
        let nb2 = src.nb[2];
        let nb3 = src.nb[3];
        let ts = src.ty.type_size();
        let row_length = src.ty.row_size(ne0);

        let x = unsafe {
            src.data
                .host_ptr()
                .add(i2 as usize * nb2 + i3 as usize * nb3)
        } as *const u8;

        if nb0 == ts && nb1 == row_length {
            return self.buffer_write_async(
                dst,
                offset,
                x,
                ne1 as usize * nb1,
                q,
                wait_semaphores,
                signal_semaphores,
                s,
            );
        }
        if nb0 == ts {
            return self.buffer_write_2d_async(
                dst,
                offset,
                x,
                nb1,
                row_length,
                ne1 as usize,
                q,
                wait_semaphores,
                signal_semaphores,
                s,
            );
        }
        panic!("unsupported tensor layout for device upload");
    }

    /// Upload one tile of an F32 tensor converted to f16 on the host.
    /// The conversion lands in the destination's write-staging buffer,
    /// then a single staging→device copy is recorded.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn h2d_tensor_2d_f32_to_f16(
        &self,
        dst: &Buffer,
        offset: u64,
        src: &Tensor,
        i3: i64,
        i2: i64,
        q: &Queue,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
    ) -> Result<Sequence, GpuError> {
        debug!("h2d_tensor_2d_f32_to_f16(i3={i3}, i2={i2})");
        assert_eq!(src.ty, TensorType::F32);

        let ne0 = src.ne[0] as usize;
        let ne1 = src.ne[1] as usize;
        let nb0 = src.nb[0];
        let nb1 = src.nb[1];
        let nb2 = src.nb[2];
        let nb3 = src.nb[3];
        let ts = src.ty.type_size();
        let row_length = src.ty.row_size(src.ne[0]);

        let copy_size = (std::mem::size_of::<f16>() * ne0 * ne1) as u64;
        let staging = self.write_staging(dst)?;

        let tmp = unsafe { staging.mapped_ptr().add(offset as usize) } as *mut f16;
        let x = unsafe {
            src.data
                .host_ptr()
                .add(i2 as usize * nb2 + i3 as usize * nb3)
        } as *const u8;

        unsafe {
            if nb0 == ts && nb1 == row_length {
                let values = x as *const f32;
                for i in 0..ne0 * ne1 {
                    tmp.add(i).write(f16::from_f32(values.add(i).read()));
                }
            } else if nb0 == ts {
                for i1 in 0..ne1 {
                    let row = x.add(i1 * nb1) as *const f32;
                    let out = tmp.add(i1 * ne0);
                    for i0 in 0..ne0 {
                        out.add(i0).write(f16::from_f32(row.add(i0).read()));
                    }
                }
            } else {
                panic!("unsupported tensor layout for f32→f16 upload");
            }
        }

        let s = Submission {
            buffer: self.create_cmd_buffer(q)?,
            wait_semaphores,
            signal_semaphores,
        };
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(s.buffer, &begin_info)? };
        self.sync_buffers(
            s.buffer,
            &[SubBuffer { buffer: dst, offset, size: copy_size }],
            q,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::TRANSFER_WRITE,
            false,
        );
        let copy = vk::BufferCopy { src_offset: offset, dst_offset: offset, size: copy_size };
        unsafe {
            self.device
                .cmd_copy_buffer(s.buffer, staging.buffer, dst.buffer, &[copy])
        };
        unsafe { self.device.end_command_buffer(s.buffer)? };

        Ok(vec![s])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_size_rounds_up() {
        assert_eq!(align_size(97, 128), 128);
        assert_eq!(align_size(128, 128), 128);
        assert_eq!(align_size(129, 128), 256);
        assert_eq!(align_size(97, 1), 97);
    }

    #[test]
    fn write_then_read_round_trip() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return, // skip without a Vulkan device
        };

        let ne = 1024usize;
        let src: Vec<f32> = (0..ne).map(|i| i as f32 * 0.5).collect();
        let mut out = vec![0.0f32; ne];

        let buf = gpu
            .create_buffer((ne * 4) as u64, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        gpu.buffer_write(
            &buf,
            0,
            src.as_ptr() as *const u8,
            ne * 4,
            &gpu.transfer_queues[0],
        )
        .unwrap();
        gpu.queue_wait_idle(&gpu.transfer_queues[0]).unwrap();
        gpu.buffer_read(
            &buf,
            0,
            out.as_mut_ptr() as *mut u8,
            ne * 4,
            &gpu.transfer_queues[1],
        )
        .unwrap();

        assert_eq!(src, out);
        gpu.destroy_buffer(buf);
    }

    #[test]
    fn strided_write_packs_rows() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return,
        };

        // 4 rows of 16 bytes at a 24-byte host stride
        let (width, height, spitch) = (16usize, 4usize, 24usize);
        let src: Vec<u8> = (0..spitch * height).map(|i| i as u8).collect();
        let mut out = vec![0u8; width * height];

        let buf = gpu
            .create_buffer((width * height) as u64, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        gpu.buffer_write_2d(
            &buf,
            0,
            src.as_ptr(),
            spitch,
            width,
            height,
            &gpu.transfer_queues[0],
        )
        .unwrap();
        gpu.queue_wait_idle(&gpu.transfer_queues[0]).unwrap();
        gpu.buffer_read(&buf, 0, out.as_mut_ptr(), width * height, &gpu.transfer_queues[0])
            .unwrap();

        for i in 0..height {
            assert_eq!(out[i * width..(i + 1) * width], src[i * spitch..i * spitch + width]);
        }
        gpu.destroy_buffer(buf);
    }

    #[test]
    fn zeropad_write_pads_rows_with_zeros() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return,
        };

        let (m, k, align) = (233usize, 97usize, 128usize);
        let elem = std::mem::size_of::<f16>();
        let kpad = align_size(k, align);

        let src: Vec<f16> = (0..m * k).map(|i| f16::from_f32((i % 100) as f32)).collect();
        let mut out = vec![f16::from_f32(-1.0); m * kpad];

        let buf = gpu
            .create_buffer((m * kpad * elem) as u64, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        let seq = gpu
            .buffer_write_2d_async_zeropad(
                &buf,
                0,
                src.as_ptr() as *const u8,
                k * elem,
                k * elem,
                m,
                align * elem,
                &gpu.transfer_queues[0],
                Vec::new(),
                Vec::new(),
                None,
            )
            .unwrap();
        let fence = unsafe {
            gpu.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .unwrap()
        };
        let mut sequences = vec![seq];
        gpu.submit(&gpu.transfer_queues[0], &mut sequences, fence).unwrap();
        unsafe {
            gpu.device.wait_for_fences(&[fence], true, u64::MAX).unwrap();
            gpu.device.destroy_fence(fence, None);
        }

        gpu.buffer_read(
            &buf,
            0,
            out.as_mut_ptr() as *mut u8,
            m * kpad * elem,
            &gpu.transfer_queues[0],
        )
        .unwrap();

        for row in 0..m {
            for col in 0..kpad {
                let got = out[row * kpad + col];
                if col < k {
                    assert_eq!(got, src[row * k + col], "row {row} col {col}");
                } else {
                    assert_eq!(got.to_f32(), 0.0, "pad row {row} col {col}");
                }
            }
        }
        gpu.destroy_buffer(buf);
    }

    #[test]
    fn pinned_registry_round_trip() {
        let gpu = match VulkanDevice::new() {
            Ok(g) => g,
            Err(_) => return,
        };

        let Some(ptr) = gpu.host_alloc(4096) else {
            return; // pinned memory disabled or unavailable
        };
        assert!(gpu.find_pinned(unsafe { ptr.add(100) }).is_some());
        assert!(gpu.find_pinned(unsafe { ptr.add(4096) }).is_none());

        // Pinned memory works as a direct DMA source and readback target
        let ne = 512usize;
        unsafe {
            let f = ptr as *mut f32;
            for i in 0..ne {
                f.add(i).write(i as f32);
            }
        }
        let buf = gpu
            .create_buffer((ne * 4) as u64, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .unwrap();
        gpu.buffer_write(&buf, 0, ptr, ne * 4, &gpu.transfer_queues[0]).unwrap();
        gpu.queue_wait_idle(&gpu.transfer_queues[0]).unwrap();

        let Some(out) = gpu.host_alloc(ne * 4) else {
            gpu.destroy_buffer(buf);
            gpu.host_free(ptr);
            return;
        };
        gpu.buffer_read(&buf, 0, out, ne * 4, &gpu.transfer_queues[0]).unwrap();
        unsafe {
            let f = out as *const f32;
            for i in 0..ne {
                assert_eq!(f.add(i).read(), i as f32);
            }
        }

        gpu.destroy_buffer(buf);
        gpu.host_free(out);
        gpu.host_free(ptr);
    }
}
