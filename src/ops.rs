//! Tensor operation orchestrators.
//!
//! Each matmul call walks the batch dimensions `(i3, i2)` tile by tile:
//! the X tile is uploaded on transfer queue 0, the Y tile on transfer
//! queue 1, an optional dequantization runs on the compute queue, then
//! the tiled matmul (with split-K reduce when the shape calls for it),
//! and finally the readback on transfer queue 0 — every hand-off
//! ordered by a freshly rotated binary semaphore. Submissions are
//! flushed every [`SUBMIT_BATCH`] tiles so host-side recording overlaps
//! device execution.

use ash::vk;
use bytemuck::{bytes_of, Pod, Zeroable};
use half::f16;
use log::debug;

use crate::device::GpuError;
use crate::memory::{Buffer, SubBuffer};
use crate::pipeline::{Pipeline, Sequence};
use crate::tensor::{Tensor, TensorBackend, TensorType};
use crate::transfer::align_size;
use crate::VulkanBackend;

/// Tiles accumulated per queue before the pending sequences are flushed.
pub(crate) const SUBMIT_BATCH: usize = 3;

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MatmulPush {
    m: i32,
    n: i32,
    k: i32,
    stride_a: i32,
    stride_b: i32,
    stride_d: i32,
    k_split: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct SplitKReducePush {
    m: i32,
    n: i32,
    split_k: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct ConvertPush {
    rows: i32,
    cols: i32,
    src_stride: i32,
    dst_stride: i32,
}

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct MulPush {
    ne0: i32,
    ne1: i32,
    x_row_stride: i32,
    x_col_stride: i32,
    d_stride: i32,
    x_offset: i32,
    y_offset: i32,
    d_offset: i32,
}

/// Split the K reduction across 4 workgroup slabs for deep-and-narrow
/// shapes, where a single pass leaves the GPU underoccupied.
pub(crate) fn guess_split_k(m: i64, n: i64, k: i64) -> i32 {
    if k > 128 && (m < 128 || n < 128) {
        4
    } else {
        1
    }
}

impl VulkanBackend {
    /// Device-side conversion pipeline producing f16 from `ty`.
    fn to_fp16_pipeline(&self, ty: TensorType) -> Option<&Pipeline> {
        match ty {
            TensorType::Q4_0 => Some(&self.pipelines.dequant_q4_0),
            TensorType::F32 => Some(&self.pipelines.f32_to_f16),
            _ => None,
        }
    }

    /// Fused dequantize + mat-vec pipeline for the N=1 fast path.
    fn dequant_mul_mat_vec_pipeline(&self, ty: TensorType, f16_y: bool) -> Option<&Pipeline> {
        match ty {
            TensorType::Q4_0 => {
                if f16_y {
                    self.pipelines.dequant_mul_mat_vec_q4_0.as_ref()
                } else {
                    Some(&self.pipelines.dequant_mul_mat_vec_q4_0_f32)
                }
            }
            TensorType::F16 => {
                if f16_y {
                    self.pipelines.dequant_mul_mat_vec_f16.as_ref()
                } else {
                    Some(&self.pipelines.dequant_mul_mat_vec_f16_f32)
                }
            }
            _ => None,
        }
    }

    /// Leading-dimension multiple of the size class that `(m, n)` lands in.
    fn matmul_align(&self, m: i64, n: i64) -> u32 {
        if m <= 32 || n <= 32 {
            self.pipelines.matmul_f32.s.align()
        } else if m <= 64 || n <= 64 {
            self.pipelines.matmul_f32.m.align()
        } else {
            self.pipelines.matmul_f32.l.align()
        }
    }

    /// Pick the matmul pipeline for the operand widths, size class and
    /// K alignment. `(f32 x, f16 y)` has no kernel.
    fn matmul_pipeline(
        &self,
        bit16_x: bool,
        bit16_y: bool,
        m: i64,
        n: i64,
        aligned: bool,
    ) -> &Pipeline {
        let family = match (bit16_x, bit16_y) {
            (true, true) => self
                .pipelines
                .matmul_f16
                .as_ref()
                .expect("f16 matmul requires 16-bit device support"),
            (true, false) => self
                .pipelines
                .matmul_f16_f32
                .as_ref()
                .expect("f16 matmul requires 16-bit device support"),
            (false, false) => &self.pipelines.matmul_f32,
            (false, true) => panic!("invalid matmul operand combination: f32 x with f16 y"),
        };
        if m <= 32 || n <= 32 {
            if aligned { &family.aligned_s } else { &family.s }
        } else if m <= 64 || n <= 64 {
            if aligned { &family.aligned_m } else { &family.m }
        } else if aligned {
            &family.aligned_l
        } else {
            &family.l
        }
    }

    /// Record one matmul submission on the compute queue, including the
    /// split-K reduce when `split_k > 1`.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn matmul(
        &self,
        pipeline: &Pipeline,
        a: SubBuffer<'_>,
        b: SubBuffer<'_>,
        d: SubBuffer<'_>,
        m: i32,
        n: i32,
        k: i32,
        stride_a: i32,
        stride_b: i32,
        stride_d: i32,
        split_k: i32,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
    ) -> Result<Sequence, GpuError> {
        debug!("matmul({m}, {n}, {k}, split_k={split_k})");
        let dev = &self.device;
        let q = &dev.compute_queue;

        let mut s = dev.begin_submission(q)?;
        dev.sync_buffers(
            s.buffer,
            &[a, b],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::SHADER_READ,
            false,
        );
        dev.sync_buffers(
            s.buffer,
            &[d],
            q,
            vk::AccessFlags::MEMORY_READ,
            vk::AccessFlags::SHADER_WRITE,
            false,
        );

        if split_k == 1 {
            let pc = MatmulPush { m, n, k, stride_a, stride_b, stride_d, k_split: k };
            dev.dispatch_pipeline(&mut s, pipeline, &[a, b, d], bytes_of(&pc), [
                m as u32, n as u32, 1,
            ]);
            dev.end_submission(&mut s, wait_semaphores, signal_semaphores)?;
            return Ok(vec![s]);
        }

        // Partial results land in disjoint slabs of d, then the reduce
        // pass sums them in place
        let pc = MatmulPush {
            m,
            n,
            k,
            stride_a,
            stride_b,
            stride_d,
            k_split: (stride_a + split_k - 1) / split_k,
        };
        dev.dispatch_pipeline(&mut s, pipeline, &[a, b, d], bytes_of(&pc), [
            (m * split_k) as u32,
            n as u32,
            1,
        ]);
        dev.sync_buffers(
            s.buffer,
            &[d],
            q,
            vk::AccessFlags::MEMORY_WRITE,
            vk::AccessFlags::SHADER_READ | vk::AccessFlags::SHADER_WRITE,
            true,
        );
        let pc2 = SplitKReducePush { m, n, split_k };
        dev.dispatch_pipeline(
            &mut s,
            &self.pipelines.matmul_split_k_reduce,
            &[d],
            bytes_of(&pc2),
            [m as u32, n as u32, 1],
        );
        dev.end_submission(&mut s, wait_semaphores, signal_semaphores)?;

        Ok(vec![s])
    }

    /// f32 × f32 matmul over all `(i3, i2)` tiles.
    pub(crate) fn mul_mat_f32(
        &self,
        src0: &Tensor,
        src1: &Tensor,
        dst: &mut Tensor,
    ) -> Result<(), GpuError> {
        debug!(
            "mul_mat_f32(x: {:?}, y: {:?}, d: {:?})",
            src0.ne, src1.ne, dst.ne
        );
        let dev = &self.device;
        let [ne00, ne01, ne02, ne03] = src0.ne;
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;
        let tiles = (ne02 * ne03) as u64;

        let split_k = guess_split_k(ne01, ne11, ne10);
        let kpad = align_size(ne10 as usize, self.matmul_align(ne01, ne11) as usize);
        let pipeline = self.matmul_pipeline(false, false, ne01, ne11, ne10 as usize == kpad);

        let off_align = dev.min_storage_offset_alignment();
        let x_sz = align_size(4 * x_ne, off_align) as u64;
        let y_sz = align_size(4 * y_ne, off_align) as u64;
        let d_sz = align_size(4 * d_ne * split_k as usize, off_align) as u64;

        let load_x = src0.backend != TensorBackend::Gpu;
        let mut x_scratch: Option<Buffer> = None;
        let d_x: &Buffer = if load_x {
            x_scratch.insert(dev.pool_malloc(x_sz * tiles)?)
        } else {
            src0.data.device_buffer()
        };
        let d_y = dev.pool_malloc(y_sz * tiles)?;
        let d_d = dev.pool_malloc(d_sz * tiles)?;

        dev.allocate_descriptor_sets(pipeline, tiles as usize)?;
        if split_k > 1 {
            dev.allocate_descriptor_sets(&self.pipelines.matmul_split_k_reduce, tiles as usize)?;
        }

        let compq = &dev.compute_queue;
        let tr0 = &dev.transfer_queues[0];
        let tr1 = &dev.transfer_queues[1];
        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();
        let mut submit_counter = 0usize;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it_idx = (i03 * ne02 + i02) as u64;
                let x_offset = if load_x { x_sz * it_idx } else { 0 };
                let y_offset = y_sz * it_idx;
                let d_offset = d_sz * it_idx;
                submit_counter += 1;

                let s_y = dev.create_semaphore(compq)?;
                let mut mm_semaphores = vec![s_y];
                if load_x {
                    let s_x = dev.create_semaphore(compq)?;
                    mm_semaphores.push(s_x);
                    transfer_0_seqs.push(dev.h2d_tensor_2d(
                        d_x,
                        x_offset,
                        src0,
                        i03,
                        i02,
                        tr0,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                }
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
                }

                transfer_1_seqs.push(dev.h2d_tensor_2d(
                    &d_y,
                    y_offset,
                    src1,
                    i03,
                    i02,
                    tr1,
                    Vec::new(),
                    vec![s_y],
                    None,
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
                }

                let s_mm = dev.create_semaphore(compq)?;
                compute_seqs.push(self.matmul(
                    pipeline,
                    SubBuffer { buffer: d_x, offset: x_offset, size: x_sz },
                    SubBuffer { buffer: &d_y, offset: y_offset, size: y_sz },
                    SubBuffer { buffer: &d_d, offset: d_offset, size: d_sz },
                    ne01 as i32,
                    ne11 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne01 as i32,
                    split_k,
                    mm_semaphores,
                    vec![s_mm],
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;
                }

                let d_ptr = unsafe {
                    dst.data.host_ptr().add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                transfer_0_seqs.push(dev.buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    tr0,
                    vec![s_mm],
                    Vec::new(),
                    None,
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
                    submit_counter = 0;
                }
            }
        }

        dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
        dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
        dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;

        dev.queue_wait_idle(tr0)?;

        dev.queue_cleanup(tr0)?;
        dev.queue_cleanup(tr1)?;
        dev.queue_cleanup(compq)?;

        dev.pipeline_cleanup(pipeline);
        dev.pipeline_cleanup(&self.pipelines.matmul_split_k_reduce);

        if let Some(b) = x_scratch {
            dev.pool_free(b);
        }
        dev.pool_free(d_y);
        dev.pool_free(d_d);
        Ok(())
    }

    /// f16 × f32 matmul: Y tiles are converted to f16 on the host during
    /// upload, then the f16 kernel family runs.
    pub(crate) fn mul_mat_f16(
        &self,
        src0: &Tensor,
        src1: &Tensor,
        dst: &mut Tensor,
    ) -> Result<(), GpuError> {
        debug!(
            "mul_mat_f16(x: {:?}, y: {:?}, d: {:?})",
            src0.ne, src1.ne, dst.ne
        );
        assert!(self.device.fp16());
        assert_eq!(src0.ty, TensorType::F16);
        assert_eq!(src1.ty, TensorType::F32);

        let dev = &self.device;
        let [ne00, ne01, ne02, ne03] = src0.ne;
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;
        let tiles = (ne02 * ne03) as u64;

        let split_k = guess_split_k(ne01, ne11, ne10);
        let kpad = align_size(ne10 as usize, self.matmul_align(ne01, ne11) as usize);
        let pipeline = self.matmul_pipeline(true, true, ne01, ne11, ne10 as usize == kpad);

        let off_align = dev.min_storage_offset_alignment();
        let f16_sz = std::mem::size_of::<f16>();
        let x_sz = align_size(f16_sz * x_ne, off_align) as u64;
        let y_sz = align_size(f16_sz * y_ne, off_align) as u64;
        let d_sz = align_size(4 * d_ne * split_k as usize, off_align) as u64;

        let load_x = src0.backend != TensorBackend::Gpu;
        let mut x_scratch: Option<Buffer> = None;
        let d_x: &Buffer = if load_x {
            x_scratch.insert(dev.pool_malloc(x_sz * tiles)?)
        } else {
            src0.data.device_buffer()
        };
        let d_y = dev.pool_malloc(y_sz * tiles)?;
        let d_d = dev.pool_malloc(d_sz * tiles)?;

        dev.allocate_descriptor_sets(pipeline, tiles as usize)?;
        if split_k > 1 {
            dev.allocate_descriptor_sets(&self.pipelines.matmul_split_k_reduce, tiles as usize)?;
        }

        let compq = &dev.compute_queue;
        let tr0 = &dev.transfer_queues[0];
        let tr1 = &dev.transfer_queues[1];
        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();
        let mut submit_counter = 0usize;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it_idx = (i03 * ne02 + i02) as u64;
                let x_offset = if load_x { x_sz * it_idx } else { 0 };
                let y_offset = y_sz * it_idx;
                let d_offset = d_sz * it_idx;
                submit_counter += 1;

                let s_y = dev.create_semaphore(compq)?;
                let mut mm_semaphores = vec![s_y];
                if load_x {
                    let s_x = dev.create_semaphore(compq)?;
                    mm_semaphores.push(s_x);
                    transfer_0_seqs.push(dev.h2d_tensor_2d(
                        d_x,
                        x_offset,
                        src0,
                        i03,
                        i02,
                        tr0,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                }
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
                }

                transfer_1_seqs.push(dev.h2d_tensor_2d_f32_to_f16(
                    &d_y,
                    y_offset,
                    src1,
                    i03,
                    i02,
                    tr1,
                    Vec::new(),
                    vec![s_y],
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
                }

                let s_mm = dev.create_semaphore(compq)?;
                compute_seqs.push(self.matmul(
                    pipeline,
                    SubBuffer { buffer: d_x, offset: x_offset, size: x_sz },
                    SubBuffer { buffer: &d_y, offset: y_offset, size: y_sz },
                    SubBuffer { buffer: &d_d, offset: d_offset, size: d_sz },
                    ne01 as i32,
                    ne11 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne01 as i32,
                    split_k,
                    mm_semaphores,
                    vec![s_mm],
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;
                }

                let d_ptr = unsafe {
                    dst.data.host_ptr().add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                transfer_0_seqs.push(dev.buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    tr0,
                    vec![s_mm],
                    Vec::new(),
                    None,
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
                    submit_counter = 0;
                }
            }
        }

        dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
        dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
        dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;

        dev.queue_wait_idle(tr0)?;

        dev.queue_cleanup(tr0)?;
        dev.queue_cleanup(tr1)?;
        dev.queue_cleanup(compq)?;

        dev.pipeline_cleanup(pipeline);
        dev.pipeline_cleanup(&self.pipelines.matmul_split_k_reduce);

        if let Some(b) = x_scratch {
            dev.pool_free(b);
        }
        dev.pool_free(d_y);
        dev.pool_free(d_d);
        Ok(())
    }

    /// General quantized / f16 matmul: operands are dequantized to f16
    /// on device where the kernel family requires it.
    pub(crate) fn mul_mat_q_f16(
        &self,
        src0: &Tensor,
        src1: &Tensor,
        dst: &mut Tensor,
    ) -> Result<(), GpuError> {
        debug!(
            "mul_mat_q_f16(x: {:?} {:?}, y: {:?} {:?}, d: {:?})",
            src0.ty, src0.ne, src1.ty, src1.ne, dst.ne
        );
        let dev = &self.device;
        let [ne00, ne01, ne02, ne03] = src0.ne;
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        let f16_f32_kernel = src1.ty == TensorType::F32;
        let qx_needs_dequant = src0.ty != TensorType::F16;
        let qy_needs_dequant = src1.ty != TensorType::F16 && !f16_f32_kernel;
        let dq = qx_needs_dequant || qy_needs_dequant;

        let load_x = src0.backend != TensorBackend::Gpu;
        let load_y = src1.backend != TensorBackend::Gpu;

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;
        let tiles = (ne02 * ne03) as u64;

        let split_k = guess_split_k(ne01, ne11, ne10);
        let kpad = align_size(ne10 as usize, self.matmul_align(ne01, ne11) as usize);
        let pipeline =
            self.matmul_pipeline(true, !f16_f32_kernel, ne01, ne11, ne10 as usize == kpad);

        let off_align = dev.min_storage_offset_alignment();
        let f16_sz = std::mem::size_of::<f16>();
        let qx_sz = align_size(src0.ty.row_size(ne00) * ne01 as usize, off_align) as u64;
        let qy_sz = align_size(src1.ty.row_size(ne10) * ne11 as usize, off_align) as u64;
        let x_sz = align_size(f16_sz * x_ne, off_align) as u64;
        let y_sz = align_size(
            if f16_f32_kernel { 4 * y_ne } else { f16_sz * y_ne },
            off_align,
        ) as u64;
        let d_sz = align_size(4 * d_ne * split_k as usize, off_align) as u64;

        let mut qx_scratch: Option<Buffer> = None;
        let d_qx: &Buffer = if load_x {
            qx_scratch.insert(dev.pool_malloc(qx_sz * tiles)?)
        } else {
            src0.data.device_buffer()
        };
        let mut qy_scratch: Option<Buffer> = None;
        let d_qy: &Buffer = if load_y {
            qy_scratch.insert(dev.pool_malloc(qy_sz * tiles)?)
        } else {
            src1.data.device_buffer()
        };
        let mut x_scratch: Option<Buffer> = None;
        let d_x: &Buffer = if qx_needs_dequant {
            x_scratch.insert(dev.pool_malloc(x_sz * tiles)?)
        } else {
            assert_eq!(qx_sz, x_sz);
            d_qx
        };
        let mut y_scratch: Option<Buffer> = None;
        let d_y: &Buffer = if qy_needs_dequant {
            y_scratch.insert(dev.pool_malloc(y_sz * tiles)?)
        } else {
            assert_eq!(qy_sz, y_sz);
            d_qy
        };
        let d_d = dev.pool_malloc(d_sz * tiles)?;

        let to_fp16_0 = self.to_fp16_pipeline(src0.ty);
        let to_fp16_1 = self.to_fp16_pipeline(src1.ty);
        assert!(!qx_needs_dequant || to_fp16_0.is_some());
        assert!(!qy_needs_dequant || to_fp16_1.is_some());

        dev.allocate_descriptor_sets(pipeline, tiles as usize)?;
        if qx_needs_dequant {
            dev.allocate_descriptor_sets(to_fp16_0.unwrap(), tiles as usize)?;
        }
        if qy_needs_dequant {
            dev.allocate_descriptor_sets(to_fp16_1.unwrap(), tiles as usize)?;
        }
        if split_k > 1 {
            dev.allocate_descriptor_sets(&self.pipelines.matmul_split_k_reduce, tiles as usize)?;
        }

        let compq = &dev.compute_queue;
        let tr0 = &dev.transfer_queues[0];
        let tr1 = &dev.transfer_queues[1];
        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_2_seqs: Vec<Sequence> = Vec::new();
        let mut submit_counter = 0usize;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it_idx = (i03 * ne02 + i02) as u64;
                let qx_offset = if load_x { qx_sz * it_idx } else { 0 };
                let qy_offset = if load_y { qy_sz * it_idx } else { 0 };
                let x_offset = x_sz * it_idx;
                let y_offset = y_sz * it_idx;
                let d_offset = d_sz * it_idx;
                submit_counter += 1;

                let s_mm = dev.create_semaphore(compq)?;
                let mut q_semaphores: Vec<vk::Semaphore> = Vec::new();
                let mut mm_semaphores: Vec<vk::Semaphore> = Vec::new();

                if load_x {
                    let s_x = dev.create_semaphore(tr0)?;
                    if qx_needs_dequant {
                        q_semaphores.push(s_x);
                    } else {
                        mm_semaphores.push(s_x);
                    }
                    transfer_0_seqs.push(dev.h2d_tensor_2d(
                        d_qx,
                        qx_offset,
                        src0,
                        i03,
                        i02,
                        tr0,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                }
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
                }
                if load_y {
                    let s_y = dev.create_semaphore(tr1)?;
                    if qy_needs_dequant {
                        q_semaphores.push(s_y);
                    } else {
                        mm_semaphores.push(s_y);
                    }
                    transfer_1_seqs.push(dev.h2d_tensor_2d(
                        d_qy,
                        qy_offset,
                        src1,
                        i03,
                        i02,
                        tr1,
                        Vec::new(),
                        vec![s_y],
                        None,
                    )?);
                }
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
                }

                if dq {
                    let s_q = dev.create_semaphore(tr0)?;
                    let mut s = dev.begin_submission(compq)?;
                    if qx_needs_dequant {
                        let pc = ConvertPush {
                            rows: ne01 as i32,
                            cols: ne10 as i32,
                            src_stride: ne10 as i32,
                            dst_stride: ne10 as i32,
                        };
                        let qx_sub = SubBuffer { buffer: d_qx, offset: qx_offset, size: qx_sz };
                        let x_sub = SubBuffer { buffer: d_x, offset: x_offset, size: x_sz };
                        dev.sync_buffers(
                            s.buffer,
                            &[qx_sub],
                            compq,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::SHADER_READ,
                            false,
                        );
                        dev.sync_buffers(
                            s.buffer,
                            &[x_sub],
                            compq,
                            vk::AccessFlags::SHADER_READ,
                            vk::AccessFlags::SHADER_WRITE,
                            false,
                        );
                        dev.dispatch_pipeline(
                            &mut s,
                            to_fp16_0.unwrap(),
                            &[qx_sub, x_sub],
                            bytes_of(&pc),
                            [x_ne as u32, 1, 1],
                        );
                    }
                    if qy_needs_dequant {
                        let pc = ConvertPush {
                            rows: ne11 as i32,
                            cols: ne10 as i32,
                            src_stride: ne10 as i32,
                            dst_stride: ne10 as i32,
                        };
                        let qy_sub = SubBuffer { buffer: d_qy, offset: qy_offset, size: qy_sz };
                        let y_sub = SubBuffer { buffer: d_y, offset: y_offset, size: y_sz };
                        dev.sync_buffers(
                            s.buffer,
                            &[qy_sub],
                            compq,
                            vk::AccessFlags::TRANSFER_WRITE,
                            vk::AccessFlags::SHADER_READ,
                            false,
                        );
                        dev.sync_buffers(
                            s.buffer,
                            &[y_sub],
                            compq,
                            vk::AccessFlags::SHADER_READ,
                            vk::AccessFlags::SHADER_WRITE,
                            false,
                        );
                        dev.dispatch_pipeline(
                            &mut s,
                            to_fp16_1.unwrap(),
                            &[qy_sub, y_sub],
                            bytes_of(&pc),
                            [y_ne as u32, 1, 1],
                        );
                    }
                    dev.end_submission(&mut s, q_semaphores, vec![s_q])?;
                    compute_seqs.push(vec![s]);
                    mm_semaphores.push(s_q);
                }

                compute_seqs.push(self.matmul(
                    pipeline,
                    SubBuffer { buffer: d_x, offset: x_offset, size: x_sz },
                    SubBuffer { buffer: d_y, offset: y_offset, size: y_sz },
                    SubBuffer { buffer: &d_d, offset: d_offset, size: d_sz },
                    ne01 as i32,
                    ne11 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne10 as i32,
                    ne01 as i32,
                    split_k,
                    mm_semaphores,
                    vec![s_mm],
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;
                }

                let d_ptr = unsafe {
                    dst.data.host_ptr().add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                transfer_2_seqs.push(dev.buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    tr0,
                    vec![s_mm],
                    Vec::new(),
                    None,
                )?);
                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(tr0, &mut transfer_2_seqs, vk::Fence::null())?;
                    submit_counter = 0;
                }
            }
        }

        dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;
        dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
        dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;
        dev.submit(tr0, &mut transfer_2_seqs, vk::Fence::null())?;

        dev.queue_wait_idle(tr0)?;

        dev.queue_cleanup(tr0)?;
        dev.queue_cleanup(tr1)?;
        dev.queue_cleanup(compq)?;

        dev.pipeline_cleanup(pipeline);
        if qx_needs_dequant {
            dev.pipeline_cleanup(to_fp16_0.unwrap());
        }
        if qy_needs_dequant {
            dev.pipeline_cleanup(to_fp16_1.unwrap());
        }
        dev.pipeline_cleanup(&self.pipelines.matmul_split_k_reduce);

        if let Some(b) = x_scratch {
            dev.pool_free(b);
        }
        if let Some(b) = y_scratch {
            dev.pool_free(b);
        }
        dev.pool_free(d_d);
        if let Some(b) = qx_scratch {
            dev.pool_free(b);
        }
        if let Some(b) = qy_scratch {
            dev.pool_free(b);
        }
        Ok(())
    }

    /// N = 1 fast path: one compute-queue submission per tile folding
    /// upload, optional Y dequantization, the fused dequant mat-vec
    /// kernel, and the readback. No cross-queue semaphores.
    pub(crate) fn mul_mat_vec_q_f16(
        &self,
        src0: &Tensor,
        src1: &Tensor,
        dst: &mut Tensor,
    ) -> Result<(), GpuError> {
        debug!(
            "mul_mat_vec_q_f16(x: {:?} {:?}, y: {:?} {:?}, d: {:?})",
            src0.ty, src0.ne, src1.ty, src1.ne, dst.ne
        );
        let dev = &self.device;
        let [ne00, ne01, ne02, ne03] = src0.ne;
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        assert_eq!(ne11, 1);

        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        let f16_f32_kernel = src1.ty == TensorType::F32;
        let qy_needs_dequant = src1.ty != TensorType::F16 && !f16_f32_kernel;

        let load_x = src0.backend != TensorBackend::Gpu;
        let load_y = src1.backend != TensorBackend::Gpu;

        let x_ne = (ne01 * ne00) as usize;
        let y_ne = (ne11 * ne10) as usize;
        let d_ne = (ne11 * ne01) as usize;
        let tiles = (ne02 * ne03) as u64;

        let off_align = dev.min_storage_offset_alignment();
        let f16_sz = std::mem::size_of::<f16>();
        let qx_sz = align_size(src0.ty.row_size(ne00) * ne01 as usize, off_align) as u64;
        let qy_sz = align_size(src1.ty.row_size(ne10) * ne11 as usize, off_align) as u64;
        let y_sz = align_size(
            if f16_f32_kernel { 4 * y_ne } else { f16_sz * y_ne },
            off_align,
        ) as u64;
        let d_sz = align_size(4 * d_ne, off_align) as u64;

        let mut qx_scratch: Option<Buffer> = None;
        let d_qx: &Buffer = if load_x {
            qx_scratch.insert(dev.pool_malloc(qx_sz * tiles)?)
        } else {
            src0.data.device_buffer()
        };
        let mut qy_scratch: Option<Buffer> = None;
        let d_qy: &Buffer = if load_y {
            qy_scratch.insert(dev.pool_malloc(qy_sz * tiles)?)
        } else {
            src1.data.device_buffer()
        };
        let mut y_scratch: Option<Buffer> = None;
        let d_y: &Buffer = if qy_needs_dequant {
            y_scratch.insert(dev.pool_malloc(y_sz * tiles)?)
        } else {
            assert_eq!(qy_sz, y_sz);
            d_qy
        };
        let d_d = dev.pool_malloc(d_sz * tiles)?;

        let to_fp16_1 = self.to_fp16_pipeline(src1.ty);
        assert!(!qy_needs_dequant || to_fp16_1.is_some());
        let dmmv = self
            .dequant_mul_mat_vec_pipeline(src0.ty, !f16_f32_kernel)
            .expect("no dequant mat-vec kernel for this operand type");

        if qy_needs_dequant {
            dev.allocate_descriptor_sets(to_fp16_1.unwrap(), tiles as usize)?;
        }
        dev.allocate_descriptor_sets(dmmv, tiles as usize)?;

        let compq = &dev.compute_queue;
        let mut seqs: Vec<Sequence> = Vec::new();
        let mut submit_counter = 0usize;

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let it_idx = (i03 * ne02 + i02) as u64;
                let qx_offset = if load_x { qx_sz * it_idx } else { 0 };
                let qy_offset = if load_y { qy_sz * it_idx } else { 0 };
                let y_offset = y_sz * it_idx;
                let d_offset = d_sz * it_idx;
                submit_counter += 1;

                let mut s = dev.begin_submission(compq)?;

                if load_x {
                    dev.h2d_tensor_2d(
                        d_qx,
                        qx_offset,
                        src0,
                        i03,
                        i02,
                        compq,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;
                }
                if load_y {
                    dev.h2d_tensor_2d(
                        d_qy,
                        qy_offset,
                        src1,
                        i03,
                        i02,
                        compq,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;
                }

                if qy_needs_dequant {
                    let pc = ConvertPush {
                        rows: ne11 as i32,
                        cols: ne10 as i32,
                        src_stride: ne10 as i32,
                        dst_stride: ne10 as i32,
                    };
                    let qy_sub = SubBuffer { buffer: d_qy, offset: qy_offset, size: qy_sz };
                    let y_sub = SubBuffer { buffer: d_y, offset: y_offset, size: y_sz };
                    dev.sync_buffers(
                        s.buffer,
                        &[qy_sub],
                        compq,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        true,
                    );
                    dev.sync_buffers(
                        s.buffer,
                        &[y_sub],
                        compq,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_WRITE,
                        false,
                    );
                    dev.dispatch_pipeline(
                        &mut s,
                        to_fp16_1.unwrap(),
                        &[qy_sub, y_sub],
                        bytes_of(&pc),
                        [y_ne as u32, 1, 1],
                    );
                }

                let ncols = ne00 as i32;
                let qx_sub = SubBuffer { buffer: d_qx, offset: qx_offset, size: qx_sz };
                let y_sub = SubBuffer { buffer: d_y, offset: y_offset, size: y_sz };
                let d_sub = SubBuffer { buffer: &d_d, offset: d_offset, size: d_sz };
                dev.sync_buffers(
                    s.buffer,
                    &[qx_sub, y_sub],
                    compq,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                    true,
                );
                dev.sync_buffers(
                    s.buffer,
                    &[d_sub],
                    compq,
                    vk::AccessFlags::TRANSFER_READ,
                    vk::AccessFlags::SHADER_WRITE,
                    false,
                );
                dev.dispatch_pipeline(&mut s, dmmv, &[qx_sub, y_sub, d_sub], bytes_of(&ncols), [
                    ne01 as u32,
                    1,
                    1,
                ]);

                let d_ptr = unsafe {
                    dst.data.host_ptr().add(i02 as usize * nb2 + i03 as usize * nb3)
                };
                dev.buffer_read_async(
                    &d_d,
                    d_offset,
                    d_ptr,
                    4 * d_ne,
                    compq,
                    Vec::new(),
                    Vec::new(),
                    Some(&mut s),
                )?;

                dev.end_submission(&mut s, Vec::new(), Vec::new())?;
                seqs.push(vec![s]);

                if it_idx == 0 || submit_counter >= SUBMIT_BATCH {
                    dev.submit(compq, &mut seqs, vk::Fence::null())?;
                    submit_counter = 0;
                }
            }
        }

        dev.submit(compq, &mut seqs, vk::Fence::null())?;

        dev.queue_wait_idle(compq)?;
        dev.queue_cleanup(compq)?;

        if qy_needs_dequant {
            dev.pipeline_cleanup(to_fp16_1.unwrap());
        }
        dev.pipeline_cleanup(dmmv);

        if let Some(b) = y_scratch {
            dev.pool_free(b);
        }
        dev.pool_free(d_d);
        if let Some(b) = qx_scratch {
            dev.pool_free(b);
        }
        if let Some(b) = qy_scratch {
            dev.pool_free(b);
        }
        Ok(())
    }

    /// Element-wise multiply with B broadcast over the batch dimensions.
    /// B must already be device-resident.
    pub(crate) fn mul_f32(
        &self,
        src0: &Tensor,
        src1: &Tensor,
        dst: &mut Tensor,
    ) -> Result<(), GpuError> {
        debug!("mul_f32(x: {:?}, y: {:?}, d: {:?})", src0.ne, src1.ne, dst.ne);
        assert_eq!(src1.backend, TensorBackend::Gpu);
        assert_eq!(src1.nb[0], std::mem::size_of::<f32>());

        let dev = &self.device;
        let [ne00, ne01, ne02, ne03] = src0.ne;
        let ne10 = src1.ne[0];
        let ne11 = src1.ne[1];
        let ne12 = src1.ne[2];
        let ne13 = src1.ne[3];
        let nb2 = dst.nb[2];
        let nb3 = dst.nb[3];

        let tile_ne = (ne00 * ne01) as usize;
        let tiles = (ne02 * ne03) as u64;
        let multi_tile = ne02 > 1 || ne03 > 1;

        let buf_sz = align_size(4 * tile_ne, dev.min_storage_offset_alignment()) as u64;

        let d_y = src1.data.device_buffer();
        let d_x = dev.pool_malloc(buf_sz * tiles)?;
        let d_d = dev.pool_malloc(buf_sz * tiles)?;

        dev.allocate_descriptor_sets(&self.pipelines.mul_f32, tiles as usize)?;

        let compq = &dev.compute_queue;
        let tr0 = &dev.transfer_queues[0];
        let tr1 = &dev.transfer_queues[1];
        let mut compute_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_0_seqs: Vec<Sequence> = Vec::new();
        let mut transfer_1_seqs: Vec<Sequence> = Vec::new();

        for i03 in 0..ne03 {
            for i02 in 0..ne02 {
                let i13 = i03 % ne13;
                let i12 = i02 % ne12;
                let i1 = i13 * ne12 * ne11 + i12 * ne11;
                let pc = MulPush {
                    ne0: ne00 as i32,
                    ne1: ne01 as i32,
                    x_row_stride: ne00 as i32,
                    x_col_stride: ne00 as i32,
                    d_stride: ne00 as i32,
                    x_offset: 0,
                    y_offset: (i1 * ne10) as i32,
                    d_offset: 0,
                };
                let d_ptr = unsafe {
                    dst.data.host_ptr().add(i02 as usize * nb2 + i03 as usize * nb3)
                };

                if multi_tile {
                    let buf_offset = buf_sz * (i03 * ne02 + i02) as u64;

                    let s_x = dev.create_semaphore(compq)?;
                    let s_mm = dev.create_semaphore(compq)?;
                    transfer_0_seqs.push(dev.h2d_tensor_2d(
                        &d_x,
                        buf_offset,
                        src0,
                        i03,
                        i02,
                        tr0,
                        Vec::new(),
                        vec![s_x],
                        None,
                    )?);
                    dev.submit(tr0, &mut transfer_0_seqs, vk::Fence::null())?;

                    let x_sub = SubBuffer { buffer: &d_x, offset: buf_offset, size: buf_sz };
                    let y_sub = SubBuffer { buffer: d_y, offset: 0, size: d_y.size() };
                    let d_sub = SubBuffer { buffer: &d_d, offset: buf_offset, size: buf_sz };

                    let mut s = dev.begin_submission(compq)?;
                    dev.sync_buffers(
                        s.buffer,
                        &[x_sub, y_sub],
                        compq,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        false,
                    );
                    dev.sync_buffers(
                        s.buffer,
                        &[d_sub],
                        compq,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_WRITE,
                        false,
                    );
                    dev.dispatch_pipeline(
                        &mut s,
                        &self.pipelines.mul_f32,
                        &[x_sub, y_sub, d_sub],
                        bytes_of(&pc),
                        [ne00 as u32, ne01 as u32, 1],
                    );
                    dev.end_submission(&mut s, vec![s_x], vec![s_mm])?;
                    compute_seqs.push(vec![s]);

                    transfer_1_seqs.push(dev.buffer_read_async(
                        &d_d,
                        buf_offset,
                        d_ptr,
                        4 * tile_ne,
                        tr1,
                        vec![s_mm],
                        Vec::new(),
                        None,
                    )?);

                    dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;
                    dev.submit(tr1, &mut transfer_1_seqs, vk::Fence::null())?;
                } else {
                    // Single tile: upload, multiply and read back inside
                    // one command buffer
                    let mut s = dev.begin_submission(compq)?;
                    dev.h2d_tensor_2d(
                        &d_x,
                        0,
                        src0,
                        i03,
                        i02,
                        compq,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;

                    let x_sub = SubBuffer { buffer: &d_x, offset: 0, size: buf_sz };
                    let y_sub = SubBuffer { buffer: d_y, offset: 0, size: d_y.size() };
                    let d_sub = SubBuffer { buffer: &d_d, offset: 0, size: buf_sz };

                    dev.sync_buffers(
                        s.buffer,
                        &[x_sub, y_sub],
                        compq,
                        vk::AccessFlags::TRANSFER_WRITE,
                        vk::AccessFlags::SHADER_READ,
                        true,
                    );
                    dev.sync_buffers(
                        s.buffer,
                        &[d_sub],
                        compq,
                        vk::AccessFlags::TRANSFER_READ,
                        vk::AccessFlags::SHADER_WRITE,
                        false,
                    );
                    dev.dispatch_pipeline(
                        &mut s,
                        &self.pipelines.mul_f32,
                        &[x_sub, y_sub, d_sub],
                        bytes_of(&pc),
                        [ne00 as u32, ne01 as u32, 1],
                    );
                    dev.buffer_read_async(
                        &d_d,
                        0,
                        d_ptr,
                        4 * tile_ne,
                        compq,
                        Vec::new(),
                        Vec::new(),
                        Some(&mut s),
                    )?;
                    dev.end_submission(&mut s, Vec::new(), Vec::new())?;
                    compute_seqs.push(vec![s]);

                    dev.submit(compq, &mut compute_seqs, vk::Fence::null())?;
                }
            }
        }

        if multi_tile {
            dev.queue_wait_idle(tr1)?;
            dev.queue_cleanup(tr0)?;
            dev.queue_cleanup(tr1)?;
            dev.queue_cleanup(compq)?;
        } else {
            dev.queue_wait_idle(compq)?;
            dev.queue_cleanup(compq)?;
        }

        dev.pipeline_cleanup(&self.pipelines.mul_f32);

        dev.pool_free(d_x);
        dev.pool_free(d_d);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn split_k_heuristic() {
        // Deep K with a narrow side splits
        assert_eq!(guess_split_k(64, 64, 512), 4);
        assert_eq!(guess_split_k(511, 511, 129), 4);
        // Wide shapes and shallow K stay single-pass
        assert_eq!(guess_split_k(128, 128, 512), 1);
        assert_eq!(guess_split_k(64, 64, 128), 1);
    }

    #[test]
    fn push_constant_layouts() {
        assert_eq!(std::mem::size_of::<MatmulPush>(), 7 * 4);
        assert_eq!(std::mem::size_of::<SplitKReducePush>(), 3 * 4);
        assert_eq!(std::mem::size_of::<ConvertPush>(), 4 * 4);
        assert_eq!(std::mem::size_of::<MulPush>(), 8 * 4);
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

    fn backend() -> Option<crate::VulkanBackend> {
        // Needs a Vulkan device and the vk_shaders/ directory
        crate::VulkanBackend::new().ok()
    }

    fn run_matmul_f32(backend: &crate::VulkanBackend, m: usize, n: usize, k: usize, split_k: i32, size_class: usize) {
        let dev = &backend.device;
        let fam = &backend.pipelines.matmul_f32;
        let p = match size_class {
            0 => &fam.s,
            1 => &fam.m,
            _ => &fam.l,
        };
        let kpad = align_size(k, p.align() as usize);

        let d_x = dev.pool_malloc((4 * kpad * m) as u64).unwrap();
        let d_y = dev.pool_malloc((4 * kpad * n) as u64).unwrap();
        let d_d = dev.pool_malloc((4 * m * n * split_k as usize) as u64).unwrap();

        let mut rng = rand::thread_rng();
        let x: Vec<f32> = (0..m * k).map(|_| rng.gen()).collect();
        let y: Vec<f32> = (0..k * n).map(|_| rng.gen()).collect();
        let mut d = vec![0.0f32; m * n];

        let tr0 = &dev.transfer_queues[0];
        let mut seqs = vec![
            dev.buffer_write_2d_async_zeropad(
                &d_x, 0, x.as_ptr() as *const u8, 4 * k, 4 * k, m, 4 * p.align() as usize,
                tr0, Vec::new(), Vec::new(), None,
            )
            .unwrap(),
            dev.buffer_write_2d_async_zeropad(
                &d_y, 0, y.as_ptr() as *const u8, 4 * k, 4 * k, n, 4 * p.align() as usize,
                tr0, Vec::new(), Vec::new(), None,
            )
            .unwrap(),
        ];
        dev.submit(tr0, &mut seqs, vk::Fence::null()).unwrap();
        dev.queue_wait_idle(tr0).unwrap();

        dev.allocate_descriptor_sets(p, 1).unwrap();
        if split_k > 1 {
            dev.allocate_descriptor_sets(&backend.pipelines.matmul_split_k_reduce, 1).unwrap();
        }

        let mut seqs = vec![backend
            .matmul(
                p,
                d_x.subbuffer(),
                d_y.subbuffer(),
                d_d.subbuffer(),
                m as i32,
                n as i32,
                k as i32,
                kpad as i32,
                kpad as i32,
                m as i32,
                split_k,
                Vec::new(),
                Vec::new(),
            )
            .unwrap()];
        dev.submit(&dev.compute_queue, &mut seqs, vk::Fence::null()).unwrap();
        dev.queue_wait_idle(&dev.compute_queue).unwrap();

        dev.buffer_read(&d_d, 0, d.as_mut_ptr() as *mut u8, 4 * m * n, tr0).unwrap();

        let d_ref = sgemm_ref(m, n, k, &x, &y);
        let avg_err: f64 = d
            .iter()
            .zip(d_ref.iter())
            .map(|(a, b)| (a - b).abs() as f64)
            .sum::<f64>()
            / (m * n) as f64;
        assert!(avg_err < 1e-3, "m={m} n={n} k={k} split_k={split_k} avg_err={avg_err}");

        dev.queue_cleanup(tr0).unwrap();
        dev.queue_cleanup(&dev.transfer_queues[1]).unwrap();
        dev.queue_cleanup(&dev.compute_queue).unwrap();
        dev.pipeline_cleanup(p);
        dev.pipeline_cleanup(&backend.pipelines.matmul_split_k_reduce);
        dev.pool_free(d_x);
        dev.pool_free(d_y);
        dev.pool_free(d_d);
    }

    #[test]
    fn matmul_f32_against_reference() {
        let Some(backend) = backend() else { return };
        run_matmul_f32(&backend, 128, 110, 622, 1, 1);
    }

    #[test]
    fn matmul_f32_split_k_matches_single_pass() {
        let Some(backend) = backend() else { return };
        run_matmul_f32(&backend, 511, 511, 127, 1, 2);
        run_matmul_f32(&backend, 511, 511, 127, 4, 2);
    }

    #[test]
    fn matmul_f16_against_reference() {
        let Some(backend) = backend() else { return };
        let Some(fam) = backend.pipelines.matmul_f16.as_ref() else { return };
        let dev = &backend.device;

        let (m, n, k) = (4096usize, 49usize, 4096usize);
        let p = &fam.m;
        let kpad = align_size(k, p.align() as usize);

        let d_x = dev.pool_malloc((2 * kpad * m) as u64).unwrap();
        let d_y = dev.pool_malloc((2 * kpad * n) as u64).unwrap();
        let d_d = dev.pool_malloc((4 * m * n) as u64).unwrap();

        let mut rng = rand::thread_rng();
        let x: Vec<f16> = (0..m * k).map(|_| f16::from_f32(rng.gen())).collect();
        let y: Vec<f16> = (0..k * n).map(|_| f16::from_f32(rng.gen())).collect();
        let mut d = vec![0.0f32; m * n];

        let tr0 = &dev.transfer_queues[0];
        let mut seqs = vec![
            dev.buffer_write_2d_async_zeropad(
                &d_x, 0, x.as_ptr() as *const u8, 2 * k, 2 * k, m, 2 * p.align() as usize,
                tr0, Vec::new(), Vec::new(), None,
            )
            .unwrap(),
            dev.buffer_write_2d_async_zeropad(
                &d_y, 0, y.as_ptr() as *const u8, 2 * k, 2 * k, n, 2 * p.align() as usize,
                tr0, Vec::new(), Vec::new(), None,
            )
            .unwrap(),
        ];
        dev.submit(tr0, &mut seqs, vk::Fence::null()).unwrap();
        dev.queue_wait_idle(tr0).unwrap();

        dev.allocate_descriptor_sets(p, 1).unwrap();
        let mut seqs = vec![backend
            .matmul(
                p,
                d_x.subbuffer(),
                d_y.subbuffer(),
                d_d.subbuffer(),
                m as i32,
                n as i32,
                k as i32,
                kpad as i32,
                kpad as i32,
                m as i32,
                1,
                Vec::new(),
                Vec::new(),
            )
            .unwrap()];
        dev.submit(&dev.compute_queue, &mut seqs, vk::Fence::null()).unwrap();
        dev.queue_wait_idle(&dev.compute_queue).unwrap();

        dev.buffer_read(&d_d, 0, d.as_mut_ptr() as *mut u8, 4 * m * n, tr0).unwrap();

        let fx: Vec<f32> = x.iter().map(|v| v.to_f32()).collect();
        let fy: Vec<f32> = y.iter().map(|v| v.to_f32()).collect();
        let d_ref = sgemm_ref(m, n, k, &fx, &fy);
        let avg_err: f64 = d
            .iter()
            .zip(d_ref.iter())
            .map(|(a, b)| (a - b).abs() as f64)
            .sum::<f64>()
            / (m * n) as f64;
        assert!(avg_err < 1e-1, "avg_err={avg_err}");

        dev.queue_cleanup(tr0).unwrap();
        dev.queue_cleanup(&dev.transfer_queues[1]).unwrap();
        dev.queue_cleanup(&dev.compute_queue).unwrap();
        dev.pipeline_cleanup(p);
        dev.pool_free(d_x);
        dev.pool_free(d_y);
        dev.pool_free(d_d);
    }

    #[test]
    fn f32_to_f16_conversion_on_device() {
        let Some(backend) = backend() else { return };
        let dev = &backend.device;

        let (m, k) = (214usize, 256usize);
        let ne = m * k;
        let d_x = dev.create_buffer((4 * ne) as u64, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        let d_y = dev.create_buffer((2 * ne) as u64, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();

        let mut rng = rand::thread_rng();
        let x: Vec<f32> = (0..ne).map(|_| rng.gen()).collect();
        let mut y = vec![f16::ZERO; ne];

        dev.buffer_write(&d_x, 0, x.as_ptr() as *const u8, 4 * ne, &dev.transfer_queues[0])
            .unwrap();
        dev.queue_wait_idle(&dev.transfer_queues[0]).unwrap();

        let p = &backend.pipelines.f32_to_f16;
        dev.allocate_descriptor_sets(p, 1).unwrap();
        let compq = &dev.compute_queue;
        let mut s = dev.begin_submission(compq).unwrap();
        let pc = ConvertPush {
            rows: m as i32,
            cols: k as i32,
            src_stride: k as i32,
            dst_stride: k as i32,
        };
        dev.sync_buffers(
            s.buffer,
            &[d_x.subbuffer()],
            compq,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::AccessFlags::SHADER_READ,
            false,
        );
        dev.sync_buffers(
            s.buffer,
            &[d_y.subbuffer()],
            compq,
            vk::AccessFlags::SHADER_READ,
            vk::AccessFlags::SHADER_WRITE,
            false,
        );
        dev.dispatch_pipeline(&mut s, p, &[d_x.subbuffer(), d_y.subbuffer()], bytes_of(&pc), [
            ne as u32, 1, 1,
        ]);
        dev.end_submission(&mut s, Vec::new(), Vec::new()).unwrap();
        let mut seqs = vec![vec![s]];
        dev.submit(compq, &mut seqs, vk::Fence::null()).unwrap();
        dev.queue_wait_idle(compq).unwrap();

        dev.buffer_read(&d_y, 0, y.as_mut_ptr() as *mut u8, 2 * ne, &dev.transfer_queues[1])
            .unwrap();

        for (i, (&xv, &yv)) in x.iter().zip(y.iter()).enumerate() {
            let expect = f16::from_f32(xv).to_f32();
            assert!((yv.to_f32() - expect).abs() < 1e-3, "element {i}: {} vs {expect}", yv.to_f32());
        }

        dev.queue_cleanup(&dev.transfer_queues[0]).unwrap();
        dev.queue_cleanup(&dev.transfer_queues[1]).unwrap();
        dev.queue_cleanup(compq).unwrap();
        dev.pipeline_cleanup(p);
        dev.destroy_buffer(d_x);
        dev.destroy_buffer(d_y);
    }
}
