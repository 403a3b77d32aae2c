//! Compute pipeline creation, descriptor-set rotation, and the
//! submission assembler.
//!
//! Pipelines are built once at startup from pre-compiled SPIR-V binaries
//! in `vk_shaders/`. Descriptor sets rotate through a per-pipeline list:
//! an orchestrator pre-allocates as many sets as it will dispatch, then
//! resets the cursor at the end of the op (queue-idle boundary), so sets
//! are overwritten rather than freed.

use std::ffi::CString;
use std::path::Path;
use std::sync::Mutex;

use ash::vk;
use log::debug;

use crate::device::{DescriptorPoolMode, GpuError, Queue, VulkanDevice};
use crate::memory::SubBuffer;

/// Sets pre-created per pipeline in MULTI descriptor-pool mode.
const DESCRIPTOR_POOL_SETS: u32 = 128;

struct DescriptorState {
    pools: Vec<vk::DescriptorPool>,
    sets: Vec<vk::DescriptorSet>,
    set_idx: usize,
}

/// A compute pipeline plus its dispatch metadata. Immutable after
/// creation except for the rotating descriptor-set state.
pub struct Pipeline {
    pub(crate) name: String,
    pub(crate) dsl: vk::DescriptorSetLayout,
    pub(crate) layout: vk::PipelineLayout,
    pub(crate) pipeline: vk::Pipeline,
    pub(crate) shader_module: vk::ShaderModule,
    pub(crate) push_constant_size: u32,
    pub(crate) parameter_count: u32,
    pub(crate) wg_denoms: [u32; 3],
    /// Leading-dimension multiple the tiled kernel requires of aligned
    /// operands.
    pub(crate) align: u32,
    state: Mutex<DescriptorState>,
}

impl Pipeline {
    pub(crate) fn align(&self) -> u32 {
        self.align
    }

    /// Destroy all Vulkan objects owned by this pipeline.
    pub(crate) fn release(&self, device: &ash::Device) {
        let state = self.state.lock().unwrap();
        unsafe {
            for &pool in &state.pools {
                device.destroy_descriptor_pool(pool, None);
            }
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.dsl, None);
            device.destroy_shader_module(self.shader_module, None);
        }
    }
}

/// A recorded command buffer plus the semaphores it waits on / signals.
pub struct Submission {
    pub(crate) buffer: vk::CommandBuffer,
    pub(crate) wait_semaphores: Vec<vk::Semaphore>,
    pub(crate) signal_semaphores: Vec<vk::Semaphore>,
}

/// Ordered submissions handed to one queue atomically.
pub type Sequence = Vec<Submission>;

impl VulkanDevice {
    /// Build a compute pipeline from a SPIR-V file.
    ///
    /// `parameter_count` storage-buffer bindings, one push-constant range
    /// of `push_constant_size` bytes, and one 32-bit specialization slot
    /// per entry of `specialization`. The first call probes whether this
    /// device can allocate several descriptor sets from one pool.
    pub(crate) fn create_pipeline(
        &mut self,
        path: &str,
        entrypoint: &str,
        parameter_count: u32,
        push_constant_size: u32,
        wg_denoms: [u32; 3],
        specialization: &[i32],
        align: u32,
    ) -> Result<Pipeline, GpuError> {
        debug!("create_pipeline({path}, {parameter_count}, {push_constant_size}, {wg_denoms:?}, {align})");
        assert!(parameter_count > 0);
        assert!(wg_denoms.iter().all(|&d| d > 0));

        let bytes = std::fs::read(path).map_err(|source| GpuError::ShaderLoad {
            path: Path::new(path).to_path_buf(),
            source,
        })?;
        let words = ash::util::read_spv(&mut std::io::Cursor::new(&bytes))
            .map_err(|source| GpuError::ShaderLoad {
                path: Path::new(path).to_path_buf(),
                source,
            })?;
        let shader_info = vk::ShaderModuleCreateInfo::default().code(&words);
        let shader_module = unsafe { self.device.create_shader_module(&shader_info, None)? };

        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..parameter_count)
            .map(|i| {
                vk::DescriptorSetLayoutBinding::default()
                    .binding(i)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::COMPUTE)
            })
            .collect();
        let dsl_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let dsl = unsafe { self.device.create_descriptor_set_layout(&dsl_info, None)? };

        // Some drivers reject allocating several sets from one pool.
        // Probe once per device and fall back to one pool per set.
        if self.descriptor_set_mode == DescriptorPoolMode::Unknown {
            self.descriptor_set_mode = self.probe_descriptor_pool_mode(dsl, parameter_count)?;
            debug!("descriptor pool mode: {:?}", self.descriptor_set_mode);
        }

        let mut pools = Vec::new();
        if self.descriptor_set_mode == DescriptorPoolMode::Multi {
            let pool_size = vk::DescriptorPoolSize::default()
                .ty(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(DESCRIPTOR_POOL_SETS * parameter_count);
            let pool_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(DESCRIPTOR_POOL_SETS)
                .pool_sizes(std::slice::from_ref(&pool_size));
            pools.push(unsafe { self.device.create_descriptor_pool(&pool_info, None)? });
        }

        let pc_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(push_constant_size);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(std::slice::from_ref(&dsl))
            .push_constant_ranges(std::slice::from_ref(&pc_range));
        let layout = unsafe { self.device.create_pipeline_layout(&layout_info, None)? };

        let spec_entries: Vec<vk::SpecializationMapEntry> = (0..specialization.len())
            .map(|i| vk::SpecializationMapEntry {
                constant_id: i as u32,
                offset: (i * std::mem::size_of::<i32>()) as u32,
                size: std::mem::size_of::<i32>(),
            })
            .collect();
        let spec_data: &[u8] = bytemuck::cast_slice(specialization);
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&spec_entries)
            .data(spec_data);

        let entry_name = CString::new(entrypoint)
            .map_err(|e| GpuError::Other(format!("bad entry point name: {e}")))?;
        let stage_info = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader_module)
            .name(&entry_name)
            .specialization_info(&spec_info);
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage_info)
            .layout(layout);
        let pipeline = unsafe {
            self.device
                .create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
                .map_err(|(_, e)| GpuError::Vk(e))?[0]
        };

        Ok(Pipeline {
            name: path.to_string(),
            dsl,
            layout,
            pipeline,
            shader_module,
            push_constant_size,
            parameter_count,
            wg_denoms,
            align,
            state: Mutex::new(DescriptorState { pools, sets: Vec::new(), set_idx: 0 }),
        })
    }

    fn probe_descriptor_pool_mode(
        &self,
        dsl: vk::DescriptorSetLayout,
        parameter_count: u32,
    ) -> Result<DescriptorPoolMode, GpuError> {
        const ALLOC_COUNT: u32 = 2;

        let pool_size = vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_BUFFER)
            .descriptor_count(ALLOC_COUNT * parameter_count);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(ALLOC_COUNT)
            .pool_sizes(std::slice::from_ref(&pool_size));
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None)? };

        let layouts = [dsl; ALLOC_COUNT as usize];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        let mode = match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(_) => DescriptorPoolMode::Multi,
            Err(vk::Result::ERROR_OUT_OF_POOL_MEMORY) => DescriptorPoolMode::Single,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                return Err(e.into());
            }
        };

        unsafe { self.device.destroy_descriptor_pool(pool, None) };
        Ok(mode)
    }

    /// Grow the pipeline's descriptor-set list to at least `n` entries.
    pub(crate) fn allocate_descriptor_sets(
        &self,
        pipeline: &Pipeline,
        n: usize,
    ) -> Result<(), GpuError> {
        let mut state = pipeline.state.lock().unwrap();
        if state.sets.len() >= n {
            return Ok(());
        }

        match self.descriptor_set_mode {
            DescriptorPoolMode::Multi => {
                let alloc_count = n - state.sets.len();
                let layouts = vec![pipeline.dsl; alloc_count];
                let alloc_info = vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(state.pools[0])
                    .set_layouts(&layouts);
                let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
                state.sets.extend(sets);
            }
            _ => {
                // One pool per set
                while state.sets.len() < n {
                    let pool_size = vk::DescriptorPoolSize::default()
                        .ty(vk::DescriptorType::STORAGE_BUFFER)
                        .descriptor_count(pipeline.parameter_count);
                    let pool_info = vk::DescriptorPoolCreateInfo::default()
                        .max_sets(1)
                        .pool_sizes(std::slice::from_ref(&pool_size));
                    let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None)? };
                    state.pools.push(pool);

                    let alloc_info = vk::DescriptorSetAllocateInfo::default()
                        .descriptor_pool(pool)
                        .set_layouts(std::slice::from_ref(&pipeline.dsl));
                    let sets = unsafe { self.device.allocate_descriptor_sets(&alloc_info)? };
                    state.sets.push(sets[0]);
                }
            }
        }
        Ok(())
    }

    /// Reset the pipeline's set cursor. Must only be called at a
    /// queue-idle boundary; existing sets are reused on the next op.
    pub(crate) fn pipeline_cleanup(&self, pipeline: &Pipeline) {
        let mut state = pipeline.state.lock().unwrap();
        state.set_idx = 0;
    }

    /// Acquire a command buffer and start recording it.
    pub(crate) fn begin_submission(&self, q: &Queue) -> Result<Submission, GpuError> {
        let buffer = self.create_cmd_buffer(q)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(buffer, &begin_info)? };
        Ok(Submission {
            buffer,
            wait_semaphores: Vec::new(),
            signal_semaphores: Vec::new(),
        })
    }

    /// Finish recording and attach the semaphore lists.
    pub(crate) fn end_submission(
        &self,
        s: &mut Submission,
        wait_semaphores: Vec<vk::Semaphore>,
        signal_semaphores: Vec<vk::Semaphore>,
    ) -> Result<(), GpuError> {
        unsafe { self.device.end_command_buffer(s.buffer)? };
        s.wait_semaphores = wait_semaphores;
        s.signal_semaphores = signal_semaphores;
        Ok(())
    }

    /// Record one dispatch: consume the pipeline's next descriptor set,
    /// write the parameter bindings, push constants, bind, dispatch.
    pub(crate) fn dispatch_pipeline(
        &self,
        s: &mut Submission,
        pipeline: &Pipeline,
        buffers: &[SubBuffer<'_>],
        push_constants: &[u8],
        elements: [u32; 3],
    ) {
        assert_eq!(push_constants.len(), pipeline.push_constant_size as usize);
        assert_eq!(buffers.len(), pipeline.parameter_count as usize);

        let wg0 = elements[0].div_ceil(pipeline.wg_denoms[0]);
        let wg1 = elements[1].div_ceil(pipeline.wg_denoms[1]);
        let wg2 = elements[2].div_ceil(pipeline.wg_denoms[2]);
        debug!("dispatch_pipeline({}, ({wg0}, {wg1}, {wg2}))", pipeline.name);

        let descriptor_set = {
            let mut state = pipeline.state.lock().unwrap();
            assert!(
                state.set_idx < state.sets.len(),
                "descriptor sets exhausted for {}",
                pipeline.name
            );
            let set = state.sets[state.set_idx];
            state.set_idx += 1;
            set
        };

        let buffer_infos: Vec<vk::DescriptorBufferInfo> = buffers
            .iter()
            .map(|sub| {
                vk::DescriptorBufferInfo::default()
                    .buffer(sub.buffer.buffer)
                    .offset(sub.offset)
                    .range(sub.size)
            })
            .collect();
        let writes: Vec<vk::WriteDescriptorSet> = buffer_infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(descriptor_set)
                    .dst_binding(i as u32)
                    .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                    .buffer_info(std::slice::from_ref(info))
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };

        unsafe {
            self.device.cmd_push_constants(
                s.buffer,
                pipeline.layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                push_constants,
            );
            self.device
                .cmd_bind_pipeline(s.buffer, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            self.device.cmd_bind_descriptor_sets(
                s.buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                &[descriptor_set],
                &[],
            );
            self.device.cmd_dispatch(s.buffer, wg0, wg1, wg2);
        }
    }

    /// Batch every pending sequence onto the queue in one submit call,
    /// with per-wait stage masks equal to the queue's profile. Clears
    /// `sequences` on success.
    pub(crate) fn submit(
        &self,
        q: &Queue,
        sequences: &mut Vec<Sequence>,
        fence: vk::Fence,
    ) -> Result<(), GpuError> {
        if sequences.is_empty() {
            return Ok(());
        }
        debug!("submit(family {}, {} sequences)", q.family_index, sequences.len());

        let stage_masks: Vec<Vec<vk::PipelineStageFlags>> = sequences
            .iter()
            .flatten()
            .map(|s| vec![q.stage_flags; s.wait_semaphores.len()])
            .collect();

        let submit_infos: Vec<vk::SubmitInfo> = sequences
            .iter()
            .flatten()
            .zip(stage_masks.iter())
            .map(|(s, masks)| {
                vk::SubmitInfo::default()
                    .wait_semaphores(&s.wait_semaphores)
                    .wait_dst_stage_mask(masks)
                    .command_buffers(std::slice::from_ref(&s.buffer))
                    .signal_semaphores(&s.signal_semaphores)
            })
            .collect();

        {
            let _guard = q.ring.lock().unwrap();
            unsafe { self.device.queue_submit(q.queue, &submit_infos, fence)? };
        }

        sequences.clear();
        Ok(())
    }
}

/// The S/M/L variants of one tiled matmul shader family.
pub(crate) struct MatmulPipelines {
    pub s: Pipeline,
    pub m: Pipeline,
    pub l: Pipeline,
    pub aligned_s: Pipeline,
    pub aligned_m: Pipeline,
    pub aligned_l: Pipeline,
}

impl MatmulPipelines {
    fn release(&self, device: &ash::Device) {
        for p in [&self.s, &self.m, &self.l, &self.aligned_s, &self.aligned_m, &self.aligned_l] {
            p.release(device);
        }
    }
}

/// All compute pipelines the backend dispatches. The f16 families exist
/// only when the device supports 16-bit storage and arithmetic.
pub(crate) struct Pipelines {
    pub matmul_f32: MatmulPipelines,
    pub matmul_f16: Option<MatmulPipelines>,
    pub matmul_f16_f32: Option<MatmulPipelines>,
    pub matmul_split_k_reduce: Pipeline,
    pub dequant_mul_mat_vec_f16: Option<Pipeline>,
    pub dequant_mul_mat_vec_q4_0: Option<Pipeline>,
    pub dequant_mul_mat_vec_f16_f32: Pipeline,
    pub dequant_mul_mat_vec_q4_0_f32: Pipeline,
    pub f32_to_f16: Pipeline,
    pub dequant_q4_0: Pipeline,
    pub mul_f32: Pipeline,
}

// Warp tile shapes baked into the matmul shaders as specialization
// constants; one row per shader size class.
const WARPTILE_L: [i32; 9] = [128, 128, 128, 16, 64, 64, 2, 4, 4];
const WARPTILE_M: [i32; 9] = [128, 64, 64, 16, 32, 32, 2, 4, 2];
const WARPTILE_S: [i32; 9] = [32, 32, 32, 8, 32, 32, 2, 2, 2];

const MATMUL_PUSH_SIZE: u32 = 7 * 4;

impl Pipelines {
    /// Load every shader from `vk_shaders/` and build the pipeline set.
    pub(crate) fn load(device: &mut VulkanDevice) -> Result<Self, GpuError> {
        let matmul_f32 = Self::load_matmul_family(device, "matmul_f32")?;
        let (matmul_f16, matmul_f16_f32, dequant_mul_mat_vec_f16, dequant_mul_mat_vec_q4_0) =
            if device.fp16() {
                (
                    Some(Self::load_matmul_family(device, "matmul_f16")?),
                    Some(Self::load_matmul_family(device, "matmul_f16_f32")?),
                    Some(device.create_pipeline(
                        "vk_shaders/dequant_mul_mat_vec_f16.spv",
                        "main",
                        3,
                        4,
                        [1, 1, 1],
                        &[],
                        1,
                    )?),
                    Some(device.create_pipeline(
                        "vk_shaders/dequant_mul_mat_vec_q4_0.spv",
                        "main",
                        3,
                        4,
                        [1, 1, 1],
                        &[],
                        1,
                    )?),
                )
            } else {
                (None, None, None, None)
            };

        let matmul_split_k_reduce = device.create_pipeline(
            "vk_shaders/matmul_split_k_reduce.spv",
            "main",
            1,
            3 * 4,
            [32, 32, 1],
            &[],
            1,
        )?;
        let f32_to_f16 =
            device.create_pipeline("vk_shaders/f32_to_f16.spv", "main", 2, 4 * 4, [64, 1, 1], &[], 1)?;
        let dequant_q4_0 = device.create_pipeline(
            "vk_shaders/dequant_q4_0.spv",
            "main",
            2,
            4 * 4,
            [256 * 32, 1, 1],
            &[],
            1,
        )?;
        let dequant_mul_mat_vec_f16_f32 = device.create_pipeline(
            "vk_shaders/dequant_mul_mat_vec_f16_f32.spv",
            "main",
            3,
            4,
            [1, 1, 1],
            &[],
            1,
        )?;
        let dequant_mul_mat_vec_q4_0_f32 = device.create_pipeline(
            "vk_shaders/dequant_mul_mat_vec_q4_0_f32.spv",
            "main",
            3,
            4,
            [1, 1, 1],
            &[],
            1,
        )?;
        let mul_f32 =
            device.create_pipeline("vk_shaders/mul_f32.spv", "main", 3, 8 * 4, [32, 32, 1], &[], 1)?;

        Ok(Pipelines {
            matmul_f32,
            matmul_f16,
            matmul_f16_f32,
            matmul_split_k_reduce,
            dequant_mul_mat_vec_f16,
            dequant_mul_mat_vec_q4_0,
            dequant_mul_mat_vec_f16_f32,
            dequant_mul_mat_vec_q4_0_f32,
            f32_to_f16,
            dequant_q4_0,
            mul_f32,
        })
    }

    fn load_matmul_family(
        device: &mut VulkanDevice,
        base: &str,
    ) -> Result<MatmulPipelines, GpuError> {
        let plain = format!("vk_shaders/{base}.spv");
        let aligned = format!("vk_shaders/{base}_aligned.spv");
        Ok(MatmulPipelines {
            l: device.create_pipeline(&plain, "main", 3, MATMUL_PUSH_SIZE, [128, 128, 1], &WARPTILE_L, 128)?,
            m: device.create_pipeline(&plain, "main", 3, MATMUL_PUSH_SIZE, [64, 64, 1], &WARPTILE_M, 64)?,
            s: device.create_pipeline(&plain, "main", 3, MATMUL_PUSH_SIZE, [32, 32, 1], &WARPTILE_S, 32)?,
            aligned_l: device.create_pipeline(&aligned, "main", 3, MATMUL_PUSH_SIZE, [128, 128, 1], &WARPTILE_L, 128)?,
            aligned_m: device.create_pipeline(&aligned, "main", 3, MATMUL_PUSH_SIZE, [64, 64, 1], &WARPTILE_M, 64)?,
            aligned_s: device.create_pipeline(&aligned, "main", 3, MATMUL_PUSH_SIZE, [32, 32, 1], &WARPTILE_S, 32)?,
        })
    }

    pub(crate) fn release(&self, device: &ash::Device) {
        self.matmul_f32.release(device);
        if let Some(p) = &self.matmul_f16 {
            p.release(device);
        }
        if let Some(p) = &self.matmul_f16_f32 {
            p.release(device);
        }
        self.matmul_split_k_reduce.release(device);
        if let Some(p) = &self.dequant_mul_mat_vec_f16 {
            p.release(device);
        }
        if let Some(p) = &self.dequant_mul_mat_vec_q4_0 {
            p.release(device);
        }
        self.dequant_mul_mat_vec_f16_f32.release(device);
        self.dequant_mul_mat_vec_q4_0_f32.release(device);
        self.f32_to_f16.release(device);
        self.dequant_q4_0.release(device);
        self.mul_f32.release(device);
    }
}
