//! Hardware backend on `VK_KHR_ray_tracing_pipeline`.
//!
//! Structures are `VkAccelerationStructureKHR` objects placed in buffers
//! from the device allocator, program groups are single-group pipeline
//! libraries, and a launch is one `vkCmdTraceRaysKHR` recorded on a
//! [`VulkanStream`]. The launch parameters reach device code as a push
//! constant holding their address and size.

mod accel;
mod program;
mod spirv;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use parking_lot::Mutex;
use photon_core::{align_up, DevicePtr};
use photon_gpu::{MemoryBlock, Stream, VulkanDevice, VulkanShared, VulkanStream};

pub use spirv::SpirvEntry;

use crate::backend::{
    AccelBufferSizes, AccelBuildOptions, BuildOperation, ModuleCompileOptions, ModuleHandle,
    ModuleSource, NativeBuildInput, NativeInstance, PipelineCompileOptions, PipelineHandle,
    PipelineLinkOptions, ProgramGroupDesc, ProgramGroupHandle, RtBackend, TraversableHandle,
};
use crate::context::DeviceProperties;
use crate::error::{Result, RtError};
use crate::sbt::{SbtHeader, ShaderBindingTable, SBT_RECORD_HEADER_SIZE};
use accel::SizeQuery;
use program::{Interface, VkModule, RAY_TRACING_STAGES};

/// Push constant block visible to every program of a launch.
#[derive(Clone, Copy, Debug, Pod, Zeroable)]
#[repr(C)]
pub struct LaunchConstants {
    pub params: u64,
    pub params_size: u64,
}

impl LaunchConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

struct Structure {
    raw: vk::AccelerationStructureKHR,
    ty: vk::AccelerationStructureTypeKHR,
}

/// A pipeline or pipeline library, destroyed with its last reference.
struct PipelineObject {
    shared: Arc<VulkanShared>,
    raw: vk::Pipeline,
    // Libraries a linked pipeline was built from.
    _libraries: Vec<Arc<PipelineObject>>,
}

impl Drop for PipelineObject {
    fn drop(&mut self) {
        unsafe { self.shared.device().destroy_pipeline(self.raw, None) };
    }
}

struct Group {
    library: Arc<PipelineObject>,
    header: SbtHeader,
}

/// [`RtBackend`] over a [`VulkanDevice`].
pub struct VulkanBackend {
    shared: Arc<VulkanShared>,
    as_loader: ash::khr::acceleration_structure::Device,
    rt_loader: ash::khr::ray_tracing_pipeline::Device,
    layout: vk::PipelineLayout,
    next_id: AtomicU64,
    structures: Mutex<HashMap<u64, Structure>>,
    modules: Mutex<HashMap<u64, VkModule>>,
    groups: Mutex<HashMap<u64, Group>>,
    pipelines: Mutex<HashMap<u64, Arc<PipelineObject>>>,
}

impl VulkanBackend {
    pub fn new(device: &VulkanDevice) -> Result<Self> {
        let shared = Arc::clone(device.shared());
        let rt = &shared.capabilities().ray_tracing;
        if !rt.is_supported() {
            return Err(RtError::unsupported(format!(
                "{} lacks the ray tracing extensions",
                shared.capabilities().device_name
            )));
        }
        if rt.shader_group_handle_size as usize > SBT_RECORD_HEADER_SIZE {
            return Err(RtError::unsupported(format!(
                "shader group handles of {} bytes do not fit a record header",
                rt.shader_group_handle_size
            )));
        }

        let as_loader =
            ash::khr::acceleration_structure::Device::new(shared.instance(), shared.device());
        let rt_loader =
            ash::khr::ray_tracing_pipeline::Device::new(shared.instance(), shared.device());
        let push_constants = vk::PushConstantRange::default()
            .stage_flags(RAY_TRACING_STAGES)
            .offset(0)
            .size(LaunchConstants::SIZE);
        let layout_info = vk::PipelineLayoutCreateInfo::default()
            .push_constant_ranges(std::slice::from_ref(&push_constants));
        let layout = unsafe { shared.device().create_pipeline_layout(&layout_info, None)? };

        tracing::debug!(
            "Vulkan ray tracing backend ready: handle size {}, max recursion {}",
            rt.shader_group_handle_size,
            rt.max_ray_recursion_depth
        );
        Ok(Self {
            shared,
            as_loader,
            rt_loader,
            layout,
            next_id: AtomicU64::new(1),
            structures: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            groups: Mutex::new(HashMap::new()),
            pipelines: Mutex::new(HashMap::new()),
        })
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn vulkan_stream<'s>(&self, stream: &'s dyn Stream) -> Result<&'s VulkanStream> {
        let vulkan = stream
            .as_any()
            .downcast_ref::<VulkanStream>()
            .ok_or_else(|| RtError::invalid_value("stream is not a Vulkan stream"))?;
        if !Arc::ptr_eq(vulkan.shared(), &self.shared) {
            return Err(RtError::invalid_value("stream belongs to another device"));
        }
        Ok(vulkan)
    }

    /// Create a structure object over `block`.
    fn create_structure(
        &self,
        block: MemoryBlock,
        ty: vk::AccelerationStructureTypeKHR,
    ) -> Result<(TraversableHandle, vk::AccelerationStructureKHR)> {
        let (buffer, offset) = self.shared.resolve(block.ptr, block.size)?;
        if offset % accel::STRUCTURE_ALIGNMENT != 0 {
            return Err(RtError::invalid_value(format!(
                "structure at {:?} is not {}-byte aligned in its buffer",
                block.ptr,
                accel::STRUCTURE_ALIGNMENT
            )));
        }
        let info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(buffer)
            .offset(offset)
            .size(block.size)
            .ty(ty);
        let raw = unsafe { self.as_loader.create_acceleration_structure(&info, None)? };
        let address_info =
            vk::AccelerationStructureDeviceAddressInfoKHR::default().acceleration_structure(raw);
        let address = unsafe {
            self.as_loader
                .get_acceleration_structure_device_address(&address_info)
        };
        Ok((TraversableHandle(address), raw))
    }

    fn register(&self, handle: TraversableHandle, structure: Structure) {
        if let Some(old) = self.structures.lock().insert(handle.0, structure) {
            unsafe {
                self.as_loader
                    .destroy_acceleration_structure(old.raw, None);
            }
        }
    }

    fn region(address: u64, stride: u64, count: u64) -> vk::StridedDeviceAddressRegionKHR {
        if address == 0 {
            return vk::StridedDeviceAddressRegionKHR::default();
        }
        vk::StridedDeviceAddressRegionKHR::default()
            .device_address(address)
            .stride(stride)
            .size(stride * count)
    }
}

impl Drop for VulkanBackend {
    fn drop(&mut self) {
        let device = self.shared.device();
        unsafe {
            if let Err(e) = self.shared.wait_idle() {
                tracing::error!("Failed to idle device before backend teardown: {e}");
            }
            for (_, structure) in self.structures.get_mut().drain() {
                self.as_loader
                    .destroy_acceleration_structure(structure.raw, None);
            }
            for (_, module) in self.modules.get_mut().drain() {
                device.destroy_shader_module(module.module, None);
            }
            self.pipelines.get_mut().clear();
            self.groups.get_mut().clear();
            device.destroy_pipeline_layout(self.layout, None);
        }
    }
}

impl RtBackend for VulkanBackend {
    fn device_id(&self) -> u32 {
        self.shared.device_id()
    }

    fn name(&self) -> &'static str {
        "vulkan"
    }

    fn properties(&self) -> DeviceProperties {
        let rt = &self.shared.capabilities().ray_tracing;
        let clamp = |value: u64| u32::try_from(value).unwrap_or(u32::MAX);
        DeviceProperties {
            rtcore_version: 0,
            max_trace_depth: rt.max_ray_recursion_depth,
            max_traversable_graph_depth: 2,
            max_primitives_per_gas: clamp(rt.max_primitive_count),
            max_instances_per_ias: clamp(rt.max_instance_count),
            max_instance_id: accel::MAX_INSTANCE_FIELD,
            max_sbt_records_per_gas: clamp(rt.max_geometry_count),
            max_sbt_offset: accel::MAX_INSTANCE_FIELD,
            num_bits_instance_visibility_mask: 8,
            shader_group_handle_size: rt.shader_group_handle_size,
        }
    }

    fn structure_alignment(&self) -> u64 {
        accel::STRUCTURE_ALIGNMENT
    }

    fn accel_compute_memory_usage(
        &self,
        options: &AccelBuildOptions,
        inputs: &[NativeBuildInput],
    ) -> Result<AccelBufferSizes> {
        let geometries = accel::geometries(inputs)?;
        let info = accel::build_info(
            options,
            &geometries,
            vk::BuildAccelerationStructureModeKHR::BUILD,
        );
        let mut sizes = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            self.as_loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &info,
                &geometries.counts,
                &mut sizes,
            );
        }
        let scratch_alignment =
            u64::from(self.shared.capabilities().ray_tracing.min_scratch_offset_alignment).max(1);
        Ok(AccelBufferSizes {
            output_size: sizes.acceleration_structure_size,
            temp_size: align_up(sizes.build_scratch_size, scratch_alignment),
            temp_update_size: align_up(sizes.update_scratch_size, scratch_alignment),
        })
    }

    fn accel_build(
        &self,
        stream: &dyn Stream,
        options: &AccelBuildOptions,
        inputs: &[NativeBuildInput],
        temp: MemoryBlock,
        output: MemoryBlock,
        compacted_size: Option<DevicePtr>,
    ) -> Result<TraversableHandle> {
        let stream = self.vulkan_stream(stream)?;
        let geometries = accel::geometries(inputs)?;
        let scratch_alignment =
            u64::from(self.shared.capabilities().ray_tracing.min_scratch_offset_alignment).max(1);
        if temp.ptr.addr() % scratch_alignment != 0 {
            return Err(RtError::invalid_value(format!(
                "temp buffer must be {scratch_alignment}-byte aligned"
            )));
        }

        let (handle, raw, mode, src) = match options.operation {
            BuildOperation::Build => {
                let (handle, raw) = self.create_structure(output, geometries.ty)?;
                (
                    handle,
                    raw,
                    vk::BuildAccelerationStructureModeKHR::BUILD,
                    vk::AccelerationStructureKHR::null(),
                )
            }
            BuildOperation::Update(source) => {
                let raw = self
                    .structures
                    .lock()
                    .get(&source.0)
                    .map(|s| s.raw)
                    .ok_or_else(|| {
                        RtError::invalid_value(format!("{source:?} is not a live structure"))
                    })?;
                (source, raw, vk::BuildAccelerationStructureModeKHR::UPDATE, raw)
            }
        };

        let query = compacted_size
            .map(|_| SizeQuery::new(Arc::clone(&self.shared)))
            .transpose()?;
        let size_target = compacted_size
            .map(|ptr| self.shared.resolve(ptr, 8))
            .transpose()?;

        let info = accel::build_info(options, &geometries, mode)
            .src_acceleration_structure(src)
            .dst_acceleration_structure(raw)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: temp.ptr.addr(),
            });
        let ranges = geometries.ranges();
        let recorded = unsafe {
            stream.record(|device, cmd| {
                if let Some(query) = &query {
                    device.cmd_reset_query_pool(cmd, query.pool, 0, 1);
                }
                self.as_loader
                    .cmd_build_acceleration_structures(cmd, &[info], &[ranges.as_slice()]);
                Ok(())
            })
        };
        if let Err(e) = recorded {
            if options.operation == BuildOperation::Build {
                unsafe { self.as_loader.destroy_acceleration_structure(raw, None) };
            }
            return Err(e.into());
        }
        if options.operation == BuildOperation::Build {
            self.register(
                handle,
                Structure {
                    raw,
                    ty: geometries.ty,
                },
            );
        }

        if let (Some(query), Some((buffer, offset))) = (query, size_target) {
            unsafe {
                stream.record(|device, cmd| {
                    self.as_loader.cmd_write_acceleration_structures_properties(
                        cmd,
                        &[raw],
                        vk::QueryType::ACCELERATION_STRUCTURE_COMPACTED_SIZE_KHR,
                        query.pool,
                        0,
                    );
                    device.cmd_copy_query_pool_results(
                        cmd,
                        query.pool,
                        0,
                        1,
                        buffer,
                        offset,
                        8,
                        vk::QueryResultFlags::TYPE_64 | vk::QueryResultFlags::WAIT,
                    );
                    Ok(())
                })?;
            }
            stream.defer_release(Box::new(query));
        }
        Ok(handle)
    }

    fn accel_compact(
        &self,
        stream: &dyn Stream,
        source: TraversableHandle,
        output: MemoryBlock,
    ) -> Result<TraversableHandle> {
        let stream = self.vulkan_stream(stream)?;
        let (src, ty) = self
            .structures
            .lock()
            .get(&source.0)
            .map(|s| (s.raw, s.ty))
            .ok_or_else(|| RtError::invalid_value(format!("{source:?} is not a live structure")))?;
        let (handle, dst) = self.create_structure(output, ty)?;
        let info = vk::CopyAccelerationStructureInfoKHR::default()
            .src(src)
            .dst(dst)
            .mode(vk::CopyAccelerationStructureModeKHR::COMPACT);
        let recorded = unsafe {
            stream.record(|_, cmd| {
                self.as_loader.cmd_copy_acceleration_structure(cmd, &info);
                Ok(())
            })
        };
        if let Err(e) = recorded {
            unsafe { self.as_loader.destroy_acceleration_structure(dst, None) };
            return Err(e.into());
        }
        self.register(handle, Structure { raw: dst, ty });
        Ok(handle)
    }

    fn accel_release(&self, handle: TraversableHandle) {
        if let Some(structure) = self.structures.lock().remove(&handle.0) {
            unsafe {
                self.as_loader
                    .destroy_acceleration_structure(structure.raw, None);
            }
        }
    }

    fn instance_stride(&self) -> u64 {
        accel::INSTANCE_STRIDE
    }

    fn encode_instances(&self, instances: &[NativeInstance]) -> Result<Vec<u8>> {
        accel::encode_instances(instances)
    }

    fn module_create(
        &self,
        source: &ModuleSource,
        _module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
    ) -> Result<ModuleHandle> {
        let ModuleSource::Spirv(words) = source else {
            return Err(RtError::unsupported(
                "the Vulkan backend compiles SPIR-V, not host program images",
            ));
        };
        let interface = Interface::new(
            pipeline_options,
            self.shared.capabilities().ray_tracing.max_ray_recursion_depth,
        );
        let module = unsafe { VkModule::new(self.shared.device(), words, interface)? };
        tracing::debug!(
            "Created SPIR-V module with {} ray tracing entry points",
            module.entries.len()
        );
        let id = self.next_id();
        self.modules.lock().insert(id, module);
        Ok(ModuleHandle(id))
    }

    fn module_destroy(&self, module: ModuleHandle) {
        if let Some(module) = self.modules.lock().remove(&module.0) {
            unsafe { self.shared.device().destroy_shader_module(module.module, None) };
        }
    }

    fn program_group_create(&self, desc: &ProgramGroupDesc) -> Result<ProgramGroupHandle> {
        let handle_size = self.shared.capabilities().ray_tracing.shader_group_handle_size;
        let created = {
            let modules = self.modules.lock();
            unsafe {
                program::create_group(
                    self.shared.device(),
                    &self.rt_loader,
                    self.layout,
                    &modules,
                    desc,
                    handle_size,
                )?
            }
        };
        let mut header = SbtHeader::default();
        header.storage[..created.handle.len()].copy_from_slice(&created.handle);
        let id = self.next_id();
        self.groups.lock().insert(
            id,
            Group {
                library: Arc::new(PipelineObject {
                    shared: Arc::clone(&self.shared),
                    raw: created.library,
                    _libraries: Vec::new(),
                }),
                header,
            },
        );
        Ok(ProgramGroupHandle(id))
    }

    fn program_group_destroy(&self, group: ProgramGroupHandle) {
        self.groups.lock().remove(&group.0);
    }

    fn sbt_record_pack_header(&self, group: ProgramGroupHandle) -> Result<SbtHeader> {
        self.groups
            .lock()
            .get(&group.0)
            .map(|g| g.header)
            .ok_or_else(|| RtError::invalid_value(format!("unknown program group {group:?}")))
    }

    fn pipeline_create(
        &self,
        groups: &[ProgramGroupHandle],
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
    ) -> Result<PipelineHandle> {
        let libraries = {
            let known = self.groups.lock();
            groups
                .iter()
                .map(|g| {
                    known.get(&g.0).map(|group| Arc::clone(&group.library)).ok_or_else(|| {
                        RtError::invalid_value(format!("unknown program group {g:?}"))
                    })
                })
                .collect::<Result<Vec<_>>>()?
        };
        let device_max = self.shared.capabilities().ray_tracing.max_ray_recursion_depth;
        let interface = Interface::new(compile_options, device_max);
        let raw_libraries: Vec<vk::Pipeline> = libraries.iter().map(|l| l.raw).collect();
        let raw = unsafe {
            program::link(
                &self.rt_loader,
                self.layout,
                &raw_libraries,
                interface,
                link_options.max_trace_depth.min(device_max),
            )?
        };
        let id = self.next_id();
        self.pipelines.lock().insert(
            id,
            Arc::new(PipelineObject {
                shared: Arc::clone(&self.shared),
                raw,
                _libraries: libraries,
            }),
        );
        Ok(PipelineHandle(id))
    }

    fn pipeline_destroy(&self, pipeline: PipelineHandle) {
        self.pipelines.lock().remove(&pipeline.0);
    }

    fn launch(
        &self,
        pipeline: PipelineHandle,
        stream: &dyn Stream,
        params: DevicePtr,
        params_size: u64,
        sbt: &ShaderBindingTable,
        width: u32,
        height: u32,
        depth: u32,
    ) -> Result<()> {
        let stream = self.vulkan_stream(stream)?;
        if !sbt.exception_record.is_null() {
            return Err(RtError::unsupported("exception records on Vulkan"));
        }
        let object = self
            .pipelines
            .lock()
            .get(&pipeline.0)
            .cloned()
            .ok_or_else(|| RtError::invalid_value(format!("unknown pipeline {pipeline:?}")))?;

        let rt = &self.shared.capabilities().ray_tracing;
        let raygen_size = align_up(
            u64::from(rt.shader_group_handle_size),
            u64::from(rt.shader_group_handle_alignment.max(1)),
        );
        let raygen = Self::region(sbt.raygen_record.addr(), raygen_size, 1);
        let miss = Self::region(
            sbt.miss_record_base.addr(),
            u64::from(sbt.miss_record_stride_in_bytes),
            u64::from(sbt.miss_record_count),
        );
        let hit = Self::region(
            sbt.hitgroup_record_base.addr(),
            u64::from(sbt.hitgroup_record_stride_in_bytes),
            u64::from(sbt.hitgroup_record_count),
        );
        let callable = Self::region(
            sbt.callables_record_base.addr(),
            u64::from(sbt.callables_record_stride_in_bytes),
            u64::from(sbt.callables_record_count),
        );
        let constants = LaunchConstants {
            params: params.addr(),
            params_size,
        };

        unsafe {
            stream.record(|device, cmd| {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::RAY_TRACING_KHR, object.raw);
                device.cmd_push_constants(
                    cmd,
                    self.layout,
                    RAY_TRACING_STAGES,
                    0,
                    bytemuck::bytes_of(&constants),
                );
                self.rt_loader.cmd_trace_rays(
                    cmd, &raygen, &miss, &hit, &callable, width, height, depth,
                );
                Ok(())
            })?;
        }
        stream.defer_release(Box::new(object));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_constants_layout() {
        assert_eq!(LaunchConstants::SIZE, 16);
        let constants = LaunchConstants {
            params: 0x1000,
            params_size: 24,
        };
        let bytes = bytemuck::bytes_of(&constants);
        assert_eq!(&bytes[0..8], &0x1000u64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &24u64.to_ne_bytes());
    }

    #[test]
    fn empty_regions_are_null() {
        let region = VulkanBackend::region(0, 64, 4);
        assert_eq!(region.device_address, 0);
        assert_eq!(region.size, 0);
        let region = VulkanBackend::region(0x4000, 64, 3);
        assert_eq!(region.size, 192);
    }
}
