//! Shader modules, program group libraries and linked pipelines.
//!
//! Every program group is compiled into its own pipeline library with one
//! shader group, so its handle can be queried before any pipeline exists.
//! Pipelines link the libraries of their groups without adding stages.

use std::ffi::CString;

use ash::vk;
use hashbrown::HashMap;

use super::spirv::{self, SpirvEntry};
use crate::backend::{EntryPoint, PipelineCompileOptions, ProgramGroupDesc};
use crate::error::{Result, RtError, Status};
use crate::module::ProgramKind;

/// Stages that can read the launch push constants.
pub const RAY_TRACING_STAGES: vk::ShaderStageFlags = vk::ShaderStageFlags::from_raw(
    vk::ShaderStageFlags::RAYGEN_KHR.as_raw()
        | vk::ShaderStageFlags::MISS_KHR.as_raw()
        | vk::ShaderStageFlags::CLOSEST_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::ANY_HIT_KHR.as_raw()
        | vk::ShaderStageFlags::INTERSECTION_KHR.as_raw()
        | vk::ShaderStageFlags::CALLABLE_KHR.as_raw(),
);

/// Payload and attribute sizes every library of a pipeline must agree on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Interface {
    pub payload_size: u32,
    pub attribute_size: u32,
    pub max_trace_depth: u32,
}

impl Interface {
    pub fn new(options: &PipelineCompileOptions, device_max_depth: u32) -> Self {
        Self {
            payload_size: options.num_payload_values * 4,
            attribute_size: options.num_attribute_values * 4,
            max_trace_depth: options.max_trace_depth.min(device_max_depth),
        }
    }

    fn create_info(&self) -> vk::RayTracingPipelineInterfaceCreateInfoKHR<'static> {
        vk::RayTracingPipelineInterfaceCreateInfoKHR::default()
            .max_pipeline_ray_payload_size(self.payload_size)
            .max_pipeline_ray_hit_attribute_size(self.attribute_size)
    }
}

pub struct VkModule {
    pub module: vk::ShaderModule,
    pub entries: Vec<SpirvEntry>,
    pub interface: Interface,
}

impl VkModule {
    /// # Safety
    /// `device` must be valid.
    pub unsafe fn new(device: &ash::Device, words: &[u32], interface: Interface) -> Result<Self> {
        let entries = spirv::entry_points(words)?;
        let info = vk::ShaderModuleCreateInfo::default().code(words);
        let module = device
            .create_shader_module(&info, None)
            .map_err(|e| RtError::new(Status::ModuleCreationFailed, e.to_string()))?;
        Ok(Self {
            module,
            entries,
            interface,
        })
    }
}

pub struct VkGroup {
    pub library: vk::Pipeline,
    pub handle: Vec<u8>,
}

/// Stages of one group, in the order the group info refers to them.
struct Stages {
    names: Vec<CString>,
    modules: Vec<vk::ShaderModule>,
    flags: Vec<vk::ShaderStageFlags>,
    interface: Option<Interface>,
}

impl Stages {
    fn new() -> Self {
        Self {
            names: Vec::new(),
            modules: Vec::new(),
            flags: Vec::new(),
            interface: None,
        }
    }

    /// Add `entry` as a `kind` program and return its stage index.
    fn push(
        &mut self,
        modules: &HashMap<u64, VkModule>,
        entry: &EntryPoint,
        kind: ProgramKind,
    ) -> Result<u32> {
        let module = modules
            .get(&entry.module.0)
            .ok_or_else(|| RtError::invalid_value(format!("unknown module {:?}", entry.module)))?;
        let stage = spirv::stage_for(kind)
            .ok_or_else(|| RtError::unsupported(format!("{kind:?} programs on Vulkan")))?;
        let found = module
            .entries
            .iter()
            .find(|e| e.name == entry.name)
            .ok_or_else(|| {
                RtError::not_found(format!("entry point '{}' not found in module", entry.name))
            })?;
        if found.stage != stage {
            return Err(RtError::invalid_value(format!(
                "'{}' is a {:?} shader, not {kind:?}",
                entry.name, found.stage
            )));
        }
        let name = CString::new(entry.name.as_str())
            .map_err(|_| RtError::invalid_value("entry point name contains NUL"))?;
        self.names.push(name);
        self.modules.push(module.module);
        self.flags.push(stage);
        self.interface.get_or_insert(module.interface);
        Ok(self.flags.len() as u32 - 1)
    }

    fn infos(&self) -> Vec<vk::PipelineShaderStageCreateInfo<'_>> {
        self.names
            .iter()
            .zip(&self.modules)
            .zip(&self.flags)
            .map(|((name, &module), &stage)| {
                vk::PipelineShaderStageCreateInfo::default()
                    .stage(stage)
                    .module(module)
                    .name(name)
            })
            .collect()
    }
}

fn general(stage: u32) -> vk::RayTracingShaderGroupCreateInfoKHR<'static> {
    vk::RayTracingShaderGroupCreateInfoKHR::default()
        .ty(vk::RayTracingShaderGroupTypeKHR::GENERAL)
        .general_shader(stage)
        .closest_hit_shader(vk::SHADER_UNUSED_KHR)
        .any_hit_shader(vk::SHADER_UNUSED_KHR)
        .intersection_shader(vk::SHADER_UNUSED_KHR)
}

fn pipeline_error(e: vk::Result, what: &str) -> RtError {
    RtError::new(Status::PipelineCreationFailed, format!("{what}: {e}"))
}

/// Compile `desc` into a single-group pipeline library and read its handle.
///
/// # Safety
/// `device`, `loader` and `layout` must be valid.
pub unsafe fn create_group(
    device: &ash::Device,
    loader: &ash::khr::ray_tracing_pipeline::Device,
    layout: vk::PipelineLayout,
    modules: &HashMap<u64, VkModule>,
    desc: &ProgramGroupDesc,
    handle_size: u32,
) -> Result<VkGroup> {
    let mut stages = Stages::new();
    let group = match desc {
        ProgramGroupDesc::Raygen(entry) => general(stages.push(modules, entry, ProgramKind::Raygen)?),
        ProgramGroupDesc::Miss(entry) => general(stages.push(modules, entry, ProgramKind::Miss)?),
        ProgramGroupDesc::Exception(_) => {
            return Err(RtError::unsupported("exception programs on Vulkan"));
        }
        ProgramGroupDesc::Callables {
            direct: Some(_),
            continuation: Some(_),
        } => {
            return Err(RtError::unsupported(
                "direct and continuation callables in one group on Vulkan",
            ));
        }
        ProgramGroupDesc::Callables {
            direct,
            continuation,
        } => {
            let (entry, kind) = match (direct, continuation) {
                (Some(entry), _) => (entry, ProgramKind::DirectCallable),
                (None, Some(entry)) => (entry, ProgramKind::ContinuationCallable),
                (None, None) => {
                    return Err(RtError::invalid_value("callable group without programs"));
                }
            };
            general(stages.push(modules, entry, kind)?)
        }
        ProgramGroupDesc::HitGroup {
            closest_hit,
            any_hit,
            intersection,
        } => {
            let mut stage = |entry: &Option<EntryPoint>, kind| {
                entry
                    .as_ref()
                    .map_or(Ok(vk::SHADER_UNUSED_KHR), |e| stages.push(modules, e, kind))
            };
            let closest = stage(closest_hit, ProgramKind::ClosestHit)?;
            let any = stage(any_hit, ProgramKind::AnyHit)?;
            let isect = stage(intersection, ProgramKind::Intersection)?;
            let ty = if intersection.is_some() {
                vk::RayTracingShaderGroupTypeKHR::PROCEDURAL_HIT_GROUP
            } else {
                vk::RayTracingShaderGroupTypeKHR::TRIANGLES_HIT_GROUP
            };
            vk::RayTracingShaderGroupCreateInfoKHR::default()
                .ty(ty)
                .general_shader(vk::SHADER_UNUSED_KHR)
                .closest_hit_shader(closest)
                .any_hit_shader(any)
                .intersection_shader(isect)
        }
    };

    let interface = stages.interface.unwrap_or(Interface {
        payload_size: 8,
        attribute_size: 8,
        max_trace_depth: 1,
    });
    let stage_infos = stages.infos();
    let groups = [group];
    let interface_info = interface.create_info();
    let info = vk::RayTracingPipelineCreateInfoKHR::default()
        .flags(vk::PipelineCreateFlags::LIBRARY_KHR)
        .stages(&stage_infos)
        .groups(&groups)
        .max_pipeline_ray_recursion_depth(interface.max_trace_depth)
        .library_interface(&interface_info)
        .layout(layout);
    let library = loader
        .create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[info],
            None,
        )
        .map_err(|(_, e)| pipeline_error(e, "creating program group library"))?[0];

    match loader.get_ray_tracing_shader_group_handles(library, 0, 1, handle_size as usize) {
        Ok(handle) => Ok(VkGroup { library, handle }),
        Err(e) => {
            device.destroy_pipeline(library, None);
            Err(pipeline_error(e, "reading program group handle"))
        }
    }
}

/// Link group libraries into an executable pipeline.
///
/// # Safety
/// `loader`, `layout` and every library must be valid.
pub unsafe fn link(
    loader: &ash::khr::ray_tracing_pipeline::Device,
    layout: vk::PipelineLayout,
    libraries: &[vk::Pipeline],
    interface: Interface,
    max_trace_depth: u32,
) -> Result<vk::Pipeline> {
    let library_info = vk::PipelineLibraryCreateInfoKHR::default().libraries(libraries);
    let interface_info = interface.create_info();
    let info = vk::RayTracingPipelineCreateInfoKHR::default()
        .library_info(&library_info)
        .library_interface(&interface_info)
        .max_pipeline_ray_recursion_depth(max_trace_depth)
        .layout(layout);
    let pipelines = loader
        .create_ray_tracing_pipelines(
            vk::DeferredOperationKHR::null(),
            vk::PipelineCache::null(),
            &[info],
            None,
        )
        .map_err(|(_, e)| pipeline_error(e, "linking pipeline"))?;
    Ok(pipelines[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_is_in_bytes() {
        let options = PipelineCompileOptions {
            num_payload_values: 3,
            num_attribute_values: 2,
            max_trace_depth: 40,
            ..PipelineCompileOptions::default()
        };
        let interface = Interface::new(&options, 31);
        assert_eq!(interface.payload_size, 12);
        assert_eq!(interface.attribute_size, 8);
        assert_eq!(interface.max_trace_depth, 31);
    }

    #[test]
    fn push_constants_reach_every_stage() {
        assert!(RAY_TRACING_STAGES.contains(vk::ShaderStageFlags::RAYGEN_KHR));
        assert!(RAY_TRACING_STAGES.contains(vk::ShaderStageFlags::CALLABLE_KHR));
        assert!(!RAY_TRACING_STAGES.contains(vk::ShaderStageFlags::COMPUTE));
    }
}
