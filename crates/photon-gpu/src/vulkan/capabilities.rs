//! Physical device capabilities relevant to streams and ray tracing.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// PCI vendor of a physical device, as far as log output cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Other(u32),
}

impl From<u32> for GpuVendor {
    fn from(pci_id: u32) -> Self {
        match pci_id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            other => Self::Other(other),
        }
    }
}

/// Ray tracing limits and extension support.
#[derive(Debug, Clone, Default)]
pub struct RayTracingCapabilities {
    /// VK_KHR_acceleration_structure
    pub supports_acceleration_structure: bool,
    /// VK_KHR_ray_tracing_pipeline
    pub supports_ray_tracing_pipeline: bool,
    /// VK_KHR_pipeline_library
    pub supports_pipeline_library: bool,
    /// VK_EXT_pipeline_library_group_handles
    pub supports_library_group_handles: bool,

    /// Size of a shader group handle in bytes
    pub shader_group_handle_size: u32,
    /// Required alignment of records in the binding table
    pub shader_group_handle_alignment: u32,
    /// Required alignment of each binding table region
    pub shader_group_base_alignment: u32,
    /// Maximum trace recursion depth
    pub max_ray_recursion_depth: u32,
    /// Maximum invocations of one dispatch
    pub max_ray_dispatch_invocation_count: u32,

    /// Maximum geometries in one bottom-level structure
    pub max_geometry_count: u64,
    /// Maximum instances in one top-level structure
    pub max_instance_count: u64,
    /// Maximum primitives in one bottom-level structure
    pub max_primitive_count: u64,
    /// Alignment of build scratch memory
    pub min_scratch_offset_alignment: u32,
}

impl RayTracingCapabilities {
    /// Whether everything the ray tracing layer needs is present.
    pub fn is_supported(&self) -> bool {
        self.supports_acceleration_structure
            && self.supports_ray_tracing_pipeline
            && self.supports_pipeline_library
            && self.supports_library_group_handles
    }
}

/// What a physical device offers the stream and ray tracing layers.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    pub vendor: GpuVendor,
    pub device_name: String,
    pub api_version: u32,
    /// Every acceleration structure input and launch parameter is a
    /// buffer device address.
    pub buffer_device_address: bool,
    /// Sum of all device-local heaps.
    pub device_local_bytes: u64,
    pub ray_tracing: RayTracingCapabilities,
}

fn device_extensions(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> HashSet<String> {
    // A device whose extensions cannot be listed simply offers none.
    let Ok(properties) = (unsafe { instance.enumerate_device_extension_properties(physical_device) })
    else {
        return HashSet::new();
    };
    properties
        .iter()
        .filter_map(|ext| ext.extension_name_as_c_str().ok())
        .filter_map(|name| name.to_str().ok().map(str::to_owned))
        .collect()
}

unsafe fn ray_tracing_limits(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    rt: &mut RayTracingCapabilities,
) {
    let mut pipeline = vk::PhysicalDeviceRayTracingPipelinePropertiesKHR::default();
    let mut accel = vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
    let mut props2 = vk::PhysicalDeviceProperties2::default()
        .push_next(&mut pipeline)
        .push_next(&mut accel);
    instance.get_physical_device_properties2(physical_device, &mut props2);

    rt.shader_group_handle_size = pipeline.shader_group_handle_size;
    rt.shader_group_handle_alignment = pipeline.shader_group_handle_alignment;
    rt.shader_group_base_alignment = pipeline.shader_group_base_alignment;
    rt.max_ray_recursion_depth = pipeline.max_ray_recursion_depth;
    rt.max_ray_dispatch_invocation_count = pipeline.max_ray_dispatch_invocation_count;
    rt.max_geometry_count = accel.max_geometry_count;
    rt.max_instance_count = accel.max_instance_count;
    rt.max_primitive_count = accel.max_primitive_count;
    rt.min_scratch_offset_alignment = accel.min_acceleration_structure_scratch_offset_alignment;
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let properties = instance.get_physical_device_properties(physical_device);
        let memory = instance.get_physical_device_memory_properties(physical_device);
        let extensions = device_extensions(instance, physical_device);
        let has = |name: &CStr| name.to_str().is_ok_and(|name| extensions.contains(name));

        let mut ray_tracing = RayTracingCapabilities {
            supports_acceleration_structure: has(ash::khr::acceleration_structure::NAME),
            supports_ray_tracing_pipeline: has(ash::khr::ray_tracing_pipeline::NAME),
            supports_pipeline_library: has(ash::khr::pipeline_library::NAME),
            supports_library_group_handles: has(ash::ext::pipeline_library_group_handles::NAME),
            ..Default::default()
        };
        if ray_tracing.supports_ray_tracing_pipeline && ray_tracing.supports_acceleration_structure {
            ray_tracing_limits(instance, physical_device, &mut ray_tracing);
        }

        let heaps = &memory.memory_heaps[..memory.memory_heap_count as usize];
        let api_version = properties.api_version;
        Self {
            vendor: GpuVendor::from(properties.vendor_id),
            device_name: properties
                .device_name_as_c_str()
                .map_or_else(|_| String::from("<unnamed>"), |n| n.to_string_lossy().into_owned()),
            api_version,
            buffer_device_address: is_vulkan_1_3(api_version)
                || has(ash::khr::buffer_device_address::NAME),
            device_local_bytes: heaps
                .iter()
                .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
                .map(|heap| heap.size)
                .sum(),
            ray_tracing,
        }
    }

    /// Vulkan 1.3, buffer device addresses and the full ray tracing set.
    pub fn meets_requirements(&self) -> bool {
        is_vulkan_1_3(self.api_version) && self.buffer_device_address && self.ray_tracing.is_supported()
    }

    /// One-line description for logs.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM - RT handles {}B",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_bytes >> 20,
            self.ray_tracing.shader_group_handle_size,
        )
    }
}

fn is_vulkan_1_3(api_version: u32) -> bool {
    vk::api_version_major(api_version) > 1
        || (vk::api_version_major(api_version) == 1 && vk::api_version_minor(api_version) >= 3)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_from_pci_id() {
        assert_eq!(GpuVendor::from(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn version_gate() {
        assert!(is_vulkan_1_3(vk::make_api_version(0, 1, 3, 0)));
        assert!(!is_vulkan_1_3(vk::make_api_version(0, 1, 2, 200)));
        assert!(is_vulkan_1_3(vk::make_api_version(0, 2, 0, 0)));
    }

    #[test]
    fn ray_tracing_needs_every_extension() {
        let mut caps = RayTracingCapabilities {
            supports_acceleration_structure: true,
            supports_ray_tracing_pipeline: true,
            supports_pipeline_library: true,
            ..Default::default()
        };
        assert!(!caps.is_supported());
        caps.supports_library_group_handles = true;
        assert!(caps.is_supported());
    }
}
