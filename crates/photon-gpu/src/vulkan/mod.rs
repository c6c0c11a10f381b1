//! Vulkan device with ray tracing pipeline support.

mod capabilities;
mod command;
mod instance;
mod memory;
mod stream;

use std::any::Any;
use std::ffi::CStr;
use std::sync::Arc;

use ash::vk;
use parking_lot::Mutex;
use photon_core::DevicePtr;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use memory::VulkanAllocator;
pub use stream::VulkanStream;

use crate::device::{Allocator, Device, DeviceKind, Stream};
use crate::error::{GpuError, Result};
use instance::{create_debug_messenger, create_instance, select_physical_device};
use memory::MemoryManager;

/// Vulkan objects shared by the device, its streams and its allocations.
///
/// Everything holding device memory keeps an `Arc` to this, so the logical
/// device outlives every buffer created from it.
pub struct VulkanShared {
    // Entry must be kept alive for the lifetime of the instance
    #[allow(dead_code)]
    entry: ash::Entry,
    instance: ash::Instance,
    debug_messenger: Option<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)>,
    device: ash::Device,
    capabilities: GpuCapabilities,
    device_id: u32,
    queue_family: u32,
    queue: vk::Queue,
    pub(crate) queue_lock: Mutex<()>,
    pub(crate) memory: MemoryManager,
}

impl VulkanShared {
    /// Logical device.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Instance the device was created from.
    pub fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Limits and extensions queried at startup.
    pub fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Device ordinal used in diagnostics.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    /// Queue family all streams submit to.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// The compute queue.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Buffer and offset backing `[ptr, ptr + len)`.
    pub fn resolve(&self, ptr: DevicePtr, len: u64) -> Result<(vk::Buffer, u64)> {
        self.memory.resolve(ptr, len)
    }

    /// Block until every queue of the device is idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for VulkanShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Allocations reference the device.
            self.memory.shutdown(&self.device);

            self.device.destroy_device(None);
            if let Some((loader, messenger)) = self.debug_messenger.take() {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            self.instance.destroy_instance(None);
        }
    }
}

/// A Vulkan device usable by the ray tracing layer.
pub struct VulkanDevice {
    // Dropped before `shared`, which may be the last reference
    default_stream: VulkanStream,
    allocator: Arc<VulkanAllocator>,
    shared: Arc<VulkanShared>,
}

impl VulkanDevice {
    /// Shared Vulkan objects, for backends recording their own commands.
    pub fn shared(&self) -> &Arc<VulkanShared> {
        &self.shared
    }

    /// The default stream as its concrete type.
    pub fn vulkan_stream(&self) -> &VulkanStream {
        &self.default_stream
    }
}

impl Device for VulkanDevice {
    fn id(&self) -> u32 {
        self.shared.device_id
    }

    fn name(&self) -> &str {
        &self.shared.capabilities.device_name
    }

    fn kind(&self) -> DeviceKind {
        DeviceKind::Vulkan
    }

    fn default_allocator(&self) -> Arc<dyn Allocator> {
        self.allocator.clone()
    }

    fn default_stream(&self) -> &dyn Stream {
        &self.default_stream
    }

    fn create_stream(&self) -> Result<Box<dyn Stream>> {
        Ok(Box::new(VulkanStream::new(Arc::clone(&self.shared))?))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Configures and opens a [`VulkanDevice`].
pub struct VulkanDeviceBuilder {
    app_name: String,
    enable_validation: bool,
    device_index: Option<usize>,
}

impl Default for VulkanDeviceBuilder {
    fn default() -> Self {
        Self {
            app_name: "photon".to_string(),
            enable_validation: cfg!(debug_assertions),
            device_index: None,
        }
    }
}

impl VulkanDeviceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Application name reported to the driver.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Request the Khronos validation layer. Defaults to on in debug builds.
    pub fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Use the physical device at this enumeration index instead of the
    /// best scoring one.
    pub fn device_index(mut self, index: usize) -> Self {
        self.device_index = Some(index);
        self
    }

    /// Open the device with one compute queue and its default stream.
    pub fn build(self) -> Result<Arc<VulkanDevice>> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| GpuError::Other(format!("Failed to load Vulkan: {e}")))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let debug_messenger = if self.enable_validation {
            match unsafe { create_debug_messenger(&entry, &instance) } {
                Ok(messenger) => Some(messenger),
                Err(e) => {
                    tracing::warn!("Debug messenger unavailable: {e}");
                    None
                }
            }
        } else {
            None
        };

        let destroy_instance = |debug_messenger: Option<(
            ash::ext::debug_utils::Instance,
            vk::DebugUtilsMessengerEXT,
        )>| unsafe {
            if let Some((loader, messenger)) = debug_messenger {
                loader.destroy_debug_utils_messenger(messenger, None);
            }
            instance.destroy_instance(None);
        };

        let physical_device = match unsafe { select_physical_device(&instance, self.device_index) } {
            Ok(device) => device,
            Err(e) => {
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };

        let capabilities = unsafe { GpuCapabilities::query(&instance, physical_device) };
tracing::info!("Opening {} as device {}", capabilities.summary(), self.device_index.unwrap_or(0));

        let device_id = self.device_index.unwrap_or(0) as u32;
        let created = unsafe { find_compute_queue_family(&instance, physical_device) }
            .and_then(|family| unsafe {
                create_device(&instance, physical_device, family).map(|(d, q)| (family, d, q))
            });
        let (queue_family, device, queue) = match created {
            Ok(created) => created,
            Err(e) => {
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };

        let memory = match unsafe { MemoryManager::new(&instance, &device, physical_device) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                destroy_instance(debug_messenger);
                return Err(e);
            }
        };

        let shared = Arc::new(VulkanShared {
            entry,
            instance,
            debug_messenger,
            device,
            capabilities,
            device_id,
            queue_family,
            queue,
            queue_lock: Mutex::new(()),
            memory,
        });

        Ok(Arc::new(VulkanDevice {
            default_stream: VulkanStream::new(Arc::clone(&shared))?,
            allocator: Arc::new(VulkanAllocator::new(Arc::clone(&shared))),
            shared,
        }))
    }
}

/// Find a queue family supporting compute.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_compute_queue_family(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<u32> {
    instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .position(|family| family.queue_flags.contains(vk::QueueFlags::COMPUTE))
        .map(|i| i as u32)
        .ok_or(GpuError::NoSuitableDevice)
}

/// Device extensions acceleration structures and linked pipelines need.
const DEVICE_EXTENSIONS: [&CStr; 5] = [
        ash::khr::acceleration_structure::NAME,
        ash::khr::ray_tracing_pipeline::NAME,
        ash::khr::deferred_host_operations::NAME,
        ash::khr::pipeline_library::NAME,
        ash::ext::pipeline_library_group_handles::NAME,
];

/// Create the logical device and retrieve the compute queue.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_family: u32,
) -> Result<(ash::Device, vk::Queue)> {
    let priorities = [1.0_f32];
    let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
        .queue_family_index(queue_family)
        .queue_priorities(&priorities)];

    let extension_names = DEVICE_EXTENSIONS.map(CStr::as_ptr);

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .scalar_block_layout(true);

    let mut acceleration_structure_features =
        vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default().acceleration_structure(true);
    let mut ray_tracing_features =
        vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default().ray_tracing_pipeline(true);
    let mut group_handle_features =
        vk::PhysicalDevicePipelineLibraryGroupHandlesFeaturesEXT::default()
            .pipeline_library_group_handles(true);

    let features = vk::PhysicalDeviceFeatures::default().shader_int64(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut acceleration_structure_features)
        .push_next(&mut ray_tracing_features)
        .push_next(&mut group_handle_features);

    let create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &create_info, None)
        .map_err(GpuError::from)?;

    let queue = device.get_device_queue(queue_family, 0);

    Ok((device, queue))
}
