//! Headless Vulkan instance and physical device selection.

use crate::error::{GpuError, Result};
use ash::vk;
use std::ffi::{c_void, CStr, CString};

use super::GpuCapabilities;

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Create a headless Vulkan 1.3 instance.
///
/// With `enable_validation` the Khronos layer is requested when installed,
/// together with debug utils so its messages reach the log.
///
/// # Safety
/// The entry must be a valid Vulkan entry point.
pub unsafe fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
) -> Result<ash::Instance> {
    let app_name = CString::new(app_name)
        .map_err(|e| GpuError::Other(format!("Invalid application name: {e}")))?;
    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name)
        .engine_name(c"photon")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const i8> = Vec::new();
    let mut layers: Vec<*const i8> = Vec::new();
    #[allow(unused_mut)]
    let mut flags = vk::InstanceCreateFlags::empty();
    #[cfg(target_os = "macos")]
    {
        extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
        flags |= vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    }
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
        let installed = entry
            .enumerate_instance_layer_properties()?
            .iter()
            .any(|layer| layer.layer_name_as_c_str().is_ok_and(|name| name == VALIDATION_LAYER));
        if installed {
            layers.push(VALIDATION_LAYER.as_ptr());
        } else {
            tracing::warn!("Validation requested but {VALIDATION_LAYER:?} is not installed");
        }
    }

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layers)
        .flags(flags);
    Ok(entry.create_instance(&create_info, None)?)
}

/// Forward validation messages to `tracing`.
unsafe extern "system" fn debug_callback(
    severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _ty: vk::DebugUtilsMessageTypeFlagsEXT,
    data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    if data.is_null() || (*data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*data).p_message).to_string_lossy();
    if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::ERROR) {
        tracing::error!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::WARNING) {
        tracing::warn!(target: "vulkan", "{message}");
    } else if severity.contains(vk::DebugUtilsMessageSeverityFlagsEXT::INFO) {
        tracing::debug!(target: "vulkan", "{message}");
    } else {
        tracing::trace!(target: "vulkan", "{message}");
    }
    vk::FALSE
}

/// Install a debug messenger that forwards validation output to `tracing`.
///
/// # Safety
/// The instance must have been created with the debug utils extension.
pub unsafe fn create_debug_messenger(
    entry: &ash::Entry,
    instance: &ash::Instance,
) -> Result<(ash::ext::debug_utils::Instance, vk::DebugUtilsMessengerEXT)> {
    let loader = ash::ext::debug_utils::Instance::new(entry, instance);
    let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
        .message_severity(
            vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                | vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE,
        )
        .message_type(
            vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
        )
        .pfn_user_callback(Some(debug_callback));
    let messenger = loader.create_debug_utils_messenger(&create_info, None)?;
    Ok((loader, messenger))
}

/// Pick the physical device to run on.
///
/// With `preferred`, that enumeration index is used if it qualifies.
/// Otherwise the highest ranked qualifying device wins.
///
/// # Safety
/// The instance must be valid.
pub unsafe fn select_physical_device(
    instance: &ash::Instance,
    preferred: Option<usize>,
) -> Result<vk::PhysicalDevice> {
    let devices = instance.enumerate_physical_devices()?;
    let rank = |device: vk::PhysicalDevice| rank_physical_device(instance, device);

    match preferred {
        Some(index) => devices
            .get(index)
            .copied()
            .filter(|&device| rank(device).is_some())
            .ok_or(GpuError::NoSuitableDevice),
        None => devices
            .into_iter()
            .filter_map(|device| rank(device).map(|rank| (rank, device)))
            .max_by_key(|&(rank, _)| rank)
            .map(|(_, device)| device)
            .ok_or(GpuError::NoSuitableDevice),
    }
}

/// Rank a device, or `None` when it cannot run ray tracing.
///
/// Device type dominates, then device-local memory in whole GiB.
unsafe fn rank_physical_device(instance: &ash::Instance, device: vk::PhysicalDevice) -> Option<(u8, u64)> {
    let capabilities = GpuCapabilities::query(instance, device);
    if !capabilities.meets_requirements() {
        tracing::debug!("Skipping {}: no ray tracing support", capabilities.device_name);
        return None;
    }
    let kind = match instance.get_physical_device_properties(device).device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 3,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 2,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 1,
        _ => 0,
    };
    Some((kind, capabilities.device_local_bytes >> 30))
}
