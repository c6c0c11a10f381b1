//! Per-device ray tracing context.

use std::fmt;
use std::sync::Arc;

use photon_gpu::{Device, DeviceKind, HostDevice, VulkanDevice};

use crate::accel::{AccelKind, AccelStruct};
use crate::backend::{
    ModuleCompileOptions, ModuleSource, PipelineCompileOptions, PipelineLinkOptions, RtBackend,
};
use crate::error::{Result, RtError};
use crate::host::HostBackend;
use crate::module::{Module, Program};
use crate::pipeline::Pipeline;
use crate::vulkan::VulkanBackend;

/// Environment variable forcing validation mode on.
pub const VALIDATION_ENV: &str = "PHOTON_VALIDATION";

/// Options applied when creating a context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextOptions {
    /// Backend message verbosity: 0 silent, 1 fatal, 2 error, 3 warning,
    /// 4 everything.
    pub log_level: u32,
    /// Check launches and builds for misuse before enqueueing them.
    pub validation: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            log_level: 3,
            validation: cfg!(debug_assertions),
        }
    }
}

impl ContextOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the backend message verbosity (clamped to 0..=4).
    #[must_use]
    pub fn log_level(mut self, level: u32) -> Self {
        self.log_level = level.min(4);
        self
    }

    /// Enable or disable validation mode.
    #[must_use]
    pub fn validation(mut self, enable: bool) -> Self {
        self.validation = enable;
        self
    }
}

/// Severity of a backend message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Fatal = 1,
    Error = 2,
    Warning = 3,
    Print = 4,
}

/// Limits of a ray tracing device.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceProperties {
    pub rtcore_version: u32,
    pub max_trace_depth: u32,
    pub max_traversable_graph_depth: u32,
    pub max_primitives_per_gas: u32,
    pub max_instances_per_ias: u32,
    pub max_instance_id: u32,
    pub max_sbt_records_per_gas: u32,
    pub max_sbt_offset: u32,
    pub num_bits_instance_visibility_mask: u32,
    pub shader_group_handle_size: u32,
}

struct ContextInner {
    backend: Arc<dyn RtBackend>,
    device_name: String,
    options: ContextOptions,
    properties: DeviceProperties,
}

/// Connection to one device's ray tracing backend.
///
/// Cloning is cheap; every clone refers to the same context. Modules,
/// pipelines and acceleration structures keep their context alive.
#[derive(Clone)]
pub struct DeviceContext {
    inner: Arc<ContextInner>,
}

impl DeviceContext {
    /// Create a context for `device` with default options.
    pub fn create(device: &dyn Device) -> Result<Self> {
        Self::with_options(device, ContextOptions::default())
    }

    /// Create a context for `device`.
    pub fn with_options(device: &dyn Device, mut options: ContextOptions) -> Result<Self> {
        if validation_forced() {
            options.validation = true;
        }
        let backend: Arc<dyn RtBackend> = match device.kind() {
            DeviceKind::Host => {
                let host = device
                    .as_any()
                    .downcast_ref::<HostDevice>()
                    .ok_or_else(|| RtError::invalid_value("device is not a host device"))?;
                Arc::new(HostBackend::new(host))
            }
            DeviceKind::Vulkan => {
                let vulkan = device
                    .as_any()
                    .downcast_ref::<VulkanDevice>()
                    .ok_or_else(|| RtError::invalid_value("device is not a Vulkan device"))?;
                let backend = VulkanBackend::new(vulkan)
                    .map_err(|e| e.context(device.id(), "create_context"))?;
                Arc::new(backend)
            }
        };
        Ok(Self::from_backend(backend, device.name(), options))
    }

    /// Create a context over an existing backend.
    pub fn from_backend(
        backend: Arc<dyn RtBackend>,
        device_name: &str,
        options: ContextOptions,
    ) -> Self {
        let properties = backend.properties();
        tracing::info!(
            "Created {} ray tracing context on device {} ({device_name})",
            backend.name(),
            backend.device_id()
        );
        tracing::debug!("Device properties: {properties:?}");
        Self {
            inner: Arc::new(ContextInner {
                backend,
                device_name: device_name.to_string(),
                options,
                properties,
            }),
        }
    }

    /// Device ordinal used in diagnostics.
    pub fn device_id(&self) -> u32 {
        self.inner.backend.device_id()
    }

    /// Name of the device.
    pub fn device_name(&self) -> &str {
        &self.inner.device_name
    }

    /// Options the context was created with.
    pub fn options(&self) -> &ContextOptions {
        &self.inner.options
    }

    /// Limits of the device.
    pub fn properties(&self) -> &DeviceProperties {
        &self.inner.properties
    }

    /// The native backend.
    pub fn backend(&self) -> &Arc<dyn RtBackend> {
        &self.inner.backend
    }

    /// Whether both handles refer to the same context.
    pub fn same_as(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Emit a backend message if the context's log level admits it.
    pub fn log(&self, level: LogLevel, message: &str) {
        if (level as u32) > self.inner.options.log_level {
            return;
        }
        let device = self.device_id();
        match level {
            LogLevel::Fatal | LogLevel::Error => tracing::error!("[device {device}] {message}"),
            LogLevel::Warning => tracing::warn!("[device {device}] {message}"),
            LogLevel::Print => tracing::info!("[device {device}] {message}"),
        }
    }

    /// Create a module from compiled device code.
    pub fn create_module(
        &self,
        source: ModuleSource,
        module_options: &ModuleCompileOptions,
        pipeline_options: &PipelineCompileOptions,
    ) -> Result<Module> {
        Module::new(self, &source, module_options, pipeline_options)
    }

    /// Link programs into a pipeline.
    pub fn create_pipeline(
        &self,
        programs: &[Program],
        compile_options: &PipelineCompileOptions,
        link_options: &PipelineLinkOptions,
    ) -> Result<Pipeline> {
        Pipeline::new(self, programs, compile_options, link_options)
    }

    /// Create an empty triangle structure.
    pub fn create_accel_struct_triangle(&self) -> AccelStruct {
        AccelStruct::new(self, AccelKind::Triangle)
    }

    /// Create an empty custom-primitive structure.
    pub fn create_accel_struct_aabb(&self) -> AccelStruct {
        AccelStruct::new(self, AccelKind::Aabb)
    }

    /// Create an empty curve structure.
    pub fn create_accel_struct_curve(&self) -> AccelStruct {
        AccelStruct::new(self, AccelKind::Curve)
    }

    /// Create an empty sphere structure.
    pub fn create_accel_struct_sphere(&self) -> AccelStruct {
        AccelStruct::new(self, AccelKind::Sphere)
    }

    /// Create an empty instance structure.
    pub fn create_inst_accel_struct(&self) -> AccelStruct {
        AccelStruct::new(self, AccelKind::Instance)
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("backend", &self.inner.backend.name())
            .field("device_id", &self.device_id())
            .field("device_name", &self.inner.device_name)
            .finish()
    }
}

fn validation_forced() -> bool {
    std::env::var(VALIDATION_ENV).is_ok_and(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use photon_gpu::HostDeviceBuilder;

    #[test]
    fn host_context_reports_properties() {
        let device = HostDeviceBuilder::new().id(2).build().unwrap();
        let context = DeviceContext::create(device.as_ref()).unwrap();
        assert_eq!(context.device_id(), 2);
        assert_eq!(context.backend().name(), "host");
        assert!(context.properties().max_trace_depth >= 1);
        assert_eq!(context.properties().num_bits_instance_visibility_mask, 8);
    }

    #[test]
    fn clones_share_identity() {
        let device = HostDeviceBuilder::new().build().unwrap();
        let a = DeviceContext::create(device.as_ref()).unwrap();
        let b = a.clone();
        let c = DeviceContext::create(device.as_ref()).unwrap();
        assert!(a.same_as(&b));
        assert!(!a.same_as(&c));
    }

    #[test]
    fn log_level_is_clamped() {
        let options = ContextOptions::new().log_level(9).validation(true);
        assert_eq!(options.log_level, 4);
        assert!(options.validation);
    }
}
