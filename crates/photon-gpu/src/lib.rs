//! Device substrate for the photon ray tracing layer.
//!
//! This crate provides:
//! - The [`Device`], [`Allocator`] and [`Stream`] abstractions the ray
//!   tracing layer is written against
//! - RAII device buffers addressed by [`DevicePtr`]
//! - A host device that emulates device memory and in-order streams
//! - A Vulkan device (instance, capabilities, gpu-allocator memory, command
//!   streams)

pub mod buffer;
pub mod device;
pub mod error;
pub mod host;
pub mod vulkan;

pub use buffer::{BufferView, DeviceArray, DeviceBuffer};
pub use device::{Allocator, Device, DeviceKind, MemoryBlock, ReleaseQueue, Stream, StreamExt};
pub use error::{GpuError, Result};
pub use host::{HostAllocator, HostDevice, HostDeviceBuilder, HostMemory, HostStream};
pub use photon_core::DevicePtr;
pub use vulkan::{
    GpuCapabilities, GpuVendor, RayTracingCapabilities, VulkanAllocator, VulkanDevice,
    VulkanDeviceBuilder, VulkanShared, VulkanStream,
};
