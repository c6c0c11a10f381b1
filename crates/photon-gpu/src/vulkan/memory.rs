//! GPU memory management.
//!
//! Every device allocation is its own `VkBuffer` created with the full set
//! of usages the ray tracing layer needs, so any [`DevicePtr`] can be fed to
//! acceleration structure builds, binding tables or launch parameters. A
//! registry maps buffer device addresses back to their `VkBuffer` for
//! copies and acceleration structure creation.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::{
    Allocation, AllocationCreateDesc, AllocationScheme, Allocator as RawAllocator,
    AllocatorCreateDesc,
};
use gpu_allocator::MemoryLocation;
use parking_lot::{Mutex, RwLock};
use photon_core::DevicePtr;

use super::VulkanShared;
use crate::device::{Allocator, MemoryBlock};
use crate::error::{GpuError, Result};

/// Usage flags of every device allocation.
fn device_buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
        | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR
        | vk::BufferUsageFlags::SHADER_BINDING_TABLE_KHR
}

/// A registered device buffer.
struct RegisteredBuffer {
    buffer: vk::Buffer,
    allocation: Allocation,
    size: u64,
}

/// Allocator state owned by the device.
pub(crate) struct MemoryManager {
    allocator: Mutex<Option<RawAllocator>>,
    buffers: RwLock<BTreeMap<u64, RegisteredBuffer>>,
}

impl MemoryManager {
    /// Create the gpu-allocator instance.
    ///
    /// # Safety
    /// The instance, device, and physical device must be valid.
    pub(crate) unsafe fn new(
        instance: &ash::Instance,
        device: &ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator = RawAllocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: gpu_allocator::AllocatorDebugSettings {
                log_memory_information: cfg!(debug_assertions),
                log_leaks_on_shutdown: true,
                store_stack_traces: false,
                log_allocations: false,
                log_frees: false,
                log_stack_traces: false,
            },
            buffer_device_address: true,
            allocation_sizes: Default::default(),
        })
        .map_err(|e| GpuError::AllocationFailed(e.to_string()))?;

        Ok(Self {
            allocator: Mutex::new(Some(allocator)),
            buffers: RwLock::new(BTreeMap::new()),
        })
    }

    /// Create a buffer bound to fresh memory.
    pub(crate) fn create_buffer(
        &self,
        device: &ash::Device,
        size: u64,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: &str,
    ) -> Result<(vk::Buffer, Allocation)> {
        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None)? };
        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let allocation = self
            .allocator
            .lock()
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("Allocator not initialized".to_string()))
            .and_then(|allocator| {
                allocator
                    .allocate(&AllocationCreateDesc {
                        name,
                        requirements,
                        location,
                        linear: true,
                        allocation_scheme: AllocationScheme::GpuAllocatorManaged,
                    })
                    .map_err(|e| GpuError::AllocationFailed(e.to_string()))
            });
        let allocation = match allocation {
            Ok(allocation) => allocation,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        if let Err(e) =
            unsafe { device.bind_buffer_memory(buffer, allocation.memory(), allocation.offset()) }
        {
            self.destroy_buffer(device, buffer, allocation);
            return Err(e.into());
        }

        Ok((buffer, allocation))
    }

    /// Destroy a buffer and return its memory.
    pub(crate) fn destroy_buffer(&self, device: &ash::Device, buffer: vk::Buffer, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                tracing::error!("Failed to free allocation: {e}");
            }
        }
        unsafe { device.destroy_buffer(buffer, None) };
    }

    /// Allocate a registered device-local buffer.
    fn allocate_device(&self, device: &ash::Device, size: u64, name: &str) -> Result<MemoryBlock> {
        let (buffer, allocation) =
            self.create_buffer(device, size, device_buffer_usage(), MemoryLocation::GpuOnly, name)?;
        let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
        let address = unsafe { device.get_buffer_device_address(&info) };
        self.buffers.write().insert(
            address,
            RegisteredBuffer {
                buffer,
                allocation,
                size,
            },
        );
        Ok(MemoryBlock {
            ptr: DevicePtr(address),
            size,
        })
    }

    /// Free a registered buffer by its base address.
    fn free_device(&self, device: &ash::Device, block: MemoryBlock) -> Result<()> {
        let entry = self
            .buffers
            .write()
            .remove(&block.ptr.addr())
            .ok_or(GpuError::InvalidAddress {
                address: block.ptr.addr(),
                len: block.size,
            })?;
        self.destroy_buffer(device, entry.buffer, entry.allocation);
        Ok(())
    }

    /// Map `[ptr, ptr + len)` to the buffer containing it and the offset
    /// within that buffer.
    pub(crate) fn resolve(&self, ptr: DevicePtr, len: u64) -> Result<(vk::Buffer, u64)> {
        let buffers = self.buffers.read();
        let (base, entry) = buffers
            .range(..=ptr.addr())
            .next_back()
            .ok_or(GpuError::InvalidAddress {
                address: ptr.addr(),
                len,
            })?;
        let offset = ptr.addr() - base;
        if offset + len > entry.size {
            return Err(GpuError::InvalidAddress {
                address: ptr.addr(),
                len,
            });
        }
        Ok((entry.buffer, offset))
    }

    /// Destroy every remaining buffer and the allocator itself.
    ///
    /// Must run before the device is destroyed.
    pub(crate) fn shutdown(&self, device: &ash::Device) {
        let leaked = std::mem::take(&mut *self.buffers.write());
        if !leaked.is_empty() {
            tracing::warn!("{} device buffers still alive at shutdown", leaked.len());
        }
        for entry in leaked.into_values() {
            self.destroy_buffer(device, entry.buffer, entry.allocation);
        }
        // Dropping the allocator frees all VkDeviceMemory blocks
        self.allocator.lock().take();
    }
}

/// Host-visible buffer used to stage uploads and downloads.
pub struct StagingBuffer {
    shared: Arc<VulkanShared>,
    buffer: vk::Buffer,
    allocation: Option<Allocation>,
    size: u64,
}

impl StagingBuffer {
    /// Create a staging buffer (`CpuToGpu` for uploads, `GpuToCpu` for
    /// downloads).
    pub fn new(shared: &Arc<VulkanShared>, size: u64, location: MemoryLocation) -> Result<Self> {
        let usage = vk::BufferUsageFlags::TRANSFER_SRC | vk::BufferUsageFlags::TRANSFER_DST;
        let (buffer, allocation) =
            shared
                .memory
                .create_buffer(shared.device(), size, usage, location, "staging")?;
        Ok(Self {
            shared: Arc::clone(shared),
            buffer,
            allocation: Some(allocation),
            size,
        })
    }

    /// Raw buffer handle.
    pub fn buffer(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn mapped(&self) -> Result<*mut u8> {
        self.allocation
            .as_ref()
            .and_then(Allocation::mapped_ptr)
            .map(|p| p.as_ptr().cast::<u8>())
            .ok_or_else(|| GpuError::InvalidState("Staging buffer not mapped".to_string()))
    }

    /// Write bytes at the start of the buffer.
    pub fn write(&self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.size {
            return Err(GpuError::InvalidState("Data too large for buffer".to_string()));
        }
        let ptr = self.mapped()?;
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), ptr, data.len());
        }
        Ok(())
    }

    /// Read bytes from the start of the buffer.
    pub fn read(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() as u64 > self.size {
            return Err(GpuError::InvalidState("Read past end of buffer".to_string()));
        }
        let ptr = self.mapped()?;
        unsafe {
            std::ptr::copy_nonoverlapping(ptr, dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }
}

impl Drop for StagingBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            self.shared
                .memory
                .destroy_buffer(self.shared.device(), self.buffer, allocation);
        }
    }
}

/// [`Allocator`] handing out registered device-local buffers.
#[derive(Clone)]
pub struct VulkanAllocator {
    shared: Arc<VulkanShared>,
}

impl VulkanAllocator {
    /// Allocator for the device behind `shared`.
    pub fn new(shared: Arc<VulkanShared>) -> Self {
        Self { shared }
    }
}

impl Allocator for VulkanAllocator {
    fn device_id(&self) -> u32 {
        self.shared.device_id()
    }

    fn allocate(&self, size: u64, name: &str) -> Result<MemoryBlock> {
        self.shared
            .memory
            .allocate_device(self.shared.device(), size, name)
    }

    fn free(&self, block: MemoryBlock) -> Result<()> {
        self.shared.memory.free_device(self.shared.device(), block)
    }
}
