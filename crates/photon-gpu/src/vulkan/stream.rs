//! In-order command stream for the Vulkan device.
//!
//! Operations are recorded into one primary command buffer with a full
//! memory barrier between consecutive operations. [`Stream::sync`] submits
//! the pending commands and waits on a fence.

use std::any::Any;
use std::sync::{Arc, Weak};

use ash::vk;
use gpu_allocator::MemoryLocation;
use parking_lot::Mutex;
use photon_core::DevicePtr;

use super::command::{stream_barrier, submit_command_buffer, CommandPool};
use super::memory::StagingBuffer;
use super::VulkanShared;
use crate::device::{ReleaseQueue, Stream};
use crate::error::{GpuError, Result};

/// Fence signalled when a submitted batch retires.
struct RetireFence(vk::Fence);

impl RetireFence {
    unsafe fn new(device: &ash::Device) -> Result<Self> {
        let fence = device.create_fence(&vk::FenceCreateInfo::default(), None)?;
        Ok(Self(fence))
    }

    /// Block until the batch retires, leaving the fence ready for the next one.
    unsafe fn retire(&self, device: &ash::Device) -> Result<()> {
        device.wait_for_fences(&[self.0], true, u64::MAX)?;
        device.reset_fences(&[self.0])?;
        Ok(())
    }
}

/// Commands recorded since the last submit.
#[derive(Default)]
struct PendingWork {
    cmd: Option<vk::CommandBuffer>,
    keep_alive: Vec<Box<dyn Any + Send>>,
}

/// In-order stream over the device's compute queue.
pub struct VulkanStream {
    shared: Arc<VulkanShared>,
    pool: CommandPool,
    fence: RetireFence,
    pending: Arc<Mutex<PendingWork>>,
}

impl VulkanStream {
    /// Create a stream on the device's compute queue.
    pub fn new(shared: Arc<VulkanShared>) -> Result<Self> {
        let device = shared.device();
        let pool = unsafe {
            CommandPool::new(
                device,
                shared.queue_family(),
                vk::CommandPoolCreateFlags::TRANSIENT,
            )?
        };
        let fence = match unsafe { RetireFence::new(device) } {
            Ok(fence) => fence,
            Err(e) => {
                unsafe { pool.destroy(device) };
                return Err(e);
            }
        };
        Ok(Self {
            shared,
            pool,
            fence,
            pending: Arc::new(Mutex::new(PendingWork::default())),
        })
    }

    /// Device this stream submits to.
    pub fn shared(&self) -> &Arc<VulkanShared> {
        &self.shared
    }

    /// Record commands after all previously recorded work.
    ///
    /// # Safety
    /// Commands recorded by `f` must only reference resources that stay
    /// alive until the next sync (see [`Stream::defer_release`]).
    pub unsafe fn record<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = self.shared.device();
        let mut pending = self.pending.lock();
        let cmd = match pending.cmd {
            Some(cmd) => {
                stream_barrier(device, cmd);
                cmd
            }
            None => {
                let cmd = self.pool.begin_one_time(device)?;
                pending.cmd = Some(cmd);
                cmd
            }
        };
        f(device, cmd)
    }

    /// Submit pending work and wait for it.
    fn flush(&self) -> Result<()> {
        let device = self.shared.device();
        let mut pending = self.pending.lock();
        let Some(cmd) = pending.cmd.take() else {
            let released = std::mem::take(&mut pending.keep_alive);
            drop(pending);
            drop(released);
            return Ok(());
        };
        let result = unsafe {
            device
                .end_command_buffer(cmd)
                .map_err(GpuError::from)
                .and_then(|()| {
                    let _queue = self.shared.queue_lock.lock();
                    submit_command_buffer(device, self.shared.queue(), cmd, self.fence.0)
                })
                .and_then(|()| self.fence.retire(device))
        };
        unsafe { self.pool.free(device, cmd) };
        // Released resources may touch the device; drop them unlocked.
        let released = std::mem::take(&mut pending.keep_alive);
        drop(pending);
        drop(released);
        result.map_err(|e| match e {
            GpuError::Vulkan(vk::Result::ERROR_DEVICE_LOST) => {
                GpuError::DeviceFault("device lost".to_string())
            }
            other => other,
        })
    }
}

impl Stream for VulkanStream {
    fn device_id(&self) -> u32 {
        self.shared.device_id()
    }

    fn upload(&self, dst: DevicePtr, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let len = data.len() as u64;
        let (dst_buffer, dst_offset) = self.shared.resolve(dst, len)?;
        let staging = StagingBuffer::new(&self.shared, len, MemoryLocation::CpuToGpu)?;
        staging.write(data)?;
        let src_buffer = staging.buffer();
        unsafe {
            self.record(|device, cmd| {
                let region = vk::BufferCopy::default()
                    .src_offset(0)
                    .dst_offset(dst_offset)
                    .size(len);
                device.cmd_copy_buffer(cmd, src_buffer, dst_buffer, &[region]);
                Ok(())
            })?;
        }
        self.defer_release(Box::new(staging));
        Ok(())
    }

    fn memset(&self, dst: DevicePtr, value: u8, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let (buffer, offset) = self.shared.resolve(dst, size)?;
        // vkCmdFillBuffer writes whole words at word offsets
        if offset % 4 != 0 || size % 4 != 0 {
            let len = usize::try_from(size)
                .map_err(|_| GpuError::InvalidState(format!("memset of {size} bytes")))?;
            return self.upload(dst, &vec![value; len]);
        }
        let word = u32::from_ne_bytes([value; 4]);
        unsafe {
            self.record(|device, cmd| {
                device.cmd_fill_buffer(cmd, buffer, offset, size, word);
                Ok(())
            })
        }
    }

    fn copy(&self, dst: DevicePtr, src: DevicePtr, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let (src_buffer, src_offset) = self.shared.resolve(src, size)?;
        let (dst_buffer, dst_offset) = self.shared.resolve(dst, size)?;
        unsafe {
            self.record(|device, cmd| {
                let region = vk::BufferCopy::default()
                    .src_offset(src_offset)
                    .dst_offset(dst_offset)
                    .size(size);
                device.cmd_copy_buffer(cmd, src_buffer, dst_buffer, &[region]);
                Ok(())
            })
        }
    }

    fn download(&self, src: DevicePtr, dst: &mut [u8]) -> Result<()> {
        if dst.is_empty() {
            return self.sync();
        }
        let len = dst.len() as u64;
        let (src_buffer, src_offset) = self.shared.resolve(src, len)?;
        let staging = StagingBuffer::new(&self.shared, len, MemoryLocation::GpuToCpu)?;
        let dst_buffer = staging.buffer();
        unsafe {
            self.record(|device, cmd| {
                let region = vk::BufferCopy::default()
                    .src_offset(src_offset)
                    .dst_offset(0)
                    .size(len);
                device.cmd_copy_buffer(cmd, src_buffer, dst_buffer, &[region]);
                Ok(())
            })?;
        }
        self.flush()?;
        staging.read(dst)
    }

    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    fn sync(&self) -> Result<()> {
        self.flush()
    }

    fn defer_release(&self, resource: Box<dyn Any + Send>) {
        self.pending.lock().keep_alive.push(resource);
    }

    fn release_queue(&self) -> ReleaseQueue {
        let pending: Weak<Mutex<PendingWork>> = Arc::downgrade(&self.pending);
        ReleaseQueue::new(move |resource| {
            let Some(shared) = pending.upgrade() else {
                return;
            };
            let mut work = shared.lock();
            // Nothing recorded since the last flush means nothing in flight.
            if work.cmd.is_some() {
                work.keep_alive.push(resource);
            } else {
                drop(work);
                drop(resource);
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

impl Drop for VulkanStream {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            tracing::error!("Failed to flush stream on drop: {e}");
        }
        let device = self.shared.device();
        unsafe {
            device.destroy_fence(self.fence.0, None);
            self.pool.destroy(device);
        }
    }
}
