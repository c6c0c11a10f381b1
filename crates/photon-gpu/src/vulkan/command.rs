//! Transient command buffers for stream recording.

use crate::error::{GpuError, Result};
use ash::vk;

/// Pool handing out one-shot primary command buffers on a single queue
/// family. Externally synchronized by the owning stream.
pub struct CommandPool {
    pool: vk::CommandPool,
}

impl CommandPool {
    /// # Safety
    /// `queue_family` must be a family of `device`.
    pub unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(flags);
        Ok(Self {
            pool: device.create_command_pool(&info, None)?,
        })
    }

    /// A fresh command buffer already in the recording state.
    ///
    /// # Safety
    /// `device` must own this pool.
    pub unsafe fn begin_one_time(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        let info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let [cmd] = device.allocate_command_buffers(&info)?[..] else {
            return Err(GpuError::Vulkan(vk::Result::ERROR_OUT_OF_HOST_MEMORY));
        };

        let begin = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(cmd, &begin).map_err(|e| {
            self.free(device, cmd);
            GpuError::from(e)
        })?;
        Ok(cmd)
    }

    /// # Safety
    /// `cmd` must come from this pool and not be pending execution.
    pub unsafe fn free(&self, device: &ash::Device, cmd: vk::CommandBuffer) {
        device.free_command_buffers(self.pool, &[cmd]);
    }

    /// # Safety
    /// No buffer from this pool may be pending execution.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Order every command after this point behind every earlier write.
///
/// # Safety
/// `cmd` must be recording.
pub unsafe fn stream_barrier(device: &ash::Device, cmd: vk::CommandBuffer) {
    let barriers = [vk::MemoryBarrier2::default()
        .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .src_access_mask(vk::AccessFlags2::MEMORY_WRITE)
        .dst_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
        .dst_access_mask(vk::AccessFlags2::MEMORY_READ | vk::AccessFlags2::MEMORY_WRITE)];
    device.cmd_pipeline_barrier2(cmd, &vk::DependencyInfo::default().memory_barriers(&barriers));
}

/// Queue `cmd` for execution; `fence` signals once it retires.
///
/// # Safety
/// The caller holds the queue lock and `cmd` has ended recording.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub unsafe fn submit_command_buffer(
    device: &ash::Device,
    queue: vk::Queue,
    cmd: vk::CommandBuffer,
    fence: vk::Fence,
) -> Result<()> {
    let cmds = [cmd];
    let submit = vk::SubmitInfo::default().command_buffers(&cmds);
    device.queue_submit(queue, &[submit], fence)?;
    Ok(())
}
