//! Command pool and command buffer management.
//!
//! Pools come in two flavors: *recorded* pools hold long-lived command
//! buffers that are re-begun and resubmitted every frame, and *transient*
//! pools serve one-shot buffers that are submitted and waited on
//! synchronously, used for setup-time transfers only.

use crate::error::Result;
use ash::vk;

/// Creation parameters for a command pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolParams {
    /// Pool is meant for short-lived, immediately submitted buffers.
    pub transient: bool,
    /// Buffers from this pool may be individually reset by `begin`.
    pub reset_command_buffers: bool,
}

impl PoolParams {
    /// Pool for long-lived, per-frame resubmitted command buffers.
    pub fn recorded() -> Self {
        Self {
            transient: false,
            reset_command_buffers: true,
        }
    }

    /// Pool for one-shot buffers submitted through [`CommandPool::end_one_shot`].
    pub fn transient() -> Self {
        Self {
            transient: true,
            reset_command_buffers: false,
        }
    }
}

/// Map pool parameters onto creation flags.
pub(crate) fn pool_create_flags(params: PoolParams) -> vk::CommandPoolCreateFlags {
    let mut flags = vk::CommandPoolCreateFlags::empty();
    if params.transient {
        flags |= vk::CommandPoolCreateFlags::TRANSIENT;
    }
    if params.reset_command_buffers {
        flags |= vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER;
    }
    flags
}

/// Command pool bound to one queue family for its lifetime.
///
/// Pools are owned by the [`DeviceContext`](crate::context::DeviceContext)
/// that created them; the handles here are freely copyable views.
#[derive(Debug, Clone, Copy)]
pub struct CommandPool {
    pool: vk::CommandPool,
    queue_family: u32,
    queue: vk::Queue,
    params: PoolParams,
}

impl CommandPool {
    /// Create a new command pool.
    ///
    /// # Safety
    /// The device must be valid and the queue family must exist.
    pub(crate) unsafe fn new(
        device: &ash::Device,
        queue_family: u32,
        queue: vk::Queue,
        params: PoolParams,
    ) -> Result<Self> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(pool_create_flags(params));

        let pool = device.create_command_pool(&create_info, None)?;

        Ok(Self {
            pool,
            queue_family,
            queue,
            params,
        })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::CommandPool {
        self.pool
    }

    /// Get the queue family index this pool is bound to.
    pub fn queue_family(&self) -> u32 {
        self.queue_family
    }

    /// Get the queue buffers from this pool are submitted to.
    pub fn queue(&self) -> vk::Queue {
        self.queue
    }

    /// Get the creation parameters.
    pub fn params(&self) -> PoolParams {
        self.params
    }

    /// Allocate a single command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(&self, device: &ash::Device, primary: bool) -> Result<vk::CommandBuffer> {
        Ok(self.allocate_many(device, 1, primary)?[0])
    }

    /// Allocate multiple command buffers.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate_many(
        &self,
        device: &ash::Device,
        count: u32,
        primary: bool,
    ) -> Result<Vec<vk::CommandBuffer>> {
        let level = if primary {
            vk::CommandBufferLevel::PRIMARY
        } else {
            vk::CommandBufferLevel::SECONDARY
        };

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.pool)
            .level(level)
            .command_buffer_count(count);

        let buffers = device.allocate_command_buffers(&alloc_info)?;
        Ok(buffers)
    }

    /// Return command buffers to the pool.
    ///
    /// # Safety
    /// The device must be valid and none of the buffers may be pending
    /// execution.
    pub unsafe fn free(&self, device: &ash::Device, buffers: &[vk::CommandBuffer]) {
        device.free_command_buffers(self.pool, buffers);
    }

    /// Reset the whole pool, recycling every buffer allocated from it.
    ///
    /// # Safety
    /// The device must be valid and no buffer from this pool may be in use.
    pub unsafe fn reset(&self, device: &ash::Device) -> Result<()> {
        device.reset_command_pool(self.pool, vk::CommandPoolResetFlags::empty())?;
        Ok(())
    }

    /// Begin a one-shot command buffer for setup-time recording.
    ///
    /// Pair with [`CommandPool::end_one_shot`], which submits and blocks.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn begin_one_shot(&self, device: &ash::Device) -> Result<vk::CommandBuffer> {
        debug_assert!(
            self.params.transient,
            "one-shot recording requires a transient pool"
        );

        let cmd = self.allocate(device, true)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        device.begin_command_buffer(cmd, &begin_info)?;
        Ok(cmd)
    }

    /// End a one-shot buffer, submit it, and block until the queue is idle.
    ///
    /// The buffer is freed before returning. This is the only synchronous
    /// GPU operation in the crate besides explicit idle waits; never call it
    /// inside the per-frame render path.
    ///
    /// # Safety
    /// The device must be valid and `cmd` must come from
    /// [`CommandPool::begin_one_shot`] on this pool.
    pub unsafe fn end_one_shot(&self, device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
        device.end_command_buffer(cmd)?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        device.queue_submit(self.queue, &[submit_info], vk::Fence::null())?;
        device.queue_wait_idle(self.queue)?;

        self.free(device, &command_buffers);
        Ok(())
    }

    /// Record and synchronously execute a one-shot command buffer.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn with_one_shot<F>(&self, device: &ash::Device, f: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        let cmd = self.begin_one_shot(device)?;
        f(cmd);
        self.end_one_shot(device, cmd)
    }

    /// Destroy the pool and every buffer allocated from it.
    ///
    /// # Safety
    /// The device must be valid and no buffer from this pool may be in use.
    pub(crate) unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_command_pool(self.pool, None);
    }
}

/// Begin recording a long-lived command buffer.
///
/// With `resubmit` set the buffer may be submitted again while still pending
/// from an earlier frame; otherwise each `begin` starts from a clean
/// recording state (the pool must allow buffer reset).
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn begin_recorded(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    resubmit: bool,
) -> Result<()> {
    let flags = if resubmit {
        vk::CommandBufferUsageFlags::SIMULTANEOUS_USE
    } else {
        vk::CommandBufferUsageFlags::empty()
    };

    let begin_info = vk::CommandBufferBeginInfo::default().flags(flags);
    device.begin_command_buffer(cmd, &begin_info)?;
    Ok(())
}

/// End recording a command buffer.
///
/// # Safety
/// The device and command buffer must be valid.
pub unsafe fn end_recorded(device: &ash::Device, cmd: vk::CommandBuffer) -> Result<()> {
    device.end_command_buffer(cmd)?;
    Ok(())
}

/// Submit command buffers to a queue.
///
/// # Safety
/// All handles must be valid.
pub unsafe fn submit(
    device: &ash::Device,
    queue: vk::Queue,
    command_buffers: &[vk::CommandBuffer],
    wait_semaphores: &[vk::Semaphore],
    wait_stages: &[vk::PipelineStageFlags],
    signal_semaphores: &[vk::Semaphore],
    fence: vk::Fence,
) -> Result<()> {
    let submit_info = vk::SubmitInfo::default()
        .command_buffers(command_buffers)
        .wait_semaphores(wait_semaphores)
        .wait_dst_stage_mask(wait_stages)
        .signal_semaphores(signal_semaphores);

    device.queue_submit(queue, &[submit_info], fence)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recorded_pool_flags() {
        let flags = pool_create_flags(PoolParams::recorded());
        assert!(flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER));
        assert!(!flags.contains(vk::CommandPoolCreateFlags::TRANSIENT));
    }

    #[test]
    fn transient_pool_flags() {
        let flags = pool_create_flags(PoolParams::transient());
        assert!(flags.contains(vk::CommandPoolCreateFlags::TRANSIENT));
        assert!(!flags.contains(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER));
    }
}
