//! GPU buffer resources.

use crate::command::CommandPool;
use crate::context::DeviceContext;
use crate::error::{GpuError, Result};
use crate::memory::{self, MemoryLocation};
use ash::vk;

bitflags::bitflags! {
    /// What a buffer will be used for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const VERTEX = 1 << 0;
        const INDEX = 1 << 1;
        const UNIFORM = 1 << 2;
        const TRANSFER_SRC = 1 << 3;
        const TRANSFER_DST = 1 << 4;
    }
}

impl BufferUsage {
    /// Map onto the raw API usage mask.
    pub fn to_vk(self) -> vk::BufferUsageFlags {
        let mut flags = vk::BufferUsageFlags::empty();
        if self.contains(Self::VERTEX) {
            flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
        }
        if self.contains(Self::INDEX) {
            flags |= vk::BufferUsageFlags::INDEX_BUFFER;
        }
        if self.contains(Self::UNIFORM) {
            flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
        }
        if self.contains(Self::TRANSFER_SRC) {
            flags |= vk::BufferUsageFlags::TRANSFER_SRC;
        }
        if self.contains(Self::TRANSFER_DST) {
            flags |= vk::BufferUsageFlags::TRANSFER_DST;
        }
        flags
    }

    /// A buffer that is only ever a copy destination is populated through
    /// staging copies and must never be host-mapped.
    pub fn is_transfer_dst_only(self) -> bool {
        self == Self::TRANSFER_DST
    }
}

/// A fixed-size GPU buffer with its own memory allocation.
pub struct Buffer {
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: vk::DeviceSize,
    usage: BufferUsage,
    location: MemoryLocation,
    mapped: bool,
}

impl Buffer {
    /// Create a buffer and bind fresh memory to it.
    pub fn new(
        ctx: &DeviceContext,
        size: vk::DeviceSize,
        usage: BufferUsage,
        location: MemoryLocation,
    ) -> Result<Self> {
        let device = ctx.device();

        let create_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage.to_vk())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&create_info, None)? };

        let memory = match unsafe {
            memory::allocate_buffer_memory(device, ctx.memory_properties(), buffer, location)
        } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        Ok(Self {
            buffer,
            memory,
            size,
            usage,
            location,
            mapped: false,
        })
    }

    /// Create a host-visible staging buffer for uploads.
    pub fn staging(ctx: &DeviceContext, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            ctx,
            size,
            BufferUsage::TRANSFER_SRC,
            MemoryLocation::HostVisible,
        )
    }

    /// Get the raw buffer handle.
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Get the buffer size in bytes.
    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Get the usage set the buffer was created with.
    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    /// Map the buffer memory for host access.
    ///
    /// The buffer must be host-visible; a transfer-dst-only buffer is
    /// populated exclusively through device-side copies and is rejected here.
    pub fn lock(&mut self, device: &ash::Device) -> Result<*mut u8> {
        debug_assert!(
            !self.usage.is_transfer_dst_only(),
            "transfer-dst-only buffers are populated via staging copies, not mapping"
        );
        if self.location != MemoryLocation::HostVisible || self.usage.is_transfer_dst_only() {
            return Err(GpuError::InvalidState(
                "buffer memory is not host-mappable".to_string(),
            ));
        }

        let ptr = unsafe {
            device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())?
        };
        self.mapped = true;
        Ok(ptr.cast())
    }

    /// Unmap previously locked memory.
    pub fn unlock(&mut self, device: &ash::Device) {
        if self.mapped {
            unsafe { device.unmap_memory(self.memory) };
            self.mapped = false;
        }
    }

    /// Write `data` over the buffer contents: lock, copy, unlock.
    pub fn update<T: bytemuck::Pod>(&mut self, device: &ash::Device, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as vk::DeviceSize > self.size {
            return Err(GpuError::InvalidState(
                "data too large for buffer".to_string(),
            ));
        }

        let ptr = self.lock(device)?;
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len());
        }
        self.unlock(device);
        Ok(())
    }

    /// Synchronously copy the contents of `src` into this buffer.
    ///
    /// Uses the pool's one-shot submit/wait pair; setup-time only.
    pub fn copy_from(
        &mut self,
        device: &ash::Device,
        pool: &CommandPool,
        src: &Buffer,
    ) -> Result<()> {
        debug_assert!(src.size <= self.size, "source exceeds destination");
        unsafe {
            pool.with_one_shot(device, |cmd| {
                self.record_copy_from(device, cmd, src);
            })
        }
    }

    /// Record a copy from `src` into a caller-owned command stream.
    ///
    /// Asynchronous: the copy runs when the command buffer is submitted.
    pub fn record_copy_from(&self, device: &ash::Device, cmd: vk::CommandBuffer, src: &Buffer) {
        let region = vk::BufferCopy::default().size(src.size.min(self.size));
        unsafe {
            device.cmd_copy_buffer(cmd, src.buffer, self.buffer, &[region]);
        }
    }

    /// Destroy the buffer and free its memory.
    ///
    /// # Safety
    /// The device must be valid and the buffer must not be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.unlock(device);
        device.destroy_buffer(self.buffer, None);
        device.free_memory(self.memory, None);
        self.buffer = vk::Buffer::null();
        self.memory = vk::DeviceMemory::null();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_maps_exactly() {
        let usage = BufferUsage::VERTEX | BufferUsage::TRANSFER_DST;
        assert_eq!(
            usage.to_vk(),
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::TRANSFER_DST
        );
        assert_eq!(
            BufferUsage::UNIFORM.to_vk(),
            vk::BufferUsageFlags::UNIFORM_BUFFER
        );
        assert_eq!(
            BufferUsage::INDEX.to_vk(),
            vk::BufferUsageFlags::INDEX_BUFFER
        );
        assert_eq!(
            BufferUsage::TRANSFER_SRC.to_vk(),
            vk::BufferUsageFlags::TRANSFER_SRC
        );
    }

    #[test]
    fn transfer_dst_only_detection() {
        assert!(BufferUsage::TRANSFER_DST.is_transfer_dst_only());
        assert!(!(BufferUsage::TRANSFER_DST | BufferUsage::VERTEX).is_transfer_dst_only());
        assert!(!BufferUsage::UNIFORM.is_transfer_dst_only());
    }
}
