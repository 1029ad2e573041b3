//! GPU buffer allocation helpers
//!
//! Buffers and their memory are always created and destroyed as a pair.

use ash::{vk, Device};

use crate::render::vulkan::{MemoryClass, VulkanContext, VulkanResult};

/// A buffer handle paired with its backing memory allocation
#[derive(Debug, Clone, Copy)]
pub struct AllocatedBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
}

impl AllocatedBuffer {
    /// Destroy the buffer and free its memory
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Record a full-buffer copy inside a one-shot command sequence
pub fn copy_buffer(
    context: &VulkanContext,
    src: vk::Buffer,
    dst: vk::Buffer,
    size: vk::DeviceSize,
) -> VulkanResult<()> {
    let command_buffer = context.begin_single_time_commands()?;

    let region = vk::BufferCopy::builder().size(size);
    unsafe {
        context
            .device()
            .cmd_copy_buffer(command_buffer, src, dst, &[region.build()]);
    }

    context.end_single_time_commands(command_buffer)
}

/// Upload bytes into a new device-local buffer via a staging copy
pub fn create_device_local_buffer(
    context: &VulkanContext,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> VulkanResult<AllocatedBuffer> {
    let size = bytes.len() as vk::DeviceSize;

    let staging = context.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_SRC,
        MemoryClass::CpuToGpu,
    )?;
    context.write_buffer(&staging, 0, bytes)?;

    let buffer = context.create_buffer(
        size,
        vk::BufferUsageFlags::TRANSFER_DST | usage,
        MemoryClass::GpuOnly,
    )?;

    copy_buffer(context, staging.buffer, buffer.buffer, size)?;
    staging.destroy(context.device());

    Ok(buffer)
}
