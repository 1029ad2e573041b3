//! GPU image allocation and layout transition helpers
//!
//! Every image layout transition in the engine goes through
//! [`transition_image_layout`], parameterized by layouts, access masks,
//! pipeline stages, and the affected mip/layer range.

use ash::{vk, Device};

/// An image handle paired with its backing memory allocation
#[derive(Debug, Clone, Copy)]
pub struct AllocatedImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
}

impl AllocatedImage {
    /// Destroy the image and free its memory
    pub fn destroy(&self, device: &Device) {
        unsafe {
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

/// Parameters for a single image layout transition barrier
#[derive(Debug, Clone, Copy)]
pub struct LayoutTransition {
    pub old_layout: vk::ImageLayout,
    pub new_layout: vk::ImageLayout,
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
}

impl LayoutTransition {
    /// UNDEFINED -> TRANSFER_DST before a copy or blit writes the image
    pub fn undefined_to_transfer_dst() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }
    }

    /// TRANSFER_DST -> SHADER_READ_ONLY once transfer writes are complete
    pub fn transfer_dst_to_shader_read() -> Self {
        Self {
            old_layout: vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }

    /// COLOR_ATTACHMENT -> TRANSFER_SRC after an offscreen pass finishes
    pub fn color_attachment_to_transfer_src() -> Self {
        Self {
            old_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            new_layout: vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            src_access: vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            dst_access: vk::AccessFlags::TRANSFER_READ,
            src_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
        }
    }

    /// UNDEFINED -> GENERAL before a compute shader writes a storage image
    pub fn undefined_to_general() -> Self {
        Self {
            old_layout: vk::ImageLayout::UNDEFINED,
            new_layout: vk::ImageLayout::GENERAL,
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::SHADER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        }
    }

    /// GENERAL -> SHADER_READ_ONLY once compute writes are complete
    pub fn general_to_shader_read() -> Self {
        Self {
            old_layout: vk::ImageLayout::GENERAL,
            new_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            src_access: vk::AccessFlags::SHADER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
        }
    }
}

/// A color subresource range covering the given mip levels and array layers
pub fn color_subresource_range(mip_levels: u32, layer_count: u32) -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: mip_levels,
        base_array_layer: 0,
        layer_count,
    }
}

/// Record one image layout transition barrier
pub fn transition_image_layout(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    transition: LayoutTransition,
    range: vk::ImageSubresourceRange,
) {
    let barrier = vk::ImageMemoryBarrier::builder()
        .old_layout(transition.old_layout)
        .new_layout(transition.new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(range)
        .src_access_mask(transition.src_access)
        .dst_access_mask(transition.dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            command_buffer,
            transition.src_stage,
            transition.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier.build()],
        );
    }
}

/// Number of mip levels for an image of the given dimensions
pub fn mip_levels(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Extent of mip level `level`, halving per level with a floor of 1
pub fn mip_extent(extent: vk::Extent2D, level: u32) -> vk::Extent2D {
    vk::Extent2D {
        width: (extent.width >> level).max(1),
        height: (extent.height >> level).max(1),
    }
}

/// Create-info for a 2D optimal-tiling image
pub fn image_create_info_2d(
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    extent: vk::Extent2D,
    mip_levels: u32,
) -> vk::ImageCreateInfo {
    vk::ImageCreateInfo::builder()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: extent.width,
            height: extent.height,
            depth: 1,
        })
        .mip_levels(mip_levels)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .build()
}

/// Create-info for a cube-compatible image with six array layers
pub fn cube_image_create_info(
    format: vk::Format,
    usage: vk::ImageUsageFlags,
    extent: vk::Extent2D,
    mip_levels: u32,
) -> vk::ImageCreateInfo {
    let mut info = image_create_info_2d(format, usage, extent, mip_levels);
    info.flags = vk::ImageCreateFlags::CUBE_COMPATIBLE;
    info.array_layers = 6;
    info
}

/// Create a cube image view covering six layers and the given mip levels
pub fn create_cube_view(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    mip_levels: u32,
    base_mip_level: u32,
) -> Result<vk::ImageView, vk::Result> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::CUBE)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 6,
        });

    unsafe { device.create_image_view(&view_info, None) }
}

/// Create a 2D image view with the given mip count
pub fn create_view_2d(
    device: &Device,
    image: vk::Image,
    format: vk::Format,
    aspect: vk::ImageAspectFlags,
    mip_levels: u32,
) -> Result<vk::ImageView, vk::Result> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: aspect,
            base_mip_level: 0,
            level_count: mip_levels,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.create_image_view(&view_info, None) }
}

/// Blit the single-mip source into every level of the destination chain,
/// halving the extent per level (linear filtering)
pub fn blit_mip_chain(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
    levels: u32,
    layer_count: u32,
) {
    for level in 0..levels {
        let dst_extent = mip_extent(extent, level);

        let blit = vk::ImageBlit::builder()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count,
            })
            .src_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: extent.width as i32,
                    y: extent.height as i32,
                    z: 1,
                },
            ])
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: level,
                base_array_layer: 0,
                layer_count,
            })
            .dst_offsets([
                vk::Offset3D { x: 0, y: 0, z: 0 },
                vk::Offset3D {
                    x: dst_extent.width as i32,
                    y: dst_extent.height as i32,
                    z: 1,
                },
            ]);

        unsafe {
            device.cmd_blit_image(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[blit.build()],
                vk::Filter::LINEAR,
            );
        }
    }
}

/// Copy each mip level of the source into the matching destination level
pub fn copy_mip_levels(
    device: &Device,
    command_buffer: vk::CommandBuffer,
    src: vk::Image,
    dst: vk::Image,
    extent: vk::Extent2D,
    levels: u32,
    layer_count: u32,
) {
    for level in 0..levels {
        let level_extent = mip_extent(extent, level);
        let subresource = |mip_level| vk::ImageSubresourceLayers {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            mip_level,
            base_array_layer: 0,
            layer_count,
        };

        let copy = vk::ImageCopy::builder()
            .src_subresource(subresource(level))
            .dst_subresource(subresource(level))
            .src_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .dst_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
            .extent(vk::Extent3D {
                width: level_extent.width,
                height: level_extent.height,
                depth: 1,
            });

        unsafe {
            device.cmd_copy_image(
                command_buffer,
                src,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy.build()],
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mip_level_formula() {
        assert_eq!(mip_levels(512, 512), 10);
        assert_eq!(mip_levels(1, 1), 1);
        assert_eq!(mip_levels(300, 512), 10);
        assert_eq!(mip_levels(1024, 32), 11);
        assert_eq!(mip_levels(2, 2), 2);
    }

    #[test]
    fn mip_extent_halves_with_floor_of_one() {
        let extent = vk::Extent2D {
            width: 512,
            height: 512,
        };
        assert_eq!(mip_extent(extent, 0).width, 512);
        assert_eq!(mip_extent(extent, 1).width, 256);
        assert_eq!(mip_extent(extent, 9).width, 1);
        assert_eq!(mip_extent(extent, 12).width, 1);

        let wide = vk::Extent2D {
            width: 512,
            height: 64,
        };
        let level7 = mip_extent(wide, 7);
        assert_eq!(level7.width, 4);
        assert_eq!(level7.height, 1);
    }

    #[test]
    fn cube_image_info_has_six_layers() {
        let info = cube_image_create_info(
            vk::Format::R16G16B16A16_SFLOAT,
            vk::ImageUsageFlags::SAMPLED,
            vk::Extent2D {
                width: 512,
                height: 512,
            },
            10,
        );
        assert_eq!(info.array_layers, 6);
        assert_eq!(info.mip_levels, 10);
        assert!(info.flags.contains(vk::ImageCreateFlags::CUBE_COMPATIBLE));
    }
}
