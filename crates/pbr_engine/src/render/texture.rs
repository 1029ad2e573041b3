//! Texture loading and GPU upload
//!
//! Decodes SDR (PNG) and HDR (Radiance) images and uploads them through a
//! staging buffer into device-local sampled images. A texture can also
//! wrap an externally owned image view, e.g. a baked cubemap face, in
//! which case it does not destroy the underlying image.

use ash::{vk, Device};
use std::path::Path;
use thiserror::Error;

use crate::render::vulkan::image::{self as gpu_image, AllocatedImage, LayoutTransition};
use crate::render::vulkan::{MemoryClass, VulkanContext, VulkanError, VulkanResult};

/// Asset decoding and loading errors
#[derive(Error, Debug)]
pub enum AssetError {
    /// Image or mesh file could not be decoded
    #[error("failed to decode {path}: {reason}")]
    Decode {
        /// Path of the offending file
        path: String,
        /// Decoder error message
        reason: String,
    },

    /// GPU upload failed
    #[error("GPU upload failed: {0}")]
    Gpu(#[from] VulkanError),
}

/// Pixel format of a texture source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureFormat {
    /// 8-bit RGBA, sRGB encoded (albedo)
    Srgb,
    /// 8-bit RGBA, linear (normal maps, masks)
    Linear,
    /// 32-bit float RGBA (HDR panoramas)
    Hdr,
}

impl TextureFormat {
    /// The matching Vulkan format
    pub fn vk_format(self) -> vk::Format {
        match self {
            Self::Srgb => vk::Format::R8G8B8A8_SRGB,
            Self::Linear => vk::Format::R8G8B8A8_UNORM,
            Self::Hdr => vk::Format::R32G32B32A32_SFLOAT,
        }
    }
}

/// A sampled GPU image with its view
pub struct Texture {
    device: Device,
    image: Option<AllocatedImage>,
    view: vk::ImageView,
    mip_levels: u32,
    owns_image: bool,
}

impl Texture {
    /// Decode an image file and upload it to a device-local image
    pub fn from_file<P: AsRef<Path>>(
        context: &VulkanContext,
        path: P,
        format: TextureFormat,
    ) -> Result<Self, AssetError> {
        let path_display = path.as_ref().display().to_string();
        let decoded = image::open(&path).map_err(|e| AssetError::Decode {
            path: path_display.clone(),
            reason: e.to_string(),
        })?;

        let (width, height) = (decoded.width(), decoded.height());
        log::info!(
            "Loaded texture {} ({}x{}, {:?})",
            path_display,
            width,
            height,
            format
        );

        let bytes: Vec<u8> = match format {
            TextureFormat::Hdr => {
                let pixels = decoded.to_rgba32f().into_raw();
                bytemuck::cast_slice(&pixels).to_vec()
            }
            TextureFormat::Srgb | TextureFormat::Linear => decoded.to_rgba8().into_raw(),
        };

        Self::upload(context, &bytes, width, height, format).map_err(AssetError::Gpu)
    }

    fn upload(
        context: &VulkanContext,
        bytes: &[u8],
        width: u32,
        height: u32,
        format: TextureFormat,
    ) -> VulkanResult<Self> {
        let device = context.device().clone();
        let extent = vk::Extent2D { width, height };
        let vk_format = format.vk_format();

        let staging = context.create_buffer(
            bytes.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryClass::CpuToGpu,
        )?;
        context.write_buffer(&staging, 0, bytes)?;

        let image_info = gpu_image::image_create_info_2d(
            vk_format,
            vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
            extent,
            1,
        );
        let allocated = context.create_image(&image_info, MemoryClass::GpuOnly)?;

        let command_buffer = context.begin_single_time_commands()?;
        let range = gpu_image::color_subresource_range(1, 1);

        gpu_image::transition_image_layout(
            &device,
            command_buffer,
            allocated.image,
            LayoutTransition::undefined_to_transfer_dst(),
            range,
        );

        let copy_region = vk::BufferImageCopy::builder()
            .buffer_offset(0)
            .buffer_row_length(0)
            .buffer_image_height(0)
            .image_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .image_extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });

        unsafe {
            device.cmd_copy_buffer_to_image(
                command_buffer,
                staging.buffer,
                allocated.image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[copy_region.build()],
            );
        }

        gpu_image::transition_image_layout(
            &device,
            command_buffer,
            allocated.image,
            LayoutTransition::transfer_dst_to_shader_read(),
            range,
        );

        context.end_single_time_commands(command_buffer)?;
        staging.destroy(&device);

        let view = gpu_image::create_view_2d(
            &device,
            allocated.image,
            vk_format,
            vk::ImageAspectFlags::COLOR,
            1,
        )
        .map_err(VulkanError::Api)?;

        Ok(Self {
            device,
            image: Some(allocated),
            view,
            mip_levels: 1,
            owns_image: true,
        })
    }

    /// Wrap an externally owned image view (non-owning)
    ///
    /// The producer keeps ownership of both image and view; dropping this
    /// texture destroys neither.
    pub fn from_view(context: &VulkanContext, view: vk::ImageView, mip_levels: u32) -> Self {
        Self {
            device: context.device().clone(),
            image: None,
            view,
            mip_levels,
            owns_image: false,
        }
    }

    /// The image view for descriptor writes
    pub fn view(&self) -> vk::ImageView {
        self.view
    }

    /// Number of mip levels in the underlying image
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        if self.owns_image {
            unsafe {
                self.device.destroy_image_view(self.view, None);
            }
            if let Some(allocated) = &self.image {
                allocated.destroy(&self.device);
            }
        }
    }
}
