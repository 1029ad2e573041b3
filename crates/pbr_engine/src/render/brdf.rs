//! BRDF lookup table compute pass
//!
//! One-shot compute dispatch producing the split-sum-approximation LUT
//! indexed by (NdotV, roughness). Runs once at scene construction; the
//! resulting image is immutable afterwards.

use ash::{vk, Device};

use crate::render::vulkan::image::{self as gpu_image, AllocatedImage, LayoutTransition};
use crate::render::vulkan::{MemoryClass, Pipeline, VulkanContext, VulkanError, VulkanResult};

/// Resolution of the lookup table
pub const BRDF_LUT_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 512,
    height: 512,
};

/// Two-channel float format storing scale and bias of the split sum
pub const BRDF_LUT_FORMAT: vk::Format = vk::Format::R16G16_SFLOAT;

const WORKGROUP_SIZE: u32 = 16;

/// Compute shader writing to a single storage image
pub struct ComputeShader {
    device: Device,
    set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: Pipeline,
}

impl ComputeShader {
    /// Build the pipeline and bind the target image as a storage descriptor
    pub fn new(
        context: &VulkanContext,
        comp_path: &str,
        target_view: vk::ImageView,
    ) -> VulkanResult<Self> {
        let device = context.device().clone();

        let bindings = [vk::DescriptorSetLayoutBinding::builder()
            .binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .build()];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let descriptor_set = context.allocate_descriptor_set(set_layout)?;
        let image_info = vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: target_view,
            image_layout: vk::ImageLayout::GENERAL,
        };
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
            .image_info(std::slice::from_ref(&image_info))
            .build();
        unsafe {
            device.update_descriptor_sets(&[write], &[]);
        }

        let set_layouts = [set_layout];
        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let pipeline = Pipeline::compute(device.clone(), comp_path, pipeline_layout)?;

        Ok(Self {
            device,
            set_layout,
            descriptor_set,
            pipeline_layout,
            pipeline,
        })
    }

    /// Bind the pipeline and the storage-image descriptor set
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        self.pipeline.bind(command_buffer);
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[self.descriptor_set],
                &[],
            );
        }
    }
}

impl Drop for ComputeShader {
    fn drop(&mut self) {
        unsafe {
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

/// The precomputed BRDF integration lookup table
pub struct BrdfLut {
    device: Device,
    image: AllocatedImage,
    view: vk::ImageView,
}

impl BrdfLut {
    /// Allocate the LUT image and fill it with one compute dispatch
    pub fn new(context: &VulkanContext, comp_path: &str) -> VulkanResult<Self> {
        let device = context.device().clone();

        let image_info = gpu_image::image_create_info_2d(
            BRDF_LUT_FORMAT,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED,
            BRDF_LUT_EXTENT,
            1,
        );
        let image = context.create_image(&image_info, MemoryClass::GpuOnly)?;
        let view = gpu_image::create_view_2d(
            &device,
            image.image,
            BRDF_LUT_FORMAT,
            vk::ImageAspectFlags::COLOR,
            1,
        )
        .map_err(VulkanError::Api)?;

        let shader = ComputeShader::new(context, comp_path, view)?;

        let command_buffer = context.begin_single_time_commands()?;
        let range = gpu_image::color_subresource_range(1, 1);

        gpu_image::transition_image_layout(
            &device,
            command_buffer,
            image.image,
            LayoutTransition::undefined_to_general(),
            range,
        );

        shader.bind(command_buffer);
        let groups_x = BRDF_LUT_EXTENT.width / WORKGROUP_SIZE;
        let groups_y = BRDF_LUT_EXTENT.height / WORKGROUP_SIZE;
        unsafe {
            device.cmd_dispatch(command_buffer, groups_x, groups_y, 1);
        }

        gpu_image::transition_image_layout(
            &device,
            command_buffer,
            image.image,
            LayoutTransition::general_to_shader_read(),
            range,
        );

        context.end_single_time_commands(command_buffer)?;
        log::info!(
            "Generated BRDF LUT ({}x{})",
            BRDF_LUT_EXTENT.width,
            BRDF_LUT_EXTENT.height
        );

        // The dispatch has completed; the pipeline is no longer needed
        drop(shader);

        Ok(Self {
            device,
            image,
            view,
        })
    }

    /// Sampled view of the LUT
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

impl Drop for BrdfLut {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image_view(self.view, None);
        }
        self.image.destroy(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_covers_the_full_lut() {
        assert_eq!(BRDF_LUT_EXTENT.width % WORKGROUP_SIZE, 0);
        assert_eq!(BRDF_LUT_EXTENT.height % WORKGROUP_SIZE, 0);
        assert_eq!(BRDF_LUT_EXTENT.width / WORKGROUP_SIZE, 32);
    }
}
