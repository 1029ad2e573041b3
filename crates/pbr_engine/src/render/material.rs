//! Material system
//!
//! A material pairs vertex/fragment shaders with an ordered list of
//! textures and render-state knobs. The graphics pipeline is built
//! lazily the first time the material is used against a render pass;
//! the built state is an explicit tagged variant rather than nullable
//! handles. Materials are shared through an arena so render objects can
//! reference them by handle while the scene retains mutable access.

use ash::{vk, Device};
use slotmap::{new_key_type, SlotMap};
use std::sync::Arc;

use crate::render::texture::Texture;
use crate::render::vulkan::{Pipeline, PipelineConfig, VulkanContext, VulkanError, VulkanResult};

new_key_type! {
    /// Arena handle identifying a material
    pub struct MaterialHandle;
}

/// Arena storing materials shared across render objects
pub type MaterialArena = SlotMap<MaterialHandle, Material>;

/// Pipeline state built on first use against a render pass
enum PipelineState {
    Unbuilt,
    Built(BuiltPipeline),
}

struct BuiltPipeline {
    device: Device,
    pipeline: Pipeline,
    pipeline_layout: vk::PipelineLayout,
    texture_set_layout: vk::DescriptorSetLayout,
    texture_descriptor: vk::DescriptorSet,
    samplers: Vec<vk::Sampler>,
    set_count: u32,
}

impl Drop for BuiltPipeline {
    fn drop(&mut self) {
        unsafe {
            for &sampler in &self.samplers {
                self.device.destroy_sampler(sampler, None);
            }
            self.device
                .destroy_descriptor_set_layout(self.texture_set_layout, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
        }
    }
}

/// A shader pair with bound textures and render-state configuration
pub struct Material {
    vert_path: String,
    frag_path: String,
    textures: Vec<Arc<Texture>>,
    depth_compare_op: vk::CompareOp,
    cull_mode: vk::CullModeFlags,
    state: PipelineState,
}

impl Material {
    /// Create a material from shader paths; textures are added before setup
    pub fn new(vert_path: &str, frag_path: &str) -> Self {
        Self {
            vert_path: vert_path.to_string(),
            frag_path: frag_path.to_string(),
            textures: Vec::new(),
            depth_compare_op: vk::CompareOp::LESS,
            cull_mode: vk::CullModeFlags::BACK,
            state: PipelineState::Unbuilt,
        }
    }

    /// Append a texture; binding index equals insertion order
    pub fn add_texture(&mut self, texture: Arc<Texture>) {
        debug_assert!(
            !self.is_ready(),
            "textures must be added before the material is set up"
        );
        self.textures.push(texture);
    }

    pub fn set_depth_compare_op(&mut self, compare_op: vk::CompareOp) {
        self.depth_compare_op = compare_op;
    }

    pub fn set_cull_mode(&mut self, cull_mode: vk::CullModeFlags) {
        self.cull_mode = cull_mode;
    }

    /// Whether the pipeline has been built
    pub fn is_ready(&self) -> bool {
        matches!(self.state, PipelineState::Built(_))
    }

    /// Build the texture descriptor set, pipeline layout, and pipeline
    /// against the given render pass
    ///
    /// A material is built against exactly one render pass; calling
    /// `setup` on a ready material is a caller error.
    pub fn setup(
        &mut self,
        context: &VulkanContext,
        external_layouts: &[vk::DescriptorSetLayout],
        render_pass: vk::RenderPass,
    ) -> VulkanResult<()> {
        debug_assert!(!self.is_ready(), "material set up twice");
        if self.is_ready() {
            log::warn!("Material::setup called on a ready material; ignoring");
            return Ok(());
        }

        let device = context.device().clone();

        // One combined-image-sampler binding per texture, fragment stage
        let bindings: Vec<vk::DescriptorSetLayoutBinding> = (0..self.textures.len())
            .map(|i| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(i as u32)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .descriptor_count(1)
                    .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let texture_set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let texture_descriptor = context.allocate_descriptor_set(texture_set_layout)?;

        let mut samplers = Vec::with_capacity(self.textures.len());
        let mut image_infos = Vec::with_capacity(self.textures.len());
        for texture in &self.textures {
            let sampler_info = vk::SamplerCreateInfo::builder()
                .mag_filter(vk::Filter::LINEAR)
                .min_filter(vk::Filter::LINEAR)
                .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
                .address_mode_u(vk::SamplerAddressMode::REPEAT)
                .address_mode_v(vk::SamplerAddressMode::REPEAT)
                .address_mode_w(vk::SamplerAddressMode::REPEAT)
                .min_lod(0.0)
                .max_lod(texture.mip_levels() as f32);
            let sampler = unsafe {
                device
                    .create_sampler(&sampler_info, None)
                    .map_err(VulkanError::Api)?
            };
            samplers.push(sampler);

            image_infos.push(
                vk::DescriptorImageInfo::builder()
                    .sampler(sampler)
                    .image_view(texture.view())
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .build(),
            );
        }

        let writes: Vec<vk::WriteDescriptorSet> = image_infos
            .iter()
            .enumerate()
            .map(|(i, info)| {
                vk::WriteDescriptorSet::builder()
                    .dst_set(texture_descriptor)
                    .dst_binding(i as u32)
                    .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                    .image_info(std::slice::from_ref(info))
                    .build()
            })
            .collect();
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        // Texture set sits after every externally supplied set
        let mut set_layouts: Vec<vk::DescriptorSetLayout> = external_layouts.to_vec();
        set_layouts.push(texture_set_layout);
        let set_count = set_layouts.len() as u32;

        let pipeline_layout_info =
            vk::PipelineLayoutCreateInfo::builder().set_layouts(&set_layouts);
        let pipeline_layout = unsafe {
            device
                .create_pipeline_layout(&pipeline_layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let mut config = PipelineConfig::new(pipeline_layout, render_pass);
        config.depth_compare_op = self.depth_compare_op;
        config.cull_mode = self.cull_mode;

        let pipeline = Pipeline::graphics(device.clone(), &self.vert_path, &self.frag_path, &config)?;

        self.state = PipelineState::Built(BuiltPipeline {
            device,
            pipeline,
            pipeline_layout,
            texture_set_layout,
            texture_descriptor,
            samplers,
            set_count,
        });

        Ok(())
    }

    fn built(&self) -> VulkanResult<&BuiltPipeline> {
        match &self.state {
            PipelineState::Built(built) => Ok(built),
            PipelineState::Unbuilt => Err(VulkanError::InvalidOperation {
                reason: "material used before setup".to_string(),
            }),
        }
    }

    /// The pipeline layout, available once the material is ready
    pub fn pipeline_layout(&self) -> VulkanResult<vk::PipelineLayout> {
        Ok(self.built()?.pipeline_layout)
    }

    /// Bind the pipeline and the texture descriptor set
    ///
    /// The texture set is bound at the slot following the external sets.
    pub fn bind(&self, command_buffer: vk::CommandBuffer) -> VulkanResult<()> {
        let built = self.built()?;
        built.pipeline.bind(command_buffer);
        if !self.textures.is_empty() {
            unsafe {
                built.device.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    built.pipeline_layout,
                    built.set_count - 1,
                    &[built.texture_descriptor],
                    &[],
                );
            }
        }
        Ok(())
    }
}
