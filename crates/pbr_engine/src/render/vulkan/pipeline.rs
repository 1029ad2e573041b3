//! Shader and pipeline management
//!
//! SPIR-V shader loading and graphics/compute pipeline construction
//! following RAII patterns.

use ash::{vk, Device};
use std::ffi::CStr;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::render::model::Vertex;
use crate::render::vulkan::{VulkanError, VulkanResult};

/// Shader module wrapper with RAII cleanup
pub struct ShaderModule {
    device: Device,
    module: vk::ShaderModule,
}

impl ShaderModule {
    /// Create shader module from SPIR-V bytecode
    pub fn from_bytes(device: Device, path: &str, bytes: &[u8]) -> VulkanResult<Self> {
        // SPIR-V words are u32-aligned
        let (prefix, words, suffix) = unsafe { bytes.align_to::<u32>() };
        if !prefix.is_empty() || !suffix.is_empty() {
            return Err(VulkanError::ShaderLoad {
                path: path.to_string(),
                reason: "SPIR-V bytecode is not properly aligned".to_string(),
            });
        }

        let create_info = vk::ShaderModuleCreateInfo::builder().code(words);

        let module = unsafe {
            device
                .create_shader_module(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        Ok(Self { device, module })
    }

    /// Load shader from a SPIR-V file
    pub fn from_file<P: AsRef<Path>>(device: Device, path: P) -> VulkanResult<Self> {
        let path_display = path.as_ref().display().to_string();
        let mut file = File::open(&path).map_err(|e| VulkanError::ShaderLoad {
            path: path_display.clone(),
            reason: e.to_string(),
        })?;

        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .map_err(|e| VulkanError::ShaderLoad {
                path: path_display.clone(),
                reason: e.to_string(),
            })?;

        Self::from_bytes(device, &path_display, &bytes)
    }

    /// Get shader module handle
    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_shader_module(self.module, None);
        }
    }
}

/// Fixed-function state for graphics pipeline construction
pub struct PipelineConfig {
    pub depth_compare_op: vk::CompareOp,
    pub cull_mode: vk::CullModeFlags,
    pub pipeline_layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    pub subpass: u32,
}

impl PipelineConfig {
    /// Default configuration: depth LESS, back-face culling, subpass 0
    pub fn new(pipeline_layout: vk::PipelineLayout, render_pass: vk::RenderPass) -> Self {
        Self {
            depth_compare_op: vk::CompareOp::LESS,
            cull_mode: vk::CullModeFlags::BACK,
            pipeline_layout,
            render_pass,
            subpass: 0,
        }
    }
}

/// Graphics or compute pipeline wrapper with RAII cleanup
pub struct Pipeline {
    device: Device,
    pipeline: vk::Pipeline,
    bind_point: vk::PipelineBindPoint,
}

const SHADER_ENTRY: &CStr = unsafe { CStr::from_bytes_with_nul_unchecked(b"main\0") };

impl Pipeline {
    /// Build a graphics pipeline from vertex/fragment SPIR-V files
    pub fn graphics(
        device: Device,
        vert_path: &str,
        frag_path: &str,
        config: &PipelineConfig,
    ) -> VulkanResult<Self> {
        let vert_module = ShaderModule::from_file(device.clone(), vert_path)?;
        let frag_module = ShaderModule::from_file(device.clone(), frag_path)?;

        let shader_stages = [
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module.handle())
                .name(SHADER_ENTRY)
                .build(),
            vk::PipelineShaderStageCreateInfo::builder()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module.handle())
                .name(SHADER_ENTRY)
                .build(),
        ];

        let binding_descriptions = Vertex::binding_descriptions();
        let attribute_descriptions = Vertex::attribute_descriptions();
        let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder()
            .vertex_binding_descriptions(&binding_descriptions)
            .vertex_attribute_descriptions(&attribute_descriptions);

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
            .primitive_restart_enable(false);

        // Viewport and scissor are dynamic state, only counts are fixed
        let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
            .viewport_count(1)
            .scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::builder()
            .depth_clamp_enable(false)
            .rasterizer_discard_enable(false)
            .polygon_mode(vk::PolygonMode::FILL)
            .line_width(1.0)
            .cull_mode(config.cull_mode)
            .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
            .depth_bias_enable(false);

        let multisample = vk::PipelineMultisampleStateCreateInfo::builder()
            .sample_shading_enable(false)
            .rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
            .color_write_mask(vk::ColorComponentFlags::RGBA)
            .blend_enable(false)
            .build();
        let attachments = [color_blend_attachment];
        let color_blend = vk::PipelineColorBlendStateCreateInfo::builder()
            .logic_op_enable(false)
            .attachments(&attachments);

        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
            .depth_test_enable(true)
            .depth_write_enable(true)
            .depth_compare_op(config.depth_compare_op)
            .depth_bounds_test_enable(false)
            .stencil_test_enable(false);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state =
            vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

        let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
            .stages(&shader_stages)
            .vertex_input_state(&vertex_input_info)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .depth_stencil_state(&depth_stencil)
            .dynamic_state(&dynamic_state)
            .layout(config.pipeline_layout)
            .render_pass(config.render_pass)
            .subpass(config.subpass);

        let pipelines = unsafe {
            device
                .create_graphics_pipelines(
                    vk::PipelineCache::null(),
                    &[pipeline_info.build()],
                    None,
                )
                .map_err(|(_, e)| VulkanError::Api(e))?
        };

        Ok(Self {
            device,
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::GRAPHICS,
        })
    }

    /// Build a compute pipeline from a compute SPIR-V file
    pub fn compute(
        device: Device,
        comp_path: &str,
        pipeline_layout: vk::PipelineLayout,
    ) -> VulkanResult<Self> {
        let comp_module = ShaderModule::from_file(device.clone(), comp_path)?;

        let stage = vk::PipelineShaderStageCreateInfo::builder()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(comp_module.handle())
            .name(SHADER_ENTRY)
            .build();

        let pipeline_info = vk::ComputePipelineCreateInfo::builder()
            .stage(stage)
            .layout(pipeline_layout);

        let pipelines = unsafe {
            device
                .create_compute_pipelines(
                    vk::PipelineCache::null(),
                    &[pipeline_info.build()],
                    None,
                )
                .map_err(|(_, e)| VulkanError::Api(e))?
        };

        Ok(Self {
            device,
            pipeline: pipelines[0],
            bind_point: vk::PipelineBindPoint::COMPUTE,
        })
    }

    /// Bind the pipeline for subsequent draw or dispatch commands
    pub fn bind(&self, command_buffer: vk::CommandBuffer) {
        unsafe {
            self.device
                .cmd_bind_pipeline(command_buffer, self.bind_point, self.pipeline);
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
        }
    }
}
