//! Cubemap capture engine
//!
//! Renders a scene into all six faces of a cube image in a single pass
//! using a multiview render pass (view mask covering six layers), then
//! post-processes the results into sampled cubemaps:
//!
//! - the base environment capture gets a full mip chain generated by
//!   blitting the rendered level down the chain,
//! - the irradiance convolution is a single low-resolution copy,
//! - the prefiltered specular map is rendered once per mip level with a
//!   per-level roughness value in a dynamic-offset uniform slot, then
//!   merged level-for-level.
//!
//! Swapped-out images land in a deferred destroy queue that is flushed
//! only after the recording command buffer has completed on the GPU.

use ash::{vk, Device};
use std::mem;
use std::sync::Arc;

use crate::foundation::math::{Mat4, Point3, Vec3};
use crate::render::material::{Material, MaterialArena};
use crate::render::model::Model;
use crate::render::object::RenderObject;
use crate::render::texture::Texture;
use crate::render::vulkan::image::{self as gpu_image, AllocatedImage, LayoutTransition};
use crate::render::vulkan::{
    AllocatedBuffer, MemoryClass, VulkanContext, VulkanError, VulkanResult,
};

/// Color format of every capture target
pub const CAPTURE_FORMAT: vk::Format = vk::Format::R16G16B16A16_SFLOAT;

/// Resolution of the environment and prefilter captures
pub const CAPTURE_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 512,
    height: 512,
};

/// Resolution of the irradiance convolution
pub const IRRADIANCE_EXTENT: vk::Extent2D = vk::Extent2D {
    width: 32,
    height: 32,
};

/// All six cube faces rendered by one multiview draw
const CUBE_VIEW_MASK: u32 = 0b0011_1111;

/// Cube camera: one 90 degree projection and six face view matrices
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuCubeCamera {
    pub projection: [[f32; 4]; 4],
    pub views: [[[f32; 4]; 4]; 6],
}

unsafe impl bytemuck::Pod for GpuCubeCamera {}
unsafe impl bytemuck::Zeroable for GpuCubeCamera {}

/// Per-mip roughness written into a dynamic-offset uniform slot
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct GpuPrefilterData {
    pub roughness: f32,
}

unsafe impl bytemuck::Pod for GpuPrefilterData {}
unsafe impl bytemuck::Zeroable for GpuPrefilterData {}

/// Roughness assigned to prefilter mip `level` of a `mip_count`-level chain
pub fn prefilter_roughness(level: u32, mip_count: u32) -> f32 {
    if mip_count <= 1 {
        0.0
    } else {
        level as f32 / (mip_count - 1) as f32
    }
}

/// The six face view matrices, looking out from the origin
///
/// Up vectors are chosen per face to avoid degenerate cross products at
/// the poles: -Y for the X and Z faces, +Z/-Z for the Y faces.
pub fn cube_face_views() -> [Mat4; 6] {
    let origin = Point3::new(0.0, 0.0, 0.0);
    let look = |target: Vec3, up: Vec3| {
        Mat4::look_at_rh(&origin, &Point3::new(target.x, target.y, target.z), &up)
    };

    [
        look(Vec3::new(1.0, 0.0, 0.0), Vec3::new(0.0, -1.0, 0.0)),
        look(Vec3::new(-1.0, 0.0, 0.0), Vec3::new(0.0, -1.0, 0.0)),
        look(Vec3::new(0.0, 1.0, 0.0), Vec3::new(0.0, 0.0, 1.0)),
        look(Vec3::new(0.0, -1.0, 0.0), Vec3::new(0.0, 0.0, -1.0)),
        look(Vec3::new(0.0, 0.0, 1.0), Vec3::new(0.0, -1.0, 0.0)),
        look(Vec3::new(0.0, 0.0, -1.0), Vec3::new(0.0, -1.0, 0.0)),
    ]
}

/// Deferred destruction list for swapped-out capture images and views
///
/// Entries accumulate while a conversion is recorded and are destroyed
/// only after the command buffer referencing the replacement images has
/// completed. Flushing an empty queue is a no-op.
#[derive(Default)]
pub struct DestroyQueue {
    images: Vec<AllocatedImage>,
    views: Vec<vk::ImageView>,
}

impl DestroyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an image/view pair for destruction
    pub fn retire(&mut self, image: AllocatedImage, view: vk::ImageView) {
        self.images.push(image);
        self.views.push(view);
    }

    /// Queue additional views (per-mip views of a retired image)
    pub fn retire_views(&mut self, views: impl IntoIterator<Item = vk::ImageView>) {
        self.views.extend(views);
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.views.is_empty()
    }

    /// Number of queued (image, view) retirements
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Remove and return everything queued, leaving the queue empty
    pub fn take(&mut self) -> (Vec<AllocatedImage>, Vec<vk::ImageView>) {
        (
            mem::take(&mut self.images),
            mem::take(&mut self.views),
        )
    }

    /// Destroy everything queued; callers must guarantee the GPU is done
    /// with the resources
    pub fn flush(&mut self, device: &Device) {
        let (images, views) = self.take();
        for image in images {
            image.destroy(device);
        }
        for view in views {
            unsafe {
                device.destroy_image_view(view, None);
            }
        }
    }
}

/// Shader binaries used by the capture passes
#[derive(Debug, Clone)]
pub struct CaptureShaders {
    /// Vertex shader shared by every capture pass
    pub cubemap_vert: String,
    /// Irradiance convolution fragment shader
    pub irradiance_frag: String,
    /// Prefiltered specular fragment shader
    pub prefilter_frag: String,
}

/// Offscreen multiview capture engine producing the IBL cubemaps
pub struct CubemapCapture {
    device: Device,
    mip_levels: u32,

    render_pass: vk::RenderPass,

    capture_image: AllocatedImage,
    capture_view: vk::ImageView,
    capture_framebuffer: vk::Framebuffer,

    irradiance_image: AllocatedImage,
    irradiance_view: vk::ImageView,
    irradiance_framebuffer: vk::Framebuffer,

    prefilter_image: AllocatedImage,
    prefilter_view: vk::ImageView,
    prefilter_mip_views: Vec<vk::ImageView>,
    prefilter_framebuffers: Vec<vk::Framebuffer>,

    set_layout: vk::DescriptorSetLayout,
    descriptor_set: vk::DescriptorSet,
    camera_buffer: AllocatedBuffer,
    prefilter_buffer: AllocatedBuffer,
    prefilter_stride: vk::DeviceSize,
    prefilter_index: u32,

    cube_model: Arc<Model>,
    shaders: CaptureShaders,
    irradiance_material: Option<Material>,
    prefilter_material: Option<Material>,

    destroy_queue: DestroyQueue,
}

impl CubemapCapture {
    /// Allocate capture targets, the multiview render pass, and the fixed
    /// cube camera descriptor
    pub fn new(
        context: &VulkanContext,
        cube_model: Arc<Model>,
        shaders: CaptureShaders,
    ) -> VulkanResult<Self> {
        let device = context.device().clone();
        let mip_levels = gpu_image::mip_levels(CAPTURE_EXTENT.width, CAPTURE_EXTENT.height);

        // Render targets: single-mip capture and irradiance cubes, and a
        // full-chain prefilter cube rendered one mip at a time
        let render_usage =
            vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;

        let capture_info =
            gpu_image::cube_image_create_info(CAPTURE_FORMAT, render_usage, CAPTURE_EXTENT, 1);
        let capture_image = context.create_image(&capture_info, MemoryClass::GpuOnly)?;
        let capture_view =
            gpu_image::create_cube_view(&device, capture_image.image, CAPTURE_FORMAT, 1, 0)
                .map_err(VulkanError::Api)?;

        let irradiance_info =
            gpu_image::cube_image_create_info(CAPTURE_FORMAT, render_usage, IRRADIANCE_EXTENT, 1);
        let irradiance_image = context.create_image(&irradiance_info, MemoryClass::GpuOnly)?;
        let irradiance_view =
            gpu_image::create_cube_view(&device, irradiance_image.image, CAPTURE_FORMAT, 1, 0)
                .map_err(VulkanError::Api)?;

        let prefilter_info = gpu_image::cube_image_create_info(
            CAPTURE_FORMAT,
            render_usage,
            CAPTURE_EXTENT,
            mip_levels,
        );
        let prefilter_image = context.create_image(&prefilter_info, MemoryClass::GpuOnly)?;
        let prefilter_mip_views = (0..mip_levels)
            .map(|level| {
                gpu_image::create_cube_view(
                    &device,
                    prefilter_image.image,
                    CAPTURE_FORMAT,
                    1,
                    level,
                )
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(VulkanError::Api)?;

        let render_pass = Self::create_render_pass(&device)?;

        let capture_framebuffer =
            Self::create_framebuffer(&device, render_pass, capture_view, CAPTURE_EXTENT)?;
        let irradiance_framebuffer =
            Self::create_framebuffer(&device, render_pass, irradiance_view, IRRADIANCE_EXTENT)?;
        let prefilter_framebuffers = (0..mip_levels)
            .map(|level| {
                Self::create_framebuffer(
                    &device,
                    render_pass,
                    prefilter_mip_views[level as usize],
                    gpu_image::mip_extent(CAPTURE_EXTENT, level),
                )
            })
            .collect::<VulkanResult<Vec<_>>>()?;

        let (set_layout, descriptor_set, camera_buffer, prefilter_buffer, prefilter_stride) =
            Self::create_descriptor(context, mip_levels)?;

        Ok(Self {
            device,
            mip_levels,
            render_pass,
            capture_image,
            capture_view,
            capture_framebuffer,
            irradiance_image,
            irradiance_view,
            irradiance_framebuffer,
            prefilter_image,
            prefilter_view: vk::ImageView::null(),
            prefilter_mip_views,
            prefilter_framebuffers,
            set_layout,
            descriptor_set,
            camera_buffer,
            prefilter_buffer,
            prefilter_stride,
            prefilter_index: 0,
            cube_model,
            shaders,
            irradiance_material: None,
            prefilter_material: None,
            destroy_queue: DestroyQueue::new(),
        })
    }

    fn create_render_pass(device: &Device) -> VulkanResult<vk::RenderPass> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(CAPTURE_FORMAT)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .build();

        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let color_refs = [color_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .build();

        let dependency = vk::SubpassDependency::builder()
            .src_subpass(vk::SUBPASS_EXTERNAL)
            .dst_subpass(0)
            .src_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .src_access_mask(vk::AccessFlags::empty())
            .dst_stage_mask(
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                    | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            )
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .build();

        // One subpass replicated across the six cube faces
        let view_masks = [CUBE_VIEW_MASK];
        let correlation_masks = [0u32];
        let mut multiview_info = vk::RenderPassMultiviewCreateInfo::builder()
            .view_masks(&view_masks)
            .correlation_masks(&correlation_masks);

        let attachments = [color_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies)
            .push_next(&mut multiview_info);

        unsafe {
            device
                .create_render_pass(&render_pass_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_framebuffer(
        device: &Device,
        render_pass: vk::RenderPass,
        view: vk::ImageView,
        extent: vk::Extent2D,
    ) -> VulkanResult<vk::Framebuffer> {
        let attachments = [view];
        let framebuffer_info = vk::FramebufferCreateInfo::builder()
            .render_pass(render_pass)
            .attachments(&attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);

        unsafe {
            device
                .create_framebuffer(&framebuffer_info, None)
                .map_err(VulkanError::Api)
        }
    }

    fn create_descriptor(
        context: &VulkanContext,
        mip_levels: u32,
    ) -> VulkanResult<(
        vk::DescriptorSetLayout,
        vk::DescriptorSet,
        AllocatedBuffer,
        AllocatedBuffer,
        vk::DeviceSize,
    )> {
        let device = context.device();

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);
        let set_layout = unsafe {
            device
                .create_descriptor_set_layout(&layout_info, None)
                .map_err(VulkanError::Api)?
        };

        let camera_size =
            context.pad_uniform_buffer_size(mem::size_of::<GpuCubeCamera>() as vk::DeviceSize);
        let camera_buffer = context.create_buffer(
            camera_size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryClass::CpuToGpu,
        )?;

        let prefilter_stride =
            context.pad_uniform_buffer_size(mem::size_of::<GpuPrefilterData>() as vk::DeviceSize);
        let prefilter_buffer = context.create_buffer(
            prefilter_stride * mip_levels as vk::DeviceSize,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            MemoryClass::CpuToGpu,
        )?;

        let descriptor_set = context.allocate_descriptor_set(set_layout)?;

        let camera_info = vk::DescriptorBufferInfo {
            buffer: camera_buffer.buffer,
            offset: 0,
            range: mem::size_of::<GpuCubeCamera>() as vk::DeviceSize,
        };
        let prefilter_info = vk::DescriptorBufferInfo {
            buffer: prefilter_buffer.buffer,
            offset: 0,
            range: mem::size_of::<GpuPrefilterData>() as vk::DeviceSize,
        };

        let writes = [
            vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .buffer_info(std::slice::from_ref(&camera_info))
                .build(),
            vk::WriteDescriptorSet::builder()
                .dst_set(descriptor_set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .buffer_info(std::slice::from_ref(&prefilter_info))
                .build(),
        ];
        unsafe {
            device.update_descriptor_sets(&writes, &[]);
        }

        // The cube camera never changes: 90 degree FOV, unit aspect,
        // one view per face
        let projection =
            nalgebra::Perspective3::new(1.0, 90.0_f32.to_radians(), 0.1, 10.0).to_homogeneous();
        let views = cube_face_views();
        let camera_data = GpuCubeCamera {
            projection: projection.into(),
            views: [
                views[0].into(),
                views[1].into(),
                views[2].into(),
                views[3].into(),
                views[4].into(),
                views[5].into(),
            ],
        };
        context.write_buffer(&camera_buffer, 0, bytemuck::bytes_of(&camera_data))?;

        Ok((
            set_layout,
            descriptor_set,
            camera_buffer,
            prefilter_buffer,
            prefilter_stride,
        ))
    }

    /// Capture the given objects into the environment cube, then derive
    /// the irradiance and prefiltered specular cubes
    ///
    /// Records every pass and conversion into one blocking one-shot
    /// command sequence; retired images are destroyed after it completes.
    pub fn capture(
        &mut self,
        context: &VulkanContext,
        objects: &[RenderObject],
        materials: &mut MaterialArena,
    ) -> VulkanResult<()> {
        log::info!(
            "Capturing environment cubemap ({}x{}, {} mips)",
            CAPTURE_EXTENT.width,
            CAPTURE_EXTENT.height,
            self.mip_levels
        );

        let command_buffer = context.begin_single_time_commands()?;

        self.capture_environment(context, command_buffer, objects, materials)?;
        self.capture_irradiance(context, command_buffer)?;
        self.capture_prefilter(context, command_buffer)?;

        context.end_single_time_commands(command_buffer)?;

        // The command buffer has completed; the swapped-out generation is
        // safe to destroy
        self.destroy_queue.flush(&self.device);
        Ok(())
    }

    fn begin_pass(
        &self,
        command_buffer: vk::CommandBuffer,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) {
        let clear_value = vk::ClearValue {
            color: vk::ClearColorValue {
                float32: [0.0, 0.0, 0.0, 1.0],
            },
        };
        let clear_values = [clear_value];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(&clear_values);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };

        unsafe {
            self.device.cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            self.device.cmd_set_viewport(command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(command_buffer, 0, &[scissor]);
        }
    }

    fn bind_capture_set(
        &self,
        command_buffer: vk::CommandBuffer,
        pipeline_layout: vk::PipelineLayout,
    ) {
        let offsets = [(self.prefilter_stride * self.prefilter_index as vk::DeviceSize) as u32];
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline_layout,
                0,
                &[self.descriptor_set],
                &offsets,
            );
        }
    }

    /// Render the scene objects into the capture framebuffer
    fn record_objects(
        &self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
        objects: &[RenderObject],
        materials: &mut MaterialArena,
    ) -> VulkanResult<()> {
        self.begin_pass(command_buffer, self.capture_framebuffer, CAPTURE_EXTENT);

        let set_layouts = [self.set_layout];
        for (index, object) in objects.iter().enumerate() {
            let material = materials
                .get_mut(object.material)
                .ok_or_else(|| VulkanError::InvalidOperation {
                    reason: "render object references a removed material".to_string(),
                })?;

            if !material.is_ready() {
                material.setup(context, &set_layouts, self.render_pass)?;
            }
            self.bind_capture_set(command_buffer, material.pipeline_layout()?);
            material.bind(command_buffer)?;
            object.model.bind(command_buffer);
            object.model.draw(command_buffer, index as u32);
        }

        unsafe {
            self.device.cmd_end_render_pass(command_buffer);
        }
        Ok(())
    }

    /// Render the unit cube with an engine-internal material
    fn record_cube(
        &self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
        material: &mut Material,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    ) -> VulkanResult<()> {
        self.begin_pass(command_buffer, framebuffer, extent);

        let set_layouts = [self.set_layout];
        if !material.is_ready() {
            material.setup(context, &set_layouts, self.render_pass)?;
        }
        self.bind_capture_set(command_buffer, material.pipeline_layout()?);
        material.bind(command_buffer)?;
        self.cube_model.bind(command_buffer);
        self.cube_model.draw(command_buffer, 0);

        unsafe {
            self.device.cmd_end_render_pass(command_buffer);
        }
        Ok(())
    }

    /// Render the environment and expand it into a full mip chain
    fn capture_environment(
        &mut self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
        objects: &[RenderObject],
        materials: &mut MaterialArena,
    ) -> VulkanResult<()> {
        self.record_objects(context, command_buffer, objects, materials)?;

        // Rendered single-mip cube becomes the blit source
        gpu_image::transition_image_layout(
            &self.device,
            command_buffer,
            self.capture_image.image,
            LayoutTransition::color_attachment_to_transfer_src(),
            gpu_image::color_subresource_range(1, 6),
        );

        let new_info = gpu_image::cube_image_create_info(
            CAPTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            CAPTURE_EXTENT,
            self.mip_levels,
        );
        let new_image = context.create_image(&new_info, MemoryClass::GpuOnly)?;

        gpu_image::transition_image_layout(
            &self.device,
            command_buffer,
            new_image.image,
            LayoutTransition::undefined_to_transfer_dst(),
            gpu_image::color_subresource_range(self.mip_levels, 6),
        );

        // Each destination level is downsampled from the rendered base level
        gpu_image::blit_mip_chain(
            &self.device,
            command_buffer,
            self.capture_image.image,
            new_image.image,
            CAPTURE_EXTENT,
            self.mip_levels,
            6,
        );

        gpu_image::transition_image_layout(
            &self.device,
            command_buffer,
            new_image.image,
            LayoutTransition::transfer_dst_to_shader_read(),
            gpu_image::color_subresource_range(self.mip_levels, 6),
        );

        let new_view = gpu_image::create_cube_view(
            &self.device,
            new_image.image,
            CAPTURE_FORMAT,
            self.mip_levels,
            0,
        )
        .map_err(VulkanError::Api)?;

        self.destroy_queue.retire(self.capture_image, self.capture_view);
        self.capture_image = new_image;
        self.capture_view = new_view;
        Ok(())
    }

    /// Convolve the environment into the irradiance cube
    fn capture_irradiance(
        &mut self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
    ) -> VulkanResult<()> {
        let environment = Arc::new(Texture::from_view(
            context,
            self.capture_view,
            self.mip_levels,
        ));
        let mut material = Material::new(&self.shaders.cubemap_vert, &self.shaders.irradiance_frag);
        material.add_texture(environment);

        self.record_cube(
            context,
            command_buffer,
            &mut material,
            self.irradiance_framebuffer,
            IRRADIANCE_EXTENT,
        )?;

        let (new_image, new_view) = self.convert_to_sampled(
            context,
            command_buffer,
            self.irradiance_image.image,
            IRRADIANCE_EXTENT,
            1,
        )?;

        self.destroy_queue
            .retire(self.irradiance_image, self.irradiance_view);
        self.irradiance_image = new_image;
        self.irradiance_view = new_view;

        // The material's descriptor set references the environment view;
        // keep it alive alongside the engine
        self.irradiance_material = Some(material);
        Ok(())
    }

    /// Render the prefiltered specular chain, one roughness per mip
    fn capture_prefilter(
        &mut self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
    ) -> VulkanResult<()> {
        let environment = Arc::new(Texture::from_view(
            context,
            self.capture_view,
            self.mip_levels,
        ));
        let mut material = Material::new(&self.shaders.cubemap_vert, &self.shaders.prefilter_frag);
        material.add_texture(environment);

        for level in 0..self.mip_levels {
            let data = GpuPrefilterData {
                roughness: prefilter_roughness(level, self.mip_levels),
            };
            context.write_buffer(
                &self.prefilter_buffer,
                self.prefilter_stride * level as vk::DeviceSize,
                bytemuck::bytes_of(&data),
            )?;

            self.prefilter_index = level;
            self.record_cube(
                context,
                command_buffer,
                &mut material,
                self.prefilter_framebuffers[level as usize],
                gpu_image::mip_extent(CAPTURE_EXTENT, level),
            )?;
        }
        self.prefilter_index = 0;

        // Every level was rendered individually; merge them 1:1 instead of
        // downsampling level 0
        let (new_image, new_view) = self.convert_to_sampled(
            context,
            command_buffer,
            self.prefilter_image.image,
            CAPTURE_EXTENT,
            self.mip_levels,
        )?;

        let old_views = mem::take(&mut self.prefilter_mip_views);
        self.destroy_queue.retire(self.prefilter_image, self.prefilter_view);
        self.destroy_queue.retire_views(old_views);
        self.prefilter_image = new_image;
        self.prefilter_view = new_view;

        self.prefilter_material = Some(material);
        Ok(())
    }

    /// Copy a rendered cube into a new SAMPLED-usage image, level for level
    fn convert_to_sampled(
        &self,
        context: &VulkanContext,
        command_buffer: vk::CommandBuffer,
        rendered: vk::Image,
        extent: vk::Extent2D,
        mip_levels: u32,
    ) -> VulkanResult<(AllocatedImage, vk::ImageView)> {
        gpu_image::transition_image_layout(
            &self.device,
            command_buffer,
            rendered,
            LayoutTransition::color_attachment_to_transfer_src(),
            gpu_image::color_subresource_range(mip_levels, 6),
        );

        let new_info = gpu_image::cube_image_create_info(
            CAPTURE_FORMAT,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            extent,
            mip_levels,
        );
        let new_image = context.create_image(&new_info, MemoryClass::GpuOnly)?;

        gpu_image::transition_image_layout(
            &self.device,
            command_buffer,
            new_image.image,
            LayoutTransition::undefined_to_transfer_dst(),
            gpu_image::color_subresource_range(mip_levels, 6),
        );

        gpu_image::copy_mip_levels(
            &self.device,
            command_buffer,
            rendered,
            new_image.image,
            extent,
            mip_levels,
            6,
        );

        gpu_image::transition_image_layout(
            &self.device,
            command_buffer,
            new_image.image,
            LayoutTransition::transfer_dst_to_shader_read(),
            gpu_image::color_subresource_range(mip_levels, 6),
        );

        let new_view = gpu_image::create_cube_view(
            &self.device,
            new_image.image,
            CAPTURE_FORMAT,
            mip_levels,
            0,
        )
        .map_err(VulkanError::Api)?;

        Ok((new_image, new_view))
    }

    /// Sampled view of the environment cube (valid after capture)
    pub fn capture_view(&self) -> vk::ImageView {
        self.capture_view
    }

    /// Sampled view of the irradiance cube (valid after capture)
    pub fn irradiance_view(&self) -> vk::ImageView {
        self.irradiance_view
    }

    /// Sampled view of the prefiltered specular cube (valid after capture)
    pub fn prefilter_view(&self) -> vk::ImageView {
        self.prefilter_view
    }

    /// Mip levels in the environment and prefilter chains
    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }
}

impl Drop for CubemapCapture {
    fn drop(&mut self) {
        // Anything still queued was produced by a completed command buffer
        self.destroy_queue.flush(&self.device);

        unsafe {
            self.device
                .destroy_framebuffer(self.capture_framebuffer, None);
            self.device
                .destroy_framebuffer(self.irradiance_framebuffer, None);
            for &framebuffer in &self.prefilter_framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }

            self.device.destroy_image_view(self.capture_view, None);
            self.device.destroy_image_view(self.irradiance_view, None);
            if self.prefilter_view != vk::ImageView::null() {
                self.device.destroy_image_view(self.prefilter_view, None);
            }
            for &view in &self.prefilter_mip_views {
                self.device.destroy_image_view(view, None);
            }

            self.device.destroy_render_pass(self.render_pass, None);
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }

        self.capture_image.destroy(&self.device);
        self.irradiance_image.destroy(&self.device);
        self.prefilter_image.destroy(&self.device);
        self.camera_buffer.destroy(&self.device);
        self.prefilter_buffer.destroy(&self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn face_views_map_forward_to_negative_z() {
        let directions = [
            Vec3::new(1.0, 0.0, 0.0),
            Vec3::new(-1.0, 0.0, 0.0),
            Vec3::new(0.0, 1.0, 0.0),
            Vec3::new(0.0, -1.0, 0.0),
            Vec3::new(0.0, 0.0, 1.0),
            Vec3::new(0.0, 0.0, -1.0),
        ];

        for (view, direction) in cube_face_views().iter().zip(directions.iter()) {
            let mapped = view * Vector4::new(direction.x, direction.y, direction.z, 0.0);
            assert_relative_eq!(mapped.x, 0.0, epsilon = 1e-6);
            assert_relative_eq!(mapped.y, 0.0, epsilon = 1e-6);
            assert_relative_eq!(mapped.z, -1.0, epsilon = 1e-6);
        }
    }

    #[test]
    fn face_views_are_distinct() {
        let views = cube_face_views();
        for i in 0..views.len() {
            for j in (i + 1)..views.len() {
                assert_ne!(views[i], views[j]);
            }
        }
    }

    #[test]
    fn prefilter_roughness_spans_zero_to_one() {
        let mips = 10;
        assert_relative_eq!(prefilter_roughness(0, mips), 0.0);
        assert_relative_eq!(prefilter_roughness(9, mips), 1.0);
        for level in 0..mips {
            assert_relative_eq!(
                prefilter_roughness(level, mips),
                level as f32 / 9.0
            );
        }
    }

    #[test]
    fn prefilter_roughness_single_mip_is_zero() {
        assert_relative_eq!(prefilter_roughness(0, 1), 0.0);
    }

    #[test]
    fn capture_target_has_ten_mips_at_512() {
        let mips = gpu_image::mip_levels(CAPTURE_EXTENT.width, CAPTURE_EXTENT.height);
        assert_eq!(mips, 10);

        let info = gpu_image::cube_image_create_info(
            CAPTURE_FORMAT,
            vk::ImageUsageFlags::SAMPLED,
            CAPTURE_EXTENT,
            mips,
        );
        assert_eq!(info.array_layers, 6);
        assert_eq!(info.mip_levels, 10);
        assert_eq!(info.format, vk::Format::R16G16B16A16_SFLOAT);
    }

    #[test]
    fn destroy_queue_holds_one_pair_per_retired_target() {
        let mut queue = DestroyQueue::new();
        assert!(queue.is_empty());

        let dummy_image = AllocatedImage {
            image: vk::Image::null(),
            memory: vk::DeviceMemory::null(),
        };

        // One conversion per capture target
        queue.retire(dummy_image, vk::ImageView::null());
        queue.retire(dummy_image, vk::ImageView::null());
        queue.retire(dummy_image, vk::ImageView::null());
        assert_eq!(queue.image_count(), 3);

        // Per-mip views of the prefilter target ride along
        queue.retire_views((0..10).map(|_| vk::ImageView::null()));

        let (images, views) = queue.take();
        assert_eq!(images.len(), 3);
        assert_eq!(views.len(), 13);
        assert!(queue.is_empty());

        // Draining again yields nothing; a second cleanup is a no-op
        let (images, views) = queue.take();
        assert!(images.is_empty());
        assert!(views.is_empty());
    }
}
