//! Vulkan swapchain management
//!
//! Owns the swapchain images, depth buffers, main render pass,
//! framebuffers, and the per-frame synchronization objects. Handles
//! acquisition and submission/presentation, surfacing out-of-date and
//! suboptimal conditions to the renderer for recreation.

use ash::extensions::khr::Swapchain as SwapchainLoader;
use ash::{vk, Device};

use crate::render::vulkan::image::{self, AllocatedImage};
use crate::render::vulkan::{MemoryClass, VulkanContext, VulkanError, VulkanResult};

/// Maximum number of frames the CPU may record ahead of the GPU
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Result of a swapchain image acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAcquire {
    /// An image was acquired at the given index
    Acquired(u32),
    /// The swapchain is out of date and must be recreated
    OutOfDate,
}

/// Result of a submit-and-present call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    /// The frame was presented
    Presented,
    /// The swapchain is out of date or suboptimal and should be recreated
    NeedsRecreate,
}

/// Swapchain wrapper with depth attachments and frame synchronization
pub struct Swapchain {
    device: Device,
    loader: SwapchainLoader,
    swapchain: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    image_views: Vec<vk::ImageView>,
    depth_images: Vec<AllocatedImage>,
    depth_image_views: Vec<vk::ImageView>,
    depth_format: vk::Format,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    format: vk::SurfaceFormatKHR,
    extent: vk::Extent2D,

    image_available: Vec<vk::Semaphore>,
    render_finished: Vec<vk::Semaphore>,
    in_flight_fences: Vec<vk::Fence>,
    images_in_flight: Vec<vk::Fence>,
    current_frame: usize,
}

impl Swapchain {
    /// Create a swapchain, optionally chaining an old swapchain handle
    pub fn new(
        context: &VulkanContext,
        window_extent: vk::Extent2D,
        old_swapchain: vk::SwapchainKHR,
    ) -> VulkanResult<Self> {
        let device = context.device().clone();
        let loader = SwapchainLoader::new(context.instance(), &device);

        let support = context.swapchain_support()?;

        let format = support
            .formats
            .iter()
            .find(|sf| {
                sf.format == vk::Format::B8G8R8A8_SRGB
                    && sf.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
            })
            .copied()
            .unwrap_or(support.formats[0]);

        let present_mode = support
            .present_modes
            .iter()
            .copied()
            .find(|&mode| mode == vk::PresentModeKHR::MAILBOX)
            .unwrap_or(vk::PresentModeKHR::FIFO);

        let extent = if support.capabilities.current_extent.width != u32::MAX {
            support.capabilities.current_extent
        } else {
            vk::Extent2D {
                width: window_extent.width.clamp(
                    support.capabilities.min_image_extent.width,
                    support.capabilities.max_image_extent.width,
                ),
                height: window_extent.height.clamp(
                    support.capabilities.min_image_extent.height,
                    support.capabilities.max_image_extent.height,
                ),
            }
        };

        let image_count = {
            let desired = support.capabilities.min_image_count + 1;
            if support.capabilities.max_image_count > 0 {
                desired.min(support.capabilities.max_image_count)
            } else {
                desired
            }
        };

        let queue_families = context.queue_families();
        let family_indices = [queue_families.graphics, queue_families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(context.surface())
            .min_image_count(image_count)
            .image_format(format.format)
            .image_color_space(format.color_space)
            .image_extent(extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(support.capabilities.current_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(present_mode)
            .clipped(true)
            .old_swapchain(old_swapchain);

        create_info = if queue_families.graphics != queue_families.present {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&family_indices)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe {
            loader
                .create_swapchain(&create_info, None)
                .map_err(VulkanError::Api)?
        };

        let images = unsafe {
            loader
                .get_swapchain_images(swapchain)
                .map_err(VulkanError::Api)?
        };

        let image_views = images
            .iter()
            .map(|&swap_image| {
                image::create_view_2d(
                    &device,
                    swap_image,
                    format.format,
                    vk::ImageAspectFlags::COLOR,
                    1,
                )
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(VulkanError::Api)?;

        let depth_format = context.find_supported_format(
            &[
                vk::Format::D32_SFLOAT,
                vk::Format::D32_SFLOAT_S8_UINT,
                vk::Format::D24_UNORM_S8_UINT,
            ],
            vk::ImageTiling::OPTIMAL,
            vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;

        let mut depth_images = Vec::with_capacity(images.len());
        let mut depth_image_views = Vec::with_capacity(images.len());
        for _ in 0..images.len() {
            let info = image::image_create_info_2d(
                depth_format,
                vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                extent,
                1,
            );
            let depth_image = context.create_image(&info, MemoryClass::GpuOnly)?;
            let view = image::create_view_2d(
                &device,
                depth_image.image,
                depth_format,
                vk::ImageAspectFlags::DEPTH,
                1,
            )
            .map_err(VulkanError::Api)?;
            depth_images.push(depth_image);
            depth_image_views.push(view);
        }

        let render_pass = Self::create_render_pass(&device, format.format, depth_format)?;

        let framebuffers = image_views
            .iter()
            .zip(depth_image_views.iter())
            .map(|(&color, &depth)| {
                let attachments = [color, depth];
                let framebuffer_info = vk::FramebufferCreateInfo::builder()
                    .render_pass(render_pass)
                    .attachments(&attachments)
                    .width(extent.width)
                    .height(extent.height)
                    .layers(1);
                unsafe { device.create_framebuffer(&framebuffer_info, None) }
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(VulkanError::Api)?;

        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED);

        let mut image_available = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut render_finished = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        let mut in_flight_fences = Vec::with_capacity(MAX_FRAMES_IN_FLIGHT);
        for _ in 0..MAX_FRAMES_IN_FLIGHT {
            unsafe {
                image_available.push(
                    device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(VulkanError::Api)?,
                );
                render_finished.push(
                    device
                        .create_semaphore(&semaphore_info, None)
                        .map_err(VulkanError::Api)?,
                );
                in_flight_fences.push(
                    device
                        .create_fence(&fence_info, None)
                        .map_err(VulkanError::Api)?,
                );
            }
        }

        let images_in_flight = vec![vk::Fence::null(); images.len()];

        log::debug!(
            "Created swapchain: {}x{}, {} images, format {:?}",
            extent.width,
            extent.height,
            images.len(),
            format.format
        );

        Ok(Self {
            device,
            loader,
            swapchain,
            images,
            image_views,
            depth_images,
            depth_image_views,
            depth_format,
            render_pass,
            framebuffers,
            format,
            extent,
            image_available,
            render_finished,
            in_flight_fences,
            images_in_flight,
            current_frame: 0,
        })
    }

    fn create_render_pass(
        device: &Device,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VulkanResult<vk::RenderPass> {
        let color_attachment = vk::AttachmentDescription::builder()
            .format(color_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .build();

        let depth_attachment = vk::AttachmentDescription::builder()
            .format(depth_format)
            .samples(vk::SampleCountFlags::TYPE_1)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
            .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .build();

        let color_ref = vk::AttachmentReference {
            attachment: 0,
            layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        };
        let depth_ref = vk::AttachmentReference {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        };

        let color_refs = [color_ref];
        let subpass = vk::SubpassDescription::builder()
            .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
            .color_attachments(&color_refs)
            .depth_stencil_attachment(&depth_ref)
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
            .dst_access_mask(
                vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            )
            .build();

        let attachments = [color_attachment, depth_attachment];
        let subpasses = [subpass];
        let dependencies = [dependency];
        let render_pass_info = vk::RenderPassCreateInfo::builder()
            .attachments(&attachments)
            .subpasses(&subpasses)
            .dependencies(&dependencies);

        unsafe {
            device
                .create_render_pass(&render_pass_info, None)
                .map_err(VulkanError::Api)
        }
    }

    /// Acquire the next swapchain image, waiting on the in-flight fence
    pub fn acquire_next_image(&mut self) -> VulkanResult<FrameAcquire> {
        unsafe {
            self.device
                .wait_for_fences(&[self.in_flight_fences[self.current_frame]], true, u64::MAX)
                .map_err(VulkanError::Api)?;

            match self.loader.acquire_next_image(
                self.swapchain,
                u64::MAX,
                self.image_available[self.current_frame],
                vk::Fence::null(),
            ) {
                Ok((index, _suboptimal)) => Ok(FrameAcquire::Acquired(index)),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(FrameAcquire::OutOfDate),
                Err(e) => Err(VulkanError::Api(e)),
            }
        }
    }

    /// Submit a recorded command buffer and present the image
    pub fn submit_and_present(
        &mut self,
        graphics_queue: vk::Queue,
        present_queue: vk::Queue,
        command_buffer: vk::CommandBuffer,
        image_index: u32,
    ) -> VulkanResult<PresentOutcome> {
        unsafe {
            // If a previous frame is still using this image, wait for it
            let image_fence = self.images_in_flight[image_index as usize];
            if image_fence != vk::Fence::null() {
                self.device
                    .wait_for_fences(&[image_fence], true, u64::MAX)
                    .map_err(VulkanError::Api)?;
            }
            self.images_in_flight[image_index as usize] =
                self.in_flight_fences[self.current_frame];

            let wait_semaphores = [self.image_available[self.current_frame]];
            let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
            let signal_semaphores = [self.render_finished[self.current_frame]];
            let command_buffers = [command_buffer];

            let submit_info = vk::SubmitInfo::builder()
                .wait_semaphores(&wait_semaphores)
                .wait_dst_stage_mask(&wait_stages)
                .command_buffers(&command_buffers)
                .signal_semaphores(&signal_semaphores);

            self.device
                .reset_fences(&[self.in_flight_fences[self.current_frame]])
                .map_err(VulkanError::Api)?;

            self.device
                .queue_submit(
                    graphics_queue,
                    &[submit_info.build()],
                    self.in_flight_fences[self.current_frame],
                )
                .map_err(VulkanError::Api)?;

            let swapchains = [self.swapchain];
            let image_indices = [image_index];
            let present_info = vk::PresentInfoKHR::builder()
                .wait_semaphores(&signal_semaphores)
                .swapchains(&swapchains)
                .image_indices(&image_indices);

            self.current_frame = (self.current_frame + 1) % MAX_FRAMES_IN_FLIGHT;

            match self.loader.queue_present(present_queue, &present_info) {
                Ok(false) => Ok(PresentOutcome::Presented),
                Ok(true) => Ok(PresentOutcome::NeedsRecreate),
                Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::NeedsRecreate),
                Err(e) => Err(VulkanError::Api(e)),
            }
        }
    }

    pub fn handle(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    pub fn framebuffer(&self, image_index: u32) -> vk::Framebuffer {
        self.framebuffers[image_index as usize]
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.extent.width as f32 / self.extent.height as f32
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        unsafe {
            for &semaphore in self.image_available.iter().chain(self.render_finished.iter()) {
                self.device.destroy_semaphore(semaphore, None);
            }
            for &fence in &self.in_flight_fences {
                self.device.destroy_fence(fence, None);
            }
            for &framebuffer in &self.framebuffers {
                self.device.destroy_framebuffer(framebuffer, None);
            }
            self.device.destroy_render_pass(self.render_pass, None);
            for &view in &self.depth_image_views {
                self.device.destroy_image_view(view, None);
            }
            for depth_image in &self.depth_images {
                depth_image.destroy(&self.device);
            }
            for &view in &self.image_views {
                self.device.destroy_image_view(view, None);
            }
            self.loader.destroy_swapchain(self.swapchain, None);
        }
    }
}
