//! Frame loop renderer
//!
//! Owns the swapchain and the per-image command buffers, drives frame
//! acquisition, render-pass bracketing, submission, and swapchain
//! recreation on resize or out-of-date presentation.

use ash::vk;

use crate::render::vulkan::{
    FrameAcquire, PresentOutcome, Swapchain, VulkanContext, VulkanError, VulkanResult,
};
use crate::render::window::Window;

/// Handle to an in-progress frame
#[derive(Debug, Clone, Copy)]
pub struct FrameContext {
    /// Command buffer recording this frame
    pub command_buffer: vk::CommandBuffer,
    /// Monotonic frame serial, used by the descriptor ring
    pub frame: u64,
}

/// Swapchain-driven frame loop
pub struct Renderer {
    swapchain: Swapchain,
    command_buffers: Vec<vk::CommandBuffer>,
    frame_started: bool,
    current_image: u32,
    frame_serial: u64,
}

impl Renderer {
    pub fn new(context: &VulkanContext, window: &Window) -> VulkanResult<Self> {
        let swapchain = Swapchain::new(context, window.extent(), vk::SwapchainKHR::null())?;
        let command_buffers =
            Self::allocate_command_buffers(context, swapchain.image_count() as u32)?;

        Ok(Self {
            swapchain,
            command_buffers,
            frame_started: false,
            current_image: 0,
            frame_serial: 0,
        })
    }

    fn allocate_command_buffers(
        context: &VulkanContext,
        count: u32,
    ) -> VulkanResult<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_pool(context.command_pool())
            .command_buffer_count(count);

        unsafe {
            context
                .device()
                .allocate_command_buffers(&alloc_info)
                .map_err(VulkanError::Api)
        }
    }

    fn free_command_buffers(&mut self, context: &VulkanContext) {
        unsafe {
            context
                .device()
                .free_command_buffers(context.command_pool(), &self.command_buffers);
        }
        self.command_buffers.clear();
    }

    /// The main render pass drawing into the swapchain
    pub fn render_pass(&self) -> vk::RenderPass {
        self.swapchain.render_pass()
    }

    /// Swapchain image count; sizes the per-frame descriptor ring
    pub fn frame_count(&self) -> usize {
        self.swapchain.image_count()
    }

    pub fn aspect_ratio(&self) -> f32 {
        self.swapchain.aspect_ratio()
    }

    pub fn is_frame_in_progress(&self) -> bool {
        self.frame_started
    }

    fn current_command_buffer(&self) -> vk::CommandBuffer {
        assert!(
            self.frame_started,
            "can't get command buffer when frame isn't started"
        );
        self.command_buffers[self.current_image as usize]
    }

    /// Acquire the next image and begin recording
    ///
    /// Returns `None` when the swapchain was out of date; the caller must
    /// skip this frame.
    pub fn begin_frame(
        &mut self,
        context: &VulkanContext,
        window: &mut Window,
    ) -> VulkanResult<Option<FrameContext>> {
        assert!(
            !self.frame_started,
            "can't call begin_frame while a frame is in progress"
        );

        match self.swapchain.acquire_next_image()? {
            FrameAcquire::Acquired(index) => {
                self.current_image = index;
            }
            FrameAcquire::OutOfDate => {
                self.recreate_swapchain(context, window)?;
                return Ok(None);
            }
        }

        self.frame_started = true;
        self.frame_serial += 1;

        let command_buffer = self.current_command_buffer();
        let begin_info = vk::CommandBufferBeginInfo::builder();
        unsafe {
            context
                .device()
                .begin_command_buffer(command_buffer, &begin_info)
                .map_err(VulkanError::Api)?;
        }

        Ok(Some(FrameContext {
            command_buffer,
            frame: self.frame_serial,
        }))
    }

    /// Begin the swapchain render pass and set the dynamic viewport
    pub fn begin_render_pass(&self, context: &VulkanContext, command_buffer: vk::CommandBuffer) {
        assert!(
            self.frame_started,
            "can't call begin_render_pass if frame isn't in progress"
        );
        assert_eq!(
            command_buffer,
            self.current_command_buffer(),
            "can't begin render pass on a command buffer from a different frame"
        );

        let extent = self.swapchain.extent();
        let clear_values = [
            vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 1.0],
                },
            },
            vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            },
        ];

        let render_pass_info = vk::RenderPassBeginInfo::builder()
            .render_pass(self.swapchain.render_pass())
            .framebuffer(self.swapchain.framebuffer(self.current_image))
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
            context.device().cmd_begin_render_pass(
                command_buffer,
                &render_pass_info,
                vk::SubpassContents::INLINE,
            );
            context
                .device()
                .cmd_set_viewport(command_buffer, 0, &[viewport]);
            context
                .device()
                .cmd_set_scissor(command_buffer, 0, &[scissor]);
        }
    }

    /// End the swapchain render pass
    pub fn end_render_pass(&self, context: &VulkanContext, command_buffer: vk::CommandBuffer) {
        assert!(
            self.frame_started,
            "can't call end_render_pass if frame isn't in progress"
        );
        assert_eq!(
            command_buffer,
            self.current_command_buffer(),
            "can't end render pass on a command buffer from a different frame"
        );

        unsafe {
            context.device().cmd_end_render_pass(command_buffer);
        }
    }

    /// Finish recording, submit, and present
    pub fn end_frame(
        &mut self,
        context: &VulkanContext,
        window: &mut Window,
    ) -> VulkanResult<()> {
        assert!(
            self.frame_started,
            "can't call end_frame while frame isn't in progress"
        );

        let command_buffer = self.current_command_buffer();
        unsafe {
            context
                .device()
                .end_command_buffer(command_buffer)
                .map_err(VulkanError::Api)?;
        }

        let outcome = self.swapchain.submit_and_present(
            context.graphics_queue(),
            context.present_queue(),
            command_buffer,
            self.current_image,
        )?;

        self.frame_started = false;

        if outcome == PresentOutcome::NeedsRecreate || window.was_resized() {
            window.reset_resized_flag();
            self.recreate_swapchain(context, window)?;
        }

        Ok(())
    }

    /// Rebuild the swapchain and its dependent resources
    ///
    /// Blocks while the window is minimized, then waits for the device to
    /// go idle before replacing the swapchain (chaining the old handle).
    fn recreate_swapchain(
        &mut self,
        context: &VulkanContext,
        window: &mut Window,
    ) -> VulkanResult<()> {
        let mut extent = window.extent();
        while extent.width == 0 || extent.height == 0 {
            window.wait_events();
            extent = window.extent();
        }

        context.wait_idle();

        let new_swapchain = Swapchain::new(context, extent, self.swapchain.handle())?;
        let old_image_count = self.swapchain.image_count();
        self.swapchain = new_swapchain;

        if self.swapchain.image_count() != old_image_count {
            log::debug!(
                "Swapchain image count changed ({} -> {}), reallocating command buffers",
                old_image_count,
                self.swapchain.image_count()
            );
            self.free_command_buffers(context);
            self.command_buffers =
                Self::allocate_command_buffers(context, self.swapchain.image_count() as u32)?;
        }

        log::info!(
            "Recreated swapchain at {}x{}",
            extent.width,
            extent.height
        );
        Ok(())
    }
}
